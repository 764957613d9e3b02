pub mod harness;

pub use harness::DaemonHarness;
