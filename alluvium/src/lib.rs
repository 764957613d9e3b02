//! Resolution and synchronisation engine of the alluvium daemon.
//!
//! Operators declare named kernel sets, each populated by a list of domains.
//! The engine re-resolves those domains as their DNS TTLs run out and
//! atomically replaces a kernel set whenever the union of its resolved
//! addresses changes.

pub mod address;
pub mod daemon;
pub mod expiry;
pub mod ipset;
pub mod registry;

pub use daemon::{Daemon, DaemonError};
