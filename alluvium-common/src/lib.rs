pub mod clock;
pub mod logging;

pub use clock::Clock;
pub use tracing;

/// Lifecycle signal broadcast to every running component.
#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Shutdown,
}
