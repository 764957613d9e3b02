//! Client side of the control socket, used by `alluviumctl`.

use std::{path::PathBuf, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
};
use tracing::debug;

use crate::{
    ControlError, Result,
    protocol::{Command, Request},
};

/// Default path of the daemon's control socket.
pub const DEFAULT_CTL_PATH: &str = "/var/run/alluvium_ctl";

/// Client for a running daemon's control socket.
///
/// One request per connection: the request is written, the socket is shut
/// down for writing, and the daemon's reply is read until EOF.
pub struct ControlClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl ControlClient {
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: Duration::from_secs(10),
        }
    }

    /// Overrides the whole-exchange timeout (default 10 s).
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replaces the domain list of `set`, creating the set if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails or times out.
    pub async fn update(&self, set: &str, domains: Vec<String>) -> Result<String> {
        self.roundtrip(&Request {
            command: Command::Update,
            set: set.to_string(),
            domains,
        })
        .await
    }

    /// Removes `set`.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails or times out.
    pub async fn drop_set(&self, set: &str) -> Result<String> {
        self.roundtrip(&Request {
            command: Command::Drop,
            set: set.to_string(),
            domains: Vec::new(),
        })
        .await
    }

    async fn roundtrip(&self, request: &Request) -> Result<String> {
        tokio::time::timeout(self.timeout, self.exchange(request))
            .await
            .map_err(|_| ControlError::Timeout)?
    }

    async fn exchange(&self, request: &Request) -> Result<String> {
        debug!("connecting to {}", self.socket_path.display());
        let mut stream = UnixStream::connect(&self.socket_path).await?;

        stream.write_all(request.to_wire().as_bytes()).await?;

        let mut reply = String::new();
        stream.read_to_string(&mut reply).await?;

        if reply.is_empty() {
            return Err(ControlError::ConnectionClosed);
        }
        Ok(reply)
    }
}
