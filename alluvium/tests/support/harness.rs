//! End-to-end test harness for the alluvium daemon.
//!
//! Starts a complete daemon on a socket in a temporary directory, wired to a
//! scripted resolver and a recording backend, all in the same process.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use alluvium::{Daemon, DaemonError};
use alluvium_common::Signal;
use alluvium_dns::MockResolver;
use alluvium_ipset::MockBackend;
use tempfile::TempDir;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
    sync::broadcast,
    task::JoinHandle,
    time::timeout,
};

pub struct DaemonHarness {
    ctl_path: PathBuf,
    pub resolver: Arc<MockResolver>,
    pub backend: Arc<MockBackend>,
    shutdown_tx: broadcast::Sender<Signal>,
    handle: JoinHandle<Result<(), DaemonError>>,
    _dir: TempDir,
}

impl DaemonHarness {
    /// Starts a daemon and waits for its control socket to appear.
    ///
    /// # Panics
    ///
    /// Panics if the daemon fails to come up within a second.
    pub async fn start() -> Self {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let ctl_path = dir.path().join("alluvium_ctl");

        let resolver = Arc::new(MockResolver::new());
        let backend = Arc::new(MockBackend::new());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(8);

        let daemon = Daemon::new(&ctl_path, resolver.clone(), backend.clone());
        let handle = tokio::spawn(daemon.run(shutdown_rx));

        for _ in 0..100 {
            if ctl_path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(ctl_path.exists(), "daemon did not bind its control socket");

        Self {
            ctl_path,
            resolver,
            backend,
            shutdown_tx,
            handle,
            _dir: dir,
        }
    }

    #[must_use]
    #[allow(dead_code)] // not every test binary inspects the socket path
    pub fn ctl_path(&self) -> &Path {
        &self.ctl_path
    }

    /// Opens a raw connection to the control socket.
    ///
    /// # Panics
    ///
    /// Panics if the connection fails.
    #[allow(dead_code)] // used by the tests that drive partial writes
    pub async fn connect(&self) -> UnixStream {
        UnixStream::connect(&self.ctl_path)
            .await
            .expect("failed to connect to control socket")
    }

    /// Sends one raw request and reads the reply until the daemon closes the
    /// connection.
    ///
    /// # Panics
    ///
    /// Panics on I/O failure.
    pub async fn send(&self, request: &str) -> String {
        let mut stream = self.connect().await;
        stream
            .write_all(request.as_bytes())
            .await
            .expect("failed to write request");

        let mut reply = String::new();
        stream
            .read_to_string(&mut reply)
            .await
            .expect("failed to read reply");
        reply
    }

    /// Polls `predicate` until it holds or the timeout expires.
    ///
    /// # Panics
    ///
    /// Panics if the timeout expires first.
    #[allow(dead_code)] // used by the signal-driven tests
    pub async fn wait_until(&self, what: &str, mut predicate: impl FnMut() -> bool) {
        let start = tokio::time::Instant::now();
        while !predicate() {
            assert!(
                start.elapsed() < Duration::from_secs(5),
                "timed out waiting for {what}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Stops the daemon and waits for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(Signal::Shutdown);
        let _ = timeout(Duration::from_secs(5), self.handle).await;
    }
}
