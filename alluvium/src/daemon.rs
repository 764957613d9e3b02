//! Single-threaded event core.
//!
//! One `select!` multiplexes the signal streams, the renewal timer and the
//! control socket. DNS queries, backend invocations and client I/O all run
//! inline on this task, so every mutation of the registry is serialised and
//! each set has at most one atomic swap in flight.

use std::{
    io,
    os::unix::fs::PermissionsExt,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use alluvium_common::{Clock, Signal};
use alluvium_control::protocol::{Command, ParseError, Request, RequestParser, reply};
use alluvium_dns::Resolve;
use alluvium_ipset::SetBackend;
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{UnixListener, UnixStream},
    signal::unix::{SignalKind, signal},
    sync::broadcast,
};
use tracing::{debug, error, info, warn};

use crate::{expiry::ExpiryQueue, registry::Registry};

/// Errors that end the daemon. Everything else is absorbed and logged.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// The control socket could not be set up.
    #[error("failed to bind control socket {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A signal stream could not be installed.
    #[error("failed to install the {signal} handler: {source}")]
    Signals {
        signal: &'static str,
        #[source]
        source: io::Error,
    },
}

/// The daemon: registry, scheduler, and the event loop driving both.
pub struct Daemon {
    ctl_path: PathBuf,
    clock: Clock,
    resolver: Arc<dyn Resolve>,
    backend: Arc<dyn SetBackend>,
    registry: Registry,
    queue: ExpiryQueue,
}

impl Daemon {
    #[must_use]
    pub fn new(
        ctl_path: impl Into<PathBuf>,
        resolver: Arc<dyn Resolve>,
        backend: Arc<dyn SetBackend>,
    ) -> Self {
        Self {
            ctl_path: ctl_path.into(),
            clock: Clock::new(),
            resolver,
            backend,
            registry: Registry::new(),
            queue: ExpiryQueue::new(),
        }
    }

    /// Runs the event loop until `SIGTERM`/`SIGINT` arrives or `shutdown`
    /// fires. The caller must keep the sending side of `shutdown` alive.
    ///
    /// # Errors
    ///
    /// Binding the control socket and installing the signal handlers are the
    /// only fallible steps; both are startup errors.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<Signal>) -> Result<(), DaemonError> {
        let listener = self.bind()?;

        let mut term = Self::stream(SignalKind::terminate(), "SIGTERM")?;
        let mut int = Self::stream(SignalKind::interrupt(), "SIGINT")?;
        let mut hup = Self::stream(SignalKind::hangup(), "SIGHUP")?;
        let mut usr1 = Self::stream(SignalKind::user_defined1(), "SIGUSR1")?;
        let mut usr2 = Self::stream(SignalKind::user_defined2(), "SIGUSR2")?;
        let mut pipe = Self::stream(SignalKind::pipe(), "SIGPIPE")?;

        info!("listening on {}", self.ctl_path.display());

        // at most one client is serviced at a time
        let mut client: Option<ClientConn> = None;

        loop {
            let wakeup = self
                .queue
                .next_wakeup(&self.clock)
                .map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));

            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    info!("shutdown requested");
                    break;
                }
                _ = term.recv() => {
                    info!("SIGTERM received, exiting");
                    break;
                }
                _ = int.recv() => {
                    info!("SIGINT received, exiting");
                    break;
                }
                _ = hup.recv() => {
                    self.dump_state();
                    self.queue.rebuild(&self.registry);
                }
                _ = usr1.recv() => {
                    info!("SIGUSR1: forcing a reload of every set");
                    self.reload_all().await;
                }
                _ = usr2.recv() => {
                    info!("SIGUSR2: forcing renewal of every address");
                    self.renew_all().await;
                    self.reload_all().await;
                    self.queue.rebuild(&self.registry);
                }
                _ = pipe.recv() => {}
                () = sleep_until_or_forever(wakeup) => {
                    self.queue
                        .tick(
                            &mut self.registry,
                            self.resolver.as_ref(),
                            &self.clock,
                            self.backend.as_ref(),
                        )
                        .await;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            if client.is_some() {
                                // backpressure by refusal, not buffering
                                debug!("dropping extra control connection");
                                drop(stream);
                            } else {
                                client = Some(ClientConn::new(stream));
                            }
                        }
                        Err(err) => error!("accepting control connection: {err}"),
                    }
                }
                event = async {
                    match client.as_mut() {
                        Some(conn) => conn.read_step().await,
                        None => std::future::pending().await,
                    }
                }, if client.is_some() => {
                    match event {
                        ReadEvent::Incomplete => {}
                        ReadEvent::Parsed(request) => {
                            let reply = self.apply(request).await;
                            finish_client(client.take(), &reply).await;
                            self.queue.rebuild(&self.registry);
                        }
                        ReadEvent::Malformed(err) => {
                            finish_client(client.take(), &reply::rejected(err)).await;
                        }
                        ReadEvent::Failed(err) => {
                            warn!("control client I/O: {err}");
                            client = None;
                        }
                    }
                }
            }
        }

        let _ = std::fs::remove_file(&self.ctl_path);
        info!("shut down");
        Ok(())
    }

    fn bind(&self) -> Result<UnixListener, DaemonError> {
        // a previous run may have left the socket file behind
        match std::fs::remove_file(&self.ctl_path) {
            Ok(()) => debug!("removed stale socket {}", self.ctl_path.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!("removing stale socket {}: {err}", self.ctl_path.display()),
        }

        let listener = UnixListener::bind(&self.ctl_path).map_err(|source| DaemonError::Bind {
            path: self.ctl_path.clone(),
            source,
        })?;

        // access control is file permissions, nothing else
        std::fs::set_permissions(&self.ctl_path, std::fs::Permissions::from_mode(0o600)).map_err(
            |source| DaemonError::Bind {
                path: self.ctl_path.clone(),
                source,
            },
        )?;

        Ok(listener)
    }

    fn stream(
        kind: SignalKind,
        name: &'static str,
    ) -> Result<tokio::signal::unix::Signal, DaemonError> {
        signal(kind).map_err(|source| DaemonError::Signals {
            signal: name,
            source,
        })
    }

    /// Applies a parsed request to the registry and renders the reply.
    async fn apply(&mut self, request: Request) -> String {
        match request.command {
            Command::Drop => {
                if self.registry.drop_set(&request.set) {
                    reply::OK.to_string()
                } else {
                    reply::not_found(&request.set)
                }
            }
            Command::Update => {
                let applied = self
                    .registry
                    .update(
                        &request.set,
                        &request.domains,
                        self.resolver.as_ref(),
                        &self.clock,
                        self.backend.as_ref(),
                    )
                    .await;

                match applied {
                    Ok(()) => {
                        info!(
                            "updated set {} ({} domains)",
                            request.set,
                            request.domains.len()
                        );
                        reply::OK.to_string()
                    }
                    Err(err) => reply::error(&err),
                }
            }
        }
    }

    /// `SIGUSR1`: reload every set, dirty or not.
    async fn reload_all(&mut self) {
        for set in self.registry.iter_mut() {
            // failures keep the set dirty; the next tick retries
            let _ = set.reload(self.backend.as_ref()).await;
        }
    }

    /// The renewal half of `SIGUSR2`.
    async fn renew_all(&mut self) {
        for set in self.registry.iter_mut() {
            let mut changed = false;
            for address in set.addresses_mut() {
                changed |= address.renew(self.resolver.as_ref(), &self.clock).await;
            }
            if changed {
                set.flag_updated();
            }
        }
    }

    /// `SIGHUP`: human-readable snapshot of every set to the log.
    fn dump_state(&self) {
        let snapshot = self.registry.snapshot(&self.clock);
        info!("state dump: {} sets", snapshot.len());
        for set in snapshot {
            info!("set {} (dirty: {})", set.name, set.dirty);
            for domain in set.domains {
                info!(
                    "  {} expires in {}s, resolves to {:?}",
                    domain.name, domain.expires_in, domain.ips
                );
            }
        }
    }
}

/// The current control connection and its parser state.
struct ClientConn {
    stream: UnixStream,
    parser: RequestParser,
}

enum ReadEvent {
    /// A complete request arrived.
    Parsed(Request),
    /// The parser rejected the input.
    Malformed(ParseError),
    /// More input is needed.
    Incomplete,
    /// The connection died without completing a request.
    Failed(io::Error),
}

impl ClientConn {
    fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            parser: RequestParser::new(),
        }
    }

    async fn read_step(&mut self) -> ReadEvent {
        let mut buf = [0u8; 4096];
        match self.stream.read(&mut buf).await {
            Ok(0) => match self.parser.finish() {
                Ok(request) => ReadEvent::Parsed(request),
                Err(err) => ReadEvent::Malformed(err),
            },
            Ok(n) => match self.parser.feed(&buf[..n]) {
                Ok(Some(request)) => ReadEvent::Parsed(request),
                Ok(None) => ReadEvent::Incomplete,
                Err(err) => ReadEvent::Malformed(err),
            },
            Err(err) => ReadEvent::Failed(err),
        }
    }
}

/// Writes the reply and closes the connection. Best-effort: the client may
/// already be gone.
async fn finish_client(conn: Option<ClientConn>, reply: &str) {
    if let Some(mut conn) = conn {
        let _ = conn.stream.write_all(reply.as_bytes()).await;
        let _ = conn.stream.shutdown().await;
    }
}

async fn sleep_until_or_forever(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
