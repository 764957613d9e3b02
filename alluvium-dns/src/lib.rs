//! A-record resolution.
//!
//! The daemon resolves through the [`Resolve`] seam so the core engine can be
//! driven by a scripted resolver in tests. The production implementation is a
//! stub resolver on top of hickory, querying the system's configured
//! nameservers with a hard per-query deadline.

use std::{
    collections::{HashMap, VecDeque},
    net::Ipv4Addr,
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use hickory_resolver::{
    TokioAsyncResolver,
    config::{ResolverConfig, ResolverOpts},
    error::{ResolveError, ResolveErrorKind},
    proto::rr::RData,
};
use thiserror::Error;
use tracing::debug;

/// Hard deadline on a single A query. Exceeding it is a transport failure,
/// never fatal.
pub const RESOLVE_DEADLINE: Duration = Duration::from_secs(2);

/// Errors that can occur during A-record resolution.
#[derive(Debug, Error)]
pub enum DnsError {
    /// The resolver could not be built from the system configuration.
    #[error("failed to initialise the resolver: {0}")]
    Init(#[source] ResolveError),

    /// The query failed at the transport or protocol level.
    #[error("DNS lookup failed: {0}")]
    LookupFailed(#[from] ResolveError),

    /// The query exceeded [`RESOLVE_DEADLINE`].
    #[error("DNS query timed out for domain: {0}")]
    Timeout(String),
}

/// One A record from the answer section of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ARecord {
    pub addr: Ipv4Addr,
    pub ttl: u32,
}

impl ARecord {
    #[must_use]
    pub const fn new(addr: Ipv4Addr, ttl: u32) -> Self {
        Self { addr, ttl }
    }
}

/// A-record resolution with a hard deadline.
///
/// `Ok` with an empty list is a NODATA answer and is distinct from `Err`:
/// callers drop their cache on the former and keep it on the latter.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve_a(&self, domain: &str) -> Result<Vec<ARecord>, DnsError>;
}

/// Stub resolver querying the nameservers from `/etc/resolv.conf`.
#[derive(Debug)]
pub struct StubResolver {
    resolver: TokioAsyncResolver,
}

impl StubResolver {
    /// Builds a resolver from the system configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the system resolver configuration cannot be read;
    /// the daemon treats this as fatal at startup.
    pub fn from_system_conf() -> Result<Self, DnsError> {
        let (config, opts) = hickory_resolver::system_conf::read_system_conf().map_err(DnsError::Init)?;
        Ok(Self::with_config(config, opts))
    }

    /// Builds a resolver against an explicit nameserver configuration.
    #[must_use]
    pub fn with_config(config: ResolverConfig, mut opts: ResolverOpts) -> Self {
        opts.timeout = RESOLVE_DEADLINE;
        opts.attempts = 1;

        Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
        }
    }
}

#[async_trait]
impl Resolve for StubResolver {
    async fn resolve_a(&self, domain: &str) -> Result<Vec<ARecord>, DnsError> {
        debug!("resolving {domain}");

        let lookup = match tokio::time::timeout(RESOLVE_DEADLINE, self.resolver.ipv4_lookup(domain)).await {
            Err(_) => return Err(DnsError::Timeout(domain.to_string())),
            Ok(Err(err)) => {
                // NODATA and NXDOMAIN both surface as NoRecordsFound; either
                // way the answer section is authoritatively empty.
                return if matches!(err.kind(), ResolveErrorKind::NoRecordsFound { .. }) {
                    Ok(Vec::new())
                } else {
                    Err(DnsError::LookupFailed(err))
                };
            }
            Ok(Ok(lookup)) => lookup,
        };

        let records = lookup
            .as_lookup()
            .record_iter()
            .filter_map(|record| {
                record.data().and_then(|data| match data {
                    RData::A(a) => Some(ARecord::new(a.0, record.ttl())),
                    _ => None,
                })
            })
            .collect();

        Ok(records)
    }
}

/// Scripted resolver for tests.
///
/// Outcomes are queued per domain and consumed in order; once a domain's
/// queue runs dry the most recently served outcome repeats, so a single
/// `answer` call means "always resolves to this".
#[derive(Debug, Default)]
pub struct MockResolver {
    scripts: Mutex<HashMap<String, Script>>,
}

#[derive(Debug, Default)]
struct Script {
    queue: VecDeque<MockOutcome>,
    last: Option<MockOutcome>,
}

type MockOutcome = Result<Vec<ARecord>, MockFailure>;

#[derive(Debug, Clone, Copy)]
enum MockFailure {
    Transport,
    Timeout,
}

impl MockResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a successful answer; an empty record list is a NODATA answer.
    pub fn answer(&self, domain: &str, records: Vec<ARecord>) {
        self.push(domain, Ok(records));
    }

    /// Queues a transport-level failure.
    pub fn fail(&self, domain: &str) {
        self.push(domain, Err(MockFailure::Transport));
    }

    /// Queues a deadline expiry.
    pub fn time_out(&self, domain: &str) {
        self.push(domain, Err(MockFailure::Timeout));
    }

    fn push(&self, domain: &str, outcome: MockOutcome) {
        self.scripts
            .lock()
            .expect("mock resolver lock poisoned")
            .entry(domain.to_string())
            .or_default()
            .queue
            .push_back(outcome);
    }
}

#[async_trait]
impl Resolve for MockResolver {
    async fn resolve_a(&self, domain: &str) -> Result<Vec<ARecord>, DnsError> {
        let outcome = {
            let mut scripts = self.scripts.lock().expect("mock resolver lock poisoned");
            scripts.get_mut(domain).and_then(|script| {
                if let Some(outcome) = script.queue.pop_front() {
                    script.last = Some(outcome.clone());
                    Some(outcome)
                } else {
                    script.last.clone()
                }
            })
        };

        match outcome {
            Some(Ok(records)) => Ok(records),
            Some(Err(MockFailure::Transport)) => Err(DnsError::LookupFailed(ResolveError::from(
                format!("scripted failure for {domain}"),
            ))),
            Some(Err(MockFailure::Timeout)) => Err(DnsError::Timeout(domain.to_string())),
            None => Err(DnsError::LookupFailed(ResolveError::from(format!(
                "no scripted answer for {domain}"
            )))),
        }
    }
}
