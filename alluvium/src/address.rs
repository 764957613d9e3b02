//! One domain bound to its cached resolutions and renewal deadline.

use std::net::Ipv4Addr;

use alluvium_common::Clock;
use alluvium_dns::Resolve;
use thiserror::Error;
use tracing::{debug, warn};

/// TTLs beyond three days are probably wrong and are clamped.
const MAX_TTL_SECS: u64 = 3 * 86_400;

/// Retry delay after a transport-level resolution failure.
const FAILURE_RETRY_SECS: u64 = 60;

/// Retry delay after a successful answer carrying no A records.
const EMPTY_RETRY_SECS: u64 = 4 * 3_600;

/// Errors raised while building an [`Address`].
#[derive(Debug, Error)]
pub enum AddressError {
    /// The domain has no ASCII (punycode) form.
    #[error("cannot normalise domain {0:?}")]
    BadDomain(String),
}

/// The DNS state of one domain: its cached A records and the deadline at
/// which they must be re-resolved.
#[derive(Debug)]
pub struct Address {
    name: String,
    ips: Vec<Ipv4Addr>,
    expires_at: u64,
}

impl Address {
    /// Normalises `domain` to ASCII and performs the initial resolution.
    ///
    /// # Errors
    ///
    /// Returns an error if the domain cannot be normalised; the caller is
    /// expected to reject the whole update. Resolution failures are not
    /// errors, they only shorten the renewal deadline.
    pub async fn new(
        domain: &str,
        resolver: &dyn Resolve,
        clock: &Clock,
    ) -> Result<Self, AddressError> {
        let name = idna::domain_to_ascii(domain)
            .map_err(|_| AddressError::BadDomain(domain.to_string()))?;
        if name.is_empty() {
            return Err(AddressError::BadDomain(domain.to_string()));
        }

        let mut address = Self {
            name,
            ips: Vec::new(),
            expires_at: 0,
        };
        address.renew(resolver, clock).await;
        Ok(address)
    }

    /// Issues one A query and applies the outcome.
    ///
    /// Returns whether the cached IP list changed, so the owning set can
    /// flag itself for a reload. Never fails: transport errors keep the
    /// cache and retry in [`FAILURE_RETRY_SECS`], an empty answer clears the
    /// cache and retries in [`EMPTY_RETRY_SECS`].
    pub async fn renew(&mut self, resolver: &dyn Resolve, clock: &Clock) -> bool {
        let now = clock.now_secs();

        match resolver.resolve_a(&self.name).await {
            Err(err) => {
                warn!("resolving {}: {err}", self.name);
                self.expires_at = now + FAILURE_RETRY_SECS;
                false
            }
            Ok(records) if records.is_empty() => {
                debug!("{} has no A records", self.name);
                self.expires_at = now + EMPTY_RETRY_SECS;
                if self.ips.is_empty() {
                    false
                } else {
                    self.ips.clear();
                    true
                }
            }
            Ok(records) => {
                let ttl = records
                    .iter()
                    .map(|record| u64::from(record.ttl))
                    .min()
                    .unwrap_or(0);
                self.expires_at = now + ttl.min(MAX_TTL_SECS);

                let mut ips: Vec<Ipv4Addr> = records.iter().map(|record| record.addr).collect();
                ips.sort_unstable_by_key(|ip| u32::from(*ip));
                ips.dedup();

                if ips == self.ips {
                    false
                } else {
                    debug!("{} now resolves to {ips:?}", self.name);
                    self.ips = ips;
                    true
                }
            }
        }
    }

    /// The normalised domain name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The cached A records, sorted ascending by numeric value.
    #[must_use]
    pub fn ips(&self) -> &[Ipv4Addr] {
        &self.ips
    }

    /// The renewal deadline, in clock seconds.
    #[must_use]
    pub const fn expires_at(&self) -> u64 {
        self.expires_at
    }

    /// Signed seconds until the renewal deadline.
    #[must_use]
    pub fn time_diff(&self, clock: &Clock) -> i64 {
        let now = clock.now_secs();
        if self.expires_at >= now {
            (self.expires_at - now) as i64
        } else {
            -((now - self.expires_at) as i64)
        }
    }

    /// Whether the renewal deadline has passed.
    #[must_use]
    pub fn is_expired(&self, clock: &Clock) -> bool {
        self.time_diff(clock) <= 0
    }

    /// Scheduling comparator: true iff `a` expires later than `b`.
    #[must_use]
    pub const fn expires_after(a: &Self, b: &Self) -> bool {
        a.expires_at > b.expires_at
    }

    #[cfg(test)]
    pub(crate) fn force_expire(&mut self) {
        self.expires_at = 0;
    }
}
