//! A named kernel set and the group of domains populating it.

use std::net::Ipv4Addr;

use alluvium_common::Clock;
use alluvium_dns::Resolve;
use alluvium_ipset::{BackendError, SetBackend};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::address::{Address, AddressError};

/// Errors surfaced to a control client by a synchronous `update`.
#[derive(Debug, Error)]
pub enum SetError {
    #[error(transparent)]
    Address(#[from] AddressError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Binds a kernel-set name to a group of [`Address`]es and tracks whether
/// the kernel's view is stale.
#[derive(Debug)]
pub struct IpSet {
    name: String,
    addresses: Vec<Address>,
    dirty: bool,
}

impl IpSet {
    /// Builds the set, resolving every domain and committing the initial
    /// contents to the kernel.
    ///
    /// # Errors
    ///
    /// Returns an error if a domain cannot be normalised or the backend
    /// rejects the initial reload; nothing is committed in either case.
    pub async fn new(
        name: &str,
        domains: &[String],
        resolver: &dyn Resolve,
        clock: &Clock,
        backend: &dyn SetBackend,
    ) -> Result<Self, SetError> {
        let mut set = Self {
            name: name.to_string(),
            addresses: Vec::new(),
            dirty: false,
        };
        set.update(domains, resolver, clock, backend).await?;
        Ok(set)
    }

    /// Replaces the domain list. All addresses are rebuilt in input order
    /// (duplicates preserved) and the kernel set is reloaded
    /// unconditionally.
    ///
    /// # Errors
    ///
    /// A domain that cannot be normalised aborts before anything is
    /// replaced. A backend failure leaves the new addresses in place with
    /// the set dirty; the next tick retries.
    pub async fn update(
        &mut self,
        domains: &[String],
        resolver: &dyn Resolve,
        clock: &Clock,
        backend: &dyn SetBackend,
    ) -> Result<(), SetError> {
        let mut addresses = Vec::with_capacity(domains.len());
        for domain in domains {
            addresses.push(Address::new(domain, resolver, clock).await?);
        }

        self.addresses = addresses;
        self.flag_updated();
        self.reload(backend).await?;
        Ok(())
    }

    /// Atomically replaces the kernel set with the union of every cached
    /// address. Clears the dirty flag only on success.
    ///
    /// # Errors
    ///
    /// Returns the backend error; the set stays dirty.
    pub async fn reload(&mut self, backend: &dyn SetBackend) -> Result<(), BackendError> {
        let ips = self.union();
        debug!("reloading set {} ({} addresses)", self.name, ips.len());

        match backend.replace(&self.name, &ips).await {
            Ok(()) => {
                self.dirty = false;
                info!("set {} reloaded", self.name);
                Ok(())
            }
            Err(err) => {
                self.dirty = true;
                error!("reloading set {}: {err}", self.name);
                Err(err)
            }
        }
    }

    /// Reloads only if a renewal changed some address since the last
    /// successful reload.
    ///
    /// # Errors
    ///
    /// Returns the backend error; the set stays dirty.
    pub async fn reload_if_needed(&mut self, backend: &dyn SetBackend) -> Result<(), BackendError> {
        if self.dirty {
            self.reload(backend).await
        } else {
            Ok(())
        }
    }

    /// Marks the kernel's view as stale. Does not trigger a reload.
    pub fn flag_updated(&mut self) {
        self.dirty = true;
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    #[must_use]
    pub fn addresses(&self) -> &[Address] {
        &self.addresses
    }

    pub fn addresses_mut(&mut self) -> &mut [Address] {
        &mut self.addresses
    }

    /// The deduplicated union of every address's cached IPs, ascending.
    #[must_use]
    pub fn union(&self) -> Vec<Ipv4Addr> {
        let mut ips: Vec<Ipv4Addr> = self
            .addresses
            .iter()
            .flat_map(|address| address.ips().iter().copied())
            .collect();
        ips.sort_unstable_by_key(|ip| u32::from(*ip));
        ips.dedup();
        ips
    }
}
