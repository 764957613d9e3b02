//! All live sets, keyed by kernel-set name.

use std::{collections::HashMap, net::Ipv4Addr};

use alluvium_common::Clock;
use alluvium_dns::Resolve;
use alluvium_ipset::SetBackend;
use tracing::info;

use crate::ipset::{IpSet, SetError};

/// Point-in-time view of one set, as dumped on `SIGHUP`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetSnapshot {
    pub name: String,
    pub dirty: bool,
    pub domains: Vec<DomainSnapshot>,
}

/// One domain inside a [`SetSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainSnapshot {
    pub name: String,
    pub expires_in: i64,
    pub ips: Vec<Ipv4Addr>,
}

/// Owns every live [`IpSet`].
#[derive(Debug, Default)]
pub struct Registry {
    sets: HashMap<String, IpSet>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies an `update` request: mutates the existing set in place, or
    /// constructs a new one.
    ///
    /// # Errors
    ///
    /// Propagates domain-normalisation and backend errors. A failed
    /// construction leaves the registry without the set.
    pub async fn update(
        &mut self,
        name: &str,
        domains: &[String],
        resolver: &dyn Resolve,
        clock: &Clock,
        backend: &dyn SetBackend,
    ) -> Result<(), SetError> {
        if let Some(set) = self.sets.get_mut(name) {
            set.update(domains, resolver, clock, backend).await
        } else {
            let set = IpSet::new(name, domains, resolver, clock, backend).await?;
            self.sets.insert(name.to_string(), set);
            info!("created set {name}");
            Ok(())
        }
    }

    /// Applies a `drop` request. Returns whether the set existed.
    pub fn drop_set(&mut self, name: &str) -> bool {
        if self.sets.remove(name).is_some() {
            info!("dropped set {name}");
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&IpSet> {
        self.sets.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut IpSet> {
        self.sets.get_mut(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IpSet> {
        self.sets.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut IpSet> {
        self.sets.values_mut()
    }

    /// A deterministic (name-sorted) view of the whole registry.
    #[must_use]
    pub fn snapshot(&self, clock: &Clock) -> Vec<SetSnapshot> {
        let mut sets: Vec<SetSnapshot> = self
            .sets
            .values()
            .map(|set| SetSnapshot {
                name: set.name().to_string(),
                dirty: set.is_dirty(),
                domains: set
                    .addresses()
                    .iter()
                    .map(|address| DomainSnapshot {
                        name: address.name().to_string(),
                        expires_in: address.time_diff(clock),
                        ips: address.ips().to_vec(),
                    })
                    .collect(),
            })
            .collect();
        sets.sort_by(|a, b| a.name.cmp(&b.name));
        sets
    }
}

#[cfg(test)]
mod tests {
    use alluvium_dns::{ARecord, MockResolver};
    use alluvium_ipset::MockBackend;

    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn domains(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn update_creates_then_mutates_in_place() {
        let resolver = MockResolver::new();
        resolver.answer("a.example", vec![ARecord::new(ip("1.1.1.1"), 300)]);
        resolver.answer("b.example", vec![ARecord::new(ip("2.2.2.2"), 300)]);
        let backend = MockBackend::new();
        let clock = Clock::new();
        let mut registry = Registry::new();

        registry
            .update("A", &domains(&["a.example"]), &resolver, &clock, &backend)
            .await
            .unwrap();
        assert_eq!(registry.len(), 1);

        registry
            .update("A", &domains(&["b.example"]), &resolver, &clock, &backend)
            .await
            .unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(backend.live("A"), Some(vec![ip("2.2.2.2")]));
    }

    #[tokio::test]
    async fn update_then_drop_leaves_no_entry() {
        let resolver = MockResolver::new();
        resolver.answer("a.example", vec![ARecord::new(ip("1.1.1.1"), 300)]);
        let backend = MockBackend::new();
        let clock = Clock::new();
        let mut registry = Registry::new();

        registry
            .update("A", &domains(&["a.example"]), &resolver, &clock, &backend)
            .await
            .unwrap();
        assert!(registry.drop_set("A"));

        assert!(registry.is_empty());
        assert!(registry.get("A").is_none());
    }

    #[tokio::test]
    async fn dropping_an_unknown_set_reports_absence() {
        let mut registry = Registry::new();
        assert!(!registry.drop_set("missing"));
    }

    #[tokio::test]
    async fn failed_construction_leaves_the_registry_unchanged() {
        let resolver = MockResolver::new();
        let backend = MockBackend::new();
        let clock = Clock::new();
        let mut registry = Registry::new();

        // the empty string cannot be normalised
        let result = registry
            .update("A", &domains(&[""]), &resolver, &clock, &backend)
            .await;

        assert!(result.is_err());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn snapshot_mirrors_the_registry() {
        let resolver = MockResolver::new();
        resolver.answer("a.example", vec![ARecord::new(ip("1.1.1.1"), 300)]);
        resolver.answer("b.example", vec![ARecord::new(ip("2.2.2.2"), 300)]);
        let backend = MockBackend::new();
        let clock = Clock::new();
        let mut registry = Registry::new();

        registry
            .update("B", &domains(&["b.example"]), &resolver, &clock, &backend)
            .await
            .unwrap();
        registry
            .update("A", &domains(&["a.example"]), &resolver, &clock, &backend)
            .await
            .unwrap();

        let snapshot = registry.snapshot(&clock);

        let triples: Vec<(String, String, Vec<Ipv4Addr>)> = snapshot
            .iter()
            .flat_map(|set| {
                set.domains
                    .iter()
                    .map(|domain| (set.name.clone(), domain.name.clone(), domain.ips.clone()))
            })
            .collect();

        assert_eq!(
            triples,
            vec![
                ("A".to_string(), "a.example".to_string(), vec![ip("1.1.1.1")]),
                ("B".to_string(), "b.example".to_string(), vec![ip("2.2.2.2")]),
            ]
        );
        assert!(snapshot.iter().all(|set| !set.dirty));
    }
}
