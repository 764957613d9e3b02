//! TTL-ordered scheduler of which address to re-resolve next.

use std::{cmp::Ordering, collections::BinaryHeap};

use alluvium_common::Clock;
use alluvium_dns::Resolve;
use alluvium_ipset::SetBackend;
use tracing::debug;

use crate::registry::Registry;

/// Wakeups are rounded up to multiples of 32 seconds so near-simultaneous
/// expiries land in the same tick.
const WAKEUP_GRANULARITY_BITS: u32 = 5;

/// Scheduler entry. Holds no references into the registry, only the set name
/// and the address's position; the queue is rebuilt after every registry
/// mutation, so stale coordinates never outlive a tick.
#[derive(Debug, Clone)]
struct Entry {
    expires_at: u64,
    set: String,
    index: usize,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.expires_at == other.expires_at
    }
}

impl Eq for Entry {}

// `BinaryHeap` is a max-heap; reversing the deadline order surfaces the
// soonest-to-expire address at the root.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.expires_at.cmp(&self.expires_at)
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of every live address, keyed by renewal deadline.
#[derive(Debug, Default)]
pub struct ExpiryQueue {
    heap: BinaryHeap<Entry>,
}

impl ExpiryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Rebuilds the heap from every address owned by every set. Must be
    /// called after any mutation of the registry.
    pub fn rebuild(&mut self, registry: &Registry) {
        self.heap.clear();
        for set in registry.iter() {
            for (index, address) in set.addresses().iter().enumerate() {
                self.heap.push(Entry {
                    expires_at: address.expires_at(),
                    set: set.name().to_string(),
                    index,
                });
            }
        }
        debug!("expiry queue rebuilt, {} addresses", self.heap.len());
    }

    /// Seconds until the next wakeup, rounded up to the 32-second grid.
    /// `None` when there is nothing to schedule.
    #[must_use]
    pub fn next_wakeup(&self, clock: &Clock) -> Option<u64> {
        self.heap
            .peek()
            .map(|entry| Self::round_up(entry.expires_at.saturating_sub(clock.now_secs())))
    }

    const fn round_up(diff: u64) -> u64 {
        ((diff >> WAKEUP_GRANULARITY_BITS) + 1) << WAKEUP_GRANULARITY_BITS
    }

    /// One scheduler tick: renew every expired address, then reload each
    /// dirtied set at most once.
    pub async fn tick(
        &mut self,
        registry: &mut Registry,
        resolver: &dyn Resolve,
        clock: &Clock,
        backend: &dyn SetBackend,
    ) {
        let now = clock.now_secs();

        let mut due = Vec::new();
        while self.heap.peek().is_some_and(|entry| entry.expires_at <= now) {
            if let Some(entry) = self.heap.pop() {
                due.push(entry);
            }
        }

        for mut entry in due {
            let renewed = match registry.get_mut(&entry.set) {
                Some(set) => match set.addresses_mut().get_mut(entry.index) {
                    Some(address) => {
                        let changed = address.renew(resolver, clock).await;
                        let expires_at = address.expires_at();
                        if changed {
                            set.flag_updated();
                        }
                        Some(expires_at)
                    }
                    None => None,
                },
                None => None,
            };

            // entries whose set or address vanished are simply discarded
            if let Some(expires_at) = renewed {
                entry.expires_at = expires_at;
                self.heap.push(entry);
            }
        }

        for set in registry.iter_mut() {
            // a failure keeps the set dirty; the next tick retries
            let _ = set.reload_if_needed(backend).await;
        }
    }
}
