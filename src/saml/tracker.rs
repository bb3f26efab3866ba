//! Outstanding request IDs, for InResponseTo correlation.

use anyhow::{anyhow, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default ceiling on outstanding requests.
pub const MAX_PENDING_REQUESTS: usize = 10_000;

/// What an outstanding request was for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingRequest {
    Login,
    /// SP-initiated logout, with the hex token of the session being ended.
    Logout { session: Option<String> },
}

struct Entry {
    request: PendingRequest,
    issued_at: Instant,
}

#[derive(Default)]
struct Pending {
    entries: HashMap<String, Entry>,
    /// Issue order; may still name entries that were already taken.
    order: VecDeque<(String, Instant)>,
}

impl Pending {
    /// Drop the oldest issued ID. Returns whether a live entry went with it.
    fn pop_oldest(&mut self) -> Option<bool> {
        let (id, issued_at) = self.order.pop_front()?;
        let live = self
            .entries
            .get(&id)
            .is_some_and(|e| e.issued_at == issued_at);
        if live {
            self.entries.remove(&id);
        }
        Some(live)
    }
}

/// In-memory map of request ID → pending request.
///
/// Entries are one-shot: a response consumes the entry it answers. Entries
/// older than the TTL are pruned whenever a new request is recorded, and
/// once `max_pending` are outstanding the oldest is evicted to make room.
pub struct RequestTracker {
    pending: RwLock<Pending>,
    ttl: Duration,
    max_pending: usize,
}

impl RequestTracker {
    pub fn new(ttl: Duration) -> Self {
        Self::with_limit(ttl, MAX_PENDING_REQUESTS)
    }

    pub fn with_limit(ttl: Duration, max_pending: usize) -> Self {
        Self {
            pending: RwLock::new(Pending::default()),
            ttl,
            max_pending: max_pending.max(1),
        }
    }

    pub fn record(&self, id: &str, request: PendingRequest) -> Result<()> {
        let mut pending = self.pending.write().map_err(|_| anyhow!("Lock poisoned"))?;

        let mut pruned = 0;
        while pending
            .order
            .front()
            .is_some_and(|(_, issued_at)| issued_at.elapsed() >= self.ttl)
        {
            if pending.pop_oldest() == Some(true) {
                pruned += 1;
            }
        }
        if pruned > 0 {
            debug!(pruned, "Pruned stale SAML requests");
        }

        let mut evicted = 0;
        while pending.entries.len() >= self.max_pending {
            match pending.pop_oldest() {
                Some(true) => evicted += 1,
                Some(false) => {}
                None => break,
            }
        }
        if evicted > 0 {
            warn!(evicted, max_pending = self.max_pending, "Too many outstanding SAML requests, evicted oldest");
        }

        // Taken IDs linger in the queue until they age out; keep it bounded.
        if pending.order.len() > 2 * self.max_pending {
            let Pending { entries, order } = &mut *pending;
            order.retain(|(id, at)| entries.get(id).is_some_and(|e| e.issued_at == *at));
        }

        let issued_at = Instant::now();
        pending.order.push_back((id.to_string(), issued_at));
        pending
            .entries
            .insert(id.to_string(), Entry { request, issued_at });
        Ok(())
    }

    /// Consume the entry for `id`, if it exists and has not gone stale.
    pub fn take(&self, id: &str) -> Result<Option<PendingRequest>> {
        let mut pending = self.pending.write().map_err(|_| anyhow!("Lock poisoned"))?;
        Ok(pending
            .entries
            .remove(id)
            .filter(|e| e.issued_at.elapsed() < self.ttl)
            .map(|e| e.request))
    }

    /// Outstanding requests, stale ones not yet pruned included.
    pub fn len(&self) -> usize {
        self.pending.read().map(|p| p.entries.len()).unwrap_or(0)
    }
}
