//! Expired session sweeper.
//!
//! Lookups already hide expired sessions; the sweep reclaims their rows and
//! the replay records of assertions that can no longer be presented.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::store::SessionStore;

pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 300;

/// One pass over the store. Returns how many sessions were dropped.
pub fn sweep(store: &SessionStore) -> usize {
    match store.evict_expired() {
        Ok(0) => {
            debug!("No expired sessions");
            0
        }
        Ok(evicted) => {
            let remaining = store.session_count().unwrap_or_default();
            info!(evicted, remaining, "Expired sessions evicted");
            evicted
        }
        Err(e) => {
            warn!(error = %e, "Session sweep failed");
            0
        }
    }
}

/// Run [`sweep`] every `every_secs` seconds until the handle is aborted.
pub fn spawn_cleanup_task(store: Arc<SessionStore>, every_secs: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(every_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately; nothing has expired yet at startup.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            sweep(&store);
        }
    })
}
