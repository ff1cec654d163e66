// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executor-side request deduplication and idempotent response cache.
//!
//! Keyed by `(invoker client id, correlation id)`. While a handler
//! invocation for a key is in flight, no second invocation for the same
//! key can start. For idempotent commands, the published response is kept
//! for the command's cache TTL and replayed byte-identically to retried
//! requests. Cached entries are evicted in absolute expiry order by a
//! timer that recomputes its deadline whenever an earlier-expiring entry
//! appears.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::session::OutgoingPublish;

/// Identity of one request attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct DedupKey {
    pub(crate) invoker_id: String,
    pub(crate) correlation: Uuid,
}

enum EntryState {
    /// A handler invocation for this key is running.
    InFlight,
    /// The response has been published and is replayable until `expires_at`.
    Cached {
        response: OutgoingPublish,
        expires_at: Instant,
    },
}

/// Outcome of registering a request attempt.
pub(crate) enum BeginOutcome {
    /// New key: the caller now owns the in-flight marker and must call
    /// [`ResponseCache::complete`] exactly once.
    Started,
    /// A handler invocation for this key is currently running.
    InFlight,
    /// A cached response exists; republish it instead of running the
    /// handler.
    Cached(OutgoingPublish),
}

/// Dedup and response cache for one executor.
pub(crate) struct ResponseCache {
    entries: Mutex<HashMap<DedupKey, EntryState>>,
    /// Signalled when an in-flight entry completes (waking idempotent
    /// duplicate waiters) and when a cached entry is inserted (waking the
    /// eviction timer).
    changed: Notify,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            changed: Notify::new(),
        }
    }
}

impl ResponseCache {
    /// Registers a request attempt for `key`.
    pub(crate) fn begin(&self, key: &DedupKey) -> BeginOutcome {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(EntryState::InFlight) => BeginOutcome::InFlight,
            Some(EntryState::Cached { response, .. }) => BeginOutcome::Cached(response.clone()),
            None => {
                entries.insert(key.clone(), EntryState::InFlight);
                BeginOutcome::Started
            }
        }
    }

    /// Completes the in-flight invocation for `key`.
    ///
    /// With `Some((response, ttl))` the response becomes replayable for
    /// `ttl`; with `None` (or a zero TTL) the key is simply released.
    pub(crate) fn complete(&self, key: &DedupKey, cached: Option<(OutgoingPublish, Duration)>) {
        let mut entries = self.entries.lock();
        match cached {
            Some((response, ttl)) if !ttl.is_zero() => {
                entries.insert(
                    key.clone(),
                    EntryState::Cached {
                        response,
                        expires_at: Instant::now() + ttl,
                    },
                );
            }
            _ => {
                entries.remove(key);
            }
        }
        drop(entries);
        self.changed.notify_waiters();
    }

    /// Waits until `key` is no longer in flight.
    pub(crate) async fn wait_not_in_flight(&self, key: &DedupKey) {
        loop {
            let notified = self.changed.notified();
            if !matches!(self.entries.lock().get(key), Some(EntryState::InFlight)) {
                return;
            }
            notified.await;
        }
    }

    /// Removes expired cached entries and returns the expiry instant of
    /// the next entry due, if any.
    pub(crate) fn evict_expired(&self) -> Option<Instant> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|key, state| match state {
            EntryState::InFlight => true,
            EntryState::Cached { expires_at, .. } => {
                let keep = *expires_at > now;
                if !keep {
                    tracing::debug!(
                        invoker = %key.invoker_id,
                        correlation = %key.correlation,
                        "Evicting cached response"
                    );
                }
                keep
            }
        });
        let evicted = before - entries.len();
        if evicted > 0 {
            tracing::debug!(count = evicted, "Response cache eviction pass complete");
        }
        entries
            .values()
            .filter_map(|state| match state {
                EntryState::InFlight => None,
                EntryState::Cached { expires_at, .. } => Some(*expires_at),
            })
            .min()
    }

    /// Number of live entries (in-flight and cached).
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Drives TTL eviction for a cache until cancelled.
///
/// Sleeps until the earliest cached expiry, wakes early when a new entry
/// is cached, and never holds the cache lock while sleeping.
pub(crate) async fn run_evictor(cache: Arc<ResponseCache>, cancel: CancellationToken) {
    loop {
        // Arm the change listener before scanning so an insertion between
        // the scan and the sleep is not missed.
        let changed = cache.changed.notified();
        let next_due = cache.evict_expired();
        tokio::select! {
            () = cancel.cancelled() => break,
            () = changed => {}
            () = async {
                match next_due {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    // Nothing cached; wait for a change notification.
                    None => std::future::pending().await,
                }
            } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{MessageProperties, QoS};

    fn key(invoker: &str) -> DedupKey {
        DedupKey {
            invoker_id: invoker.to_string(),
            correlation: Uuid::new_v4(),
        }
    }

    fn response(marker: u8) -> OutgoingPublish {
        OutgoingPublish {
            topic: "clients/inv/resp".to_string(),
            qos: QoS::AtLeastOnce,
            retain: false,
            payload: vec![marker],
            properties: MessageProperties::default(),
        }
    }

    #[test]
    fn first_begin_starts_the_invocation() {
        let cache = ResponseCache::default();
        let key = key("inv-1");
        assert!(matches!(cache.begin(&key), BeginOutcome::Started));
        assert!(matches!(cache.begin(&key), BeginOutcome::InFlight));
    }

    #[test]
    fn completed_response_is_replayed() {
        let cache = ResponseCache::default();
        let key = key("inv-1");
        assert!(matches!(cache.begin(&key), BeginOutcome::Started));
        cache.complete(&key, Some((response(7), Duration::from_secs(10))));

        match cache.begin(&key) {
            BeginOutcome::Cached(cached) => assert_eq!(cached.payload, vec![7]),
            _ => panic!("expected cached response"),
        }
    }

    #[test]
    fn completion_without_caching_releases_the_key() {
        let cache = ResponseCache::default();
        let key = key("inv-1");
        assert!(matches!(cache.begin(&key), BeginOutcome::Started));
        cache.complete(&key, None);
        assert!(matches!(cache.begin(&key), BeginOutcome::Started));
    }

    #[test]
    fn zero_ttl_is_not_cached() {
        let cache = ResponseCache::default();
        let key = key("inv-1");
        assert!(matches!(cache.begin(&key), BeginOutcome::Started));
        cache.complete(&key, Some((response(1), Duration::ZERO)));
        assert!(matches!(cache.begin(&key), BeginOutcome::Started));
    }

    #[test]
    fn distinct_invokers_do_not_collide() {
        let cache = ResponseCache::default();
        let correlation = Uuid::new_v4();
        let a = DedupKey {
            invoker_id: "inv-a".to_string(),
            correlation,
        };
        let b = DedupKey {
            invoker_id: "inv-b".to_string(),
            correlation,
        };
        assert!(matches!(cache.begin(&a), BeginOutcome::Started));
        assert!(matches!(cache.begin(&b), BeginOutcome::Started));
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_honors_absolute_expiry_order() {
        let cache = Arc::new(ResponseCache::default());
        let early = key("inv-early");
        let late = key("inv-late");
        cache.begin(&early);
        cache.begin(&late);
        cache.complete(&late, Some((response(2), Duration::from_secs(30))));
        cache.complete(&early, Some((response(1), Duration::from_secs(5))));
        assert_eq!(cache.len(), 2);

        tokio::time::advance(Duration::from_secs(6)).await;
        let next = cache.evict_expired();
        assert_eq!(cache.len(), 1);
        assert!(next.is_some(), "later entry still cached");
        assert!(matches!(cache.begin(&late), BeginOutcome::Cached(_)));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(cache.evict_expired().is_none());
        assert!(matches!(cache.begin(&late), BeginOutcome::Started));
    }

    #[tokio::test]
    async fn waiters_wake_on_completion() {
        let cache = Arc::new(ResponseCache::default());
        let key = key("inv-1");
        cache.begin(&key);

        let waiter = {
            let cache = cache.clone();
            let key = key.clone();
            tokio::spawn(async move { cache.wait_not_in_flight(&key).await })
        };

        cache.complete(&key, Some((response(1), Duration::from_secs(10))));
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn evictor_task_removes_due_entries() {
        let cache = Arc::new(ResponseCache::default());
        let cancel = CancellationToken::new();
        tokio::spawn(run_evictor(cache.clone(), cancel.clone()));

        let key = key("inv-1");
        cache.begin(&key);
        cache.complete(&key, Some((response(1), Duration::from_secs(2))));

        tokio::time::advance(Duration::from_secs(3)).await;
        // Give the evictor a chance to run its eviction pass.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cache.len(), 0);

        cancel.cancel();
    }
}
