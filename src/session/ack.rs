// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Acknowledgement tracking for inbound QoS 1 messages.
//!
//! Inbound messages are not auto-acknowledged. Each delivery hands the
//! observer an [`AckToken`]; the underlying PUBACK is sent only once every
//! observer of the message has completed its token, and PUBACKs always go
//! out in broker-delivery order, as MQTT5 requires, even when observers
//! complete out of order.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Internal sink an [`AckToken`] completes into.
pub(crate) trait AckSink: Send + Sync {
    /// Records completion of one observer's handle for the given entry.
    fn complete(&self, entry_id: u64);
}

/// Opaque acknowledgement handle for one inbound message delivery.
///
/// Call [`complete`](Self::complete) once the message has been fully
/// processed. Dropping the token without completing it leaves the message
/// unacknowledged; the broker will redeliver it after a reconnect.
pub struct AckToken {
    sink: Option<Arc<dyn AckSink>>,
    entry_id: u64,
}

impl AckToken {
    pub(crate) fn new(sink: Arc<dyn AckSink>, entry_id: u64) -> Self {
        Self {
            sink: Some(sink),
            entry_id,
        }
    }

    /// Completes this observer's acknowledgement of the message.
    pub fn complete(mut self) {
        if let Some(sink) = self.sink.take() {
            sink.complete(self.entry_id);
        }
    }
}

impl Drop for AckToken {
    fn drop(&mut self) {
        if self.sink.is_some() {
            tracing::debug!(
                entry = self.entry_id,
                "Ack token dropped without completion; message will be redelivered"
            );
        }
    }
}

impl std::fmt::Debug for AckToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckToken")
            .field("entry_id", &self.entry_id)
            .field("completed", &self.sink.is_none())
            .finish()
    }
}

struct Entry<M> {
    message: M,
    pkid: u16,
    /// Observers that have not yet completed their token.
    remaining: usize,
}

struct TrackerInner<M> {
    /// Entry ids in broker-delivery order.
    order: VecDeque<u64>,
    entries: HashMap<u64, Entry<M>>,
    next_id: u64,
}

/// Tracks unacknowledged inbound messages and releases them for
/// acknowledgement in delivery order.
///
/// `M` is whatever the transport needs to send the actual PUBACK (the raw
/// publish packet for the real session).
pub(crate) struct AckTracker<M> {
    inner: Mutex<TrackerInner<M>>,
    notify: Notify,
}

impl<M> Default for AckTracker<M> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                order: VecDeque::new(),
                entries: HashMap::new(),
                next_id: 0,
            }),
            notify: Notify::new(),
        }
    }
}

impl<M: Send> AckTracker<M> {
    /// Registers a delivered message that `observer_count` observers must
    /// complete. Returns the entry id for token creation.
    pub(crate) fn register(&self, message: M, pkid: u16, observer_count: usize) -> u64 {
        debug_assert!(observer_count > 0);
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.order.push_back(id);
        inner.entries.insert(
            id,
            Entry {
                message,
                pkid,
                remaining: observer_count,
            },
        );
        id
    }

    /// Returns true if an unacknowledged entry with this packet id exists.
    ///
    /// Used to discard broker redeliveries of a message that is still being
    /// processed: the packet id cannot be reused by the broker until we
    /// acknowledge it, so a matching entry proves the duplicate is ours.
    pub(crate) fn contains_pkid(&self, pkid: u16) -> bool {
        self.inner
            .lock()
            .entries
            .values()
            .any(|entry| entry.pkid == pkid)
    }

    /// Waits until the oldest delivered message is fully completed, then
    /// removes and returns it for acknowledgement.
    ///
    /// Messages completed out of order are held back until every older
    /// message has been completed.
    pub(crate) async fn next_ready(&self) -> M {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                // Entries may have been removed by clear() while we
                // waited; prune orphaned order slots first.
                while let Some(id) = inner.order.front().copied() {
                    if inner.entries.contains_key(&id) {
                        break;
                    }
                    inner.order.pop_front();
                }
                let front_ready = inner
                    .order
                    .front()
                    .and_then(|id| inner.entries.get(id))
                    .is_some_and(|entry| entry.remaining == 0);
                if front_ready {
                    let id = inner.order.pop_front().expect("front checked above");
                    let entry = inner.entries.remove(&id).expect("entry checked above");
                    return entry.message;
                }
            }
            notified.await;
        }
    }

    /// Discards all tracked entries.
    ///
    /// Called when the broker reports a lost session: the old packet ids
    /// are meaningless to the new session, so the pending acknowledgements
    /// can never be delivered. Outstanding tokens complete into the void.
    pub(crate) fn clear(&self) {
        let mut inner = self.inner.lock();
        let dropped = inner.entries.len();
        inner.entries.clear();
        inner.order.clear();
        if dropped > 0 {
            tracing::debug!(count = dropped, "Dropped pending acknowledgements");
        }
        self.notify.notify_waiters();
    }

    /// Returns the number of unacknowledged entries.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

impl<M: Send> AckSink for AckTracker<M> {
    fn complete(&self, entry_id: u64) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(&entry_id) else {
            // Entry was cleared (session loss); nothing left to ack.
            return;
        };
        entry.remaining = entry.remaining.saturating_sub(1);
        if entry.remaining == 0 {
            self.notify.notify_one();
        }
    }
}
