// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! FIFO queue for publishes submitted while the session is offline.
//!
//! Queued publishes are flushed in submission order on reconnection,
//! before any publish submitted after the connection was re-established.
//! A queued message whose MQTT expiry interval elapses before the flush is
//! dropped without touching the wire; its completion handle resolves with
//! a timeout error.

use std::collections::VecDeque;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Error, ErrorKind, Result};
use crate::session::OutgoingPublish;

/// A publish waiting for the connection to come back.
pub(crate) struct QueuedPublish {
    pub(crate) publish: OutgoingPublish,
    pub(crate) completion: oneshot::Sender<Result<()>>,
    queued_at: Instant,
}

impl QueuedPublish {
    /// True if the message's expiry interval elapsed while queued.
    fn is_expired(&self, now: Instant) -> bool {
        match self.publish.properties.message_expiry_interval {
            Some(secs) => now.duration_since(self.queued_at).as_secs() >= u64::from(secs),
            None => false,
        }
    }
}

/// Unbounded FIFO of offline publishes.
#[derive(Default)]
pub(crate) struct PendingQueue {
    inner: Mutex<VecDeque<QueuedPublish>>,
}

impl PendingQueue {
    /// Appends a publish to the queue.
    pub(crate) fn push(
        &self,
        publish: OutgoingPublish,
        completion: oneshot::Sender<Result<()>>,
    ) {
        self.inner.lock().push_back(QueuedPublish {
            publish,
            completion,
            queued_at: Instant::now(),
        });
    }

    /// Removes and returns all queued publishes in FIFO order, dropping
    /// expired ones.
    ///
    /// Expired messages never reach the wire; their completions resolve
    /// with a timeout error.
    pub(crate) fn drain(&self) -> Vec<QueuedPublish> {
        let drained: Vec<QueuedPublish> = self.inner.lock().drain(..).collect();
        let now = Instant::now();
        let mut live = Vec::with_capacity(drained.len());
        for queued in drained {
            if queued.is_expired(now) {
                tracing::debug!(
                    topic = %queued.publish.topic,
                    "Dropping expired queued publish"
                );
                let _ = queued.completion.send(Err(Error::new(
                    ErrorKind::Timeout,
                    "publish expired while waiting for reconnection",
                )));
            } else {
                live.push(queued);
            }
        }
        live
    }

    /// Fails every queued publish with the given error kind.
    pub(crate) fn fail_all(&self, kind: ErrorKind, message: &str) {
        let drained: Vec<QueuedPublish> = self.inner.lock().drain(..).collect();
        for queued in drained {
            let _ = queued
                .completion
                .send(Err(Error::new(kind, message.to_string())));
        }
    }

    /// Number of queued publishes.
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{MessageProperties, QoS};

    fn publish(topic: &str, expiry: Option<u32>) -> OutgoingPublish {
        OutgoingPublish {
            topic: topic.to_string(),
            qos: QoS::AtLeastOnce,
            retain: false,
            payload: b"x".to_vec(),
            properties: MessageProperties {
                message_expiry_interval: expiry,
                ..MessageProperties::default()
            },
        }
    }

    #[test]
    fn drain_preserves_fifo_order() {
        let queue = PendingQueue::default();
        for topic in ["t/1", "t/2", "t/3"] {
            let (tx, _rx) = oneshot::channel();
            queue.push(publish(topic, None), tx);
        }
        assert_eq!(queue.len(), 3);

        let drained = queue.drain();
        let topics: Vec<&str> = drained.iter().map(|q| q.publish.topic.as_str()).collect();
        assert_eq!(topics, ["t/1", "t/2", "t/3"]);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn expired_publishes_are_dropped_with_timeout() {
        let queue = PendingQueue::default();
        let (expired_tx, mut expired_rx) = oneshot::channel();
        // Zero second expiry: expired as soon as it is queued.
        queue.push(publish("t/old", Some(0)), expired_tx);
        let (live_tx, _live_rx) = oneshot::channel();
        queue.push(publish("t/live", None), live_tx);

        let drained = queue.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].publish.topic, "t/live");

        let err = expired_rx.try_recv().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn fail_all_resolves_completions() {
        let queue = PendingQueue::default();
        let (tx, mut rx) = oneshot::channel();
        queue.push(publish("t/1", None), tx);

        queue.fail_all(ErrorKind::StateInvalid, "session ended");
        let err = rx.try_recv().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateInvalid);
        assert_eq!(queue.len(), 0);
    }
}
