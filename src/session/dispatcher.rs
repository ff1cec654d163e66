// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Local fan-out of inbound messages to filter observers.
//!
//! Two observers of the same filter share one broker subscription but
//! receive messages independently: the dispatcher keeps a table of
//! (filter, channel) registrations and delivers a copy of every matching
//! message to each. Observers that dropped their stream are pruned on the
//! next dispatch.

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::session::{InboundMessage, MessageStream};

struct Registration {
    filter: String,
    tx: mpsc::UnboundedSender<InboundMessage>,
}

/// Fan-out table from topic filters to observer channels.
#[derive(Default)]
pub(crate) struct Dispatcher {
    registrations: RwLock<Vec<Registration>>,
}

impl Dispatcher {
    /// Registers an observer for a filter and returns its stream.
    pub(crate) fn register(&self, filter: &str) -> MessageStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.registrations.write().push(Registration {
            filter: filter.to_string(),
            tx,
        });
        tracing::debug!(filter = %filter, "Registered message observer");
        MessageStream::new(rx)
    }

    /// Returns the open channels of every observer whose filter matches
    /// `topic`, pruning closed registrations along the way.
    pub(crate) fn matching_senders(
        &self,
        topic: &str,
    ) -> Vec<mpsc::UnboundedSender<InboundMessage>> {
        let mut registrations = self.registrations.write();
        registrations.retain(|reg| !reg.tx.is_closed());
        registrations
            .iter()
            .filter(|reg| filter_matches(&reg.filter, topic))
            .map(|reg| reg.tx.clone())
            .collect()
    }

    /// Number of live registrations.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.registrations.read().len()
    }
}

/// Returns true if an MQTT topic filter matches a concrete topic.
///
/// Supports `+` (single level), `#` (trailing multi-level), and shared
/// subscription filters (`$share/<group>/<filter>`), whose group prefix is
/// ignored for matching.
pub(crate) fn filter_matches(filter: &str, topic: &str) -> bool {
    let filter = filter
        .strip_prefix("$share/")
        .and_then(|rest| rest.split_once('/').map(|(_, f)| f))
        .unwrap_or(filter);

    let mut filter_segments = filter.split('/').peekable();
    let mut topic_segments = topic.split('/');

    loop {
        match (filter_segments.next(), topic_segments.next()) {
            (None, None) => return true,
            (Some("#"), _) => return filter_segments.peek().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{MessageProperties, QoS};

    fn message(topic: &str) -> InboundMessage {
        InboundMessage {
            topic: topic.to_string(),
            payload: Vec::new(),
            qos: QoS::AtMostOnce,
            dup: false,
            properties: MessageProperties::default(),
            ack: None,
        }
    }

    #[test]
    fn filter_matching_rules() {
        assert!(filter_matches("a/b/c", "a/b/c"));
        assert!(!filter_matches("a/b/c", "a/b/d"));
        assert!(!filter_matches("a/b", "a/b/c"));
        assert!(!filter_matches("a/b/c", "a/b"));

        assert!(filter_matches("a/+/c", "a/b/c"));
        assert!(filter_matches("+/+/+", "a/b/c"));
        assert!(!filter_matches("a/+", "a/b/c"));

        assert!(filter_matches("a/#", "a/b/c"));
        assert!(filter_matches("a/#", "a"));
        assert!(filter_matches("#", "a/b/c"));
        assert!(!filter_matches("a/#/c", "a/b/c"));

        assert!(filter_matches("$share/group1/a/+/c", "a/b/c"));
        assert!(!filter_matches("$share/group1/a/+/c", "x/b/c"));
    }

    #[tokio::test]
    async fn observers_of_matching_filters_receive_messages() {
        let dispatcher = Dispatcher::default();
        let mut stream_a = dispatcher.register("fleet/+/state");
        let mut stream_b = dispatcher.register("fleet/edge-1/state");
        let _other = dispatcher.register("depot/#");

        let senders = dispatcher.matching_senders("fleet/edge-1/state");
        assert_eq!(senders.len(), 2);
        for tx in senders {
            tx.send(message("fleet/edge-1/state")).unwrap();
        }

        assert_eq!(stream_a.recv().await.unwrap().topic, "fleet/edge-1/state");
        assert_eq!(stream_b.recv().await.unwrap().topic, "fleet/edge-1/state");
    }

    #[test]
    fn dropped_observers_are_pruned() {
        let dispatcher = Dispatcher::default();
        let stream = dispatcher.register("a/b");
        assert_eq!(dispatcher.len(), 1);

        drop(stream);
        let senders = dispatcher.matching_senders("a/b");
        assert!(senders.is_empty());
        assert_eq!(dispatcher.len(), 0);
    }

    #[test]
    fn non_matching_topic_finds_no_senders() {
        let dispatcher = Dispatcher::default();
        let _stream = dispatcher.register("a/b");
        assert!(dispatcher.matching_senders("c/d").is_empty());
        assert_eq!(dispatcher.len(), 1);
    }
}
