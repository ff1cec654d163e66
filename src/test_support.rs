// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-process loopback transport for protocol tests.
//!
//! A [`MockBroker`] routes publishes from any attached [`MockClient`]
//! straight to the matching filter observers of every client, with
//! counting acknowledgement tokens. This lets invoker/executor and
//! sender/receiver pairs run complete exchanges without a broker.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;

use crate::error::Result;
use crate::session::{
    AckSink, AckToken, Dispatcher, InboundMessage, ManagedClient, MessageStream, OutgoingPublish,
    PublishCompletion, QoS,
};

/// Records acknowledgement completions for assertions.
#[derive(Default)]
pub(crate) struct CountingAckSink {
    completed: AtomicUsize,
}

impl AckSink for CountingAckSink {
    fn complete(&self, _entry_id: u64) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
}

struct AttachedClient {
    dispatcher: Arc<Dispatcher>,
}

#[derive(Default)]
struct MockBrokerInner {
    clients: RwLock<Vec<AttachedClient>>,
    published: Mutex<Vec<OutgoingPublish>>,
    acks: Arc<CountingAckSink>,
    next_entry: AtomicUsize,
    delivered: AtomicUsize,
}

/// Loopback broker shared by the mock clients of one test.
#[derive(Clone, Default)]
pub(crate) struct MockBroker {
    inner: Arc<MockBrokerInner>,
}

impl MockBroker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Attaches a client with the given id.
    pub(crate) fn client(&self, client_id: &str) -> MockClient {
        let dispatcher = Arc::new(Dispatcher::default());
        self.inner.clients.write().push(AttachedClient {
            dispatcher: dispatcher.clone(),
        });
        MockClient {
            client_id: Arc::new(client_id.to_string()),
            dispatcher,
            broker: self.clone(),
        }
    }

    /// Routes a publish to every matching observer of every client.
    pub(crate) fn route(&self, publish: &OutgoingPublish) {
        self.inner.published.lock().push(publish.clone());
        let clients = self.inner.clients.read();
        for client in clients.iter() {
            for tx in client.dispatcher.matching_senders(&publish.topic) {
                let ack = match publish.qos {
                    QoS::AtMostOnce => None,
                    QoS::AtLeastOnce => {
                        let entry = self.inner.next_entry.fetch_add(1, Ordering::SeqCst) as u64;
                        Some(AckToken::new(self.inner.acks.clone(), entry))
                    }
                };
                self.inner.delivered.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(InboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                    qos: publish.qos,
                    dup: false,
                    properties: publish.properties.clone(),
                    ack,
                });
            }
        }
    }

    /// All publishes routed so far, in order.
    pub(crate) fn published(&self) -> Vec<OutgoingPublish> {
        self.inner.published.lock().clone()
    }

    /// Publishes whose topic starts with `prefix`, in order.
    pub(crate) fn published_to(&self, prefix: &str) -> Vec<OutgoingPublish> {
        self.inner
            .published
            .lock()
            .iter()
            .filter(|p| p.topic.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Number of completed acknowledgement tokens.
    pub(crate) fn acked(&self) -> usize {
        self.inner.acks.completed.load(Ordering::SeqCst)
    }

    /// Number of messages delivered to observers.
    pub(crate) fn delivered(&self) -> usize {
        self.inner.delivered.load(Ordering::SeqCst)
    }
}

/// A loopback client attached to a [`MockBroker`].
#[derive(Clone)]
pub(crate) struct MockClient {
    client_id: Arc<String>,
    dispatcher: Arc<Dispatcher>,
    broker: MockBroker,
}

impl ManagedClient for MockClient {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn publish(&self, publish: OutgoingPublish) -> Result<PublishCompletion> {
        self.broker.route(&publish);
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Ok(()));
        Ok(PublishCompletion::new(rx))
    }

    async fn subscribe(&self, _filter: &str, _qos: QoS) -> Result<()> {
        Ok(())
    }

    async fn unsubscribe(&self, _filter: &str) -> Result<()> {
        Ok(())
    }

    fn filtered_messages(&self, filter: &str) -> MessageStream {
        self.dispatcher.register(filter)
    }
}
