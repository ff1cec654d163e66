// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Session MQTT client.
//!
//! A [`Session`] owns a single MQTT5 connection and keeps one logical
//! session alive across disconnects: subscriptions are preserved (or
//! restored when the broker loses session state), publishes submitted while
//! offline are queued and flushed in order, and unacknowledged inbound
//! messages are redelivered by the broker and deduplicated locally.
//!
//! Protocol components (telemetry senders/receivers, command
//! invokers/executors) do not talk to the session directly; they hold a
//! [`SessionClient`] - a cheap clone handle implementing [`ManagedClient`] -
//! and share the session by reference.
//!
//! # Example
//!
//! ```no_run
//! use edgelink_lib::session::{ConnectionSettings, Session, SessionOptions};
//!
//! # async fn example() -> edgelink_lib::Result<()> {
//! let settings = ConnectionSettings::builder()
//!     .client_id("edge-7")
//!     .hostname("broker.local")
//!     .build()?;
//! let options = SessionOptions::builder()
//!     .connection_settings(settings)
//!     .build()?;
//! let mut session = Session::new(options)?;
//!
//! let client = session.client();
//! let exit = session.exit_handle();
//!
//! tokio::spawn(async move {
//!     // ... create senders/receivers/invokers/executors from `client` ...
//!     # let _ = client;
//!     exit.try_exit().await
//! });
//!
//! session.run().await?;
//! # Ok(())
//! # }
//! ```

mod ack;
mod auth;
mod client;
mod config;
mod dispatcher;
mod queue;
mod reconnect;
mod state;

pub use ack::AckToken;
#[cfg(test)]
pub(crate) use ack::AckSink;
#[cfg(test)]
pub(crate) use dispatcher::Dispatcher;
pub use client::{Session, SessionClient, SessionExitHandle, SessionOptions, SessionOptionsBuilder};
pub use config::{
    AuthMethod, ConnectionSettings, ConnectionSettingsBuilder, TlsSettings,
};
pub use reconnect::{ExponentialBackoff, ReconnectPolicy};
pub use state::{ConnectionEvent, ConnectionEventStream, ConnectionMonitor, ConnectionState};

use std::future::Future;

use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, ErrorKind, Result};

/// Quality of service for published and subscribed messages.
///
/// The runtime uses at most QoS 1; exactly-once delivery is out of scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QoS {
    /// Fire and forget.
    AtMostOnce,
    /// Delivered at least once, acknowledged.
    #[default]
    AtLeastOnce,
}

/// MQTT5 message metadata carried alongside a payload.
#[derive(Debug, Clone, Default)]
pub struct MessageProperties {
    /// MIME content type of the payload.
    pub content_type: Option<String>,
    /// Payload format indicator (0 = bytes, 1 = UTF-8).
    pub format_indicator: Option<u8>,
    /// Opaque correlation data tying a response to its request.
    pub correlation_data: Option<Vec<u8>>,
    /// Topic the receiver should publish its response to.
    pub response_topic: Option<String>,
    /// Remaining message lifetime in seconds.
    pub message_expiry_interval: Option<u32>,
    /// Application and protocol user properties.
    pub user_properties: Vec<(String, String)>,
}

/// An outgoing publish submitted to the session.
#[derive(Debug, Clone)]
pub struct OutgoingPublish {
    /// Fully resolved topic.
    pub topic: String,
    /// Quality of service.
    pub qos: QoS,
    /// MQTT retain flag.
    pub retain: bool,
    /// Payload bytes.
    pub payload: Vec<u8>,
    /// MQTT5 properties.
    pub properties: MessageProperties,
}

/// An inbound message delivered to a registered filter observer.
#[derive(Debug)]
pub struct InboundMessage {
    /// The concrete topic the message arrived on.
    pub topic: String,
    /// Payload bytes.
    pub payload: Vec<u8>,
    /// Quality of service the message was delivered with.
    pub qos: QoS,
    /// True if the broker flagged this delivery as a duplicate.
    pub dup: bool,
    /// MQTT5 properties.
    pub properties: MessageProperties,
    /// Acknowledgement handle. `None` for QoS 0 messages, which need no
    /// ack. The observer must call [`AckToken::complete`] once it has
    /// finished processing; unacknowledged messages are redelivered by the
    /// broker after a reconnect.
    pub ack: Option<AckToken>,
}

/// Completion handle for a submitted publish.
///
/// Returned by [`ManagedClient::publish`] once the message has been
/// submitted (fixing its position in the wire order); awaiting it resolves
/// once the broker acknowledged the message (or immediately for QoS 0).
#[derive(Debug)]
pub struct PublishCompletion {
    rx: oneshot::Receiver<Result<()>>,
}

impl PublishCompletion {
    pub(crate) fn new(rx: oneshot::Receiver<Result<()>>) -> Self {
        Self { rx }
    }
}

impl Future for PublishCompletion {
    type Output = Result<()>;

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        std::pin::Pin::new(&mut self.rx).poll(cx).map(|r| match r {
            Ok(result) => result,
            Err(_) => Err(Error::new(
                ErrorKind::StateInvalid,
                "session dropped the publish before acknowledgement",
            )),
        })
    }
}

/// Stream of inbound messages matching one subscription filter.
///
/// Obtained from [`ManagedClient::filtered_messages`]. Dropping the stream
/// unregisters the observer; messages already dispatched to it are
/// auto-acknowledged by the session if no other observer holds them.
#[derive(Debug)]
pub struct MessageStream {
    rx: mpsc::UnboundedReceiver<InboundMessage>,
}

impl MessageStream {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<InboundMessage>) -> Self {
        Self { rx }
    }

    /// Receives the next message, or `None` once the session has closed.
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        self.rx.recv().await
    }
}

/// Handle to a running session, shared by reference between protocol
/// components.
///
/// The futures returned by these methods are `Send` so components can drive
/// them from spawned tasks.
pub trait ManagedClient: Clone + Send + Sync + 'static {
    /// Returns the MQTT client id of the underlying session.
    fn client_id(&self) -> &str;

    /// Submits a publish.
    ///
    /// Returns once the message's position in the wire order is fixed:
    /// either handed to the transport or appended to the offline queue. The
    /// returned [`PublishCompletion`] resolves when the broker acknowledges
    /// the message.
    fn publish(
        &self,
        publish: OutgoingPublish,
    ) -> impl Future<Output = Result<PublishCompletion>> + Send;

    /// Subscribes to a topic filter. Idempotent per filter: a second
    /// subscription to the same filter shares the broker subscription.
    fn subscribe(&self, filter: &str, qos: QoS) -> impl Future<Output = Result<()>> + Send;

    /// Unsubscribes from a topic filter.
    fn unsubscribe(&self, filter: &str) -> impl Future<Output = Result<()>> + Send;

    /// Registers an observer for messages matching `filter`.
    ///
    /// Multiple observers may watch the same filter; each receives its own
    /// copy of every matching message with its own ack handle.
    fn filtered_messages(&self, filter: &str) -> MessageStream;
}
