// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Telemetry receiver.
//!
//! Subscribes to a telemetry topic filter, parses each inbound message
//! (merging the peer's clock stamp into the local hybrid logical clock
//! before anything else), decodes the payload, and invokes an application
//! callback. The callback receives the acknowledgement handle and must
//! complete it; the receiver never acknowledges a successfully decoded
//! message on its own.
//!
//! Messages that fail to parse are reported on the receiver's error stream
//! and - by default - acknowledged and dropped, so a poison message cannot
//! loop through redelivery forever.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use crate::application::ApplicationContext;
use crate::error::{Error, ErrorKind, Result};
use crate::headers::{
    ProtocolVersion, SUPPORTED_PROTOCOL_MAJOR_VERSIONS, UserProperty, find_property,
};
use crate::hlc::{HybridLogicalClock, SharedHybridLogicalClock};
use crate::payload::{EncodedPayload, PayloadCodec};
use crate::session::{AckToken, InboundMessage, ManagedClient, QoS};
use crate::telemetry::cloud_event::CloudEvent;
use crate::topic::TopicPattern;

/// Default bound on concurrently running telemetry callbacks.
const DEFAULT_DISPATCH_CONCURRENCY: usize = 10;

/// A decoded telemetry message handed to the application callback.
#[derive(Debug)]
pub struct ReceivedTelemetry<T> {
    /// The decoded payload.
    pub payload: T,
    /// Client id of the sender, from the `__srcId` header.
    pub sender_id: Option<String>,
    /// The sender's clock stamp, already merged into the local clock.
    pub timestamp: Option<HybridLogicalClock>,
    /// Parsed CloudEvents envelope, when the sender attached one.
    pub cloud_event: Option<CloudEvent>,
    /// Token values captured from the topic (e.g. `senderId`).
    pub topic_tokens: HashMap<String, String>,
    /// Custom user properties set by the sender.
    pub user_properties: Vec<(String, String)>,
}

/// What the receiver does with a message it cannot parse or decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeFailurePolicy {
    /// Acknowledge and drop the message (default). Avoids poison-message
    /// redelivery loops.
    #[default]
    AckAndDrop,
    /// Leave the message unacknowledged; the broker redelivers it after a
    /// reconnect.
    Drop,
}

/// Options for a [`TelemetryReceiver`].
#[derive(Debug, Clone)]
pub struct TelemetryReceiverOptions {
    /// Topic pattern to subscribe to, e.g. `fleet/{senderId}/temperature`.
    pub topic_pattern: String,
    /// Optional namespace prepended to the pattern.
    pub topic_namespace: Option<String>,
    /// Receiver-wide topic token values; unresolved tokens subscribe as
    /// wildcards and are captured per message.
    pub topic_tokens: HashMap<String, String>,
    /// Bound on concurrently running callbacks (default: 10).
    pub dispatch_concurrency: usize,
    /// Policy for undecodable messages.
    pub decode_failure_policy: DecodeFailurePolicy,
}

impl Default for TelemetryReceiverOptions {
    fn default() -> Self {
        Self {
            topic_pattern: String::new(),
            topic_namespace: None,
            topic_tokens: HashMap::new(),
            dispatch_concurrency: DEFAULT_DISPATCH_CONCURRENCY,
            decode_failure_policy: DecodeFailurePolicy::default(),
        }
    }
}

type TelemetryHandler<T> = Arc<
    dyn Fn(ReceivedTelemetry<T>, Option<AckToken>) -> Pin<Box<dyn Future<Output = ()> + Send>>
        + Send
        + Sync,
>;

/// Receives typed telemetry through a session client.
pub struct TelemetryReceiver<T, C>
where
    C: ManagedClient,
{
    client: C,
    hlc: Arc<SharedHybridLogicalClock>,
    codec: Arc<dyn PayloadCodec<T>>,
    pattern: Arc<TopicPattern>,
    dispatch_concurrency: usize,
    decode_failure_policy: DecodeFailurePolicy,
    error_tx: mpsc::UnboundedSender<Error>,
    error_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<Error>>>,
    cancel: CancellationToken,
    started: parking_lot::Mutex<bool>,
}

impl<T, C> TelemetryReceiver<T, C>
where
    T: Send + 'static,
    C: ManagedClient,
{
    /// Creates a receiver.
    ///
    /// # Errors
    ///
    /// Returns a shallow error of kind `ConfigurationInvalid` if the topic
    /// pattern is invalid or the dispatch concurrency is zero.
    pub fn new(
        context: &ApplicationContext,
        client: C,
        codec: Arc<dyn PayloadCodec<T>>,
        options: TelemetryReceiverOptions,
    ) -> Result<Self> {
        if options.dispatch_concurrency == 0 {
            return Err(Error::shallow(
                ErrorKind::ConfigurationInvalid,
                "dispatch concurrency must be at least 1",
            )
            .with_property_name("dispatch_concurrency"));
        }
        let pattern = TopicPattern::new(
            &options.topic_pattern,
            options.topic_namespace.as_deref(),
            &options.topic_tokens,
        )?;

        let (error_tx, error_rx) = mpsc::unbounded_channel();
        Ok(Self {
            client,
            hlc: context.hlc().clone(),
            codec,
            pattern: Arc::new(pattern),
            dispatch_concurrency: options.dispatch_concurrency,
            decode_failure_policy: options.decode_failure_policy,
            error_tx,
            error_rx: parking_lot::Mutex::new(Some(error_rx)),
            cancel: CancellationToken::new(),
            started: parking_lot::Mutex::new(false),
        })
    }

    /// Takes the stream of parse/decode errors. Returns `None` after the
    /// first call.
    #[must_use]
    pub fn take_error_stream(&self) -> Option<mpsc::UnboundedReceiver<Error>> {
        self.error_rx.lock().take()
    }

    /// Subscribes and starts dispatching messages to `handler`.
    ///
    /// The handler runs on the worker pool, at most
    /// `dispatch_concurrency` invocations at a time, in message-received
    /// order. It must complete the [`AckToken`] it is given.
    ///
    /// # Errors
    ///
    /// Returns an error of kind `StateInvalid` if the receiver was already
    /// started, or any error from the underlying subscribe.
    pub async fn start<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(ReceivedTelemetry<T>, Option<AckToken>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        {
            let mut started = self.started.lock();
            if *started {
                return Err(Error::new(
                    ErrorKind::StateInvalid,
                    "telemetry receiver is already started",
                ));
            }
            *started = true;
        }

        let filter = self.pattern.subscribe_filter();
        // Register the observer before subscribing so no message can slip
        // between SUBACK and registration.
        let stream = self.client.filtered_messages(&filter);
        self.client.subscribe(&filter, QoS::AtLeastOnce).await?;
        tracing::debug!(filter = %filter, "Telemetry receiver subscribed");

        let handler: TelemetryHandler<T> =
            Arc::new(move |message, ack| Box::pin(handler(message, ack)));

        tokio::spawn(dispatch_loop(
            stream,
            self.hlc.clone(),
            self.codec.clone(),
            self.pattern.clone(),
            handler,
            self.dispatch_concurrency,
            self.decode_failure_policy,
            self.error_tx.clone(),
            self.cancel.clone(),
        ));
        Ok(())
    }

    /// Stops dispatching and unsubscribes.
    ///
    /// # Errors
    ///
    /// Returns any error from the underlying unsubscribe.
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        let filter = self.pattern.subscribe_filter();
        self.client.unsubscribe(&filter).await?;
        tracing::debug!(filter = %filter, "Telemetry receiver shut down");
        Ok(())
    }
}

/// Reads messages from the stream and dispatches parsed telemetry to the
/// handler, bounded by the concurrency semaphore.
#[allow(clippy::too_many_arguments)]
async fn dispatch_loop<T, S>(
    mut stream: S,
    hlc: Arc<SharedHybridLogicalClock>,
    codec: Arc<dyn PayloadCodec<T>>,
    pattern: Arc<TopicPattern>,
    handler: TelemetryHandler<T>,
    dispatch_concurrency: usize,
    decode_failure_policy: DecodeFailurePolicy,
    error_tx: mpsc::UnboundedSender<Error>,
    cancel: CancellationToken,
) where
    T: Send + 'static,
    S: MessageSource + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(dispatch_concurrency));
    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => break,
            message = stream.next() => match message {
                Some(message) => message,
                None => break,
            },
        };

        // Acquire before dispatch so messages start in received order.
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };

        match parse_telemetry(&hlc, codec.as_ref(), &pattern, &message) {
            Ok(received) => {
                let handler = handler.clone();
                let ack = message.ack;
                tokio::spawn(async move {
                    handler(received, ack).await;
                    drop(permit);
                });
            }
            Err(e) => {
                tracing::warn!(topic = %message.topic, error = %e, "Failed to parse telemetry");
                let _ = error_tx.send(e);
                if let Some(ack) = message.ack {
                    match decode_failure_policy {
                        DecodeFailurePolicy::AckAndDrop => ack.complete(),
                        DecodeFailurePolicy::Drop => drop(ack),
                    }
                }
                drop(permit);
            }
        }
    }
}

/// Parses one inbound message into typed telemetry.
fn parse_telemetry<T>(
    hlc: &SharedHybridLogicalClock,
    codec: &dyn PayloadCodec<T>,
    pattern: &TopicPattern,
    message: &InboundMessage,
) -> Result<ReceivedTelemetry<T>> {
    let properties = &message.properties;

    // Protocol version gate.
    if let Some(raw) = find_property(&properties.user_properties, UserProperty::ProtocolVersion) {
        let version = ProtocolVersion::from_str(raw)?;
        if !version.is_supported(SUPPORTED_PROTOCOL_MAJOR_VERSIONS) {
            return Err(Error::new(
                ErrorKind::UnsupportedVersion,
                format!("telemetry protocol version {raw} is not supported"),
            )
            .with_protocol_version(raw)
            .with_supported_major_versions(SUPPORTED_PROTOCOL_MAJOR_VERSIONS.to_vec()));
        }
    }

    // Merge the peer clock before anything observable happens.
    let timestamp = match find_property(&properties.user_properties, UserProperty::Timestamp) {
        Some(raw) => {
            let peer = HybridLogicalClock::from_str(raw)
                .map_err(|e| e.with_header_name(UserProperty::Timestamp.name()))?;
            hlc.update_with(&peer)?;
            Some(peer)
        }
        None => None,
    };

    let cloud_event = CloudEvent::from_headers(&properties.user_properties)?;

    let sender_id = find_property(&properties.user_properties, UserProperty::SourceId)
        .map(ToString::to_string);

    let topic_tokens = pattern.match_topic(&message.topic).unwrap_or_default();

    let encoded = EncodedPayload {
        payload: message.payload.clone(),
        content_type: properties.content_type.clone().unwrap_or_default(),
        format_indicator: properties
            .format_indicator
            .unwrap_or_default()
            .try_into()
            .unwrap_or_default(),
    };
    let payload = codec.decode(&encoded)?;

    let user_properties = properties
        .user_properties
        .iter()
        .filter(|(k, _)| !k.starts_with("__"))
        .cloned()
        .collect();

    Ok(ReceivedTelemetry {
        payload,
        sender_id,
        timestamp,
        cloud_event,
        topic_tokens,
        user_properties,
    })
}

/// Source of inbound messages for the dispatch loop.
///
/// Abstracted from [`MessageStream`](crate::session::MessageStream) so the
/// loop can be driven directly in tests.
trait MessageSource {
    fn next(&mut self) -> impl Future<Output = Option<InboundMessage>> + Send;
}

impl MessageSource for crate::session::MessageStream {
    async fn next(&mut self) -> Option<InboundMessage> {
        self.recv().await
    }
}

impl MessageSource for mpsc::UnboundedReceiver<InboundMessage> {
    async fn next(&mut self) -> Option<InboundMessage> {
        self.recv().await
    }
}
