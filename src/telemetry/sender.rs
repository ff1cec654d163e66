// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Telemetry sender.
//!
//! Publishes typed, schema-stamped telemetry with CloudEvents metadata.
//! Concurrent [`send`](TelemetrySender::send) calls from one sender reach
//! the wire in submission order; each call returns once the broker has
//! acknowledged the message.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::application::ApplicationContext;
use crate::error::{Error, ErrorKind, Result};
use crate::headers::{PROTOCOL_VERSION, UserProperty};
use crate::hlc::SharedHybridLogicalClock;
use crate::payload::PayloadCodec;
use crate::session::{ManagedClient, MessageProperties, OutgoingPublish, QoS};
use crate::telemetry::cloud_event::{CloudEvent, is_cloud_event_header};
use crate::topic::{TOKEN_SENDER_ID, TopicPattern};

/// Default message expiry for telemetry.
const DEFAULT_MESSAGE_EXPIRY: Duration = Duration::from_secs(10);

/// One typed telemetry message.
#[derive(Debug, Clone)]
pub struct TelemetryMessage<T> {
    payload: T,
    qos: QoS,
    message_expiry: Duration,
    custom_user_data: Vec<(String, String)>,
    topic_tokens: HashMap<String, String>,
    cloud_event: Option<CloudEvent>,
}

impl<T> TelemetryMessage<T> {
    /// Creates a builder carrying the given payload.
    #[must_use]
    pub fn builder(payload: T) -> TelemetryMessageBuilder<T> {
        TelemetryMessageBuilder {
            payload,
            qos: QoS::AtLeastOnce,
            message_expiry: DEFAULT_MESSAGE_EXPIRY,
            custom_user_data: Vec::new(),
            topic_tokens: HashMap::new(),
            cloud_event: None,
        }
    }
}

/// Builder for [`TelemetryMessage`].
#[derive(Debug)]
pub struct TelemetryMessageBuilder<T> {
    payload: T,
    qos: QoS,
    message_expiry: Duration,
    custom_user_data: Vec<(String, String)>,
    topic_tokens: HashMap<String, String>,
    cloud_event: Option<CloudEvent>,
}

impl<T> TelemetryMessageBuilder<T> {
    /// Sets the quality of service (default: at least once).
    #[must_use]
    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// Sets the message expiry, rounded up to whole seconds (default: 10
    /// seconds).
    #[must_use]
    pub fn message_expiry(mut self, expiry: Duration) -> Self {
        self.message_expiry = round_up_to_seconds(expiry);
        self
    }

    /// Adds a custom user property passed through to receivers.
    #[must_use]
    pub fn user_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_user_data.push((key.into(), value.into()));
        self
    }

    /// Adds a per-call topic token value, overriding the sender-wide map.
    #[must_use]
    pub fn topic_token(mut self, token: impl Into<String>, value: impl Into<String>) -> Self {
        self.topic_tokens.insert(token.into(), value.into());
        self
    }

    /// Attaches a CloudEvents envelope.
    #[must_use]
    pub fn cloud_event(mut self, cloud_event: CloudEvent) -> Self {
        self.cloud_event = Some(cloud_event);
        self
    }

    /// Builds the message.
    ///
    /// # Errors
    ///
    /// Returns a shallow error of kind `ConfigurationInvalid` if a custom
    /// user property uses a reserved name (`__` prefix or a CloudEvents
    /// attribute) or the expiry exceeds the u32 seconds wire range.
    pub fn build(self) -> Result<TelemetryMessage<T>> {
        for (key, _) in &self.custom_user_data {
            if key.starts_with("__") || is_cloud_event_header(key) {
                return Err(Error::shallow(
                    ErrorKind::ConfigurationInvalid,
                    format!("user property name {key:?} is reserved"),
                )
                .with_property_name(key.clone()));
            }
        }
        if u32::try_from(self.message_expiry.as_secs()).is_err() {
            return Err(Error::shallow(
                ErrorKind::ConfigurationInvalid,
                "message expiry exceeds the u32 seconds wire representation",
            )
            .with_property_name("message_expiry"));
        }
        Ok(TelemetryMessage {
            payload: self.payload,
            qos: self.qos,
            message_expiry: self.message_expiry,
            custom_user_data: self.custom_user_data,
            topic_tokens: self.topic_tokens,
            cloud_event: self.cloud_event,
        })
    }
}

/// Options for a [`TelemetrySender`].
#[derive(Debug, Clone)]
pub struct TelemetrySenderOptions {
    /// Topic pattern for outgoing telemetry, e.g.
    /// `fleet/{senderId}/{telemetryName}`.
    pub topic_pattern: String,
    /// Optional namespace prepended to the pattern.
    pub topic_namespace: Option<String>,
    /// Sender-wide topic token values. The `senderId` token defaults to
    /// the session client id when not set here.
    pub topic_tokens: HashMap<String, String>,
}

/// Publishes typed telemetry through a session client.
pub struct TelemetrySender<T, C>
where
    C: ManagedClient,
{
    client: C,
    hlc: Arc<SharedHybridLogicalClock>,
    codec: Arc<dyn PayloadCodec<T>>,
    pattern: TopicPattern,
    /// Serializes submissions so concurrent sends keep submission order.
    send_lock: tokio::sync::Mutex<()>,
}

impl<T, C> TelemetrySender<T, C>
where
    C: ManagedClient,
{
    /// Creates a sender.
    ///
    /// # Errors
    ///
    /// Returns a shallow error of kind `ConfigurationInvalid` if the topic
    /// pattern is invalid.
    pub fn new(
        context: &ApplicationContext,
        client: C,
        codec: Arc<dyn PayloadCodec<T>>,
        options: TelemetrySenderOptions,
    ) -> Result<Self> {
        let mut tokens = options.topic_tokens;
        tokens
            .entry(TOKEN_SENDER_ID.to_string())
            .or_insert_with(|| client.client_id().to_string());

        let pattern = TopicPattern::new(
            &options.topic_pattern,
            options.topic_namespace.as_deref(),
            &tokens,
        )?;

        Ok(Self {
            client,
            hlc: context.hlc().clone(),
            codec,
            pattern,
            send_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Sends a telemetry message, returning once the broker acknowledged
    /// it.
    ///
    /// # Errors
    ///
    /// Shallow errors of kind `ConfigurationInvalid` (unresolved topic
    /// token) or `PayloadInvalid` (serialization failure) are raised before
    /// any network I/O. `StateInvalid` is returned when the session has
    /// ended; `Timeout` when a queued message expired before a reconnect.
    pub async fn send(&self, message: TelemetryMessage<T>) -> Result<()> {
        let encoded = self
            .codec
            .encode(&message.payload)
            .map_err(Error::mark_shallow)?;
        let topic = self.pattern.publish_topic(&message.topic_tokens)?;

        let timestamp = self.hlc.update()?;

        let mut user_properties = message.custom_user_data;
        if let Some(cloud_event) = message.cloud_event {
            user_properties.extend(cloud_event.into_headers(&topic, &encoded.content_type));
        }
        user_properties.push((UserProperty::Timestamp.to_string(), timestamp.to_string()));
        user_properties.push((
            UserProperty::ProtocolVersion.to_string(),
            PROTOCOL_VERSION.to_string(),
        ));
        user_properties.push((
            UserProperty::SourceId.to_string(),
            self.client.client_id().to_string(),
        ));

        // Validated in the message builder.
        #[allow(clippy::cast_possible_truncation)]
        let expiry = message.message_expiry.as_secs() as u32;

        let publish = OutgoingPublish {
            topic,
            qos: message.qos,
            retain: false,
            payload: encoded.payload,
            properties: MessageProperties {
                content_type: Some(encoded.content_type),
                format_indicator: Some(encoded.format_indicator as u8),
                correlation_data: None,
                response_topic: None,
                message_expiry_interval: Some(expiry),
                user_properties,
            },
        };

        // Hold the lock only across submission: wire order is fixed when
        // the session accepts the publish, and acknowledgement waits can
        // overlap.
        let completion = {
            let _guard = self.send_lock.lock().await;
            self.client.publish(publish).await?
        };
        completion.await
    }
}

/// Rounds a duration up to the next whole second.
fn round_up_to_seconds(duration: Duration) -> Duration {
    if duration.subsec_nanos() == 0 {
        duration
    } else {
        Duration::from_secs(duration.as_secs().saturating_add(1))
    }
}
