// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command invoker.
//!
//! Issues typed RPC requests: resolves the request topic, stamps protocol
//! headers, publishes with a correlation id, and waits for the matching
//! response, the deadline, or caller cancellation - whichever comes first.
//! Status codes on responses are decoded into the error taxonomy.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::application::ApplicationContext;
use crate::error::{Error, ErrorKind, Result};
use crate::headers::{
    PROTOCOL_VERSION, StatusCode, UserProperty, find_property, parse_supported_majors,
};
use crate::hlc::{HybridLogicalClock, SharedHybridLogicalClock};
use crate::payload::{EncodedPayload, PayloadCodec};
use crate::session::{
    InboundMessage, ManagedClient, MessageProperties, OutgoingPublish, QoS,
};
use crate::topic::{TOKEN_COMMAND_NAME, TOKEN_INVOKER_CLIENT_ID, TopicPattern};

/// Default invocation timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// A typed command request.
#[derive(Debug)]
pub struct CommandRequest<TReq> {
    payload: TReq,
    timeout: Duration,
    custom_user_data: Vec<(String, String)>,
    topic_tokens: HashMap<String, String>,
    cancellation: Option<CancellationToken>,
}

impl<TReq> CommandRequest<TReq> {
    /// Creates a builder carrying the given payload.
    #[must_use]
    pub fn builder(payload: TReq) -> CommandRequestBuilder<TReq> {
        CommandRequestBuilder {
            payload,
            timeout: DEFAULT_TIMEOUT,
            custom_user_data: Vec::new(),
            topic_tokens: HashMap::new(),
            cancellation: None,
        }
    }
}

/// Builder for [`CommandRequest`].
#[derive(Debug)]
pub struct CommandRequestBuilder<TReq> {
    payload: TReq,
    timeout: Duration,
    custom_user_data: Vec<(String, String)>,
    topic_tokens: HashMap<String, String>,
    cancellation: Option<CancellationToken>,
}

impl<TReq> CommandRequestBuilder<TReq> {
    /// Sets the invocation timeout (default: 10 seconds). This is both the
    /// client-side deadline and, rounded up to whole seconds, the MQTT
    /// message expiry of the request.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Adds a custom user property passed through to the executor.
    #[must_use]
    pub fn user_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_user_data.push((key.into(), value.into()));
        self
    }

    /// Adds a per-call topic token value, overriding the invoker-wide map.
    #[must_use]
    pub fn topic_token(mut self, token: impl Into<String>, value: impl Into<String>) -> Self {
        self.topic_tokens.insert(token.into(), value.into());
        self
    }

    /// Attaches a cancellation token that aborts the invocation.
    #[must_use]
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Builds the request.
    ///
    /// # Errors
    ///
    /// Returns a shallow error of kind `ConfigurationInvalid` if the
    /// timeout is zero, does not fit the u32 seconds wire range, or a
    /// custom user property uses a reserved `__` name.
    pub fn build(self) -> Result<CommandRequest<TReq>> {
        if self.timeout.is_zero() {
            return Err(Error::shallow(
                ErrorKind::ConfigurationInvalid,
                "invocation timeout must be greater than zero",
            )
            .with_property_name("timeout"));
        }
        if u32::try_from(timeout_to_expiry_secs(self.timeout)).is_err() {
            return Err(Error::shallow(
                ErrorKind::ConfigurationInvalid,
                "invocation timeout exceeds the u32 seconds wire representation",
            )
            .with_property_name("timeout"));
        }
        for (key, _) in &self.custom_user_data {
            if key.starts_with("__") {
                return Err(Error::shallow(
                    ErrorKind::ConfigurationInvalid,
                    format!("user property name {key:?} is reserved"),
                )
                .with_property_name(key.clone()));
            }
        }
        Ok(CommandRequest {
            payload: self.payload,
            timeout: self.timeout,
            custom_user_data: self.custom_user_data,
            topic_tokens: self.topic_tokens,
            cancellation: self.cancellation,
        })
    }
}

/// A typed command response.
#[derive(Debug)]
pub struct CommandResponse<TResp> {
    /// The decoded response payload.
    pub payload: TResp,
    /// Custom user properties set by the executor.
    pub user_properties: Vec<(String, String)>,
    /// The executor's clock stamp, already merged into the local clock.
    pub timestamp: Option<HybridLogicalClock>,
}

/// Options for a [`CommandInvoker`].
#[derive(Debug, Clone, Default)]
pub struct CommandInvokerOptions {
    /// Request topic pattern, e.g. `fleet/math/{executorId}/{commandName}`.
    pub request_topic_pattern: String,
    /// Optional namespace prepended to both request and response patterns.
    pub topic_namespace: Option<String>,
    /// Invoker-wide topic token values. `commandName` is bound from the
    /// declaration and `invokerClientId` from the session client id.
    pub topic_tokens: HashMap<String, String>,
    /// Explicit response topic pattern. When unset, the response topic is
    /// `<response_topic_prefix>/<request_topic_pattern>` with the prefix
    /// defaulting to `clients/{invokerClientId}`.
    pub response_topic_pattern: Option<String>,
    /// Prefix for the derived response topic pattern.
    pub response_topic_prefix: Option<String>,
    /// Suffix appended to the derived response topic pattern.
    pub response_topic_suffix: Option<String>,
}

struct PendingInvocation {
    tx: oneshot::Sender<InboundMessage>,
}

/// Issues typed commands through a session client.
pub struct CommandInvoker<TReq, TResp, C>
where
    C: ManagedClient,
{
    client: C,
    hlc: Arc<SharedHybridLogicalClock>,
    request_codec: Arc<dyn PayloadCodec<TReq>>,
    response_codec: Arc<dyn PayloadCodec<TResp>>,
    command_name: String,
    request_pattern: TopicPattern,
    response_pattern: TopicPattern,
    pending: Arc<Mutex<HashMap<Uuid, PendingInvocation>>>,
    /// Guards one-time response subscription setup.
    subscription: tokio::sync::Mutex<bool>,
    cancel: CancellationToken,
}

impl<TReq, TResp, C> CommandInvoker<TReq, TResp, C>
where
    TReq: Send + 'static,
    TResp: Send + 'static,
    C: ManagedClient,
{
    /// Creates an invoker for the declared command.
    ///
    /// # Errors
    ///
    /// Returns a shallow error of kind `ConfigurationInvalid` if a topic
    /// pattern is invalid or the declaration is inconsistent.
    pub fn new(
        context: &ApplicationContext,
        client: C,
        request_codec: Arc<dyn PayloadCodec<TReq>>,
        response_codec: Arc<dyn PayloadCodec<TResp>>,
        declaration: &super::CommandDeclaration,
        options: CommandInvokerOptions,
    ) -> Result<Self> {
        declaration.validate()?;

        let mut tokens = options.topic_tokens;
        tokens
            .entry(TOKEN_COMMAND_NAME.to_string())
            .or_insert_with(|| declaration.command_name.clone());
        tokens
            .entry(TOKEN_INVOKER_CLIENT_ID.to_string())
            .or_insert_with(|| client.client_id().to_string());

        let request_pattern = TopicPattern::new(
            &options.request_topic_pattern,
            options.topic_namespace.as_deref(),
            &tokens,
        )?;

        let response_pattern_string = match options.response_topic_pattern {
            Some(pattern) => pattern,
            None => {
                let prefix = options
                    .response_topic_prefix
                    .unwrap_or_else(|| "clients/{invokerClientId}".to_string());
                match options.response_topic_suffix {
                    Some(suffix) => {
                        format!("{prefix}/{}/{suffix}", options.request_topic_pattern)
                    }
                    None => format!("{prefix}/{}", options.request_topic_pattern),
                }
            }
        };
        let response_pattern = TopicPattern::new(
            &response_pattern_string,
            options.topic_namespace.as_deref(),
            &tokens,
        )?;

        Ok(Self {
            client,
            hlc: context.hlc().clone(),
            request_codec,
            response_codec,
            command_name: declaration.command_name.clone(),
            request_pattern,
            response_pattern,
            pending: Arc::new(Mutex::new(HashMap::new())),
            subscription: tokio::sync::Mutex::new(false),
            cancel: CancellationToken::new(),
        })
    }

    /// Invokes the command and waits for its response.
    ///
    /// Configuration problems (unresolved tokens, serialization failures)
    /// are raised as shallow errors before any network I/O. Remote
    /// failures are decoded from the response status code; see
    /// [`ErrorKind`] for the taxonomy.
    ///
    /// # Errors
    ///
    /// - `ConfigurationInvalid` / `PayloadInvalid` (shallow) before publish
    /// - `Timeout` when no response arrives within the request timeout
    /// - `Cancelled` when the caller's cancellation token fires
    /// - remote kinds (`HeaderMissing`, `HeaderInvalid`, `Timeout`,
    ///   `PayloadInvalid`, `UnknownError`, `ExecutionError`,
    ///   `StateInvalid`, `UnsupportedVersion`) decoded from the response
    pub async fn invoke(&self, request: CommandRequest<TReq>) -> Result<CommandResponse<TResp>> {
        // Shallow phase: everything that can fail before I/O.
        let encoded = self
            .request_codec
            .encode(&request.payload)
            .map_err(Error::mark_shallow)?;
        let request_topic = self.request_pattern.publish_topic(&request.topic_tokens)?;
        let response_topic = self.response_pattern.publish_topic(&request.topic_tokens)?;

        self.ensure_subscribed().await?;

        let correlation = Uuid::new_v4();
        let timestamp = self.hlc.update()?;

        let mut user_properties = request.custom_user_data;
        user_properties.push((UserProperty::Timestamp.to_string(), timestamp.to_string()));
        user_properties.push((
            UserProperty::ProtocolVersion.to_string(),
            PROTOCOL_VERSION.to_string(),
        ));
        user_properties.push((
            UserProperty::SourceId.to_string(),
            self.client.client_id().to_string(),
        ));

        // Validated in the request builder.
        #[allow(clippy::cast_possible_truncation)]
        let expiry = timeout_to_expiry_secs(request.timeout) as u32;

        let publish = OutgoingPublish {
            topic: request_topic,
            qos: QoS::AtLeastOnce,
            retain: false,
            payload: encoded.payload,
            properties: MessageProperties {
                content_type: Some(encoded.content_type),
                format_indicator: Some(encoded.format_indicator as u8),
                correlation_data: Some(correlation.as_bytes().to_vec()),
                response_topic: Some(response_topic),
                message_expiry_interval: Some(expiry),
                user_properties,
            },
        };

        // Record the correlation before publishing so a fast response
        // cannot race past us.
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .insert(correlation, PendingInvocation { tx });
        let deadline = tokio::time::Instant::now() + request.timeout;

        tracing::debug!(
            command = %self.command_name,
            correlation = %correlation,
            topic = %publish.topic,
            "Invoking command"
        );

        let outcome = self
            .wait_for_response(publish, rx, deadline, request.cancellation)
            .await;
        // Whatever happened, the correlation record is gone now.
        self.pending.lock().remove(&correlation);

        let message = outcome?;
        self.process_response(message)
    }

    /// Publishes the request and waits for response, deadline, or
    /// cancellation.
    async fn wait_for_response(
        &self,
        publish: OutgoingPublish,
        rx: oneshot::Receiver<InboundMessage>,
        deadline: tokio::time::Instant,
        cancellation: Option<CancellationToken>,
    ) -> Result<InboundMessage> {
        let cancellation = cancellation.unwrap_or_default();

        // Submission fixes the request's position in the wire order and
        // yields the acknowledgement future.
        let completion = tokio::select! {
            biased;
            () = cancellation.cancelled() => {
                return Err(Error::new(
                    ErrorKind::Cancelled,
                    "invocation cancelled before publish",
                ));
            }
            result = self.client.publish(publish) => result?,
        };

        // Drive the puback concurrently with the response wait: the puback
        // future must be polled to surface publish failures, but a fast
        // executor may answer before the puback is observed.
        let mut completion = completion;
        let mut rx = rx;
        let mut publish_acknowledged = false;
        loop {
            tokio::select! {
                () = cancellation.cancelled() => {
                    return Err(Error::new(ErrorKind::Cancelled, "invocation cancelled"));
                }
                () = tokio::time::sleep_until(deadline) => {
                    return Err(Error::new(
                        ErrorKind::Timeout,
                        "command timed out waiting for a response",
                    ));
                }
                puback = &mut completion, if !publish_acknowledged => {
                    puback?;
                    publish_acknowledged = true;
                }
                message = &mut rx => {
                    return message.map_err(|_| {
                        Error::new(
                            ErrorKind::StateInvalid,
                            "invocation abandoned by the session",
                        )
                    });
                }
            }
        }
    }

    /// Decodes a correlated response message into a typed response or a
    /// taxonomy error.
    fn process_response(&self, message: InboundMessage) -> Result<CommandResponse<TResp>> {
        let properties = message.properties;

        // Merge the executor's clock stamp first.
        let timestamp =
            match find_property(&properties.user_properties, UserProperty::Timestamp) {
                Some(raw) => {
                    let peer = HybridLogicalClock::from_str(raw)
                        .map_err(|e| e.with_header_name(UserProperty::Timestamp.name()))?;
                    self.hlc.update_with(&peer)?;
                    Some(peer)
                }
                None => None,
            };

        let raw_status = find_property(&properties.user_properties, UserProperty::Status)
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::HeaderMissing,
                    "response carries no status header",
                )
                .with_header_name(UserProperty::Status.name())
            })?;
        let status_value: u16 = raw_status.parse().map_err(|_| {
            Error::new(
                ErrorKind::HeaderInvalid,
                format!("response status {raw_status:?} is not an integer"),
            )
            .with_header_name(UserProperty::Status.name())
        })?;

        let status_message =
            find_property(&properties.user_properties, UserProperty::StatusMessage)
                .map(ToString::to_string);

        let Some(status) = StatusCode::from_value(status_value) else {
            return Err(Error::remote(
                ErrorKind::UnknownError,
                status_message
                    .unwrap_or_else(|| format!("executor returned status {status_value}")),
            ));
        };

        if status.is_success() {
            let encoded = EncodedPayload {
                payload: message.payload,
                content_type: properties.content_type.unwrap_or_default(),
                format_indicator: properties
                    .format_indicator
                    .unwrap_or_default()
                    .try_into()
                    .unwrap_or_default(),
            };
            let payload = self.response_codec.decode(&encoded)?;
            let user_properties = properties
                .user_properties
                .into_iter()
                .filter(|(k, _)| !k.starts_with("__"))
                .collect();
            return Ok(CommandResponse {
                payload,
                user_properties,
                timestamp,
            });
        }

        let property_name =
            find_property(&properties.user_properties, UserProperty::PropertyName)
                .map(ToString::to_string);
        let property_value =
            find_property(&properties.user_properties, UserProperty::PropertyValue)
                .map(ToString::to_string);
        let message_text = status_message
            .unwrap_or_else(|| format!("executor reported status {status_value}"));

        let mut error = match status {
            StatusCode::BadRequest => {
                let kind = if property_value.is_some() {
                    ErrorKind::HeaderInvalid
                } else {
                    ErrorKind::HeaderMissing
                };
                let mut error = Error::remote(kind, message_text);
                if let Some(name) = &property_name {
                    error = error.with_header_name(name.clone());
                }
                error
            }
            StatusCode::RequestTimeout => Error::remote(ErrorKind::Timeout, message_text),
            StatusCode::UnprocessableContent => {
                let is_application_error = find_property(
                    &properties.user_properties,
                    UserProperty::IsApplicationError,
                )
                .is_some_and(|v| v.eq_ignore_ascii_case("true"));
                if is_application_error {
                    Error::remote(ErrorKind::UnknownError, message_text)
                } else {
                    Error::remote(ErrorKind::PayloadInvalid, message_text)
                }
            }
            StatusCode::InternalServerError => {
                Error::remote(ErrorKind::ExecutionError, message_text)
            }
            StatusCode::ServiceUnavailable => Error::remote(ErrorKind::StateInvalid, message_text),
            StatusCode::VersionNotSupported => {
                let mut error = Error::remote(ErrorKind::UnsupportedVersion, message_text);
                if let Some(requested) = find_property(
                    &properties.user_properties,
                    UserProperty::RequestProtocolVersion,
                ) {
                    error = error.with_protocol_version(requested.to_string());
                }
                if let Some(supported) = find_property(
                    &properties.user_properties,
                    UserProperty::SupportedMajorVersions,
                ) {
                    error =
                        error.with_supported_major_versions(parse_supported_majors(supported));
                }
                error
            }
            StatusCode::Ok | StatusCode::NoContent => unreachable!("handled above"),
        };

        if let Some(name) = property_name {
            if error.header_name().is_none() {
                error = error.with_property_name(name);
            }
        }
        if let Some(value) = property_value {
            error = error.with_property_value(crate::error::Value::String(value));
        }
        Err(error)
    }

    /// Subscribes to the response filter and starts the response router on
    /// first use.
    async fn ensure_subscribed(&self) -> Result<()> {
        let mut subscribed = self.subscription.lock().await;
        if *subscribed {
            return Ok(());
        }

        let filter = self.response_pattern.subscribe_filter();
        let stream = self.client.filtered_messages(&filter);
        self.client.subscribe(&filter, QoS::AtLeastOnce).await?;
        tracing::debug!(command = %self.command_name, filter = %filter, "Response subscription established");

        tokio::spawn(route_responses(
            stream,
            self.pending.clone(),
            self.cancel.clone(),
        ));
        *subscribed = true;
        Ok(())
    }

    /// Stops the response router and unsubscribes.
    ///
    /// # Errors
    ///
    /// Returns any error from the underlying unsubscribe.
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        let mut subscribed = self.subscription.lock().await;
        if *subscribed {
            self.client
                .unsubscribe(&self.response_pattern.subscribe_filter())
                .await?;
            *subscribed = false;
        }
        Ok(())
    }

}

impl<TReq, TResp, C> Drop for CommandInvoker<TReq, TResp, C>
where
    C: ManagedClient,
{
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Routes inbound response messages to their pending invocations.
///
/// Unknown correlations (late responses whose invocation timed out or was
/// cancelled) are acknowledged and dropped.
async fn route_responses(
    mut stream: crate::session::MessageStream,
    pending: Arc<Mutex<HashMap<Uuid, PendingInvocation>>>,
    cancel: CancellationToken,
) {
    let mut late_responses: u64 = 0;
    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => break,
            message = stream.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        // Responses are acknowledged here: they never need broker
        // redelivery once routed (or once known to be unroutable).
        let mut message = message;
        if let Some(ack) = message.ack.take() {
            ack.complete();
        }

        let correlation = message
            .properties
            .correlation_data
            .as_deref()
            .and_then(|bytes| Uuid::from_slice(bytes).ok());

        let Some(correlation) = correlation else {
            tracing::debug!(topic = %message.topic, "Dropping response without correlation data");
            continue;
        };

        match pending.lock().remove(&correlation) {
            Some(invocation) => {
                let _ = invocation.tx.send(message);
            }
            None => {
                late_responses += 1;
                tracing::debug!(
                    correlation = %correlation,
                    total = late_responses,
                    "Dropping late response with no pending invocation"
                );
            }
        }
    }
}

fn timeout_to_expiry_secs(timeout: Duration) -> u64 {
    let secs = timeout.as_secs();
    let rounded = if timeout.subsec_nanos() == 0 {
        secs
    } else {
        secs.saturating_add(1)
    };
    rounded.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_is_ceiled_with_floor_one() {
        assert_eq!(timeout_to_expiry_secs(Duration::from_millis(1)), 1);
        assert_eq!(timeout_to_expiry_secs(Duration::from_millis(999)), 1);
        assert_eq!(timeout_to_expiry_secs(Duration::from_millis(1001)), 2);
        assert_eq!(timeout_to_expiry_secs(Duration::from_secs(5)), 5);
    }

    #[test]
    fn request_builder_validates_timeout() {
        let err = CommandRequest::builder(())
            .timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationInvalid);
        assert!(err.is_shallow());
        assert_eq!(err.property_name(), Some("timeout"));
    }

    #[test]
    fn request_builder_rejects_reserved_user_data() {
        let err = CommandRequest::builder(())
            .user_data("__srcId", "spoof")
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationInvalid);
    }

    #[test]
    fn request_builder_defaults() {
        let request = CommandRequest::builder(42u32).build().unwrap();
        assert_eq!(request.timeout, DEFAULT_TIMEOUT);
        assert!(request.custom_user_data.is_empty());
        assert!(request.cancellation.is_none());
    }
}
