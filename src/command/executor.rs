// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command executor.
//!
//! Serves typed RPC requests: validates protocol headers, deduplicates
//! retried requests, dispatches the application handler with a
//! cancellation derived from the request's remaining expiry, publishes the
//! typed response to the invoker's response topic, and caches responses of
//! idempotent commands for replay.
//!
//! Handlers run bounded by `dispatch_concurrency`, started in
//! message-received order. A handler that panics is caught; the executor
//! publishes a generic execution-error response and keeps serving.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::application::ApplicationContext;
use crate::command::CommandDeclaration;
use crate::command::cache::{BeginOutcome, DedupKey, ResponseCache, run_evictor};
use crate::error::{Error, ErrorKind, Result};
use crate::headers::{
    PROTOCOL_VERSION, ProtocolVersion, SUPPORTED_PROTOCOL_MAJOR_VERSIONS, StatusCode,
    UserProperty, find_property, format_supported_majors,
};
use crate::hlc::{HybridLogicalClock, SharedHybridLogicalClock};
use crate::payload::{EncodedPayload, PayloadCodec};
use crate::session::{
    AckToken, InboundMessage, ManagedClient, MessageProperties, MessageStream, OutgoingPublish,
    QoS,
};
use crate::topic::{TOKEN_COMMAND_NAME, TOKEN_EXECUTOR_ID, TopicPattern};

/// Default bound on concurrently running handlers.
const DEFAULT_DISPATCH_CONCURRENCY: usize = 10;

/// A decoded request handed to the application handler.
#[derive(Debug)]
pub struct IncomingRequest<TReq> {
    /// The decoded request payload.
    pub payload: TReq,
    /// Client id of the invoker, from the `__srcId` header.
    pub invoker_id: String,
    /// Correlation id of this request.
    pub correlation_id: Uuid,
    /// The invoker's clock stamp, already merged into the local clock.
    pub timestamp: Option<HybridLogicalClock>,
    /// Custom user properties set by the invoker.
    pub user_properties: Vec<(String, String)>,
    /// Token values captured from the request topic.
    pub topic_tokens: HashMap<String, String>,
}

/// Failure reported by an application handler.
#[derive(Debug)]
pub enum HandlerError {
    /// A domain-level error the invoker's application should interpret.
    /// Serialized into the response body with status 422.
    Application {
        /// The encoded error body, produced by the application's declared
        /// error schema.
        payload: EncodedPayload,
    },
    /// An infrastructure failure; reported with status 500.
    Execution {
        /// Human readable description.
        message: String,
    },
}

impl HandlerError {
    /// Creates an application error carrying an encoded error body.
    #[must_use]
    pub fn application(payload: EncodedPayload) -> Self {
        Self::Application { payload }
    }

    /// Creates an execution (infrastructure) error.
    #[must_use]
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }
}

/// A typed response produced by the application handler.
#[derive(Debug)]
pub struct OutgoingResponse<TResp> {
    payload: TResp,
    custom_user_data: Vec<(String, String)>,
}

impl<TResp> OutgoingResponse<TResp> {
    /// Creates a response with the given payload.
    #[must_use]
    pub fn new(payload: TResp) -> Self {
        Self {
            payload,
            custom_user_data: Vec::new(),
        }
    }

    /// Adds a custom user property passed through to the invoker.
    /// Reserved (`__` prefixed) names are dropped at publish time.
    #[must_use]
    pub fn user_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_user_data.push((key.into(), value.into()));
        self
    }
}

/// Options for a [`CommandExecutor`].
#[derive(Debug, Clone)]
pub struct CommandExecutorOptions {
    /// Request topic pattern, e.g. `fleet/math/{executorId}/{commandName}`.
    pub request_topic_pattern: String,
    /// Optional namespace prepended to the pattern.
    pub topic_namespace: Option<String>,
    /// Executor-wide topic token values. `commandName` is bound from the
    /// declaration and `executorId` from the session client id.
    pub topic_tokens: HashMap<String, String>,
    /// Bound on concurrently running handlers (default: 10).
    pub dispatch_concurrency: usize,
    /// Bound on requests waiting for a handler slot. `None` (the default)
    /// means unbounded; when the bound is exceeded, surplus requests are
    /// answered with status 503.
    pub pending_request_capacity: Option<usize>,
}

impl Default for CommandExecutorOptions {
    fn default() -> Self {
        Self {
            request_topic_pattern: String::new(),
            topic_namespace: None,
            topic_tokens: HashMap::new(),
            dispatch_concurrency: DEFAULT_DISPATCH_CONCURRENCY,
            pending_request_capacity: None,
        }
    }
}

type CommandHandler<TReq, TResp> = Arc<
    dyn Fn(
            IncomingRequest<TReq>,
            CancellationToken,
        )
            -> Pin<Box<dyn Future<Output = std::result::Result<OutgoingResponse<TResp>, HandlerError>> + Send>>
        + Send
        + Sync,
>;

/// State shared by the executor's dispatch tasks.
struct ExecutorShared<TReq, TResp, C>
where
    C: ManagedClient,
{
    client: C,
    hlc: Arc<SharedHybridLogicalClock>,
    request_codec: Arc<dyn PayloadCodec<TReq>>,
    response_codec: Arc<dyn PayloadCodec<TResp>>,
    declaration: CommandDeclaration,
    pattern: TopicPattern,
    cache: Arc<ResponseCache>,
}

/// Serves typed commands through a session client.
pub struct CommandExecutor<TReq, TResp, C>
where
    C: ManagedClient,
{
    shared: Arc<ExecutorShared<TReq, TResp, C>>,
    dispatch_concurrency: usize,
    pending_request_capacity: Option<usize>,
    cancel: CancellationToken,
    started: parking_lot::Mutex<bool>,
}

impl<TReq, TResp, C> CommandExecutor<TReq, TResp, C>
where
    TReq: Send + 'static,
    TResp: Send + 'static,
    C: ManagedClient,
{
    /// Creates an executor for the declared command.
    ///
    /// # Errors
    ///
    /// Returns a shallow error of kind `ConfigurationInvalid` if the topic
    /// pattern is invalid, the dispatch concurrency is zero, or the
    /// declaration is inconsistent.
    pub fn new(
        context: &ApplicationContext,
        client: C,
        request_codec: Arc<dyn PayloadCodec<TReq>>,
        response_codec: Arc<dyn PayloadCodec<TResp>>,
        declaration: CommandDeclaration,
        options: CommandExecutorOptions,
    ) -> Result<Self> {
        declaration.validate()?;
        if options.dispatch_concurrency == 0 {
            return Err(Error::shallow(
                ErrorKind::ConfigurationInvalid,
                "dispatch concurrency must be at least 1",
            )
            .with_property_name("dispatch_concurrency"));
        }

        let mut tokens = options.topic_tokens;
        tokens
            .entry(TOKEN_COMMAND_NAME.to_string())
            .or_insert_with(|| declaration.command_name.clone());
        tokens
            .entry(TOKEN_EXECUTOR_ID.to_string())
            .or_insert_with(|| client.client_id().to_string());

        let pattern = TopicPattern::new(
            &options.request_topic_pattern,
            options.topic_namespace.as_deref(),
            &tokens,
        )?;

        Ok(Self {
            shared: Arc::new(ExecutorShared {
                client,
                hlc: context.hlc().clone(),
                request_codec,
                response_codec,
                declaration,
                pattern,
                cache: Arc::new(ResponseCache::default()),
            }),
            dispatch_concurrency: options.dispatch_concurrency,
            pending_request_capacity: options.pending_request_capacity,
            cancel: CancellationToken::new(),
            started: parking_lot::Mutex::new(false),
        })
    }

    /// Subscribes to the request filter and starts serving with `handler`.
    ///
    /// # Errors
    ///
    /// Returns an error of kind `StateInvalid` if the executor was already
    /// started, or any error from the underlying subscribe.
    pub async fn start<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(IncomingRequest<TReq>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<OutgoingResponse<TResp>, HandlerError>>
            + Send
            + 'static,
    {
        {
            let mut started = self.started.lock();
            if *started {
                return Err(Error::new(
                    ErrorKind::StateInvalid,
                    "command executor is already started",
                ));
            }
            *started = true;
        }

        let filter = self.shared.pattern.subscribe_filter();
        let stream = self.shared.client.filtered_messages(&filter);
        self.shared.client.subscribe(&filter, QoS::AtLeastOnce).await?;
        tracing::debug!(
            command = %self.shared.declaration.command_name,
            filter = %filter,
            "Command executor subscribed"
        );

        let handler: CommandHandler<TReq, TResp> =
            Arc::new(move |request, cancellation| Box::pin(handler(request, cancellation)));

        tokio::spawn(run_executor(
            self.shared.clone(),
            stream,
            handler,
            self.dispatch_concurrency,
            self.pending_request_capacity,
            self.cancel.clone(),
        ));
        Ok(())
    }

    /// Stops serving and unsubscribes.
    ///
    /// Handlers already running are allowed to finish; their responses are
    /// still published.
    ///
    /// # Errors
    ///
    /// Returns any error from the underlying unsubscribe.
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        let filter = self.shared.pattern.subscribe_filter();
        self.shared.client.unsubscribe(&filter).await?;
        tracing::debug!(
            command = %self.shared.declaration.command_name,
            "Command executor shut down"
        );
        Ok(())
    }
}

/// Receive loop: enforces the pending-request bound, then feeds the
/// dispatch loop which starts handlers in received order.
async fn run_executor<TReq, TResp, C>(
    shared: Arc<ExecutorShared<TReq, TResp, C>>,
    mut stream: MessageStream,
    handler: CommandHandler<TReq, TResp>,
    dispatch_concurrency: usize,
    pending_request_capacity: Option<usize>,
    cancel: CancellationToken,
) where
    TReq: Send + 'static,
    TResp: Send + 'static,
    C: ManagedClient,
{
    tokio::spawn(run_evictor(shared.cache.clone(), cancel.clone()));

    let semaphore = Arc::new(Semaphore::new(dispatch_concurrency));
    let queue_depth = Arc::new(AtomicUsize::new(0));
    let (work_tx, mut work_rx) = mpsc::unbounded_channel::<InboundMessage>();

    // Dispatch loop: acquires a handler slot in FIFO order.
    let dispatch = {
        let shared = shared.clone();
        let handler = handler.clone();
        let semaphore = semaphore.clone();
        let queue_depth = queue_depth.clone();
        let cancel = cancel.clone();
        async move {
            loop {
                let message = tokio::select! {
                    () = cancel.cancelled() => break,
                    message = work_rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                queue_depth.fetch_sub(1, Ordering::SeqCst);
                let shared = shared.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    process_request(&shared, &handler, message).await;
                    drop(permit);
                });
            }
        }
    };
    tokio::spawn(dispatch);

    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => break,
            message = stream.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let over_capacity = pending_request_capacity
            .is_some_and(|capacity| queue_depth.load(Ordering::SeqCst) >= capacity);
        if over_capacity {
            tracing::warn!(
                command = %shared.declaration.command_name,
                "Pending request queue is full; rejecting request"
            );
            let shared = shared.clone();
            tokio::spawn(async move {
                respond_overloaded(&shared, message).await;
            });
            continue;
        }

        queue_depth.fetch_add(1, Ordering::SeqCst);
        if work_tx.send(message).is_err() {
            break;
        }
    }
}

/// Handles one request end to end.
async fn process_request<TReq, TResp, C>(
    shared: &ExecutorShared<TReq, TResp, C>,
    handler: &CommandHandler<TReq, TResp>,
    message: InboundMessage,
) where
    TReq: Send + 'static,
    TResp: Send + 'static,
    C: ManagedClient,
{
    let InboundMessage {
        topic,
        payload,
        properties,
        ack,
        ..
    } = message;

    // Without a response topic there is no way to answer; drop the
    // request rather than let it redeliver forever.
    let Some(response_topic) = properties
        .response_topic
        .clone()
        .filter(|t| !t.is_empty() && !t.contains(['+', '#']))
    else {
        tracing::warn!(topic = %topic, "Request carries no usable response topic; dropping");
        complete_ack(ack);
        return;
    };

    let correlation_data = properties.correlation_data.clone();
    let request_expiry = properties.message_expiry_interval;

    let Some(correlation) = correlation_data
        .as_deref()
        .and_then(|bytes| Uuid::from_slice(bytes).ok())
    else {
        respond_error(
            shared,
            &response_topic,
            correlation_data,
            request_expiry,
            StatusCode::BadRequest,
            Some("request correlation data is missing or not 16 bytes".to_string()),
            vec![(
                UserProperty::PropertyName.to_string(),
                "CorrelationData".to_string(),
            )],
        )
        .await;
        complete_ack(ack);
        return;
    };

    // Protocol version gate.
    let raw_version = find_property(&properties.user_properties, UserProperty::ProtocolVersion)
        .unwrap_or(PROTOCOL_VERSION)
        .to_string();
    let version_ok = ProtocolVersion::from_str(&raw_version)
        .map(|v| v.is_supported(SUPPORTED_PROTOCOL_MAJOR_VERSIONS))
        .unwrap_or(false);
    if !version_ok {
        respond_error(
            shared,
            &response_topic,
            correlation_data,
            request_expiry,
            StatusCode::VersionNotSupported,
            Some(format!(
                "request protocol version {raw_version:?} is not supported"
            )),
            vec![
                (
                    UserProperty::SupportedMajorVersions.to_string(),
                    format_supported_majors(SUPPORTED_PROTOCOL_MAJOR_VERSIONS),
                ),
                (
                    UserProperty::RequestProtocolVersion.to_string(),
                    raw_version,
                ),
            ],
        )
        .await;
        complete_ack(ack);
        return;
    }

    // Required headers.
    let Some(invoker_id) = find_property(&properties.user_properties, UserProperty::SourceId)
        .map(ToString::to_string)
    else {
        respond_error(
            shared,
            &response_topic,
            correlation_data,
            request_expiry,
            StatusCode::BadRequest,
            Some("request is missing the source id header".to_string()),
            vec![(
                UserProperty::PropertyName.to_string(),
                UserProperty::SourceId.to_string(),
            )],
        )
        .await;
        complete_ack(ack);
        return;
    };

    // Timestamp: optional, but must parse and merge when present.
    let timestamp = match find_property(&properties.user_properties, UserProperty::Timestamp) {
        Some(raw) => match HybridLogicalClock::from_str(raw)
            .and_then(|peer| shared.hlc.update_with(&peer).map(|_| peer))
        {
            Ok(peer) => Some(peer),
            Err(e) => {
                respond_error(
                    shared,
                    &response_topic,
                    correlation_data,
                    request_expiry,
                    StatusCode::BadRequest,
                    Some(e.to_string()),
                    vec![
                        (
                            UserProperty::PropertyName.to_string(),
                            UserProperty::Timestamp.to_string(),
                        ),
                        (UserProperty::PropertyValue.to_string(), raw.to_string()),
                    ],
                )
                .await;
                complete_ack(ack);
                return;
            }
        },
        None => None,
    };

    // A request whose expiry has run down to nothing is answered with a
    // timeout rather than dispatched.
    if request_expiry == Some(0) {
        respond_error(
            shared,
            &response_topic,
            correlation_data,
            request_expiry,
            StatusCode::RequestTimeout,
            Some("request expired before dispatch".to_string()),
            Vec::new(),
        )
        .await;
        complete_ack(ack);
        return;
    }

    // Deduplication.
    let key = DedupKey {
        invoker_id: invoker_id.clone(),
        correlation,
    };
    loop {
        match shared.cache.begin(&key) {
            BeginOutcome::Started => break,
            BeginOutcome::Cached(mut cached) => {
                tracing::debug!(
                    correlation = %correlation,
                    invoker = %invoker_id,
                    "Replaying cached response for duplicate request"
                );
                cached.topic = response_topic.clone();
                publish_response(shared, cached).await;
                complete_ack(ack);
                return;
            }
            BeginOutcome::InFlight => {
                if shared.declaration.idempotent {
                    // A second request for the key waits for the first
                    // attempt to finish, then resolves from cache.
                    shared.cache.wait_not_in_flight(&key).await;
                } else {
                    respond_error(
                        shared,
                        &response_topic,
                        correlation_data,
                        request_expiry,
                        StatusCode::ServiceUnavailable,
                        Some(
                            "another request with this correlation id is already executing"
                                .to_string(),
                        ),
                        Vec::new(),
                    )
                    .await;
                    complete_ack(ack);
                    return;
                }
            }
        }
    }
    // The in-flight marker is now owned by this task; every path below
    // must complete it exactly once.

    // Decode the request payload.
    let encoded_request = EncodedPayload {
        payload,
        content_type: properties.content_type.clone().unwrap_or_default(),
        format_indicator: properties
            .format_indicator
            .unwrap_or_default()
            .try_into()
            .unwrap_or_default(),
    };
    let request_payload = match shared.request_codec.decode(&encoded_request) {
        Ok(payload) => payload,
        Err(e) => {
            shared.cache.complete(&key, None);
            respond_error(
                shared,
                &response_topic,
                correlation_data,
                request_expiry,
                StatusCode::UnprocessableContent,
                Some(e.to_string()),
                vec![(
                    UserProperty::IsApplicationError.to_string(),
                    "false".to_string(),
                )],
            )
            .await;
            complete_ack(ack);
            return;
        }
    };

    let incoming = IncomingRequest {
        payload: request_payload,
        invoker_id: invoker_id.clone(),
        correlation_id: correlation,
        timestamp,
        user_properties: properties
            .user_properties
            .iter()
            .filter(|(k, _)| !k.starts_with("__"))
            .cloned()
            .collect(),
        topic_tokens: shared.pattern.match_topic(&topic).unwrap_or_default(),
    };

    // The handler observes cancellation when the request's remaining
    // lifetime runs out.
    let handler_cancel = CancellationToken::new();
    let expiry_guard = request_expiry.map(|secs| {
        let cancel = handler_cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(u64::from(secs))).await;
            cancel.cancel();
        })
    });

    // Run the handler in its own task so a panic is contained.
    let handler_future = handler(incoming, handler_cancel.clone());
    let handler_result = tokio::spawn(handler_future).await;
    if let Some(guard) = expiry_guard {
        guard.abort();
    }

    let response = match handler_result {
        Ok(Ok(response)) => match shared.response_codec.encode(&response.payload) {
            Ok(encoded) => {
                let status = if encoded.is_empty() {
                    StatusCode::NoContent
                } else {
                    StatusCode::Ok
                };
                build_response(
                    shared,
                    &response_topic,
                    correlation_data,
                    request_expiry,
                    status,
                    encoded,
                    None,
                    sanitize_user_data(response.custom_user_data),
                )
            }
            Err(e) => {
                tracing::error!(error = %e, "Response payload serialization failed");
                build_response(
                    shared,
                    &response_topic,
                    correlation_data,
                    request_expiry,
                    StatusCode::InternalServerError,
                    EncodedPayload::empty(),
                    Some(format!("response serialization failed: {e}")),
                    Vec::new(),
                )
            }
        },
        Ok(Err(HandlerError::Application { payload })) => build_response(
            shared,
            &response_topic,
            correlation_data,
            request_expiry,
            StatusCode::UnprocessableContent,
            payload,
            None,
            vec![(
                UserProperty::IsApplicationError.to_string(),
                "true".to_string(),
            )],
        ),
        Ok(Err(HandlerError::Execution { message })) => build_response(
            shared,
            &response_topic,
            correlation_data,
            request_expiry,
            StatusCode::InternalServerError,
            EncodedPayload::empty(),
            Some(message),
            Vec::new(),
        ),
        Err(join_error) => {
            tracing::error!(error = %join_error, "Command handler panicked");
            build_response(
                shared,
                &response_topic,
                correlation_data,
                request_expiry,
                StatusCode::InternalServerError,
                EncodedPayload::empty(),
                Some("command handler panicked".to_string()),
                Vec::new(),
            )
        }
    };

    publish_response(shared, response.clone()).await;

    let cache_entry = if shared.declaration.idempotent
        && !shared.declaration.cache_ttl.is_zero()
    {
        Some((response, shared.declaration.cache_ttl))
    } else {
        None
    };
    shared.cache.complete(&key, cache_entry);

    complete_ack(ack);
}

/// Publishes a pre-handler error response and acknowledges the request.
async fn respond_error<TReq, TResp, C>(
    shared: &ExecutorShared<TReq, TResp, C>,
    response_topic: &str,
    correlation_data: Option<Vec<u8>>,
    request_expiry: Option<u32>,
    status: StatusCode,
    status_message: Option<String>,
    extra_properties: Vec<(String, String)>,
) where
    C: ManagedClient,
{
    let response = build_response(
        shared,
        response_topic,
        correlation_data,
        request_expiry,
        status,
        EncodedPayload::empty(),
        status_message,
        extra_properties,
    );
    publish_response(shared, response).await;
}

/// Assembles a response publish with protocol headers.
#[allow(clippy::too_many_arguments)]
fn build_response<TReq, TResp, C>(
    shared: &ExecutorShared<TReq, TResp, C>,
    response_topic: &str,
    correlation_data: Option<Vec<u8>>,
    request_expiry: Option<u32>,
    status: StatusCode,
    encoded: EncodedPayload,
    status_message: Option<String>,
    extra_properties: Vec<(String, String)>,
) -> OutgoingPublish
where
    C: ManagedClient,
{
    let mut user_properties = extra_properties;
    user_properties.push((
        UserProperty::Status.to_string(),
        status.value().to_string(),
    ));
    user_properties.push((
        UserProperty::ProtocolVersion.to_string(),
        PROTOCOL_VERSION.to_string(),
    ));
    if let Some(message) = status_message {
        user_properties.push((UserProperty::StatusMessage.to_string(), message));
    }
    // Best effort: a drifted clock must not prevent an error response.
    if let Ok(stamp) = shared.hlc.update() {
        user_properties.push((UserProperty::Timestamp.to_string(), stamp.to_string()));
    }

    let content_type = if encoded.content_type.is_empty() {
        None
    } else {
        Some(encoded.content_type.clone())
    };

    OutgoingPublish {
        topic: response_topic.to_string(),
        qos: QoS::AtLeastOnce,
        retain: false,
        payload: encoded.payload,
        properties: MessageProperties {
            content_type,
            format_indicator: Some(encoded.format_indicator as u8),
            correlation_data,
            response_topic: None,
            message_expiry_interval: request_expiry,
            user_properties,
        },
    }
}

/// Publishes a response, logging failures; the invoker's timeout covers
/// any loss.
async fn publish_response<TReq, TResp, C>(
    shared: &ExecutorShared<TReq, TResp, C>,
    response: OutgoingPublish,
) where
    C: ManagedClient,
{
    let topic = response.topic.clone();
    match shared.client.publish(response).await {
        Ok(completion) => {
            if let Err(e) = completion.await {
                tracing::warn!(topic = %topic, error = %e, "Response publish was not acknowledged");
            }
        }
        Err(e) => {
            tracing::warn!(topic = %topic, error = %e, "Response publish failed");
        }
    }
}

/// Answers a request with 503 when the pending queue is over capacity.
async fn respond_overloaded<TReq, TResp, C>(
    shared: &ExecutorShared<TReq, TResp, C>,
    message: InboundMessage,
) where
    C: ManagedClient,
{
    let properties = &message.properties;
    if let Some(response_topic) = properties
        .response_topic
        .clone()
        .filter(|t| !t.is_empty() && !t.contains(['+', '#']))
    {
        respond_error(
            shared,
            &response_topic,
            properties.correlation_data.clone(),
            properties.message_expiry_interval,
            StatusCode::ServiceUnavailable,
            Some("executor request queue is full".to_string()),
            Vec::new(),
        )
        .await;
    }
    complete_ack(message.ack);
}

fn complete_ack(ack: Option<AckToken>) {
    if let Some(ack) = ack {
        ack.complete();
    }
}

/// Drops reserved user properties from handler-supplied response data.
fn sanitize_user_data(data: Vec<(String, String)>) -> Vec<(String, String)> {
    data.into_iter()
        .filter(|(k, _)| {
            let reserved = k.starts_with("__");
            if reserved {
                tracing::warn!(key = %k, "Dropping reserved user property from response");
            }
            !reserved
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_error_constructors() {
        let app = HandlerError::application(EncodedPayload {
            payload: b"{}".to_vec(),
            content_type: "application/json".to_string(),
            format_indicator: crate::payload::FormatIndicator::Utf8EncodedCharacterData,
        });
        assert!(matches!(app, HandlerError::Application { .. }));

        let exec = HandlerError::execution("backend down");
        match exec {
            HandlerError::Execution { message } => assert_eq!(message, "backend down"),
            HandlerError::Application { .. } => panic!("wrong variant"),
        }
    }

    #[test]
    fn outgoing_response_collects_user_data() {
        let response = OutgoingResponse::new(7u32)
            .user_data("traceparent", "00-abc-def-01")
            .user_data("region", "eu");
        assert_eq!(response.custom_user_data.len(), 2);
    }

    #[test]
    fn sanitize_drops_reserved_keys() {
        let data = vec![
            ("__stat".to_string(), "999".to_string()),
            ("ok".to_string(), "1".to_string()),
        ];
        let sanitized = sanitize_user_data(data);
        assert_eq!(sanitized, vec![("ok".to_string(), "1".to_string())]);
    }

    #[test]
    fn executor_options_defaults() {
        let options = CommandExecutorOptions::default();
        assert_eq!(options.dispatch_concurrency, DEFAULT_DISPATCH_CONCURRENCY);
        assert!(options.pending_request_capacity.is_none());
    }
}
