// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end command exchanges over the in-process loopback transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::application::ApplicationContext;
use crate::command::{
    CommandDeclaration, CommandExecutor, CommandExecutorOptions, CommandInvoker,
    CommandInvokerOptions, CommandRequest, HandlerError, IncomingRequest, OutgoingResponse,
};
use crate::error::{Error, ErrorKind};
use crate::headers::{UserProperty, find_property};
use crate::payload::JsonCodec;
use crate::session::{ManagedClient, MessageProperties, OutgoingPublish, QoS};
use crate::test_support::{MockBroker, MockClient};

#[derive(Debug, Serialize, Deserialize)]
struct SquareRequest {
    n: i64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct SquareResponse {
    r: i64,
}

const REQUEST_PATTERN: &str = "rpc/math/{executorId}/{commandName}";
const REQUEST_TOPIC: &str = "rpc/math/exec1/square";

fn context(node: &str) -> ApplicationContext {
    ApplicationContext::builder().node_id(node).build().unwrap()
}

fn make_invoker(
    broker: &MockBroker,
    client_id: &str,
) -> CommandInvoker<SquareRequest, SquareResponse, MockClient> {
    let declaration = CommandDeclaration::new("square").unwrap();
    CommandInvoker::new(
        &context(client_id),
        broker.client(client_id),
        Arc::new(JsonCodec),
        Arc::new(JsonCodec),
        &declaration,
        CommandInvokerOptions {
            request_topic_pattern: REQUEST_PATTERN.to_string(),
            topic_tokens: HashMap::from([("executorId".to_string(), "exec1".to_string())]),
            ..CommandInvokerOptions::default()
        },
    )
    .unwrap()
}

async fn start_square_executor(
    broker: &MockBroker,
    declaration: CommandDeclaration,
    invocations: Arc<AtomicUsize>,
) -> CommandExecutor<SquareRequest, SquareResponse, MockClient> {
    let executor = CommandExecutor::new(
        &context("exec1"),
        broker.client("exec1"),
        Arc::new(JsonCodec),
        Arc::new(JsonCodec),
        declaration,
        CommandExecutorOptions {
            request_topic_pattern: REQUEST_PATTERN.to_string(),
            ..CommandExecutorOptions::default()
        },
    )
    .unwrap();
    executor
        .start(
            move |request: IncomingRequest<SquareRequest>, _cancel: CancellationToken| {
                let invocations = invocations.clone();
                async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    let n = request.payload.n;
                    Ok::<_, HandlerError>(OutgoingResponse::new(SquareResponse { r: n * n }))
                }
            },
        )
        .await
        .unwrap();
    executor
}

/// Waits until `condition` holds or a short budget elapses.
async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(condition(), "condition not reached in time");
}

#[tokio::test]
async fn happy_path_rpc() {
    let broker = MockBroker::new();
    let invocations = Arc::new(AtomicUsize::new(0));
    let _executor = start_square_executor(
        &broker,
        CommandDeclaration::new("square").unwrap(),
        invocations.clone(),
    )
    .await;

    let invoker = make_invoker(&broker, "inv1");
    let response = invoker
        .invoke(
            CommandRequest::builder(SquareRequest { n: 7 })
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.payload, SquareResponse { r: 49 });
    assert!(response.timestamp.is_some());
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    let responses = broker.published_to("clients/inv1/");
    assert_eq!(responses.len(), 1);
    assert_eq!(
        find_property(&responses[0].properties.user_properties, UserProperty::Status),
        Some("200")
    );
    // The request is acknowledged by the executor, the response by the
    // invoker's router.
    wait_until(|| broker.acked() == 2).await;
}

#[tokio::test(start_paused = true)]
async fn slow_executor_times_out_and_handler_sees_cancellation() {
    let broker = MockBroker::new();
    let handler_cancelled = Arc::new(AtomicBool::new(false));

    let executor = CommandExecutor::new(
        &context("exec1"),
        broker.client("exec1"),
        Arc::new(JsonCodec),
        Arc::new(JsonCodec),
        CommandDeclaration::new("square").unwrap(),
        CommandExecutorOptions {
            request_topic_pattern: REQUEST_PATTERN.to_string(),
            ..CommandExecutorOptions::default()
        },
    )
    .unwrap();
    executor
        .start({
            let handler_cancelled = handler_cancelled.clone();
            move |_request: IncomingRequest<SquareRequest>, cancel: CancellationToken| {
                let handler_cancelled = handler_cancelled.clone();
                async move {
                    cancel.cancelled().await;
                    handler_cancelled.store(true, Ordering::SeqCst);
                    Err::<OutgoingResponse<SquareResponse>, _>(HandlerError::execution(
                        "cancelled before completion",
                    ))
                }
            }
        })
        .await
        .unwrap();

    let invoker = make_invoker(&broker, "inv1");
    let err = invoker
        .invoke(
            CommandRequest::builder(SquareRequest { n: 7 })
                .timeout(Duration::from_secs(1))
                .build()
                .unwrap(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(!err.is_remote());
    assert!(!err.is_shallow());

    // The executor derived the handler's cancellation from the request
    // expiry, which equals the invocation timeout.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(handler_cancelled.load(Ordering::SeqCst));
}

#[tokio::test]
async fn idempotent_duplicate_replays_cached_response() {
    let broker = MockBroker::new();
    let invocations = Arc::new(AtomicUsize::new(0));
    let declaration = CommandDeclaration::new("square")
        .unwrap()
        .idempotent(true)
        .cache_ttl(Duration::from_secs(10));
    let _executor = start_square_executor(&broker, declaration, invocations.clone()).await;

    let invoker = make_invoker(&broker, "inv1");
    let response = invoker
        .invoke(
            CommandRequest::builder(SquareRequest { n: 6 })
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.payload, SquareResponse { r: 36 });

    // Replay the exact request publish (same correlation id), simulating
    // a retry within the cache window.
    let requests = broker.published_to(REQUEST_TOPIC);
    assert_eq!(requests.len(), 1);
    broker.route(&requests[0]);

    wait_until(|| broker.published_to("clients/inv1/").len() == 2).await;

    // The handler ran exactly once; the replayed response is
    // byte-identical to the first.
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    let responses = broker.published_to("clients/inv1/");
    assert_eq!(responses[0].payload, responses[1].payload);
    assert_eq!(
        find_property(&responses[0].properties.user_properties, UserProperty::Status),
        find_property(&responses[1].properties.user_properties, UserProperty::Status),
    );
}

#[tokio::test]
async fn non_idempotent_concurrent_duplicate_is_rejected() {
    let broker = MockBroker::new();
    let executor = CommandExecutor::new(
        &context("exec1"),
        broker.client("exec1"),
        Arc::new(JsonCodec),
        Arc::new(JsonCodec),
        CommandDeclaration::new("square").unwrap(),
        CommandExecutorOptions {
            request_topic_pattern: REQUEST_PATTERN.to_string(),
            ..CommandExecutorOptions::default()
        },
    )
    .unwrap();
    executor
        .start(
            |request: IncomingRequest<SquareRequest>, _cancel: CancellationToken| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                let n = request.payload.n;
                Ok::<_, HandlerError>(OutgoingResponse::new(SquareResponse { r: n * n }))
            },
        )
        .await
        .unwrap();

    let observer = broker.client("observer");
    let mut replies = observer.filtered_messages("test/replies");

    let request = crafted_request(
        br#"{"n":3}"#,
        vec![
            ("__protVer".to_string(), "1.0".to_string()),
            ("__srcId".to_string(), "inv1".to_string()),
        ],
    );
    broker.route(&request);
    broker.route(&request);

    let first = replies.recv().await.unwrap();
    let second = replies.recv().await.unwrap();
    let mut statuses = [
        find_property(&first.properties.user_properties, UserProperty::Status)
            .unwrap()
            .to_string(),
        find_property(&second.properties.user_properties, UserProperty::Status)
            .unwrap()
            .to_string(),
    ];
    statuses.sort();
    assert_eq!(statuses, ["200".to_string(), "503".to_string()]);
}

/// Builds a raw request publish aimed at the square executor.
fn crafted_request(payload: &[u8], user_properties: Vec<(String, String)>) -> OutgoingPublish {
    OutgoingPublish {
        topic: REQUEST_TOPIC.to_string(),
        qos: QoS::AtLeastOnce,
        retain: false,
        payload: payload.to_vec(),
        properties: MessageProperties {
            content_type: Some("application/json".to_string()),
            format_indicator: Some(1),
            correlation_data: Some(uuid::Uuid::new_v4().as_bytes().to_vec()),
            response_topic: Some("test/replies".to_string()),
            message_expiry_interval: Some(10),
            user_properties,
        },
    }
}

#[tokio::test]
async fn unsupported_request_version_gets_505() {
    let broker = MockBroker::new();
    let invocations = Arc::new(AtomicUsize::new(0));
    let _executor = start_square_executor(
        &broker,
        CommandDeclaration::new("square").unwrap(),
        invocations.clone(),
    )
    .await;

    let observer = broker.client("observer");
    let mut replies = observer.filtered_messages("test/replies");

    broker.route(&crafted_request(
        br#"{"n":2}"#,
        vec![
            ("__protVer".to_string(), "9.0".to_string()),
            ("__srcId".to_string(), "inv1".to_string()),
        ],
    ));

    let reply = replies.recv().await.unwrap();
    let properties = &reply.properties.user_properties;
    assert_eq!(find_property(properties, UserProperty::Status), Some("505"));
    assert_eq!(
        find_property(properties, UserProperty::SupportedMajorVersions),
        Some("1")
    );
    assert_eq!(
        find_property(properties, UserProperty::RequestProtocolVersion),
        Some("9.0")
    );
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn missing_source_id_gets_400() {
    let broker = MockBroker::new();
    let invocations = Arc::new(AtomicUsize::new(0));
    let _executor = start_square_executor(
        &broker,
        CommandDeclaration::new("square").unwrap(),
        invocations.clone(),
    )
    .await;

    let observer = broker.client("observer");
    let mut replies = observer.filtered_messages("test/replies");

    broker.route(&crafted_request(
        br#"{"n":2}"#,
        vec![("__protVer".to_string(), "1.0".to_string())],
    ));

    let reply = replies.recv().await.unwrap();
    let properties = &reply.properties.user_properties;
    assert_eq!(find_property(properties, UserProperty::Status), Some("400"));
    assert_eq!(
        find_property(properties, UserProperty::PropertyName),
        Some("__srcId")
    );
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn expired_request_gets_408() {
    let broker = MockBroker::new();
    let invocations = Arc::new(AtomicUsize::new(0));
    let _executor = start_square_executor(
        &broker,
        CommandDeclaration::new("square").unwrap(),
        invocations.clone(),
    )
    .await;

    let observer = broker.client("observer");
    let mut replies = observer.filtered_messages("test/replies");

    let mut request = crafted_request(
        br#"{"n":2}"#,
        vec![
            ("__protVer".to_string(), "1.0".to_string()),
            ("__srcId".to_string(), "inv1".to_string()),
        ],
    );
    request.properties.message_expiry_interval = Some(0);
    broker.route(&request);

    let reply = replies.recv().await.unwrap();
    assert_eq!(
        find_property(&reply.properties.user_properties, UserProperty::Status),
        Some("408")
    );
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn undecodable_payload_gets_422() {
    let broker = MockBroker::new();
    let invocations = Arc::new(AtomicUsize::new(0));
    let _executor = start_square_executor(
        &broker,
        CommandDeclaration::new("square").unwrap(),
        invocations.clone(),
    )
    .await;

    let observer = broker.client("observer");
    let mut replies = observer.filtered_messages("test/replies");

    broker.route(&crafted_request(
        b"not json",
        vec![
            ("__protVer".to_string(), "1.0".to_string()),
            ("__srcId".to_string(), "inv1".to_string()),
        ],
    ));

    let reply = replies.recv().await.unwrap();
    let properties = &reply.properties.user_properties;
    assert_eq!(find_property(properties, UserProperty::Status), Some("422"));
    assert_eq!(
        find_property(properties, UserProperty::IsApplicationError),
        Some("false")
    );
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
}

/// Runs one invocation against a scripted peer that replies with the given
/// response headers, and returns the error the invoker surfaces.
async fn invoke_with_remote_status(headers: Vec<(String, String)>) -> Error {
    let broker = MockBroker::new();
    let responder = broker.client("exec1");
    let mut requests = responder.filtered_messages(REQUEST_TOPIC);
    let responder_client = responder.clone();
    tokio::spawn(async move {
        if let Some(mut request) = requests.recv().await {
            if let Some(ack) = request.ack.take() {
                ack.complete();
            }
            let publish = OutgoingPublish {
                topic: request.properties.response_topic.clone().unwrap(),
                qos: QoS::AtLeastOnce,
                retain: false,
                payload: Vec::new(),
                properties: MessageProperties {
                    content_type: None,
                    format_indicator: None,
                    correlation_data: request.properties.correlation_data.clone(),
                    response_topic: None,
                    message_expiry_interval: None,
                    user_properties: headers,
                },
            };
            let completion = responder_client.publish(publish).await.unwrap();
            let _ = completion.await;
        }
    });

    let invoker = make_invoker(&broker, "inv1");
    invoker
        .invoke(
            CommandRequest::builder(SquareRequest { n: 1 })
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap(),
        )
        .await
        .unwrap_err()
}

#[tokio::test]
async fn invoker_maps_missing_header_response() {
    let err = invoke_with_remote_status(vec![
        ("__stat".to_string(), "400".to_string()),
        ("__propName".to_string(), "__srcId".to_string()),
        ("__stMsg".to_string(), "missing source id".to_string()),
    ])
    .await;
    assert_eq!(err.kind(), ErrorKind::HeaderMissing);
    assert!(err.is_remote());
    assert_eq!(err.header_name(), Some("__srcId"));
}

#[tokio::test]
async fn invoker_maps_invalid_header_value_response() {
    let err = invoke_with_remote_status(vec![
        ("__stat".to_string(), "400".to_string()),
        ("__propName".to_string(), "__ts".to_string()),
        ("__propVal".to_string(), "garbage".to_string()),
    ])
    .await;
    assert_eq!(err.kind(), ErrorKind::HeaderInvalid);
    assert!(err.is_remote());
}

#[tokio::test]
async fn invoker_maps_remote_timeout_response() {
    let err =
        invoke_with_remote_status(vec![("__stat".to_string(), "408".to_string())]).await;
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(err.is_remote());
}

#[tokio::test]
async fn invoker_maps_application_error_response() {
    let err = invoke_with_remote_status(vec![
        ("__stat".to_string(), "422".to_string()),
        ("__apErr".to_string(), "true".to_string()),
    ])
    .await;
    assert_eq!(err.kind(), ErrorKind::UnknownError);
    assert!(err.is_remote());
}

#[tokio::test]
async fn invoker_maps_invalid_payload_response() {
    let err =
        invoke_with_remote_status(vec![("__stat".to_string(), "422".to_string())]).await;
    assert_eq!(err.kind(), ErrorKind::PayloadInvalid);
}

#[tokio::test]
async fn invoker_maps_execution_error_response() {
    let err = invoke_with_remote_status(vec![
        ("__stat".to_string(), "500".to_string()),
        ("__stMsg".to_string(), "handler exploded".to_string()),
    ])
    .await;
    assert_eq!(err.kind(), ErrorKind::ExecutionError);
    assert!(err.message().contains("handler exploded"));
}

#[tokio::test]
async fn invoker_maps_unavailable_response() {
    let err =
        invoke_with_remote_status(vec![("__stat".to_string(), "503".to_string())]).await;
    assert_eq!(err.kind(), ErrorKind::StateInvalid);
    assert!(err.is_remote());
}

#[tokio::test]
async fn invoker_maps_version_mismatch_response() {
    let err = invoke_with_remote_status(vec![
        ("__stat".to_string(), "505".to_string()),
        ("__supProtMajVer".to_string(), "2 3".to_string()),
        ("__requestProtVer".to_string(), "1.0".to_string()),
    ])
    .await;
    assert_eq!(err.kind(), ErrorKind::UnsupportedVersion);
    assert_eq!(err.supported_major_versions(), Some(&[2, 3][..]));
    assert_eq!(err.protocol_version(), Some("1.0"));
}

#[tokio::test]
async fn cancellation_aborts_the_wait() {
    let broker = MockBroker::new();
    // No executor attached: the request goes unanswered.
    let invoker = make_invoker(&broker, "inv1");

    let token = CancellationToken::new();
    let invocation = {
        let token = token.clone();
        async move {
            invoker
                .invoke(
                    CommandRequest::builder(SquareRequest { n: 1 })
                        .timeout(Duration::from_secs(30))
                        .cancellation(token)
                        .build()
                        .unwrap(),
                )
                .await
        }
    };

    let handle = tokio::spawn(invocation);
    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    let err = handle.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
}

#[tokio::test]
async fn shallow_errors_do_not_touch_the_wire() {
    let broker = MockBroker::new();
    let invoker = make_invoker(&broker, "inv1");

    // `executorId` is bound, but an invalid override value fails at
    // resolve time.
    let err = invoker
        .invoke(
            CommandRequest::builder(SquareRequest { n: 1 })
                .topic_token("executorId", "bad/value")
                .build()
                .unwrap(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigurationInvalid);
    assert!(err.is_shallow());
    assert!(broker.published().is_empty());
}
