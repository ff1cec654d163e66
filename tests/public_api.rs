// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Integration tests for the public API surface.
//!
//! Everything here runs without a broker: construction, validation,
//! clock behavior, topic resolution, and offline session behavior.

use std::collections::HashMap;
use std::time::Duration;

use edgelink_lib::application::ApplicationContext;
use edgelink_lib::command::CommandDeclaration;
use edgelink_lib::session::{
    ConnectionSettings, ConnectionState, MessageProperties, OutgoingPublish, QoS, Session,
    SessionOptions,
};
use edgelink_lib::{ErrorKind, HybridLogicalClock, ManagedClient, TopicPattern};

#[test]
fn hlc_stamps_are_monotonic_across_components() {
    let context = ApplicationContext::builder()
        .node_id("node-a")
        .build()
        .unwrap();
    let clone = context.clone();

    let mut previous = context.hlc().update().unwrap();
    for _ in 0..100 {
        let next = clone.hlc().update().unwrap();
        assert!(next > previous);
        previous = next;
    }
}

#[test]
fn hlc_wire_encoding_round_trips() {
    let context = ApplicationContext::builder()
        .node_id("node-a")
        .build()
        .unwrap();
    let stamp = context.hlc().update().unwrap();
    let reparsed: HybridLogicalClock = stamp.to_string().parse().unwrap();
    assert_eq!(reparsed, stamp);
}

#[test]
fn peer_stamps_advance_the_local_clock() {
    let sender = ApplicationContext::builder()
        .node_id("sender")
        .build()
        .unwrap();
    let receiver = ApplicationContext::builder()
        .node_id("receiver")
        .build()
        .unwrap();

    let sent = sender.hlc().update().unwrap();
    let merged = receiver.hlc().update_with(&sent).unwrap();
    assert!(merged > sent);
    assert!(receiver.hlc().update().unwrap() > merged);
}

#[test]
fn topic_pattern_resolution_and_matching() {
    let pattern = TopicPattern::new(
        "rpc/math/{executorId}/{commandName}",
        Some("site7"),
        &HashMap::from([("commandName".to_string(), "square".to_string())]),
    )
    .unwrap();

    assert_eq!(pattern.subscribe_filter(), "site7/rpc/math/+/square");

    let overlay = HashMap::from([("executorId".to_string(), "exec1".to_string())]);
    assert_eq!(
        pattern.publish_topic(&overlay).unwrap(),
        "site7/rpc/math/exec1/square"
    );

    let captured = pattern
        .match_topic("site7/rpc/math/exec9/square")
        .unwrap();
    assert_eq!(
        captured.get("executorId").map(String::as_str),
        Some("exec9")
    );
}

#[test]
fn unresolved_token_is_shallow_configuration_error() {
    let pattern =
        TopicPattern::new("rpc/{executorId}/go", None, &HashMap::new()).unwrap();
    let err = pattern.publish_topic(&HashMap::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigurationInvalid);
    assert!(err.is_shallow());
    assert_eq!(err.property_name(), Some("executorId"));
}

#[test]
fn command_declaration_validation() {
    assert!(CommandDeclaration::new("square").is_ok());
    assert!(CommandDeclaration::new("bad/name").is_err());

    let declaration = CommandDeclaration::new("square")
        .unwrap()
        .idempotent(true)
        .cache_ttl(Duration::from_secs(10));
    assert!(declaration.is_idempotent());
}

fn offline_session() -> Session {
    let settings = ConnectionSettings::builder()
        .client_id("it-client")
        .hostname("broker.invalid")
        .build()
        .unwrap();
    Session::new(
        SessionOptions::builder()
            .connection_settings(settings)
            .build()
            .unwrap(),
    )
    .unwrap()
}

#[tokio::test]
async fn offline_publish_queues_until_disposed() {
    let session = offline_session();
    let client = session.client();
    let monitor = session.connection_monitor();
    assert_eq!(monitor.state(), ConnectionState::Disconnected);

    // Not connected: the publish parks in the offline queue.
    let completion = client
        .publish(OutgoingPublish {
            topic: "fleet/it-client/state".to_string(),
            qos: QoS::AtLeastOnce,
            retain: false,
            payload: b"hello".to_vec(),
            properties: MessageProperties::default(),
        })
        .await
        .unwrap();

    client.dispose();
    let err = completion.await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ObjectDisposed);

    // Disposed sessions reject all further calls.
    let err = client
        .publish(OutgoingPublish {
            topic: "t".to_string(),
            qos: QoS::AtMostOnce,
            retain: false,
            payload: Vec::new(),
            properties: MessageProperties::default(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ObjectDisposed);
    assert_eq!(monitor.state(), ConnectionState::Disposed);
}

#[tokio::test]
async fn connection_events_report_disposal_path() {
    let session = offline_session();
    let client = session.client();
    let mut events = client.connection_events();

    client.dispose();
    // Disposal emits no spurious connectivity events; the stream just
    // stays silent. Make sure polling it does not hang forever by racing
    // a short timeout.
    let outcome =
        tokio::time::timeout(Duration::from_millis(100), events.recv()).await;
    assert!(outcome.is_err() || outcome.unwrap().is_none());
}

#[test]
fn connection_settings_validation_errors_are_structured() {
    let err = ConnectionSettings::builder()
        .hostname("broker.local")
        .build()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigurationInvalid);
    assert!(err.is_shallow());
    assert_eq!(err.property_name(), Some("client_id"));
    assert_eq!(
        err.to_string(),
        "invalid configuration: connection settings field \"client_id\" is required"
    );
}
