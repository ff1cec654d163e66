// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `EdgeLink` Lib - MQTT5 application protocols for distributed edge
//! services.
//!
//! This library turns a publish/subscribe broker into two higher-level
//! primitives:
//!
//! - **Telemetry**: one-way, typed, schema-stamped messages with
//!   CloudEvents metadata, produced by a sender and consumed by
//!   zero-or-more receivers.
//! - **Commands (RPC)**: request/response exchanges with correlation,
//!   timeouts, idempotency-aware response caching, executor-side
//!   deduplication, and typed error propagation.
//!
//! Both ride on a **session client** that keeps a single logical MQTT5
//! session alive across disconnects, preserving subscriptions and
//! in-flight acknowledgements, with exponential-backoff reconnection and
//! rotating-credential support.
//!
//! # Architecture
//!
//! ```text
//! ApplicationContext ── hybrid logical clock (one per node)
//!        │
//!        ▼
//!    Session ──────── owns the MQTT5 connection, reconnects, queues,
//!        │            tracks ordered acknowledgements
//!        ▼
//!  SessionClient ──── cheap clone handle shared by reference
//!    │        │
//!    ▼        ▼
//! Telemetry  Command
//! sender/    invoker/
//! receiver   executor
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::collections::HashMap;
//!
//! use edgelink_lib::application::ApplicationContext;
//! use edgelink_lib::command::{CommandDeclaration, CommandInvoker, CommandInvokerOptions, CommandRequest};
//! use edgelink_lib::payload::JsonCodec;
//! use edgelink_lib::session::{ConnectionSettings, Session, SessionOptions};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct SquareRequest { n: i64 }
//! #[derive(Serialize, Deserialize)]
//! struct SquareResponse { r: i64 }
//!
//! #[tokio::main]
//! async fn main() -> edgelink_lib::Result<()> {
//!     let settings = ConnectionSettings::builder()
//!         .client_id("calc-client-1")
//!         .hostname("broker.local")
//!         .build()?;
//!     let mut session = Session::new(
//!         SessionOptions::builder().connection_settings(settings).build()?,
//!     )?;
//!     let context = ApplicationContext::builder()
//!         .node_id("calc-client-1")
//!         .build()?;
//!
//!     let declaration = CommandDeclaration::new("square")?;
//!     let invoker: CommandInvoker<SquareRequest, SquareResponse, _> = CommandInvoker::new(
//!         &context,
//!         session.client(),
//!         Arc::new(JsonCodec),
//!         Arc::new(JsonCodec),
//!         &declaration,
//!         CommandInvokerOptions {
//!             request_topic_pattern: "rpc/math/{executorId}/{commandName}".to_string(),
//!             topic_tokens: HashMap::from([
//!                 ("executorId".to_string(), "exec1".to_string()),
//!             ]),
//!             ..CommandInvokerOptions::default()
//!         },
//!     )?;
//!
//!     tokio::spawn(async move {
//!         let request = CommandRequest::builder(SquareRequest { n: 7 }).build()?;
//!         let response = invoker.invoke(request).await?;
//!         println!("7² = {}", response.payload.r);
//!         edgelink_lib::Result::Ok(())
//!     });
//!
//!     session.run().await
//! }
//! ```

pub mod application;
pub mod command;
pub mod error;
pub mod headers;
pub mod hlc;
pub mod payload;
pub mod session;
pub mod telemetry;
pub mod topic;

#[cfg(test)]
pub(crate) mod test_support;

pub use application::{ApplicationContext, ApplicationContextBuilder};
pub use command::{
    CommandDeclaration, CommandExecutor, CommandExecutorOptions, CommandInvoker,
    CommandInvokerOptions, CommandRequest, CommandResponse, HandlerError, IncomingRequest,
    OutgoingResponse,
};
pub use error::{Error, ErrorKind, Result};
pub use headers::{ProtocolVersion, StatusCode};
pub use hlc::{HybridLogicalClock, SharedHybridLogicalClock};
pub use payload::{EncodedPayload, FormatIndicator, JsonCodec, PayloadCodec, RawCodec, UnitCodec};
pub use session::{
    AckToken, ConnectionEvent, ConnectionMonitor, ConnectionSettings, ConnectionState,
    ManagedClient, Session, SessionClient, SessionOptions,
};
pub use telemetry::{
    CloudEvent, TelemetryMessage, TelemetryReceiver, TelemetrySender, TelemetrySenderOptions,
};
pub use topic::TopicPattern;
