// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Telemetry primitives.
//!
//! Telemetry is one-way: a [`TelemetrySender`] publishes typed,
//! schema-stamped messages and zero or more [`TelemetryReceiver`]s consume
//! them. Messages optionally carry a CloudEvents 1.0 envelope
//! ([`CloudEvent`]) in their user properties, and always carry the
//! sender's hybrid logical clock stamp, which receivers merge into their
//! local clock before the application sees the message.

mod cloud_event;
mod receiver;
mod sender;

pub use cloud_event::{CLOUD_EVENT_SPEC_VERSION, CloudEvent, CloudEventBuilder};
pub use receiver::{
    DecodeFailurePolicy, ReceivedTelemetry, TelemetryReceiver, TelemetryReceiverOptions,
};
pub use sender::{
    TelemetryMessage, TelemetryMessageBuilder, TelemetrySender, TelemetrySenderOptions,
};
