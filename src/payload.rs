// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Payload codec abstraction.
//!
//! The runtime never inspects payload bytes itself; every telemetry
//! message, command request, and command response passes through a
//! [`PayloadCodec`] chosen when the sender/receiver/invoker/executor is
//! constructed. The built-in [`JsonCodec`] covers the common case;
//! [`RawCodec`] passes bytes through untouched, and the unit type `()` is
//! the canonical "no payload" schema.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, ErrorKind, Result};

/// MQTT5 payload format indicator values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum FormatIndicator {
    /// The payload is unspecified bytes.
    #[default]
    UnspecifiedBytes = 0,
    /// The payload is UTF-8 encoded character data.
    Utf8EncodedCharacterData = 1,
}

impl TryFrom<u8> for FormatIndicator {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::UnspecifiedBytes),
            1 => Ok(Self::Utf8EncodedCharacterData),
            other => Err(Error::new(
                ErrorKind::HeaderInvalid,
                format!("invalid payload format indicator {other}"),
            )
            .with_header_name("payloadFormatIndicator")),
        }
    }
}

/// An encoded payload together with its wire metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EncodedPayload {
    /// The serialized bytes. May be empty for unit payloads.
    pub payload: Vec<u8>,
    /// MIME content type, carried as the MQTT5 content type property.
    pub content_type: String,
    /// MQTT5 payload format indicator.
    pub format_indicator: FormatIndicator,
}

impl EncodedPayload {
    /// Returns an empty payload with no content type, used for unit
    /// request/response schemas.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns true if the payload carries no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Encodes and decodes typed values to and from wire payloads.
///
/// Implementations must be deterministic: encoding the same value twice
/// yields identical bytes, which the executor relies on when replaying
/// cached responses.
pub trait PayloadCodec<T>: Send + Sync {
    /// Encodes a value into payload bytes plus wire metadata.
    ///
    /// # Errors
    ///
    /// Returns an error of kind `PayloadInvalid` if the value cannot be
    /// serialized.
    fn encode(&self, value: &T) -> Result<EncodedPayload>;

    /// Decodes payload bytes back into a value.
    ///
    /// # Errors
    ///
    /// Returns an error of kind `PayloadInvalid` if the bytes cannot be
    /// deserialized or the content type does not match this codec.
    fn decode(&self, payload: &EncodedPayload) -> Result<T>;
}

/// JSON codec backed by `serde_json`.
///
/// Content type `application/json`, UTF-8 format indicator.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

/// Content type produced and accepted by [`JsonCodec`].
pub const JSON_CONTENT_TYPE: &str = "application/json";

impl<T> PayloadCodec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn encode(&self, value: &T) -> Result<EncodedPayload> {
        let payload = serde_json::to_vec(value).map_err(|e| {
            Error::new(ErrorKind::PayloadInvalid, "JSON serialization failed").with_source(e)
        })?;
        Ok(EncodedPayload {
            payload,
            content_type: JSON_CONTENT_TYPE.to_string(),
            format_indicator: FormatIndicator::Utf8EncodedCharacterData,
        })
    }

    fn decode(&self, payload: &EncodedPayload) -> Result<T> {
        if payload.is_empty() {
            return Err(Error::new(
                ErrorKind::PayloadInvalid,
                "empty payload cannot be decoded as JSON",
            ));
        }
        if !payload.content_type.is_empty() && payload.content_type != JSON_CONTENT_TYPE {
            return Err(Error::new(
                ErrorKind::PayloadInvalid,
                format!(
                    "content type {:?} does not match expected {JSON_CONTENT_TYPE:?}",
                    payload.content_type
                ),
            ));
        }
        serde_json::from_slice(&payload.payload).map_err(|e| {
            Error::new(ErrorKind::PayloadInvalid, "JSON deserialization failed").with_source(e)
        })
    }
}

/// Pass-through codec for raw byte payloads.
///
/// Content type `application/octet-stream`, unspecified-bytes indicator.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

/// Content type produced by [`RawCodec`].
pub const RAW_CONTENT_TYPE: &str = "application/octet-stream";

impl PayloadCodec<Vec<u8>> for RawCodec {
    fn encode(&self, value: &Vec<u8>) -> Result<EncodedPayload> {
        Ok(EncodedPayload {
            payload: value.clone(),
            content_type: RAW_CONTENT_TYPE.to_string(),
            format_indicator: FormatIndicator::UnspecifiedBytes,
        })
    }

    fn decode(&self, payload: &EncodedPayload) -> Result<Vec<u8>> {
        Ok(payload.payload.clone())
    }
}

/// Codec for the unit type: encodes to an empty payload and accepts only
/// empty payloads.
///
/// An empty payload is valid only when the declared schema is the unit
/// type, which this codec is the implementation of.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnitCodec;

impl PayloadCodec<()> for UnitCodec {
    fn encode(&self, _value: &()) -> Result<EncodedPayload> {
        Ok(EncodedPayload::empty())
    }

    fn decode(&self, payload: &EncodedPayload) -> Result<()> {
        if payload.is_empty() {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::PayloadInvalid,
                format!(
                    "expected an empty payload but received {} bytes",
                    payload.payload.len()
                ),
            ))
        }
    }
}
