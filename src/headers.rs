// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire-level headers shared by the command and telemetry protocols.
//!
//! Protocol metadata travels as MQTT5 user properties with reserved `__`
//! prefixed names. This module defines those names, the protocol version
//! type, and the RPC status codes.

use std::str::FromStr;

use crate::error::{Error, ErrorKind, Result};

/// The protocol version stamped on every message this library sends.
pub const PROTOCOL_VERSION: &str = "1.0";

/// The protocol major version this library implements.
pub const PROTOCOL_MAJOR_VERSION: u16 = 1;

/// Protocol major versions this library accepts on inbound requests and
/// responses.
pub const SUPPORTED_PROTOCOL_MAJOR_VERSIONS: &[u16] = &[1];

/// Reserved MQTT5 user property names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserProperty {
    /// `__protVer` - major.minor protocol version of the message.
    ProtocolVersion,
    /// `__srcId` - MQTT client id of the message source.
    SourceId,
    /// `__ts` - hybrid logical clock stamp.
    Timestamp,
    /// `__stat` - integer status code on responses.
    Status,
    /// `__stMsg` - human readable error message on error responses.
    StatusMessage,
    /// `__propName` - name of the offending property on error responses.
    PropertyName,
    /// `__propVal` - value of the offending property on error responses.
    PropertyValue,
    /// `__supProtMajVer` - space-separated supported protocol majors.
    SupportedMajorVersions,
    /// `__requestProtVer` - protocol version the request carried.
    RequestProtocolVersion,
    /// `__apErr` - `true` if the error originated in the application
    /// handler.
    IsApplicationError,
}

impl UserProperty {
    /// Returns the wire name of the property.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ProtocolVersion => "__protVer",
            Self::SourceId => "__srcId",
            Self::Timestamp => "__ts",
            Self::Status => "__stat",
            Self::StatusMessage => "__stMsg",
            Self::PropertyName => "__propName",
            Self::PropertyValue => "__propVal",
            Self::SupportedMajorVersions => "__supProtMajVer",
            Self::RequestProtocolVersion => "__requestProtVer",
            Self::IsApplicationError => "__apErr",
        }
    }
}

impl std::fmt::Display for UserProperty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Looks up a user property value by name in a property list.
#[must_use]
pub fn find_property<'a>(
    properties: &'a [(String, String)],
    property: UserProperty,
) -> Option<&'a str> {
    properties
        .iter()
        .find(|(k, _)| k == property.name())
        .map(|(_, v)| v.as_str())
}

/// A `major.minor` protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    /// Major version; compatibility-breaking changes increment this.
    pub major: u16,
    /// Minor version; additive changes increment this.
    pub minor: u16,
}

impl ProtocolVersion {
    /// The version this library speaks.
    pub const CURRENT: Self = Self { major: 1, minor: 0 };

    /// Returns true if this version's major is in the supported set.
    #[must_use]
    pub fn is_supported(&self, supported_majors: &[u16]) -> bool {
        supported_majors.contains(&self.major)
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ProtocolVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = || {
            Error::new(
                ErrorKind::HeaderInvalid,
                format!("malformed protocol version {s:?}"),
            )
            .with_header_name(UserProperty::ProtocolVersion.name())
        };
        let (major, minor) = s.split_once('.').ok_or_else(malformed)?;
        Ok(Self {
            major: major.parse().map_err(|_| malformed())?,
            minor: minor.parse().map_err(|_| malformed())?,
        })
    }
}

/// Renders a supported-majors list as the space-separated wire form used in
/// `__supProtMajVer`.
#[must_use]
pub fn format_supported_majors(majors: &[u16]) -> String {
    majors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parses the space-separated wire form of `__supProtMajVer`.
#[must_use]
pub fn parse_supported_majors(value: &str) -> Vec<u16> {
    value
        .split_whitespace()
        .filter_map(|v| v.parse().ok())
        .collect()
}

/// RPC status codes carried in the `__stat` response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// The request succeeded and the response carries a payload.
    Ok,
    /// The request succeeded and the response carries no payload.
    NoContent,
    /// A required header was missing or carried an invalid value.
    BadRequest,
    /// The request expired before the executor could serve it.
    RequestTimeout,
    /// The request payload was invalid, or the handler raised an
    /// application error.
    UnprocessableContent,
    /// The handler failed while executing.
    InternalServerError,
    /// The executor cannot accept the request in its current state.
    ServiceUnavailable,
    /// The request's protocol major version is not supported.
    VersionNotSupported,
}

impl StatusCode {
    /// Returns the numeric wire value.
    #[must_use]
    pub const fn value(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::NoContent => 204,
            Self::BadRequest => 400,
            Self::RequestTimeout => 408,
            Self::UnprocessableContent => 422,
            Self::InternalServerError => 500,
            Self::ServiceUnavailable => 503,
            Self::VersionNotSupported => 505,
        }
    }

    /// Maps a numeric wire value to a status code.
    #[must_use]
    pub const fn from_value(value: u16) -> Option<Self> {
        match value {
            200 => Some(Self::Ok),
            204 => Some(Self::NoContent),
            400 => Some(Self::BadRequest),
            408 => Some(Self::RequestTimeout),
            422 => Some(Self::UnprocessableContent),
            500 => Some(Self::InternalServerError),
            503 => Some(Self::ServiceUnavailable),
            505 => Some(Self::VersionNotSupported),
            _ => None,
        }
    }

    /// Returns true for the success codes (200, 204).
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Ok | Self::NoContent)
    }
}
