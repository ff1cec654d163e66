// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the `EdgeLink` library.
//!
//! All failures across the library surface as a single [`Error`] carrying an
//! [`ErrorKind`] plus structured supplements that describe where the failure
//! originated: whether it was raised before any network I/O (`is_shallow`),
//! whether it was reported by the remote peer (`is_remote`), and which
//! property, header, or protocol version was at fault.

use thiserror::Error;

/// Classification of a failure.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A constructor or call argument is invalid (unresolved topic token,
    /// forbidden character, missing required option).
    #[error("invalid configuration")]
    ConfigurationInvalid,

    /// A payload could not be encoded or decoded.
    #[error("invalid payload")]
    PayloadInvalid,

    /// A required message header is missing.
    #[error("missing header")]
    HeaderMissing,

    /// A message header carries a value that cannot be interpreted.
    #[error("invalid header value")]
    HeaderInvalid,

    /// An operation did not complete within its deadline.
    #[error("timeout")]
    Timeout,

    /// The remote command handler failed while executing.
    #[error("execution error")]
    ExecutionError,

    /// An error that does not fit any other kind, including remote
    /// application-level errors.
    #[error("unknown error")]
    UnknownError,

    /// The peer does not support the requested protocol version.
    #[error("unsupported protocol version")]
    UnsupportedVersion,

    /// The object is in a state that does not permit the operation.
    #[error("invalid state")]
    StateInvalid,

    /// The object has been disposed and accepts no further calls.
    #[error("object disposed")]
    ObjectDisposed,

    /// Authentication with the broker failed and could not be recovered.
    #[error("authentication failed")]
    AuthFailed,

    /// The operation was cancelled by the caller.
    #[error("cancelled")]
    Cancelled,
}

/// A supplemental value attached to an error, describing the offending
/// property.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// An integer value.
    Integer(i64),
    /// A string value.
    String(String),
    /// A floating point value.
    Float(f64),
    /// A boolean value.
    Boolean(bool),
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Boolean(v) => write!(f, "{v}"),
        }
    }
}

/// The error type for all fallible operations in this library.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct Error {
    /// The failure classification.
    kind: ErrorKind,
    /// Human readable description of the failure.
    message: String,
    /// True if the error was raised synchronously, before any network I/O.
    is_shallow: bool,
    /// True if the error was reported by the remote peer rather than
    /// detected locally.
    is_remote: bool,
    /// Name of the offending property, if one is identified.
    property_name: Option<String>,
    /// Value of the offending property, if one is identified.
    property_value: Option<Value>,
    /// Name of the offending message header, if one is identified.
    header_name: Option<String>,
    /// The protocol version that was requested, for version mismatches.
    protocol_version: Option<String>,
    /// Protocol major versions the peer supports, for version mismatches.
    supported_major_versions: Option<Vec<u16>>,
    /// Underlying cause, when the failure wraps another error.
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    /// Creates a new error of the given kind.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            is_shallow: false,
            is_remote: false,
            property_name: None,
            property_value: None,
            header_name: None,
            protocol_version: None,
            supported_major_versions: None,
            source: None,
        }
    }

    /// Creates a shallow error: raised synchronously before any network I/O.
    #[must_use]
    pub fn shallow(kind: ErrorKind, message: impl Into<String>) -> Self {
        let mut err = Self::new(kind, message);
        err.is_shallow = true;
        err
    }

    /// Creates a remote error: reported by the peer on the RPC path.
    #[must_use]
    pub fn remote(kind: ErrorKind, message: impl Into<String>) -> Self {
        let mut err = Self::new(kind, message);
        err.is_remote = true;
        err
    }

    /// Attaches the name of the offending property.
    #[must_use]
    pub fn with_property_name(mut self, name: impl Into<String>) -> Self {
        self.property_name = Some(name.into());
        self
    }

    /// Attaches the value of the offending property.
    #[must_use]
    pub fn with_property_value(mut self, value: Value) -> Self {
        self.property_value = Some(value);
        self
    }

    /// Attaches the name of the offending header.
    #[must_use]
    pub fn with_header_name(mut self, name: impl Into<String>) -> Self {
        self.header_name = Some(name.into());
        self
    }

    /// Attaches the protocol version that was requested.
    #[must_use]
    pub fn with_protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = Some(version.into());
        self
    }

    /// Attaches the protocol major versions the peer supports.
    #[must_use]
    pub fn with_supported_major_versions(mut self, versions: Vec<u16>) -> Self {
        self.supported_major_versions = Some(versions);
        self
    }

    /// Attaches an underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Marks the error as raised before any network I/O.
    pub(crate) fn mark_shallow(mut self) -> Self {
        self.is_shallow = true;
        self
    }

    /// Returns the failure classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the human readable description.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns true if the error was raised before any network I/O.
    #[must_use]
    pub fn is_shallow(&self) -> bool {
        self.is_shallow
    }

    /// Returns true if the error was reported by the remote peer.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        self.is_remote
    }

    /// Returns the name of the offending property, if identified.
    #[must_use]
    pub fn property_name(&self) -> Option<&str> {
        self.property_name.as_deref()
    }

    /// Returns the value of the offending property, if identified.
    #[must_use]
    pub fn property_value(&self) -> Option<&Value> {
        self.property_value.as_ref()
    }

    /// Returns the name of the offending header, if identified.
    #[must_use]
    pub fn header_name(&self) -> Option<&str> {
        self.header_name.as_deref()
    }

    /// Returns the requested protocol version, for version mismatches.
    #[must_use]
    pub fn protocol_version(&self) -> Option<&str> {
        self.protocol_version.as_deref()
    }

    /// Returns the protocol majors the peer supports, for version
    /// mismatches.
    #[must_use]
    pub fn supported_major_versions(&self) -> Option<&[u16]> {
        self.supported_major_versions.as_deref()
    }
}

/// A specialized Result type for this library.
pub type Result<T> = std::result::Result<T, Error>;
