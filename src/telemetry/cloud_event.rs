// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! CloudEvents 1.0 envelope for telemetry messages.
//!
//! When a sender attaches a [`CloudEvent`], its fields travel as MQTT5 user
//! properties alongside the payload; receivers parse them back into the
//! envelope. Only the metadata mapping is implemented here - payload bytes
//! are untouched.

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use crate::error::{Error, ErrorKind, Result};

/// CloudEvents spec version stamped by this library.
pub const CLOUD_EVENT_SPEC_VERSION: &str = "1.0";

/// Default event type for telemetry produced by this library.
pub const DEFAULT_EVENT_TYPE: &str = "com.edgelink.telemetry";

/// User property names defined by the CloudEvents MQTT binding.
const HEADER_SPEC_VERSION: &str = "specversion";
const HEADER_ID: &str = "id";
const HEADER_SOURCE: &str = "source";
const HEADER_TYPE: &str = "type";
const HEADER_SUBJECT: &str = "subject";
const HEADER_TIME: &str = "time";
const HEADER_DATA_CONTENT_TYPE: &str = "datacontenttype";
const HEADER_DATA_SCHEMA: &str = "dataschema";

/// Returns true if `key` is a reserved CloudEvents header name.
#[must_use]
pub fn is_cloud_event_header(key: &str) -> bool {
    matches!(
        key,
        HEADER_SPEC_VERSION
            | HEADER_ID
            | HEADER_SOURCE
            | HEADER_TYPE
            | HEADER_SUBJECT
            | HEADER_TIME
            | HEADER_DATA_CONTENT_TYPE
            | HEADER_DATA_SCHEMA
    )
}

/// A CloudEvents 1.0 envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudEvent {
    /// Context in which the event happened (producer-defined URI-reference).
    pub source: String,
    /// CloudEvents spec version; always `1.0` for events produced here.
    pub spec_version: String,
    /// Type of the event; used for routing and policy.
    pub event_type: String,
    /// Event id, unique per source. Filled with a fresh UUID at send time
    /// when absent.
    pub id: Option<String>,
    /// Occurrence time. Filled with the current wall time at send time when
    /// absent.
    pub time: Option<DateTime<Utc>>,
    /// Subject of the event. When absent, the sender stamps the telemetry
    /// topic.
    pub subject: Option<String>,
    /// URI of the schema the payload adheres to.
    pub data_schema: Option<String>,
    /// MIME type of the payload; stamped from the codec at send time.
    pub data_content_type: Option<String>,
}

impl CloudEvent {
    /// Creates a builder.
    #[must_use]
    pub fn builder() -> CloudEventBuilder {
        CloudEventBuilder::default()
    }

    /// Renders the envelope into user properties for one outgoing message,
    /// filling `id`, `time`, `subject`, and `datacontenttype` defaults.
    pub(crate) fn into_headers(
        self,
        telemetry_topic: &str,
        content_type: &str,
    ) -> Vec<(String, String)> {
        let mut headers = vec![
            (
                HEADER_ID.to_string(),
                self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            ),
            (HEADER_SOURCE.to_string(), self.source),
            (HEADER_SPEC_VERSION.to_string(), self.spec_version),
            (HEADER_TYPE.to_string(), self.event_type),
            (
                HEADER_TIME.to_string(),
                self.time
                    .unwrap_or_else(Utc::now)
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
            (
                HEADER_SUBJECT.to_string(),
                self.subject
                    .unwrap_or_else(|| telemetry_topic.to_string()),
            ),
        ];
        if let Some(schema) = self.data_schema {
            headers.push((HEADER_DATA_SCHEMA.to_string(), schema));
        }
        let content_type = self
            .data_content_type
            .unwrap_or_else(|| content_type.to_string());
        if !content_type.is_empty() {
            headers.push((HEADER_DATA_CONTENT_TYPE.to_string(), content_type));
        }
        headers
    }

    /// Parses an envelope from inbound user properties.
    ///
    /// Returns `None` when the message carries no CloudEvents metadata (no
    /// `specversion` header).
    ///
    /// # Errors
    ///
    /// Returns an error of kind `HeaderInvalid` if the metadata is present
    /// but malformed (missing required fields, unparseable time).
    pub(crate) fn from_headers(
        properties: &[(String, String)],
    ) -> Result<Option<Self>> {
        let get = |name: &str| {
            properties
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
        };

        let Some(spec_version) = get(HEADER_SPEC_VERSION) else {
            return Ok(None);
        };

        let required = |name: &str| {
            get(name).ok_or_else(|| {
                Error::new(
                    ErrorKind::HeaderInvalid,
                    format!("CloudEvents envelope is missing the {name:?} attribute"),
                )
                .with_header_name(name.to_string())
            })
        };

        let time = match get(HEADER_TIME) {
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(&raw)
                    .map_err(|e| {
                        Error::new(
                            ErrorKind::HeaderInvalid,
                            format!("CloudEvents time {raw:?} is not RFC 3339"),
                        )
                        .with_header_name(HEADER_TIME)
                        .with_source(e)
                    })?
                    .with_timezone(&Utc),
            ),
            None => None,
        };

        Ok(Some(Self {
            source: required(HEADER_SOURCE)?,
            spec_version,
            event_type: required(HEADER_TYPE)?,
            id: Some(required(HEADER_ID)?),
            time,
            subject: get(HEADER_SUBJECT),
            data_schema: get(HEADER_DATA_SCHEMA),
            data_content_type: get(HEADER_DATA_CONTENT_TYPE),
        }))
    }
}

/// Builder for [`CloudEvent`].
#[derive(Debug, Default)]
pub struct CloudEventBuilder {
    source: Option<String>,
    spec_version: Option<String>,
    event_type: Option<String>,
    id: Option<String>,
    time: Option<DateTime<Utc>>,
    subject: Option<String>,
    data_schema: Option<String>,
}

impl CloudEventBuilder {
    /// Sets the event source (required).
    #[must_use]
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Sets the spec version (default and only supported value: `1.0`).
    #[must_use]
    pub fn spec_version(mut self, version: impl Into<String>) -> Self {
        self.spec_version = Some(version.into());
        self
    }

    /// Sets the event type (default: `com.edgelink.telemetry`).
    #[must_use]
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Sets the event id (default: fresh UUID at send time).
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the occurrence time (default: wall time at send time).
    #[must_use]
    pub fn time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    /// Sets the subject (default: the telemetry topic).
    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Sets the data schema URI.
    #[must_use]
    pub fn data_schema(mut self, schema: impl Into<String>) -> Self {
        self.data_schema = Some(schema.into());
        self
    }

    /// Builds the envelope.
    ///
    /// # Errors
    ///
    /// Returns a shallow error of kind `ConfigurationInvalid` if the source
    /// is missing or empty, if the spec version is not `1.0`, or if a
    /// provided field is empty.
    pub fn build(self) -> Result<CloudEvent> {
        let invalid = |field: &str, message: String| {
            Error::shallow(ErrorKind::ConfigurationInvalid, message)
                .with_property_name(field.to_string())
        };

        let source = self
            .source
            .filter(|s| !s.is_empty())
            .ok_or_else(|| invalid("source", "CloudEvent source is required".to_string()))?;

        let spec_version = self
            .spec_version
            .unwrap_or_else(|| CLOUD_EVENT_SPEC_VERSION.to_string());
        if spec_version != CLOUD_EVENT_SPEC_VERSION {
            return Err(invalid(
                "spec_version",
                format!("CloudEvents spec version {spec_version:?} is not supported"),
            ));
        }

        let event_type = self
            .event_type
            .unwrap_or_else(|| DEFAULT_EVENT_TYPE.to_string());
        if event_type.is_empty() {
            return Err(invalid(
                "event_type",
                "CloudEvent type must not be empty".to_string(),
            ));
        }

        if matches!(&self.id, Some(id) if id.is_empty()) {
            return Err(invalid("id", "CloudEvent id must not be empty".to_string()));
        }

        Ok(CloudEvent {
            source,
            spec_version,
            event_type,
            id: self.id,
            time: self.time,
            subject: self.subject,
            data_schema: self.data_schema,
            data_content_type: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let event = CloudEvent::builder().source("edge://sensor-1").build().unwrap();
        assert_eq!(event.spec_version, "1.0");
        assert_eq!(event.event_type, DEFAULT_EVENT_TYPE);
        assert!(event.id.is_none());
        assert!(event.time.is_none());
    }

    #[test]
    fn missing_source_rejected() {
        let err = CloudEvent::builder().build().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationInvalid);
        assert_eq!(err.property_name(), Some("source"));
    }

    #[test]
    fn unsupported_spec_version_rejected() {
        let err = CloudEvent::builder()
            .source("edge://s")
            .spec_version("2.0")
            .build()
            .unwrap_err();
        assert_eq!(err.property_name(), Some("spec_version"));
    }

    #[test]
    fn into_headers_fills_defaults() {
        let event = CloudEvent::builder().source("edge://sensor-1").build().unwrap();
        let headers = event.into_headers("fleet/edge-1/temp", "application/json");

        let get = |name: &str| {
            headers
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
        };
        assert!(Uuid::parse_str(&get("id").unwrap()).is_ok());
        assert_eq!(get("source").unwrap(), "edge://sensor-1");
        assert_eq!(get("specversion").unwrap(), "1.0");
        assert_eq!(get("subject").unwrap(), "fleet/edge-1/temp");
        assert_eq!(get("datacontenttype").unwrap(), "application/json");
        assert!(DateTime::parse_from_rfc3339(&get("time").unwrap()).is_ok());
    }

    #[test]
    fn headers_round_trip() {
        let time = DateTime::parse_from_rfc3339("2025-06-01T08:00:00.000Z")
            .unwrap()
            .with_timezone(&Utc);
        let event = CloudEvent::builder()
            .source("edge://sensor-1")
            .id("evt-1")
            .time(time)
            .subject("custom-subject")
            .data_schema("https://schemas.example/v1")
            .build()
            .unwrap();

        let headers = event.clone().into_headers("fleet/t", "application/json");
        let parsed = CloudEvent::from_headers(&headers).unwrap().unwrap();

        assert_eq!(parsed.source, "edge://sensor-1");
        assert_eq!(parsed.id.as_deref(), Some("evt-1"));
        assert_eq!(parsed.time, Some(time));
        assert_eq!(parsed.subject.as_deref(), Some("custom-subject"));
        assert_eq!(
            parsed.data_schema.as_deref(),
            Some("https://schemas.example/v1")
        );
        assert_eq!(parsed.data_content_type.as_deref(), Some("application/json"));
    }

    #[test]
    fn absent_envelope_parses_to_none() {
        let headers = vec![("__ts".to_string(), "x".to_string())];
        assert!(CloudEvent::from_headers(&headers).unwrap().is_none());
    }

    #[test]
    fn malformed_time_rejected() {
        let headers = vec![
            ("specversion".to_string(), "1.0".to_string()),
            ("source".to_string(), "edge://s".to_string()),
            ("type".to_string(), "t".to_string()),
            ("id".to_string(), "1".to_string()),
            ("time".to_string(), "yesterday".to_string()),
        ];
        let err = CloudEvent::from_headers(&headers).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HeaderInvalid);
        assert_eq!(err.header_name(), Some("time"));
    }

    #[test]
    fn reserved_header_detection() {
        assert!(is_cloud_event_header("id"));
        assert!(is_cloud_event_header("datacontenttype"));
        assert!(!is_cloud_event_header("__ts"));
        assert!(!is_cloud_event_header("custom"));
    }
}
