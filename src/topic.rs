// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Topic template engine.
//!
//! A topic pattern is a `/`-separated string of literal segments and
//! `{token}` placeholders, for example
//! `fleet/math/{executorId}/{commandName}`. Patterns are validated eagerly
//! when a [`TopicPattern`] is constructed; token values supplied at
//! construction are checked then, while tokens left unresolved are
//! substituted per call from an overlay map (the overlay wins when both
//! define a token).
//!
//! [`TopicPattern::match_topic`] runs the template in reverse: each
//! `{token}` placeholder matches exactly one MQTT topic segment and its
//! value is captured.

use std::collections::HashMap;

use crate::error::{Error, ErrorKind, Result, Value};

/// Well-known token replaced by the model/interface identifier.
pub const TOKEN_MODEL_ID: &str = "modelId";
/// Well-known token replaced by the command name.
pub const TOKEN_COMMAND_NAME: &str = "commandName";
/// Well-known token replaced by the telemetry name.
pub const TOKEN_TELEMETRY_NAME: &str = "telemetryName";
/// Well-known token replaced by the executor's client id.
pub const TOKEN_EXECUTOR_ID: &str = "executorId";
/// Well-known token replaced by the invoker's client id.
pub const TOKEN_INVOKER_CLIENT_ID: &str = "invokerClientId";
/// Well-known token replaced by the telemetry sender's id.
pub const TOKEN_SENDER_ID: &str = "senderId";

/// One parsed segment of a topic pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    /// A literal topic segment, matched verbatim.
    Literal(String),
    /// A `{token}` placeholder, matching exactly one topic segment.
    Token(String),
}

/// A validated topic pattern with token substitution.
#[derive(Debug, Clone)]
pub struct TopicPattern {
    /// The original pattern, for diagnostics.
    pattern: String,
    /// Parsed segments in order.
    segments: Vec<Segment>,
    /// Token values bound at construction time.
    tokens: HashMap<String, String>,
}

impl TopicPattern {
    /// Parses and validates a topic pattern.
    ///
    /// `namespace`, when given, is prepended to the pattern as literal
    /// segments. Values in `tokens` are bound permanently and validated
    /// here; tokens not present in the map remain open for per-call
    /// resolution.
    ///
    /// # Errors
    ///
    /// Returns a shallow error of kind `ConfigurationInvalid` if the
    /// pattern is empty, contains an empty or wildcard segment, contains a
    /// malformed `{token}` placeholder, or if a bound token value is not a
    /// valid MQTT topic segment.
    pub fn new(
        pattern: &str,
        namespace: Option<&str>,
        tokens: &HashMap<String, String>,
    ) -> Result<Self> {
        let invalid = |message: String, value: &str| {
            Error::shallow(ErrorKind::ConfigurationInvalid, message)
                .with_property_name("topic_pattern")
                .with_property_value(Value::String(value.to_string()))
        };

        if pattern.trim().is_empty() {
            return Err(invalid("topic pattern is empty".to_string(), pattern));
        }

        let full_pattern = match namespace {
            Some(ns) if !ns.is_empty() => {
                for segment in ns.split('/') {
                    if !is_valid_literal_segment(segment) {
                        return Err(invalid(
                            format!("topic namespace segment {segment:?} is invalid"),
                            ns,
                        ));
                    }
                }
                format!("{ns}/{pattern}")
            }
            _ => pattern.to_string(),
        };

        let mut segments = Vec::new();
        for segment in full_pattern.split('/') {
            if let Some(token) = segment
                .strip_prefix('{')
                .and_then(|s| s.strip_suffix('}'))
            {
                if !is_valid_token_name(token) {
                    return Err(invalid(
                        format!("topic pattern token {token:?} is invalid"),
                        &full_pattern,
                    ));
                }
                segments.push(Segment::Token(token.to_string()));
            } else {
                if !is_valid_literal_segment(segment) {
                    return Err(invalid(
                        format!("topic pattern segment {segment:?} is invalid"),
                        &full_pattern,
                    ));
                }
                segments.push(Segment::Literal(segment.to_string()));
            }
        }

        for (token, value) in tokens {
            if !is_valid_token_name(token) {
                return Err(invalid(format!("token name {token:?} is invalid"), token));
            }
            if !is_valid_replacement(value) {
                return Err(invalid(
                    format!("replacement value {value:?} for token {token:?} is invalid"),
                    value,
                ));
            }
        }

        Ok(Self {
            pattern: full_pattern,
            segments,
            tokens: tokens.clone(),
        })
    }

    /// Returns the pattern string this instance was built from (including
    /// any namespace prefix).
    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Resolves the pattern into a concrete publish topic.
    ///
    /// Tokens are looked up in `overlay` first and fall back to the values
    /// bound at construction.
    ///
    /// # Errors
    ///
    /// Returns a shallow error of kind `ConfigurationInvalid` if a token
    /// has no value in either map, or if an overlay value is not a valid
    /// MQTT topic segment.
    pub fn publish_topic(&self, overlay: &HashMap<String, String>) -> Result<String> {
        let mut topic = String::with_capacity(self.pattern.len());
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                topic.push('/');
            }
            match segment {
                Segment::Literal(lit) => topic.push_str(lit),
                Segment::Token(token) => {
                    let value = overlay
                        .get(token)
                        .or_else(|| self.tokens.get(token))
                        .ok_or_else(|| {
                            Error::shallow(
                                ErrorKind::ConfigurationInvalid,
                                format!("token {token:?} in topic pattern {:?} is unresolved", self.pattern),
                            )
                            .with_property_name(token.clone())
                        })?;
                    if !is_valid_replacement(value) {
                        return Err(Error::shallow(
                            ErrorKind::ConfigurationInvalid,
                            format!("replacement value {value:?} for token {token:?} is invalid"),
                        )
                        .with_property_name(token.clone())
                        .with_property_value(Value::String(value.clone())));
                    }
                    topic.push_str(value);
                }
            }
        }
        Ok(topic)
    }

    /// Returns the MQTT subscribe filter for this pattern.
    ///
    /// Tokens bound at construction are substituted; unresolved tokens
    /// become single-level (`+`) wildcards.
    #[must_use]
    pub fn subscribe_filter(&self) -> String {
        let mut filter = String::with_capacity(self.pattern.len());
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                filter.push('/');
            }
            match segment {
                Segment::Literal(lit) => filter.push_str(lit),
                Segment::Token(token) => match self.tokens.get(token) {
                    Some(value) => filter.push_str(value),
                    None => filter.push('+'),
                },
            }
        }
        filter
    }

    /// Matches a concrete topic against the pattern, capturing token
    /// values.
    ///
    /// Literal segments (and tokens bound at construction) must match
    /// exactly; each open token captures exactly one segment. Returns
    /// `None` if the topic does not match.
    #[must_use]
    pub fn match_topic(&self, topic: &str) -> Option<HashMap<String, String>> {
        let mut captured = HashMap::new();
        let mut topic_segments = topic.split('/');

        for segment in &self.segments {
            let actual = topic_segments.next()?;
            match segment {
                Segment::Literal(lit) => {
                    if lit != actual {
                        return None;
                    }
                }
                Segment::Token(token) => {
                    if let Some(bound) = self.tokens.get(token) {
                        if bound != actual {
                            return None;
                        }
                    } else if actual.is_empty() || !is_valid_replacement(actual) {
                        return None;
                    }
                    captured.insert(token.clone(), actual.to_string());
                }
            }
        }

        if topic_segments.next().is_some() {
            return None;
        }
        Some(captured)
    }
}

/// Returns true if `name` is a valid token name (alphanumeric plus `:`).
fn is_valid_token_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == ':')
}

/// Returns true if `segment` is a valid literal pattern segment.
fn is_valid_literal_segment(segment: &str) -> bool {
    !segment.is_empty()
        && !segment.contains(['+', '#', '{', '}'])
        && segment.chars().all(|c| !c.is_control() && c != ' ')
}

/// Returns true if `value` is a valid replacement for a token: a single
/// MQTT topic segment with no wildcards or control characters.
fn is_valid_replacement(value: &str) -> bool {
    !value.is_empty()
        && !value.contains(['/', '+', '#'])
        && value.chars().all(|c| !c.is_control() && c != ' ')
}
