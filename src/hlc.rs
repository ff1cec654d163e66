// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hybrid logical clock used to timestamp outgoing messages and reconcile
//! ordering against peers.
//!
//! A [`HybridLogicalClock`] is a triple of wall-clock milliseconds, a logical
//! counter, and a node id. Successive stamps produced by one
//! [`SharedHybridLogicalClock`] are strictly increasing in
//! (wall, counter) lexicographic order, even when the wall clock stalls or
//! steps backwards. Merging a peer stamp advances the local clock past the
//! peer so that causally later messages always carry later stamps.
//!
//! Wire encoding: `<iso8601-millis>:<counter>:<nodeId>`.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;

use crate::error::{Error, ErrorKind, Result};

/// Default maximum allowed clock drift into the future.
pub const DEFAULT_MAX_CLOCK_DRIFT: Duration = Duration::from_secs(60);

/// A single hybrid logical clock stamp.
///
/// Stamps are totally ordered by (wall time, counter, node id), in that
/// order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct HybridLogicalClock {
    /// Wall clock component, truncated to millisecond precision.
    timestamp: DateTime<Utc>,
    /// Logical counter disambiguating stamps within one millisecond.
    counter: u64,
    /// Identifier of the node that produced the stamp.
    node_id: String,
}

impl HybridLogicalClock {
    /// Creates a stamp from its components.
    ///
    /// # Errors
    ///
    /// Returns an error of kind `ConfigurationInvalid` if `node_id` is empty
    /// or contains `:` (which would be ambiguous in the wire encoding).
    pub fn new(
        timestamp: DateTime<Utc>,
        counter: u64,
        node_id: impl Into<String>,
    ) -> Result<Self> {
        let node_id = node_id.into();
        if node_id.is_empty() || node_id.contains(':') {
            return Err(Error::shallow(
                ErrorKind::ConfigurationInvalid,
                format!("invalid hybrid logical clock node id: {node_id:?}"),
            )
            .with_property_name("node_id"));
        }
        Ok(Self {
            timestamp: truncate_to_millis(timestamp),
            counter,
            node_id,
        })
    }

    /// Returns the wall clock component.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Returns the logical counter.
    #[must_use]
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Returns the node id.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

impl std::fmt::Display for HybridLogicalClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.counter,
            self.node_id
        )
    }
}

impl FromStr for HybridLogicalClock {
    type Err = Error;

    /// Parses the wire encoding `<iso8601-millis>:<counter>:<nodeId>`.
    ///
    /// The timestamp itself contains colons, so the string is split from the
    /// right.
    fn from_str(s: &str) -> Result<Self> {
        let malformed = || {
            Error::new(
                ErrorKind::HeaderInvalid,
                format!("malformed hybrid logical clock stamp: {s:?}"),
            )
        };

        let (rest, node_id) = s.rsplit_once(':').ok_or_else(malformed)?;
        let (timestamp, counter) = rest.rsplit_once(':').ok_or_else(malformed)?;

        let timestamp = DateTime::parse_from_rfc3339(timestamp)
            .map_err(|e| malformed().with_source(e))?
            .with_timezone(&Utc);
        let counter: u64 = counter.parse().map_err(|_| malformed())?;

        Self::new(timestamp, counter, node_id).map_err(|_| malformed())
    }
}

fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}

/// A thread-safe hybrid logical clock shared across all components of one
/// logical node.
///
/// Created by (and usually accessed through) the
/// [`ApplicationContext`](crate::application::ApplicationContext).
#[derive(Debug)]
pub struct SharedHybridLogicalClock {
    current: Mutex<HybridLogicalClock>,
    max_drift: Duration,
}

impl SharedHybridLogicalClock {
    /// Creates a clock for the given node id with the given maximum drift.
    ///
    /// # Errors
    ///
    /// Returns an error of kind `ConfigurationInvalid` if the node id is
    /// invalid.
    pub fn new(node_id: impl Into<String>, max_drift: Duration) -> Result<Self> {
        let initial = HybridLogicalClock::new(Utc::now(), 0, node_id)?;
        Ok(Self {
            current: Mutex::new(initial),
            max_drift,
        })
    }

    /// Advances the clock for an outgoing message and returns the new stamp.
    ///
    /// The returned stamp is strictly greater than every stamp previously
    /// returned by this instance.
    ///
    /// # Errors
    ///
    /// Returns an error of kind `StateInvalid` if the clock has drifted more
    /// than the configured maximum past the wall clock, or if the logical
    /// counter would overflow.
    pub fn update(&self) -> Result<HybridLogicalClock> {
        let now = truncate_to_millis(Utc::now());
        let mut current = self.current.lock();

        if current.timestamp >= now {
            // Wall clock has not advanced past the last stamp; bump the
            // counter instead.
            current.counter = current.counter.checked_add(1).ok_or_else(|| {
                Error::new(
                    ErrorKind::StateInvalid,
                    "hybrid logical clock counter overflow",
                )
            })?;
        } else {
            current.timestamp = now;
            current.counter = 0;
        }

        self.check_drift(&current, now)?;
        Ok(current.clone())
    }

    /// Merges a peer stamp into the clock and returns the new local stamp.
    ///
    /// The clock advances to at least max(local, peer, now), so that any
    /// stamp produced after this call is greater than both the peer stamp
    /// and all previously returned local stamps.
    ///
    /// # Errors
    ///
    /// Returns an error of kind `StateInvalid` if the peer stamp (or the
    /// merged clock) exceeds the wall clock by more than the configured
    /// maximum drift, or if the logical counter would overflow.
    pub fn update_with(&self, peer: &HybridLogicalClock) -> Result<HybridLogicalClock> {
        let now = truncate_to_millis(Utc::now());
        let mut current = self.current.lock();

        let overflow = || {
            Error::new(
                ErrorKind::StateInvalid,
                "hybrid logical clock counter overflow",
            )
        };

        if current.timestamp >= now && current.timestamp >= peer.timestamp {
            if current.timestamp == peer.timestamp {
                current.counter = current
                    .counter
                    .max(peer.counter)
                    .checked_add(1)
                    .ok_or_else(overflow)?;
            } else {
                current.counter = current.counter.checked_add(1).ok_or_else(overflow)?;
            }
        } else if peer.timestamp >= now && peer.timestamp > current.timestamp {
            current.timestamp = peer.timestamp;
            current.counter = peer.counter.checked_add(1).ok_or_else(overflow)?;
        } else {
            current.timestamp = now;
            current.counter = 0;
        }

        self.check_drift(&current, now)?;
        Ok(current.clone())
    }

    /// Returns a snapshot of the current stamp without advancing the clock.
    #[must_use]
    pub fn read(&self) -> HybridLogicalClock {
        self.current.lock().clone()
    }

    fn check_drift(&self, stamp: &HybridLogicalClock, now: DateTime<Utc>) -> Result<()> {
        let limit = now
            + chrono::Duration::from_std(self.max_drift).unwrap_or(chrono::Duration::seconds(60));
        if stamp.timestamp > limit {
            return Err(Error::new(
                ErrorKind::StateInvalid,
                format!(
                    "hybrid logical clock is {}ms ahead of the wall clock, exceeding the maximum drift of {}ms",
                    (stamp.timestamp - now).num_milliseconds(),
                    self.max_drift.as_millis()
                ),
            ));
        }
        Ok(())
    }
}
