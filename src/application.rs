// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Process-wide application context.
//!
//! An [`ApplicationContext`] holds the state shared by every protocol
//! component of one logical node - today, the hybrid logical clock. There
//! is no implicit global instance: the context is created once and injected
//! explicitly into every sender, receiver, invoker, and executor
//! constructor, and must outlive all of them.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::error::Result;
use crate::hlc::{DEFAULT_MAX_CLOCK_DRIFT, SharedHybridLogicalClock};

/// Shared per-process context for protocol components.
///
/// Cheaply cloneable; all clones refer to the same hybrid logical clock.
///
/// # Examples
///
/// ```
/// use edgelink_lib::ApplicationContext;
///
/// let context = ApplicationContext::builder().build().unwrap();
/// let stamp = context.hlc().update().unwrap();
/// let later = context.hlc().update().unwrap();
/// assert!(later > stamp);
/// ```
#[derive(Debug, Clone)]
pub struct ApplicationContext {
    hlc: Arc<SharedHybridLogicalClock>,
}

impl ApplicationContext {
    /// Creates a builder with default settings.
    #[must_use]
    pub fn builder() -> ApplicationContextBuilder {
        ApplicationContextBuilder::default()
    }

    /// Returns the process-wide hybrid logical clock.
    #[must_use]
    pub fn hlc(&self) -> &Arc<SharedHybridLogicalClock> {
        &self.hlc
    }
}

/// Builder for [`ApplicationContext`].
#[derive(Debug, Default)]
pub struct ApplicationContextBuilder {
    node_id: Option<String>,
    max_clock_drift: Option<Duration>,
}

impl ApplicationContextBuilder {
    /// Sets the hybrid logical clock node id.
    ///
    /// Defaults to a fresh UUID. Typically set to the MQTT client id so
    /// that clock stamps identify their origin.
    #[must_use]
    pub fn node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Sets the maximum tolerated clock drift (default: 60 seconds).
    #[must_use]
    pub fn max_clock_drift(mut self, drift: Duration) -> Self {
        self.max_clock_drift = Some(drift);
        self
    }

    /// Builds the context.
    ///
    /// # Errors
    ///
    /// Returns an error of kind `ConfigurationInvalid` if the node id is
    /// empty or contains `:`.
    pub fn build(self) -> Result<ApplicationContext> {
        let node_id = self
            .node_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let hlc = SharedHybridLogicalClock::new(
            node_id,
            self.max_clock_drift.unwrap_or(DEFAULT_MAX_CLOCK_DRIFT),
        )?;
        Ok(ApplicationContext { hlc: Arc::new(hlc) })
    }
}
