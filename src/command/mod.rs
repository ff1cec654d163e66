// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command (RPC) primitives.
//!
//! A command is a request/response exchange between an *invoker* and an
//! *executor*, correlated by an opaque id and carried over MQTT5 publish
//! topics. The invoker enforces a client-side deadline mirrored into the
//! message expiry; the executor deduplicates retried requests and can
//! replay cached responses for idempotent commands.
//!
//! | Role | Type |
//! |------|------|
//! | Issue requests | [`CommandInvoker`] |
//! | Serve requests | [`CommandExecutor`] |
//! | Describe a command | [`CommandDeclaration`] |

mod cache;
mod executor;
mod invoker;
#[cfg(test)]
mod rpc_tests;

pub use executor::{
    CommandExecutor, CommandExecutorOptions, HandlerError, IncomingRequest, OutgoingResponse,
};
pub use invoker::{
    CommandInvoker, CommandInvokerOptions, CommandRequest, CommandRequestBuilder, CommandResponse,
};

use std::time::Duration;

use crate::error::{Error, ErrorKind, Result};

/// Compile-time description of one command, shared by the invoker and
/// executor factories.
#[derive(Debug, Clone)]
pub struct CommandDeclaration {
    pub(crate) command_name: String,
    pub(crate) idempotent: bool,
    pub(crate) cache_ttl: Duration,
}

impl CommandDeclaration {
    /// Declares a non-idempotent command with the given name.
    ///
    /// # Errors
    ///
    /// Returns a shallow error of kind `ConfigurationInvalid` if the name
    /// is empty or not a valid topic segment.
    pub fn new(command_name: impl Into<String>) -> Result<Self> {
        let command_name = command_name.into();
        if command_name.is_empty()
            || command_name.contains(['/', '+', '#'])
            || command_name.chars().any(|c| c.is_control() || c == ' ')
        {
            return Err(Error::shallow(
                ErrorKind::ConfigurationInvalid,
                format!("command name {command_name:?} is not a valid topic segment"),
            )
            .with_property_name("command_name"));
        }
        Ok(Self {
            command_name,
            idempotent: false,
            cache_ttl: Duration::ZERO,
        })
    }

    /// Marks the command idempotent: retried requests within the cache TTL
    /// replay the original response instead of re-running the handler.
    #[must_use]
    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    /// Sets how long the executor caches responses for replay
    /// (default: zero, meaning no caching).
    #[must_use]
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Returns the command name.
    #[must_use]
    pub fn command_name(&self) -> &str {
        &self.command_name
    }

    /// Returns true if the command is declared idempotent.
    #[must_use]
    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    /// Validates the declaration as a whole.
    ///
    /// # Errors
    ///
    /// Returns a shallow error of kind `ConfigurationInvalid` if a cache
    /// TTL is set on a non-idempotent command.
    pub(crate) fn validate(&self) -> Result<()> {
        if !self.idempotent && !self.cache_ttl.is_zero() {
            return Err(Error::shallow(
                ErrorKind::ConfigurationInvalid,
                "a cache TTL requires the command to be idempotent",
            )
            .with_property_name("cache_ttl"));
        }
        Ok(())
    }
}
