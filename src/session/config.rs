// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Connection settings for the session client.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, ErrorKind, Result};

/// How the session authenticates with the broker.
#[derive(Debug, Clone)]
pub enum AuthMethod {
    /// Username and password supplied directly.
    Password {
        /// Broker username.
        username: String,
        /// Broker password.
        password: String,
    },
    /// Bearer token read from a file and sent as the MQTT password.
    ///
    /// The file is re-read whenever its modification time changes, so
    /// rotated tokens take effect on the next (re)connect. If the broker
    /// rejects the current credentials, the session reloads the file once
    /// before giving up.
    BearerTokenFile {
        /// Path to the token file.
        path: PathBuf,
        /// Username presented alongside the token.
        username: String,
    },
}

/// TLS settings for the broker connection.
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    /// Path to the PEM-encoded CA trust bundle.
    pub ca_file: Option<PathBuf>,
    /// Paths to the PEM-encoded client certificate and private key, for
    /// mutual TLS.
    pub client_auth: Option<(PathBuf, PathBuf)>,
}

/// Settings describing one broker connection.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub(crate) client_id: String,
    pub(crate) hostname: String,
    pub(crate) port: u16,
    pub(crate) keep_alive: Duration,
    pub(crate) session_expiry: Duration,
    pub(crate) clean_start: bool,
    pub(crate) auth: Option<AuthMethod>,
    pub(crate) tls: Option<TlsSettings>,
    pub(crate) auth_poll_interval: Duration,
}

impl ConnectionSettings {
    /// Creates a builder.
    #[must_use]
    pub fn builder() -> ConnectionSettingsBuilder {
        ConnectionSettingsBuilder::default()
    }

    /// Returns the MQTT client id.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

/// Builder for [`ConnectionSettings`].
#[derive(Debug, Default)]
pub struct ConnectionSettingsBuilder {
    client_id: Option<String>,
    hostname: Option<String>,
    port: Option<u16>,
    keep_alive: Option<Duration>,
    session_expiry: Option<Duration>,
    clean_start: Option<bool>,
    auth: Option<AuthMethod>,
    tls: Option<TlsSettings>,
    auth_poll_interval: Option<Duration>,
}

impl ConnectionSettingsBuilder {
    /// Sets the MQTT client id (required).
    #[must_use]
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    /// Sets the broker hostname (required).
    #[must_use]
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Sets the broker port (default: 1883, or 8883 with TLS).
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets the keep-alive interval (default: 30 seconds).
    #[must_use]
    pub fn keep_alive(mut self, duration: Duration) -> Self {
        self.keep_alive = Some(duration);
        self
    }

    /// Sets the MQTT5 session expiry interval (default: 1 hour).
    ///
    /// This is how long the broker retains subscriptions and undelivered
    /// messages while the client is away.
    #[must_use]
    pub fn session_expiry(mut self, duration: Duration) -> Self {
        self.session_expiry = Some(duration);
        self
    }

    /// Sets whether the first connect discards existing broker session
    /// state (default: true).
    #[must_use]
    pub fn clean_start(mut self, clean_start: bool) -> Self {
        self.clean_start = Some(clean_start);
        self
    }

    /// Sets username/password authentication.
    #[must_use]
    pub fn password_auth(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.auth = Some(AuthMethod::Password {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Sets bearer-token-file authentication.
    #[must_use]
    pub fn bearer_token_file(
        mut self,
        path: impl Into<PathBuf>,
        username: impl Into<String>,
    ) -> Self {
        self.auth = Some(AuthMethod::BearerTokenFile {
            path: path.into(),
            username: username.into(),
        });
        self
    }

    /// Sets TLS settings.
    #[must_use]
    pub fn tls(mut self, tls: TlsSettings) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Sets how often the bearer token file is polled for rotation
    /// (default: 10 seconds).
    #[must_use]
    pub fn auth_poll_interval(mut self, interval: Duration) -> Self {
        self.auth_poll_interval = Some(interval);
        self
    }

    /// Builds the settings.
    ///
    /// # Errors
    ///
    /// Returns a shallow error of kind `ConfigurationInvalid` if the
    /// client id or hostname is missing or empty, or if the session expiry
    /// does not fit the wire representation.
    pub fn build(self) -> Result<ConnectionSettings> {
        let missing = |field: &str| {
            Error::shallow(
                ErrorKind::ConfigurationInvalid,
                format!("connection settings field {field:?} is required"),
            )
            .with_property_name(field.to_string())
        };

        let client_id = self.client_id.filter(|id| !id.is_empty());
        let client_id = client_id.ok_or_else(|| missing("client_id"))?;
        let hostname = self.hostname.filter(|h| !h.is_empty());
        let hostname = hostname.ok_or_else(|| missing("hostname"))?;

        let session_expiry = self.session_expiry.unwrap_or(Duration::from_secs(3600));
        if u32::try_from(session_expiry.as_secs()).is_err() {
            return Err(Error::shallow(
                ErrorKind::ConfigurationInvalid,
                "session expiry exceeds the u32 seconds wire representation",
            )
            .with_property_name("session_expiry"));
        }

        let port = self
            .port
            .unwrap_or(if self.tls.is_some() { 8883 } else { 1883 });

        Ok(ConnectionSettings {
            client_id,
            hostname,
            port,
            keep_alive: self.keep_alive.unwrap_or(Duration::from_secs(30)),
            session_expiry,
            clean_start: self.clean_start.unwrap_or(true),
            auth: self.auth,
            tls: self.tls,
            auth_poll_interval: self.auth_poll_interval.unwrap_or(Duration::from_secs(10)),
        })
    }
}
