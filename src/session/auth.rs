// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Credential loading and rotation for the session client.
//!
//! Bearer tokens live in files that an external agent rotates in place. The
//! session polls the file's modification time and reloads the token when it
//! changes; the new credentials take effect on the next (re)connect, or
//! immediately when the broker rejects the old ones.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;

use crate::error::{Error, ErrorKind, Result};
use crate::session::config::{AuthMethod, TlsSettings};

/// A username/password pair ready to hand to the MQTT options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Credentials {
    pub(crate) username: String,
    pub(crate) password: String,
}

/// Loads the current credentials for an auth method.
pub(crate) fn load_credentials(auth: &AuthMethod) -> Result<Credentials> {
    match auth {
        AuthMethod::Password { username, password } => Ok(Credentials {
            username: username.clone(),
            password: password.clone(),
        }),
        AuthMethod::BearerTokenFile { path, username } => {
            let token = read_token_file(path)?;
            Ok(Credentials {
                username: username.clone(),
                password: token,
            })
        }
    }
}

/// Reads and trims a bearer token file.
pub(crate) fn read_token_file(path: &Path) -> Result<String> {
    let token = std::fs::read_to_string(path).map_err(|e| {
        Error::new(
            ErrorKind::AuthFailed,
            format!("cannot read bearer token file {}", path.display()),
        )
        .with_source(e)
    })?;
    let token = token.trim().to_string();
    if token.is_empty() {
        return Err(Error::new(
            ErrorKind::AuthFailed,
            format!("bearer token file {} is empty", path.display()),
        ));
    }
    Ok(token)
}

/// PEM materials loaded for a TLS connection.
pub(crate) struct TlsMaterials {
    pub(crate) ca: Option<Vec<u8>>,
    pub(crate) client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

/// Reads the CA bundle and client certificate/key files.
pub(crate) fn load_tls_materials(tls: &TlsSettings) -> Result<TlsMaterials> {
    let read = |path: &PathBuf| {
        std::fs::read(path).map_err(|e| {
            Error::new(
                ErrorKind::ConfigurationInvalid,
                format!("cannot read TLS file {}", path.display()),
            )
            .with_source(e)
        })
    };

    let ca = tls.ca_file.as_ref().map(&read).transpose()?;
    let client_auth = match &tls.client_auth {
        Some((cert, key)) => Some((read(cert)?, read(key)?)),
        None => None,
    };
    Ok(TlsMaterials { ca, client_auth })
}

/// Spawns a task that polls the token file's mtime and reports fresh tokens
/// through `on_rotation`.
///
/// The task runs until aborted (the session aborts it on exit).
pub(crate) fn spawn_token_watcher(
    path: PathBuf,
    poll_interval: Duration,
    on_rotation: impl Fn(String) + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_mtime = file_mtime(&path);
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so the initial load
        // (done by the session at connect time) is not repeated.
        interval.tick().await;

        loop {
            interval.tick().await;
            let mtime = file_mtime(&path);
            if mtime == last_mtime {
                continue;
            }
            last_mtime = mtime;
            match read_token_file(&path) {
                Ok(token) => {
                    tracing::info!(path = %path.display(), "Bearer token rotated");
                    on_rotation(token);
                }
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "Failed to reload rotated bearer token");
                }
            }
        }
    })
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
