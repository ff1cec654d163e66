// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The session client: a long-lived MQTT5 connection with reconnection,
//! credential refresh, publish queueing, and acknowledgement tracking.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rumqttc::Outgoing;
use rumqttc::v5::mqttbytes::QoS as MqttQoS;
use rumqttc::v5::mqttbytes::v5::{
    ConnectReturnCode, Packet, PubAckReason, Publish, PublishProperties, SubscribeReasonCode,
};
use rumqttc::v5::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions};
use tokio::sync::{Notify, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, ErrorKind, Result};
use crate::session::ack::{AckSink, AckToken, AckTracker};
use crate::session::auth::{self, Credentials};
use crate::session::config::{AuthMethod, ConnectionSettings};
use crate::session::dispatcher::Dispatcher;
use crate::session::queue::PendingQueue;
use crate::session::reconnect::{ExponentialBackoff, ReconnectPolicy};
use crate::session::state::{ConnectionEvent, ConnectionEventStream, ConnectionMonitor, SessionState};
use crate::session::{
    InboundMessage, ManagedClient, MessageProperties, MessageStream, OutgoingPublish,
    PublishCompletion, QoS,
};

/// Capacity of the rumqttc request channel.
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Options for creating a [`Session`].
pub struct SessionOptions {
    connection_settings: ConnectionSettings,
    reconnect_policy: Box<dyn ReconnectPolicy>,
}

impl std::fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOptions")
            .field("connection_settings", &self.connection_settings)
            .finish_non_exhaustive()
    }
}

impl SessionOptions {
    /// Creates a builder.
    #[must_use]
    pub fn builder() -> SessionOptionsBuilder {
        SessionOptionsBuilder::default()
    }
}

/// Builder for [`SessionOptions`].
#[derive(Default)]
pub struct SessionOptionsBuilder {
    connection_settings: Option<ConnectionSettings>,
    reconnect_policy: Option<Box<dyn ReconnectPolicy>>,
}

impl SessionOptionsBuilder {
    /// Sets the broker connection settings (required).
    #[must_use]
    pub fn connection_settings(mut self, settings: ConnectionSettings) -> Self {
        self.connection_settings = Some(settings);
        self
    }

    /// Sets the reconnect policy (default: [`ExponentialBackoff`] with
    /// base 1 s, cap 60 s, 10 attempts).
    #[must_use]
    pub fn reconnect_policy(mut self, policy: impl ReconnectPolicy + 'static) -> Self {
        self.reconnect_policy = Some(Box::new(policy));
        self
    }

    /// Builds the options.
    ///
    /// # Errors
    ///
    /// Returns a shallow error of kind `ConfigurationInvalid` if the
    /// connection settings are missing.
    pub fn build(self) -> Result<SessionOptions> {
        let connection_settings = self.connection_settings.ok_or_else(|| {
            Error::shallow(
                ErrorKind::ConfigurationInvalid,
                "connection settings are required",
            )
            .with_property_name("connection_settings")
        })?;
        Ok(SessionOptions {
            connection_settings,
            reconnect_policy: self
                .reconnect_policy
                .unwrap_or_else(|| Box::new(ExponentialBackoff::default())),
        })
    }
}

/// Completion waiter for a submitted publish, correlated to its transport
/// packet by submission order.
struct PubWaiter {
    qos: QoS,
    tx: oneshot::Sender<Result<()>>,
}

/// Correlates request submissions to their broker acknowledgements.
///
/// rumqttc assigns packet ids inside its event loop, so the id of a
/// submitted request is learned from the corresponding `Outgoing` event.
/// Requests enter the transport channel in submission order (the session
/// serializes submissions), so each `Outgoing` event resolves the oldest
/// waiting entry.
#[derive(Default)]
struct CompletionLedger {
    pub_waiting: Mutex<VecDeque<PubWaiter>>,
    pub_inflight: Mutex<HashMap<u16, oneshot::Sender<Result<()>>>>,
    sub_waiting: Mutex<VecDeque<oneshot::Sender<Result<()>>>>,
    sub_inflight: Mutex<HashMap<u16, oneshot::Sender<Result<()>>>>,
    unsub_waiting: Mutex<VecDeque<oneshot::Sender<Result<()>>>>,
    unsub_inflight: Mutex<HashMap<u16, oneshot::Sender<Result<()>>>>,
}

impl CompletionLedger {
    fn push_publish(&self, qos: QoS, tx: oneshot::Sender<Result<()>>) {
        self.pub_waiting.lock().push_back(PubWaiter { qos, tx });
    }

    /// Removes the most recently pushed publish waiter (submission failed
    /// synchronously, so no `Outgoing` event will come).
    fn cancel_last_publish(&self) {
        self.pub_waiting.lock().pop_back();
    }

    fn on_outgoing_publish(&self, pkid: u16) {
        if pkid != 0 && self.pub_inflight.lock().contains_key(&pkid) {
            // Retransmission of an in-flight publish after a reconnect.
            return;
        }
        let Some(waiter) = self.pub_waiting.lock().pop_front() else {
            return;
        };
        match waiter.qos {
            // QoS 0 has no broker acknowledgement.
            QoS::AtMostOnce => {
                let _ = waiter.tx.send(Ok(()));
            }
            QoS::AtLeastOnce => {
                self.pub_inflight.lock().insert(pkid, waiter.tx);
            }
        }
    }

    fn on_puback(&self, pkid: u16, reason: PubAckReason) {
        let Some(tx) = self.pub_inflight.lock().remove(&pkid) else {
            return;
        };
        let result = match reason {
            PubAckReason::Success | PubAckReason::NoMatchingSubscribers => Ok(()),
            other => Err(Error::new(
                ErrorKind::StateInvalid,
                format!("publish rejected by broker: {other:?}"),
            )),
        };
        let _ = tx.send(result);
    }

    fn push_subscribe(&self, tx: oneshot::Sender<Result<()>>) {
        self.sub_waiting.lock().push_back(tx);
    }

    fn cancel_last_subscribe(&self) {
        self.sub_waiting.lock().pop_back();
    }

    fn on_outgoing_subscribe(&self, pkid: u16) {
        if self.sub_inflight.lock().contains_key(&pkid) {
            return;
        }
        if let Some(tx) = self.sub_waiting.lock().pop_front() {
            self.sub_inflight.lock().insert(pkid, tx);
        }
    }

    fn on_suback(&self, pkid: u16, codes: &[SubscribeReasonCode]) {
        let Some(tx) = self.sub_inflight.lock().remove(&pkid) else {
            return;
        };
        let granted = codes
            .iter()
            .all(|code| matches!(code, SubscribeReasonCode::Success(_)));
        let result = if granted {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::StateInvalid,
                format!("subscription rejected by broker: {codes:?}"),
            ))
        };
        let _ = tx.send(result);
    }

    fn push_unsubscribe(&self, tx: oneshot::Sender<Result<()>>) {
        self.unsub_waiting.lock().push_back(tx);
    }

    fn cancel_last_unsubscribe(&self) {
        self.unsub_waiting.lock().pop_back();
    }

    fn on_outgoing_unsubscribe(&self, pkid: u16) {
        if self.unsub_inflight.lock().contains_key(&pkid) {
            return;
        }
        if let Some(tx) = self.unsub_waiting.lock().pop_front() {
            self.unsub_inflight.lock().insert(pkid, tx);
        }
    }

    fn on_unsuback(&self, pkid: u16) {
        if let Some(tx) = self.unsub_inflight.lock().remove(&pkid) {
            let _ = tx.send(Ok(()));
        }
    }

    /// On a connection drop, in-flight subscribe/unsubscribe waiters are
    /// resolved optimistically: the subscription table survives and is
    /// replayed on reconnect, so the requested state will be established.
    /// In-flight publishes are left alone; the transport retransmits them
    /// under the continued session and their acknowledgements arrive later.
    fn on_disconnect(&self) {
        for (_, tx) in self.sub_inflight.lock().drain() {
            let _ = tx.send(Ok(()));
        }
        for (_, tx) in self.unsub_inflight.lock().drain() {
            let _ = tx.send(Ok(()));
        }
    }

    /// Fails every waiter. Called when the session ends.
    fn fail_all(&self, kind: ErrorKind, message: &str) {
        let mut failed: Vec<oneshot::Sender<Result<()>>> = Vec::new();
        failed.extend(self.pub_waiting.lock().drain(..).map(|w| w.tx));
        failed.extend(self.pub_inflight.lock().drain().map(|(_, tx)| tx));
        failed.extend(self.sub_waiting.lock().drain(..));
        failed.extend(self.sub_inflight.lock().drain().map(|(_, tx)| tx));
        failed.extend(self.unsub_waiting.lock().drain(..));
        failed.extend(self.unsub_inflight.lock().drain().map(|(_, tx)| tx));
        for tx in failed {
            let _ = tx.send(Err(Error::new(kind, message.to_string())));
        }
    }
}

/// State shared between the session run loop and its client handles.
struct SessionInner {
    client_id: String,
    client: AsyncClient,
    state: SessionState,
    dispatcher: Dispatcher,
    pending: PendingQueue,
    ledger: CompletionLedger,
    acks: Arc<AckTracker<Publish>>,
    /// Subscribed filters and their QoS, replayed after session loss.
    subscriptions: RwLock<HashMap<String, QoS>>,
    /// Serializes publish submissions so wire order matches submission
    /// order, and gates new publishes while the offline queue flushes.
    submit_lock: tokio::sync::Mutex<()>,
    /// Rotated credentials not yet applied to the transport options.
    fresh_credentials: Mutex<Option<Credentials>>,
    /// Signal for dispose/force-exit.
    force_exit: Notify,
    /// Set once the run loop has returned.
    terminated: AtomicBool,
}

impl SessionInner {
    /// Fails if the session can no longer serve requests.
    fn ensure_live(&self) -> Result<()> {
        if self.state.is_disposed() {
            return Err(Error::shallow(
                ErrorKind::ObjectDisposed,
                "session has been disposed",
            ));
        }
        if self.terminated.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::StateInvalid, "session has ended"));
        }
        Ok(())
    }
}

/// Client that maintains a single logical MQTT5 session.
///
/// Create handles with [`client`](Self::client) and
/// [`exit_handle`](Self::exit_handle), then drive the connection with
/// [`run`](Self::run), which blocks until the session exits.
pub struct Session {
    inner: Arc<SessionInner>,
    event_loop: EventLoop,
    settings: ConnectionSettings,
    reconnect_policy: Box<dyn ReconnectPolicy>,
    previously_run: bool,
}

impl Session {
    /// Creates a session from the given options.
    ///
    /// Reads credential and TLS files eagerly so misconfiguration fails
    /// here rather than on first connect.
    ///
    /// # Errors
    ///
    /// Returns an error of kind `ConfigurationInvalid` or `AuthFailed` if
    /// a configured credential or TLS file cannot be read.
    pub fn new(options: SessionOptions) -> Result<Self> {
        let settings = options.connection_settings;

        let mut mqtt_options = MqttOptions::new(
            settings.client_id.clone(),
            settings.hostname.clone(),
            settings.port,
        );
        mqtt_options.set_keep_alive(settings.keep_alive);
        mqtt_options.set_clean_start(settings.clean_start);
        mqtt_options.set_manual_acks(true);
        // Safe: the builder validated the seconds fit in u32.
        #[allow(clippy::cast_possible_truncation)]
        mqtt_options.set_session_expiry_interval(Some(settings.session_expiry.as_secs() as u32));

        if let Some(auth) = &settings.auth {
            let credentials = auth::load_credentials(auth)?;
            mqtt_options.set_credentials(credentials.username, credentials.password);
        }

        if let Some(tls) = &settings.tls {
            let materials = auth::load_tls_materials(tls)?;
            let Some(ca) = materials.ca else {
                return Err(Error::shallow(
                    ErrorKind::ConfigurationInvalid,
                    "TLS is enabled but no CA trust bundle file is configured",
                )
                .with_property_name("tls.ca_file"));
            };
            let tls_config = rumqttc::TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth: materials.client_auth,
            };
            mqtt_options.set_transport(rumqttc::Transport::tls_with_config(tls_config));
        }

        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);

        let inner = Arc::new(SessionInner {
            client_id: settings.client_id.clone(),
            client,
            state: SessionState::default(),
            dispatcher: Dispatcher::default(),
            pending: PendingQueue::default(),
            ledger: CompletionLedger::default(),
            acks: Arc::new(AckTracker::default()),
            subscriptions: RwLock::new(HashMap::new()),
            submit_lock: tokio::sync::Mutex::new(()),
            fresh_credentials: Mutex::new(None),
            force_exit: Notify::new(),
            terminated: AtomicBool::new(false),
        });

        Ok(Self {
            inner,
            event_loop,
            settings,
            reconnect_policy: options.reconnect_policy,
            previously_run: false,
        })
    }

    /// Returns a client handle for protocol components.
    #[must_use]
    pub fn client(&self) -> SessionClient {
        SessionClient {
            inner: self.inner.clone(),
        }
    }

    /// Returns a handle that can end the session.
    #[must_use]
    pub fn exit_handle(&self) -> SessionExitHandle {
        SessionExitHandle {
            inner: self.inner.clone(),
        }
    }

    /// Returns a monitor for connection state changes.
    #[must_use]
    pub fn connection_monitor(&self) -> ConnectionMonitor {
        self.inner.state.monitor()
    }

    /// Runs the session until it exits or fails terminally.
    ///
    /// Connects, dispatches inbound messages, sends ordered
    /// acknowledgements, reconnects with backoff on transient errors, and
    /// refreshes rotated credentials.
    ///
    /// # Errors
    ///
    /// Returns an error when the session ends for any reason other than a
    /// requested exit: `AuthFailed` when the broker rejects credentials
    /// after a reload attempt, `StateInvalid` when the reconnect budget is
    /// exhausted or the broker misbehaves at the protocol level.
    pub async fn run(&mut self) -> Result<()> {
        self.inner.ensure_live()?;
        if self.previously_run {
            return Err(Error::new(
                ErrorKind::StateInvalid,
                "session cannot be run twice",
            ));
        }
        self.previously_run = true;
        self.inner.state.transition_connecting();

        // Watch the bearer token file for rotation.
        let token_watcher = match &self.settings.auth {
            Some(AuthMethod::BearerTokenFile { path, username }) => {
                let inner = self.inner.clone();
                let username = username.clone();
                Some(auth::spawn_token_watcher(
                    path.clone(),
                    self.settings.auth_poll_interval,
                    move |token| {
                        *inner.fresh_credentials.lock() = Some(Credentials {
                            username: username.clone(),
                            password: token,
                        });
                    },
                ))
            }
            _ => None,
        };

        // Ordered acknowledgement sender.
        let acker_cancel = CancellationToken::new();
        tokio::spawn(run_acker(
            self.inner.client.clone(),
            self.inner.acks.clone(),
            acker_cancel.clone(),
        ));

        let mut prev_connected = false;
        let mut reconnect_attempts: u32 = 0;
        let mut auth_reload_attempted = false;
        let mut result = Ok(());

        loop {
            // Apply rotated credentials before the next poll so a reconnect
            // uses the fresh token.
            if let Some(credentials) = self.inner.fresh_credentials.lock().take() {
                self.event_loop
                    .options
                    .set_credentials(credentials.username, credentials.password);
            }

            let event = tokio::select! {
                biased;
                () = self.inner.force_exit.notified() => break,
                event = self.event_loop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(connack))) => match connack.code {
                    ConnectReturnCode::Success => {
                        tracing::info!(
                            session_present = connack.session_present,
                            "Connected to MQTT broker"
                        );
                        reconnect_attempts = 0;
                        auth_reload_attempted = false;
                        let session_lost = prev_connected && !connack.session_present;
                        prev_connected = true;
                        // Subsequent connects must continue this session.
                        self.event_loop.options.set_clean_start(false);
                        tokio::spawn(handle_connected(self.inner.clone(), session_lost));
                    }
                    ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
                        if self.try_reload_credentials(&mut auth_reload_attempted) {
                            tracing::warn!(
                                code = ?connack.code,
                                "Broker rejected credentials; retrying with reloaded token"
                            );
                            self.inner.state.transition_reconnecting();
                        } else {
                            result = Err(Error::new(
                                ErrorKind::AuthFailed,
                                format!("broker rejected credentials: {:?}", connack.code),
                            ));
                            break;
                        }
                    }
                    code => {
                        result = Err(Error::new(
                            ErrorKind::StateInvalid,
                            format!("broker refused the connection: {code:?}"),
                        ));
                        break;
                    }
                },

                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    handle_publish(&self.inner, publish);
                }

                Ok(Event::Incoming(Packet::PubAck(puback))) => {
                    self.inner.ledger.on_puback(puback.pkid, puback.reason);
                }

                Ok(Event::Incoming(Packet::SubAck(suback))) => {
                    self.inner
                        .ledger
                        .on_suback(suback.pkid, &suback.return_codes);
                }

                Ok(Event::Incoming(Packet::UnsubAck(unsuback))) => {
                    self.inner.ledger.on_unsuback(unsuback.pkid);
                }

                Ok(Event::Incoming(Packet::Disconnect(disconnect))) => {
                    tracing::warn!(?disconnect, "Broker sent DISCONNECT");
                    // The transport error follows on the next poll and is
                    // handled by the reconnect path.
                }

                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                    self.inner.ledger.on_outgoing_publish(pkid);
                }

                Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                    self.inner.ledger.on_outgoing_subscribe(pkid);
                }

                Ok(Event::Outgoing(Outgoing::Unsubscribe(pkid))) => {
                    self.inner.ledger.on_outgoing_unsubscribe(pkid);
                }

                Ok(_) => {}

                // A requested exit surfaces as a transport error once the
                // DISCONNECT has been sent.
                Err(_) if self.inner.state.desire_exit() => {
                    self.inner.state.transition_disconnected();
                    break;
                }

                Err(ConnectionError::ConnectionRefused(code)) => match code {
                    ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
                        if self.try_reload_credentials(&mut auth_reload_attempted) {
                            tracing::warn!(
                                ?code,
                                "Broker rejected credentials; retrying with reloaded token"
                            );
                            self.inner.state.transition_reconnecting();
                        } else {
                            result = Err(Error::new(
                                ErrorKind::AuthFailed,
                                format!("broker rejected credentials: {code:?}"),
                            ));
                            break;
                        }
                    }
                    code => {
                        result = Err(Error::new(
                            ErrorKind::StateInvalid,
                            format!("broker refused the connection: {code:?}"),
                        ));
                        break;
                    }
                },

                Err(e) => {
                    tracing::error!(error = %e, "MQTT connection error");
                    self.inner.state.transition_reconnecting();
                    self.inner.ledger.on_disconnect();

                    match self.reconnect_policy.next_delay(reconnect_attempts) {
                        Some(delay) => {
                            tracing::info!(?delay, attempt = reconnect_attempts, "Reconnecting");
                            tokio::select! {
                                biased;
                                () = self.inner.force_exit.notified() => {
                                    result = Err(Error::new(
                                        ErrorKind::StateInvalid,
                                        "session exit forced during reconnect",
                                    ));
                                    break;
                                }
                                () = tokio::time::sleep(delay) => {}
                            }
                            reconnect_attempts += 1;
                        }
                        None => {
                            tracing::error!("Reconnect budget exhausted; ending session");
                            self.inner.state.emit(ConnectionEvent::DisconnectedTerminally);
                            result = Err(Error::new(
                                ErrorKind::StateInvalid,
                                "reconnect budget exhausted",
                            )
                            .with_source(e));
                            break;
                        }
                    }
                }
            }
        }

        // Tear down: no further completions will arrive.
        acker_cancel.cancel();
        if let Some(watcher) = token_watcher {
            watcher.abort();
        }
        self.inner.terminated.store(true, Ordering::SeqCst);
        let (kind, message) = if self.inner.state.is_disposed() {
            (ErrorKind::ObjectDisposed, "session has been disposed")
        } else {
            (ErrorKind::StateInvalid, "session has ended")
        };
        self.inner.pending.fail_all(kind, message);
        self.inner.ledger.fail_all(kind, message);
        if !self.inner.state.is_disposed() && result.is_ok() {
            self.inner.state.transition_disconnected();
        }
        result
    }

    /// Reloads bearer credentials after a broker rejection. Returns true if
    /// a reload was performed and the connection should be retried.
    fn try_reload_credentials(&mut self, already_attempted: &mut bool) -> bool {
        if *already_attempted {
            return false;
        }
        let Some(AuthMethod::BearerTokenFile { path, username }) = &self.settings.auth else {
            return false;
        };
        *already_attempted = true;
        match auth::read_token_file(path) {
            Ok(token) => {
                self.event_loop
                    .options
                    .set_credentials(username.clone(), token);
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to reload bearer token after rejection");
                false
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.inner.client_id)
            .field("state", &self.inner.state.current())
            .finish()
    }
}

/// Completes the transition to the connected state: replays subscriptions,
/// flushes the offline publish queue in FIFO order, and only then opens the
/// direct publish path.
async fn handle_connected(inner: Arc<SessionInner>, session_lost: bool) {
    let _guard = inner.submit_lock.lock().await;

    if session_lost {
        tracing::warn!("Broker lost the MQTT session; re-establishing subscriptions");
        // Pending acknowledgements refer to packet ids of the lost
        // session and can never be delivered.
        inner.acks.clear();
    }

    // Replay every tracked subscription. Cheap when the broker kept the
    // session (the filters are already active) and required when it did
    // not; also covers SUBSCRIBE packets lost in a connection drop.
    let filters: Vec<(String, QoS)> = inner
        .subscriptions
        .read()
        .iter()
        .map(|(f, q)| (f.clone(), *q))
        .collect();
    for (filter, qos) in filters {
        let (tx, rx) = oneshot::channel();
        inner.ledger.push_subscribe(tx);
        match inner.client.subscribe(&filter, to_mqtt_qos(qos)).await {
            Ok(()) => {
                let filter = filter.clone();
                tokio::spawn(async move {
                    match rx.await {
                        Ok(Ok(())) => tracing::debug!(filter = %filter, "Subscription replayed"),
                        Ok(Err(e)) => {
                            tracing::error!(filter = %filter, error = %e, "Subscription replay rejected");
                        }
                        Err(_) => {}
                    }
                });
            }
            Err(e) => {
                inner.ledger.cancel_last_subscribe();
                tracing::error!(filter = %filter, error = %e, "Subscription replay failed");
            }
        }
    }

    // Flush queued publishes before any newer publish can be submitted
    // (newer publishes block on the submit lock until the state flips to
    // connected).
    loop {
        let queued = inner.pending.drain();
        if queued.is_empty() {
            break;
        }
        tracing::debug!(count = queued.len(), "Flushing queued publishes");
        for entry in queued {
            let publish = entry.publish;
            inner.ledger.push_publish(publish.qos, entry.completion);
            if let Err(e) = inner
                .client
                .publish_with_properties(
                    publish.topic.clone(),
                    to_mqtt_qos(publish.qos),
                    publish.retain,
                    publish.payload,
                    to_publish_properties(&publish.properties),
                )
                .await
            {
                inner.ledger.cancel_last_publish();
                tracing::error!(topic = %publish.topic, error = %e, "Failed to flush queued publish");
            }
        }
    }

    inner.state.transition_connected();
    if session_lost {
        inner.state.emit(ConnectionEvent::SessionLost);
    }
}

/// Routes one inbound publish to its observers with acknowledgement
/// tracking.
fn handle_publish(inner: &Arc<SessionInner>, publish: Publish) {
    let Ok(topic) = std::str::from_utf8(&publish.topic).map(str::to_string) else {
        tracing::warn!("Dropping publish with non-UTF-8 topic");
        if publish.qos != MqttQoS::AtMostOnce {
            let pkid = publish.pkid;
            let entry = inner.acks.register(publish, pkid, 1);
            inner.acks.complete(entry);
        }
        return;
    };

    // A duplicate of a message we already own must not be re-dispatched:
    // the broker cannot reuse the packet id until we acknowledge it.
    if publish.dup && inner.acks.contains_pkid(publish.pkid) {
        tracing::debug!(topic = %topic, pkid = publish.pkid, "Discarding duplicate of owned publish");
        return;
    }

    let senders = inner.dispatcher.matching_senders(&topic);
    let qos = from_mqtt_qos(publish.qos);
    let properties = from_publish_properties(publish.properties.as_ref());

    tracing::debug!(topic = %topic, observers = senders.len(), "Dispatching publish");

    match qos {
        QoS::AtMostOnce => {
            for tx in senders {
                let _ = tx.send(InboundMessage {
                    topic: topic.clone(),
                    payload: publish.payload.to_vec(),
                    qos,
                    dup: publish.dup,
                    properties: properties.clone(),
                    ack: None,
                });
            }
        }
        QoS::AtLeastOnce => {
            if senders.is_empty() {
                // No observer; acknowledge through the ordered pipeline so
                // the message is not redelivered forever.
                tracing::debug!(topic = %topic, "No observer for publish; auto-acknowledging");
                let pkid = publish.pkid;
                let entry = inner.acks.register(publish, pkid, 1);
                inner.acks.complete(entry);
                return;
            }
            let pkid = publish.pkid;
            let payload = publish.payload.to_vec();
            let dup = publish.dup;
            let entry = inner.acks.register(publish, pkid, senders.len());
            let sink: Arc<dyn AckSink> = inner.acks.clone();
            for tx in senders {
                let _ = tx.send(InboundMessage {
                    topic: topic.clone(),
                    payload: payload.clone(),
                    qos,
                    dup,
                    properties: properties.clone(),
                    ack: Some(AckToken::new(sink.clone(), entry)),
                });
            }
        }
    }
}

/// Sends acknowledgements for fully completed messages in delivery order.
async fn run_acker(
    client: AsyncClient,
    acks: Arc<AckTracker<Publish>>,
    cancel: CancellationToken,
) {
    loop {
        let publish = tokio::select! {
            () = cancel.cancelled() => break,
            publish = acks.next_ready() => publish,
        };
        match client.ack(&publish).await {
            Ok(()) => tracing::trace!(pkid = publish.pkid, "Sent PUBACK"),
            Err(e) => tracing::error!(pkid = publish.pkid, error = %e, "PUBACK failed"),
        }
    }
}

/// Cheap clone handle to a [`Session`], implementing [`ManagedClient`].
#[derive(Clone)]
pub struct SessionClient {
    inner: Arc<SessionInner>,
}

impl SessionClient {
    /// Registers an observer for connection events.
    #[must_use]
    pub fn connection_events(&self) -> ConnectionEventStream {
        self.inner.state.subscribe_events()
    }

    /// Returns a monitor for connection state changes.
    #[must_use]
    pub fn connection_monitor(&self) -> ConnectionMonitor {
        self.inner.state.monitor()
    }

    /// Permanently shuts the session down.
    ///
    /// Every pending operation fails with `ObjectDisposed` and every
    /// subsequent public call is rejected. The broker connection is dropped
    /// without negotiation.
    pub fn dispose(&self) {
        if self.inner.state.is_disposed() {
            return;
        }
        tracing::info!("Disposing session");
        self.inner.state.transition_disposed();
        self.inner
            .pending
            .fail_all(ErrorKind::ObjectDisposed, "session has been disposed");
        self.inner
            .ledger
            .fail_all(ErrorKind::ObjectDisposed, "session has been disposed");
        self.inner.force_exit.notify_one();
    }
}

impl ManagedClient for SessionClient {
    fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    async fn publish(&self, publish: OutgoingPublish) -> Result<PublishCompletion> {
        self.inner.ensure_live()?;
        let (tx, rx) = oneshot::channel();

        let guard = self.inner.submit_lock.lock().await;
        self.inner.ensure_live()?;
        if self.inner.state.is_connected() {
            self.inner.ledger.push_publish(publish.qos, tx);
            let submit = self
                .inner
                .client
                .publish_with_properties(
                    publish.topic.clone(),
                    to_mqtt_qos(publish.qos),
                    publish.retain,
                    publish.payload,
                    to_publish_properties(&publish.properties),
                )
                .await;
            if let Err(e) = submit {
                self.inner.ledger.cancel_last_publish();
                drop(guard);
                return Err(client_error(e));
            }
        } else {
            tracing::debug!(topic = %publish.topic, "Session offline; queueing publish");
            self.inner.pending.push(publish, tx);
        }
        drop(guard);
        Ok(PublishCompletion::new(rx))
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()> {
        self.inner.ensure_live()?;
        if self.inner.subscriptions.read().contains_key(filter) {
            // Already subscribed; observers share the broker subscription.
            return Ok(());
        }

        let (tx, rx) = oneshot::channel();
        {
            let _guard = self.inner.submit_lock.lock().await;
            self.inner.ensure_live()?;
            self.inner
                .subscriptions
                .write()
                .insert(filter.to_string(), qos);
            self.inner.ledger.push_subscribe(tx);
            if let Err(e) = self.inner.client.subscribe(filter, to_mqtt_qos(qos)).await {
                self.inner.ledger.cancel_last_subscribe();
                self.inner.subscriptions.write().remove(filter);
                return Err(client_error(e));
            }
        }
        rx.await.map_err(|_| {
            Error::new(ErrorKind::StateInvalid, "session dropped the subscribe")
        })?
    }

    async fn unsubscribe(&self, filter: &str) -> Result<()> {
        self.inner.ensure_live()?;
        if self
            .inner
            .subscriptions
            .write()
            .remove(filter)
            .is_none()
        {
            return Ok(());
        }

        let (tx, rx) = oneshot::channel();
        {
            let _guard = self.inner.submit_lock.lock().await;
            self.inner.ledger.push_unsubscribe(tx);
            if let Err(e) = self.inner.client.unsubscribe(filter).await {
                self.inner.ledger.cancel_last_unsubscribe();
                return Err(client_error(e));
            }
        }
        rx.await.map_err(|_| {
            Error::new(ErrorKind::StateInvalid, "session dropped the unsubscribe")
        })?
    }

    fn filtered_messages(&self, filter: &str) -> MessageStream {
        self.inner.dispatcher.register(filter)
    }
}

impl std::fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClient")
            .field("client_id", &self.inner.client_id)
            .finish()
    }
}

/// Handle used to end a [`Session`].
#[derive(Clone)]
pub struct SessionExitHandle {
    inner: Arc<SessionInner>,
}

impl SessionExitHandle {
    /// Attempts to end the session gracefully with a DISCONNECT.
    ///
    /// Requires the session to be connected; the broker then releases the
    /// session state after the configured session expiry.
    ///
    /// # Errors
    ///
    /// Returns an error of kind `StateInvalid` if the session is not
    /// connected (the connection may have dropped without the session
    /// noticing yet).
    pub async fn try_exit(&self) -> Result<()> {
        if !self.inner.state.is_connected() {
            return Err(Error::new(
                ErrorKind::StateInvalid,
                "session is not connected to the broker",
            ));
        }
        tracing::debug!("Attempting graceful session exit");
        self.inner.state.set_desire_exit();
        self.inner
            .client
            .disconnect()
            .await
            .map_err(client_error)?;
        self.inner.state.wait_exited().await;
        Ok(())
    }

    /// Ends the session, forcing the exit if a graceful disconnect does
    /// not complete within one second.
    ///
    /// Returns true if the exit was graceful.
    pub async fn exit_force(&self) -> bool {
        let _ = async {
            self.inner.state.set_desire_exit();
            self.inner.client.disconnect().await
        }
        .await;

        tokio::select! {
            () = self.inner.state.wait_exited() => true,
            () = tokio::time::sleep(Duration::from_secs(1)) => {
                tracing::debug!("Grace period expired; forcing session exit");
                self.inner.force_exit.notify_one();
                false
            }
        }
    }
}

fn client_error(e: rumqttc::v5::ClientError) -> Error {
    Error::new(ErrorKind::StateInvalid, "MQTT client request failed").with_source(e)
}

fn to_mqtt_qos(qos: QoS) -> MqttQoS {
    match qos {
        QoS::AtMostOnce => MqttQoS::AtMostOnce,
        QoS::AtLeastOnce => MqttQoS::AtLeastOnce,
    }
}

fn from_mqtt_qos(qos: MqttQoS) -> QoS {
    match qos {
        MqttQoS::AtMostOnce => QoS::AtMostOnce,
        // QoS 2 subscriptions are never created by this library; a QoS 2
        // grant is treated as at-least-once for acknowledgement purposes.
        MqttQoS::AtLeastOnce | MqttQoS::ExactlyOnce => QoS::AtLeastOnce,
    }
}

fn to_publish_properties(properties: &MessageProperties) -> PublishProperties {
    PublishProperties {
        payload_format_indicator: properties.format_indicator,
        message_expiry_interval: properties.message_expiry_interval,
        topic_alias: None,
        response_topic: properties.response_topic.clone(),
        correlation_data: properties.correlation_data.clone().map(Bytes::from),
        user_properties: properties.user_properties.clone(),
        subscription_identifiers: Vec::new(),
        content_type: properties.content_type.clone(),
    }
}

fn from_publish_properties(properties: Option<&PublishProperties>) -> MessageProperties {
    let Some(properties) = properties else {
        return MessageProperties::default();
    };
    MessageProperties {
        content_type: properties.content_type.clone(),
        format_indicator: properties.payload_format_indicator,
        correlation_data: properties.correlation_data.as_ref().map(|b| b.to_vec()),
        response_topic: properties.response_topic.clone(),
        message_expiry_interval: properties.message_expiry_interval,
        user_properties: properties.user_properties.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ConnectionSettings {
        ConnectionSettings::builder()
            .client_id("edge-7")
            .hostname("broker.local")
            .build()
            .unwrap()
    }

    fn session() -> Session {
        let options = SessionOptions::builder()
            .connection_settings(settings())
            .build()
            .unwrap();
        Session::new(options).unwrap()
    }

    #[test]
    fn options_require_connection_settings() {
        let err = SessionOptions::builder().build().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationInvalid);
        assert_eq!(err.property_name(), Some("connection_settings"));
    }

    #[test]
    fn client_exposes_client_id() {
        let session = session();
        assert_eq!(session.client().client_id(), "edge-7");
    }

    #[tokio::test]
    async fn disposed_session_rejects_operations() {
        let session = session();
        let client = session.client();
        client.dispose();

        let err = client
            .publish(OutgoingPublish {
                topic: "t".into(),
                qos: QoS::AtLeastOnce,
                retain: false,
                payload: Vec::new(),
                properties: MessageProperties::default(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ObjectDisposed);

        let err = client.subscribe("t", QoS::AtLeastOnce).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ObjectDisposed);
    }

    #[tokio::test]
    async fn offline_publish_is_queued() {
        let session = session();
        let client = session.client();

        let completion = client
            .publish(OutgoingPublish {
                topic: "fleet/t".into(),
                qos: QoS::AtLeastOnce,
                retain: false,
                payload: b"x".to_vec(),
                properties: MessageProperties::default(),
            })
            .await
            .unwrap();
        assert_eq!(session.inner.pending.len(), 1);

        // Disposing fails the queued completion.
        client.dispose();
        let err = completion.await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ObjectDisposed);
    }

    #[tokio::test]
    async fn run_twice_is_rejected() {
        let mut session = session();
        session.previously_run = true;
        let err = session.run().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateInvalid);
    }

    #[test]
    fn ledger_correlates_publishes_in_submission_order() {
        let ledger = CompletionLedger::default();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        ledger.push_publish(QoS::AtLeastOnce, tx1);
        ledger.push_publish(QoS::AtLeastOnce, tx2);

        ledger.on_outgoing_publish(1);
        ledger.on_outgoing_publish(2);
        assert!(rx1.try_recv().is_err(), "not acked yet");

        ledger.on_puback(2, PubAckReason::Success);
        assert!(rx2.try_recv().unwrap().is_ok());
        ledger.on_puback(1, PubAckReason::Success);
        assert!(rx1.try_recv().unwrap().is_ok());
    }

    #[test]
    fn ledger_resolves_qos0_on_outgoing() {
        let ledger = CompletionLedger::default();
        let (tx, mut rx) = oneshot::channel();
        ledger.push_publish(QoS::AtMostOnce, tx);
        ledger.on_outgoing_publish(0);
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn ledger_ignores_retransmissions() {
        let ledger = CompletionLedger::default();
        let (tx1, mut rx1) = oneshot::channel();
        ledger.push_publish(QoS::AtLeastOnce, tx1);
        ledger.on_outgoing_publish(1);

        // Reconnect: pkid 1 is retransmitted while a new publish waits.
        let (tx2, mut rx2) = oneshot::channel();
        ledger.push_publish(QoS::AtLeastOnce, tx2);
        ledger.on_outgoing_publish(1);
        ledger.on_outgoing_publish(2);

        ledger.on_puback(1, PubAckReason::Success);
        assert!(rx1.try_recv().unwrap().is_ok());
        ledger.on_puback(2, PubAckReason::Success);
        assert!(rx2.try_recv().unwrap().is_ok());
    }

    #[test]
    fn ledger_surfaces_broker_rejection() {
        let ledger = CompletionLedger::default();
        let (tx, mut rx) = oneshot::channel();
        ledger.push_publish(QoS::AtLeastOnce, tx);
        ledger.on_outgoing_publish(1);
        ledger.on_puback(1, PubAckReason::NotAuthorized);
        let err = rx.try_recv().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateInvalid);
    }

    #[test]
    fn ledger_fail_all_resolves_everything() {
        let ledger = CompletionLedger::default();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        ledger.push_publish(QoS::AtLeastOnce, tx1);
        ledger.push_subscribe(tx2);

        ledger.fail_all(ErrorKind::StateInvalid, "session has ended");
        assert_eq!(
            rx1.try_recv().unwrap().unwrap_err().kind(),
            ErrorKind::StateInvalid
        );
        assert_eq!(
            rx2.try_recv().unwrap().unwrap_err().kind(),
            ErrorKind::StateInvalid
        );
    }

    #[test]
    fn qos_conversions() {
        assert_eq!(from_mqtt_qos(to_mqtt_qos(QoS::AtMostOnce)), QoS::AtMostOnce);
        assert_eq!(
            from_mqtt_qos(to_mqtt_qos(QoS::AtLeastOnce)),
            QoS::AtLeastOnce
        );
        assert_eq!(from_mqtt_qos(MqttQoS::ExactlyOnce), QoS::AtLeastOnce);
    }

    #[test]
    fn property_conversion_round_trip() {
        let properties = MessageProperties {
            content_type: Some("application/json".into()),
            format_indicator: Some(1),
            correlation_data: Some(vec![1, 2, 3]),
            response_topic: Some("clients/edge-7/resp".into()),
            message_expiry_interval: Some(10),
            user_properties: vec![("__stat".into(), "200".into())],
        };
        let wire = to_publish_properties(&properties);
        let back = from_publish_properties(Some(&wire));
        assert_eq!(back.content_type, properties.content_type);
        assert_eq!(back.format_indicator, properties.format_indicator);
        assert_eq!(back.correlation_data, properties.correlation_data);
        assert_eq!(back.response_topic, properties.response_topic);
        assert_eq!(
            back.message_expiry_interval,
            properties.message_expiry_interval
        );
        assert_eq!(back.user_properties, properties.user_properties);
    }
}
