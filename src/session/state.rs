// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Connection state machine and observer fan-out for the session client.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

/// Lifecycle state of a session connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not trying to connect.
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Connected to the broker.
    Connected,
    /// Connection lost; reconnect attempts in progress.
    Reconnecting,
    /// Permanently shut down. Every public call now fails.
    Disposed,
}

/// Event observed by components attached to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The session (re)connected with its broker state intact.
    Connected,
    /// The connection dropped; the session is reconnecting.
    Disconnected,
    /// The broker lost the MQTT session state across a reconnect; all
    /// subscriptions were re-established, but in-flight acknowledgements
    /// and queued broker-side messages are gone.
    SessionLost,
    /// The retry budget is exhausted; the session will not reconnect.
    DisconnectedTerminally,
}

/// Stream of [`ConnectionEvent`]s for one observer.
#[derive(Debug)]
pub struct ConnectionEventStream {
    rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl ConnectionEventStream {
    /// Receives the next event, or `None` once the session has closed.
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.rx.recv().await
    }
}

/// Shared connection state with transition tracking and event fan-out.
#[derive(Debug)]
pub(crate) struct SessionState {
    state: watch::Sender<ConnectionState>,
    /// Set when a disconnect was requested by the user, so that the next
    /// connection error is interpreted as a clean exit.
    desire_exit: AtomicBool,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ConnectionEvent>>>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            state: watch::Sender::new(ConnectionState::Disconnected),
            desire_exit: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl SessionState {
    /// Returns the current state.
    pub(crate) fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.current() == ConnectionState::Connected
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.current() == ConnectionState::Disposed
    }

    /// Moves to `Connecting`. No-op if disposed.
    pub(crate) fn transition_connecting(&self) {
        self.transition(ConnectionState::Connecting);
    }

    /// Moves to `Connected` and notifies observers.
    pub(crate) fn transition_connected(&self) {
        if self.transition(ConnectionState::Connected) {
            self.emit(ConnectionEvent::Connected);
        }
    }

    /// Moves to `Reconnecting` and notifies observers.
    pub(crate) fn transition_reconnecting(&self) {
        if self.transition(ConnectionState::Reconnecting) {
            self.emit(ConnectionEvent::Disconnected);
        }
    }

    /// Moves to `Disconnected` (clean exit).
    pub(crate) fn transition_disconnected(&self) {
        self.transition(ConnectionState::Disconnected);
    }

    /// Moves to `Disposed`. Terminal.
    pub(crate) fn transition_disposed(&self) {
        self.state.send_replace(ConnectionState::Disposed);
    }

    /// Applies a transition unless the session is disposed. Returns true if
    /// the state actually changed.
    fn transition(&self, next: ConnectionState) -> bool {
        let mut changed = false;
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Disposed || *state == next {
                false
            } else {
                *state = next;
                changed = true;
                true
            }
        });
        changed
    }

    pub(crate) fn set_desire_exit(&self) {
        self.desire_exit.store(true, Ordering::SeqCst);
    }

    pub(crate) fn desire_exit(&self) -> bool {
        self.desire_exit.load(Ordering::SeqCst)
    }

    /// Registers an event observer.
    pub(crate) fn subscribe_events(&self) -> ConnectionEventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        ConnectionEventStream { rx }
    }

    /// Emits an event to all observers, pruning closed ones.
    pub(crate) fn emit(&self, event: ConnectionEvent) {
        tracing::debug!(?event, "Connection event");
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event).is_ok());
    }

    /// Waits until the session has exited (cleanly or by disposal).
    pub(crate) async fn wait_exited(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx
            .wait_for(|s| {
                matches!(s, ConnectionState::Disconnected | ConnectionState::Disposed)
            })
            .await;
    }

    /// Returns a monitor handle for this state.
    pub(crate) fn monitor(&self) -> ConnectionMonitor {
        ConnectionMonitor {
            rx: self.state.subscribe(),
        }
    }
}

/// Monitor for connection changes in a [`Session`](super::Session).
///
/// Cheap to clone; largely informational.
#[derive(Debug, Clone)]
pub struct ConnectionMonitor {
    rx: watch::Receiver<ConnectionState>,
}

impl ConnectionMonitor {
    /// Returns the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.rx.borrow()
    }

    /// Returns true if the session is currently connected.
    ///
    /// May lag briefly after a connection loss the session has not yet
    /// noticed.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Waits until the session is connected. Returns immediately if it
    /// already is; returns once the session is disposed without connecting.
    pub async fn connected(&self) {
        let mut rx = self.rx.clone();
        let _ = rx
            .wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Disposed))
            .await;
    }

    /// Waits until the session is not connected.
    pub async fn disconnected(&self) {
        let mut rx = self.rx.clone();
        let _ = rx
            .wait_for(|s| !matches!(s, ConnectionState::Connected))
            .await;
    }
}
