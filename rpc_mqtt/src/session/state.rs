// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Types for tracking the state of a [`Session`](crate::session::Session).

use std::fmt;
use std::sync::RwLock;

use tokio::sync::Notify;

/// Information used to track the state of the [`Session`](crate::session::Session).
pub struct SessionState {
    inner: RwLock<InnerSessionState>,
    /// Notifier fired on every state transition.
    state_change: Notify,
}

struct InnerSessionState {
    lifecycle_status: LifecycleStatus,
    connected: bool,
    desire_exit: DesireExit,
}

impl SessionState {
    /// Return true if the Session is currently connected (to the best of knowledge).
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.read().unwrap().connected
    }

    /// Return true if an exit has been requested, by the user or by session logic.
    #[must_use]
    pub fn desire_exit(&self) -> bool {
        !matches!(self.inner.read().unwrap().desire_exit, DesireExit::No)
    }

    /// Wait until the Session is connected. Returns immediately if already connected.
    pub async fn condition_connected(&self) {
        loop {
            if self.is_connected() {
                break;
            }
            self.state_change.notified().await;
        }
    }

    /// Wait until the Session is disconnected. Returns immediately if already disconnected.
    pub async fn condition_disconnected(&self) {
        loop {
            if !self.is_connected() {
                break;
            }
            self.state_change.notified().await;
        }
    }

    /// Mark the Session as having entered its run loop.
    pub fn transition_running(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.lifecycle_status = LifecycleStatus::Running;
        log::debug!("Session running");
    }

    /// Update the state to reflect a connection.
    pub fn transition_connected(&self) {
        let mut inner = self.inner.write().unwrap();
        if inner.connected {
            log::warn!("Duplicate connection transition");
        } else {
            inner.connected = true;
            log::info!("Connected!");
            self.state_change.notify_waiters();
        }
    }

    /// Update the state to reflect a disconnection.
    pub fn transition_disconnected(&self) {
        let mut inner = self.inner.write().unwrap();
        if inner.connected {
            inner.connected = false;
            match inner.desire_exit {
                DesireExit::No => log::info!("Connection lost."),
                DesireExit::User => log::info!("Disconnected due to user-initiated Session exit"),
                DesireExit::SessionLogic => {
                    log::info!("Disconnected due to session-initiated Session exit");
                }
            }
            self.state_change.notify_waiters();
        }
    }

    /// Record that the user has requested a Session exit.
    pub fn transition_user_exit(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.desire_exit = DesireExit::User;
    }

    /// Record that the Session's own logic has requested an exit (e.g. unrecoverable session loss).
    pub fn transition_session_exit(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.desire_exit = DesireExit::SessionLogic;
    }

    /// Mark the Session as having exited its run loop.
    pub fn transition_exited(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.lifecycle_status = LifecycleStatus::Exited;
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            inner: RwLock::new(InnerSessionState {
                lifecycle_status: LifecycleStatus::NotStarted,
                connected: false,
                desire_exit: DesireExit::No,
            }),
            state_change: Notify::new(),
        }
    }
}

// NOTE: Do not log a `SessionState` from within its own methods while holding the write lock, or
// you will deadlock against this Debug impl's read lock.
impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read().unwrap();
        f.debug_struct("SessionState")
            .field("lifecycle_status", &inner.lifecycle_status)
            .field("connected", &inner.connected)
            .field("desire_exit", &inner.desire_exit)
            .finish()
    }
}

/// Indicates the part of the lifecycle the Session is currently in.
#[derive(Debug)]
enum LifecycleStatus {
    NotStarted,
    Running,
    Exited,
}

/// Indicates if and why the Session should end from the client side.
#[derive(Debug)]
enum DesireExit {
    No,
    User,
    SessionLogic,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn condition_connected_resolves_after_transition() {
        let state = std::sync::Arc::new(SessionState::default());
        assert!(!state.is_connected());
        let waiter = tokio::spawn({
            let state = state.clone();
            async move { state.condition_connected().await }
        });
        tokio::task::yield_now().await;
        state.transition_connected();
        waiter.await.unwrap();
        assert!(state.is_connected());
    }

    #[test]
    fn desire_exit_starts_false() {
        let state = SessionState::default();
        assert!(!state.desire_exit());
        state.transition_user_exit();
        assert!(state.desire_exit());
    }
}
