// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Application-wide wiring: a shared [`ApplicationContext`] and the [`Application`] registry that
//! owns listener lifecycle.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::common::error::ProtocolError;

/// Shared context handed to every invoker/executor/sender/receiver an application creates.
///
/// There is currently nothing process-global to carry (see DESIGN.md, "Global state"); this type
/// exists as an explicit injection seam so components never reach for ambient state, and so this
/// is the one place a future process-wide concern would be added.
#[derive(Clone, Default)]
pub struct ApplicationContext {
    _private: (),
}

impl ApplicationContext {
    /// Create a new application context.
    ///
    /// There should be exactly one of these per process.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// A component `Application` can start and stop as a unit.
///
/// Implemented by [`crate::rpc::executor::Executor`] and [`crate::telemetry::receiver::Receiver`].
#[async_trait]
pub trait Listener: Send + Sync {
    /// The MQTT subscribe filter this listener owns.
    fn topic_filter(&self) -> &str;

    /// Subscribe and begin dispatching received messages.
    ///
    /// # Errors
    /// Returns a [`ProtocolError`] if the subscribe fails.
    async fn start(&self) -> Result<(), ProtocolError>;

    /// Unsubscribe and drain any in-flight handlers.
    ///
    /// # Errors
    /// Returns a [`ProtocolError`] if the unsubscribe fails.
    async fn stop(&self) -> Result<(), ProtocolError>;
}

/// Registers listeners into a per-instance table keyed by subscription filter, and drives their
/// lifecycle: `start()` in registration order, `shutdown()` in reverse registration order.
#[derive(Default)]
pub struct Application {
    listeners: Mutex<BTreeMap<u64, Arc<dyn Listener>>>,
    next_id: Mutex<u64>,
}

/// Handle returned by [`Application::register`], usable to start a single listener individually.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl Application {
    /// Create a new, empty application registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Does not start it; call [`start_all`](Self::start_all) or
    /// [`start`](Self::start) once all listeners for this process are registered.
    pub fn register(&self, listener: Arc<dyn Listener>) -> ListenerId {
        let mut next_id = self.next_id.lock().unwrap();
        let id = *next_id;
        *next_id += 1;
        self.listeners.lock().unwrap().insert(id, listener);
        ListenerId(id)
    }

    /// Start one previously registered listener.
    ///
    /// # Errors
    /// Returns a [`ProtocolError`] if the listener's subscribe fails, or `StateInvalid` if `id`
    /// is not currently registered.
    pub async fn start(&self, id: ListenerId) -> Result<(), ProtocolError> {
        let listener = self
            .listeners
            .lock()
            .unwrap()
            .get(&id.0)
            .cloned()
            .ok_or_else(|| {
                ProtocolError::new(
                    crate::common::error::ProtocolErrorKind::StateInvalid,
                    "no listener registered with this id",
                )
            })?;
        log::debug!("starting listener on '{}'", listener.topic_filter());
        listener.start().await
    }

    /// Start every registered listener, in registration order.
    ///
    /// # Errors
    /// Returns the first [`ProtocolError`] encountered; listeners already started remain started.
    pub async fn start_all(&self) -> Result<(), ProtocolError> {
        let listeners: Vec<_> = self.listeners.lock().unwrap().values().cloned().collect();
        for listener in listeners {
            log::debug!("starting listener on '{}'", listener.topic_filter());
            listener.start().await?;
        }
        Ok(())
    }

    /// Stop every registered listener, in reverse registration order, logging (but not
    /// short-circuiting on) individual failures so a single stuck unsubscribe doesn't strand the
    /// rest of the application's listeners.
    pub async fn shutdown(&self) {
        let listeners: Vec<_> = self
            .listeners
            .lock()
            .unwrap()
            .iter()
            .rev()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            log::debug!("stopping listener on '{}'", listener.topic_filter());
            if let Err(e) = listener.stop().await {
                log::error!("error stopping listener on '{}': {e}", listener.topic_filter());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullListener(&'static str);

    #[async_trait]
    impl Listener for NullListener {
        fn topic_filter(&self) -> &str {
            self.0
        }
        async fn start(&self) -> Result<(), ProtocolError> {
            Ok(())
        }
        async fn stop(&self) -> Result<(), ProtocolError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn start_all_and_shutdown_round_trip() {
        let app = Application::new();
        app.register(Arc::new(NullListener("a/b")));
        app.register(Arc::new(NullListener("c/d")));
        app.start_all().await.unwrap();
        app.shutdown().await;
    }

    #[tokio::test]
    async fn starting_an_unregistered_id_is_state_invalid() {
        let app = Application::new();
        let err = app.start(ListenerId(42)).await.unwrap_err();
        assert!(matches!(
            err.kind(),
            crate::common::error::ProtocolErrorKind::StateInvalid
        ));
    }
}
