// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The [`Session`] type: owns the event loop, ack ordering, and SAT re-authentication for a
//! single MQTT connection.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::auth::{SatAuthContext, SAT_AUTHENTICATION_METHOD};
use crate::control_packet::AuthReasonCode;
use crate::error::ConnectionError;
use crate::interface::{InternalClient, MqttDisconnect, MqttEventLoop};
use crate::rumqttc_adapter as adapter;
use crate::session::dispatcher::IncomingPublishDispatcher;
use crate::session::managed_client::SessionManagedClient;
use crate::session::ordered_acker::{OrderedAcker, PkidAckQueue};
use crate::session::reconnect_policy::{ExponentialBackoffWithJitter, ReconnectPolicy};
use crate::session::state::SessionState;
use crate::session::{SessionError, SessionErrorKind, SessionExitError};
use crate::{Event, Incoming, MqttConnectionSettings};

/// Options for configuring a new [`Session`].
#[derive(Builder)]
#[builder(pattern = "owned", setter(into))]
pub struct SessionOptions {
    /// Settings used to establish the underlying MQTT connection.
    pub connection_settings: MqttConnectionSettings,
    /// Reconnect policy used when the connection is lost.
    #[builder(default = "Box::new(ExponentialBackoffWithJitter::default())")]
    pub reconnect_policy: Box<dyn ReconnectPolicy>,
    /// Capacity of the incoming-publish and dispatcher channels.
    #[builder(default = "100")]
    pub channel_capacity: usize,
}

/// Drives a single MQTT session to completion: polls the event loop, acks incoming publishes in
/// receive order, and renews SAT-based authentication as the watched token file changes.
pub struct Session<C, EL>
where
    C: InternalClient + Clone + Send + Sync + 'static,
    EL: MqttEventLoop,
{
    client: C,
    event_loop: EL,
    client_id: String,
    sat_file: Option<String>,
    sat_reauth_margin: Duration,
    incoming_pub_dispatcher: Arc<Mutex<IncomingPublishDispatcher>>,
    pkid_ack_queue: Arc<Mutex<PkidAckQueue>>,
    acker: OrderedAcker<C>,
    reconnect_policy: Box<dyn ReconnectPolicy>,
    state: Arc<SessionState>,
    notify_force_exit: Arc<Notify>,
    previously_run: bool,
}

impl Session<adapter::ClientAlias, adapter::EventLoopAlias> {
    /// Create a new [`Session`] from the given options.
    ///
    /// # Errors
    /// Returns a [`SessionError`] if the connection settings cannot be converted into a valid
    /// underlying client configuration.
    pub fn new(options: SessionOptions) -> Result<Self, SessionError> {
        let client_id = options.connection_settings.client_id.clone();
        let sat_file = options.connection_settings.sat_file.clone();
        let sat_reauth_margin = options.connection_settings.sat_reauth_margin;
        let (client, event_loop) =
            adapter::client(options.connection_settings, options.channel_capacity, true)
                .map_err(|e| SessionErrorKind::Config(e.to_string()))?;

        Ok(Self::new_from_injection(
            client,
            event_loop,
            options.reconnect_policy,
            client_id,
            sat_file,
            sat_reauth_margin,
            options.channel_capacity,
        ))
    }
}

impl<C, EL> Session<C, EL>
where
    C: InternalClient + Clone + Send + Sync + 'static,
    EL: MqttEventLoop,
{
    /// Build a [`Session`] directly from a client/event-loop pair, bypassing the `rumqttc`
    /// adapter. Used by the concrete [`Session::new`] and by tests with mock clients.
    pub fn new_from_injection(
        client: C,
        event_loop: EL,
        reconnect_policy: Box<dyn ReconnectPolicy>,
        client_id: String,
        sat_file: Option<String>,
        sat_reauth_margin: Duration,
        channel_capacity: usize,
    ) -> Self {
        let (incoming_pub_dispatcher, _unfiltered_rx) =
            IncomingPublishDispatcher::new(channel_capacity);
        let pkid_ack_queue = Arc::new(Mutex::new(PkidAckQueue::default()));
        let acker = OrderedAcker::new(client.clone(), pkid_ack_queue.clone());
        Self {
            client,
            event_loop,
            client_id,
            sat_file,
            sat_reauth_margin,
            incoming_pub_dispatcher: Arc::new(Mutex::new(incoming_pub_dispatcher)),
            pkid_ack_queue,
            acker,
            reconnect_policy,
            state: Arc::new(SessionState::default()),
            notify_force_exit: Arc::new(Notify::new()),
            previously_run: false,
        }
    }

    /// Return a [`SessionManagedClient`] for sending outgoing messages and registering receivers.
    #[must_use]
    pub fn managed_client(&self) -> SessionManagedClient<C> {
        SessionManagedClient {
            client_id: self.client_id.clone(),
            pub_sub: self.client.clone(),
            incoming_pub_dispatcher: self.incoming_pub_dispatcher.clone(),
            acker: self.acker.clone(),
        }
    }

    /// Return a handle that can be used to end this [`Session`] from another task.
    #[must_use]
    pub fn get_session_exit_handle(&self) -> SessionExitHandle<C> {
        SessionExitHandle {
            disconnector: self.client.clone(),
            state: self.state.clone(),
            force_exit: self.notify_force_exit.clone(),
        }
    }

    /// Run the session until a fatal error or a requested exit ends it.
    ///
    /// # Errors
    /// Returns a [`SessionError`] describing why the session ended, if not cleanly.
    pub async fn run(&mut self) -> Result<(), SessionError> {
        self.state.transition_running();
        if self.previously_run {
            return Err(SessionErrorKind::InvalidState(
                "session re-use is not supported".to_string(),
            )
            .into());
        }
        self.previously_run = true;

        let cancel_token = CancellationToken::new();
        let (auth_tx, auth_rx) = tokio::sync::mpsc::unbounded_channel();
        if let Some(sat_file) = self.sat_file.clone() {
            tokio::spawn({
                let cancel_token = cancel_token.clone();
                let client = self.client.clone();
                let sat_reauth_margin = self.sat_reauth_margin;
                run_sat_auth_background(sat_file, sat_reauth_margin, client, auth_rx, cancel_token)
            });
        }

        let mut prev_connected = false;
        let mut prev_reconnect_attempts = 0;
        let mut result = Ok(());

        loop {
            let next = tokio::select! {
                biased;
                () = self.notify_force_exit.notified() => break,
                next = self.event_loop.poll() => next,
            };

            match next {
                Ok(Event::Incoming(Incoming::ConnAck(connack))) => {
                    self.state.transition_connected();
                    prev_reconnect_attempts = 0;
                    log::debug!("incoming CONNACK: {connack:?}");

                    if prev_connected && !connack.session_present {
                        log::error!("session state not present on broker after reconnect, ending session");
                        result = Err(SessionErrorKind::SessionLost);
                        self.trigger_session_exit().await;
                    } else {
                        prev_connected = true;
                        self.event_loop.set_clean_start(false);
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    log::debug!("incoming PUB: pkid {}", publish.pkid);

                    let is_dup_of_tracked = publish.dup
                        && publish.pkid != 0
                        && self.pkid_ack_queue.lock().unwrap().contains(publish.pkid);
                    if is_dup_of_tracked {
                        log::debug!("duplicate PUB for already-tracked PKID {}, discarding", publish.pkid);
                        continue;
                    }

                    if publish.pkid != 0 {
                        if let Err(e) = self.pkid_ack_queue.lock().unwrap().insert(publish.pkid) {
                            log::error!("failed to track PKID {} for ordered ack: {e}", publish.pkid);
                        }
                    }

                    // Snapshot the matching senders under the lock, then release it before
                    // awaiting the sends so the lock is never held across an await point.
                    let senders = self
                        .incoming_pub_dispatcher
                        .lock()
                        .unwrap()
                        .matching_senders(&publish);

                    match senders {
                        Ok(senders) => {
                            let mut num_dispatches = 0;
                            for tx in &senders {
                                if tx.send(publish.clone()).await.is_ok() {
                                    num_dispatches += 1;
                                }
                            }
                            if num_dispatches == 0 {
                                log::warn!("no live receiver for PUB (pkid {}), auto-acking", publish.pkid);
                                let acker = self.acker.clone();
                                let publish = publish.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = acker.ordered_ack(&publish).await {
                                        log::error!("auto-ack failed for pkid {}: {e}", publish.pkid);
                                    }
                                });
                            } else {
                                log::debug!("dispatched PUB (pkid {}) to {num_dispatches} receivers", publish.pkid);
                            }
                        }
                        Err(e) => {
                            log::warn!("error dispatching PUB (pkid {}), auto-acking: {e}", publish.pkid);
                            let acker = self.acker.clone();
                            let publish = publish.clone();
                            tokio::spawn(async move {
                                if let Err(e) = acker.ordered_ack(&publish).await {
                                    log::error!("auto-ack failed for pkid {}: {e}", publish.pkid);
                                }
                            });
                        }
                    }
                }
                Ok(Event::Incoming(Incoming::Auth(auth))) => {
                    log::debug!("incoming AUTH: {:?}", auth.reason_code);
                    let _ = auth_tx.send(auth.reason_code);
                }
                Ok(_other) => {}

                Err(ConnectionError::MqttState(_)) if self.state.desire_exit() => {
                    self.state.transition_disconnected();
                    break;
                }
                Err(e @ ConnectionError::ConnectionRefused(_)) => {
                    log::error!("connection refused: {e:?}");
                    result = Err(SessionErrorKind::Connection(e));
                    break;
                }
                Err(e) => {
                    self.state.transition_disconnected();
                    log::error!("connection error: {e:?}");

                    if let Some(delay) = self
                        .reconnect_policy
                        .next_reconnect_delay(prev_reconnect_attempts, &e)
                    {
                        log::info!("reconnecting in {delay:?}");
                        tokio::select! {
                            () = tokio::time::sleep(delay) => {}
                            () = self.notify_force_exit.notified() => {
                                result = Err(SessionErrorKind::ForceExit);
                                break;
                            }
                        }
                    } else {
                        log::info!("reconnect policy halted further attempts");
                        result = Err(SessionErrorKind::ReconnectHalted);
                        break;
                    }
                    prev_reconnect_attempts += 1;
                }
            }
        }

        self.state.transition_exited();
        cancel_token.cancel();
        result.map_err(Into::into)
    }

    async fn trigger_session_exit(&self) {
        self.state.transition_session_exit();
        if let Err(e) = self.client.disconnect().await {
            log::debug!("disconnect during session-initiated exit failed: {e}");
        }
    }
}

async fn run_sat_auth_background(
    sat_file: String,
    reauth_margin: Duration,
    client: impl InternalClient,
    auth_rx: tokio::sync::mpsc::UnboundedReceiver<AuthReasonCode>,
    cancel_token: CancellationToken,
) {
    let mut auth_context = match SatAuthContext::new(sat_file, auth_rx) {
        Ok(ctx) => ctx,
        Err(e) => {
            log::error!("failed to start {SAT_AUTHENTICATION_METHOD} auth watcher: {e}");
            return;
        }
    };

    // Re-authenticate either when the SAT file changes on disk, or proactively once the
    // current token is within `reauth_margin` of its own `exp` claim, whichever comes first.
    // The wait is recomputed every pass so a successful reauth re-arms the proactive timer
    // against the freshly rotated token.
    loop {
        let proactive_wait = match auth_context.time_until_reauth_deadline(reauth_margin) {
            Ok(d) => d,
            Err(e) => {
                log::warn!("could not determine SAT token expiry, relying on file-watch only: {e}");
                Duration::from_secs(3600)
            }
        };

        tokio::select! {
            () = cancel_token.cancelled() => {
                log::debug!("SAT auth background task cancelled");
                return;
            }
            () = auth_context.notified() => {
                log::debug!("SAT token file changed, reauthenticating");
            }
            () = tokio::time::sleep(proactive_wait) => {
                log::debug!("SAT token nearing expiry, reauthenticating proactively");
            }
        }

        if let Err(e) = auth_context.reauth(Duration::from_secs(30), &client).await {
            log::error!("SAT reauthentication failed: {e}");
        }
    }
}

/// Handle used to end a running [`Session`] from another task.
#[derive(Clone)]
pub struct SessionExitHandle<D>
where
    D: MqttDisconnect + Clone + Send + Sync,
{
    disconnector: D,
    state: Arc<SessionState>,
    force_exit: Arc<Notify>,
}

impl<D> SessionExitHandle<D>
where
    D: MqttDisconnect + Clone + Send + Sync,
{
    /// Attempt to gracefully end the session. Requires the session to currently be connected.
    ///
    /// # Errors
    /// Returns [`SessionExitError::BrokerUnavailable`] if the session is not connected.
    pub async fn try_exit(&self) -> Result<(), SessionExitError> {
        if !self.state.is_connected() {
            return Err(SessionExitError::BrokerUnavailable { attempted: false });
        }
        self.state.transition_user_exit();
        self.disconnector.disconnect().await?;
        self.state.condition_disconnected().await;
        Ok(())
    }

    /// As [`Self::try_exit`], but fails with [`SessionExitError::Timeout`] if the exit does not
    /// complete within `timeout`.
    ///
    /// # Errors
    /// Returns [`SessionExitError::Timeout`] or any error from [`Self::try_exit`].
    pub async fn try_exit_timeout(&self, timeout: Duration) -> Result<(), SessionExitError> {
        tokio::time::timeout(timeout, self.try_exit()).await?
    }

    /// Forcefully end the session, granting up to one second for a graceful exit first.
    ///
    /// Returns `true` if the exit was graceful, `false` if it had to be forced.
    pub async fn exit_force(&self) -> bool {
        self.state.transition_user_exit();
        let _ = self.disconnector.disconnect().await;
        tokio::select! {
            () = tokio::time::sleep(Duration::from_secs(1)) => {
                self.force_exit.notify_one();
                false
            }
            () = self.state.condition_disconnected() => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Mutex as AsyncMutex;

    use super::*;
    use crate::control_packet::{Publish, PublishProperties, QoS, SubscribeProperties, UnsubscribeProperties};
    use crate::error::ClientError;
    use crate::interface::{CompletionToken, ManualAck, MqttAck, MqttPubSub};

    #[derive(Clone, Default)]
    struct NullClient {
        disconnect_calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl MqttPubSub for NullClient {
        async fn publish(
            &self,
            _topic: impl Into<String> + Send,
            _qos: QoS,
            _retain: bool,
            _payload: impl Into<bytes::Bytes> + Send,
        ) -> Result<CompletionToken, ClientError> {
            Ok(CompletionToken::ready())
        }

        async fn publish_with_properties(
            &self,
            _topic: impl Into<String> + Send,
            _qos: QoS,
            _retain: bool,
            _payload: impl Into<bytes::Bytes> + Send,
            _properties: PublishProperties,
        ) -> Result<CompletionToken, ClientError> {
            Ok(CompletionToken::ready())
        }

        async fn subscribe(
            &self,
            _topic: impl Into<String> + Send,
            _qos: QoS,
        ) -> Result<CompletionToken, ClientError> {
            Ok(CompletionToken::ready())
        }

        async fn subscribe_with_properties(
            &self,
            _topic: impl Into<String> + Send,
            _qos: QoS,
            _properties: SubscribeProperties,
        ) -> Result<CompletionToken, ClientError> {
            Ok(CompletionToken::ready())
        }

        async fn unsubscribe(
            &self,
            _topic: impl Into<String> + Send,
        ) -> Result<CompletionToken, ClientError> {
            Ok(CompletionToken::ready())
        }

        async fn unsubscribe_with_properties(
            &self,
            _topic: impl Into<String> + Send,
            _properties: UnsubscribeProperties,
        ) -> Result<CompletionToken, ClientError> {
            Ok(CompletionToken::ready())
        }
    }

    #[async_trait]
    impl MqttAck for NullClient {
        async fn ack(&self, _publish: &Publish) -> Result<(), ClientError> {
            Ok(())
        }
    }

    #[async_trait]
    impl MqttDisconnect for NullClient {
        async fn disconnect(&self) -> Result<(), ClientError> {
            self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl InternalClient for NullClient {
        fn get_manual_ack(&self, _publish: &Publish) -> ManualAck {
            unimplemented!("not exercised by these tests")
        }

        async fn manual_ack(&self, _ack: ManualAck) -> Result<(), ClientError> {
            Ok(())
        }

        async fn reauth(&self, _auth_props: crate::control_packet::AuthProperties) -> Result<(), ClientError> {
            Ok(())
        }
    }

    struct ScriptedEventLoop {
        events: AsyncMutex<std::vec::IntoIter<Result<Event, ConnectionError>>>,
    }

    impl ScriptedEventLoop {
        fn new(events: Vec<Result<Event, ConnectionError>>) -> Self {
            Self {
                events: AsyncMutex::new(events.into_iter()),
            }
        }
    }

    #[async_trait]
    impl MqttEventLoop for ScriptedEventLoop {
        async fn poll(&mut self) -> Result<Event, ConnectionError> {
            match self.events.get_mut().next() {
                Some(event) => event,
                None => std::future::pending().await,
            }
        }

        fn set_clean_start(&mut self, _clean_start: bool) {}
    }

    #[tokio::test]
    async fn exit_handle_requires_connection() {
        let session = Session::new_from_injection(
            NullClient::default(),
            ScriptedEventLoop::new(vec![]),
            Box::new(ExponentialBackoffWithJitter::default()),
            "test-client".to_string(),
            None,
            Duration::from_secs(60),
            10,
        );
        let handle = session.get_session_exit_handle();
        let err = handle.try_exit().await.unwrap_err();
        assert!(matches!(err, SessionExitError::BrokerUnavailable { attempted: false }));
    }

    #[tokio::test]
    async fn session_rejects_reuse() {
        let mut session = Session::new_from_injection(
            NullClient::default(),
            ScriptedEventLoop::new(vec![]),
            Box::new(ExponentialBackoffWithJitter::default()),
            "test-client".to_string(),
            None,
            Duration::from_secs(60),
            10,
        );
        session.previously_run = true;
        let err = session.run().await.unwrap_err();
        assert!(matches!(err.kind(), SessionErrorKind::InvalidState(_)));
    }
}
