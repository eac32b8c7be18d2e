// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A [`Session`] manages a single MQTT session across reconnects: polling the event loop,
//! acking incoming publishes in receive order, and driving SAT reauthentication.

mod dispatcher;
mod managed_client;
mod ordered_acker;
mod reconnect_policy;
#[allow(clippy::module_inception)]
mod session;
mod state;

use thiserror::Error;

pub use managed_client::{SessionManagedClient, SessionPubReceiver};
pub use reconnect_policy::{ExponentialBackoffWithJitter, ReconnectPolicy};
pub use session::{Session, SessionExitHandle, SessionOptions, SessionOptionsBuilder};

use crate::error::ConnectionError;

/// Error type for [`Session`]. The kind of error is specified by [`SessionErrorKind`].
#[derive(Debug, Error)]
#[error(transparent)]
pub struct SessionError(#[from] SessionErrorKind);

impl SessionError {
    /// Return the kind of error that occurred.
    #[must_use]
    pub fn kind(&self) -> &SessionErrorKind {
        &self.0
    }
}

/// Error kind for [`SessionError`].
#[derive(Debug, Error)]
pub enum SessionErrorKind {
    /// Invalid configuration provided when constructing a [`Session`].
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The MQTT session was not present on the broker after a reconnect.
    #[error("session state not present on broker after reconnect")]
    SessionLost,
    /// The underlying connection failed in a way that cannot be recovered from.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    /// The reconnect policy declined to schedule another reconnect attempt.
    #[error("reconnection halted by reconnect policy")]
    ReconnectHalted,
    /// A forced exit was requested while reconnection was in progress.
    #[error("session was force-exited")]
    ForceExit,
    /// The [`Session`] was asked to do something inconsistent with its current state.
    #[error("invalid session state: {0}")]
    InvalidState(String),
}

/// Error ending a [`Session`] via a [`SessionExitHandle`].
#[derive(Debug, Error)]
pub enum SessionExitError {
    /// The broker could not be reached to negotiate a graceful exit.
    #[error("broker unavailable for graceful exit (attempted: {attempted})")]
    BrokerUnavailable {
        /// Whether a disconnect was actually sent to the broker before this error was returned.
        attempted: bool,
    },
    /// The underlying client reported an error while disconnecting.
    #[error(transparent)]
    Client(#[from] crate::error::ClientError),
    /// The graceful exit attempt did not complete within the requested timeout.
    #[error("graceful exit timed out")]
    Timeout,
}

impl From<tokio::time::error::Elapsed> for SessionExitError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        SessionExitError::Timeout
    }
}
