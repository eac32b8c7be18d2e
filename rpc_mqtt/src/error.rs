// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error types returned by this crate's client-facing operations.

use std::fmt;

/// Error connecting or reconnecting to an MQTT server.
pub type ConnectionError = rumqttc::v5::ConnectionError;
/// Error indicating an MQTT operation did not complete successfully once sent.
pub type CompletionError = rumqttc::NoticeError;
/// Error indicating a violation of the client's internal state machine.
pub type StateError = rumqttc::v5::StateError;

pub use crate::topic::TopicParseError;

/// Error publishing a message.
#[derive(Debug, thiserror::Error)]
#[error("{kind}")]
pub struct PublishError {
    kind: PublishErrorKind,
}

impl PublishError {
    #[must_use]
    pub fn new(kind: PublishErrorKind) -> Self {
        Self { kind }
    }

    #[must_use]
    pub fn kind(&self) -> &PublishErrorKind {
        &self.kind
    }
}

/// Category of [`PublishError`].
#[derive(Debug)]
pub enum PublishErrorKind {
    /// The client used to publish is no longer attached to a live session.
    DetachedClient,
    /// The topic name is not a valid MQTT topic name.
    InvalidTopicName(TopicParseError),
    /// The payload exceeds the broker's advertised maximum packet size.
    PayloadTooLarge { size: usize, max: usize },
}

impl fmt::Display for PublishErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishErrorKind::DetachedClient => write!(f, "client is detached from its session"),
            PublishErrorKind::InvalidTopicName(e) => write!(f, "invalid topic name: {e}"),
            PublishErrorKind::PayloadTooLarge { size, max } => {
                write!(f, "payload of {size} bytes exceeds broker maximum of {max} bytes")
            }
        }
    }
}

/// Error subscribing to a topic filter.
#[derive(Debug, thiserror::Error)]
#[error("{kind}")]
pub struct SubscribeError {
    kind: SubscribeErrorKind,
}

impl SubscribeError {
    #[must_use]
    pub fn new(kind: SubscribeErrorKind) -> Self {
        Self { kind }
    }

    #[must_use]
    pub fn kind(&self) -> &SubscribeErrorKind {
        &self.kind
    }
}

/// Category of [`SubscribeError`].
#[derive(Debug)]
pub enum SubscribeErrorKind {
    DetachedClient,
    InvalidTopicFilter(TopicParseError),
}

impl fmt::Display for SubscribeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscribeErrorKind::DetachedClient => write!(f, "client is detached from its session"),
            SubscribeErrorKind::InvalidTopicFilter(e) => write!(f, "invalid topic filter: {e}"),
        }
    }
}

/// Error unsubscribing from a topic filter.
#[derive(Debug, thiserror::Error)]
#[error("{kind}")]
pub struct UnsubscribeError {
    kind: UnsubscribeErrorKind,
}

impl UnsubscribeError {
    #[must_use]
    pub fn new(kind: UnsubscribeErrorKind) -> Self {
        Self { kind }
    }

    #[must_use]
    pub fn kind(&self) -> &UnsubscribeErrorKind {
        &self.kind
    }
}

/// Category of [`UnsubscribeError`].
#[derive(Debug)]
pub enum UnsubscribeErrorKind {
    DetachedClient,
    InvalidTopicFilter(TopicParseError),
}

impl fmt::Display for UnsubscribeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnsubscribeErrorKind::DetachedClient => write!(f, "client is detached from its session"),
            UnsubscribeErrorKind::InvalidTopicFilter(e) => write!(f, "invalid topic filter: {e}"),
        }
    }
}

/// Error acknowledging a received publish.
#[derive(Debug, thiserror::Error)]
#[error("{kind}")]
pub struct AckError {
    kind: AckErrorKind,
}

impl AckError {
    #[must_use]
    pub fn new(kind: AckErrorKind) -> Self {
        Self { kind }
    }

    #[must_use]
    pub fn kind(&self) -> &AckErrorKind {
        &self.kind
    }
}

/// Category of [`AckError`].
#[derive(Debug)]
pub enum AckErrorKind {
    DetachedClient,
    AlreadyAcked,
}

impl fmt::Display for AckErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckErrorKind::DetachedClient => write!(f, "client is detached from its session"),
            AckErrorKind::AlreadyAcked => write!(f, "publish has already been acknowledged"),
        }
    }
}

/// Error disconnecting from the broker.
#[derive(Debug, thiserror::Error)]
#[error("{kind}")]
pub struct DisconnectError {
    kind: DisconnectErrorKind,
}

impl DisconnectError {
    #[must_use]
    pub fn new(kind: DisconnectErrorKind) -> Self {
        Self { kind }
    }

    #[must_use]
    pub fn kind(&self) -> &DisconnectErrorKind {
        &self.kind
    }
}

/// Category of [`DisconnectError`].
#[derive(Debug)]
pub enum DisconnectErrorKind {
    DetachedClient,
}

impl fmt::Display for DisconnectErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectErrorKind::DetachedClient => write!(f, "client is detached from its session"),
        }
    }
}

/// Error re-authenticating an established connection.
#[derive(Debug, thiserror::Error)]
#[error("{kind}")]
pub struct ReauthError {
    kind: ReauthErrorKind,
}

impl ReauthError {
    #[must_use]
    pub fn new(kind: ReauthErrorKind) -> Self {
        Self { kind }
    }

    #[must_use]
    pub fn kind(&self) -> &ReauthErrorKind {
        &self.kind
    }
}

/// Category of [`ReauthError`].
#[derive(Debug)]
pub enum ReauthErrorKind {
    DetachedClient,
}

impl fmt::Display for ReauthErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReauthErrorKind::DetachedClient => write!(f, "client is detached from its session"),
        }
    }
}

/// Umbrella error returned by the [`MqttPubSub`](crate::interface::MqttPubSub) /
/// [`MqttAck`](crate::interface::MqttAck) / [`MqttDisconnect`](crate::interface::MqttDisconnect)
/// trait surface, where a single signature must cover every concrete failure.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error(transparent)]
    Subscribe(#[from] SubscribeError),
    #[error(transparent)]
    Unsubscribe(#[from] UnsubscribeError),
    #[error(transparent)]
    Ack(#[from] AckError),
    #[error(transparent)]
    Disconnect(#[from] DisconnectError),
    #[error(transparent)]
    Reauth(#[from] ReauthError),
}
