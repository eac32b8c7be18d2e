// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The receiving side of telemetry: subscribes to a filter and parses CloudEvents metadata back
//! off each message.

use std::collections::HashMap;
use std::marker::PhantomData;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;

use rpc_mqtt::interface::{ManagedClient, MqttAck, PubReceiver};

use crate::application::{ApplicationContext, Listener};
use crate::common::cloud_event::CloudEvent;
use crate::common::error::{ProtocolError, ProtocolErrorKind, ProtocolVersion};
use crate::common::payload_serialize::{FormatIndicator, PayloadSerialize};
use crate::common::topic_pattern::TopicPattern;
use crate::common::user_properties as up;
use crate::telemetry::TELEMETRY_PROTOCOL_VERSION;

/// Construction-time configuration for a [`Receiver`].
#[derive(Builder, Clone)]
#[builder(setter(into))]
pub struct Options {
    /// Topic pattern to subscribe to, e.g. `"telemetry/{senderId}"`.
    pub topic_pattern: String,
    /// Namespace prefix applied ahead of the topic pattern.
    #[builder(default)]
    pub topic_namespace: Option<String>,
    /// Token replacements fixed for the lifetime of this receiver.
    #[builder(default)]
    pub topic_token_map: HashMap<String, String>,
    /// If `true` (the default), messages are acknowledged as soon as they're parsed, before the
    /// caller processes them. Set `false` if the caller wants to withhold the ack itself, e.g. to
    /// control redelivery while a slow downstream sink catches up.
    #[builder(default = "true")]
    pub auto_ack: bool,
    /// Major protocol versions this receiver accepts.
    #[builder(default = "vec![1]")]
    pub supported_major_versions: Vec<u16>,
}

/// A single received telemetry message.
#[derive(Debug)]
pub struct Message<T: PayloadSerialize> {
    /// The deserialized payload.
    pub payload: T,
    /// CloudEvents metadata, if the message carried the required attributes.
    pub cloud_event: Option<CloudEvent>,
    /// Non-reserved user-properties attached to the message.
    pub custom_user_data: Vec<(String, String)>,
    /// The sender's client id, if it set one.
    pub sender_id: Option<String>,
    /// Token values extracted from the concrete topic the message arrived on.
    pub topic_tokens: HashMap<String, String>,
    /// The concrete topic the message arrived on.
    pub topic: String,
}

/// The receiving side of telemetry.
pub struct Receiver<T, C>
where
    T: PayloadSerialize + Send + Sync + 'static,
    C: ManagedClient + Clone + Send + Sync + 'static,
{
    topic_filter: String,
    topic_pattern: TopicPattern,
    mqtt_client: C,
    mqtt_receiver: AsyncMutex<C::PubReceiver>,
    auto_ack: bool,
    supported_major_versions: Vec<u16>,
    _payload: PhantomData<fn() -> T>,
}

impl<T, C> Receiver<T, C>
where
    T: PayloadSerialize + Send + Sync + 'static,
    C: ManagedClient + Clone + Send + Sync + 'static,
    C::PubReceiver: Send + 'static,
{
    /// Validate `options` and register (but do not yet subscribe to) the telemetry filter. Call
    /// [`start`](Listener::start) to begin receiving messages.
    ///
    /// # Errors
    /// Returns `ConfigurationInvalid` if the topic pattern is malformed.
    pub fn new(
        _application_context: ApplicationContext,
        mqtt_client: C,
        options: Options,
    ) -> Result<Self, ProtocolError> {
        let topic_pattern = TopicPattern::new(
            &options.topic_pattern,
            options.topic_namespace.as_deref(),
            &options.topic_token_map,
        )?;
        let topic_filter = topic_pattern.as_subscribe_topic();

        let mqtt_receiver = mqtt_client
            .create_filtered_pub_receiver(&topic_filter, options.auto_ack)
            .map_err(|e| {
                ProtocolError::new(ProtocolErrorKind::MqttError, format!("invalid telemetry filter: {e}"))
            })?;

        Ok(Self {
            topic_filter,
            topic_pattern,
            mqtt_client,
            mqtt_receiver: AsyncMutex::new(mqtt_receiver),
            auto_ack: options.auto_ack,
            supported_major_versions: options.supported_major_versions,
            _payload: PhantomData,
        })
    }

    /// Receive the next telemetry message, skipping (and, unless `auto_ack` is `false`,
    /// acknowledging) any that fail to parse or carry an unsupported protocol version.
    ///
    /// Returns `None` once the receiver has been stopped and no further messages will arrive.
    pub async fn recv(&self) -> Option<Message<T>> {
        loop {
            let publish = {
                let mut receiver = self.mqtt_receiver.lock().await;
                receiver.recv().await
            }?;

            let props = publish.properties.clone().unwrap_or_default();

            let version_ok = props
                .user_properties
                .iter()
                .find(|(k, _)| k == up::PROTOCOL_VERSION)
                .map(|(_, v)| v.parse::<ProtocolVersion>())
                .map_or(true, |parsed| {
                    parsed.is_ok_and(|v| self.supported_major_versions.contains(&v.major))
                });
            if !version_ok {
                log::warn!("dropping telemetry message with unsupported protocol version");
                self.ack_if_needed(&publish).await;
                continue;
            }

            let Ok(payload) = T::deserialize(&publish.payload) else {
                log::warn!("dropping telemetry message that failed to deserialize");
                self.ack_if_needed(&publish).await;
                continue;
            };

            let topic = String::from_utf8_lossy(&publish.topic).into_owned();
            let topic_tokens = self.topic_pattern.parse_tokens(&topic);
            let sender_id = props
                .user_properties
                .iter()
                .find(|(k, _)| k == up::SOURCE_ID)
                .map(|(_, v)| v.clone());
            let cloud_event = CloudEvent::from_headers(&props.user_properties);
            let custom_user_data = props
                .user_properties
                .into_iter()
                .filter(|(k, _)| !k.starts_with(up::RESERVED_PREFIX))
                .collect();

            self.ack_if_needed(&publish).await;

            return Some(Message {
                payload,
                cloud_event,
                custom_user_data,
                sender_id,
                topic_tokens,
                topic,
            });
        }
    }

    async fn ack_if_needed(&self, publish: &rpc_mqtt::control_packet::Publish) {
        if !self.auto_ack {
            let mut receiver = self.mqtt_receiver.lock().await;
            if let Err(e) = receiver.ack(publish).await {
                log::warn!("failed to ack telemetry message: {e}");
            }
        }
    }
}

#[async_trait]
impl<T, C> Listener for Receiver<T, C>
where
    T: PayloadSerialize + Send + Sync + 'static,
    C: ManagedClient + Clone + Send + Sync + 'static,
    C::PubReceiver: Send + 'static,
{
    fn topic_filter(&self) -> &str {
        &self.topic_filter
    }

    async fn start(&self) -> Result<(), ProtocolError> {
        self.mqtt_client
            .subscribe(self.topic_filter.clone(), rpc_mqtt::control_packet::QoS::AtLeastOnce)
            .await
            .map_err(|e| ProtocolError::new(ProtocolErrorKind::MqttError, e.to_string()))?
            .wait()
            .await
            .map_err(|e| ProtocolError::new(ProtocolErrorKind::MqttError, e.to_string()))
    }

    async fn stop(&self) -> Result<(), ProtocolError> {
        self.mqtt_client
            .unsubscribe(self.topic_filter.clone())
            .await
            .map_err(|e| ProtocolError::new(ProtocolErrorKind::MqttError, e.to_string()))?
            .wait()
            .await
            .map_err(|e| ProtocolError::new(ProtocolErrorKind::MqttError, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_builder_defaults_auto_ack_true() {
        let options = OptionsBuilder::default()
            .topic_pattern("telemetry/{senderId}")
            .build()
            .unwrap();
        assert!(options.auto_ack);
        assert_eq!(options.supported_major_versions, vec![1]);
    }
}
