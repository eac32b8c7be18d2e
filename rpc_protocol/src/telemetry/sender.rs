// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The sending side of telemetry: stamps CloudEvents metadata and publishes with no response
//! expected.

use std::collections::HashMap;
use std::marker::PhantomData;

use bytes::Bytes;

use rpc_mqtt::control_packet::{PublishProperties, QoS};
use rpc_mqtt::interface::{ManagedClient, MqttPubSub};

use crate::application::ApplicationContext;
use crate::common::cloud_event::{CloudEventBuilder, CloudEventSubject};
use crate::common::error::{ProtocolError, ProtocolErrorKind};
use crate::common::payload_serialize::PayloadSerialize;
use crate::common::topic_pattern::TopicPattern;
use crate::common::user_properties as up;
use crate::telemetry::{DEFAULT_TELEMETRY_CLOUD_EVENT_TYPE, TELEMETRY_PROTOCOL_VERSION};

/// Construction-time configuration for a [`Sender`].
#[derive(Builder, Clone)]
#[builder(setter(into))]
pub struct SenderOptions {
    /// Topic pattern to publish telemetry on, e.g. `"telemetry/{senderId}"`.
    pub topic_pattern: String,
    /// Namespace prefix applied ahead of the topic pattern.
    #[builder(default)]
    pub topic_namespace: Option<String>,
    /// Token replacements fixed for the lifetime of this sender.
    #[builder(default)]
    pub topic_token_map: HashMap<String, String>,
    /// CloudEvents `type` attribute stamped on every message, unless a call to
    /// [`Sender::send`] provides a per-message override via [`Message`].
    #[builder(default = "DEFAULT_TELEMETRY_CLOUD_EVENT_TYPE.to_string()")]
    pub cloud_event_type: String,
}

/// A single outgoing telemetry message.
#[derive(Builder, Clone)]
#[builder(setter(into))]
pub struct Message<T: PayloadSerialize> {
    payload: T,
    /// Token replacements specific to this message.
    #[builder(default)]
    topic_tokens: HashMap<String, String>,
    /// Caller-supplied metadata carried as MQTT user-properties. Must not use the `__` prefix.
    #[builder(default)]
    custom_user_data: Vec<(String, String)>,
}

/// The sending side of telemetry.
pub struct Sender<T, C>
where
    T: PayloadSerialize + Send + Sync + 'static,
    C: ManagedClient + Clone + Send + Sync + 'static,
{
    client_id: String,
    mqtt_client: C,
    topic_pattern: TopicPattern,
    cloud_event_type: String,
    _payload: PhantomData<fn(T)>,
}

impl<T, C> Sender<T, C>
where
    T: PayloadSerialize + Send + Sync + 'static,
    C: ManagedClient + Clone + Send + Sync + 'static,
{
    /// Validate `options` and build a sender bound to `mqtt_client`.
    ///
    /// # Errors
    /// Returns `ConfigurationInvalid` if the topic pattern is malformed.
    pub fn new(
        _application_context: ApplicationContext,
        mqtt_client: C,
        options: SenderOptions,
    ) -> Result<Self, ProtocolError> {
        let client_id = mqtt_client.client_id().to_string();
        let mut tokens = options.topic_token_map.clone();
        tokens.insert("senderId".to_string(), client_id.clone());

        let topic_pattern = TopicPattern::new(
            &options.topic_pattern,
            options.topic_namespace.as_deref(),
            &tokens,
        )?;

        Ok(Self {
            client_id,
            mqtt_client,
            topic_pattern,
            cloud_event_type: options.cloud_event_type,
            _payload: PhantomData,
        })
    }

    /// Publish a telemetry message. There is no response: delivery is at-least-once at the MQTT
    /// layer, acknowledged by the broker, not by any consumer.
    ///
    /// # Errors
    /// Returns `ArgumentInvalid` if `message.custom_user_data` uses the reserved property prefix,
    /// `PayloadInvalid` if the payload fails to serialize, or `MqttError` if the publish fails.
    pub async fn send(&self, message: Message<T>) -> Result<(), ProtocolError> {
        up::validate_user_properties(&message.custom_user_data).map_err(|msg| {
            ProtocolError::new(
                ProtocolErrorKind::ArgumentInvalid {
                    property_name: "custom_user_data".to_string(),
                    property_value: crate::common::error::Value::String(msg.clone()),
                },
                msg,
            )
        })?;

        let topic = self.topic_pattern.as_publish_topic(&message.topic_tokens)?;

        let payload = message
            .payload
            .serialize()
            .map_err(|_| ProtocolError::new(ProtocolErrorKind::PayloadInvalid, "telemetry payload failed to serialize"))?;

        let cloud_event = CloudEventBuilder::new(self.cloud_event_type.clone())
            .source(format!("aio://{}", self.client_id))
            .subject(CloudEventSubject::PublishTopic)
            .data_schema(None)
            .build()
            .map_err(|e| ProtocolError::new(ProtocolErrorKind::InternalLogicError, e.to_string()))?;

        let mut user_properties = vec![
            (up::PROTOCOL_VERSION.to_string(), TELEMETRY_PROTOCOL_VERSION.to_string()),
            (up::SOURCE_ID.to_string(), self.client_id.clone()),
        ];
        user_properties.extend(cloud_event.into_headers(&topic));
        user_properties.extend(message.custom_user_data);

        let properties = PublishProperties {
            payload_format_indicator: Some(T::format_indicator() as u8),
            content_type: Some(T::content_type().to_string()),
            user_properties,
            ..Default::default()
        };

        self.mqtt_client
            .publish_with_properties(topic, QoS::AtLeastOnce, false, Bytes::from(payload), properties)
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
    use crate::common::payload_serialize::Raw;

    #[test]
    fn options_builder_defaults_cloud_event_type() {
        let options = SenderOptionsBuilder::default()
            .topic_pattern("telemetry/{senderId}")
            .build()
            .unwrap();
        assert_eq!(options.cloud_event_type, DEFAULT_TELEMETRY_CLOUD_EVENT_TYPE);
    }

    #[test]
    fn message_builder_defaults_empty_metadata() {
        let message = MessageBuilder::<Raw>::default()
            .payload(Raw(vec![1, 2, 3]))
            .build()
            .unwrap();
        assert!(message.custom_user_data.is_empty());
        assert!(message.topic_tokens.is_empty());
    }
}
