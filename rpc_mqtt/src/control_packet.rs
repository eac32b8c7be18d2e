// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Type aliases for the MQTT control packets and properties used at this crate's surface.
//!
//! These are re-exported from `rumqttc` rather than redefined so that callers never need to take
//! a direct dependency on `rumqttc` themselves.

/// Quality of service level. Only `AtMostOnce` and `AtLeastOnce` are used by this runtime.
pub type QoS = rumqttc::v5::mqttbytes::QoS;
/// An inbound or outbound publish packet.
pub type Publish = rumqttc::v5::mqttbytes::v5::Publish;
/// Properties attached to a CONNECT packet.
pub type ConnectProperties = rumqttc::v5::mqttbytes::v5::ConnectProperties;
/// Properties attached to a PUBLISH packet.
pub type PublishProperties = rumqttc::v5::mqttbytes::v5::PublishProperties;
/// Properties attached to a SUBSCRIBE packet.
pub type SubscribeProperties = rumqttc::v5::mqttbytes::v5::SubscribeProperties;
/// Properties attached to an UNSUBSCRIBE packet.
pub type UnsubscribeProperties = rumqttc::v5::mqttbytes::v5::UnsubscribeProperties;
/// Properties attached to an AUTH packet.
pub type AuthProperties = rumqttc::v5::mqttbytes::v5::AuthProperties;
/// Reason code carried in an AUTH packet.
pub type AuthReasonCode = rumqttc::v5::mqttbytes::v5::AuthReasonCode;
/// A single MQTT 5 user-property key/value pair.
pub type UserProperty = (String, String);

#[cfg(test)]
/// Minimal stand-in for a PUBACK, used only to assert on ack ordering in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubAck {
    pub pkid: u16,
}
