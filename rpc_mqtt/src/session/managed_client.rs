// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! [`SessionManagedClient`] and [`SessionPubReceiver`]: the client-facing handles a [`Session`]
//! hands out for sending and receiving MQTT messages.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc::Receiver;

use crate::control_packet::{
    Publish, PublishProperties, QoS, SubscribeProperties, UnsubscribeProperties,
};
use crate::error::ClientError;
use crate::interface::{CompletionToken, ManagedClient, MqttAck, MqttPubSub, PubReceiver};
use crate::session::dispatcher::IncomingPublishDispatcher;
use crate::session::ordered_acker::OrderedAcker;
use crate::topic::{TopicFilter, TopicParseError};

/// An MQTT client whose connection state is externally managed by a [`Session`](super::Session).
///
/// Use this to send outgoing messages and to create receivers for incoming messages on topic
/// filters of interest.
#[derive(Clone)]
pub struct SessionManagedClient<PS>
where
    PS: MqttAck + Clone + Send + Sync,
{
    pub(crate) client_id: String,
    pub(crate) pub_sub: PS,
    pub(crate) incoming_pub_dispatcher: Arc<Mutex<IncomingPublishDispatcher>>,
    pub(crate) acker: OrderedAcker<PS>,
}

impl<PS> ManagedClient for SessionManagedClient<PS>
where
    PS: MqttPubSub + MqttAck + Clone + Send + Sync,
{
    type PubReceiver = SessionPubReceiver<PS>;

    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn create_filtered_pub_receiver(
        &self,
        topic_filter: &str,
        auto_ack: bool,
    ) -> Result<SessionPubReceiver<PS>, TopicParseError> {
        let topic_filter: TopicFilter = topic_filter.parse()?;
        let rx = self
            .incoming_pub_dispatcher
            .lock()
            .unwrap()
            .register_filter(&topic_filter);
        Ok(SessionPubReceiver::new(rx, self.acker.clone(), auto_ack))
    }
}

#[async_trait]
impl<PS> MqttPubSub for SessionManagedClient<PS>
where
    PS: MqttPubSub + MqttAck + Clone + Send + Sync,
{
    async fn publish(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
        retain: bool,
        payload: impl Into<Bytes> + Send,
    ) -> Result<CompletionToken, ClientError> {
        self.pub_sub.publish(topic, qos, retain, payload).await
    }

    async fn publish_with_properties(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
        retain: bool,
        payload: impl Into<Bytes> + Send,
        properties: PublishProperties,
    ) -> Result<CompletionToken, ClientError> {
        self.pub_sub
            .publish_with_properties(topic, qos, retain, payload, properties)
            .await
    }

    async fn subscribe(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
    ) -> Result<CompletionToken, ClientError> {
        self.pub_sub.subscribe(topic, qos).await
    }

    async fn subscribe_with_properties(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
        properties: SubscribeProperties,
    ) -> Result<CompletionToken, ClientError> {
        self.pub_sub
            .subscribe_with_properties(topic, qos, properties)
            .await
    }

    async fn unsubscribe(
        &self,
        topic: impl Into<String> + Send,
    ) -> Result<CompletionToken, ClientError> {
        self.pub_sub.unsubscribe(topic).await
    }

    async fn unsubscribe_with_properties(
        &self,
        topic: impl Into<String> + Send,
        properties: UnsubscribeProperties,
    ) -> Result<CompletionToken, ClientError> {
        self.pub_sub
            .unsubscribe_with_properties(topic, properties)
            .await
    }
}

/// Receive and acknowledge incoming MQTT messages for a single registered topic filter.
pub struct SessionPubReceiver<A: MqttAck + Clone + Send> {
    pub_rx: Receiver<Publish>,
    acker: OrderedAcker<A>,
    auto_ack: bool,
}

impl<A: MqttAck + Clone> SessionPubReceiver<A> {
    pub(crate) fn new(pub_rx: Receiver<Publish>, acker: OrderedAcker<A>, auto_ack: bool) -> Self {
        Self {
            pub_rx,
            acker,
            auto_ack,
        }
    }
}

#[async_trait]
impl<A: MqttAck + Clone + Send + Sync> PubReceiver for SessionPubReceiver<A> {
    async fn recv(&mut self) -> Option<Publish> {
        let result = self.pub_rx.recv().await;
        if let Some(publish) = &result {
            if self.auto_ack {
                if let Err(e) = self.acker.ordered_ack(publish).await {
                    log::error!("auto-ack failed for PKID {}: {e}", publish.pkid);
                }
            }
        }
        result
    }
}

#[async_trait]
impl<A: MqttAck + Clone + Send + Sync> MqttAck for SessionPubReceiver<A> {
    async fn ack(&self, publish: &Publish) -> Result<(), ClientError> {
        self.acker.ordered_ack(publish).await?;
        Ok(())
    }
}

impl<A: MqttAck + Clone + Send> Drop for SessionPubReceiver<A> {
    fn drop(&mut self) {
        // Close the channel so the dispatcher stops sending, then drain and auto-ack anything
        // already in flight so the ordered-ack queue doesn't get stuck waiting for a PKID this
        // receiver will now never ack.
        self.pub_rx.close();
        while let Ok(publish) = self.pub_rx.try_recv() {
            log::warn!(
                "dropping receiver with unacked publish (PKID {}), auto-acking",
                publish.pkid
            );
            let acker = self.acker.clone();
            tokio::spawn(async move {
                if let Err(e) = acker.ordered_ack(&publish).await {
                    log::error!("auto-ack on drop failed for PKID {}: {e}", publish.pkid);
                }
            });
        }
    }
}
