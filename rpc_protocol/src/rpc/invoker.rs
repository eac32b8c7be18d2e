// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The invoker (client) side of command RPC: publishes a request, correlates the eventual
//! response, and resolves or times out the caller's future.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use rpc_mqtt::control_packet::{Publish, PublishProperties, QoS};
use rpc_mqtt::interface::ManagedClient;
use rpc_mqtt::interface::{MqttPubSub, PubReceiver};

use crate::application::ApplicationContext;
use crate::common::error::{decode_error, ProtocolError, ProtocolErrorKind, ProtocolVersion};
use crate::common::payload_serialize::PayloadSerialize;
use crate::common::topic_pattern::TopicPattern;
use crate::common::user_properties as up;
use crate::rpc::COMMAND_PROTOCOL_VERSION;

/// A single command invocation: its payload, per-call topic tokens, caller metadata, and deadline.
#[derive(Builder, Clone)]
#[builder(setter(into))]
pub struct CommandRequest<TReq: PayloadSerialize> {
    payload: TReq,
    /// Token replacements specific to this call (e.g. which executor to target).
    #[builder(default)]
    topic_tokens: HashMap<String, String>,
    /// Caller-supplied metadata carried as MQTT user-properties. Must not use the `__` prefix.
    #[builder(default)]
    custom_user_data: Vec<(String, String)>,
    /// How long to wait for a response before failing with [`ProtocolErrorKind::Timeout`].
    timeout: Duration,
}

/// The resolved result of a successful invocation.
#[derive(Debug, Clone)]
pub struct CommandResponse<TResp: PayloadSerialize> {
    /// The deserialized response payload.
    pub payload: TResp,
    /// Non-reserved user-properties the executor attached to its response.
    pub custom_user_data: Vec<(String, String)>,
}

/// Construction-time configuration for a [`CommandInvoker`].
#[derive(Builder, Clone)]
#[builder(setter(into))]
pub struct CommandInvokerOptions {
    /// Request topic pattern, e.g. `"rpc/{executorId}/{commandName}"`.
    pub request_topic_pattern: String,
    /// Response topic pattern. Defaults to `request_topic_pattern` prefixed with
    /// `"clients/{invokerClientId}/"` if omitted.
    #[builder(default)]
    pub response_topic_pattern: Option<String>,
    /// The command name, substituted for a `{commandName}` token if the pattern contains one.
    pub command_name: String,
    /// Namespace prefix applied ahead of both topic patterns.
    #[builder(default)]
    pub topic_namespace: Option<String>,
    /// Token replacements fixed for the lifetime of this invoker (as opposed to per-call tokens
    /// on [`CommandRequest`]).
    #[builder(default)]
    pub custom_topic_token_map: HashMap<String, String>,
    /// Major protocol versions this invoker accepts in responses.
    #[builder(default = "vec![1]")]
    pub supported_major_versions: Vec<u16>,
}

/// The client side of command RPC, generic over the request/response payload encodings and the
/// underlying MQTT client.
///
/// Subscribes to its response topic filter once, at construction, and fans inbound responses out
/// to whichever [`invoke`](Self::invoke) call is waiting on the matching correlation id via a
/// single-shot [`oneshot`] channel.
pub struct CommandInvoker<TReq, TResp, C>
where
    TReq: PayloadSerialize + Send + Sync + 'static,
    TResp: PayloadSerialize + Send + Sync + 'static,
    C: ManagedClient + Clone + Send + Sync + 'static,
{
    client_id: String,
    command_name: String,
    request_topic_pattern: TopicPattern,
    response_topic_pattern: TopicPattern,
    base_tokens: HashMap<String, String>,
    mqtt_client: C,
    pending: Arc<Mutex<HashMap<Vec<u8>, oneshot::Sender<Publish>>>>,
    shutdown_token: CancellationToken,
    _payloads: PhantomData<fn() -> (TReq, TResp)>,
}

impl<TReq, TResp, C> CommandInvoker<TReq, TResp, C>
where
    TReq: PayloadSerialize + Send + Sync + 'static,
    TResp: PayloadSerialize + Send + Sync + 'static,
    C: ManagedClient + Clone + Send + Sync + 'static,
    C::PubReceiver: Send + 'static,
{
    /// Validate `options`, subscribe to the response topic filter, and start the response
    /// dispatch task.
    ///
    /// # Errors
    /// Returns `ConfigurationInvalid` if either topic pattern is malformed, or `MqttError` if the
    /// response subscribe fails.
    pub async fn new(
        _application_context: ApplicationContext,
        mqtt_client: C,
        options: CommandInvokerOptions,
    ) -> Result<Self, ProtocolError> {
        let client_id = mqtt_client.client_id().to_string();

        let mut base_tokens = options.custom_topic_token_map.clone();
        base_tokens.insert("invokerClientId".to_string(), client_id.clone());
        base_tokens.insert("commandName".to_string(), options.command_name.clone());

        let request_topic_pattern = TopicPattern::new(
            &options.request_topic_pattern,
            options.topic_namespace.as_deref(),
            &base_tokens,
        )?;

        let response_pattern_str = options.response_topic_pattern.unwrap_or_else(|| {
            format!("clients/{{invokerClientId}}/{}", options.request_topic_pattern)
        });
        let response_topic_pattern = TopicPattern::new(
            &response_pattern_str,
            options.topic_namespace.as_deref(),
            &base_tokens,
        )?;

        let response_filter = response_topic_pattern.as_subscribe_topic();
        let mut receiver = mqtt_client
            .create_filtered_pub_receiver(&response_filter, true)
            .map_err(|e| {
                ProtocolError::new(ProtocolErrorKind::MqttError, format!("invalid response filter: {e}"))
            })?;
        mqtt_client
            .subscribe(response_filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| ProtocolError::new(ProtocolErrorKind::MqttError, e.to_string()))?
            .wait()
            .await
            .map_err(|e| ProtocolError::new(ProtocolErrorKind::MqttError, e.to_string()))?;

        let pending: Arc<Mutex<HashMap<Vec<u8>, oneshot::Sender<Publish>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let shutdown_token = CancellationToken::new();

        let dispatch_pending = pending.clone();
        let dispatch_shutdown = shutdown_token.clone();
        let dispatch_supported_versions = options.supported_major_versions.clone();
        tokio::spawn(async move {
            loop {
                let publish = tokio::select! {
                    biased;
                    () = dispatch_shutdown.cancelled() => break,
                    publish = receiver.recv() => publish,
                };
                let Some(publish) = publish else { break };
                let props = publish.properties.clone().unwrap_or_default();

                let version_ok = props
                    .user_properties
                    .iter()
                    .find(|(k, _)| k == up::PROTOCOL_VERSION)
                    .map(|(_, v)| v.parse::<ProtocolVersion>())
                    .map_or(true, |parsed| {
                        parsed.is_ok_and(|v| dispatch_supported_versions.contains(&v.major))
                    });
                if !version_ok {
                    log::warn!("received response with unsupported protocol version, dropping");
                    continue;
                }

                let Some(correlation_data) = props.correlation_data.as_ref() else {
                    log::warn!("received response with no correlation data, dropping");
                    continue;
                };
                if let Some(tx) = dispatch_pending.lock().unwrap().remove(correlation_data.as_ref()) {
                    let _ = tx.send(publish);
                }
            }
        });

        Ok(Self {
            client_id,
            command_name: options.command_name,
            request_topic_pattern,
            response_topic_pattern,
            base_tokens,
            mqtt_client,
            pending,
            shutdown_token,
            _payloads: PhantomData,
        })
    }

    /// Invoke the command, publishing a request and awaiting its correlated response.
    ///
    /// # Errors
    /// Returns `ArgumentInvalid` if `request.custom_user_data` uses the reserved property prefix,
    /// `PayloadInvalid` if the request fails to serialize, `MqttError` if the publish fails, the
    /// decoded error if the executor responded with one, or `Timeout` if no response arrives
    /// within `request.timeout`.
    pub async fn invoke(
        &self,
        request: CommandRequest<TReq>,
    ) -> Result<CommandResponse<TResp>, ProtocolError> {
        up::validate_user_properties(&request.custom_user_data).map_err(|msg| {
            ProtocolError::new(
                ProtocolErrorKind::ArgumentInvalid {
                    property_name: "custom_user_data".to_string(),
                    property_value: crate::common::error::Value::String(msg.clone()),
                },
                msg,
            )
        })?;

        let mut tokens = self.base_tokens.clone();
        tokens.extend(request.topic_tokens);

        let request_topic = self.request_topic_pattern.as_publish_topic(&tokens)?;
        let response_topic = self.response_topic_pattern.as_publish_topic(&tokens)?;

        let payload = request
            .payload
            .serialize()
            .map_err(|_| ProtocolError::new(ProtocolErrorKind::PayloadInvalid, "request payload failed to serialize"))?;

        let correlation_data = Uuid::now_v7().as_bytes().to_vec();

        let mut user_properties = vec![
            (up::PROTOCOL_VERSION.to_string(), COMMAND_PROTOCOL_VERSION.to_string()),
            (up::SOURCE_ID.to_string(), self.client_id.clone()),
        ];
        user_properties.extend(request.custom_user_data);

        let properties = PublishProperties {
            payload_format_indicator: Some(TReq::format_indicator() as u8),
            message_expiry_interval: Some(u32::try_from(request.timeout.as_secs()).unwrap_or(u32::MAX)),
            response_topic: Some(response_topic),
            correlation_data: Some(Bytes::from(correlation_data.clone())),
            content_type: Some(TReq::content_type().to_string()),
            user_properties,
            ..Default::default()
        };

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(correlation_data.clone(), tx);

        let publish_result = self
            .mqtt_client
            .publish_with_properties(request_topic, QoS::AtLeastOnce, false, payload, properties)
            .await;
        let token = match publish_result {
            Ok(token) => token,
            Err(e) => {
                self.pending.lock().unwrap().remove(&correlation_data);
                return Err(ProtocolError::new(ProtocolErrorKind::MqttError, e.to_string()));
            }
        };
        if let Err(e) = token.wait().await {
            self.pending.lock().unwrap().remove(&correlation_data);
            return Err(ProtocolError::new(ProtocolErrorKind::MqttError, e.to_string()));
        }

        let response = match tokio::time::timeout(request.timeout, rx).await {
            Ok(Ok(publish)) => publish,
            Ok(Err(_)) => {
                return Err(ProtocolError::new(
                    ProtocolErrorKind::InternalLogicError,
                    "response dispatch task ended before this invocation resolved",
                ))
            }
            Err(_) => {
                self.pending.lock().unwrap().remove(&correlation_data);
                return Err(ProtocolError::timeout(
                    format!("invocation of '{}'", self.command_name),
                    request.timeout,
                ));
            }
        };

        self.decode_response(response)
    }

    fn decode_response(&self, publish: Publish) -> Result<CommandResponse<TResp>, ProtocolError> {
        let props = publish
            .properties
            .map(|p| p.user_properties)
            .unwrap_or_default();

        if let Some(err) = decode_error(&props) {
            return Err(err);
        }

        let payload = TResp::deserialize(&publish.payload)
            .map_err(|_| ProtocolError::new(ProtocolErrorKind::PayloadInvalid, "response payload failed to deserialize"))?;

        let custom_user_data = props
            .into_iter()
            .filter(|(k, _)| !k.starts_with(up::RESERVED_PREFIX))
            .collect();

        Ok(CommandResponse { payload, custom_user_data })
    }

    /// Stop the response dispatch task. Further [`invoke`](Self::invoke) calls will hang until
    /// timeout since no response can ever be delivered.
    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }
}

impl<TReq, TResp, C> Drop for CommandInvoker<TReq, TResp, C>
where
    TReq: PayloadSerialize + Send + Sync + 'static,
    TResp: PayloadSerialize + Send + Sync + 'static,
    C: ManagedClient + Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_builder_defaults_response_pattern_to_none() {
        let options = CommandInvokerOptionsBuilder::default()
            .request_topic_pattern("rpc/{executorId}/add")
            .command_name("add")
            .build()
            .unwrap();
        assert!(options.response_topic_pattern.is_none());
    }

    #[test]
    fn request_builder_requires_payload_and_timeout() {
        let err = CommandRequestBuilder::<crate::common::payload_serialize::Raw>::default().build();
        assert!(err.is_err());
    }
}
