// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The executor (server) side of command RPC: subscribes to a request filter, deduplicates
//! retried requests against an idempotency cache, and hands new requests to the caller one at a
//! time via [`recv`](Executor::recv).

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use rpc_mqtt::control_packet::{Publish, PublishProperties, QoS};
use rpc_mqtt::interface::{ManagedClient, MqttAck, MqttPubSub, PubReceiver};

use crate::application::{ApplicationContext, Listener};
use crate::common::error::{encode_error, ProtocolError, ProtocolErrorKind, ProtocolVersion};
use crate::common::payload_serialize::{FormatIndicator, PayloadSerialize};
use crate::common::topic_pattern::TopicPattern;
use crate::common::user_properties as up;
use crate::rpc::COMMAND_PROTOCOL_VERSION;

/// Construction-time configuration for an [`Executor`].
#[derive(Builder, Clone)]
#[builder(setter(into))]
pub struct ExecutorOptions {
    /// Request topic pattern, e.g. `"rpc/{executorId}/{commandName}"`.
    pub request_topic_pattern: String,
    /// The command name this executor handles.
    pub command_name: String,
    /// Namespace prefix applied ahead of the topic pattern.
    #[builder(default)]
    pub topic_namespace: Option<String>,
    /// Token replacements fixed for the lifetime of this executor.
    #[builder(default)]
    pub custom_topic_token_map: HashMap<String, String>,
    /// Deadline applied to each invocation, further bounded by the request's own message-expiry
    /// if the invoker set one. Exceeding it does not cancel a running handler — the handler is
    /// free to keep running and is never killed — but [`Request::complete`]/
    /// [`Request::complete_error`] silently skip the response publish once it has passed, since
    /// the invoker has certainly given up by then.
    #[builder(default = "Duration::from_secs(10)")]
    pub execution_timeout: Duration,
    /// How long a completed response is replayed for an exact-duplicate (retried) request.
    #[builder(default = "Duration::from_secs(300)")]
    pub idempotency_cache_ttl: Duration,
    /// Major protocol versions this executor accepts from invokers.
    #[builder(default = "vec![1]")]
    pub supported_major_versions: Vec<u16>,
    /// Shared-subscription group name. When set, the subscribe filter is wrapped as
    /// `$share/{group}/{filter}` so multiple executor instances load-balance requests.
    #[builder(default)]
    pub shared_subscription_group: Option<String>,
}

/// A single resolved idempotency-cache entry: exactly what was last published for a given
/// correlation id, so a retried request can be answered identically without re-running the
/// handler.
#[derive(Clone)]
struct CachedResponse {
    payload: Vec<u8>,
    content_type: Option<String>,
    format_indicator: Option<FormatIndicator>,
    user_properties: Vec<(String, String)>,
    correlation_data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    correlation_data: Vec<u8>,
    request_topic: String,
}

enum CacheEntry {
    InProgress(watch::Receiver<Option<Arc<CachedResponse>>>),
    Cached {
        response: Arc<CachedResponse>,
        expires_at: Instant,
    },
}

enum CacheLookup {
    NotFound,
    Cached(Arc<CachedResponse>),
    InProgress(watch::Receiver<Option<Arc<CachedResponse>>>),
}

#[derive(Clone, Default)]
struct Cache(Arc<Mutex<HashMap<CacheKey, CacheEntry>>>);

impl Cache {
    fn lookup(&self, key: &CacheKey) -> CacheLookup {
        let mut map = self.0.lock().unwrap();
        match map.get(key) {
            Some(CacheEntry::Cached { response, expires_at }) => {
                if Instant::now() < *expires_at {
                    CacheLookup::Cached(response.clone())
                } else {
                    map.remove(key);
                    CacheLookup::NotFound
                }
            }
            Some(CacheEntry::InProgress(rx)) => CacheLookup::InProgress(rx.clone()),
            None => CacheLookup::NotFound,
        }
    }

    /// Mark `key` as in-flight, returning the sender used to resolve every waiter once the
    /// handler completes.
    fn begin(&self, key: CacheKey) -> watch::Sender<Option<Arc<CachedResponse>>> {
        let (tx, rx) = watch::channel(None);
        self.0.lock().unwrap().insert(key, CacheEntry::InProgress(rx));
        tx
    }

    fn complete(
        &self,
        key: CacheKey,
        response: Arc<CachedResponse>,
        ttl: Duration,
        tx: watch::Sender<Option<Arc<CachedResponse>>>,
    ) {
        self.0
            .lock()
            .unwrap()
            .insert(key, CacheEntry::Cached { response: response.clone(), expires_at: Instant::now() + ttl });
        let _ = tx.send(Some(response));
    }

    fn abandon(&self, key: &CacheKey) {
        self.0.lock().unwrap().remove(key);
    }
}

/// Abandons its cache entry on drop unless [`disarm`](CacheGuard::disarm) is called first, so a
/// request whose handler panics or is dropped without answering doesn't wedge duplicate retries
/// behind an in-progress entry that will never resolve.
struct CacheGuard(Option<(Cache, CacheKey)>);

impl CacheGuard {
    fn new(cache: Cache, key: CacheKey) -> Self {
        Self(Some((cache, key)))
    }

    fn disarm(mut self) -> (Cache, CacheKey) {
        self.0.take().expect("CacheGuard disarmed twice")
    }
}

impl Drop for CacheGuard {
    fn drop(&mut self) {
        if let Some((cache, key)) = self.0.take() {
            cache.abandon(&key);
        }
    }
}

/// The typed payload a handler returns to [`Request::complete`].
#[derive(Debug, Clone)]
pub struct Response<TResp: PayloadSerialize> {
    /// The response payload.
    pub payload: TResp,
    /// Additional user-properties to attach, beyond the reserved protocol ones.
    pub custom_user_data: Vec<(String, String)>,
}

impl<TResp: PayloadSerialize> Response<TResp> {
    /// Build a response with no additional user-properties.
    pub fn new(payload: TResp) -> Self {
        Self { payload, custom_user_data: Vec::new() }
    }
}

/// A single inbound command invocation, ready for the caller to act on and answer.
pub struct Request<TReq, TResp, C>
where
    TReq: PayloadSerialize,
    TResp: PayloadSerialize,
    C: ManagedClient + Clone + Send + Sync + 'static,
{
    /// The deserialized request payload.
    pub payload: TReq,
    /// Token values extracted from the concrete request topic (e.g. which resource was targeted).
    pub topic_tokens: HashMap<String, String>,
    /// Non-reserved user-properties the invoker attached to its request.
    pub custom_user_data: Vec<(String, String)>,
    response_topic: String,
    correlation_data: Option<Vec<u8>>,
    original_publish: Publish,
    mqtt_client: C,
    cache_guard: CacheGuard,
    cache_ttl: Duration,
    ack_tx: mpsc::UnboundedSender<Publish>,
    resolve_tx: watch::Sender<Option<Arc<CachedResponse>>>,
    received_at: Instant,
    deadline: Duration,
    _resp: PhantomData<fn() -> TResp>,
}

impl<TReq, TResp, C> Request<TReq, TResp, C>
where
    TReq: PayloadSerialize,
    TResp: PayloadSerialize,
    C: ManagedClient + Clone + Send + Sync + 'static,
{
    /// Publish a successful response, cache it for the idempotency window, and acknowledge the
    /// original request publish.
    ///
    /// # Errors
    /// Returns `PayloadInvalid` if the response fails to serialize, or `MqttError` if the publish
    /// fails.
    pub async fn complete(self, response: Response<TResp>) -> Result<(), ProtocolError> {
        let payload = response
            .payload
            .serialize()
            .map_err(|_| ProtocolError::new(ProtocolErrorKind::PayloadInvalid, "response payload failed to serialize"))?;
        self.respond(payload, Some(TResp::content_type().to_string()), Some(TResp::format_indicator()), {
            let mut props = vec![(up::STATUS.to_string(), "200".to_string())];
            props.extend(response.custom_user_data);
            props
        })
        .await
    }

    /// Publish an application-level error response (maps to [`ProtocolErrorKind::InvocationException`]
    /// semantics on the invoker's side when built with [`ProtocolError::new`] and
    /// `in_application(true)`), cache it, and acknowledge the original request.
    ///
    /// # Errors
    /// Returns `MqttError` if the publish fails.
    pub async fn complete_error(self, error: ProtocolError) -> Result<(), ProtocolError> {
        let props = encode_error(&error);
        self.respond(Vec::new(), None, None, props).await
    }

    async fn respond(
        self,
        payload: Vec<u8>,
        content_type: Option<String>,
        format_indicator: Option<FormatIndicator>,
        mut user_properties: Vec<(String, String)>,
    ) -> Result<(), ProtocolError> {
        if self.received_at.elapsed() > self.deadline {
            // The cache entry is abandoned (not cached) by `cache_guard`'s drop below: the
            // invoker has already given up by now, so there's no response worth replaying for a
            // retried request either.
            let _ = self.ack_tx.send(self.original_publish);
            return Err(ProtocolError::timeout("ExecutionTimeout", self.deadline));
        }

        user_properties.insert(0, (up::PROTOCOL_VERSION.to_string(), COMMAND_PROTOCOL_VERSION.to_string()));

        let cached = Arc::new(CachedResponse {
            payload: payload.clone(),
            content_type: content_type.clone(),
            format_indicator,
            user_properties: user_properties.clone(),
            correlation_data: self.correlation_data.clone(),
        });

        let properties = PublishProperties {
            payload_format_indicator: format_indicator.map(|f| f as u8),
            content_type,
            correlation_data: self.correlation_data.clone().map(Bytes::from),
            user_properties,
            ..Default::default()
        };

        let result = self
            .mqtt_client
            .publish_with_properties(self.response_topic.clone(), QoS::AtLeastOnce, false, payload, properties)
            .await;

        let (cache, cache_key) = self.cache_guard.disarm();
        cache.complete(cache_key, cached, self.cache_ttl, self.resolve_tx);
        let _ = self.ack_tx.send(self.original_publish);

        match result {
            Ok(token) => token
                .wait()
                .await
                .map_err(|e| ProtocolError::new(ProtocolErrorKind::MqttError, e.to_string())),
            Err(e) => Err(ProtocolError::new(ProtocolErrorKind::MqttError, e.to_string())),
        }
    }
}

/// The server side of command RPC.
pub struct Executor<TReq, TResp, C>
where
    TReq: PayloadSerialize + Send + Sync + 'static,
    TResp: PayloadSerialize + Send + Sync + 'static,
    C: ManagedClient + Clone + Send + Sync + 'static,
{
    topic_filter: String,
    request_topic_pattern: TopicPattern,
    mqtt_client: C,
    publish_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Publish>>,
    ack_tx: mpsc::UnboundedSender<Publish>,
    cache: Cache,
    cache_ttl: Duration,
    execution_timeout: Duration,
    supported_major_versions: Vec<u16>,
    shutdown_token: CancellationToken,
    _payloads: PhantomData<fn() -> (TReq, TResp)>,
}

impl<TReq, TResp, C> Executor<TReq, TResp, C>
where
    TReq: PayloadSerialize + Send + Sync + 'static,
    TResp: PayloadSerialize + Send + Sync + 'static,
    C: ManagedClient + Clone + Send + Sync + 'static,
    C::PubReceiver: Send + 'static,
{
    /// Validate `options` and register (but do not yet subscribe to) the request filter. Call
    /// [`start`](crate::application::Listener::start) to begin receiving requests.
    ///
    /// # Errors
    /// Returns `ConfigurationInvalid` if the topic pattern is malformed.
    pub fn new(
        _application_context: ApplicationContext,
        mqtt_client: C,
        options: ExecutorOptions,
    ) -> Result<Self, ProtocolError> {
        let client_id = mqtt_client.client_id().to_string();
        let mut tokens = options.custom_topic_token_map.clone();
        tokens.insert("executorId".to_string(), client_id);
        tokens.insert("commandName".to_string(), options.command_name.clone());

        let request_topic_pattern = TopicPattern::new(
            &options.request_topic_pattern,
            options.topic_namespace.as_deref(),
            &tokens,
        )?;
        let bare_filter = request_topic_pattern.as_subscribe_topic();
        let topic_filter = match &options.shared_subscription_group {
            Some(group) => format!("$share/{group}/{bare_filter}"),
            None => bare_filter,
        };

        let mut receiver = mqtt_client
            .create_filtered_pub_receiver(&topic_filter, false)
            .map_err(|e| {
                ProtocolError::new(ProtocolErrorKind::MqttError, format!("invalid request filter: {e}"))
            })?;

        let (publish_tx, publish_rx) = mpsc::unbounded_channel();
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel::<Publish>();
        let shutdown_token = CancellationToken::new();
        let pump_shutdown = shutdown_token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = pump_shutdown.cancelled() => break,
                    ack = ack_rx.recv() => {
                        let Some(publish) = ack else { break };
                        if let Err(e) = receiver.ack(&publish).await {
                            log::warn!("failed to ack request publish: {e}");
                        }
                    }
                    publish = receiver.recv() => {
                        match publish {
                            Some(p) => { let _ = publish_tx.send(p); }
                            None => break,
                        }
                    }
                }
            }
        });

        Ok(Self {
            topic_filter,
            request_topic_pattern,
            mqtt_client,
            publish_rx: tokio::sync::Mutex::new(publish_rx),
            ack_tx,
            cache: Cache::default(),
            cache_ttl: options.idempotency_cache_ttl,
            execution_timeout: options.execution_timeout,
            supported_major_versions: options.supported_major_versions,
            shutdown_token,
            _payloads: PhantomData,
        })
    }

    /// Receive the next new request, deduplicating retries and answering version-incompatible or
    /// malformed requests internally without surfacing them.
    ///
    /// Returns `None` once the executor has been stopped and no further requests will arrive.
    pub async fn recv(&self) -> Option<Request<TReq, TResp, C>> {
        loop {
            let publish = {
                let mut guard = self.publish_rx.lock().await;
                guard.recv().await
            }?;
            if let Some(request) = self.handle_publish(publish).await {
                return Some(request);
            }
        }
    }

    async fn handle_publish(&self, publish: Publish) -> Option<Request<TReq, TResp, C>> {
        let props = publish.properties.clone().unwrap_or_default();
        let request_topic = String::from_utf8_lossy(&publish.topic).into_owned();
        let Some(response_topic) = props.response_topic.clone() else {
            log::warn!("request on '{request_topic}' has no response-topic, dropping");
            let _ = self.ack_tx.send(publish);
            return None;
        };
        let correlation_data = props.correlation_data.as_ref().map(|b| b.to_vec());

        let version_ok = props
            .user_properties
            .iter()
            .find(|(k, _)| k == up::PROTOCOL_VERSION)
            .map(|(_, v)| v.parse::<ProtocolVersion>())
            .map_or(true, |parsed| {
                parsed.is_ok_and(|v| self.supported_major_versions.contains(&v.major))
            });
        if !version_ok {
            let requested = props
                .user_properties
                .iter()
                .find(|(k, _)| k == up::PROTOCOL_VERSION)
                .map(|(_, v)| v.clone())
                .unwrap_or_default();
            let error = ProtocolError::new(
                ProtocolErrorKind::UnsupportedRequestVersion {
                    protocol_version: requested,
                    supported_major_versions: self.supported_major_versions.clone(),
                },
                "unsupported protocol version",
            );
            self.respond_without_request(response_topic, correlation_data, &error).await;
            let _ = self.ack_tx.send(publish);
            return None;
        }

        let cache_key = CacheKey {
            correlation_data: correlation_data.clone().unwrap_or_default(),
            request_topic: request_topic.clone(),
        };

        match self.cache.lookup(&cache_key) {
            CacheLookup::Cached(response) => {
                self.replay(response_topic, &response, publish).await;
                None
            }
            CacheLookup::InProgress(mut rx) => {
                let response_topic = response_topic.clone();
                let mqtt_client = self.mqtt_client.clone();
                let ack_tx = self.ack_tx.clone();
                tokio::spawn(async move {
                    if rx.changed().await.is_ok() {
                        if let Some(response) = rx.borrow().clone() {
                            let _ = Self::publish_cached(&mqtt_client, &response_topic, &response).await;
                        }
                    }
                    let _ = ack_tx.send(publish);
                });
                None
            }
            CacheLookup::NotFound => {
                let topic_tokens = self.request_topic_pattern.parse_tokens(&request_topic);
                let custom_user_data = props
                    .user_properties
                    .iter()
                    .filter(|(k, _)| !k.starts_with(up::RESERVED_PREFIX))
                    .cloned()
                    .collect();

                let Ok(payload) = TReq::deserialize(&publish.payload) else {
                    let error = ProtocolError::new(ProtocolErrorKind::PayloadInvalid, "request payload failed to deserialize");
                    self.respond_without_request(response_topic, correlation_data, &error).await;
                    let _ = self.ack_tx.send(publish);
                    return None;
                };

                let message_expiry = props.message_expiry_interval.map(|secs| Duration::from_secs(secs.into()));
                let deadline = match message_expiry {
                    Some(expiry) => self.execution_timeout.min(expiry),
                    None => self.execution_timeout,
                };

                let resolve_tx = self.cache.begin(cache_key.clone());
                Some(Request {
                    payload,
                    topic_tokens,
                    custom_user_data,
                    response_topic,
                    correlation_data,
                    original_publish: publish,
                    mqtt_client: self.mqtt_client.clone(),
                    cache_guard: CacheGuard::new(self.cache.clone(), cache_key),
                    cache_ttl: self.cache_ttl,
                    ack_tx: self.ack_tx.clone(),
                    resolve_tx,
                    received_at: Instant::now(),
                    deadline,
                    _resp: PhantomData,
                })
            }
        }
    }

    async fn replay(&self, response_topic: String, response: &Arc<CachedResponse>, publish: Publish) {
        let _ = Self::publish_cached(&self.mqtt_client, &response_topic, response).await;
        let _ = self.ack_tx.send(publish);
    }

    async fn publish_cached(
        mqtt_client: &C,
        response_topic: &str,
        response: &CachedResponse,
    ) -> Result<(), ProtocolError> {
        let properties = PublishProperties {
            payload_format_indicator: response.format_indicator.map(|f| f as u8),
            content_type: response.content_type.clone(),
            correlation_data: response.correlation_data.clone().map(Bytes::from),
            user_properties: response.user_properties.clone(),
            ..Default::default()
        };
        mqtt_client
            .publish_with_properties(
                response_topic.to_string(),
                QoS::AtLeastOnce,
                false,
                response.payload.clone(),
                properties,
            )
            .await
            .map_err(|e| ProtocolError::new(ProtocolErrorKind::MqttError, e.to_string()))?
            .wait()
            .await
            .map_err(|e| ProtocolError::new(ProtocolErrorKind::MqttError, e.to_string()))
    }

    async fn respond_without_request(
        &self,
        response_topic: String,
        correlation_data: Option<Vec<u8>>,
        error: &ProtocolError,
    ) {
        let mut user_properties = vec![(up::PROTOCOL_VERSION.to_string(), COMMAND_PROTOCOL_VERSION.to_string())];
        user_properties.extend(encode_error(error));
        let response = CachedResponse {
            payload: Vec::new(),
            content_type: None,
            format_indicator: None,
            user_properties,
            correlation_data,
        };
        if let Err(e) = Self::publish_cached(&self.mqtt_client, &response_topic, &response).await {
            log::warn!("failed to publish error response: {e}");
        }
    }
}

#[async_trait]
impl<TReq, TResp, C> Listener for Executor<TReq, TResp, C>
where
    TReq: PayloadSerialize + Send + Sync + 'static,
    TResp: PayloadSerialize + Send + Sync + 'static,
    C: ManagedClient + Clone + Send + Sync + 'static,
    C::PubReceiver: Send + 'static,
{
    fn topic_filter(&self) -> &str {
        &self.topic_filter
    }

    async fn start(&self) -> Result<(), ProtocolError> {
        self.mqtt_client
            .subscribe(self.topic_filter.clone(), QoS::AtLeastOnce)
            .await
            .map_err(|e| ProtocolError::new(ProtocolErrorKind::MqttError, e.to_string()))?
            .wait()
            .await
            .map_err(|e| ProtocolError::new(ProtocolErrorKind::MqttError, e.to_string()))
    }

    async fn stop(&self) -> Result<(), ProtocolError> {
        let result = self
            .mqtt_client
            .unsubscribe(self.topic_filter.clone())
            .await
            .map_err(|e| ProtocolError::new(ProtocolErrorKind::MqttError, e.to_string()))?
            .wait()
            .await
            .map_err(|e| ProtocolError::new(ProtocolErrorKind::MqttError, e.to_string()));
        self.shutdown_token.cancel();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_lookup_on_empty_cache_is_not_found() {
        let cache = Cache::default();
        let key = CacheKey { correlation_data: vec![1], request_topic: "a/b".to_string() };
        assert!(matches!(cache.lookup(&key), CacheLookup::NotFound));
    }

    #[test]
    fn cache_round_trips_a_completed_response() {
        let cache = Cache::default();
        let key = CacheKey { correlation_data: vec![1], request_topic: "a/b".to_string() };
        let tx = cache.begin(key.clone());
        assert!(matches!(cache.lookup(&key), CacheLookup::InProgress(_)));

        let response = Arc::new(CachedResponse {
            payload: vec![9],
            content_type: None,
            format_indicator: None,
            user_properties: vec![],
            correlation_data: Some(vec![1]),
        });
        cache.complete(key.clone(), response, Duration::from_secs(60), tx);
        match cache.lookup(&key) {
            CacheLookup::Cached(r) => assert_eq!(r.payload, vec![9]),
            _ => panic!("expected cached entry"),
        }
    }

    #[test]
    fn cache_expires_entries_past_their_ttl() {
        let cache = Cache::default();
        let key = CacheKey { correlation_data: vec![2], request_topic: "a/b".to_string() };
        let tx = cache.begin(key.clone());
        let response = Arc::new(CachedResponse {
            payload: vec![],
            content_type: None,
            format_indicator: None,
            user_properties: vec![],
            correlation_data: None,
        });
        cache.complete(key.clone(), response, Duration::from_millis(0), tx);
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(cache.lookup(&key), CacheLookup::NotFound));
    }

    #[test]
    fn abandon_removes_an_in_progress_entry() {
        let cache = Cache::default();
        let key = CacheKey { correlation_data: vec![3], request_topic: "a/b".to_string() };
        cache.begin(key.clone());
        cache.abandon(&key);
        assert!(matches!(cache.lookup(&key), CacheLookup::NotFound));
    }

    #[test]
    fn dropped_cache_guard_abandons_its_entry() {
        let cache = Cache::default();
        let key = CacheKey { correlation_data: vec![4], request_topic: "a/b".to_string() };
        cache.begin(key.clone());
        let guard = CacheGuard::new(cache.clone(), key.clone());
        drop(guard);
        assert!(matches!(cache.lookup(&key), CacheLookup::NotFound));
    }

    #[test]
    fn disarmed_cache_guard_does_not_abandon() {
        let cache = Cache::default();
        let key = CacheKey { correlation_data: vec![5], request_topic: "a/b".to_string() };
        let tx = cache.begin(key.clone());
        let guard = CacheGuard::new(cache.clone(), key.clone());
        let (cache, key) = guard.disarm();
        let response = Arc::new(CachedResponse {
            payload: vec![7],
            content_type: None,
            format_indicator: None,
            user_properties: vec![],
            correlation_data: None,
        });
        cache.complete(key.clone(), response, Duration::from_secs(60), tx);
        assert!(matches!(cache.lookup(&key), CacheLookup::Cached(_)));
    }
}
