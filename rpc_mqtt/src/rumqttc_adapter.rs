// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Adapts `rumqttc`'s v5 client/event-loop pair to this crate's traits, and builds
//! `rumqttc::v5::MqttOptions` from [`MqttConnectionSettings`].

use std::fs::{self, File};
use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::tokio_rustls::rustls::{ClientConfig, RootCertStore};
use rumqttc::Transport;
use thiserror::Error;

use crate::connection_settings::MqttConnectionSettings;
use crate::control_packet::{
    AuthProperties, Publish, PublishProperties, QoS, SubscribeProperties, UnsubscribeProperties,
};
use crate::error::{ClientError, ConnectionError};
use crate::interface::{
    CompletionToken, InternalClient, ManualAck, MqttAck, MqttDisconnect, MqttEventLoop, MqttPubSub,
};
use crate::Event;

/// Concrete client type produced by [`client`].
pub type ClientAlias = rumqttc::v5::AsyncClient;
/// Concrete event loop type produced by [`client`].
pub type EventLoopAlias = rumqttc::v5::EventLoop;

#[async_trait]
impl MqttPubSub for rumqttc::v5::AsyncClient {
    async fn publish(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
        retain: bool,
        payload: impl Into<Bytes> + Send,
    ) -> Result<CompletionToken, ClientError> {
        let notice = rumqttc::v5::AsyncClient::publish(self, topic, qos, retain, payload).await?;
        Ok(CompletionToken::from_notice(notice))
    }

    async fn publish_with_properties(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
        retain: bool,
        payload: impl Into<Bytes> + Send,
        properties: PublishProperties,
    ) -> Result<CompletionToken, ClientError> {
        let notice = rumqttc::v5::AsyncClient::publish_with_properties(
            self, topic, qos, retain, payload, properties,
        )
        .await?;
        Ok(CompletionToken::from_notice(notice))
    }

    async fn subscribe(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
    ) -> Result<CompletionToken, ClientError> {
        let notice = rumqttc::v5::AsyncClient::subscribe(self, topic, qos).await?;
        Ok(CompletionToken::from_notice(notice))
    }

    async fn subscribe_with_properties(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
        properties: SubscribeProperties,
    ) -> Result<CompletionToken, ClientError> {
        let notice =
            rumqttc::v5::AsyncClient::subscribe_with_properties(self, topic, qos, properties)
                .await?;
        Ok(CompletionToken::from_notice(notice))
    }

    async fn unsubscribe(
        &self,
        topic: impl Into<String> + Send,
    ) -> Result<CompletionToken, ClientError> {
        let notice = rumqttc::v5::AsyncClient::unsubscribe(self, topic).await?;
        Ok(CompletionToken::from_notice(notice))
    }

    async fn unsubscribe_with_properties(
        &self,
        topic: impl Into<String> + Send,
        properties: UnsubscribeProperties,
    ) -> Result<CompletionToken, ClientError> {
        let notice =
            rumqttc::v5::AsyncClient::unsubscribe_with_properties(self, topic, properties).await?;
        Ok(CompletionToken::from_notice(notice))
    }
}

#[async_trait]
impl MqttAck for rumqttc::v5::AsyncClient {
    async fn ack(&self, publish: &Publish) -> Result<(), ClientError> {
        rumqttc::v5::AsyncClient::ack(self, publish).await?;
        Ok(())
    }
}

#[async_trait]
impl InternalClient for rumqttc::v5::AsyncClient {
    fn get_manual_ack(&self, publish: &Publish) -> ManualAck {
        rumqttc::v5::AsyncClient::get_manual_ack(self, publish)
    }

    async fn manual_ack(&self, ack: ManualAck) -> Result<(), ClientError> {
        rumqttc::v5::AsyncClient::manual_ack(self, ack).await?;
        Ok(())
    }

    async fn reauth(&self, auth_props: AuthProperties) -> Result<(), ClientError> {
        rumqttc::v5::AsyncClient::reauth(self, Some(auth_props)).await?;
        Ok(())
    }
}

#[async_trait]
impl MqttDisconnect for rumqttc::v5::AsyncClient {
    async fn disconnect(&self) -> Result<(), ClientError> {
        rumqttc::v5::AsyncClient::disconnect(self).await?;
        Ok(())
    }
}

#[async_trait]
impl MqttEventLoop for rumqttc::v5::EventLoop {
    async fn poll(&mut self) -> Result<Event, ConnectionError> {
        rumqttc::v5::EventLoop::poll(self).await
    }

    fn set_clean_start(&mut self, clean_start: bool) {
        self.mqtt_options.set_clean_start(clean_start);
    }
}

/// Build a `rumqttc` v5 client/event-loop pair from connection settings.
///
/// # Errors
/// Returns [`ConnectionSettingsAdapterError`] if the settings cannot be converted into valid
/// `rumqttc` options (e.g. an unreadable TLS certificate file).
pub fn client(
    connection_settings: MqttConnectionSettings,
    channel_capacity: usize,
    manual_ack: bool,
) -> Result<(rumqttc::v5::AsyncClient, rumqttc::v5::EventLoop), ConnectionSettingsAdapterError> {
    let mut mqtt_options: rumqttc::v5::MqttOptions = connection_settings.try_into()?;
    mqtt_options.set_manual_acks(manual_ack);
    Ok(rumqttc::v5::AsyncClient::new(mqtt_options, channel_capacity))
}

/// Error converting [`MqttConnectionSettings`] into `rumqttc` options.
#[derive(Error, Debug)]
pub enum ConnectionSettingsAdapterError {
    #[error("session expiry must be at least 5 seconds, got {0:?}")]
    SessionExpiryTooShort(Duration),
    #[error("cannot read password file {path}: {source}")]
    PasswordFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot read SAT token file {path}: {source}")]
    SatFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("TLS configuration error: {0}")]
    Tls(#[from] TlsError),
}

/// Error building a TLS client configuration from certificate/key files.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct TlsError(String);

impl TryFrom<MqttConnectionSettings> for rumqttc::v5::MqttOptions {
    type Error = ConnectionSettingsAdapterError;

    fn try_from(value: MqttConnectionSettings) -> Result<Self, Self::Error> {
        let mut mqtt_options =
            rumqttc::v5::MqttOptions::new(value.client_id.clone(), value.hostname, value.tcp_port);
        mqtt_options.set_keep_alive(value.keep_alive);

        let session_expiry_secs: u32 = value
            .session_expiry
            .as_secs()
            .try_into()
            .unwrap_or(u32::MAX);
        if session_expiry_secs < 5 {
            return Err(ConnectionSettingsAdapterError::SessionExpiryTooShort(
                value.session_expiry,
            ));
        }
        mqtt_options.set_session_expiry_interval(Some(session_expiry_secs));
        mqtt_options.set_connection_timeout(value.connection_timeout.as_secs());
        mqtt_options.set_clean_start(value.clean_start);

        if let Some(username) = value.username {
            let password = if let Some(password_file) = value.password_file {
                fs::read_to_string(&password_file).map_err(|source| {
                    ConnectionSettingsAdapterError::PasswordFile {
                        path: password_file,
                        source,
                    }
                })?
            } else {
                value.password.unwrap_or_default()
            };
            mqtt_options.set_credentials(username, password);
        }

        if value.use_tls {
            let config = tls_config(value.ca_file, value.cert_file, value.key_file)?;
            mqtt_options.set_transport(Transport::tls_with_config(
                rumqttc::TlsConfiguration::Rustls(Arc::new(config)),
            ));
        }

        if let Some(sat_file) = value.sat_file {
            mqtt_options.set_authentication_method(Some("K8S-SAT".to_string()));
            let sat_token =
                fs::read(&sat_file).map_err(|source| ConnectionSettingsAdapterError::SatFile {
                    path: sat_file,
                    source,
                })?;
            mqtt_options.set_authentication_data(Some(sat_token.into()));
        }

        Ok(mqtt_options)
    }
}

fn tls_config(
    ca_file: Option<String>,
    cert_file: Option<String>,
    key_file: Option<String>,
) -> Result<ClientConfig, TlsError> {
    let mut root_cert_store = RootCertStore::empty();
    if let Some(ca_file) = ca_file {
        let fh = File::open(&ca_file).map_err(|e| TlsError(format!("opening {ca_file}: {e}")))?;
        let certs = rustls_pemfile::certs(&mut BufReader::new(fh))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TlsError(format!("parsing {ca_file}: {e}")))?;
        root_cert_store.add_parsable_certificates(certs);
    } else {
        let native_certs = rustls_native_certs::load_native_certs()
            .map_err(|e| TlsError(format!("loading native certs: {e}")))?;
        for cert in native_certs {
            root_cert_store
                .add(cert)
                .map_err(|e| TlsError(format!("adding native cert: {e}")))?;
        }
    }

    let config_builder =
        rumqttc::tokio_rustls::rustls::ClientConfig::builder().with_root_certificates(root_cert_store);

    let config = match (cert_file, key_file) {
        (Some(cert_file), Some(key_file)) => {
            let fh = File::open(&cert_file).map_err(|e| TlsError(format!("opening {cert_file}: {e}")))?;
            let certs = rustls_pemfile::certs(&mut BufReader::new(fh))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| TlsError(format!("parsing {cert_file}: {e}")))?;
            let key_fh = File::open(&key_file).map_err(|e| TlsError(format!("opening {key_file}: {e}")))?;
            let key = rustls_pemfile::private_key(&mut BufReader::new(key_fh))
                .map_err(|e| TlsError(format!("parsing {key_file}: {e}")))?
                .ok_or_else(|| TlsError(format!("no private key found in {key_file}")))?;
            config_builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| TlsError(format!("building client auth cert: {e}")))?
        }
        _ => config_builder.with_no_client_auth(),
    };

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_settings::MqttConnectionSettingsBuilder;

    #[test]
    fn no_tls_settings_convert_cleanly() {
        let settings = MqttConnectionSettingsBuilder::default()
            .client_id("test-client")
            .hostname("localhost")
            .use_tls(false)
            .build()
            .unwrap();
        let options: Result<rumqttc::v5::MqttOptions, _> = settings.try_into();
        assert!(options.is_ok());
    }

    #[test]
    fn session_expiry_below_five_seconds_is_rejected() {
        let settings = MqttConnectionSettingsBuilder::default()
            .client_id("test-client")
            .hostname("localhost")
            .use_tls(false)
            .session_expiry(Duration::from_secs(1))
            .build()
            .unwrap();
        let options: Result<rumqttc::v5::MqttOptions, _> = settings.try_into();
        assert!(matches!(
            options.unwrap_err(),
            ConnectionSettingsAdapterError::SessionExpiryTooShort(_)
        ));
    }
}
