// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Settings used to establish an MQTT 5.0 connection.

use std::env::VarError;
use std::time::Duration;

use derive_builder::Builder;

/// Settings used to establish a connection with an MQTT broker.
///
/// Construct via [`MqttConnectionSettingsBuilder`], or load every field from the environment
/// with [`MqttConnectionSettings::from_env`].
#[derive(Builder, Clone, Debug, PartialEq, Eq)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct MqttConnectionSettings {
    /// Client identifier to present in the CONNECT packet.
    #[builder(default = "String::new()")]
    pub client_id: String,
    /// Hostname or IP address of the MQTT broker.
    pub hostname: String,
    /// TCP port of the MQTT broker.
    #[builder(default = "8883")]
    pub tcp_port: u16,
    /// Maximum period between control packets, in seconds.
    #[builder(default = "Duration::from_secs(60)")]
    pub keep_alive: Duration,
    /// Maximum number of QoS 1 publishes that may be unacknowledged at once.
    #[builder(default = "u16::MAX")]
    pub receive_max: u16,
    /// Maximum incoming packet size this client will accept, in bytes. `None` means no limit.
    #[builder(default = "None")]
    pub receive_packet_size_max: Option<u32>,
    /// Requested MQTT session expiry interval, in seconds.
    #[builder(default = "Duration::from_secs(3600)")]
    pub session_expiry: Duration,
    /// Timeout for establishing the initial TCP + MQTT connection.
    #[builder(default = "Duration::from_secs(30)")]
    pub connection_timeout: Duration,
    /// Start a clean MQTT session on connect, discarding any prior session state.
    #[builder(default = "true")]
    pub clean_start: bool,
    /// Username for username/password authentication.
    #[builder(default = "None")]
    pub username: Option<String>,
    /// Password for username/password authentication, provided inline.
    #[builder(default = "None")]
    pub password: Option<String>,
    /// Path to a file containing the password for username/password authentication.
    #[builder(default = "None")]
    pub password_file: Option<String>,
    /// Whether to use TLS for the connection.
    #[builder(default = "true")]
    pub use_tls: bool,
    /// Path to a PEM-encoded CA certificate bundle used to validate the broker's certificate.
    #[builder(default = "None")]
    pub ca_file: Option<String>,
    /// Path to a PEM-encoded client certificate, for mutual TLS.
    #[builder(default = "None")]
    pub cert_file: Option<String>,
    /// Path to the PEM-encoded private key matching `cert_file`.
    #[builder(default = "None")]
    pub key_file: Option<String>,
    /// Path to a file containing the password protecting `key_file`, if any.
    #[builder(default = "None")]
    pub key_password_file: Option<String>,
    /// Path to a mounted Kubernetes service-account token, for `K8S-SAT` enhanced authentication.
    #[builder(default = "None")]
    pub sat_file: Option<String>,
    /// How long before the SAT token's expiry to proactively reauthenticate.
    #[builder(default = "Duration::from_secs(60)")]
    pub sat_reauth_margin: Duration,
}

impl MqttConnectionSettingsBuilder {
    fn validate(&self) -> Result<(), String> {
        let hostname = self.hostname.as_deref().unwrap_or_default();
        if hostname.is_empty() {
            return Err("hostname must not be empty".to_string());
        }

        let clean_start = self.clean_start.unwrap_or(true);
        let client_id = self.client_id.as_deref().unwrap_or_default();
        if !clean_start && client_id.is_empty() {
            return Err("client_id is required when clean_start is false".to_string());
        }

        let password_set = self.password.as_ref().is_some_and(Option::is_some);
        let password_file_set = self.password_file.as_ref().is_some_and(Option::is_some);
        let sat_file_set = self.sat_file.as_ref().is_some_and(Option::is_some);
        if password_set && password_file_set {
            return Err("password and password_file are mutually exclusive".to_string());
        }
        if sat_file_set && (password_set || password_file_set) {
            return Err("sat_file is mutually exclusive with password/password_file".to_string());
        }

        let cert_set = self.cert_file.as_ref().is_some_and(Option::is_some);
        let key_set = self.key_file.as_ref().is_some_and(Option::is_some);
        if cert_set != key_set {
            return Err("cert_file and key_file must be set together".to_string());
        }

        Ok(())
    }
}

/// Error loading [`MqttConnectionSettings`] from environment variables.
#[derive(Debug, thiserror::Error)]
pub enum FromEnvError {
    #[error("environment variable {0} is not valid unicode")]
    NotUnicode(String),
    #[error("invalid value for environment variable {name}: {source}")]
    InvalidValue {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error(transparent)]
    Builder(#[from] MqttConnectionSettingsBuilderError),
}

fn env_string(name: &str) -> Result<Option<String>, FromEnvError> {
    match std::env::var(name) {
        Ok(v) => Ok(Some(v)),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(FromEnvError::NotUnicode(name.to_string())),
    }
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Result<Option<T>, FromEnvError>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_string(name)? {
        None => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|e| FromEnvError::InvalidValue {
                name: name.to_string(),
                source: Box::new(e),
            }),
    }
}

impl MqttConnectionSettings {
    /// Load connection settings from `MQTT_`-prefixed environment variables.
    ///
    /// # Errors
    /// Returns [`FromEnvError`] if a variable is present but malformed, or if the resulting
    /// settings fail validation (see [`MqttConnectionSettingsBuilder`]).
    pub fn from_env() -> Result<Self, FromEnvError> {
        let mut builder = MqttConnectionSettingsBuilder::default();

        if let Some(v) = env_string("MQTT_CLIENT_ID")? {
            builder.client_id(v);
        }
        if let Some(v) = env_string("MQTT_HOST_NAME")? {
            builder.hostname(v);
        }
        if let Some(v) = env_parsed::<u16>("MQTT_TCP_PORT")? {
            builder.tcp_port(v);
        }
        if let Some(v) = env_parsed::<u64>("MQTT_KEEP_ALIVE")? {
            builder.keep_alive(Duration::from_secs(v));
        }
        if let Some(v) = env_parsed::<u64>("MQTT_SESSION_EXPIRY")? {
            builder.session_expiry(Duration::from_secs(v));
        }
        if let Some(v) = env_parsed::<u64>("MQTT_CONNECTION_TIMEOUT")? {
            builder.connection_timeout(Duration::from_secs(v));
        }
        if let Some(v) = env_parsed::<bool>("MQTT_CLEAN_START")? {
            builder.clean_start(v);
        }
        if let Some(v) = env_parsed::<bool>("MQTT_USE_TLS")? {
            builder.use_tls(v);
        }
        if let Some(v) = env_string("MQTT_USERNAME")? {
            builder.username(Some(v));
        }
        if let Some(v) = env_string("MQTT_PASSWORD")? {
            builder.password(Some(v));
        }
        if let Some(v) = env_string("MQTT_PASSWORD_FILE")? {
            builder.password_file(Some(v));
        }
        if let Some(v) = env_string("MQTT_CA_FILE")? {
            builder.ca_file(Some(v));
        }
        if let Some(v) = env_string("MQTT_CERT_FILE")? {
            builder.cert_file(Some(v));
        }
        if let Some(v) = env_string("MQTT_KEY_FILE")? {
            builder.key_file(Some(v));
        }
        if let Some(v) = env_string("MQTT_KEY_PASSWORD_FILE")? {
            builder.key_password_file(Some(v));
        }
        if let Some(v) = env_string("MQTT_SAT_FILE")? {
            builder.sat_file(Some(v));
        }
        if let Some(v) = env_parsed::<u64>("MQTT_SAT_REAUTH_MARGIN")? {
            builder.sat_reauth_margin(Duration::from_secs(v));
        }

        Ok(builder.build()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> MqttConnectionSettingsBuilder {
        let mut b = MqttConnectionSettingsBuilder::default();
        b.hostname("localhost");
        b
    }

    #[test]
    fn hostname_is_required() {
        let err = MqttConnectionSettingsBuilder::default().build().unwrap_err();
        assert!(err.to_string().contains("hostname"));
    }

    #[test]
    fn client_id_required_unless_clean_start() {
        let mut b = minimal();
        b.clean_start(false);
        assert!(b.build().is_err());
        b.client_id("c1");
        assert!(b.build().is_ok());
    }

    #[test]
    fn password_and_password_file_are_exclusive() {
        let mut b = minimal();
        b.password(Some("p".to_string()));
        b.password_file(Some("/p".to_string()));
        assert!(b.build().is_err());
    }

    #[test]
    fn sat_file_excludes_password() {
        let mut b = minimal();
        b.password(Some("p".to_string()));
        b.sat_file(Some("/sat".to_string()));
        assert!(b.build().is_err());
    }

    #[test]
    fn cert_and_key_must_pair() {
        let mut b = minimal();
        b.cert_file(Some("/cert".to_string()));
        assert!(b.build().is_err());
        b.key_file(Some("/key".to_string()));
        assert!(b.build().is_ok());
    }

    #[test]
    fn defaults_match_spec() {
        let settings = minimal().build().unwrap();
        assert_eq!(settings.tcp_port, 8883);
        assert!(settings.use_tls);
        assert!(settings.clean_start);
        assert_eq!(settings.keep_alive, Duration::from_secs(60));
        assert_eq!(settings.session_expiry, Duration::from_secs(3600));
        assert_eq!(settings.connection_timeout, Duration::from_secs(30));
        assert_eq!(settings.sat_reauth_margin, Duration::from_secs(60));
    }

    #[test]
    fn from_env_reads_mqtt_prefixed_vars() {
        temp_env::with_vars(
            [
                ("MQTT_HOST_NAME", Some("broker.example.com")),
                ("MQTT_TCP_PORT", Some("1883")),
                ("MQTT_USE_TLS", Some("false")),
                ("MQTT_CLIENT_ID", Some("my-client")),
            ],
            || {
                let settings = MqttConnectionSettings::from_env().unwrap();
                assert_eq!(settings.hostname, "broker.example.com");
                assert_eq!(settings.tcp_port, 1883);
                assert!(!settings.use_tls);
                assert_eq!(settings.client_id, "my-client");
            },
        );
    }
}
