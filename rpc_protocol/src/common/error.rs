// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The closed error taxonomy shared by every component, and its bidirectional mapping to the
//! reserved MQTT user-properties carried on response publishes.

use std::fmt;
use std::time::Duration;

use crate::common::user_properties as up;

/// A value associated with an [`ProtocolErrorKind`]'s offending property, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// A string value.
    String(String),
    /// An integer value.
    Integer(i64),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{s}"),
            Value::Integer(i) => write!(f, "{i}"),
        }
    }
}

/// A protocol major.minor version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    /// Major version. Incompatible major versions reject the request.
    pub major: u16,
    /// Minor version.
    pub minor: u16,
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Error parsing a `"M.m"` protocol version string.
#[derive(Debug, thiserror::Error)]
#[error("malformed protocol version {0:?}")]
pub struct ProtocolVersionParseError(String);

impl std::str::FromStr for ProtocolVersion {
    type Err = ProtocolVersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s
            .split_once('.')
            .ok_or_else(|| ProtocolVersionParseError(s.to_string()))?;
        let major = major
            .parse()
            .map_err(|_| ProtocolVersionParseError(s.to_string()))?;
        let minor = minor
            .parse()
            .map_err(|_| ProtocolVersionParseError(s.to_string()))?;
        Ok(ProtocolVersion { major, minor })
    }
}

/// An error produced by or decoded from this runtime's components.
///
/// Every fallible public entry point returns this type. Callers should match on [`kind`](Self::kind)
/// to decide retry policy rather than inspecting the display text.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ProtocolError {
    message: String,
    kind: ProtocolErrorKind,
    /// Set when this error was decoded from a peer's response rather than detected locally.
    is_remote: bool,
    /// Set when the error originated in application handler code rather than the runtime itself.
    in_application: bool,
}

impl ProtocolError {
    /// Construct a new, locally-detected error.
    #[must_use]
    pub fn new(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
            is_remote: false,
            in_application: false,
        }
    }

    /// Mark the error as application-level (handler-raised).
    #[must_use]
    pub fn in_application(mut self, in_application: bool) -> Self {
        self.in_application = in_application;
        self
    }

    #[must_use]
    pub fn kind(&self) -> &ProtocolErrorKind {
        &self.kind
    }

    #[must_use]
    pub fn is_remote(&self) -> bool {
        self.is_remote
    }

    #[must_use]
    pub fn is_application_error(&self) -> bool {
        self.in_application
    }

    /// Convenience constructor for [`ProtocolErrorKind::ConfigurationInvalid`].
    #[must_use]
    pub fn configuration_invalid(
        property_name: impl Into<String>,
        property_value: Value,
        message: impl Into<String>,
    ) -> Self {
        let property_name = property_name.into();
        Self::new(
            ProtocolErrorKind::ConfigurationInvalid {
                property_name: property_name.clone(),
                property_value,
            },
            message,
        )
    }

    /// Convenience constructor for [`ProtocolErrorKind::ArgumentInvalid`].
    #[must_use]
    pub fn argument_invalid(
        property_name: impl Into<String>,
        property_value: Value,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            ProtocolErrorKind::ArgumentInvalid {
                property_name: property_name.into(),
                property_value,
            },
            message,
        )
    }

    /// Convenience constructor for [`ProtocolErrorKind::Timeout`].
    #[must_use]
    pub fn timeout(timeout_name: impl Into<String>, timeout_value: Duration) -> Self {
        let timeout_name = timeout_name.into();
        Self::new(
            ProtocolErrorKind::Timeout {
                timeout_name: timeout_name.clone(),
                timeout_value,
            },
            format!("{timeout_name} timed out after {timeout_value:?}"),
        )
    }
}

/// The closed set of error categories this runtime can produce.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolErrorKind {
    /// A required MQTT header/property was absent.
    HeaderMissing { header_name: String },
    /// A header/property was present but malformed.
    HeaderInvalid {
        header_name: String,
        header_value: String,
    },
    /// The payload could not be deserialized by the registered encoding.
    PayloadInvalid,
    /// An operation did not complete within its deadline.
    Timeout {
        timeout_name: String,
        timeout_value: Duration,
    },
    /// A caller-supplied argument was invalid.
    ArgumentInvalid {
        property_name: String,
        property_value: Value,
    },
    /// The component was not in a state that permitted the operation.
    StateInvalid,
    /// An invariant internal to the runtime was violated.
    InternalLogicError,
    /// An error that does not fit any other kind.
    UnknownError,
    /// An application-level error value returned by a handler.
    InvocationException,
    /// A handler panicked or failed unexpectedly.
    ExecutionException,
    /// The peer's advertised protocol version is incompatible.
    UnsupportedRequestVersion {
        protocol_version: String,
        supported_major_versions: Vec<u16>,
    },
    /// The underlying MQTT client reported an error.
    MqttError,
    /// The operation was cancelled by the caller.
    Cancellation,
    /// A component was misconfigured at construction time.
    ConfigurationInvalid {
        property_name: String,
        property_value: Value,
    },
}

impl ProtocolErrorKind {
    /// The HTTP-like status code this kind is encoded as on the wire.
    ///
    /// `ConfigurationInvalid` and `Cancellation` are detected before a publish is ever built and
    /// never legitimately cross the wire; they fall back to 500 if an encoder is forced to.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            ProtocolErrorKind::HeaderMissing { .. } | ProtocolErrorKind::HeaderInvalid { .. } => {
                400
            }
            ProtocolErrorKind::ArgumentInvalid { .. } => 400,
            ProtocolErrorKind::PayloadInvalid => 415,
            ProtocolErrorKind::Timeout { .. } => 408,
            ProtocolErrorKind::InvocationException => 422,
            ProtocolErrorKind::StateInvalid
            | ProtocolErrorKind::InternalLogicError
            | ProtocolErrorKind::UnknownError
            | ProtocolErrorKind::ExecutionException
            | ProtocolErrorKind::ConfigurationInvalid { .. } => 500,
            ProtocolErrorKind::MqttError | ProtocolErrorKind::Cancellation => 503,
            ProtocolErrorKind::UnsupportedRequestVersion { .. } => 505,
        }
    }
}

impl fmt::Display for ProtocolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolErrorKind::HeaderMissing { header_name } => {
                write!(f, "missing header '{header_name}'")
            }
            ProtocolErrorKind::HeaderInvalid {
                header_name,
                header_value,
            } => write!(f, "invalid header '{header_name}': {header_value}"),
            ProtocolErrorKind::PayloadInvalid => write!(f, "payload could not be deserialized"),
            ProtocolErrorKind::Timeout {
                timeout_name,
                timeout_value,
            } => write!(f, "{timeout_name} timed out after {timeout_value:?}"),
            ProtocolErrorKind::ArgumentInvalid {
                property_name,
                property_value,
            } => write!(f, "invalid argument '{property_name}': {property_value}"),
            ProtocolErrorKind::StateInvalid => write!(f, "invalid state for this operation"),
            ProtocolErrorKind::InternalLogicError => write!(f, "internal logic error"),
            ProtocolErrorKind::UnknownError => write!(f, "unknown error"),
            ProtocolErrorKind::InvocationException => write!(f, "handler returned an error"),
            ProtocolErrorKind::ExecutionException => write!(f, "handler execution failed"),
            ProtocolErrorKind::UnsupportedRequestVersion {
                protocol_version,
                supported_major_versions,
            } => write!(
                f,
                "protocol version {protocol_version} is unsupported, supported majors: {supported_major_versions:?}"
            ),
            ProtocolErrorKind::MqttError => write!(f, "MQTT operation failed"),
            ProtocolErrorKind::Cancellation => write!(f, "operation was cancelled"),
            ProtocolErrorKind::ConfigurationInvalid {
                property_name,
                property_value,
            } => write!(f, "invalid configuration '{property_name}': {property_value}"),
        }
    }
}

/// Encode an error as the reserved user-properties carried on a response publish.
#[must_use]
pub fn encode_error(err: &ProtocolError) -> Vec<(String, String)> {
    let mut props = vec![
        (up::STATUS.to_string(), err.kind.status_code().to_string()),
        (up::STATUS_MESSAGE.to_string(), err.message.clone()),
    ];
    if err.in_application {
        props.push((up::IS_APPLICATION_ERROR.to_string(), "true".to_string()));
    }
    match &err.kind {
        ProtocolErrorKind::HeaderMissing { header_name }
        | ProtocolErrorKind::HeaderInvalid { header_name, .. } => {
            props.push((up::INVALID_PROPERTY_NAME.to_string(), header_name.clone()));
        }
        ProtocolErrorKind::ArgumentInvalid {
            property_name,
            property_value,
        }
        | ProtocolErrorKind::ConfigurationInvalid {
            property_name,
            property_value,
        } => {
            props.push((up::INVALID_PROPERTY_NAME.to_string(), property_name.clone()));
            props.push((
                up::INVALID_PROPERTY_VALUE.to_string(),
                property_value.to_string(),
            ));
        }
        ProtocolErrorKind::Timeout {
            timeout_name,
            timeout_value,
        } => {
            props.push((up::INVALID_PROPERTY_NAME.to_string(), timeout_name.clone()));
            props.push((
                up::INVALID_PROPERTY_VALUE.to_string(),
                format!("{}", timeout_value.as_secs_f64()),
            ));
        }
        ProtocolErrorKind::UnsupportedRequestVersion {
            protocol_version,
            supported_major_versions,
        } => {
            props.push((up::PROTOCOL_VERSION.to_string(), protocol_version.clone()));
            props.push((
                up::SUPPORTED_MAJOR_VERSIONS.to_string(),
                supported_major_versions
                    .iter()
                    .map(u16::to_string)
                    .collect::<Vec<_>>()
                    .join("."),
            ));
        }
        _ => {}
    }
    props
}

/// Decode an error from the user-properties of a received response publish.
///
/// # Errors
/// Returns `None` if `status` is absent or not a recognized status code, which means the publish
/// was not actually an error response.
#[must_use]
pub fn decode_error(props: &[(String, String)]) -> Option<ProtocolError> {
    let lookup = |name: &str| props.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone());

    let status: u16 = lookup(up::STATUS)?.parse().ok()?;
    let message = lookup(up::STATUS_MESSAGE).unwrap_or_default();
    let is_application_error = lookup(up::IS_APPLICATION_ERROR).as_deref() == Some("true");
    let property_name = lookup(up::INVALID_PROPERTY_NAME);
    let property_value = lookup(up::INVALID_PROPERTY_VALUE);

    let kind = match status {
        400 => {
            let name = property_name.unwrap_or_default();
            match property_value {
                Some(value) => ProtocolErrorKind::HeaderInvalid {
                    header_name: name,
                    header_value: value,
                },
                None => ProtocolErrorKind::HeaderMissing { header_name: name },
            }
        }
        408 => ProtocolErrorKind::Timeout {
            timeout_name: property_name.unwrap_or_default(),
            timeout_value: property_value
                .and_then(|v| v.parse::<f64>().ok())
                .map(Duration::from_secs_f64)
                .unwrap_or_default(),
        },
        415 => ProtocolErrorKind::PayloadInvalid,
        422 => ProtocolErrorKind::InvocationException,
        503 => ProtocolErrorKind::MqttError,
        505 => ProtocolErrorKind::UnsupportedRequestVersion {
            protocol_version: lookup(up::PROTOCOL_VERSION).unwrap_or_default(),
            supported_major_versions: lookup(up::SUPPORTED_MAJOR_VERSIONS)
                .map(|v| v.split('.').filter_map(|p| p.parse().ok()).collect())
                .unwrap_or_default(),
        },
        500 if is_application_error => ProtocolErrorKind::ExecutionException,
        500 => ProtocolErrorKind::InternalLogicError,
        _ => ProtocolErrorKind::UnknownError,
    };

    Some(ProtocolError {
        message,
        kind,
        is_remote: true,
        in_application: is_application_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(ProtocolErrorKind::HeaderMissing { header_name: "content-type".into() }; "header missing")]
    #[test_case(ProtocolErrorKind::ArgumentInvalid { property_name: "timeout".into(), property_value: Value::String("0".into()) }; "argument invalid")]
    #[test_case(ProtocolErrorKind::Timeout { timeout_name: "InvocationTimeout".into(), timeout_value: Duration::from_secs(5) }; "timeout")]
    #[test_case(ProtocolErrorKind::PayloadInvalid; "payload invalid")]
    #[test_case(ProtocolErrorKind::InvocationException; "invocation exception")]
    #[test_case(ProtocolErrorKind::ExecutionException; "execution exception")]
    #[test_case(ProtocolErrorKind::InternalLogicError; "internal logic error")]
    #[test_case(ProtocolErrorKind::MqttError; "mqtt error")]
    #[test_case(ProtocolErrorKind::UnsupportedRequestVersion { protocol_version: "2.0".into(), supported_major_versions: vec![1] }; "unsupported version")]
    fn error_round_trips_through_user_properties(kind: ProtocolErrorKind) {
        let in_application = matches!(kind, ProtocolErrorKind::ExecutionException);
        let original = ProtocolError::new(kind.clone(), "boom").in_application(in_application);
        let encoded = encode_error(&original);
        let decoded = decode_error(&encoded).expect("status code should always decode");

        assert_eq!(std::mem::discriminant(decoded.kind()), std::mem::discriminant(&kind));
        assert!(decoded.is_remote());
        assert_eq!(decoded.is_application_error(), in_application);
    }

    #[test]
    fn non_error_properties_decode_to_none() {
        let props = vec![("content-type".to_string(), "application/json".to_string())];
        assert!(decode_error(&props).is_none());
    }

    #[test]
    fn version_rejection_is_status_505() {
        let err = ProtocolError::new(
            ProtocolErrorKind::UnsupportedRequestVersion {
                protocol_version: "2.0".to_string(),
                supported_major_versions: vec![1],
            },
            "unsupported",
        );
        assert_eq!(err.kind().status_code(), 505);
    }

    #[test]
    fn protocol_version_parses_major_minor() {
        let v: ProtocolVersion = "1.2".parse().unwrap();
        assert_eq!(v, ProtocolVersion { major: 1, minor: 2 });
        assert_eq!(v.to_string(), "1.2");
    }
}
