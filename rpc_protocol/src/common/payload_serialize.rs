// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The typed encoding seam every sender/receiver, invoker, and executor is generic over.

use std::error::Error;
use std::fmt::Debug;

/// MQTT 5 payload-format indicator.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FormatIndicator {
    /// Unspecified bytes.
    UnspecifiedBytes = 0,
    /// UTF-8 encoded character data (e.g. JSON).
    Utf8EncodedCharacterData = 1,
}

/// Serializes and deserializes a typed payload, and declares the content-type/format-indicator
/// a publisher should set.
///
/// # Examples
/// ```
/// use rpc_protocol::common::payload_serialize::{PayloadSerialize, FormatIndicator};
/// #[derive(Clone, Debug)]
/// pub struct Reading { celsius: f64 }
/// impl PayloadSerialize for Reading {
///   type SerializerError = std::convert::Infallible;
///   fn content_type() -> &'static str { "application/json" }
///   fn format_indicator() -> FormatIndicator { FormatIndicator::Utf8EncodedCharacterData }
///   fn serialize(&self) -> Result<Vec<u8>, Self::SerializerError> {
///     Ok(format!("{{\"celsius\":{}}}", self.celsius).into_bytes())
///   }
///   fn deserialize(_payload: &[u8]) -> Result<Self, Self::SerializerError> {
///     Ok(Reading { celsius: 0.0 })
///   }
/// }
/// ```
pub trait PayloadSerialize: Clone {
    /// Error produced by [`serialize`](Self::serialize)/[`deserialize`](Self::deserialize).
    type SerializerError: Debug + Into<Box<dyn Error + Sync + Send + 'static>>;

    /// The MIME content-type set on publishes carrying this payload.
    fn content_type() -> &'static str;

    /// The MQTT payload-format indicator set on publishes carrying this payload.
    fn format_indicator() -> FormatIndicator;

    /// Serialize `self` to bytes.
    ///
    /// # Errors
    /// Returns [`Self::SerializerError`] if serialization fails.
    fn serialize(&self) -> Result<Vec<u8>, Self::SerializerError>;

    /// Deserialize a value from bytes.
    ///
    /// # Errors
    /// Returns [`Self::SerializerError`] if the bytes are not a valid encoding of `Self`.
    fn deserialize(payload: &[u8]) -> Result<Self, Self::SerializerError>;
}

/// A passthrough encoding for callers that pre-serialize their own payloads.
///
/// `content_type()` is fixed at construction via [`Raw::with_content_type`]'s generic parameter
/// is not possible in a trait impl, so callers needing a specific content-type should implement
/// [`PayloadSerialize`] directly; `Raw` always reports `application/octet-stream`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Raw(pub Vec<u8>);

impl PayloadSerialize for Raw {
    type SerializerError = std::convert::Infallible;

    fn content_type() -> &'static str {
        "application/octet-stream"
    }

    fn format_indicator() -> FormatIndicator {
        FormatIndicator::UnspecifiedBytes
    }

    fn serialize(&self) -> Result<Vec<u8>, Self::SerializerError> {
        Ok(self.0.clone())
    }

    fn deserialize(payload: &[u8]) -> Result<Self, Self::SerializerError> {
        Ok(Raw(payload.to_vec()))
    }
}

#[cfg(test)]
use mockall::mock;
#[cfg(test)]
mock! {
    pub Payload{}
    impl Clone for Payload {
        fn clone(&self) -> Self;
    }
    impl PayloadSerialize for Payload {
        type SerializerError = String;
        fn content_type() -> &'static str;
        fn format_indicator() -> FormatIndicator;
        fn serialize(&self) -> Result<Vec<u8>, String>;
        fn deserialize(payload: &[u8]) -> Result<Self, String>;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_round_trips() {
        let raw = Raw(vec![1, 2, 3]);
        let bytes = raw.serialize().unwrap();
        assert_eq!(Raw::deserialize(&bytes).unwrap(), raw);
    }
}
