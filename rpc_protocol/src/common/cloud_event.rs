// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! CloudEvents 1.0 metadata attached to telemetry and RPC messages as MQTT user-properties.
//!
//! See the [CloudEvents spec](https://github.com/cloudevents/spec/blob/main/cloudevents/spec.md).

use std::fmt;
use std::time::SystemTime;

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

/// The only CloudEvents spec version this runtime emits or accepts.
pub const DEFAULT_CLOUD_EVENT_SPEC_VERSION: &str = "1.0";

/// The reserved CloudEvents attribute names, and their string header keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudEventFields {
    /// `id` — unique, together with `source`, for this event.
    Id,
    /// `source` — URI identifying the context the event occurred in.
    Source,
    /// `specversion` — CloudEvents spec version, fixed at `1.0`.
    SpecVersion,
    /// `type` — the kind of event.
    EventType,
    /// `subject` — the subject of the event within its source.
    Subject,
    /// `time` — RFC 3339 occurrence timestamp.
    Time,
    /// `dataschema` — URI of the schema the `data` adheres to.
    DataSchema,
    /// `datacontenttype` — content-type of the `data` payload.
    DataContentType,
}

impl fmt::Display for CloudEventFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloudEventFields::Id => "id",
            CloudEventFields::Source => "source",
            CloudEventFields::SpecVersion => "specversion",
            CloudEventFields::EventType => "type",
            CloudEventFields::Subject => "subject",
            CloudEventFields::Time => "time",
            CloudEventFields::DataSchema => "dataschema",
            CloudEventFields::DataContentType => "datacontenttype",
        };
        write!(f, "{s}")
    }
}

impl CloudEventFields {
    /// Validate `value` for this attribute against CloudEvents spec version `spec_version`.
    ///
    /// # Errors
    /// Returns a description of the violation.
    pub fn validate(&self, value: &str, spec_version: &str) -> Result<(), String> {
        match self {
            CloudEventFields::SpecVersion => {
                if value != DEFAULT_CLOUD_EVENT_SPEC_VERSION {
                    return Err(format!(
                        "unsupported CloudEvents spec version '{value}', only '{DEFAULT_CLOUD_EVENT_SPEC_VERSION}' is supported"
                    ));
                }
            }
            CloudEventFields::Source | CloudEventFields::DataSchema => {
                if fluent_uri::Uri::parse(value).is_err() {
                    return Err(format!("'{self}' must be a valid URI-reference, got '{value}'"));
                }
            }
            CloudEventFields::Id | CloudEventFields::EventType | CloudEventFields::Subject => {
                if value.trim().is_empty() {
                    return Err(format!("'{self}' must not be empty"));
                }
            }
            CloudEventFields::Time | CloudEventFields::DataContentType => {}
        }
        let _ = spec_version;
        Ok(())
    }
}

/// CloudEvents 1.0 metadata for a single message.
#[derive(Builder, Clone, Debug)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct CloudEvent {
    /// Context the event happened in.
    source: String,
    /// CloudEvents spec version.
    #[builder(default = "DEFAULT_CLOUD_EVENT_SPEC_VERSION.to_string()")]
    pub spec_version: String,
    /// Kind of event, producer-defined.
    #[builder(default = "self.custom_default_event_type()")]
    event_type: String,
    /// Schema `data` adheres to.
    #[builder(default = "None")]
    data_schema: Option<String>,
    /// Unique (with `source`) event identifier.
    #[builder(default = "Uuid::new_v4().to_string()")]
    id: String,
    /// Occurrence timestamp.
    #[builder(default = "Some(DateTime::<Utc>::from(SystemTime::now()))")]
    time: Option<DateTime<Utc>>,
    /// The event's subject within `source`.
    #[builder(default = "CloudEventSubject::PublishTopic")]
    subject: CloudEventSubject,
    #[builder(private)]
    _default_event_type: String,
}

/// What to use for a [`CloudEvent`]'s `subject` attribute.
#[derive(Clone, Debug)]
pub enum CloudEventSubject {
    /// Use the publish topic as the subject.
    PublishTopic,
    /// Use a caller-provided subject.
    Custom(String),
    /// Omit the subject entirely.
    None,
}

impl CloudEventBuilder {
    /// Start a builder that falls back to `default_event_type` if `event_type` is never set.
    pub fn new(default_event_type: impl Into<String>) -> Self {
        CloudEventBuilder {
            _default_event_type: Some(default_event_type.into()),
            ..Default::default()
        }
    }

    fn custom_default_event_type(&self) -> String {
        self._default_event_type
            .clone()
            .expect("CloudEventBuilder must be constructed via CloudEventBuilder::new")
    }

    fn validate(&self) -> Result<(), String> {
        let spec_version = self
            .spec_version
            .clone()
            .unwrap_or_else(|| DEFAULT_CLOUD_EVENT_SPEC_VERSION.to_string());
        CloudEventFields::SpecVersion.validate(&spec_version, &spec_version)?;

        if let Some(source) = &self.source {
            CloudEventFields::Source.validate(source, &spec_version)?;
        }
        if let Some(event_type) = &self.event_type {
            CloudEventFields::EventType.validate(event_type, &spec_version)?;
        }
        if let Some(Some(data_schema)) = &self.data_schema {
            CloudEventFields::DataSchema.validate(data_schema, &spec_version)?;
        }
        if let Some(id) = &self.id {
            CloudEventFields::Id.validate(id, &spec_version)?;
        }
        if let Some(CloudEventSubject::Custom(subject)) = &self.subject {
            CloudEventFields::Subject.validate(subject, &spec_version)?;
        }
        Ok(())
    }
}

impl CloudEvent {
    /// Render this event as the MQTT user-properties it contributes to a publish.
    #[must_use]
    pub fn into_headers(self, publish_topic: &str) -> Vec<(String, String)> {
        let mut headers = vec![
            (CloudEventFields::Id.to_string(), self.id),
            (CloudEventFields::Source.to_string(), self.source),
            (CloudEventFields::SpecVersion.to_string(), self.spec_version),
            (CloudEventFields::EventType.to_string(), self.event_type),
        ];
        match self.subject {
            CloudEventSubject::Custom(subject) => {
                headers.push((CloudEventFields::Subject.to_string(), subject));
            }
            CloudEventSubject::PublishTopic => {
                headers.push((CloudEventFields::Subject.to_string(), publish_topic.to_string()));
            }
            CloudEventSubject::None => {}
        }
        if let Some(time) = self.time {
            headers.push((
                CloudEventFields::Time.to_string(),
                time.to_rfc3339_opts(SecondsFormat::Secs, true),
            ));
        }
        if let Some(data_schema) = self.data_schema {
            headers.push((CloudEventFields::DataSchema.to_string(), data_schema));
        }
        headers
    }

    /// Parse a received message's user-properties back into a [`CloudEvent`], if it carried the
    /// required `specversion`/`source`/`type` attributes.
    #[must_use]
    pub fn from_headers(headers: &[(String, String)]) -> Option<Self> {
        let lookup = |name: CloudEventFields| {
            headers
                .iter()
                .find(|(k, _)| k == &name.to_string())
                .map(|(_, v)| v.clone())
        };

        let source = lookup(CloudEventFields::Source)?;
        let spec_version = lookup(CloudEventFields::SpecVersion)?;
        let event_type = lookup(CloudEventFields::EventType)?;

        let mut builder = CloudEventBuilder::new(event_type.clone());
        builder.source(source);
        builder.spec_version(spec_version);
        builder.event_type(event_type);
        if let Some(id) = lookup(CloudEventFields::Id) {
            builder.id(id);
        }
        if let Some(data_schema) = lookup(CloudEventFields::DataSchema) {
            builder.data_schema(Some(data_schema));
        }
        if let Some(time) = lookup(CloudEventFields::Time) {
            if let Ok(time) = DateTime::parse_from_rfc3339(&time) {
                builder.time(Some(time.with_timezone(&Utc)));
            }
        }
        if let Some(subject) = lookup(CloudEventFields::Subject) {
            builder.subject(CloudEventSubject::Custom(subject));
        }
        builder.build().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_headers() {
        let event = CloudEventBuilder::new("ms.aio.telemetry")
            .source("aio://client-1")
            .build()
            .unwrap();
        let headers = event.into_headers("svc/client-1/telemetry");
        let parsed = CloudEvent::from_headers(&headers).unwrap();
        assert_eq!(parsed.source, "aio://client-1");
        assert_eq!(parsed.event_type, "ms.aio.telemetry");
    }

    #[test]
    fn rejects_unsupported_spec_version() {
        let err = CloudEventBuilder::new("ms.aio.telemetry")
            .source("aio://client-1")
            .spec_version("0.3")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("unsupported"));
    }

    #[test]
    fn rejects_invalid_source_uri() {
        let err = CloudEventBuilder::new("ms.aio.telemetry")
            .source("not a uri")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("source"));
    }

    #[test]
    fn missing_required_headers_yields_no_event() {
        assert!(CloudEvent::from_headers(&[]).is_none());
    }
}
