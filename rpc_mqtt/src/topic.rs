// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! MQTT topic name and topic filter parsing/matching.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Error parsing an MQTT topic name or topic filter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopicParseError {
    #[error("topic must not be empty")]
    Empty,
    #[error("topic exceeds the maximum MQTT topic length of 65535 bytes")]
    TooLong,
    #[error("topic must not contain a null character")]
    ContainsNull,
    #[error("topic name must not contain wildcard characters '+' or '#'")]
    NameContainsWildcard,
    #[error("'#' is only valid as the final level of a filter")]
    MultiWildcardNotFinal,
    #[error("'+' must occupy an entire topic level")]
    SingleWildcardNotAlone,
    #[error("shared subscription must have the form '$share/<group>/<filter>'")]
    InvalidSharedSubscription,
}

fn validate_common(s: &str) -> Result<(), TopicParseError> {
    if s.is_empty() {
        return Err(TopicParseError::Empty);
    }
    if s.len() > 65535 {
        return Err(TopicParseError::TooLong);
    }
    if s.contains('\0') {
        return Err(TopicParseError::ContainsNull);
    }
    Ok(())
}

/// A concrete MQTT topic name, as used on an outgoing PUBLISH. Contains no wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicName(String);

impl TopicName {
    /// Return the topic name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for TopicName {
    type Err = TopicParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validate_common(s)?;
        if s.split('/').any(|level| level.contains('+') || level.contains('#')) {
            return Err(TopicParseError::NameContainsWildcard);
        }
        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An MQTT topic filter, which may contain `+` and `#` wildcards and an optional
/// `$share/<group>/` shared-subscription prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicFilter {
    raw: String,
    /// The filter with any `$share/<group>/` prefix stripped, used for matching.
    match_filter: String,
}

impl TopicFilter {
    /// Return the filter exactly as it should be sent on the wire in a SUBSCRIBE packet.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Return whether a concrete topic name matches this filter.
    #[must_use]
    pub fn matches_topic_name(&self, topic_name: &str) -> bool {
        let filter_levels: Vec<&str> = self.match_filter.split('/').collect();
        let topic_levels: Vec<&str> = topic_name.split('/').collect();

        // Topics starting with '$' (e.g. "$share", broker-internal topics) are never matched by
        // a leading wildcard level, per the MQTT 5 spec.
        if topic_name.starts_with('$') && !self.match_filter.starts_with('$') {
            return false;
        }

        let mut fi = filter_levels.iter();
        let mut ti = topic_levels.iter();
        loop {
            match (fi.next(), ti.next()) {
                (Some(&"#"), _) => return true,
                (Some(&"+"), Some(_)) => {}
                (Some(f), Some(t)) => {
                    if f != t {
                        return false;
                    }
                }
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

impl FromStr for TopicFilter {
    type Err = TopicParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validate_common(s)?;

        let match_filter = if let Some(rest) = s.strip_prefix("$share/") {
            let mut parts = rest.splitn(2, '/');
            let group = parts.next().unwrap_or_default();
            let filter = parts.next().ok_or(TopicParseError::InvalidSharedSubscription)?;
            if group.is_empty() || group.contains(['+', '#', '/']) {
                return Err(TopicParseError::InvalidSharedSubscription);
            }
            filter.to_string()
        } else {
            s.to_string()
        };

        let levels: Vec<&str> = match_filter.split('/').collect();
        for (i, level) in levels.iter().enumerate() {
            if level.contains('#') && *level != "#" {
                return Err(TopicParseError::MultiWildcardNotFinal);
            }
            if *level == "#" && i != levels.len() - 1 {
                return Err(TopicParseError::MultiWildcardNotFinal);
            }
            if level.contains('+') && *level != "+" {
                return Err(TopicParseError::SingleWildcardNotAlone);
            }
        }

        Ok(Self {
            raw: s.to_string(),
            match_filter,
        })
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("a/b/c", true; "plain")]
    #[test_case("a/+/c", true; "single wildcard")]
    #[test_case("a/#", true; "multi wildcard")]
    #[test_case("", false; "empty")]
    #[test_case("a/b+/c", false; "wildcard not alone")]
    #[test_case("a/#/c", false; "multi wildcard not final")]
    fn filter_parses(input: &str, should_parse: bool) {
        assert_eq!(TopicFilter::from_str(input).is_ok(), should_parse);
    }

    #[test_case("a/b/c", "a/b/c", true)]
    #[test_case("a/+/c", "a/b/c", true)]
    #[test_case("a/+/c", "a/b/c/d", false)]
    #[test_case("a/#", "a/b/c", true)]
    #[test_case("a/#", "a", true)]
    #[test_case("+/b", "$share/b", false; "leading wildcard excludes dollar topics")]
    fn filter_matching(filter: &str, topic: &str, expected: bool) {
        let f = TopicFilter::from_str(filter).unwrap();
        assert_eq!(f.matches_topic_name(topic), expected);
    }

    #[test]
    fn shared_subscription_matches_inner_filter() {
        let f = TopicFilter::from_str("$share/group1/a/+/c").unwrap();
        assert!(f.matches_topic_name("a/b/c"));
        assert_eq!(f.as_str(), "$share/group1/a/+/c");
    }

    #[test]
    fn shared_subscription_requires_group_and_filter() {
        assert!(TopicFilter::from_str("$share/").is_err());
        assert!(TopicFilter::from_str("$share/group").is_err());
    }

    #[test]
    fn topic_name_rejects_wildcards() {
        assert!(TopicName::from_str("a/+/c").is_err());
        assert!(TopicName::from_str("a/#").is_err());
        assert!(TopicName::from_str("a/b/c").is_ok());
    }
}
