// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Validates topic patterns, substitutes tokens, and produces publish topics / subscribe filters.
//!
//! Follows the MQTT topic grammar: `level ( '/' level )*` where a level is either a literal label
//! or a `{token}`, and a label matches `[^ +#{}/]+`.

use std::collections::HashMap;

use regex::Regex;

use crate::common::error::{ProtocolError, Value};

/// Wildcard token used in subscribe filters.
pub const WILDCARD: &str = "+";

/// True if `s` contains a character outside the topic-label charset: non-ASCII, outside `!`..=`~`,
/// or one of `+ # { }`.
#[must_use]
pub fn contains_invalid_char(s: &str) -> bool {
    s.chars()
        .any(|c| !c.is_ascii() || !('!'..='~').contains(&c) || c == '+' || c == '#' || c == '{' || c == '}')
}

/// True if `s` is valid as a token replacement value or topic namespace: non-empty, no invalid
/// characters, doesn't start/end with `/`, and has no empty level.
///
/// This allows internal `/` separators, since a `topic_namespace` is legitimately multi-level.
/// Token *values* are a single topic level and must reject `/` outright; use
/// [`is_valid_token_value`] for those call sites instead.
#[must_use]
pub fn is_valid_replacement(s: &str) -> bool {
    !(s.is_empty()
        || contains_invalid_char(s)
        || s.starts_with('/')
        || s.ends_with('/')
        || s.contains("//"))
}

/// True if `s` is valid as a single token's replacement value: everything
/// [`is_valid_replacement`] requires, plus no internal `/` at all, since a token value must
/// occupy exactly one topic level.
#[must_use]
pub fn is_valid_token_value(s: &str) -> bool {
    is_valid_replacement(s) && !s.contains('/')
}

/// A validated, possibly token-parameterised MQTT topic pattern.
#[derive(Debug)]
pub struct TopicPattern {
    topic_pattern: String,
    pattern_regex: Regex,
}

impl TopicPattern {
    /// Validate `pattern` (optionally prefixed by `topic_namespace`), substituting any tokens
    /// found in `token_map` immediately and leaving the rest as `{token}` placeholders.
    ///
    /// # Errors
    /// Returns [`ProtocolErrorKind::ConfigurationInvalid`](crate::common::error::ProtocolErrorKind::ConfigurationInvalid)
    /// if the pattern, namespace, or any token/replacement is empty, non-ASCII, reserved (`$`-prefixed),
    /// contains an invalid character, an empty level, or adjacent tokens.
    pub fn new(
        pattern: &str,
        topic_namespace: Option<&str>,
        token_map: &HashMap<String, String>,
    ) -> Result<Self, ProtocolError> {
        if pattern.trim().is_empty() {
            return Err(ProtocolError::configuration_invalid(
                "pattern",
                Value::String(pattern.to_string()),
                "MQTT topic pattern must not be empty",
            ));
        }
        if pattern.starts_with('$') {
            return Err(ProtocolError::configuration_invalid(
                "pattern",
                Value::String(pattern.to_string()),
                "MQTT topic pattern starts with reserved character '$'",
            ));
        }
        if !pattern.is_ascii() {
            return Err(ProtocolError::configuration_invalid(
                "pattern",
                Value::String(pattern.to_string()),
                "MQTT topic pattern contains non-ASCII characters",
            ));
        }

        let pattern_as_bytes = pattern.as_bytes();

        let empty_level_regex =
            Regex::new(r"((^\s*/)|(/\s*/)|(/\s*$))").expect("static regex is valid");
        if empty_level_regex.is_match(pattern) {
            return Err(ProtocolError::configuration_invalid(
                "pattern",
                Value::String(pattern.to_string()),
                "MQTT topic pattern contains empty levels",
            ));
        }

        let mut working_pattern = String::new();
        if let Some(topic_namespace) = topic_namespace {
            if !is_valid_replacement(topic_namespace) {
                return Err(ProtocolError::configuration_invalid(
                    "topic_namespace",
                    Value::String(topic_namespace.to_string()),
                    "MQTT topic pattern contains invalid topic namespace",
                ));
            }
            working_pattern.push_str(topic_namespace);
            working_pattern.push('/');
        }

        let token_regex = Regex::new(r"(?P<token>\{[^}]+\})").expect("static regex is valid");
        let invalid_regex = Regex::new(r"([^\x21-\x7E]|[+#{}])").expect("static regex is valid");

        let mut last_match = 0;
        for caps in token_regex.captures_iter(pattern) {
            let token_capture = caps.name("token").expect("token group always present");
            let token = token_capture.as_str();

            if token.trim().is_empty() {
                return Err(ProtocolError::configuration_invalid(
                    "pattern",
                    Value::String(pattern.to_string()),
                    "MQTT topic pattern contains empty token",
                ));
            }
            if let Some(c) = pattern_as_bytes.get(token_capture.end()) {
                if *c == b'{' {
                    return Err(ProtocolError::configuration_invalid(
                        "pattern",
                        Value::String(pattern.to_string()),
                        "MQTT topic pattern contains adjacent tokens",
                    ));
                }
            }

            let acc_pattern = &pattern[last_match..token_capture.start()];
            if invalid_regex.is_match(acc_pattern) {
                return Err(ProtocolError::configuration_invalid(
                    "pattern",
                    Value::String(pattern.to_string()),
                    "MQTT topic pattern contains invalid characters",
                ));
            }
            working_pattern.push_str(acc_pattern);

            let stripped_token = &token[1..token.len() - 1];
            if invalid_regex.is_match(stripped_token) || stripped_token.contains('/') {
                return Err(ProtocolError::configuration_invalid(
                    "pattern",
                    Value::String(stripped_token.to_string()),
                    format!("MQTT topic pattern contains invalid characters in token '{token}'"),
                ));
            }

            if let Some(val) = token_map.get(stripped_token) {
                if !is_valid_token_value(val) {
                    return Err(ProtocolError::configuration_invalid(
                        stripped_token,
                        Value::String(val.to_string()),
                        format!(
                            "MQTT topic pattern contains token '{token}', but replacement value '{val}' is not valid"
                        ),
                    ));
                }
                working_pattern.push_str(val);
            } else {
                working_pattern.push_str(token);
            }
            last_match = token_capture.end();
        }

        let acc_pattern = &pattern[last_match..];
        if invalid_regex.is_match(acc_pattern) {
            return Err(ProtocolError::configuration_invalid(
                "pattern",
                Value::String(pattern.to_string()),
                "MQTT topic pattern contains invalid characters",
            ));
        }
        working_pattern.push_str(acc_pattern);

        Ok(TopicPattern {
            topic_pattern: working_pattern,
            pattern_regex: token_regex,
        })
    }

    /// Replace every remaining `{token}` with `+`, producing an MQTT subscribe filter.
    #[must_use]
    pub fn as_subscribe_topic(&self) -> String {
        self.pattern_regex
            .replace_all(&self.topic_pattern, WILDCARD)
            .to_string()
    }

    /// Substitute every remaining `{token}` from `tokens`, producing a fully-resolved publish topic.
    ///
    /// # Errors
    /// Returns `ConfigurationInvalid` if a token has no replacement in `tokens` or the replacement
    /// is not [`is_valid_replacement`].
    pub fn as_publish_topic(&self, tokens: &HashMap<String, String>) -> Result<String, ProtocolError> {
        let mut publish_topic = String::with_capacity(self.topic_pattern.len());
        let mut last_match = 0;

        for caps in self.pattern_regex.captures_iter(&self.topic_pattern) {
            let key_cap = caps.name("token").expect("token group always present");
            let key = &key_cap.as_str()[1..key_cap.as_str().len() - 1];
            publish_topic.push_str(&self.topic_pattern[last_match..key_cap.start()]);

            let Some(val) = tokens.get(key) else {
                return Err(ProtocolError::configuration_invalid(
                    key,
                    Value::String(String::new()),
                    format!("MQTT topic pattern contains token '{key}', but no replacement value provided"),
                ));
            };
            if !is_valid_token_value(val) {
                return Err(ProtocolError::configuration_invalid(
                    key,
                    Value::String(val.to_string()),
                    format!(
                        "MQTT topic pattern contains token '{key}', but replacement value '{val}' is not valid"
                    ),
                ));
            }
            publish_topic.push_str(val);
            last_match = key_cap.end();
        }
        publish_topic.push_str(&self.topic_pattern[last_match..]);
        Ok(publish_topic)
    }

    /// Extract the value bound to each remaining `{token}` from a concrete `topic` matching this
    /// pattern's shape. Returns an empty map if the pattern has no tokens.
    #[must_use]
    pub fn parse_tokens(&self, topic: &str) -> HashMap<String, String> {
        let mut tokens = HashMap::new();
        let mut topic_ref = topic;
        let mut last_token_end = 0;

        for find in self.pattern_regex.find_iter(&self.topic_pattern) {
            let token_start = find.start();
            let token_end = find.end();
            let value_start = token_start - last_token_end;
            last_token_end = token_end + 1;

            topic_ref = &topic_ref[value_start..];
            let (value, rest) = topic_ref.split_once('/').unwrap_or((topic_ref, ""));
            topic_ref = rest;

            tokens.insert(
                find.as_str()[1..find.as_str().len() - 1].to_string(),
                value.to_string(),
            );
        }
        tokens
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::common::error::ProtocolErrorKind;

    #[test_case("test", "test"; "no token")]
    #[test_case("test/test", "test/test"; "no token multiple levels")]
    #[test_case("{wildToken}", "{wildToken}"; "only wildcard")]
    #[test_case("{testToken}", "testRepl"; "only token")]
    #[test_case("test/{testToken}", "test/testRepl"; "token at end")]
    #[test_case("{testToken}/test", "testRepl/test"; "token at start")]
    #[test_case("test/{testToken}/test", "test/testRepl/test"; "token in middle")]
    fn pattern_substitutes_known_tokens(pattern: &str, result: &str) {
        let token_map = HashMap::from([("testToken".to_string(), "testRepl".to_string())]);
        let pattern = TopicPattern::new(pattern, None, &token_map).unwrap();
        assert_eq!(pattern.as_subscribe_topic().replace('+', "{wildToken}"), result);
    }

    #[test_case(""; "empty")]
    #[test_case(" "; "whitespace")]
    #[test_case("$invalidPattern/{testToken}"; "starts with dollar")]
    #[test_case("/invalidPattern/{testToken}"; "starts with slash")]
    #[test_case("{testToken}/invalidPattern/"; "ends with slash")]
    #[test_case("invalid//Pattern/{testToken}"; "contains double slash")]
    #[test_case("invalidPattern/invalid+Pattern/invalidPattern/{testToken}"; "level contains plus")]
    #[test_case("invalidPattern/invalid#Pattern/invalidPattern/{testToken}"; "level contains hash")]
    #[test_case("{testToken}{testToken}"; "adjacent tokens")]
    fn invalid_patterns_are_rejected(pattern: &str) {
        let token_map = HashMap::from([("testToken".to_string(), "testRepl".to_string())]);
        let err = TopicPattern::new(pattern, None, &token_map).unwrap_err();
        assert_eq!(err.kind(), &ProtocolErrorKind::ConfigurationInvalid {
            property_name: "pattern".to_string(),
            property_value: Value::String(pattern.to_string()),
        });
    }

    #[test_case("validNamespace"; "single level")]
    #[test_case("validNamespace/validNamespace"; "multiple levels")]
    fn valid_namespaces_are_accepted(topic_namespace: &str) {
        let pattern = "test/{testToken}";
        let token_map = HashMap::from([("testToken".to_string(), "testRepl".to_string())]);
        TopicPattern::new(pattern, Some(topic_namespace), &token_map).unwrap();
    }

    #[test_case("invalid Namespace"; "contains space")]
    #[test_case("invalid+Namespace"; "contains plus")]
    fn invalid_namespaces_are_rejected(topic_namespace: &str) {
        let pattern = "test/{testToken}";
        let token_map = HashMap::from([("testToken".to_string(), "testRepl".to_string())]);
        let err = TopicPattern::new(pattern, Some(topic_namespace), &token_map).unwrap_err();
        assert!(matches!(err.kind(), ProtocolErrorKind::ConfigurationInvalid { property_name, .. } if property_name == "topic_namespace"));
    }

    #[test_case("test", "test"; "no token")]
    #[test_case("{wildToken}", "+"; "single token")]
    #[test_case("test/{wildToken}/test", "test/+/test"; "token in middle")]
    fn as_subscribe_topic_replaces_tokens_with_wildcard(pattern: &str, result: &str) {
        let pattern = TopicPattern::new(pattern, None, &HashMap::new()).unwrap();
        assert_eq!(pattern.as_subscribe_topic(), result);
    }

    #[test]
    fn as_publish_topic_requires_every_token_resolved() {
        let pattern = TopicPattern::new("test/{executorId}", None, &HashMap::new()).unwrap();
        let err = pattern.as_publish_topic(&HashMap::new()).unwrap_err();
        assert!(matches!(err.kind(), ProtocolErrorKind::ConfigurationInvalid { .. }));

        let tokens = HashMap::from([("executorId".to_string(), "exec-1".to_string())]);
        assert_eq!(pattern.as_publish_topic(&tokens).unwrap(), "test/exec-1");
    }

    #[test]
    fn parse_tokens_extracts_values_from_a_concrete_topic() {
        let pattern = TopicPattern::new("svc/{executorId}/status", None, &HashMap::new()).unwrap();
        let tokens = pattern.parse_tokens("svc/exec-1/status");
        assert_eq!(tokens.get("executorId"), Some(&"exec-1".to_string()));
    }

    #[test]
    fn new_rejects_a_token_map_value_containing_a_slash() {
        let token_map = HashMap::from([("executorId".to_string(), "a/b".to_string())]);
        let err = TopicPattern::new("test/{executorId}", None, &token_map).unwrap_err();
        assert!(matches!(err.kind(), ProtocolErrorKind::ConfigurationInvalid { .. }));
    }

    #[test]
    fn as_publish_topic_rejects_a_token_value_containing_a_slash() {
        let pattern = TopicPattern::new("test/{executorId}", None, &HashMap::new()).unwrap();
        let tokens = HashMap::from([("executorId".to_string(), "a/b".to_string())]);
        let err = pattern.as_publish_topic(&tokens).unwrap_err();
        assert!(matches!(err.kind(), ProtocolErrorKind::ConfigurationInvalid { .. }));
    }

    #[test]
    fn topic_namespace_may_still_contain_a_slash() {
        // is_valid_replacement (used for topic_namespace) must stay looser than
        // is_valid_token_value (used for token values): a namespace legitimately spans
        // multiple topic levels.
        assert!(is_valid_replacement("ns/sub"));
        assert!(!is_valid_token_value("ns/sub"));
    }
}
