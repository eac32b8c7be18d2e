// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Reserved MQTT user-property names and validation of caller-supplied metadata.

/// Prefix reserved for this runtime's own user-properties (`__protVer`, `__stat`, ...).
///
/// Caller-supplied metadata whose key starts with this prefix is rejected so it can never shadow
/// a reserved property.
pub const RESERVED_PREFIX: &str = "__";

/// Protocol version user-property.
pub const PROTOCOL_VERSION: &str = "__protVer";
/// HTTP-like status code user-property, set on responses.
pub const STATUS: &str = "__stat";
/// Human-readable status message user-property, set on error responses.
pub const STATUS_MESSAGE: &str = "__stMsg";
/// "true" when the error that produced a response originated in application handler code.
pub const IS_APPLICATION_ERROR: &str = "__apErr";
/// Name of the offending argument/header/timeout on an error response.
pub const INVALID_PROPERTY_NAME: &str = "__propName";
/// Value of the offending argument/header/timeout on an error response.
pub const INVALID_PROPERTY_VALUE: &str = "__propVal";
/// Supported major protocol versions, set on a version-rejection response.
pub const SUPPORTED_MAJOR_VERSIONS: &str = "__supProtMajVer";
/// Sender/invoker client id.
pub const SOURCE_ID: &str = "__srcId";

/// Validate a caller-supplied metadata map destined for MQTT user-properties.
///
/// # Errors
/// Returns a description of the problem if any key starts with [`RESERVED_PREFIX`], or if any key
/// or value contains characters that cannot round-trip through an MQTT UTF-8 string property.
pub fn validate_user_properties(properties: &[(String, String)]) -> Result<(), String> {
    for (key, value) in properties {
        if key.starts_with(RESERVED_PREFIX) {
            return Err(format!(
                "custom user property key '{key}' uses the reserved prefix '{RESERVED_PREFIX}'"
            ));
        }
        if is_invalid_utf8(key) || is_invalid_utf8(value) {
            return Err(format!(
                "custom user property '{key}' contains characters invalid in an MQTT UTF-8 string"
            ));
        }
    }
    Ok(())
}

/// MQTT UTF-8 strings forbid embedded NUL and unpaired surrogates; `char` already excludes
/// surrogates, so only NUL needs checking here.
#[must_use]
pub fn is_invalid_utf8(s: &str) -> bool {
    s.contains('\u{0000}')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_prefix_is_rejected() {
        let props = vec![("__custom".to_string(), "value".to_string())];
        assert!(validate_user_properties(&props).is_err());
    }

    #[test]
    fn ordinary_key_is_accepted() {
        let props = vec![("custom".to_string(), "value".to_string())];
        assert!(validate_user_properties(&props).is_ok());
    }

    #[test]
    fn embedded_nul_is_rejected() {
        let props = vec![("custom".to_string(), "va\u{0000}lue".to_string())];
        assert!(validate_user_properties(&props).is_err());
    }
}
