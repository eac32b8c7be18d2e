// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Enhanced authentication using a mounted Kubernetes service-account token (`K8S-SAT`).

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use notify::RecommendedWatcher;
use notify_debouncer_full::{new_debouncer, RecommendedCache};
use thiserror::Error;
use tokio::sync::Notify;

use crate::control_packet::{AuthProperties, AuthReasonCode};
use crate::error::ReauthError;
use crate::interface::InternalClient;

/// Authentication method string used for SAT-based enhanced authentication.
pub const SAT_AUTHENTICATION_METHOD: &str = "K8S-SAT";

/// Error initializing a [`SatAuthContext`].
#[derive(Debug, Error)]
pub enum SatAuthContextInitError {
    /// I/O error reading the SAT token file.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Error setting up the filesystem watcher.
    #[error("{0}")]
    Watcher(#[from] notify::Error),
    /// The configured SAT file does not exist.
    #[error("no SAT file found at the configured path")]
    NoSatFile,
}

/// Error reauthenticating with a SAT token.
#[derive(Debug, Error)]
pub enum SatReauthError {
    /// I/O error reading the SAT token file.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// The broker did not respond to the reauthentication attempt in time.
    #[error("reauthentication timed out")]
    Timeout,
    /// The broker rejected the reauthentication attempt.
    #[error("reauthentication failed with reason: {0:?}")]
    Unsuccessful(AuthReasonCode),
    /// The underlying client reported an error sending the AUTH packet.
    #[error("{0}")]
    Client(#[from] ReauthError),
    /// The auth notification channel has been closed.
    #[error("auth watcher channel closed")]
    WatcherClosed,
}

/// Error determining how long until a SAT token should be proactively renewed.
#[derive(Debug, Error)]
pub enum SatExpiryError {
    /// I/O error reading the SAT token file.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// The token is not a `header.payload.signature` JWT.
    #[error("SAT token is not a well-formed JWT")]
    MalformedJwt,
    /// The JWT payload segment is not valid base64.
    #[error("SAT token payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    /// The decoded JWT payload is not valid UTF-8.
    #[error("SAT token payload is not valid UTF-8")]
    PayloadUtf8,
    /// The decoded JWT payload is not valid JSON.
    #[error("SAT token payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// The JWT payload has no numeric `exp` claim.
    #[error("SAT token payload has no numeric `exp` claim")]
    NoExpiryClaim,
}

/// Parse the `exp` claim (seconds since the Unix epoch) out of a JWT's payload segment.
fn jwt_expiry(token: &str) -> Result<u64, SatExpiryError> {
    let parts: Vec<&str> = token.split('.').collect();
    let [_header, payload, _signature] = parts.as_slice() else {
        return Err(SatExpiryError::MalformedJwt);
    };
    let decoded = STANDARD_NO_PAD.decode(*payload)?;
    let payload = std::str::from_utf8(&decoded).map_err(|_| SatExpiryError::PayloadUtf8)?;
    let claims: serde_json::Value = serde_json::from_str(payload)?;
    claims
        .get("exp")
        .and_then(serde_json::Value::as_u64)
        .ok_or(SatExpiryError::NoExpiryClaim)
}

/// Tracks a mounted SAT token file, watching for rotations and driving reauthentication.
pub struct SatAuthContext {
    file_location: String,
    #[allow(dead_code)]
    watcher: Option<notify_debouncer_full::Debouncer<RecommendedWatcher, RecommendedCache>>,
    directory_watcher_notify: Arc<Notify>,
    auth_watcher_rx: tokio::sync::mpsc::UnboundedReceiver<AuthReasonCode>,
}

impl SatAuthContext {
    /// Begin watching `file_location` for changes, reporting broker AUTH responses via
    /// `auth_watcher_rx`.
    ///
    /// # Errors
    /// Returns [`SatAuthContextInitError`] if the file does not exist or the watcher cannot
    /// be created.
    pub fn new(
        file_location: String,
        auth_watcher_rx: tokio::sync::mpsc::UnboundedReceiver<AuthReasonCode>,
    ) -> Result<Self, SatAuthContextInitError> {
        let path = Path::new(&file_location);
        if !path.is_file() {
            return Err(SatAuthContextInitError::NoSatFile);
        }
        let Some(parent) = path.parent() else {
            return Err(SatAuthContextInitError::NoSatFile);
        };

        let directory_watcher_notify = Arc::new(Notify::new());
        let notify_clone = directory_watcher_notify.clone();

        let mut debouncer = new_debouncer(
            Duration::from_secs(10),
            None,
            move |res: Result<Vec<notify_debouncer_full::DebouncedEvent>, Vec<notify::Error>>| {
                match res {
                    Ok(events) => {
                        if events.iter().any(|e| {
                            !matches!(
                                e.event.kind,
                                notify::EventKind::Access(notify::event::AccessKind::Open(_))
                            )
                        }) {
                            notify_clone.notify_one();
                        }
                    }
                    Err(errs) => log::error!("error watching SAT token directory: {errs:?}"),
                }
            },
        )?;
        debouncer.watch(parent, notify::RecursiveMode::NonRecursive)?;

        Ok(Self {
            file_location,
            watcher: Some(debouncer),
            directory_watcher_notify,
            auth_watcher_rx,
        })
    }

    /// Wait for the watched directory to report a change.
    pub async fn notified(&self) {
        self.directory_watcher_notify.notified().await;
    }

    /// How long to wait before proactively reauthenticating, so the broker sees a fresh
    /// token `margin` ahead of the currently mounted one's `exp` claim.
    ///
    /// Returns `Duration::ZERO` if the token is already within `margin` of expiring (or has
    /// already expired), so the caller reauthenticates immediately instead of sleeping.
    ///
    /// # Errors
    /// Returns [`SatExpiryError`] if the token cannot be read or is not a JWT carrying a
    /// numeric `exp` claim.
    pub fn time_until_reauth_deadline(&self, margin: Duration) -> Result<Duration, SatExpiryError> {
        let sat_token = std::fs::read_to_string(&self.file_location)?;
        let expiry = jwt_expiry(&sat_token)?;
        let deadline = UNIX_EPOCH + Duration::from_secs(expiry);
        let until_expiry = deadline.duration_since(SystemTime::now()).unwrap_or_default();
        Ok(until_expiry.saturating_sub(margin))
    }

    /// Re-authenticate the client by re-sending the current contents of the SAT token file.
    ///
    /// # Errors
    /// Returns [`SatReauthError`] if the token cannot be read, the client rejects the request,
    /// or the broker does not respond within `timeout`.
    pub async fn reauth(
        &mut self,
        timeout: Duration,
        client: &impl InternalClient,
    ) -> Result<(), SatReauthError> {
        let sat_token = std::fs::read_to_string(&self.file_location)?;

        let props = AuthProperties {
            method: Some(SAT_AUTHENTICATION_METHOD.to_string()),
            data: Some(sat_token.into()),
            reason: None,
            user_properties: Vec::new(),
        };

        client.reauth(props).await?;

        tokio::select! {
            auth = self.auth_watcher_rx.recv() => {
                match auth {
                    Some(AuthReasonCode::Success) => Ok(()),
                    Some(rc) => Err(SatReauthError::Unsuccessful(rc)),
                    None => Err(SatReauthError::WatcherClosed),
                }
            }
            () = tokio::time::sleep(timeout) => Err(SatReauthError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_fails_when_sat_file_does_not_exist() {
        let (_tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let err = SatAuthContext::new("/does/not/exist/sat-token".to_string(), rx).unwrap_err();
        assert!(matches!(err, SatAuthContextInitError::NoSatFile));
    }

    #[test]
    fn new_succeeds_for_an_existing_sat_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "initial-token").unwrap();
        let (_tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let ctx = SatAuthContext::new(file.path().to_str().unwrap().to_string(), rx).unwrap();
        assert_eq!(ctx.file_location, file.path().to_str().unwrap());
    }

    fn fake_jwt(exp: u64) -> String {
        let payload = STANDARD_NO_PAD.encode(format!(r#"{{"exp":{exp}}}"#));
        format!("{}.{payload}.{}", STANDARD_NO_PAD.encode("{}"), STANDARD_NO_PAD.encode("sig"))
    }

    #[test]
    fn jwt_expiry_reads_the_exp_claim() {
        assert_eq!(jwt_expiry(&fake_jwt(1_700_000_000)).unwrap(), 1_700_000_000);
    }

    #[test]
    fn jwt_expiry_rejects_tokens_without_three_segments() {
        assert!(matches!(jwt_expiry("not-a-jwt"), Err(SatExpiryError::MalformedJwt)));
    }

    #[test]
    fn jwt_expiry_rejects_payload_missing_exp_claim() {
        let payload = STANDARD_NO_PAD.encode("{}");
        let token = format!("h.{payload}.s");
        assert!(matches!(jwt_expiry(&token), Err(SatExpiryError::NoExpiryClaim)));
    }

    #[test]
    fn time_until_reauth_deadline_applies_the_margin() {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), fake_jwt(now + 100)).unwrap();
        let (_tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let ctx = SatAuthContext::new(file.path().to_str().unwrap().to_string(), rx).unwrap();

        let wait = ctx
            .time_until_reauth_deadline(Duration::from_secs(40))
            .unwrap();
        assert!(wait <= Duration::from_secs(60) && wait > Duration::from_secs(50));
    }

    #[test]
    fn time_until_reauth_deadline_saturates_to_zero_once_past_the_margin() {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), fake_jwt(now + 10)).unwrap();
        let (_tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let ctx = SatAuthContext::new(file.path().to_str().unwrap().to_string(), rx).unwrap();

        let wait = ctx
            .time_until_reauth_deadline(Duration::from_secs(60))
            .unwrap();
        assert_eq!(wait, Duration::ZERO);
    }
}
