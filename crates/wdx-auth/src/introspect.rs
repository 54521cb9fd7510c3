//! RFC-7662 token introspection against the upstream server.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;
use tracing::{debug, info, warn};
use wdx_core::Clock;

use crate::client::{AuthError, generic_status_phrase, is_json_content_type};

/// Parsed introspection result.
#[derive(Debug, Clone, Default)]
pub struct VerifyResult {
    /// Whether the token is currently active.
    pub active: bool,
    /// Resource-owner user name; required and non-empty.
    pub username: String,
    /// Scope string, when the server reports one.
    pub scope: String,
    /// Client the token was issued to, when reported.
    pub client_id: String,
    /// Remaining lifetime in seconds.
    pub expires_in: u32,
}

/// The introspection operation, as seen by the backend.
pub trait IntrospectionEndpoint: Send + Sync {
    /// Verifies a third-party access token upstream.
    fn verify_access_token(&self, access_token: &str) -> Result<VerifyResult, AuthError>;
}

/// Concrete introspector posting to `<origin><verify_path>`.
pub struct Introspector {
    http: reqwest::blocking::Client,
    client_id: String,
    client_secret: String,
    verify_url: String,
    clock: Arc<dyn Clock>,
}

impl Introspector {
    /// Creates an introspector for the configured endpoint.
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        origin: &str,
        verify_path: &str,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AuthError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            verify_url: format!("{origin}{verify_path}"),
            clock,
        })
    }
}

impl IntrospectionEndpoint for Introspector {
    fn verify_access_token(&self, access_token: &str) -> Result<VerifyResult, AuthError> {
        let form = [
            ("token_type_hint", "access_token"),
            ("token", access_token),
        ];
        info!(url = %self.verify_url, "send token introspection POST to OAuth2 server");
        let mut request = self.http.post(&self.verify_url).form(&form);
        if !self.client_secret.is_empty() {
            let credentials = format!("{}:{}", self.client_id, self.client_secret);
            let encoded = STANDARD.encode(credentials.as_bytes());
            request = request.header(reqwest::header::AUTHORIZATION, format!("Basic {encoded}"));
        }
        let response = request.send()?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        let body = response.text()?;
        evaluate_verify_response(status, &content_type, &body, self.clock.monotonic_secs())
    }
}

/// Evaluates an introspection response against the current monotonic time.
pub(crate) fn evaluate_verify_response(
    status: u16,
    content_type: &str,
    body: &str,
    now: u64,
) -> Result<VerifyResult, AuthError> {
    debug!(status, "received introspection result");
    if status >= 400 {
        return Err(AuthError::UpstreamStatus {
            code: status,
            error: generic_status_phrase(status).to_owned(),
            description: String::new(),
        });
    }
    if !is_json_content_type(content_type) {
        return Err(AuthError::UnexpectedContentType(content_type.to_owned()));
    }
    let document: Value = serde_json::from_str(body)
        .map_err(|error| AuthError::MalformedDocument(error.to_string()))?;

    let active = document
        .get("active")
        .and_then(Value::as_bool)
        .ok_or_else(|| AuthError::MalformedDocument("no \"active\" included".to_owned()))?;

    let mut result = VerifyResult {
        active,
        ..VerifyResult::default()
    };
    if let Some(scope) = document.get("scope").and_then(Value::as_str) {
        result.scope = scope.to_owned();
    }
    if let Some(client_id) = document.get("client_id").and_then(Value::as_str) {
        result.client_id = client_id.to_owned();
    }
    if let Some(username) = document.get("username").and_then(Value::as_str) {
        result.username = username.to_owned();
    }
    if result.username.is_empty() {
        return Err(AuthError::MalformedDocument("no username provided".to_owned()));
    }

    result.expires_in = 1;
    if let Some(raw) = document.get("expires_in").and_then(Value::as_u64) {
        if raw >= u64::from(u32::MAX) {
            warn!("received value for \"expires_in\" too large, clamping");
            result.expires_in = u32::MAX - 1;
        } else {
            result.expires_in = raw as u32;
        }
    } else if let Some(raw) = document.get("exp").and_then(Value::as_u64) {
        if raw >= u64::from(u32::MAX) {
            warn!("received value for \"exp\" too large, clamping");
            result.expires_in = u32::MAX - 1;
        } else if raw < now {
            warn!("received value for \"exp\" which is in the past");
            result.expires_in = 0;
        } else {
            result.expires_in = (raw - now) as u32;
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    const JSON: &str = "application/json";

    #[test]
    fn active_token_with_expires_in() {
        let body = r#"{"active":true,"username":"alice","scope":"wda","expires_in":120}"#;
        let result = evaluate_verify_response(200, JSON, body, 1000).unwrap();
        assert!(result.active);
        assert_eq!(result.username, "alice");
        assert_eq!(result.scope, "wda");
        assert_eq!(result.expires_in, 120);
    }

    #[test]
    fn absolute_exp_is_converted_to_remaining_lifetime() {
        let body = r#"{"active":true,"username":"alice","exp":1500}"#;
        let result = evaluate_verify_response(200, JSON, body, 1000).unwrap();
        assert_eq!(result.expires_in, 500);
    }

    #[test]
    fn exp_in_the_past_yields_zero_remaining() {
        let body = r#"{"active":true,"username":"alice","exp":900}"#;
        let result = evaluate_verify_response(200, JSON, body, 1000).unwrap();
        assert_eq!(result.expires_in, 0);
    }

    #[test]
    fn missing_lifetime_defaults_to_one_second() {
        let body = r#"{"active":true,"username":"alice"}"#;
        let result = evaluate_verify_response(200, JSON, body, 1000).unwrap();
        assert_eq!(result.expires_in, 1);
    }

    #[test]
    fn inactive_token_is_reported() {
        let body = r#"{"active":false,"username":"alice"}"#;
        let result = evaluate_verify_response(200, JSON, body, 1000).unwrap();
        assert!(!result.active);
    }

    #[test]
    fn missing_active_member_is_rejected() {
        let body = r#"{"username":"alice"}"#;
        let error = evaluate_verify_response(200, JSON, body, 1000).unwrap_err();
        assert!(matches!(error, AuthError::MalformedDocument(_)));
    }

    #[test]
    fn empty_username_is_rejected() {
        let body = r#"{"active":true,"username":""}"#;
        let error = evaluate_verify_response(200, JSON, body, 1000).unwrap_err();
        assert!(matches!(error, AuthError::MalformedDocument(_)));
    }

    #[test]
    fn error_status_is_surfaced() {
        let error = evaluate_verify_response(503, JSON, "", 1000).unwrap_err();
        assert!(matches!(error, AuthError::UpstreamStatus { code: 503, .. }));
    }

    #[test]
    fn non_json_response_is_rejected() {
        let error = evaluate_verify_response(200, "text/plain", "ok", 1000).unwrap_err();
        assert!(matches!(error, AuthError::UnexpectedContentType(_)));
    }
}
