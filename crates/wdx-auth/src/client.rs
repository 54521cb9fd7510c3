//! OAuth2 client for the upstream authorization server.
//!
//! Two grants are spoken, both as form-encoded POSTs against the configured
//! token endpoint: the resource-owner password grant for interactive logins
//! and the refresh-token grant when a sealed token carries refresh material.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Outcome of a successful token-endpoint call.
#[derive(Debug, Clone, Default)]
pub struct TokenGrant {
    /// The upstream access token; never empty on success.
    pub access_token: String,
    /// Refresh token, possibly carried over from the request.
    pub refresh_token: String,
    /// Access-token lifetime in seconds; 0 when the server sent none.
    pub expires_in: u32,
    /// The credentials were accepted but the password must be changed.
    pub password_expired: bool,
}

/// Errors of the upstream OAuth2 endpoints.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The HTTP exchange itself failed.
    #[error("http request failed: {0}")]
    Transport(#[from] reqwest::Error),
    /// The server answered with an error status.
    #[error("{error}: {description} (HTTP {code})")]
    UpstreamStatus {
        /// HTTP status code.
        code: u16,
        /// The `error` member of the error document, or a generic phrase.
        error: String,
        /// The `error_description` member, when present.
        description: String,
    },
    /// The response carried something other than a JSON document.
    #[error("unexpected content type \"{0}\" delivered")]
    UnexpectedContentType(String),
    /// The JSON document misses required members or cannot be parsed.
    #[error("malformed or unexpected result document: {0}")]
    MalformedDocument(String),
}

/// The token-endpoint operations, as seen by the backend.
pub trait TokenEndpoint: Send + Sync {
    /// Resource-owner password credentials grant.
    fn password_grant(
        &self,
        scope: &str,
        username: &str,
        password: &str,
    ) -> Result<TokenGrant, AuthError>;

    /// Refresh-token grant. The existing refresh token is kept when the
    /// server does not issue a new one.
    fn refresh_grant(&self, refresh_token: &str) -> Result<TokenGrant, AuthError>;
}

/// Concrete client posting to `<origin><token_path>`.
pub struct OAuth2Client {
    http: reqwest::blocking::Client,
    client_id: String,
    client_secret: String,
    token_url: String,
}

impl OAuth2Client {
    /// Creates a client for the configured endpoint.
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        origin: &str,
        token_path: &str,
    ) -> Result<Self, AuthError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token_url: format!("{origin}{token_path}"),
        })
    }

    fn post_form(&self, form: &[(&str, &str)]) -> Result<TokenGrant, AuthError> {
        let response = self.http.post(&self.token_url).form(form).send()?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        let body = response.text()?;
        evaluate_token_response(status, &content_type, &body)
    }
}

impl TokenEndpoint for OAuth2Client {
    fn password_grant(
        &self,
        scope: &str,
        username: &str,
        password: &str,
    ) -> Result<TokenGrant, AuthError> {
        // An empty client secret is omitted from the body entirely.
        let mut form = vec![
            ("grant_type", "password"),
            ("client_id", self.client_id.as_str()),
        ];
        if !self.client_secret.is_empty() {
            form.push(("client_secret", self.client_secret.as_str()));
        }
        form.push(("scope", scope));
        form.push(("username", username));
        form.push(("password", password));

        info!(url = %self.token_url, "send POST with password credentials to OAuth2 server");
        self.post_form(&form)
    }

    fn refresh_grant(&self, refresh_token: &str) -> Result<TokenGrant, AuthError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        info!(url = %self.token_url, "send POST with refresh token to OAuth2 server");
        let mut grant = self.post_form(&form)?;
        if grant.refresh_token.is_empty() {
            info!("found no new refresh token in result, keeping the current one");
            grant.refresh_token = refresh_token.to_owned();
        }
        Ok(grant)
    }
}

pub(crate) fn generic_status_phrase(status: u16) -> &'static str {
    if status >= 500 {
        "Internal Server Error"
    } else {
        "Bad Request"
    }
}

/// True for `application/json` with an optional utf-8 charset parameter.
pub(crate) fn is_json_content_type(candidate: &str) -> bool {
    let unified: String = candidate
        .to_ascii_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    unified == "application/json" || unified == "application/json;charset=utf-8"
}

/// Evaluates a token-endpoint response into a grant.
pub(crate) fn evaluate_token_response(
    status: u16,
    content_type: &str,
    body: &str,
) -> Result<TokenGrant, AuthError> {
    debug!(status, "received token endpoint result");
    let is_json = is_json_content_type(content_type);
    let document: Option<Value> = if is_json && !body.is_empty() {
        Some(
            serde_json::from_str(body)
                .map_err(|error| AuthError::MalformedDocument(error.to_string()))?,
        )
    } else {
        None
    };

    if status >= 400 {
        let field = |name: &str| {
            document
                .as_ref()
                .and_then(|doc| doc.get(name))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned()
        };
        let mut error = field("error");
        if error.is_empty() {
            error = generic_status_phrase(status).to_owned();
        }
        return Err(AuthError::UpstreamStatus {
            code: status,
            error,
            description: field("error_description"),
        });
    }
    if !is_json {
        return Err(AuthError::UnexpectedContentType(content_type.to_owned()));
    }
    let Some(document) = document else {
        return Err(AuthError::MalformedDocument("no content included".to_owned()));
    };

    let token_type = document
        .get("token_type")
        .and_then(Value::as_str)
        .ok_or_else(|| AuthError::MalformedDocument("no \"token_type\" included".to_owned()))?;
    if !token_type.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::MalformedDocument(format!(
            "unknown token type \"{token_type}\""
        )));
    }
    let access_token = document
        .get("access_token")
        .and_then(Value::as_str)
        .ok_or_else(|| AuthError::MalformedDocument("no \"access_token\" included".to_owned()))?;

    let mut grant = TokenGrant {
        access_token: access_token.to_owned(),
        ..TokenGrant::default()
    };
    grant.password_expired = document
        .get("password_expired")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if let Some(refresh_token) = document.get("refresh_token").and_then(Value::as_str) {
        grant.refresh_token = refresh_token.to_owned();
    }
    if let Some(raw) = document.get("expires_in").and_then(Value::as_u64) {
        if raw >= u64::from(u32::MAX) {
            warn!("received value for \"expires_in\" too large, skipping");
        } else {
            grant.expires_in = raw as u32;
        }
    }
    Ok(grant)
}
