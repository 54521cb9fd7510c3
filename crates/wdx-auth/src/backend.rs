//! The combined authentication backend.
//!
//! Two entry points: password authentication (which immediately mints a
//! local `wdx$` token so later requests skip the upstream round trip) and
//! token authentication. Tokens with the `wdx$` prefix are unpacked
//! locally; while their embedded expiration holds, no network traffic
//! happens at all. Expired ones fall back to introspection of the embedded
//! access token and, failing that, to a refresh-grant round trip. Anything
//! without the prefix is treated as an upstream access token and verified
//! through a time-bounded introspection cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, error, info};
use wdx_core::settings::{
    OAUTH2_CLIENT_ID, OAUTH2_CLIENT_SECRET, OAUTH2_ORIGIN, OAUTH2_TOKEN_PATH,
    OAUTH2_VERIFY_ACCESS_PATH,
};
use wdx_core::{Clock, ServiceError, ServiceResult, SettingsStore};

use crate::client::{AuthError, OAuth2Client, TokenEndpoint};
use crate::introspect::{Introspector, IntrospectionEndpoint};
use crate::token::TokenHandler;

/// Default lifetime of a locally minted token, seconds.
pub const TOKEN_DEFAULT_LIFETIME: u32 = 5 * 60;
/// Upper bound for caching a verified upstream token, seconds.
pub const TOKEN_CACHE_TIME: u32 = 5 * 60;
/// Scope requested from the upstream authorization server.
pub const PROVIDER_SCOPE: &str = "wda";

// '$' is not allowed in an OAuth2 token (RFC 6750 section 2.1) but is legal
// in the Authorization header, making the prefix an unambiguous marker.
const WDX_TOKEN_PREFIX: &str = "wdx$";

/// Result of an authentication attempt.
#[derive(Debug, Clone, Default)]
pub struct AuthOutcome {
    /// Whether the caller is authenticated.
    pub success: bool,
    /// Credentials were recognized but are expired (password or token).
    pub expired: bool,
    /// Bearer token for subsequent requests, when one could be minted.
    pub token: String,
    /// Lifetime of that token in seconds.
    pub token_expires_in: u32,
    /// Authenticated user name.
    pub user_name: String,
}

struct CacheEntry {
    entry_expiration: u64,
    token_expiration: u64,
    token_expires_in: u32,
    user_name: String,
}

/// OAuth2-backed authentication with local token minting.
pub struct OAuth2Backend {
    client: Arc<dyn TokenEndpoint>,
    introspector: Arc<dyn IntrospectionEndpoint>,
    tokens: TokenHandler,
    clock: Arc<dyn Clock>,
    broken_token_slowdown: u64,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl OAuth2Backend {
    /// Builds a backend over explicit endpoint implementations.
    pub fn new(
        client: Arc<dyn TokenEndpoint>,
        introspector: Arc<dyn IntrospectionEndpoint>,
        clock: Arc<dyn Clock>,
        broken_token_slowdown: u64,
    ) -> Self {
        Self {
            client,
            introspector,
            tokens: TokenHandler::new(TOKEN_DEFAULT_LIFETIME, Arc::clone(&clock)),
            clock,
            broken_token_slowdown,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Builds a backend wired to the endpoints named in the settings store.
    pub fn from_settings(
        settings: &SettingsStore,
        clock: Arc<dyn Clock>,
        broken_token_slowdown: u64,
    ) -> ServiceResult<Self> {
        let client_id = settings.get_setting(OAUTH2_CLIENT_ID)?;
        let client_secret = settings.get_setting(OAUTH2_CLIENT_SECRET)?;
        let origin = settings.get_setting(OAUTH2_ORIGIN)?;
        let token_path = settings.get_setting(OAUTH2_TOKEN_PATH)?;
        let verify_path = settings.get_setting(OAUTH2_VERIFY_ACCESS_PATH)?;

        let client = OAuth2Client::new(&client_id, &client_secret, &origin, &token_path)
            .map_err(|error| ServiceError::internal(error.to_string()))?;
        let introspector = Introspector::new(
            &client_id,
            &client_secret,
            &origin,
            &verify_path,
            Arc::clone(&clock),
        )
        .map_err(|error| ServiceError::internal(error.to_string()))?;
        Ok(Self::new(
            Arc::new(client),
            Arc::new(introspector),
            clock,
            broken_token_slowdown,
        ))
    }

    /// Authenticates a user by password and mints a `wdx$` token on success.
    pub fn authenticate_password(&self, user_name: &str, password: &str) -> AuthOutcome {
        self.update_token_cache();
        let mut outcome = AuthOutcome {
            user_name: user_name.to_owned(),
            ..AuthOutcome::default()
        };

        debug!("try to authenticate via username and password credentials");
        match self
            .client
            .password_grant(PROVIDER_SCOPE, user_name, password)
        {
            Ok(grant) => {
                outcome.success = true;
                outcome.expired = grant.password_expired;
                self.add_wdx_token(
                    &mut outcome,
                    grant.expires_in,
                    &grant.access_token,
                    &grant.refresh_token,
                    user_name,
                );
            }
            Err(error) => {
                error!(%error, "failed to authenticate with password credentials on OAuth2 server");
            }
        }
        outcome
    }

    /// Authenticates a bearer token; returns the outcome and the remaining
    /// token lifetime in seconds.
    pub fn authenticate_token(&self, token: &str) -> (AuthOutcome, u32) {
        self.update_token_cache();

        let (outcome, remaining) = if let Some(stripped) = token.strip_prefix(WDX_TOKEN_PREFIX) {
            debug!("try to authenticate via wdx token");
            self.verify_wdx_token(token, stripped)
        } else {
            debug!("try to authenticate via OAuth2 access token");
            self.verify_upstream_token(token)
        };

        // slow down requests with wrong or broken tokens
        if !outcome.success && self.broken_token_slowdown > 0 {
            self.clock
                .sleep(Duration::from_secs(self.broken_token_slowdown));
        }
        (outcome, remaining)
    }

    fn verify_wdx_token(&self, full_token: &str, stripped: &str) -> (AuthOutcome, u32) {
        let mut outcome = AuthOutcome::default();
        let tail = token_tail(full_token);

        let payload = match self.tokens.get_token_payload(stripped) {
            Ok(payload) => payload,
            Err(inner) => {
                debug!(error = %inner, "broken wdx token");
                error!("failed to authenticate with broken wdx token");
                return (outcome, 0);
            }
        };

        let mut fields = payload.split('?');
        let (Some(raw_expiration), Some(access_token), Some(refresh_token), Some(user_name)) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            error!("failed to authenticate with broken wdx token");
            return (outcome, 0);
        };
        let Ok(expiration) = raw_expiration.parse::<u64>() else {
            error!("failed to authenticate with broken wdx token");
            return (outcome, 0);
        };

        let now = self.clock.monotonic_secs();
        if now < expiration {
            // fast path: the embedded expiration still holds, no upstream call
            let expires_in = (expiration - now) as u32;
            outcome.success = true;
            outcome.token = full_token.to_owned();
            outcome.token_expires_in = expires_in;
            outcome.user_name = user_name.to_owned();
            info!(token = %tail, "successfully authenticated via wdx token");
            return (outcome, expires_in);
        }

        outcome.expired = true;
        let mut remaining = 0;

        // the embedded access token may outlive our own expiration margin
        match self.introspect(access_token) {
            Some(verified) if verified.active => {
                outcome.success = true;
                outcome.expired = false;
                remaining = verified.expires_in;
                self.add_wdx_token(
                    &mut outcome,
                    verified.expires_in,
                    access_token,
                    refresh_token,
                    &verified.username,
                );
            }
            _ if !refresh_token.is_empty() => {
                info!(token = %tail, "try to refresh expired wdx token");
                match self.client.refresh_grant(refresh_token) {
                    Ok(grant) => {
                        if let Some(second) = self.introspect(&grant.access_token)
                            && second.active
                        {
                            outcome.success = true;
                            outcome.expired = false;
                            remaining = min_lifetime(second.expires_in);
                            self.add_wdx_token(
                                &mut outcome,
                                second.expires_in,
                                &grant.access_token,
                                &grant.refresh_token,
                                &second.username,
                            );
                        }
                    }
                    Err(inner) => {
                        error!(error = %inner, "failed refresh token grant on OAuth2 server");
                    }
                }
            }
            _ => {}
        }

        if !outcome.success {
            outcome.expired = true;
            info!(token = %tail, "failed to authenticate via expired wdx token");
        }
        (outcome, remaining)
    }

    fn verify_upstream_token(&self, token: &str) -> (AuthOutcome, u32) {
        let mut outcome = AuthOutcome::default();
        let mut expires_in = 0;

        // try the cache first to avoid frequent upstream traffic
        let cached = {
            let cache = self.lock_cache();
            cache
                .get(token)
                .map(|entry| (entry.token_expires_in, entry.user_name.clone()))
        };
        if let Some((cached_expires_in, user_name)) = cached {
            info!("found valid token in cache, granting access");
            outcome.success = true;
            outcome.user_name = user_name;
            expires_in = cached_expires_in;
            return (outcome, expires_in);
        }

        debug!("verify token on OAuth2 service");
        if let Some(verified) = self.introspect(token)
            && verified.active
        {
            outcome.success = true;
            outcome.user_name = verified.username.clone();
            expires_in = verified.expires_in;

            let now = self.clock.monotonic_secs();
            let cache_time = verified.expires_in.min(TOKEN_CACHE_TIME);
            let entry_expiration = now + u64::from(cache_time);
            let token_expiration = now + u64::from(verified.expires_in);
            if entry_expiration > now && token_expiration > now {
                debug!(seconds = cache_time, "adding verified token to cache");
                self.lock_cache().insert(
                    token.to_owned(),
                    CacheEntry {
                        entry_expiration,
                        token_expiration,
                        token_expires_in: verified.expires_in,
                        user_name: verified.username,
                    },
                );
            }
        }
        (outcome, expires_in)
    }

    fn introspect(&self, access_token: &str) -> Option<crate::introspect::VerifyResult> {
        match self.introspector.verify_access_token(access_token) {
            Ok(result) => Some(result),
            Err(error) => {
                error!(%error, "failed to verify access token on OAuth2 server");
                None
            }
        }
    }

    fn add_wdx_token(
        &self,
        outcome: &mut AuthOutcome,
        expires_in: u32,
        access_token: &str,
        refresh_token: &str,
        user_name: &str,
    ) {
        let lifetime = min_lifetime(expires_in);
        info!(
            expires_in = lifetime,
            with_refresh = !refresh_token.is_empty(),
            "building wdx token"
        );

        let expiration = self.clock.monotonic_secs() + u64::from(lifetime);
        let payload = format!("{expiration}?{access_token}?{refresh_token}?{user_name}?");
        match self.tokens.build_token(&payload) {
            Ok(token) => {
                outcome.token = format!("{WDX_TOKEN_PREFIX}{token}");
                outcome.token_expires_in = lifetime;
                outcome.user_name = user_name.to_owned();
            }
            Err(error) => {
                // authentication may still succeed without a local token
                error!(%error, "failed to build token");
            }
        }
    }

    /// Purges expired cache entries and refreshes the remaining lifetimes of
    /// the survivors.
    fn update_token_cache(&self) {
        let now = self.clock.monotonic_secs();
        let mut cache = self.lock_cache();
        cache.retain(|_, entry| {
            if entry.entry_expiration < now {
                debug!("removing expired token from cache");
                return false;
            }
            entry.token_expires_in = entry.token_expiration.saturating_sub(now) as u32;
            true
        });
    }

    fn lock_cache(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Lifetime of a minted token: the default, bounded by the upstream token's
/// remaining life minus one second of processing margin.
fn min_lifetime(access_token_expires_in: u32) -> u32 {
    if access_token_expires_in == 0 {
        0
    } else if TOKEN_DEFAULT_LIFETIME < access_token_expires_in {
        TOKEN_DEFAULT_LIFETIME
    } else {
        access_token_expires_in - 1
    }
}

/// Last few characters of a token, for log correlation without leaking it.
fn token_tail(token: &str) -> &str {
    let mut start = token.len().saturating_sub(8);
    while !token.is_char_boundary(start) {
        start += 1;
    }
    &token[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_lifetime_caps_at_the_default() {
        assert_eq!(min_lifetime(0), 0);
        assert_eq!(min_lifetime(1), 0);
        assert_eq!(min_lifetime(2), 1);
        assert_eq!(min_lifetime(300), 299);
        assert_eq!(min_lifetime(301), 300);
        assert_eq!(min_lifetime(86_400), TOKEN_DEFAULT_LIFETIME);
    }

    #[test]
    fn token_tail_is_short_and_safe_on_short_input() {
        assert_eq!(token_tail("abc"), "abc");
        assert_eq!(token_tail("0123456789"), "23456789");
    }
}
