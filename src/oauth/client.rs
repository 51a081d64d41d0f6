//! Token exchange client
//!
//! Builds the provider authorize URL (with PKCE and an anti-forgery state)
//! and exchanges callback codes for tokens at the org-type-selected token
//! endpoint.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use backon::{ExponentialBuilder, Retryable};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use dashmap::DashMap;
use rand::RngExt;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, info};
use url::Url;

use crate::config::IdpConfig;
use crate::{Error, Result};

/// A login in progress: state issued at redirect time, consumed at callback.
struct PendingLogin {
    code_verifier: String,
    return_to: String,
    created_at: Instant,
}

/// Redirect target produced by [`TokenExchangeClient::begin_authorization`].
#[derive(Debug)]
pub struct AuthorizationRedirect {
    /// Fully built provider authorize URL
    pub url: String,
    /// Anti-forgery state bound to this login attempt
    pub state: String,
}

/// OAuth token response from the provider's token endpoint
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[allow(dead_code)]
    token_type: Option<String>,
    expires_in: Option<u64>,
    refresh_token: Option<String>,
    id_token: Option<String>,
    #[allow(dead_code)]
    scope: Option<String>,
}

/// Tokens granted by a successful exchange or refresh.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    /// Access token for the upstream session
    pub access_token: String,
    /// Refresh token, when the provider granted one
    pub refresh_token: Option<String>,
    /// Expiry as a Unix timestamp; `None` means no expiry reported
    pub expires_at: Option<u64>,
    /// OIDC ID token carrying the identity claims
    pub id_token: Option<String>,
}

impl TokenGrant {
    fn from_response(response: TokenResponse) -> Self {
        let expires_at = response.expires_in.map(|secs| unix_now() + secs);
        Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            expires_at,
            id_token: response.id_token,
        }
    }

    /// Check if the grant is expired (with 60 second buffer)
    #[must_use]
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => unix_now() + 60 >= expires_at,
            None => false,
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// OAuth client performing the authorization-code flow for gateway logins.
pub struct TokenExchangeClient {
    http: reqwest::Client,
    idp: IdpConfig,
    /// Pending logins keyed by state parameter
    pending: DashMap<String, PendingLogin>,
    login_ttl: Duration,
}

impl TokenExchangeClient {
    /// Create a new token exchange client.
    #[must_use]
    pub fn new(http: reqwest::Client, idp: IdpConfig, login_ttl: Duration) -> Self {
        Self {
            http,
            idp,
            pending: DashMap::new(),
            login_ttl,
        }
    }

    /// Begin the authorization flow: record a pending login and build the
    /// provider authorize URL.
    ///
    /// The returned state must be bound to the browser (short-lived cookie)
    /// and presented back on callback.
    pub fn begin_authorization(&self, return_to: &str) -> Result<AuthorizationRedirect> {
        // Drop logins that were never completed
        self.pending
            .retain(|_, p| p.created_at.elapsed() < self.login_ttl);

        let state = generate_state();
        let (code_verifier, code_challenge) = generate_pkce();

        self.pending.insert(
            state.clone(),
            PendingLogin {
                code_verifier,
                return_to: return_to.to_string(),
                created_at: Instant::now(),
            },
        );

        let mut auth_url = Url::parse(&self.idp.authorize_url())
            .map_err(|e| Error::Config(format!("Invalid authorize endpoint: {e}")))?;

        {
            let mut params = auth_url.query_pairs_mut();
            params.append_pair("response_type", "code");
            params.append_pair("client_id", &self.idp.resolve_client_id());
            params.append_pair("redirect_uri", &self.idp.redirect_uri);
            params.append_pair("state", &state);
            params.append_pair("code_challenge", &code_challenge);
            params.append_pair("code_challenge_method", "S256");
            params.append_pair("scope", &self.idp.scopes.join(" "));
        }

        debug!(state = %state, "Issued authorization redirect");
        Ok(AuthorizationRedirect {
            url: auth_url.to_string(),
            state,
        })
    }

    /// Complete the authorization flow: verify the state, exchange the code,
    /// and return the grant plus the path the login started from.
    ///
    /// `browser_state` is the value from the state cookie; it must equal the
    /// `state` query parameter the provider echoed back.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::AuthExchange`] when the state is unknown, stale,
    /// or mismatched, or when the provider rejects the code. Transient
    /// network failures are retried once with backoff, never more.
    pub async fn complete_authorization(
        &self,
        code: &str,
        state: &str,
        browser_state: &str,
    ) -> Result<(TokenGrant, String)> {
        // Cookie binding check: the browser completing the login must be the
        // one that started it.
        if !bool::from(state.as_bytes().ct_eq(browser_state.as_bytes())) {
            return Err(Error::AuthExchange(
                "state does not match login cookie".to_string(),
            ));
        }

        let (_, pending) = self
            .pending
            .remove(state)
            .ok_or_else(|| Error::AuthExchange("unknown or already-used state".to_string()))?;

        if pending.created_at.elapsed() >= self.login_ttl {
            return Err(Error::AuthExchange("login attempt expired".to_string()));
        }

        let client_id = self.idp.resolve_client_id();
        let client_secret = self.idp.resolve_client_secret();

        let mut params = HashMap::new();
        params.insert("grant_type", "authorization_code".to_string());
        params.insert("code", code.to_string());
        params.insert("redirect_uri", self.idp.redirect_uri.clone());
        params.insert("client_id", client_id);
        params.insert("client_secret", client_secret);
        params.insert("code_verifier", pending.code_verifier);

        // At most one bounded retry, and only on transient network failure
        let response = (|| async { self.request_token(&params).await })
            .retry(ExponentialBuilder::default().with_max_times(1))
            .when(Error::is_transient_network)
            .await
            .map_err(|e| match e {
                Error::Http(inner) => {
                    Error::AuthExchange(format!("token endpoint unreachable: {inner}"))
                }
                other => other,
            })?;

        info!("Authorization code exchanged");
        Ok((TokenGrant::from_response(response), pending.return_to))
    }

    /// Exchange a refresh token for a new grant.
    ///
    /// The provider typically omits a new refresh token; callers keep the
    /// old one in that case.
    pub async fn refresh_grant(&self, refresh_token: &str) -> Result<TokenGrant> {
        let mut params = HashMap::new();
        params.insert("grant_type", "refresh_token".to_string());
        params.insert("refresh_token", refresh_token.to_string());
        params.insert("client_id", self.idp.resolve_client_id());
        params.insert("client_secret", self.idp.resolve_client_secret());

        let response = self.request_token(&params).await.map_err(|e| match e {
            Error::Http(inner) => {
                Error::AuthExchange(format!("token endpoint unreachable: {inner}"))
            }
            other => other,
        })?;

        info!("Access token refreshed");
        Ok(TokenGrant::from_response(response))
    }

    /// POST a grant request to the token endpoint.
    ///
    /// Transport failures stay [`Error::Http`] so the retry policy can
    /// classify them; provider rejections become [`Error::AuthExchange`].
    async fn request_token(&self, params: &HashMap<&str, String>) -> Result<TokenResponse> {
        let response = self
            .http
            .post(self.idp.token_url())
            .form(params)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::AuthExchange(format!(
                "token endpoint rejected the request: HTTP {status} - {body}"
            )));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::AuthExchange(format!("invalid token response: {e}")))
    }
}

/// Generate PKCE code verifier and challenge
fn generate_pkce() -> (String, String) {
    let verifier_bytes: [u8; 32] = rand::rng().random();
    let verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);

    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    let challenge_bytes = hasher.finalize();
    let challenge = URL_SAFE_NO_PAD.encode(challenge_bytes);

    (verifier, challenge)
}

/// Generate a random state parameter
fn generate_state() -> String {
    let state_bytes: [u8; 16] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(state_bytes)
}
