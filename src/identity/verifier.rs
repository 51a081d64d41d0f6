//! ID-token verification — JWT signature validation and JWKS caching.
//!
//! # Verification flow
//!
//! 1. Decode the JWT header (no verification) to extract `kid` and `alg`.
//! 2. Fetch the provider's JWKS (cached for 1 hour; refreshed on unknown `kid`).
//! 3. Verify the JWT signature and `exp` (60-second leeway for clock skew).
//! 4. Check `iss` against the configured provider and `aud` against the
//!    client id (single-string and array forms both accepted).
//!
//! Runs once per login, at callback time. The request path never touches
//! this module.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use jsonwebtoken::{
    Algorithm, DecodingKey, Header, TokenData, Validation,
    jwk::{AlgorithmParameters, JwkSet},
};
use tracing::{debug, warn};

use super::IdTokenClaims;
use crate::{Error, Result};

/// Cached JWKS entry.
struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
    ttl: Duration,
}

impl CachedJwks {
    fn is_stale(&self) -> bool {
        self.fetched_at.elapsed() >= self.ttl
    }
}

/// ID-token verifier for the configured identity provider.
pub struct IdTokenVerifier {
    http: reqwest::Client,
    issuer: String,
    audience: String,
    jwks_url: String,
    /// JWKS cache keyed by JWKS URL.
    jwks: DashMap<String, CachedJwks>,
    jwks_ttl: Duration,
}

impl IdTokenVerifier {
    /// Create a verifier for one provider.
    #[must_use]
    pub fn new(http: reqwest::Client, issuer: String, audience: String, jwks_url: String) -> Self {
        Self {
            http,
            issuer,
            audience,
            jwks_url,
            jwks: DashMap::new(),
            jwks_ttl: Duration::from_secs(3600),
        }
    }

    /// Verify an ID token and return its claims.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AuthExchange`] if the token is malformed, expired,
    /// signed with an unknown key, or fails the issuer/audience checks —
    /// all of which mean the login exchange cannot be trusted.
    pub async fn verify(&self, token: &str) -> Result<IdTokenClaims> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| Error::AuthExchange(format!("ID token header invalid: {e}")))?;

        let kid = header
            .kid
            .clone()
            .ok_or_else(|| Error::AuthExchange("ID token missing 'kid'".to_string()))?;

        let decoding_key = self.find_decoding_key(&kid).await?;

        let mut validation = build_validation(&header);
        // Audience handled manually below to accept both string and array forms
        validation.validate_aud = false;

        let token_data: TokenData<IdTokenClaims> =
            jsonwebtoken::decode(token, &decoding_key, &validation)
                .map_err(|e| Error::AuthExchange(format!("ID token verification failed: {e}")))?;
        let claims = token_data.claims;

        if claims.iss != self.issuer {
            return Err(Error::AuthExchange(format!(
                "ID token issuer mismatch: expected {}, got {}",
                self.issuer, claims.iss
            )));
        }

        check_audience(&claims.aud, &self.audience)?;

        debug!(sub = %claims.sub, "ID token verified");
        Ok(claims)
    }

    /// Find a decoding key by `kid`, refreshing the JWKS cache once if not found.
    async fn find_decoding_key(&self, kid: &str) -> Result<DecodingKey> {
        let jwks = self.get_or_fetch_jwks(false).await?;
        if let Some(key) = find_key_in_jwks(&jwks, kid) {
            return Ok(key);
        }

        // Unknown kid: refresh once and retry
        debug!(kid = %kid, "Key not found in cached JWKS, refreshing");
        let jwks = self.get_or_fetch_jwks(true).await?;
        find_key_in_jwks(&jwks, kid)
            .ok_or_else(|| Error::AuthExchange(format!("unknown ID token key id: {kid}")))
    }

    /// Return the cached JWKS, or fetch if stale or `force_refresh` is set.
    async fn get_or_fetch_jwks(&self, force_refresh: bool) -> Result<JwkSet> {
        if !force_refresh {
            if let Some(cached) = self.jwks.get(&self.jwks_url) {
                if !cached.is_stale() {
                    return Ok(cached.keys.clone());
                }
            }
        }

        debug!(url = %self.jwks_url, "Fetching JWKS");
        let jwks: JwkSet = self
            .http
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|e| Error::AuthExchange(format!("JWKS fetch failed: {e}")))?
            .json()
            .await
            .map_err(|e| Error::AuthExchange(format!("JWKS parse failed: {e}")))?;

        self.jwks.insert(
            self.jwks_url.clone(),
            CachedJwks {
                keys: jwks.clone(),
                fetched_at: Instant::now(),
                ttl: self.jwks_ttl,
            },
        );

        Ok(jwks)
    }
}

/// Find a JWK by `kid` in a `JwkSet` and convert it to a `DecodingKey`.
fn find_key_in_jwks(jwks: &JwkSet, kid: &str) -> Option<DecodingKey> {
    for jwk in &jwks.keys {
        let jwk_kid = jwk.common.key_id.as_deref().unwrap_or("");
        if jwk_kid != kid {
            continue;
        }

        return match &jwk.algorithm {
            AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
            AlgorithmParameters::EllipticCurve(ec) => {
                DecodingKey::from_ec_components(&ec.x, &ec.y).ok()
            }
            AlgorithmParameters::OctetKey(_) | AlgorithmParameters::OctetKeyPair(_) => None,
        };
    }
    None
}

/// Build a [`Validation`] from the JWT header algorithm.
fn build_validation(header: &Header) -> Validation {
    let alg = match header.alg {
        Algorithm::RS256 => Algorithm::RS256,
        Algorithm::RS384 => Algorithm::RS384,
        Algorithm::RS512 => Algorithm::RS512,
        Algorithm::ES256 => Algorithm::ES256,
        Algorithm::ES384 => Algorithm::ES384,
        other => {
            warn!(alg = ?other, "Unsupported JWT algorithm, defaulting to RS256");
            Algorithm::RS256
        }
    };

    let mut v = Validation::new(alg);
    v.leeway = 60; // clock skew tolerance
    v
}

/// Validate that the token's `aud` claim contains the expected client id.
fn check_audience(aud_claim: &serde_json::Value, expected: &str) -> Result<()> {
    let matches = match aud_claim {
        serde_json::Value::String(s) => s == expected,
        serde_json::Value::Array(arr) => arr
            .iter()
            .any(|v| v.as_str().is_some_and(|s| s == expected)),
        _ => false,
    };

    if matches {
        Ok(())
    } else {
        Err(Error::AuthExchange(format!(
            "ID token audience does not include client id {expected}"
        )))
    }
}
