//! Identity resolution — turning validated ID-token claims into a principal.
//!
//! Signature/issuer/audience validation happens once, at callback time, in
//! [`verifier`]. Resolution from claims to [`Principal`] is a pure function
//! and never blocks on the network.

pub mod verifier;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub use verifier::IdTokenVerifier;

/// Claims extracted from a verified ID token.
#[derive(Debug, Clone, Deserialize)]
pub struct IdTokenClaims {
    /// Issuer
    pub iss: String,
    /// Subject
    pub sub: String,
    /// Audience (single string or array)
    #[serde(default)]
    pub aud: serde_json::Value,
    /// Expiry (Unix timestamp) — validated by jsonwebtoken internally
    pub exp: u64,
    /// Email
    #[serde(default)]
    pub email: Option<String>,
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
    /// Preferred username (fallback display name)
    #[serde(default)]
    pub preferred_username: Option<String>,
}

/// The authenticated identity derived from a validated token.
///
/// Derived once per login and stored in the session; never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// OIDC `sub` claim (opaque user id)
    pub subject: String,
    /// Email address from the token claims
    pub email: String,
    /// Display name (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl Principal {
    /// Resolve a principal from verified claims.
    ///
    /// Pure function of the claims. Fails when `sub` or `email` is absent,
    /// since allowlisting depends on the email.
    pub fn from_claims(claims: &IdTokenClaims) -> Result<Self> {
        if claims.sub.trim().is_empty() {
            return Err(Error::IdentityResolution(
                "token has no subject claim".to_string(),
            ));
        }

        let email = claims
            .email
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| {
                Error::IdentityResolution("token has no email claim".to_string())
            })?;

        let display_name = claims
            .name
            .clone()
            .or_else(|| claims.preferred_username.clone());

        Ok(Self {
            subject: claims.sub.clone(),
            email: email.to_string(),
            display_name,
        })
    }

    /// The value forwarded as `x-forwarded-user`: display name, falling back
    /// to the subject.
    #[must_use]
    pub fn forwarded_user(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.subject)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(sub: &str, email: Option<&str>, name: Option<&str>) -> IdTokenClaims {
        IdTokenClaims {
            iss: "https://login.salesforce.com".to_string(),
            sub: sub.to_string(),
            aud: serde_json::json!("client-id"),
            exp: 4_102_444_800,
            email: email.map(ToString::to_string),
            name: name.map(ToString::to_string),
            preferred_username: None,
        }
    }

    #[test]
    fn resolves_full_principal() {
        let principal =
            Principal::from_claims(&claims("005xx01", Some("user1@company.com"), Some("User One")))
                .unwrap();
        assert_eq!(principal.subject, "005xx01");
        assert_eq!(principal.email, "user1@company.com");
        assert_eq!(principal.display_name.as_deref(), Some("User One"));
        assert_eq!(principal.forwarded_user(), "User One");
    }

    #[test]
    fn missing_email_is_rejected() {
        let err = Principal::from_claims(&claims("005xx01", None, None)).unwrap_err();
        assert!(matches!(err, Error::IdentityResolution(_)));
    }

    #[test]
    fn blank_email_is_rejected() {
        let err = Principal::from_claims(&claims("005xx01", Some("  "), None)).unwrap_err();
        assert!(matches!(err, Error::IdentityResolution(_)));
    }

    #[test]
    fn missing_subject_is_rejected() {
        let err =
            Principal::from_claims(&claims("", Some("user1@company.com"), None)).unwrap_err();
        assert!(matches!(err, Error::IdentityResolution(_)));
    }

    #[test]
    fn forwarded_user_falls_back_to_subject() {
        let principal =
            Principal::from_claims(&claims("005xx01", Some("user1@company.com"), None)).unwrap();
        assert_eq!(principal.forwarded_user(), "005xx01");
    }

    #[test]
    fn preferred_username_used_when_name_absent() {
        let mut c = claims("005xx01", Some("user1@company.com"), None);
        c.preferred_username = Some("user1".to_string());
        let principal = Principal::from_claims(&c).unwrap();
        assert_eq!(principal.display_name.as_deref(), Some("user1"));
    }
}
