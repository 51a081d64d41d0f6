//! Error types for the identity gateway

use std::io;

use axum::http::StatusCode;
use thiserror::Error;

/// Result type alias for the identity gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Identity gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// OAuth authorization-code exchange failed (provider rejected the code,
    /// the state did not match, or the network call failed)
    #[error("Authorization exchange failed: {0}")]
    AuthExchange(String),

    /// Required identity claims are missing from the validated token
    #[error("Identity resolution failed: {0}")]
    IdentityResolution(String),

    /// The resolved identity is not in the allowlist
    #[error("Identity not allowed: {0}")]
    PolicyDenied(String),

    /// Upstream connection failed
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Upstream did not respond within the configured timeout
    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The HTTP status this error is surfaced as.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::AuthExchange(_) => StatusCode::UNAUTHORIZED,
            Self::IdentityResolution(_) | Self::PolicyDenied(_) => StatusCode::FORBIDDEN,
            Self::UpstreamUnavailable(_) | Self::Http(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this error is a transient network failure worth one retry.
    #[must_use]
    pub fn is_transient_network(&self) -> bool {
        match self {
            Self::Http(e) => e.is_connect() || e.is_timeout(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(
            Error::AuthExchange("bad code".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            Error::IdentityResolution("no email".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            Error::PolicyDenied("eve@outsider.com".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            Error::UpstreamUnavailable("refused".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            Error::UpstreamTimeout("30s".into()).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            Error::Internal("oops".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn non_network_errors_are_not_transient() {
        assert!(!Error::AuthExchange("x".into()).is_transient_network());
        assert!(!Error::Internal("x".into()).is_transient_network());
    }
}
