//! MCP Identity Gateway Library
//!
//! An identity-enforcing reverse proxy for remote MCP endpoints:
//!
//! - **OAuth login**: authorization-code flow (with PKCE) against a
//!   Salesforce-style identity provider, production or sandbox org
//! - **Sessions**: opaque unguessable cookie-backed sessions with lazy
//!   expiry and refresh-token renewal
//! - **Allowlist**: exact-email and email-domain policy, deny-by-default
//!   when enforcement is on and no rules are configured
//! - **Forwarding**: spoof-proof `x-forwarded-user` / `x-forwarded-email` /
//!   `x-forwarded-sub` injection and verbatim request/response relay

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod oauth;
pub mod policy;
pub mod session;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
