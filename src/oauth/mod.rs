//! OAuth authorization-code flow against the identity provider.

mod client;

pub use client::{AuthorizationRedirect, TokenExchangeClient, TokenGrant};
