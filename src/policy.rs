//! Allowlist policy engine
//!
//! Built once at startup from configuration and shared read-only across all
//! request handlers. Matching is case-insensitive on both exact emails and
//! domain suffixes. When enforcement is on and both rule sets are empty, no
//! identity is allowed.

use std::collections::HashSet;

use tracing::debug;

use crate::config::IdentityConfig;
use crate::identity::Principal;

/// Immutable allowlist built from configuration.
#[derive(Debug)]
pub struct AllowlistPolicy {
    enforce: bool,
    /// Exact email matches (lowercased)
    exact: HashSet<String>,
    /// Email domain matches (lowercased, no leading `@`)
    domains: HashSet<String>,
}

impl AllowlistPolicy {
    /// Build the policy from identity configuration.
    #[must_use]
    pub fn from_config(config: &IdentityConfig) -> Self {
        let exact = config
            .allowed_emails
            .iter()
            .map(|e| e.trim().to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect();

        let domains = config
            .allowed_email_domains
            .iter()
            .map(|d| d.trim().trim_start_matches('@').to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect();

        Self {
            enforce: config.enforce,
            exact,
            domains,
        }
    }

    /// Whether allowlist enforcement is enabled.
    #[must_use]
    pub fn is_enforcing(&self) -> bool {
        self.enforce
    }

    /// Decide whether a principal may proceed.
    ///
    /// Allowed when enforcement is disabled, when the email exactly matches
    /// an entry, or when the email's domain matches an entry. Empty rule
    /// sets under enforcement deny everyone.
    #[must_use]
    pub fn is_allowed(&self, principal: &Principal) -> bool {
        if !self.enforce {
            return true;
        }

        let email = principal.email.to_ascii_lowercase();
        if self.exact.contains(&email) {
            return true;
        }

        let domain = email.split('@').next_back().unwrap_or("");
        let allowed = !domain.is_empty() && self.domains.contains(domain);
        if !allowed {
            debug!(email = %principal.email, "Identity not in allowlist");
        }
        allowed
    }
}
