//! Session store
//!
//! Arena-style mapping from random unguessable session ids to session
//! records. Expiry is enforced lazily at lookup time; there is no background
//! sweep. DashMap sharding keeps lookups and creates for different session
//! ids from blocking each other.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use dashmap::DashMap;
use rand::RngExt;
use tracing::debug;

use crate::identity::Principal;
use crate::oauth::TokenGrant;

/// A validated login session.
///
/// The principal is set at creation and never replaced; a token refresh
/// carries it over unchanged.
#[derive(Debug, Clone)]
pub struct Session {
    /// Opaque unguessable session id (also the cookie value)
    pub id: String,
    /// Access token from the provider
    pub access_token: String,
    /// Refresh token, when granted
    pub refresh_token: Option<String>,
    /// Expiry as a Unix timestamp
    pub expires_at: u64,
    /// The authenticated identity
    pub principal: Principal,
}

impl Session {
    /// Check if the session is expired (with 60 second buffer)
    #[must_use]
    pub fn is_expired(&self) -> bool {
        unix_now() + 60 >= self.expires_at
    }
}

/// Outcome of a session lookup.
#[derive(Debug)]
pub enum Lookup {
    /// A live session
    Active(Session),
    /// The session expired but holds a refresh token; the entry has been
    /// removed, and the caller may attempt a refresh and re-insert.
    Expired(Session),
    /// No such session (including expired sessions with nothing to refresh)
    NotFound,
}

/// In-memory session store.
pub struct SessionStore {
    inner: DashMap<String, Session>,
    fallback_ttl: Duration,
}

impl SessionStore {
    /// Create an empty store. `fallback_ttl` bounds sessions whose grant
    /// carried no `expires_in`.
    #[must_use]
    pub fn new(fallback_ttl: Duration) -> Self {
        Self {
            inner: DashMap::new(),
            fallback_ttl,
        }
    }

    /// Create a session from a token grant and resolved principal.
    /// Returns the new session id.
    pub fn create(&self, grant: &TokenGrant, principal: Principal) -> String {
        let id = generate_session_id();
        let expires_at = grant
            .expires_at
            .unwrap_or_else(|| unix_now() + self.fallback_ttl.as_secs());

        self.inner.insert(
            id.clone(),
            Session {
                id: id.clone(),
                access_token: grant.access_token.clone(),
                refresh_token: grant.refresh_token.clone(),
                expires_at,
                principal,
            },
        );

        debug!(sessions = self.inner.len(), "Session created");
        id
    }

    /// Look up a session, enforcing expiry.
    ///
    /// Expired entries are removed on the spot: a second lookup of an
    /// expired id is always [`Lookup::NotFound`].
    pub fn lookup(&self, session_id: &str) -> Lookup {
        let expired = match self.inner.get(session_id) {
            Some(session) if !session.is_expired() => return Lookup::Active(session.clone()),
            Some(_) => true,
            None => false,
        };

        if expired {
            // Remove outside the read guard to avoid deadlocking the shard
            if let Some((_, session)) = self.inner.remove(session_id) {
                debug!("Session expired at lookup");
                if session.refresh_token.is_some() {
                    return Lookup::Expired(session);
                }
            }
        }

        Lookup::NotFound
    }

    /// Re-insert a refreshed session under its original id.
    ///
    /// Tokens come from the new grant; the principal and id come from the
    /// expired session. A refresh response without a new refresh token keeps
    /// the old one.
    pub fn insert_refreshed(&self, old: Session, grant: &TokenGrant) -> Session {
        let session = Session {
            id: old.id.clone(),
            access_token: grant.access_token.clone(),
            refresh_token: grant.refresh_token.clone().or(old.refresh_token),
            expires_at: grant
                .expires_at
                .unwrap_or_else(|| unix_now() + self.fallback_ttl.as_secs()),
            principal: old.principal,
        };
        self.inner.insert(old.id, session.clone());
        session
    }

    /// Remove a session (logout).
    pub fn invalidate(&self, session_id: &str) {
        if self.inner.remove(session_id).is_some() {
            debug!("Session invalidated");
        }
    }

    /// Number of live entries (test/diagnostic use).
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the store has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Generate an opaque unguessable session id (256 bits, base64url).
fn generate_session_id() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal() -> Principal {
        Principal {
            subject: "005xx01".to_string(),
            email: "user1@company.com".to_string(),
            display_name: Some("User One".to_string()),
        }
    }

    fn grant(expires_in: Option<u64>, refresh: Option<&str>) -> TokenGrant {
        TokenGrant {
            access_token: "access-token".to_string(),
            refresh_token: refresh.map(ToString::to_string),
            expires_at: expires_in.map(|s| unix_now() + s),
            id_token: None,
        }
    }

    #[test]
    fn session_ids_are_long_and_unique() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert_ne!(a, b);
        // 32 random bytes -> 43 base64url chars
        assert!(a.len() >= 40);
    }

    #[test]
    fn create_then_lookup_returns_active() {
        let store = SessionStore::new(Duration::from_secs(3600));
        let id = store.create(&grant(Some(3600), None), principal());

        match store.lookup(&id) {
            Lookup::Active(session) => {
                assert_eq!(session.principal.email, "user1@company.com");
                assert_eq!(session.access_token, "access-token");
            }
            other => panic!("expected Active, got {other:?}"),
        }
    }

    #[test]
    fn expired_session_without_refresh_token_is_not_found() {
        let store = SessionStore::new(Duration::from_secs(3600));
        let id = store.create(&grant(Some(0), None), principal());

        assert!(matches!(store.lookup(&id), Lookup::NotFound));
        // No resurrection
        assert!(matches!(store.lookup(&id), Lookup::NotFound));
        assert!(store.is_empty());
    }

    #[test]
    fn expired_session_with_refresh_token_is_surfaced_once() {
        let store = SessionStore::new(Duration::from_secs(3600));
        let id = store.create(&grant(Some(0), Some("refresh-1")), principal());

        match store.lookup(&id) {
            Lookup::Expired(session) => {
                assert_eq!(session.refresh_token.as_deref(), Some("refresh-1"));
            }
            other => panic!("expected Expired, got {other:?}"),
        }
        // Consumed: second lookup finds nothing
        assert!(matches!(store.lookup(&id), Lookup::NotFound));
    }

    #[test]
    fn refreshed_session_keeps_id_and_principal() {
        let store = SessionStore::new(Duration::from_secs(3600));
        let id = store.create(&grant(Some(0), Some("refresh-1")), principal());

        let Lookup::Expired(old) = store.lookup(&id) else {
            panic!("expected Expired");
        };

        // Refresh response without a new refresh token keeps the old one
        let refreshed = store.insert_refreshed(old, &grant(Some(3600), None));
        assert_eq!(refreshed.id, id);
        assert_eq!(refreshed.refresh_token.as_deref(), Some("refresh-1"));
        assert_eq!(refreshed.principal.email, "user1@company.com");

        assert!(matches!(store.lookup(&id), Lookup::Active(_)));
    }

    #[test]
    fn invalidate_removes_session() {
        let store = SessionStore::new(Duration::from_secs(3600));
        let id = store.create(&grant(Some(3600), None), principal());

        store.invalidate(&id);
        assert!(matches!(store.lookup(&id), Lookup::NotFound));
    }

    #[test]
    fn grant_without_expiry_uses_fallback_ttl() {
        let store = SessionStore::new(Duration::from_secs(3600));
        let id = store.create(&grant(None, None), principal());

        match store.lookup(&id) {
            Lookup::Active(session) => {
                assert!(session.expires_at > unix_now() + 3000);
            }
            other => panic!("expected Active, got {other:?}"),
        }
    }

    #[test]
    fn lookups_of_distinct_ids_are_independent() {
        let store = SessionStore::new(Duration::from_secs(3600));
        let a = store.create(&grant(Some(3600), None), principal());
        let b = store.create(&grant(Some(0), None), principal());

        assert!(matches!(store.lookup(&b), Lookup::NotFound));
        assert!(matches!(store.lookup(&a), Lookup::Active(_)));
        assert_eq!(store.len(), 1);
    }
}
