//! Session store behavior under expiry and concurrency

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use mcp_identity_gateway::identity::Principal;
use mcp_identity_gateway::oauth::TokenGrant;
use mcp_identity_gateway::session::{Lookup, SessionStore};

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

fn principal(email: &str) -> Principal {
    Principal {
        subject: format!("sub-{email}"),
        email: email.to_string(),
        display_name: None,
    }
}

fn grant(expires_in: Option<u64>) -> TokenGrant {
    TokenGrant {
        access_token: "access".to_string(),
        refresh_token: None,
        expires_at: expires_in.map(|s| unix_now() + s),
        id_token: None,
    }
}

#[test]
fn expired_sessions_stay_dead() {
    let store = SessionStore::new(Duration::from_secs(3600));
    let id = store.create(&grant(Some(0)), principal("user1@company.com"));

    assert!(matches!(store.lookup(&id), Lookup::NotFound));
    // Subsequent lookups never resurrect the session
    for _ in 0..3 {
        assert!(matches!(store.lookup(&id), Lookup::NotFound));
    }
}

#[test]
fn unknown_ids_are_not_found() {
    let store = SessionStore::new(Duration::from_secs(3600));
    assert!(matches!(store.lookup("no-such-session"), Lookup::NotFound));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_and_lookups_do_not_interfere() {
    let store = Arc::new(SessionStore::new(Duration::from_secs(3600)));

    let mut handles = Vec::new();
    for i in 0..32 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let email = format!("user{i}@company.com");
            let id = store.create(&grant(Some(3600)), principal(&email));
            // Each task sees exactly the session it created
            for _ in 0..100 {
                match store.lookup(&id) {
                    Lookup::Active(session) => assert_eq!(session.principal.email, email),
                    other => panic!("expected Active, got {other:?}"),
                }
            }
            id
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }

    assert_eq!(store.len(), 32);
    // All ids are distinct
    let unique: std::collections::HashSet<_> = ids.iter().collect();
    assert_eq!(unique.len(), 32);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_invalidation_of_one_session_leaves_others_intact() {
    let store = Arc::new(SessionStore::new(Duration::from_secs(3600)));

    let keep = store.create(&grant(Some(3600)), principal("keep@company.com"));
    let drop_id = store.create(&grant(Some(3600)), principal("drop@company.com"));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        let drop_id = drop_id.clone();
        handles.push(tokio::spawn(async move {
            store.invalidate(&drop_id);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(matches!(store.lookup(&drop_id), Lookup::NotFound));
    assert!(matches!(store.lookup(&keep), Lookup::Active(_)));
}
