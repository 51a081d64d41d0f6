//! HTTP router and handlers
//!
//! The front controller for the per-request flow: requests without a valid
//! session are redirected to the identity provider, `/oauth2/callback`
//! turns a code+state into a session, and everything else is policy-checked
//! and proxied to the upstream MCP endpoint.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Body,
    extract::{Query, Request, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::Deserialize;
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use super::proxy::ForwardingProxy;
use crate::error::Error;
use crate::identity::{IdTokenVerifier, Principal};
use crate::oauth::TokenExchangeClient;
use crate::policy::AllowlistPolicy;
use crate::session::{Lookup, Session, SessionStore};

/// Cookie settings shared by the handlers.
pub struct CookieConfig {
    /// Session cookie name
    pub session_name: String,
    /// Short-lived login state cookie name
    pub state_name: String,
    /// Set the `Secure` attribute (https deployments)
    pub secure: bool,
    /// Lifetime of the login state cookie
    pub login_ttl: Duration,
}

/// Shared application state
pub struct AppState {
    /// Session store
    pub sessions: SessionStore,
    /// OAuth token exchange client
    pub oauth: TokenExchangeClient,
    /// ID-token verifier
    pub verifier: IdTokenVerifier,
    /// Allowlist policy
    pub policy: AllowlistPolicy,
    /// Upstream forwarding proxy
    pub proxy: ForwardingProxy,
    /// Cookie settings
    pub cookies: CookieConfig,
    /// Maximum accepted request body size
    pub max_body_size: usize,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/oauth2/callback", get(callback_handler))
        .route("/oauth2/logout", get(logout_handler))
        // Every other path, any method: authenticate and proxy
        .fallback(proxy_handler)
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health - liveness probe (public)
async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// OAuth callback query parameters
#[derive(Debug, Deserialize)]
struct CallbackParams {
    /// Authorization code
    code: Option<String>,

    /// State parameter (for CSRF protection)
    state: Option<String>,

    /// Error code from the provider
    error: Option<String>,

    /// Error description from the provider
    error_description: Option<String>,
}

/// GET /oauth2/callback - complete the login
async fn callback_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Query(params): Query<CallbackParams>,
) -> Response {
    debug!(error = ?params.error, "Received OAuth callback");

    if let Some(error) = params.error {
        let description = params
            .error_description
            .unwrap_or_else(|| "Unknown error".to_string());
        warn!(error = %error, "Provider returned an authorization error");
        return auth_error_page(StatusCode::UNAUTHORIZED, &error, &description);
    }

    let Some(code) = params.code else {
        return auth_error_page(
            StatusCode::BAD_REQUEST,
            "missing_code",
            "Authorization code not provided",
        );
    };

    let Some(callback_state) = params.state else {
        return auth_error_page(
            StatusCode::BAD_REQUEST,
            "missing_state",
            "State parameter not provided",
        );
    };

    let Some(browser_state) = jar
        .get(&state.cookies.state_name)
        .map(|c| c.value().to_string())
    else {
        return auth_error_page(
            StatusCode::UNAUTHORIZED,
            "missing_login_cookie",
            "No login in progress for this browser",
        );
    };

    let (grant, return_to) = match state
        .oauth
        .complete_authorization(&code, &callback_state, &browser_state)
        .await
    {
        Ok(result) => result,
        Err(e) => {
            warn!(error = %e, "Authorization exchange failed");
            return auth_error_page(e.status_code(), "exchange_failed", &e.to_string());
        }
    };

    let Some(id_token) = grant.id_token.clone() else {
        return auth_error_page(
            StatusCode::UNAUTHORIZED,
            "missing_id_token",
            "Provider did not return an ID token; is the openid scope granted?",
        );
    };

    let claims = match state.verifier.verify(&id_token).await {
        Ok(claims) => claims,
        Err(e) => {
            warn!(error = %e, "ID token verification failed");
            return auth_error_page(e.status_code(), "invalid_id_token", &e.to_string());
        }
    };

    let principal = match Principal::from_claims(&claims) {
        Ok(principal) => principal,
        Err(e) => {
            warn!(error = %e, "Identity resolution failed");
            return auth_error_page(e.status_code(), "unresolvable_identity", &e.to_string());
        }
    };

    info!(
        user = %principal.forwarded_user(),
        email = %principal.email,
        sub = %principal.subject,
        "Login completed"
    );

    let session_id = state.sessions.create(&grant, principal);

    let session_cookie = Cookie::build((state.cookies.session_name.clone(), session_id))
        .http_only(true)
        .secure(state.cookies.secure)
        .same_site(SameSite::Lax)
        .path("/")
        .build();

    let clear_state = clear_cookie(&state.cookies.state_name, "/oauth2");

    Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, sanitize_return_to(&return_to))
        .header(header::SET_COOKIE, session_cookie.to_string())
        .header(header::SET_COOKIE, clear_state.to_string())
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// GET /oauth2/logout - invalidate the session
async fn logout_handler(State(state): State<Arc<AppState>>, jar: CookieJar) -> Response {
    if let Some(cookie) = jar.get(&state.cookies.session_name) {
        state.sessions.invalidate(cookie.value());
    }

    let clear_session = clear_cookie(&state.cookies.session_name, "/");

    Response::builder()
        .status(StatusCode::OK)
        .header(header::SET_COOKIE, clear_session.to_string())
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(Body::from(signed_out_page()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Fallback handler - the authenticated passthrough proxy
async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    request: Request,
) -> Response {
    let requested = request
        .uri()
        .path_and_query()
        .map_or_else(|| request.uri().path().to_string(), ToString::to_string);

    let Some(session_id) = jar
        .get(&state.cookies.session_name)
        .map(|c| c.value().to_string())
    else {
        debug!(path = %requested, "No session cookie, redirecting to login");
        return redirect_to_login(&state, &requested);
    };

    let session = match state.sessions.lookup(&session_id) {
        Lookup::Active(session) => session,
        Lookup::Expired(old) => match refresh_session(&state, old).await {
            Some(session) => session,
            None => {
                debug!(path = %requested, "Session expired, redirecting to login");
                return redirect_to_login(&state, &requested);
            }
        },
        Lookup::NotFound => {
            debug!(path = %requested, "Unknown session, redirecting to login");
            return redirect_to_login(&state, &requested);
        }
    };

    if !state.policy.is_allowed(&session.principal) {
        warn!(
            email = %session.principal.email,
            sub = %session.principal.subject,
            path = %requested,
            "Identity denied by allowlist"
        );
        return error_response(&Error::PolicyDenied(session.principal.email.clone()));
    }

    info!(
        user = %session.principal.forwarded_user(),
        email = %session.principal.email,
        sub = %session.principal.subject,
        method = %request.method(),
        path = %requested,
        "Authenticated request"
    );

    let (parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, state.max_body_size).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "Request body rejected");
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({ "error": "request body too large" })),
            )
                .into_response();
        }
    };

    match state.proxy.forward(&parts, bytes, &session.principal).await {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "Upstream forward failed");
            error_response(&e)
        }
    }
}

/// Attempt a refresh-token grant for an expired session.
async fn refresh_session(state: &AppState, old: Session) -> Option<Session> {
    let refresh_token = old.refresh_token.clone()?;
    match state.oauth.refresh_grant(&refresh_token).await {
        Ok(grant) => {
            debug!(sub = %old.principal.subject, "Session refreshed");
            Some(state.sessions.insert_refreshed(old, &grant))
        }
        Err(e) => {
            debug!(error = %e, "Session refresh failed");
            None
        }
    }
}

/// Start a login: issue the state, set the login cookie, redirect to the IdP.
fn redirect_to_login(state: &AppState, return_to: &str) -> Response {
    let redirect = match state.oauth.begin_authorization(return_to) {
        Ok(redirect) => redirect,
        Err(e) => return error_response(&e),
    };

    let login_ttl = i64::try_from(state.cookies.login_ttl.as_secs()).unwrap_or(600);
    let state_cookie = Cookie::build((state.cookies.state_name.clone(), redirect.state))
        .http_only(true)
        .secure(state.cookies.secure)
        .same_site(SameSite::Lax)
        // Only the callback route needs this cookie
        .path("/oauth2")
        .max_age(time::Duration::seconds(login_ttl))
        .build();

    Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, redirect.url)
        .header(header::SET_COOKIE, state_cookie.to_string())
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Removal cookie for `name` under `path`.
fn clear_cookie(name: &str, path: &str) -> Cookie<'static> {
    Cookie::build((name.to_string(), String::new()))
        .path(path.to_string())
        .max_age(time::Duration::ZERO)
        .build()
}

/// Only same-origin absolute paths are valid login return targets.
fn sanitize_return_to(return_to: &str) -> String {
    if return_to.starts_with('/') && !return_to.starts_with("//") {
        return_to.to_string()
    } else {
        "/".to_string()
    }
}

/// JSON error response with the taxonomy's status code.
fn error_response(error: &Error) -> Response {
    (
        error.status_code(),
        Json(json!({ "error": error.to_string() })),
    )
        .into_response()
}

fn signed_out_page() -> String {
    "<!DOCTYPE html>\n<html><head><title>Signed out</title></head>\
     <body><h1>Signed out</h1><p>Your gateway session has ended.</p></body></html>"
        .to_string()
}

/// HTML error page for the login flow (shown in the user's browser).
fn auth_error_page(status: StatusCode, error: &str, description: &str) -> Response {
    let body = format!(
        "<!DOCTYPE html>\n<html><head><title>Authorization Failed</title></head>\
         <body><h1>Authorization Failed</h1><p>{description}</p>\
         <p><code>{error}</code></p></body></html>"
    );

    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(Body::from(body))
        .unwrap_or_else(|_| status.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_params_deserialize() {
        let params: CallbackParams =
            serde_urlencoded::from_str("code=abc123&state=xyz789").unwrap();

        assert_eq!(params.code, Some("abc123".to_string()));
        assert_eq!(params.state, Some("xyz789".to_string()));
        assert!(params.error.is_none());
    }

    #[test]
    fn callback_params_deserialize_provider_error() {
        let params: CallbackParams =
            serde_urlencoded::from_str("error=access_denied&error_description=Denied").unwrap();

        assert_eq!(params.error, Some("access_denied".to_string()));
        assert_eq!(params.error_description, Some("Denied".to_string()));
        assert!(params.code.is_none());
    }

    #[test]
    fn return_to_must_be_same_origin_path() {
        assert_eq!(sanitize_return_to("/mcp"), "/mcp");
        assert_eq!(sanitize_return_to("/mcp?x=1"), "/mcp?x=1");
        assert_eq!(sanitize_return_to("https://evil.com/"), "/");
        assert_eq!(sanitize_return_to("//evil.com/"), "/");
        assert_eq!(sanitize_return_to(""), "/");
    }

    #[test]
    fn clear_cookie_expires_immediately() {
        let cookie = clear_cookie("mcp_session", "/");
        let rendered = cookie.to_string();
        assert!(rendered.starts_with("mcp_session="));
        assert!(rendered.contains("Max-Age=0"));
    }
}
