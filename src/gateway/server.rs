//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use super::proxy::ForwardingProxy;
use super::router::{AppState, CookieConfig, create_router};
use crate::config::Config;
use crate::identity::IdTokenVerifier;
use crate::oauth::TokenExchangeClient;
use crate::policy::AllowlistPolicy;
use crate::session::SessionStore;
use crate::{Error, Result};

/// Name of the short-lived login state cookie.
const STATE_COOKIE_NAME: &str = "mcp_oauth_state";

/// Identity gateway server
pub struct Gateway {
    config: Config,
    state: Arc<AppState>,
}

impl Gateway {
    /// Create a new gateway from configuration.
    pub fn new(config: Config) -> Result<Self> {
        let idp_http = reqwest::Client::builder()
            .timeout(config.idp.exchange_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build IdP client: {e}")))?;

        let oauth = TokenExchangeClient::new(
            idp_http.clone(),
            config.idp.clone(),
            config.session.login_ttl,
        );

        let verifier = IdTokenVerifier::new(
            idp_http,
            config.idp.issuer(),
            config.idp.resolve_client_id(),
            config.idp.jwks_url(),
        );

        let proxy = ForwardingProxy::new(
            &config.upstream.base_url,
            config.upstream.connect_timeout,
            config.upstream.request_timeout,
            config.upstream.headers.clone(),
            vec![
                config.session.cookie_name.clone(),
                STATE_COOKIE_NAME.to_string(),
            ],
        )?;

        let policy = AllowlistPolicy::from_config(&config.identity);
        let sessions = SessionStore::new(config.session.fallback_ttl);

        let secure_cookies = config.idp.redirect_uri.starts_with("https://");
        let state = Arc::new(AppState {
            sessions,
            oauth,
            verifier,
            policy,
            proxy,
            cookies: CookieConfig {
                session_name: config.session.cookie_name.clone(),
                state_name: STATE_COOKIE_NAME.to_string(),
                secure: secure_cookies,
                login_ttl: config.session.login_ttl,
            },
            max_body_size: config.server.max_body_size,
        });

        Ok(Self { config, state })
    }

    /// Run the gateway until shutdown.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let app = create_router(Arc::clone(&self.state));
        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("MCP IDENTITY GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!(idp = %self.config.idp.authority(), "Identity provider");
        info!(upstream = %self.config.upstream.base_url, "Upstream MCP endpoint");

        if self.config.identity.enforce {
            info!(
                emails = self.config.identity.allowed_emails.len(),
                domains = self.config.identity.allowed_email_domains.len(),
                "IDENTITY ENFORCEMENT enabled"
            );
            if self.config.identity.allowed_emails.is_empty()
                && self.config.identity.allowed_email_domains.is_empty()
            {
                warn!("Allowlist is empty - every identity will be denied");
            }
        } else {
            warn!("IDENTITY ENFORCEMENT disabled - any authenticated user may proxy");
        }
        info!("============================================================");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Gateway shutdown complete");
        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
