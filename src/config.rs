//! Configuration management

use std::{collections::HashMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    #[serde(default)]
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Identity provider configuration
    pub idp: IdpConfig,
    /// Upstream MCP endpoint configuration
    pub upstream: UpstreamConfig,
    /// Identity enforcement / allowlist configuration
    pub identity: IdentityConfig,
    /// Session configuration
    pub session: SessionConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            max_body_size: 10 * 1024 * 1024, // 10MB
        }
    }
}

/// Identity provider org type — selects the authorization base URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OrgType {
    /// Production org (`login.salesforce.com`)
    #[default]
    Production,
    /// Sandbox org (`test.salesforce.com`)
    Sandbox,
}

/// Identity provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdpConfig {
    /// Org type (production or sandbox); selects the default base URL
    pub org: OrgType,
    /// Explicit provider base URL, overriding the org-type default
    pub base_url: Option<String>,
    /// OAuth client id (supports `env:VAR_NAME`)
    pub client_id: String,
    /// OAuth client secret (supports `env:VAR_NAME`)
    pub client_secret: String,
    /// Requested scopes
    pub scopes: Vec<String>,
    /// Redirect URI registered with the provider; must end in `/oauth2/callback`
    pub redirect_uri: String,
    /// Timeout for token-endpoint calls
    #[serde(with = "humantime_serde")]
    pub exchange_timeout: Duration,
}

impl Default for IdpConfig {
    fn default() -> Self {
        Self {
            org: OrgType::Production,
            base_url: None,
            client_id: String::new(),
            client_secret: String::new(),
            scopes: vec![
                "openid".to_string(),
                "profile".to_string(),
                "email".to_string(),
                "refresh_token".to_string(),
            ],
            redirect_uri: "http://127.0.0.1:8787/oauth2/callback".to_string(),
            exchange_timeout: Duration::from_secs(15),
        }
    }
}

impl IdpConfig {
    /// Provider base URL: explicit override, or the org-type default.
    #[must_use]
    pub fn authority(&self) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => match self.org {
                OrgType::Production => "https://login.salesforce.com".to_string(),
                OrgType::Sandbox => "https://test.salesforce.com".to_string(),
            },
        }
    }

    /// Authorization endpoint URL.
    #[must_use]
    pub fn authorize_url(&self) -> String {
        format!("{}/services/oauth2/authorize", self.authority())
    }

    /// Token endpoint URL.
    #[must_use]
    pub fn token_url(&self) -> String {
        format!("{}/services/oauth2/token", self.authority())
    }

    /// JWKS endpoint URL used to verify ID-token signatures.
    #[must_use]
    pub fn jwks_url(&self) -> String {
        format!("{}/id/keys", self.authority())
    }

    /// Expected `iss` claim of issued ID tokens.
    #[must_use]
    pub fn issuer(&self) -> String {
        self.authority()
    }

    /// Resolve the client id (expand `env:VAR_NAME` references).
    #[must_use]
    pub fn resolve_client_id(&self) -> String {
        resolve_secret(&self.client_id)
    }

    /// Resolve the client secret (expand `env:VAR_NAME` references).
    #[must_use]
    pub fn resolve_client_secret(&self) -> String {
        resolve_secret(&self.client_secret)
    }
}

fn resolve_secret(value: &str) -> String {
    if let Some(var_name) = value.strip_prefix("env:") {
        env::var(var_name).unwrap_or_else(|_| value.to_string())
    } else {
        value.to_string()
    }
}

/// Upstream MCP endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL of the upstream MCP endpoint
    pub base_url: String,
    /// Connect timeout for upstream calls
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Total request timeout for upstream calls
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Extra headers to set on every upstream request (values support `${VAR}`)
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            headers: HashMap::new(),
        }
    }
}

/// Identity enforcement configuration.
///
/// The documented flat environment variables `MCP_ENFORCE_IDENTITY`,
/// `MCP_ALLOWED_EMAILS` and `MCP_ALLOWED_EMAIL_DOMAINS` override these
/// fields after file/env extraction.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct IdentityConfig {
    /// Enforce the allowlist (default: false)
    pub enforce: bool,
    /// Exact email matches
    pub allowed_emails: Vec<String>,
    /// Email domain suffix matches
    pub allowed_email_domains: Vec<String>,
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Session cookie name
    pub cookie_name: String,
    /// Fallback session TTL when the provider omits `expires_in`
    #[serde(with = "humantime_serde")]
    pub fallback_ttl: Duration,
    /// How long a pending login (issued state) stays valid
    #[serde(with = "humantime_serde")]
    pub login_ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: "mcp_session".to_string(),
            fallback_ttl: Duration::from_secs(3600),
            login_ttl: Duration::from_secs(600),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        // Load from file if provided
        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (MCP_GATEWAY_ prefix)
        figment = figment.merge(Env::prefixed("MCP_GATEWAY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Load env files into process environment (before env var expansion)
        config.load_env_files();

        // Documented flat variables take precedence over file values
        config.identity.apply_env_overrides();

        // Expand ${VAR} in upstream headers
        config.expand_env_vars();

        config.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in upstream header values
    fn expand_env_vars(&mut self) {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").unwrap();

        for value in self.upstream.headers.values_mut() {
            *value = Self::expand_string(&re, value);
        }
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }

    fn validate(&self) -> Result<()> {
        url::Url::parse(&self.upstream.base_url)
            .map_err(|e| Error::Config(format!("Invalid upstream base URL: {e}")))?;
        url::Url::parse(&self.idp.redirect_uri)
            .map_err(|e| Error::Config(format!("Invalid redirect URI: {e}")))?;
        if let Some(base) = &self.idp.base_url {
            url::Url::parse(base)
                .map_err(|e| Error::Config(format!("Invalid IdP base URL: {e}")))?;
        }
        Ok(())
    }
}

impl IdentityConfig {
    /// Apply the documented flat environment variables.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("MCP_ENFORCE_IDENTITY") {
            self.enforce = parse_bool(&v);
        }
        if let Ok(v) = env::var("MCP_ALLOWED_EMAILS") {
            self.allowed_emails = split_csv(&v);
        }
        if let Ok(v) = env::var("MCP_ALLOWED_EMAIL_DOMAINS") {
            self.allowed_email_domains = split_csv(&v);
        }
    }
}

/// Parse a boolean environment value (`1`, `true`, `yes`, `on` are truthy).
#[must_use]
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Split a comma-separated list, trimming entries and dropping empties.
#[must_use]
pub fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}
