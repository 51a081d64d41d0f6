//! Forwarding proxy for the upstream MCP endpoint.
//!
//! On an allowed request the proxy strips any client-supplied
//! forwarded-identity headers, injects the gateway's own values for the
//! authenticated principal, and relays the request method, path, query and
//! body unchanged. The upstream status and body come back verbatim; the
//! response body is streamed.
//!
//! The gateway's session/state cookies and the OAuth access token never
//! travel upstream. Dropping the handler future (client disconnect) aborts
//! the in-flight upstream call.

use std::collections::HashMap;
use std::time::Duration;

use axum::{
    body::Body,
    http::{HeaderMap, Response, StatusCode, request::Parts},
};
use bytes::Bytes;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::identity::Principal;
use crate::{Error, Result};

/// Forwarded-identity header: display name of the authenticated user.
pub const FORWARDED_USER: &str = "x-forwarded-user";
/// Forwarded-identity header: email of the authenticated user.
pub const FORWARDED_EMAIL: &str = "x-forwarded-email";
/// Forwarded-identity header: OIDC subject of the authenticated user.
pub const FORWARDED_SUB: &str = "x-forwarded-sub";

/// Hop-by-hop headers that must not be relayed in either direction.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Reverse proxy to the upstream MCP endpoint.
pub struct ForwardingProxy {
    http: reqwest::Client,
    base_url: String,
    /// Extra headers from configuration, applied to every upstream request
    extra_headers: HashMap<String, String>,
    /// Cookie names owned by the gateway, scrubbed from the `Cookie` header
    reserved_cookies: Vec<String>,
}

impl ForwardingProxy {
    /// Create a proxy for the given upstream base URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(
        base_url: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
        extra_headers: HashMap<String, String>,
        reserved_cookies: Vec<String>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build upstream client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            extra_headers,
            reserved_cookies,
        })
    }

    /// Forward a request to the upstream on behalf of `principal`.
    ///
    /// # Errors
    ///
    /// [`Error::UpstreamTimeout`] when the upstream does not answer in time,
    /// [`Error::UpstreamUnavailable`] when the connection fails. Idempotent
    /// GET/HEAD requests are retried once on connection failure; nothing
    /// else is ever retried.
    pub async fn forward(
        &self,
        parts: &Parts,
        body: Bytes,
        principal: &Principal,
    ) -> Result<Response<Body>> {
        let path_and_query = parts
            .uri
            .path_and_query()
            .map_or_else(|| parts.uri.path(), |pq| pq.as_str());
        let target = format!("{}{}", self.base_url, path_and_query);
        let request_id = Uuid::new_v4();

        let mut outbound = self.build_request(parts, &target, principal)?;
        outbound = outbound.body(body.clone());

        let idempotent = matches!(parts.method.as_str(), "GET" | "HEAD");

        debug!(%request_id, method = %parts.method, target = %target, "Forwarding to upstream");

        let response = match outbound.send().await {
            Ok(resp) => resp,
            Err(e) if idempotent && e.is_connect() => {
                warn!(%request_id, error = %e, "Upstream connect failed, retrying once");
                let retry = self.build_request(parts, &target, principal)?.body(body);
                retry.send().await.map_err(map_upstream_error)?
            }
            Err(e) => return Err(map_upstream_error(e)),
        };

        let status = StatusCode::from_u16(response.status().as_u16())
            .map_err(|e| Error::Internal(format!("Invalid upstream status: {e}")))?;

        info!(
            %request_id,
            user = %principal.forwarded_user(),
            email = %principal.email,
            sub = %principal.subject,
            status = %status,
            "Upstream responded"
        );

        let mut builder = Response::builder().status(status);
        for (name, value) in response.headers() {
            if is_hop_by_hop(name.as_str()) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_bytes());
        }

        // Stream the body through untouched
        builder
            .body(Body::from_stream(response.bytes_stream()))
            .map_err(|e| Error::Internal(format!("Failed to build response: {e}")))
    }

    /// Build the outbound request: target URL, filtered headers, identity
    /// injection.
    fn build_request(
        &self,
        parts: &Parts,
        target: &str,
        principal: &Principal,
    ) -> Result<reqwest::RequestBuilder> {
        let method = reqwest::Method::from_bytes(parts.method.as_str().as_bytes())
            .map_err(|e| Error::Internal(format!("Invalid method: {e}")))?;

        let mut outbound = self.http.request(method, target);

        for (name, value) in filter_inbound_headers(&parts.headers, &self.reserved_cookies) {
            outbound = outbound.header(name, value);
        }

        for (name, value) in &self.extra_headers {
            outbound = outbound.header(name.as_str(), value.as_str());
        }

        // Identity headers are set last: whatever the client sent under
        // these names is already gone, so spoofed values can never win.
        outbound = outbound.header(FORWARDED_SUB, sanitize_header_value(&principal.subject));
        outbound = outbound.header(FORWARDED_EMAIL, sanitize_header_value(&principal.email));
        outbound = outbound.header(
            FORWARDED_USER,
            sanitize_header_value(principal.forwarded_user()),
        );

        Ok(outbound)
    }
}

/// Map a reqwest error to the gateway's upstream error taxonomy.
fn map_upstream_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::UpstreamTimeout(e.to_string())
    } else if e.is_connect() {
        Error::UpstreamUnavailable(e.to_string())
    } else {
        Error::Http(e)
    }
}

/// Whether a header is hop-by-hop and must not be relayed.
fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Whether a header carries reserved forwarded-identity names.
fn is_reserved_identity(name: &str) -> bool {
    name.eq_ignore_ascii_case(FORWARDED_USER)
        || name.eq_ignore_ascii_case(FORWARDED_EMAIL)
        || name.eq_ignore_ascii_case(FORWARDED_SUB)
}

/// Select the inbound headers that may travel upstream.
///
/// Drops hop-by-hop headers, `host` (reqwest sets the upstream host),
/// `content-length` (recomputed for the forwarded body), and all reserved
/// forwarded-identity names. The `Cookie` header is rebuilt without the
/// gateway's own cookies; other cookies pass through.
fn filter_inbound_headers(
    headers: &HeaderMap,
    reserved_cookies: &[String],
) -> Vec<(String, String)> {
    let mut out = Vec::new();

    for (name, value) in headers {
        let name_str = name.as_str();
        if is_hop_by_hop(name_str)
            || is_reserved_identity(name_str)
            || name_str.eq_ignore_ascii_case("host")
            || name_str.eq_ignore_ascii_case("content-length")
        {
            continue;
        }

        let Ok(value_str) = value.to_str() else {
            continue;
        };

        if name_str.eq_ignore_ascii_case("cookie") {
            let kept = scrub_cookies(value_str, reserved_cookies);
            if !kept.is_empty() {
                out.push(("cookie".to_string(), kept));
            }
            continue;
        }

        out.push((name_str.to_string(), value_str.to_string()));
    }

    out
}

/// Rebuild a `Cookie` header value without the gateway-owned cookie names.
fn scrub_cookies(value: &str, reserved: &[String]) -> String {
    value
        .split(';')
        .map(str::trim)
        .filter(|pair| {
            let name = pair.split('=').next().unwrap_or("").trim();
            !reserved.iter().any(|r| r.eq_ignore_ascii_case(name))
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Make a claim value safe for a header: strip CR/LF and control characters.
fn sanitize_header_value(value: &str) -> String {
    value.chars().filter(|c| !c.is_control()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderName, HeaderValue};

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn spoofed_identity_headers_are_dropped() {
        let inbound = headers(&[
            ("x-forwarded-email", "attacker@evil.com"),
            ("x-forwarded-user", "root"),
            ("x-forwarded-sub", "0"),
            ("accept", "application/json"),
        ]);

        let kept = filter_inbound_headers(&inbound, &[]);
        assert!(kept.iter().all(|(n, _)| !is_reserved_identity(n)));
        assert!(kept.iter().any(|(n, v)| n == "accept" && v == "application/json"));
    }

    #[test]
    fn hop_by_hop_and_host_are_dropped() {
        let inbound = headers(&[
            ("connection", "keep-alive"),
            ("transfer-encoding", "chunked"),
            ("host", "gateway.internal"),
            ("content-type", "application/json"),
        ]);

        let kept = filter_inbound_headers(&inbound, &[]);
        let names: Vec<_> = kept.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["content-type"]);
    }

    #[test]
    fn gateway_cookies_are_scrubbed_but_others_pass() {
        let inbound = headers(&[(
            "cookie",
            "mcp_session=abc123; theme=dark; mcp_oauth_state=xyz",
        )]);

        let kept = filter_inbound_headers(
            &inbound,
            &["mcp_session".to_string(), "mcp_oauth_state".to_string()],
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].0, "cookie");
        assert_eq!(kept[0].1, "theme=dark");
    }

    #[test]
    fn cookie_header_dropped_entirely_when_only_gateway_cookies() {
        let inbound = headers(&[("cookie", "mcp_session=abc123")]);
        let kept = filter_inbound_headers(&inbound, &["mcp_session".to_string()]);
        assert!(kept.is_empty());
    }

    #[test]
    fn scrub_cookies_is_case_insensitive_on_names() {
        let kept = scrub_cookies("MCP_Session=abc; other=1", &["mcp_session".to_string()]);
        assert_eq!(kept, "other=1");
    }

    #[test]
    fn sanitize_strips_control_characters() {
        assert_eq!(
            sanitize_header_value("user\r\nx-injected: 1"),
            "userx-injected: 1"
        );
        assert_eq!(sanitize_header_value("user1@company.com"), "user1@company.com");
    }

    #[test]
    fn hop_by_hop_matching_is_case_insensitive() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("TRANSFER-ENCODING"));
        assert!(!is_hop_by_hop("content-type"));
    }
}
