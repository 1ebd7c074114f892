//! HTTP transport manager.
//!
//! Owns the one TCP listener. Transports mount their routes here before
//! `listen` is called, so no request can race an unregistered route. CORS
//! reflects the origin with credentials and exposes `mcp-session-id`; the
//! origin policy runs on every non-preflight request.

use crate::config::RuntimeConfig;
use crate::error::AgentError;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderName, Method, Request, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// The origin rules shared by both HTTP transports.
#[derive(Debug, Clone)]
pub struct OriginPolicy {
    pub allowed_origins: Vec<String>,
    pub prevent_dns_rebinding: bool,
}

impl OriginPolicy {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            allowed_origins: config.allowed_origins.clone(),
            prevent_dns_rebinding: config.prevent_dns_rebinding,
        }
    }
}

/// Localhost origins are always accepted. A non-localhost origin is accepted
/// only when DNS-rebind protection is on and the origin is allow-listed.
pub fn origin_allowed(origin: &str, policy: &OriginPolicy) -> bool {
    if let Ok(url) = url::Url::parse(origin) {
        if let Some(host) = url.host_str() {
            let host = host.trim_start_matches('[').trim_end_matches(']');
            if host == "localhost" || host == "127.0.0.1" || host == "::1" {
                return true;
            }
        }
    }
    policy.prevent_dns_rebinding
        && policy
            .allowed_origins
            .iter()
            .any(|allowed| allowed == origin.trim_end_matches('/'))
}

async fn origin_guard(
    State(policy): State<Arc<OriginPolicy>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    // Preflight is CORS's business.
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }

    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if let Some(origin) = origin {
        if !origin_allowed(&origin, &policy) {
            warn!(origin, "rejecting request from disallowed origin");
            return origin_rejection(&request);
        }
    }

    next.run(request).await
}

/// A JSON-RPC error envelope when the body is JSON-RPC, else a plain 403.
fn origin_rejection(request: &Request<Body>) -> Response {
    let is_json = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));

    let status = AgentError::OriginRejected(String::new()).http_status();
    if is_json {
        (
            status,
            Json(json!({
                "jsonrpc": "2.0",
                "id": null,
                "error": {"code": -32000, "message": "Origin rejected"}
            })),
        )
            .into_response()
    } else {
        status.into_response()
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

pub struct HttpTransportManager {
    port: u16,
    policy: Arc<OriginPolicy>,
    router: Router,
}

impl HttpTransportManager {
    pub fn new(config: &RuntimeConfig) -> Result<Self, AgentError> {
        let port = config.remote_port.ok_or_else(|| {
            AgentError::ConfigInvalid("HTTP manager started without REMOTE_PORT".to_string())
        })?;
        Ok(Self {
            port,
            policy: Arc::new(OriginPolicy::from_config(config)),
            router: Router::new().route("/health", get(health)),
        })
    }

    pub fn policy(&self) -> Arc<OriginPolicy> {
        self.policy.clone()
    }

    /// Register a transport's routes. Must happen before `listen`.
    pub fn mount(&mut self, router: Router) {
        self.router = std::mem::take(&mut self.router).merge(router);
    }

    /// Bind and serve until the shutdown token fires.
    pub async fn listen(self, shutdown: CancellationToken) -> Result<(), AgentError> {
        let cors = CorsLayer::new()
            .allow_origin(AllowOrigin::mirror_request())
            .allow_credentials(true)
            .allow_methods([Method::GET, Method::POST, Method::DELETE])
            .allow_headers([
                header::CONTENT_TYPE,
                header::ACCEPT,
                header::AUTHORIZATION,
                HeaderName::from_static("workspace_key"),
                HeaderName::from_static("skill_key"),
                HeaderName::from_static("skill_name"),
                HeaderName::from_static("mcp-session-id"),
                HeaderName::from_static("mcp-protocol-version"),
                HeaderName::from_static("last-event-id"),
            ])
            .expose_headers([HeaderName::from_static("mcp-session-id")]);

        // Outermost first: tracing, CORS (preflight), then the origin policy.
        let app = self.router.layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(middleware::from_fn_with_state(
                    self.policy.clone(),
                    origin_guard,
                )),
        );

        let bind = format!("0.0.0.0:{}", self.port);
        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .map_err(|e| AgentError::ConfigInvalid(format!("cannot bind {bind}: {e}")))?;

        info!("mcp http surface listening on http://{bind}");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .map_err(|e| AgentError::BusUnavailable(format!("http server failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(allowed: &[&str], prevent: bool) -> OriginPolicy {
        OriginPolicy {
            allowed_origins: allowed.iter().map(|s| s.to_string()).collect(),
            prevent_dns_rebinding: prevent,
        }
    }

    #[test]
    fn test_localhost_origins_always_allowed() {
        let p = policy(&[], true);
        assert!(origin_allowed("http://localhost:3000", &p));
        assert!(origin_allowed("http://127.0.0.1:8080", &p));
        assert!(origin_allowed("http://[::1]:8080", &p));

        // Even with protection off, localhost stays usable.
        let p = policy(&[], false);
        assert!(origin_allowed("http://localhost", &p));
    }

    #[test]
    fn test_allowlisted_origin_needs_protection_enabled() {
        let p = policy(&["https://app.example.com"], true);
        assert!(origin_allowed("https://app.example.com", &p));

        let p = policy(&["https://app.example.com"], false);
        assert!(!origin_allowed("https://app.example.com", &p));
    }

    #[test]
    fn test_unlisted_origin_rejected() {
        let p = policy(&["https://app.example.com"], true);
        assert!(!origin_allowed("https://evil.example.com", &p));
    }

    #[test]
    fn test_localhost_lookalike_rejected() {
        let p = policy(&[], true);
        assert!(!origin_allowed("http://localhost.evil.example.com", &p));
        assert!(!origin_allowed("http://127.0.0.1.evil.example.com", &p));
    }

    #[test]
    fn test_trailing_slash_normalized() {
        let p = policy(&["https://app.example.com"], true);
        assert!(origin_allowed("https://app.example.com/", &p));
    }
}
