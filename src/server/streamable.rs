//! Streamable HTTP transport (`/mcp`, verbs GET/POST/DELETE).
//!
//! The rmcp streamable-http service owns the per-session state machine
//! (initialize POST without a session id, 202 for responses and
//! notifications, DELETE termination, 404 for unknown sessions). The layer
//! added here enforces the agent's own header rules first: session-id
//! charset and the supported protocol-version set.

use crate::error::AgentError;
use crate::server::{AgentMcpServer, SessionDeps};
use axum::Router;
use axum::body::Body;
use axum::http::Request;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use rmcp::transport::streamable_http_server::{
    StreamableHttpService, session::local::LocalSessionManager,
};
use std::sync::Arc;
use tracing::warn;

/// Protocol versions this surface accepts on `mcp-protocol-version`.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2024-11-05"];

/// Session ids must be visible ASCII (0x21-0x7E).
pub fn session_id_bytes_valid(raw: &[u8]) -> bool {
    !raw.is_empty() && raw.iter().all(|b| (0x21..=0x7e).contains(b))
}

/// Check the agent-level header rules. `Ok(())` hands the request on to the
/// rmcp service.
pub fn validate_headers(
    session_id: Option<&[u8]>,
    protocol_version: Option<&str>,
) -> Result<(), AgentError> {
    if let Some(raw) = session_id {
        if !session_id_bytes_valid(raw) {
            return Err(AgentError::InvalidSessionId);
        }
    }
    if let Some(version) = protocol_version {
        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&version) {
            return Err(AgentError::ProtocolVersionUnsupported(version.to_string()));
        }
    }
    Ok(())
}

async fn header_guard(request: Request<Body>, next: Next) -> Response {
    let session_id = request
        .headers()
        .get("mcp-session-id")
        .map(|v| v.as_bytes().to_vec());
    let protocol_version = request
        .headers()
        .get("mcp-protocol-version")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if let Err(e) = validate_headers(session_id.as_deref(), protocol_version.as_deref()) {
        warn!(error = %e, "rejecting /mcp request");
        return (e.http_status(), e.to_string()).into_response();
    }

    next.run(request).await
}

/// Build the `/mcp` routes. Each new session gets its own handler from the
/// factory, exactly one per `mcp-session-id`.
pub fn router(deps: Arc<SessionDeps>) -> Router {
    let service = StreamableHttpService::new(
        move || Ok(AgentMcpServer::new(deps.clone())),
        LocalSessionManager::default().into(),
        Default::default(),
    );

    Router::new()
        .nest_service("/mcp", service)
        .layer(middleware::from_fn(header_guard))
}
