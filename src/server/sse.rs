//! SSE transport (`GET /sse`, `POST /messages?sessionId=`).
//!
//! Kept for existing clients even though newer ones speak streamable HTTP.
//! The stream is authenticated on GET, before the SSE response starts: the
//! handshake runs in the route layer and the resulting identity is handed to
//! the per-session handler through a FIFO slot. `POST /messages` requires a
//! `sessionId` query parameter (404 without one, 400 when malformed); the
//! rmcp SSE service dispatches valid messages to the session's transport.

use crate::error::AgentError;
use crate::server::{AgentMcpServer, PendingIdentities, SessionDeps, session_credentials_from_parts};
use crate::types::SessionId;
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Method, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use rmcp::transport::sse_server::{SseServer, SseServerConfig};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Extract and validate the `sessionId` query parameter on `/messages`.
/// `Err` carries the status the request dies with.
pub fn validate_messages_query(query: Option<&str>) -> Result<SessionId, StatusCode> {
    let query = query.ok_or(StatusCode::NOT_FOUND)?;
    let session_id = url::form_urlencoded::parse(query.as_bytes())
        .find(|(name, _)| name == "sessionId")
        .map(|(_, value)| SessionId::new(value.into_owned()))
        .ok_or(StatusCode::NOT_FOUND)?;
    if !session_id.is_valid_format() {
        return Err(StatusCode::BAD_REQUEST);
    }
    Ok(session_id)
}

struct SseGuardState {
    deps: Arc<SessionDeps>,
    pending: PendingIdentities,
}

async fn sse_guard(
    State(state): State<Arc<SseGuardState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path();

    if path == "/messages" {
        if let Err(status) = validate_messages_query(request.uri().query()) {
            return status.into_response();
        }
        return next.run(request).await;
    }

    if path == "/sse" && request.method() == Method::GET {
        let (parts, body) = request.into_parts();
        let Some(credentials) = session_credentials_from_parts(&parts) else {
            warn!("sse stream rejected: no credentials presented");
            return StatusCode::UNAUTHORIZED.into_response();
        };
        match state.deps.auth.authenticate_session(&credentials).await {
            Ok(identity) => {
                state.pending.lock().await.push_back(identity);
                return next.run(Request::from_parts(parts, body)).await;
            }
            Err(e) => {
                warn!(error = %e, "sse stream rejected");
                let status = match e {
                    AgentError::PermanentAuthFailure(_) | AgentError::TransientAuthFailure(_) => {
                        StatusCode::UNAUTHORIZED
                    }
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                return status.into_response();
            }
        }
    }

    next.run(request).await
}

/// Build the SSE routes for the shared listener. The returned token stops
/// the transport and its sessions.
pub fn router(deps: Arc<SessionDeps>, bind: SocketAddr) -> (Router, CancellationToken) {
    let ct = CancellationToken::new();
    let (sse_server, router) = SseServer::new(SseServerConfig {
        bind,
        sse_path: "/sse".to_string(),
        post_path: "/messages".to_string(),
        ct: ct.clone(),
        sse_keep_alive: None,
    });

    let pending: PendingIdentities = Arc::new(Mutex::new(VecDeque::new()));
    let guard_state = Arc::new(SseGuardState {
        deps: deps.clone(),
        pending: pending.clone(),
    });

    sse_server.with_service(move || AgentMcpServer::with_pending(deps.clone(), pending.clone()));

    let router = router.layer(middleware::from_fn_with_state(guard_state, sse_guard));
    (router, ct)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_without_query_is_not_found() {
        assert_eq!(validate_messages_query(None), Err(StatusCode::NOT_FOUND));
    }

    #[test]
    fn test_messages_without_session_id_is_not_found() {
        assert_eq!(
            validate_messages_query(Some("other=1")),
            Err(StatusCode::NOT_FOUND)
        );
    }

    #[test]
    fn test_messages_with_invalid_format_is_bad_request() {
        assert_eq!(
            validate_messages_query(Some("sessionId=bad%01id")),
            Err(StatusCode::BAD_REQUEST)
        );
        assert_eq!(
            validate_messages_query(Some("sessionId=")),
            Err(StatusCode::BAD_REQUEST)
        );
    }

    #[test]
    fn test_messages_with_valid_session_id() {
        let session_id = validate_messages_query(Some("sessionId=abc-123")).unwrap();
        assert_eq!(session_id.as_str(), "abc-123");
    }
}
