//! Stdio transport: one implicit MCP session over stdin/stdout.
//!
//! Only active in stdio mode. The session is bound to the launching
//! credential's identity; there is no session id, no multiplexing and no
//! HTTP surface.

use crate::auth::Identity;
use crate::error::AgentError;
use crate::server::{AgentMcpServer, SessionDeps};
use rmcp::ServiceExt;
use rmcp::transport::stdio;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Serve MCP over the process pipes until the client disconnects or the
/// agent shuts down.
pub async fn serve(
    deps: Arc<SessionDeps>,
    identity: Identity,
    shutdown: CancellationToken,
) -> Result<(), AgentError> {
    let server = AgentMcpServer::with_identity(deps, identity);

    let service = server
        .serve(stdio())
        .await
        .map_err(|e| AgentError::ToolCallFailed(format!("stdio serve failed: {e}")))?;

    // The running service owns its own cancellation; bridge ours into it so
    // coordinator shutdown closes the session.
    let session_ct = service.cancellation_token();
    let bridge = tokio::spawn(async move {
        shutdown.cancelled().await;
        session_ct.cancel();
    });

    info!("stdio session open");
    let result = service.waiting().await;
    bridge.abort();
    info!("stdio session ended");

    result
        .map(|_| ())
        .map_err(|e| AgentError::ToolCallFailed(format!("stdio session join failed: {e}")))
}
