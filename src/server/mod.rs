//! MCP server handler shared by all transports.
//!
//! One handler instance exists per inbound session. `initialize`
//! authenticates the session, creates its skill surface and blocks until the
//! surface has its first tool list, so a `tools/list` issued right after
//! `initialize` can never race an empty list. `tools/list` and `tools/call`
//! are served from the surface.

pub mod http;
pub mod sse;
pub mod stdio;
pub mod streamable;

use crate::auth::{AuthService, Identity, SessionCredentials};
use crate::error::AgentError;
use crate::messaging::BusClient;
use crate::ratelimit::RateLimiter;
use crate::surface::SkillSurface;
use crate::tools::ToolService;
use rmcp::{
    ErrorData as McpError,
    handler::server::ServerHandler,
    model::*,
    service::{NotificationContext, Peer, RequestContext, RoleServer},
};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Type alias for HTTP request parts stored in rmcp extensions.
type HttpParts = ::http::request::Parts;

/// Shared collaborators handed to every new session handler.
pub struct SessionDeps {
    pub bus: BusClient,
    pub auth: Arc<AuthService>,
    pub tool_service: Option<Arc<ToolService>>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
}

/// Identities authenticated at the transport layer (SSE GET) waiting for
/// their session handler to claim them.
pub type PendingIdentities = Arc<Mutex<VecDeque<Identity>>>;

/// Everything owned by one live session. Dropping it tears the surface and
/// the notification pump down, so no session state outlives its transport.
struct SessionGuard {
    surface: Arc<SkillSurface>,
    notify_task: JoinHandle<()>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.surface.close();
        self.notify_task.abort();
    }
}

#[derive(Clone)]
pub struct AgentMcpServer {
    deps: Arc<SessionDeps>,
    /// Identity fixed at construction (stdio mode binds the session to the
    /// launching credential).
    preset_identity: Option<Identity>,
    /// Transport-level auth handoff for SSE sessions.
    pending_identities: Option<PendingIdentities>,
    session: Arc<RwLock<Option<SessionGuard>>>,
}

impl AgentMcpServer {
    /// Handler whose session authenticates itself via HTTP headers during
    /// `initialize`.
    pub fn new(deps: Arc<SessionDeps>) -> Self {
        Self {
            deps,
            preset_identity: None,
            pending_identities: None,
            session: Arc::new(RwLock::new(None)),
        }
    }

    /// Handler bound to an identity acquired before the session existed
    /// (the stdio transport's implicit session).
    pub fn with_identity(deps: Arc<SessionDeps>, identity: Identity) -> Self {
        Self {
            deps,
            preset_identity: Some(identity),
            pending_identities: None,
            session: Arc::new(RwLock::new(None)),
        }
    }

    /// Handler that may claim an identity authenticated at the transport
    /// layer when the request carries no usable headers.
    pub fn with_pending(deps: Arc<SessionDeps>, pending: PendingIdentities) -> Self {
        Self {
            deps,
            preset_identity: None,
            pending_identities: Some(pending),
            session: Arc::new(RwLock::new(None)),
        }
    }

    async fn surface(&self) -> Option<Arc<SkillSurface>> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|guard| guard.surface.clone())
    }

    async fn resolve_identity(&self, parts: Option<&HttpParts>) -> Result<Identity, McpError> {
        if let Some(identity) = &self.preset_identity {
            return Ok(identity.clone());
        }

        if let Some(parts) = parts {
            if let Some(credentials) = session_credentials_from_parts(parts) {
                self.enforce_rate_limits(&credentials, parts).await?;
                return self
                    .deps
                    .auth
                    .authenticate_session(&credentials)
                    .await
                    .map_err(|e| match e {
                        AgentError::PermanentAuthFailure(_) | AgentError::TransientAuthFailure(_) => {
                            e.to_mcp_error()
                        }
                        other => McpError::internal_error(
                            format!("Authentication failed: {other}"),
                            None,
                        ),
                    });
            }
        }

        if let Some(pending) = &self.pending_identities {
            if let Some(identity) = pending.lock().await.pop_front() {
                return Ok(identity);
            }
        }

        warn!("session rejected: no credentials presented");
        Err(McpError::new(
            ErrorCode(-32001),
            "Authentication required".to_string(),
            None,
        ))
    }

    async fn enforce_rate_limits(
        &self,
        credentials: &SessionCredentials,
        parts: &HttpParts,
    ) -> Result<(), McpError> {
        let Some(limiter) = &self.deps.rate_limiter else {
            return Ok(());
        };

        // Keys are looked up by digest so raw material never becomes a
        // bucket key.
        let key_digest = {
            let key = match credentials {
                SessionCredentials::WorkspaceKey { key, .. }
                | SessionCredentials::SkillKey { key }
                | SessionCredentials::QueryKey { key } => key,
            };
            let mut hasher = Sha256::new();
            hasher.update(key.as_bytes());
            format!("{:x}", hasher.finalize())
        };

        match limiter.check_key(&key_digest).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(McpError::new(
                    ErrorCode(-32001),
                    "Rate limit exceeded".to_string(),
                    None,
                ));
            }
            Err(e) => warn!(error = %e, "rate limiter unavailable, admitting"),
        }

        let ip = parts
            .headers
            .get("X-Forwarded-For")
            .or_else(|| parts.headers.get("X-Real-IP"))
            .and_then(|v| v.to_str().ok())
            .map(|s| s.split(',').next().unwrap_or(s).trim().to_string());
        if let Some(ip) = ip {
            match limiter.check_ip(&ip).await {
                Ok(true) => {}
                Ok(false) => {
                    return Err(McpError::new(
                        ErrorCode(-32001),
                        "Rate limit exceeded".to_string(),
                        None,
                    ));
                }
                Err(e) => warn!(error = %e, "rate limiter unavailable, admitting"),
            }
        }

        Ok(())
    }
}

/// Pull session credentials out of the request: auth headers first, then the
/// `?key=` query fallback.
pub fn session_credentials_from_parts(parts: &HttpParts) -> Option<SessionCredentials> {
    let header = |name: &str| {
        parts
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .filter(|v| !v.is_empty())
    };

    if let Some(key) = header("skill_key") {
        return Some(SessionCredentials::SkillKey { key });
    }
    if let (Some(key), Some(skill_name)) = (header("workspace_key"), header("skill_name")) {
        return Some(SessionCredentials::WorkspaceKey { key, skill_name });
    }
    if let Some(query) = parts.uri.query() {
        for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if name == "key" && !value.is_empty() {
                return Some(SessionCredentials::QueryKey {
                    key: value.into_owned(),
                });
            }
        }
    }
    None
}

/// Minimal argument validation against the advertised schema: every name in
/// `required` must be present.
fn check_required_arguments(
    schema: &serde_json::Map<String, serde_json::Value>,
    arguments: &serde_json::Map<String, serde_json::Value>,
) -> Result<(), AgentError> {
    let Some(required) = schema.get("required").and_then(|r| r.as_array()) else {
        return Ok(());
    };
    for name in required.iter().filter_map(|n| n.as_str()) {
        if !arguments.contains_key(name) {
            return Err(AgentError::SchemaValidation(format!(
                "missing required argument `{name}`"
            )));
        }
    }
    Ok(())
}

impl ServerHandler for AgentMcpServer {
    fn ping(
        &self,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<(), McpError>> + Send + '_ {
        std::future::ready(Ok(()))
    }

    fn initialize(
        &self,
        _request: InitializeRequestParams,
        context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<InitializeResult, McpError>> + Send + '_ {
        let this = self.clone();
        let peer = context.peer.clone();
        // rmcp stores http::request::Parts in extensions for HTTP transports.
        let parts = context.extensions.get::<HttpParts>().cloned();

        async move {
            let identity = this.resolve_identity(parts.as_ref()).await?;
            debug!(skill = %identity.id, name = %identity.name, "session authenticated");

            let surface = SkillSurface::spawn(
                identity.clone(),
                this.deps.bus.clone(),
                this.deps.tool_service.clone(),
            );

            // Gate completion on the first population so the first
            // tools/list cannot observe a transient empty list.
            surface.wait_ready().await;

            let notify_task = spawn_notify_pump(&surface, peer);
            *this.session.write().await = Some(SessionGuard {
                surface,
                notify_task,
            });

            let mut server_info = Implementation::from_build_env();
            if !identity.name.is_empty() {
                server_info.name = identity.name.clone();
            }

            Ok(InitializeResult {
                protocol_version: ProtocolVersion::V_2024_11_05,
                capabilities: ServerCapabilities::builder()
                    .enable_tools()
                    .enable_tool_list_changed()
                    .build(),
                server_info,
                instructions: None,
            })
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        let this = self.clone();
        async move {
            let Some(surface) = this.surface().await else {
                return Err(McpError::new(
                    ErrorCode(-32600),
                    "Session not initialized".to_string(),
                    None,
                ));
            };
            let tools = surface
                .current()
                .iter()
                .map(|descriptor| descriptor.to_mcp_tool())
                .collect();
            Ok(ListToolsResult {
                tools,
                next_cursor: None,
                ..Default::default()
            })
        }
    }

    fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<CallToolResult, McpError>> + Send + '_ {
        let this = self.clone();
        let tool_name = request.name.to_string();
        let arguments = request.arguments.unwrap_or_default();

        async move {
            let Some(surface) = this.surface().await else {
                return Err(McpError::new(
                    ErrorCode(-32600),
                    "Session not initialized".to_string(),
                    None,
                ));
            };

            if let Some(descriptor) = surface
                .current()
                .iter()
                .find(|d| d.name.as_str() == tool_name)
            {
                if let Err(e) = check_required_arguments(&descriptor.input_schema, &arguments) {
                    return Err(e.to_mcp_error());
                }
            }

            surface
                .call_tool(&tool_name, arguments)
                .await
                .map_err(|e| e.to_mcp_error())
        }
    }

    fn on_cancelled(
        &self,
        _notification: CancelledNotificationParam,
        _context: NotificationContext<RoleServer>,
    ) -> impl Future<Output = ()> + Send + '_ {
        std::future::ready(())
    }

    fn on_initialized(
        &self,
        _context: NotificationContext<RoleServer>,
    ) -> impl Future<Output = ()> + Send + '_ {
        std::future::ready(())
    }

    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_tool_list_changed()
                .build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Runtime agent bridging MCP clients to workspace tool servers over a message bus."
                    .to_string(),
            ),
        }
    }
}

/// Forward surface changes to the client as `tools/list_changed`
/// notifications, in the order the surface produced them. The task ends with
/// the session.
fn spawn_notify_pump(surface: &SkillSurface, peer: Peer<RoleServer>) -> JoinHandle<()> {
    let mut rx = surface.subscribe();
    tokio::spawn(async move {
        // The value present at spawn time is the initial list, already
        // visible through initialize; only later changes are announced.
        rx.mark_unchanged();
        loop {
            if rx.changed().await.is_err() {
                break;
            }
            if peer.notify_tool_list_changed().await.is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts_with(
        headers: &[(&str, &str)],
        uri: &str,
    ) -> HttpParts {
        let mut builder = ::http::Request::builder().uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = builder.body(()).unwrap();
        request.into_parts().0
    }

    #[test]
    fn test_credentials_skill_key_header() {
        let parts = parts_with(&[("skill_key", "sk-1")], "/mcp");
        match session_credentials_from_parts(&parts) {
            Some(SessionCredentials::SkillKey { key }) => assert_eq!(key, "sk-1"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_credentials_workspace_pair() {
        let parts = parts_with(
            &[("workspace_key", "wk-1"), ("skill_name", "reviewer")],
            "/mcp",
        );
        match session_credentials_from_parts(&parts) {
            Some(SessionCredentials::WorkspaceKey { key, skill_name }) => {
                assert_eq!(key, "wk-1");
                assert_eq!(skill_name, "reviewer");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_credentials_workspace_key_without_name_is_not_enough() {
        let parts = parts_with(&[("workspace_key", "wk-1")], "/mcp");
        assert!(session_credentials_from_parts(&parts).is_none());
    }

    #[test]
    fn test_credentials_query_fallback() {
        let parts = parts_with(&[], "/sse?key=sk-9");
        match session_credentials_from_parts(&parts) {
            Some(SessionCredentials::QueryKey { key }) => assert_eq!(key, "sk-9"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_credentials_header_beats_query() {
        let parts = parts_with(&[("skill_key", "header-key")], "/sse?key=query-key");
        match session_credentials_from_parts(&parts) {
            Some(SessionCredentials::SkillKey { key }) => assert_eq!(key, "header-key"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_required_arguments_check() {
        let schema: serde_json::Map<String, serde_json::Value> =
            serde_json::from_value(serde_json::json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            }))
            .unwrap();

        let mut arguments = serde_json::Map::new();
        assert!(check_required_arguments(&schema, &arguments).is_err());

        arguments.insert("path".to_string(), serde_json::json!("/tmp"));
        assert!(check_required_arguments(&schema, &arguments).is_ok());
    }

    #[test]
    fn test_required_arguments_absent_required_block() {
        let schema: serde_json::Map<String, serde_json::Value> =
            serde_json::from_value(serde_json::json!({"type": "object"})).unwrap();
        assert!(check_required_arguments(&schema, &serde_json::Map::new()).is_ok());
    }
}
