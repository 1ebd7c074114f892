//! Error taxonomy for the runtime agent.
//!
//! Every error that crosses a boundary is one of these kinds. Errors crossing
//! a session boundary are normalized to JSON-RPC error envelopes; errors
//! crossing the process boundary during startup become exit-code-bearing log
//! lines; everything else recovers via the coordinator's reconnect loop.

use rmcp::ErrorData as McpError;
use rmcp::model::ErrorCode;
use std::time::Duration;
use thiserror::Error;

/// Process exit code for a clean shutdown.
pub const EXIT_OK: i32 = 0;
/// Process exit code for a startup configuration error.
pub const EXIT_CONFIG: i32 = 1;
/// Process exit code for a permanent authentication failure.
pub const EXIT_AUTH: i32 = 2;
/// Process exit code for any other fatal error.
pub const EXIT_FATAL: i32 = 3;

#[derive(Debug, Error)]
pub enum AgentError {
    /// Environment parsing rejected the variable combination. The message
    /// names the conflicting variables.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The bus rejected the credential and marked the rejection
    /// unrecoverable. The process must exit rather than retry.
    #[error("permanent authentication failure: {0}")]
    PermanentAuthFailure(String),

    /// The bus rejected the credential but the rejection is recoverable
    /// (e.g. the control plane has not provisioned the identity yet).
    #[error("transient authentication failure: {0}")]
    TransientAuthFailure(String),

    /// The broker connection could not be established or was lost in a way
    /// the broker client did not absorb.
    #[error("bus unavailable: {0}")]
    BusUnavailable(String),

    /// An HTTP request referenced a session id that is not in the session
    /// map.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// A session id contained bytes outside visible ASCII (0x21-0x7E).
    #[error("invalid session id format")]
    InvalidSessionId,

    /// A non-localhost Origin was not in the allow-list.
    #[error("origin rejected: {0}")]
    OriginRejected(String),

    /// The `mcp-protocol-version` header named a version outside the
    /// supported set.
    #[error("unsupported protocol version: {0}")]
    ProtocolVersionUnsupported(String),

    /// A tool call named a tool absent from the session's surface. Resolved
    /// locally; the bus is never contacted for these.
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// The worker owning the tool is in the FAILED state.
    #[error("tool server unavailable: {0}")]
    ToolServerUnavailable(String),

    /// A dispatched tool call did not complete within its deadline.
    #[error("tool call timed out after {0:?}")]
    ToolCallTimedOut(Duration),

    /// The transport under a dispatched call failed.
    #[error("tool call failed: {0}")]
    ToolCallFailed(String),

    /// Inbound MCP request arguments failed validation.
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
}

impl AgentError {
    /// Exit code when this error terminates the process.
    pub fn exit_code(&self) -> i32 {
        match self {
            AgentError::ConfigInvalid(_) => EXIT_CONFIG,
            AgentError::PermanentAuthFailure(_) => EXIT_AUTH,
            _ => EXIT_FATAL,
        }
    }

    /// Whether the coordinator's reconnect loop can recover from this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            AgentError::ConfigInvalid(_) | AgentError::PermanentAuthFailure(_)
        )
    }

    /// HTTP status for errors surfaced by the HTTP transports.
    pub fn http_status(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            AgentError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            AgentError::InvalidSessionId => StatusCode::BAD_REQUEST,
            AgentError::ProtocolVersionUnsupported(_) => StatusCode::BAD_REQUEST,
            AgentError::OriginRejected(_) => StatusCode::FORBIDDEN,
            AgentError::PermanentAuthFailure(_) | AgentError::TransientAuthFailure(_) => {
                StatusCode::UNAUTHORIZED
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// JSON-RPC error envelope for errors crossing a session boundary.
    pub fn to_mcp_error(&self) -> McpError {
        match self {
            AgentError::ToolNotFound(name) => McpError::new(
                ErrorCode(-32601),
                format!("Tool not found: {}", name),
                None,
            ),
            AgentError::SchemaValidation(msg) => {
                McpError::new(ErrorCode(-32602), format!("Invalid params: {}", msg), None)
            }
            AgentError::PermanentAuthFailure(msg) | AgentError::TransientAuthFailure(msg) => {
                McpError::new(
                    ErrorCode(-32001),
                    format!("Authentication failed: {}", msg),
                    None,
                )
            }
            other => McpError::new(ErrorCode(-32603), other.to_string(), None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(AgentError::ConfigInvalid("x".into()).exit_code(), 1);
        assert_eq!(AgentError::PermanentAuthFailure("x".into()).exit_code(), 2);
        assert_eq!(AgentError::BusUnavailable("x".into()).exit_code(), 3);
        assert_eq!(
            AgentError::ToolCallTimedOut(Duration::from_secs(60)).exit_code(),
            3
        );
    }

    #[test]
    fn test_recoverability() {
        assert!(!AgentError::ConfigInvalid("x".into()).is_recoverable());
        assert!(!AgentError::PermanentAuthFailure("x".into()).is_recoverable());
        assert!(AgentError::TransientAuthFailure("x".into()).is_recoverable());
        assert!(AgentError::BusUnavailable("x".into()).is_recoverable());
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(
            AgentError::SessionNotFound("s".into()).http_status(),
            http::StatusCode::NOT_FOUND
        );
        assert_eq!(
            AgentError::InvalidSessionId.http_status(),
            http::StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AgentError::OriginRejected("http://evil".into()).http_status(),
            http::StatusCode::FORBIDDEN
        );
        assert_eq!(
            AgentError::ProtocolVersionUnsupported("1999-01-01".into()).http_status(),
            http::StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_rpc_mapping_tool_not_found_is_method_not_found() {
        let err = AgentError::ToolNotFound("no_such_tool".into()).to_mcp_error();
        assert_eq!(err.code, ErrorCode(-32601));
        assert!(err.message.contains("no_such_tool"));
    }

    #[test]
    fn test_rpc_mapping_schema_is_invalid_params() {
        let err = AgentError::SchemaValidation("missing field".into()).to_mcp_error();
        assert_eq!(err.code, ErrorCode(-32602));
    }

    #[test]
    fn test_rpc_mapping_rest_is_internal() {
        let err = AgentError::ToolServerUnavailable("fs".into()).to_mcp_error();
        assert_eq!(err.code, ErrorCode(-32603));
    }
}
