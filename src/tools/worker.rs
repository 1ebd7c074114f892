//! One supervised child MCP server.
//!
//! A worker wraps a single rmcp client over the transport its config names:
//! a spawned subprocess for STDIO, an HTTP client for SSE/STREAM. The worker
//! never retries client-level errors; only the tool service restarts workers,
//! and only for transport failures.

use crate::config::{ServerTransport, ToolServerConfig};
use crate::error::AgentError;
use crate::tools::{OriginKind, ToolDescriptor, ToolOrigin, ToolServiceEvent};
use crate::types::ConfigId;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, ClientResult, ServerNotification, ServerRequest,
};
use rmcp::service::{
    NotificationContext, RequestContext, RoleClient, RunningService, Service, ServiceRole,
};
use rmcp::transport::{
    ConfigureCommandExt, SseClientTransport, StreamableHttpClientTransport, TokioChildProcess,
};
use rmcp::{ErrorData as McpError, ServiceExt};
use std::borrow::Cow;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::process::Command;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, info, warn};

/// Grace period between SIGTERM and SIGKILL for stdio children.
const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Ready,
    Failed,
    Stopping,
    Stopped,
}

type WorkerClient = RunningService<RoleClient, WorkerClientHandler>;

/// Client-side handler for the child connection. Forwards
/// `notifications/tools/list_changed` into the tool service's event queue.
#[derive(Clone)]
pub struct WorkerClientHandler {
    config_id: ConfigId,
    events: mpsc::UnboundedSender<ToolServiceEvent>,
}

impl Service<RoleClient> for WorkerClientHandler {
    async fn handle_request(
        &self,
        request: <RoleClient as ServiceRole>::PeerReq,
        _context: RequestContext<RoleClient>,
    ) -> Result<ClientResult, McpError> {
        match request {
            ServerRequest::PingRequest(_) => Ok(ClientResult::empty(())),
            other => {
                warn!(config = %self.config_id, ?other, "unsupported server-initiated request");
                Err(McpError::internal_error("unsupported server request", None))
            }
        }
    }

    async fn handle_notification(
        &self,
        notification: <RoleClient as ServiceRole>::PeerNot,
        _context: NotificationContext<RoleClient>,
    ) -> Result<(), McpError> {
        if let ServerNotification::ToolListChangedNotification(_) = notification {
            let _ = self
                .events
                .send(ToolServiceEvent::WorkerToolsChanged(self.config_id.clone()));
        }
        Ok(())
    }

    fn get_info(&self) -> <RoleClient as ServiceRole>::Info {
        Default::default()
    }
}

pub struct ToolServerWorker {
    config: ToolServerConfig,
    forward_stderr: bool,
    events: mpsc::UnboundedSender<ToolServiceEvent>,
    state: RwLock<WorkerState>,
    tools: RwLock<Vec<ToolDescriptor>>,
    client: Mutex<Option<WorkerClient>>,
    child_pid: Mutex<Option<u32>>,
}

impl ToolServerWorker {
    pub fn new(
        config: ToolServerConfig,
        forward_stderr: bool,
        events: mpsc::UnboundedSender<ToolServiceEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            forward_stderr,
            events,
            state: RwLock::new(WorkerState::Starting),
            tools: RwLock::new(Vec::new()),
            client: Mutex::new(None),
            child_pid: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ToolServerConfig {
        &self.config
    }

    pub fn config_id(&self) -> &ConfigId {
        &self.config.name
    }

    pub async fn state(&self) -> WorkerState {
        *self.state.read().await
    }

    pub async fn mark_failed(&self) {
        *self.state.write().await = WorkerState::Failed;
    }

    /// Spawn/connect the child, run the MCP handshake and cache the first
    /// tool list. STARTING → READY on success, STARTING → FAILED otherwise.
    pub async fn start(self: &Arc<Self>) -> Result<(), AgentError> {
        *self.state.write().await = WorkerState::Starting;

        let handler = WorkerClientHandler {
            config_id: self.config.name.clone(),
            events: self.events.clone(),
        };

        let connect = async {
            let client: WorkerClient = match self.config.transport {
                ServerTransport::Stdio => {
                    // validate() guarantees the command is present.
                    let command = self.config.command.clone().ok_or_else(|| {
                        AgentError::ToolCallFailed(format!(
                            "stdio worker `{}` has no command",
                            self.config.name
                        ))
                    })?;
                    let cmd = Command::new(command).configure(|cmd| {
                        cmd.args(self.config.args.iter());
                        cmd.envs(self.config.env.iter());
                    });
                    let stderr_cfg = if self.forward_stderr {
                        Stdio::piped()
                    } else {
                        Stdio::null()
                    };
                    let (transport, stderr) = TokioChildProcess::builder(cmd)
                        .stderr(stderr_cfg)
                        .spawn()
                        .map_err(|e| {
                            AgentError::ToolCallFailed(format!(
                                "spawn `{}` failed: {e}",
                                self.config.name
                            ))
                        })?;

                    *self.child_pid.lock().await = transport.id();

                    if let Some(stderr) = stderr {
                        let name = self.config.name.clone();
                        tokio::spawn(async move {
                            let mut lines = tokio::io::BufReader::new(stderr).lines();
                            while let Ok(Some(line)) = lines.next_line().await {
                                info!(worker = %name, "{line}");
                            }
                        });
                    }

                    handler.serve(transport).await.map_err(|e| {
                        AgentError::ToolCallFailed(format!(
                            "mcp handshake with `{}` failed: {e}",
                            self.config.name
                        ))
                    })?
                }
                ServerTransport::Sse => {
                    let url = self.require_url()?;
                    let transport = SseClientTransport::start(url).await.map_err(|e| {
                        AgentError::ToolCallFailed(format!(
                            "sse connect to `{}` failed: {e}",
                            self.config.name
                        ))
                    })?;
                    handler.serve(transport).await.map_err(|e| {
                        AgentError::ToolCallFailed(format!(
                            "mcp handshake with `{}` failed: {e}",
                            self.config.name
                        ))
                    })?
                }
                ServerTransport::Stream => {
                    let url = self.require_url()?;
                    let transport = StreamableHttpClientTransport::from_uri(url);
                    handler.serve(transport).await.map_err(|e| {
                        AgentError::ToolCallFailed(format!(
                            "mcp handshake with `{}` failed: {e}",
                            self.config.name
                        ))
                    })?
                }
            };

            let tools = client
                .list_tools(Default::default())
                .await
                .map_err(|e| {
                    AgentError::ToolCallFailed(format!(
                        "initial tools/list for `{}` failed: {e}",
                        self.config.name
                    ))
                })?
                .tools;

            Ok::<_, AgentError>((client, tools))
        };

        match connect.await {
            Ok((client, tools)) => {
                if tools.is_empty() {
                    warn!(worker = %self.config.name, "worker reported no tools");
                }
                *self.tools.write().await = self.to_descriptors(tools);
                *self.client.lock().await = Some(client);
                *self.state.write().await = WorkerState::Ready;
                info!(worker = %self.config.name, "worker ready");
                Ok(())
            }
            Err(e) => {
                *self.state.write().await = WorkerState::Failed;
                warn!(worker = %self.config.name, error = %e, "worker failed to start");
                Err(e)
            }
        }
    }

    fn require_url(&self) -> Result<String, AgentError> {
        self.config.url.clone().ok_or_else(|| {
            AgentError::ToolCallFailed(format!("worker `{}` has no url", self.config.name))
        })
    }

    fn to_descriptors(&self, tools: Vec<rmcp::model::Tool>) -> Vec<ToolDescriptor> {
        tools
            .into_iter()
            .map(|tool| {
                ToolDescriptor::from_mcp_tool(
                    tool,
                    ToolOrigin {
                        kind: OriginKind::McpServer,
                        origin_ref: self.config.name.as_str().to_string(),
                    },
                )
            })
            .collect()
    }

    /// Cached descriptors from the last `tools/list`.
    pub async fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.tools.read().await.clone()
    }

    /// Re-fetch the tool list after a `tools/list_changed` notification.
    pub async fn refresh_tools(&self) -> Result<(), AgentError> {
        let guard = self.client.lock().await;
        let client = guard.as_ref().ok_or_else(|| {
            AgentError::ToolServerUnavailable(self.config.name.as_str().to_string())
        })?;
        let tools = client
            .list_tools(Default::default())
            .await
            .map_err(|e| {
                AgentError::ToolCallFailed(format!(
                    "tools/list refresh for `{}` failed: {e}",
                    self.config.name
                ))
            })?
            .tools;
        drop(guard);
        *self.tools.write().await = self.to_descriptors(tools);
        debug!(worker = %self.config.name, "tool list refreshed");
        Ok(())
    }

    /// Forward one tool call. A FAILED worker answers unavailable without
    /// touching the transport.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
        timeout: Duration,
    ) -> Result<CallToolResult, AgentError> {
        if *self.state.read().await != WorkerState::Ready {
            return Err(AgentError::ToolServerUnavailable(
                self.config.name.as_str().to_string(),
            ));
        }

        let guard = self.client.lock().await;
        let client = guard.as_ref().ok_or_else(|| {
            AgentError::ToolServerUnavailable(self.config.name.as_str().to_string())
        })?;

        let request = CallToolRequestParam {
            meta: None,
            name: Cow::Owned(name.to_string()),
            arguments,
            task: None,
        };

        match tokio::time::timeout(timeout, client.call_tool(request)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(AgentError::ToolCallFailed(format!(
                "call `{name}` on `{}` failed: {e}",
                self.config.name
            ))),
            Err(_) => Err(AgentError::ToolCallTimedOut(timeout)),
        }
    }

    /// Close the MCP client; for stdio children, SIGTERM then SIGKILL after
    /// the grace period. READY → STOPPED is irreversible; a new config
    /// version gets a new worker.
    pub async fn stop(&self) {
        *self.state.write().await = WorkerState::Stopping;

        if let Some(client) = self.client.lock().await.take() {
            if let Err(e) = client.cancel().await {
                debug!(worker = %self.config.name, error = %e, "client close reported error");
            }
        }

        if let Some(pid) = self.child_pid.lock().await.take() {
            terminate_child(pid, &self.config.name).await;
        }

        *self.state.write().await = WorkerState::Stopped;
        info!(worker = %self.config.name, "worker stopped");
    }
}

async fn terminate_child(pid: u32, name: &ConfigId) {
    let pid = pid as i32;
    // SAFETY: plain kill(2) on a pid this process spawned.
    unsafe {
        if libc::kill(pid, libc::SIGTERM) != 0 {
            return; // already gone
        }
    }

    let deadline = tokio::time::Instant::now() + KILL_GRACE;
    loop {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let alive = unsafe { libc::kill(pid, 0) == 0 };
        if !alive {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(worker = %name, pid, "child ignored SIGTERM, killing");
            unsafe {
                libc::kill(pid, libc::SIGKILL);
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunScope;
    use std::collections::BTreeMap;

    fn config(transport: ServerTransport) -> ToolServerConfig {
        ToolServerConfig {
            name: ConfigId::new("w"),
            transport,
            command: None,
            args: vec![],
            env: BTreeMap::new(),
            url: None,
            run_on: RunScope::Global,
            roots: vec![],
            registry_ref: None,
        }
    }

    #[tokio::test]
    async fn test_call_on_non_ready_worker_is_unavailable() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let worker = ToolServerWorker::new(config(ServerTransport::Stdio), false, tx);
        worker.mark_failed().await;

        let err = worker
            .call_tool("anything", None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ToolServerUnavailable(_)));
    }

    #[tokio::test]
    async fn test_start_without_command_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let worker = ToolServerWorker::new(config(ServerTransport::Stdio), false, tx);
        assert!(worker.start().await.is_err());
        assert_eq!(worker.state().await, WorkerState::Failed);
    }

    #[tokio::test]
    async fn test_stop_is_terminal() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let worker = ToolServerWorker::new(config(ServerTransport::Stdio), false, tx);
        worker.stop().await;
        assert_eq!(worker.state().await, WorkerState::Stopped);

        let err = worker
            .call_tool("anything", None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ToolServerUnavailable(_)));
    }
}
