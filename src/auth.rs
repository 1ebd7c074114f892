//! Identity acquisition against the bus.
//!
//! Turns the startup credential into a durable [`Identity`] via the connect
//! handshake, and performs the equivalent per-session handshake for inbound
//! MCP sessions authenticating with headers.

use crate::cache::{CacheBucket, CacheService};
use crate::config::{Credential, IdentityNature};
use crate::error::AgentError;
use crate::messaging::{BusClient, BusRequestError, ConnectRequest, Envelope, subjects};
use crate::types::{IdentityId, WorkspaceId};
use serde::{Deserialize, Serialize};
use std::net::UdpSocket;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// A bus-issued identity. Exclusively owned by the auth service; every other
/// component holds read-only `Arc` copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: IdentityId,
    pub nature: IdentityNature,
    pub workspace_id: WorkspaceId,
    pub name: String,
    pub hostname: String,
    pub process_id: u32,
    #[serde(rename = "hostIP")]
    pub host_ip: String,
}

/// How an inbound MCP session authenticates (§ wire protocol): a workspace
/// key paired with a skill name, a skill key, or the query-string fallback.
#[derive(Clone)]
pub enum SessionCredentials {
    WorkspaceKey { key: String, skill_name: String },
    SkillKey { key: String },
    QueryKey { key: String },
}

impl SessionCredentials {
    fn kind(&self) -> &'static str {
        match self {
            SessionCredentials::WorkspaceKey { .. } => "workspace-key",
            SessionCredentials::SkillKey { .. } => "skill-key",
            SessionCredentials::QueryKey { .. } => "skill-key",
        }
    }

    fn key(&self) -> &str {
        match self {
            SessionCredentials::WorkspaceKey { key, .. }
            | SessionCredentials::SkillKey { key }
            | SessionCredentials::QueryKey { key } => key,
        }
    }

    fn name(&self) -> Option<&str> {
        match self {
            SessionCredentials::WorkspaceKey { skill_name, .. } => Some(skill_name),
            _ => None,
        }
    }
}

impl std::fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionCredentials({})", self.kind())
    }
}

/// Pending-handshake marker kept in the ephemeral bucket so the control
/// plane can observe in-flight connects.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PendingConnect<'a> {
    nature: IdentityNature,
    hostname: &'a str,
    pid: u32,
}

pub struct AuthService {
    bus: BusClient,
    cache: RwLock<Option<Arc<CacheService>>>,
    credential: Option<Credential>,
    identity: RwLock<Option<Arc<Identity>>>,
}

impl AuthService {
    pub fn new(bus: BusClient, credential: Option<Credential>) -> Self {
        Self {
            bus,
            cache: RwLock::new(None),
            credential,
            identity: RwLock::new(None),
        }
    }

    /// Wire the cache once it exists; the handshake works without it.
    pub fn set_cache(&self, cache: Arc<CacheService>) {
        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = Some(cache);
    }

    /// Read-only copy of the current identity.
    pub fn identity(&self) -> Option<Arc<Identity>> {
        self.identity
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Drop the identity. The control plane forces this with a
    /// `runtime-reconnect` publish; the coordinator then re-runs `connect`.
    pub fn clear(&self) {
        let mut guard = self.identity.write().unwrap_or_else(|e| e.into_inner());
        if guard.take().is_some() {
            info!("identity cleared, re-authentication required");
        }
    }

    /// Perform the startup handshake with the configured credential.
    pub async fn connect(&self) -> Result<Arc<Identity>, AgentError> {
        let credential = self.credential.as_ref().ok_or_else(|| {
            AgentError::TransientAuthFailure("no startup credential configured".to_string())
        })?;

        let identity = self
            .handshake(
                credential.kind(),
                credential.key(),
                credential.name().map(str::to_string),
                credential.nature(),
                None,
            )
            .await?;

        let identity = Arc::new(identity);
        *self.identity.write().unwrap_or_else(|e| e.into_inner()) = Some(identity.clone());
        info!(
            id = %identity.id,
            workspace = %identity.workspace_id,
            name = %identity.name,
            "authenticated"
        );
        Ok(identity)
    }

    /// Handshake for one inbound MCP session. Returns the skill identity the
    /// session's surface is built around; nothing is stored on the service.
    pub async fn authenticate_session(
        &self,
        credentials: &SessionCredentials,
    ) -> Result<Identity, AgentError> {
        let workspace_hint = self.identity().map(|i| i.workspace_id.clone());
        self.handshake(
            credentials.kind(),
            credentials.key(),
            credentials.name().map(str::to_string),
            IdentityNature::Skill,
            workspace_hint,
        )
        .await
    }

    async fn handshake(
        &self,
        credential_kind: &str,
        credential: &str,
        name: Option<String>,
        nature: IdentityNature,
        workspace_hint: Option<WorkspaceId>,
    ) -> Result<Identity, AgentError> {
        let hostname = local_hostname();
        let pid = std::process::id();
        let nonce = uuid::Uuid::new_v4().to_string();

        let cache = self
            .cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(cache) = &cache {
            let pending = PendingConnect {
                nature,
                hostname: &hostname,
                pid,
            };
            if let Err(e) = cache.put(CacheBucket::Ephemeral, &nonce, &pending).await {
                debug!(error = %e, "could not record pending handshake");
            }
        }

        let request = Envelope::ConnectRequest(ConnectRequest {
            credential_kind: credential_kind.to_string(),
            credential: credential.to_string(),
            name,
            pid,
            hostname,
            host_ip: local_ip(),
            workspace_hint,
            nature,
        });

        let reply = self
            .bus
            .request(subjects::runtime_connect(), &request, None)
            .await;

        if let Some(cache) = &cache {
            let _ = cache.delete(CacheBucket::Ephemeral, &nonce).await;
        }

        let reply = reply.map_err(|e| match e {
            BusRequestError::TimedOut(d) => {
                AgentError::BusUnavailable(format!("connect handshake timed out after {:?}", d))
            }
            BusRequestError::Failed(msg) => {
                AgentError::BusUnavailable(format!("connect handshake failed: {msg}"))
            }
        })?;

        match reply {
            Envelope::ConnectAck(ack) => Ok(Identity {
                id: ack.id,
                nature,
                workspace_id: ack.workspace_id,
                name: ack.name.unwrap_or_default(),
                hostname: local_hostname(),
                process_id: pid,
                host_ip: local_ip(),
            }),
            Envelope::ConnectReject(reject) => {
                warn!(reason = %reject.reason, recoverable = reject.recoverable, "connect rejected");
                if reject.recoverable {
                    Err(AgentError::TransientAuthFailure(reject.reason))
                } else {
                    Err(AgentError::PermanentAuthFailure(reject.reason))
                }
            }
            other => Err(AgentError::TransientAuthFailure(format!(
                "unexpected handshake reply: {:?}",
                other
            ))),
        }
    }
}

fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Best-effort local address, resolved by routing (no packet is sent).
fn local_ip() -> String {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:53")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_credentials_kinds() {
        let ws = SessionCredentials::WorkspaceKey {
            key: "wk".into(),
            skill_name: "reviewer".into(),
        };
        assert_eq!(ws.kind(), "workspace-key");
        assert_eq!(ws.name(), Some("reviewer"));

        let sk = SessionCredentials::SkillKey { key: "sk".into() };
        assert_eq!(sk.kind(), "skill-key");
        assert_eq!(sk.name(), None);

        // The query fallback is just another way of passing a skill key.
        let q = SessionCredentials::QueryKey { key: "sk".into() };
        assert_eq!(q.kind(), "skill-key");
    }

    #[test]
    fn test_session_credentials_debug_redacts_key() {
        let sk = SessionCredentials::SkillKey {
            key: "super-secret".into(),
        };
        assert!(!format!("{:?}", sk).contains("super-secret"));
    }

    #[test]
    fn test_identity_wire_format() {
        let identity = Identity {
            id: IdentityId::new("rt-1"),
            nature: IdentityNature::Runtime,
            workspace_id: WorkspaceId::new("ws-1"),
            name: "edge-1".into(),
            hostname: "host-a".into(),
            process_id: 7,
            host_ip: "10.0.0.5".into(),
        };
        let value = serde_json::to_value(&identity).unwrap();
        assert_eq!(value["nature"], "runtime");
        assert_eq!(value["workspaceId"], "ws-1");
        assert_eq!(value["hostIP"], "10.0.0.5");
    }

    #[test]
    fn test_local_ip_is_parseable() {
        let ip = local_ip();
        assert!(ip.parse::<std::net::IpAddr>().is_ok());
    }
}
