//! Self-describing envelopes for bus messages.
//!
//! Every payload on the bus is a JSON object tagged by a `type` string;
//! deserialization dispatches on it. Unknown types are dropped with a
//! warning so old runtimes tolerate newer control planes.

use crate::config::{IdentityNature, PeerToolConfig, SmartSkillConfig, ToolServerConfig};
use crate::types::{CallId, IdentityId, ToolName, WorkspaceId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// Maximum relay depth for cross-runtime tool calls. A request observed at
/// a hop beyond this is rejected, which breaks A→B→A advertisement cycles.
pub const MAX_CALL_HOPS: u8 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    /// Startup or session handshake: credential → identity.
    ConnectRequest(ConnectRequest),
    /// Successful handshake reply.
    ConnectAck(ConnectAck),
    /// Rejected handshake reply.
    ConnectReject(ConnectReject),
    /// Control-plane order to drop the identity and re-authenticate.
    RuntimeReconnect(RuntimeReconnect),
    /// New version of the declarative tool configuration.
    ToolsConfigUpdate(ToolsConfigUpdate),
    /// Tool call relayed to the runtime owning the worker.
    ToolCallRequest(ToolCallRequest),
    /// Reply to a relayed tool call.
    ToolCallReply(ToolCallReply),
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode an envelope, dropping unknown `type` tags with a warning.
    /// Malformed payloads (no `type`, bad JSON, field mismatch) are errors.
    pub fn decode(bytes: &[u8]) -> Result<Option<Envelope>, serde_json::Error> {
        let value: Value = serde_json::from_slice(bytes)?;
        let tag = value.get("type").and_then(Value::as_str);
        match tag {
            Some(tag) if Self::knows(tag) => serde_json::from_value(value).map(Some),
            Some(tag) => {
                warn!(r#type = tag, "dropping envelope with unknown type");
                Ok(None)
            }
            None => {
                warn!("dropping untagged bus payload");
                Ok(None)
            }
        }
    }

    fn knows(tag: &str) -> bool {
        matches!(
            tag,
            "connect-request"
                | "connect-ack"
                | "connect-reject"
                | "runtime-reconnect"
                | "tools-config-update"
                | "tool-call-request"
                | "tool-call-reply"
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    /// Credential discriminant (`system-key`, `workspace-key`, ...).
    pub credential_kind: String,
    pub credential: String,
    #[serde(default)]
    pub name: Option<String>,
    pub pid: u32,
    pub hostname: String,
    #[serde(rename = "hostIP")]
    pub host_ip: String,
    #[serde(default)]
    pub workspace_hint: Option<WorkspaceId>,
    pub nature: IdentityNature,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectAck {
    pub id: IdentityId,
    pub workspace_id: WorkspaceId,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectReject {
    pub reason: String,
    pub recoverable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeReconnect {
    pub runtime_id: IdentityId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsConfigUpdate {
    /// Monotonic version of the configuration document.
    pub version: u64,
    #[serde(default)]
    pub tool_servers: Vec<ToolServerConfig>,
    #[serde(default)]
    pub smart_skills: Vec<SmartSkillConfig>,
    /// Tools owned by workers on other runtimes, callable via relay.
    #[serde(default)]
    pub peer_tools: Vec<PeerToolConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRequest {
    pub call_id: CallId,
    pub tool_name: ToolName,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    pub caller_id: IdentityId,
    /// Relay depth. Stamped 0 by the originator, incremented per relay.
    #[serde(default)]
    pub hop: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallReply {
    pub call_id: CallId,
    /// Serialized MCP content array.
    #[serde(default)]
    pub content: Value,
    pub is_error: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_connect_request() {
        let env = Envelope::ConnectRequest(ConnectRequest {
            credential_kind: "runtime-key".to_string(),
            credential: "rk-123".to_string(),
            name: Some("edge-1".to_string()),
            pid: 42,
            hostname: "host-a".to_string(),
            host_ip: "10.0.0.5".to_string(),
            workspace_hint: None,
            nature: IdentityNature::Runtime,
        });
        let bytes = env.encode().unwrap();
        let decoded = Envelope::decode(&bytes).unwrap().unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_tag_is_kebab_case() {
        let env = Envelope::ConnectReject(ConnectReject {
            reason: "bad key".to_string(),
            recoverable: false,
        });
        let value: Value = serde_json::from_slice(&env.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "connect-reject");
        assert_eq!(value["recoverable"], false);
    }

    #[test]
    fn test_unknown_type_dropped() {
        let bytes = br#"{"type":"telemetry-batch","points":[]}"#;
        assert_eq!(Envelope::decode(bytes).unwrap(), None);
    }

    #[test]
    fn test_untagged_payload_dropped() {
        let bytes = br#"{"hello":"world"}"#;
        assert_eq!(Envelope::decode(bytes).unwrap(), None);
    }

    #[test]
    fn test_malformed_json_is_error() {
        assert!(Envelope::decode(b"{nope").is_err());
    }

    #[test]
    fn test_known_type_with_bad_fields_is_error() {
        let bytes = br#"{"type":"connect-ack"}"#;
        assert!(Envelope::decode(bytes).is_err());
    }

    #[test]
    fn test_tool_call_request_hop_defaults_to_zero() {
        let bytes = br#"{
            "type": "tool-call-request",
            "callId": "c-1",
            "toolName": "list_directory",
            "arguments": {"path": "/tmp"},
            "callerId": "rt-2"
        }"#;
        let decoded = Envelope::decode(bytes).unwrap().unwrap();
        match decoded {
            Envelope::ToolCallRequest(req) => {
                assert_eq!(req.hop, 0);
                assert_eq!(req.tool_name.as_str(), "list_directory");
            }
            other => panic!("expected tool-call-request, got {:?}", other),
        }
    }

    #[test]
    fn test_tools_config_update_wire_shape() {
        let bytes = br#"{
            "type": "tools-config-update",
            "version": 7,
            "toolServers": [{
                "name": "filesystem",
                "transport": "STDIO",
                "command": "npx",
                "args": ["-y", "@example/server-filesystem", "/tmp"],
                "runOn": "EDGE"
            }]
        }"#;
        let decoded = Envelope::decode(bytes).unwrap().unwrap();
        match decoded {
            Envelope::ToolsConfigUpdate(update) => {
                assert_eq!(update.version, 7);
                assert_eq!(update.tool_servers.len(), 1);
                assert!(update.smart_skills.is_empty());
            }
            other => panic!("expected tools-config-update, got {:?}", other),
        }
    }
}
