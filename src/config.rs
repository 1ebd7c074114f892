//! Startup configuration and declarative tool-server configuration.
//!
//! The agent is configured entirely through environment variables. Mode
//! detection and credential precedence live here so the process can fail
//! fast, before the bus is ever touched. Declarative [`ToolServerConfig`]
//! and [`SmartSkillConfig`] values arrive later over the bus and are also
//! defined here.

use crate::error::AgentError;
use crate::types::ConfigId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Operational mode, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    /// Single MCP session over stdin/stdout, launched by a skill credential.
    McpStdio,
    /// Tool-hosting runtime with a bus presence and no inbound MCP surface.
    Edge,
    /// Edge runtime that additionally serves MCP over HTTP.
    EdgeMcpStream,
    /// HTTP-only MCP surface with no credential of its own.
    StandaloneMcpStream,
}

impl RuntimeMode {
    /// Whether this mode runs the tool service.
    pub fn runs_tool_service(&self) -> bool {
        !matches!(self, RuntimeMode::StandaloneMcpStream)
    }

    /// Whether this mode owns the HTTP listener.
    pub fn runs_http(&self) -> bool {
        matches!(
            self,
            RuntimeMode::EdgeMcpStream | RuntimeMode::StandaloneMcpStream
        )
    }
}

impl fmt::Display for RuntimeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuntimeMode::McpStdio => "mcp-stdio",
            RuntimeMode::Edge => "edge",
            RuntimeMode::EdgeMcpStream => "edge-mcp-stream",
            RuntimeMode::StandaloneMcpStream => "standalone-mcp-stream",
        };
        write!(f, "{}", s)
    }
}

/// Whether an identity acts as a runtime or as a skill session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityNature {
    Runtime,
    Skill,
}

/// The startup credential, decided from which env variable is set.
///
/// Exactly one shape per invocation. A narrow key silently shadows
/// `SYSTEM_KEY`; two narrow keys are a fatal configuration error.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    SystemKey { key: String, runtime_name: String },
    WorkspaceKey { key: String, skill_name: String },
    RuntimeKey { key: String },
    SkillKey { key: String },
}

impl Credential {
    pub fn nature(&self) -> IdentityNature {
        match self {
            Credential::SystemKey { .. } | Credential::RuntimeKey { .. } => {
                IdentityNature::Runtime
            }
            Credential::WorkspaceKey { .. } | Credential::SkillKey { .. } => IdentityNature::Skill,
        }
    }

    /// The name the credential carries, if any.
    pub fn name(&self) -> Option<&str> {
        match self {
            Credential::SystemKey { runtime_name, .. } => Some(runtime_name),
            Credential::WorkspaceKey { skill_name, .. } => Some(skill_name),
            _ => None,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Credential::SystemKey { key, .. }
            | Credential::WorkspaceKey { key, .. }
            | Credential::RuntimeKey { key }
            | Credential::SkillKey { key } => key,
        }
    }

    /// Wire discriminant used in the connect handshake.
    pub fn kind(&self) -> &'static str {
        match self {
            Credential::SystemKey { .. } => "system-key",
            Credential::WorkspaceKey { .. } => "workspace-key",
            Credential::RuntimeKey { .. } => "runtime-key",
            Credential::SkillKey { .. } => "skill-key",
        }
    }
}

// Key material must never reach logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::SystemKey { runtime_name, .. } => f
                .debug_struct("SystemKey")
                .field("runtime_name", runtime_name)
                .finish_non_exhaustive(),
            Credential::WorkspaceKey { skill_name, .. } => f
                .debug_struct("WorkspaceKey")
                .field("skill_name", skill_name)
                .finish_non_exhaustive(),
            Credential::RuntimeKey { .. } => f.write_str("RuntimeKey(..)"),
            Credential::SkillKey { .. } => f.write_str("SkillKey(..)"),
        }
    }
}

/// Per-bucket TTLs, broker-enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketTtls {
    pub heartbeat: Duration,
    pub ephemeral: Duration,
    pub oauth_nonce: Duration,
    pub rate_limit_key: Duration,
    pub rate_limit_ip: Duration,
}

impl Default for BucketTtls {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(15),
            ephemeral: Duration::from_secs(60),
            oauth_nonce: Duration::from_secs(300),
            rate_limit_key: Duration::from_secs(300),
            rate_limit_ip: Duration::from_secs(300),
        }
    }
}

/// Everything the agent reads from the environment.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub mode: RuntimeMode,
    pub credential: Option<Credential>,
    pub remote_port: Option<u16>,
    pub nats_servers: String,
    pub nats_name: Option<String>,
    pub heartbeat_interval: Duration,
    pub ttls: BucketTtls,
    pub allowed_origins: Vec<String>,
    pub prevent_dns_rebinding: bool,
    pub forward_stderr: bool,
    pub log_level: Option<String>,
    /// Per-component overrides, `target=level` pairs.
    pub log_levels: Vec<(String, String)>,
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, AgentError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Parse from an arbitrary lookup. Tests inject maps here instead of
    /// mutating the process environment.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, AgentError> {
        let get_trimmed = |k: &str| {
            get(k)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let system_key = get_trimmed("SYSTEM_KEY");
        let workspace_key = get_trimmed("WORKSPACE_KEY");
        let skill_key = get_trimmed("SKILL_KEY");
        let runtime_key = get_trimmed("RUNTIME_KEY");
        let skill_name = get_trimmed("SKILL_NAME");
        let runtime_name = get_trimmed("RUNTIME_NAME");

        let narrow: Vec<&str> = [
            ("WORKSPACE_KEY", workspace_key.is_some()),
            ("SKILL_KEY", skill_key.is_some()),
            ("RUNTIME_KEY", runtime_key.is_some()),
        ]
        .iter()
        .filter(|(_, set)| *set)
        .map(|(name, _)| *name)
        .collect();

        if narrow.len() > 1 {
            return Err(AgentError::ConfigInvalid(format!(
                "mutually exclusive credentials set: {}",
                narrow.join(", ")
            )));
        }

        // Narrow keys shadow SYSTEM_KEY silently.
        let credential = if let Some(key) = skill_key {
            Some(Credential::SkillKey { key })
        } else if let Some(key) = runtime_key {
            Some(Credential::RuntimeKey { key })
        } else if let Some(key) = workspace_key {
            let skill_name = skill_name.ok_or_else(|| {
                AgentError::ConfigInvalid("WORKSPACE_KEY requires SKILL_NAME".to_string())
            })?;
            Some(Credential::WorkspaceKey { key, skill_name })
        } else if let Some(key) = system_key {
            let runtime_name = runtime_name.ok_or_else(|| {
                AgentError::ConfigInvalid("SYSTEM_KEY requires RUNTIME_NAME".to_string())
            })?;
            Some(Credential::SystemKey { key, runtime_name })
        } else {
            None
        };

        let remote_port = match get_trimmed("REMOTE_PORT") {
            Some(raw) => Some(raw.parse::<u16>().map_err(|_| {
                AgentError::ConfigInvalid(format!("REMOTE_PORT is not a valid port: {raw}"))
            })?),
            None => None,
        };

        let mode = match (credential.as_ref().map(Credential::nature), remote_port) {
            (Some(IdentityNature::Skill), None) => RuntimeMode::McpStdio,
            (Some(IdentityNature::Runtime), None) => RuntimeMode::Edge,
            (Some(IdentityNature::Runtime), Some(_)) => RuntimeMode::EdgeMcpStream,
            (None, Some(_)) => RuntimeMode::StandaloneMcpStream,
            (Some(IdentityNature::Skill), Some(_)) => {
                return Err(AgentError::ConfigInvalid(
                    "skill credentials (SKILL_KEY or WORKSPACE_KEY+SKILL_NAME) cannot be \
                     combined with REMOTE_PORT"
                        .to_string(),
                ));
            }
            (None, None) => {
                return Err(AgentError::ConfigInvalid(
                    "no credential and no REMOTE_PORT set; nothing to run".to_string(),
                ));
            }
        };

        let heartbeat_interval = parse_millis(&get_trimmed, "HEARTBEAT_INTERVAL")?
            .unwrap_or(Duration::from_millis(5000));

        let defaults = BucketTtls::default();
        let ttls = BucketTtls {
            heartbeat: parse_millis(&get_trimmed, "HEARTBEAT_CACHE_TTL")?
                .unwrap_or(defaults.heartbeat),
            ephemeral: parse_millis(&get_trimmed, "EPHEMERAL_CACHE_TTL")?
                .unwrap_or(defaults.ephemeral),
            oauth_nonce: parse_millis(&get_trimmed, "OAUTH_NONCE_CACHE_TTL")?
                .unwrap_or(defaults.oauth_nonce),
            rate_limit_key: parse_millis(&get_trimmed, "RATE_LIMIT_KEY_CACHE_TTL")?
                .unwrap_or(defaults.rate_limit_key),
            rate_limit_ip: parse_millis(&get_trimmed, "RATE_LIMIT_IP_CACHE_TTL")?
                .unwrap_or(defaults.rate_limit_ip),
        };

        let allowed_origins = get_trimmed("ALLOWED_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(|o| o.trim().trim_end_matches('/').to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let prevent_dns_rebinding = match get_trimmed("PREVENT_DNS_REBINDING").as_deref() {
            None => true,
            Some("true") | Some("1") => true,
            Some("false") | Some("0") => false,
            Some(other) => {
                return Err(AgentError::ConfigInvalid(format!(
                    "PREVENT_DNS_REBINDING must be true or false, got `{other}`"
                )));
            }
        };

        let forward_stderr = matches!(
            get_trimmed("FORWARD_STDERR").as_deref(),
            Some("true") | Some("1")
        );

        let log_levels = get_trimmed("LOG_LEVELS")
            .map(|raw| {
                raw.split(',')
                    .filter_map(|pair| {
                        let (target, level) = pair.split_once('=')?;
                        Some((target.trim().to_string(), level.trim().to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            mode,
            credential,
            remote_port,
            nats_servers: get_trimmed("NATS_SERVERS")
                .unwrap_or_else(|| "localhost:4222".to_string()),
            nats_name: get_trimmed("NATS_NAME"),
            heartbeat_interval,
            ttls,
            allowed_origins,
            prevent_dns_rebinding,
            forward_stderr,
            log_level: get_trimmed("LOG_LEVEL"),
            log_levels,
        })
    }
}

fn parse_millis(
    get: &impl Fn(&str) -> Option<String>,
    var: &str,
) -> Result<Option<Duration>, AgentError> {
    match get(var) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|_| {
                AgentError::ConfigInvalid(format!("{var} is not a valid millisecond count: {raw}"))
            }),
    }
}

/// Transport a tool-server child speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerTransport {
    Stdio,
    Sse,
    Stream,
}

/// Which runtimes a tool server runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunScope {
    /// Any runtime may own a worker for this config.
    Global,
    /// Only agent-capable runtimes.
    Agent,
    /// Only edge workers.
    Edge,
}

/// Declarative configuration of one child MCP server.
///
/// Immutable once published; updates arrive as new versions of the whole
/// document. The content signature decides whether a running worker must be
/// restarted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolServerConfig {
    pub name: ConfigId,
    pub transport: ServerTransport,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub url: Option<String>,
    pub run_on: RunScope,
    #[serde(default)]
    pub roots: Vec<String>,
    #[serde(default)]
    pub registry_ref: Option<String>,
}

impl ToolServerConfig {
    /// Hash of all config fields. Two configs with the same signature are
    /// interchangeable; a signature change restarts the worker.
    pub fn signature(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(format!("{:?}", self.transport).as_bytes());
        hasher.update([0u8]);
        hasher.update(self.command.as_deref().unwrap_or("").as_bytes());
        for arg in &self.args {
            hasher.update([0u8]);
            hasher.update(arg.as_bytes());
        }
        for (k, v) in &self.env {
            hasher.update([0u8]);
            hasher.update(k.as_bytes());
            hasher.update([1u8]);
            hasher.update(v.as_bytes());
        }
        hasher.update([0u8]);
        hasher.update(self.url.as_deref().unwrap_or("").as_bytes());
        hasher.update([0u8]);
        hasher.update(format!("{:?}", self.run_on).as_bytes());
        for root in &self.roots {
            hasher.update([0u8]);
            hasher.update(root.as_bytes());
        }
        hasher.update([0u8]);
        hasher.update(self.registry_ref.as_deref().unwrap_or("").as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Validate the transport/field pairing the control plane promises.
    pub fn validate(&self) -> Result<(), AgentError> {
        match self.transport {
            ServerTransport::Stdio => {
                if self.command.is_none() {
                    return Err(AgentError::ConfigInvalid(format!(
                        "tool server `{}` uses STDIO but has no command",
                        self.name
                    )));
                }
            }
            ServerTransport::Sse | ServerTransport::Stream => {
                if self.url.is_none() {
                    return Err(AgentError::ConfigInvalid(format!(
                        "tool server `{}` uses {:?} but has no url",
                        self.name, self.transport
                    )));
                }
            }
        }
        Ok(())
    }
}

/// A tool owned by a worker on another runtime, advertised through the
/// workspace configuration stream so local sessions can list it and relay
/// calls to its owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerToolConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub annotations: Option<serde_json::Value>,
    pub owner_runtime: crate::types::IdentityId,
}

/// Endpoint and credentials of the LLM provider backing a smart skill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

/// A tool whose implementation is an LLM prompt plus model configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmartSkillConfig {
    pub id: ConfigId,
    pub name: String,
    pub provider_config: ProviderConfig,
    /// `"provider/model"` string.
    pub model: String,
    pub system_prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl SmartSkillConfig {
    /// Restart signature: model, temperature, maxTokens and the first 100
    /// characters of the prompt. Prompt edits past that point do not bounce
    /// the worker.
    pub fn signature(&self) -> String {
        let prompt_head: String = self.system_prompt.chars().take(100).collect();
        let mut hasher = Sha256::new();
        hasher.update(self.model.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.temperature.to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.max_tokens.to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(prompt_head.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + '_ {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k: &str| map.get(k).cloned()
    }

    #[test]
    fn test_mode_skill_key_is_stdio() {
        let cfg = RuntimeConfig::from_lookup(lookup(&[("SKILL_KEY", "sk")])).unwrap();
        assert_eq!(cfg.mode, RuntimeMode::McpStdio);
        assert!(matches!(cfg.credential, Some(Credential::SkillKey { .. })));
    }

    #[test]
    fn test_mode_workspace_key_plus_skill_name_is_stdio() {
        let cfg = RuntimeConfig::from_lookup(lookup(&[
            ("WORKSPACE_KEY", "wk"),
            ("SKILL_NAME", "reviewer"),
        ]))
        .unwrap();
        assert_eq!(cfg.mode, RuntimeMode::McpStdio);
        assert_eq!(cfg.credential.unwrap().name(), Some("reviewer"));
    }

    #[test]
    fn test_mode_runtime_key_is_edge() {
        let cfg = RuntimeConfig::from_lookup(lookup(&[("RUNTIME_KEY", "rk")])).unwrap();
        assert_eq!(cfg.mode, RuntimeMode::Edge);
    }

    #[test]
    fn test_mode_runtime_key_plus_port_is_edge_stream() {
        let cfg = RuntimeConfig::from_lookup(lookup(&[
            ("RUNTIME_KEY", "rk"),
            ("REMOTE_PORT", "3000"),
        ]))
        .unwrap();
        assert_eq!(cfg.mode, RuntimeMode::EdgeMcpStream);
        assert_eq!(cfg.remote_port, Some(3000));
    }

    #[test]
    fn test_mode_port_only_is_standalone() {
        let cfg = RuntimeConfig::from_lookup(lookup(&[("REMOTE_PORT", "3000")])).unwrap();
        assert_eq!(cfg.mode, RuntimeMode::StandaloneMcpStream);
        assert!(cfg.credential.is_none());
    }

    #[test]
    fn test_system_key_requires_runtime_name() {
        let err = RuntimeConfig::from_lookup(lookup(&[("SYSTEM_KEY", "sys")])).unwrap_err();
        assert!(matches!(err, AgentError::ConfigInvalid(_)));
        assert!(err.to_string().contains("RUNTIME_NAME"));
    }

    #[test]
    fn test_system_key_plus_runtime_name_is_edge() {
        let cfg = RuntimeConfig::from_lookup(lookup(&[
            ("SYSTEM_KEY", "sys"),
            ("RUNTIME_NAME", "edge-1"),
        ]))
        .unwrap();
        assert_eq!(cfg.mode, RuntimeMode::Edge);
        assert_eq!(cfg.credential.unwrap().name(), Some("edge-1"));
    }

    #[test]
    fn test_narrow_key_shadows_system_key_silently() {
        let cfg = RuntimeConfig::from_lookup(lookup(&[
            ("SYSTEM_KEY", "sys"),
            ("RUNTIME_KEY", "rk"),
        ]))
        .unwrap();
        assert!(matches!(
            cfg.credential,
            Some(Credential::RuntimeKey { .. })
        ));
    }

    #[test]
    fn test_two_narrow_keys_conflict_names_both_vars() {
        let err = RuntimeConfig::from_lookup(lookup(&[
            ("SKILL_KEY", "sk"),
            ("RUNTIME_KEY", "rk"),
        ]))
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("SKILL_KEY"));
        assert!(msg.contains("RUNTIME_KEY"));
    }

    #[test]
    fn test_skill_credential_with_port_rejected() {
        let err = RuntimeConfig::from_lookup(lookup(&[
            ("SKILL_KEY", "sk"),
            ("REMOTE_PORT", "3000"),
        ]))
        .unwrap_err();
        assert!(matches!(err, AgentError::ConfigInvalid(_)));
    }

    #[test]
    fn test_empty_env_rejected() {
        let err = RuntimeConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, AgentError::ConfigInvalid(_)));
    }

    #[test]
    fn test_defaults() {
        let cfg = RuntimeConfig::from_lookup(lookup(&[("RUNTIME_KEY", "rk")])).unwrap();
        assert_eq!(cfg.nats_servers, "localhost:4222");
        assert_eq!(cfg.heartbeat_interval, Duration::from_millis(5000));
        assert!(cfg.prevent_dns_rebinding);
        assert!(!cfg.forward_stderr);
        assert!(cfg.allowed_origins.is_empty());
    }

    #[test]
    fn test_heartbeat_interval_override() {
        let cfg = RuntimeConfig::from_lookup(lookup(&[
            ("RUNTIME_KEY", "rk"),
            ("HEARTBEAT_INTERVAL", "1500"),
        ]))
        .unwrap();
        assert_eq!(cfg.heartbeat_interval, Duration::from_millis(1500));
    }

    #[test]
    fn test_bucket_ttl_override() {
        let cfg = RuntimeConfig::from_lookup(lookup(&[
            ("RUNTIME_KEY", "rk"),
            ("HEARTBEAT_CACHE_TTL", "30000"),
        ]))
        .unwrap();
        assert_eq!(cfg.ttls.heartbeat, Duration::from_secs(30));
        assert_eq!(cfg.ttls.ephemeral, BucketTtls::default().ephemeral);
    }

    #[test]
    fn test_allowed_origins_parsing() {
        let cfg = RuntimeConfig::from_lookup(lookup(&[
            ("REMOTE_PORT", "3000"),
            ("ALLOWED_ORIGINS", "https://app.example.com, https://other.example.com/"),
        ]))
        .unwrap();
        assert_eq!(
            cfg.allowed_origins,
            vec![
                "https://app.example.com".to_string(),
                "https://other.example.com".to_string()
            ]
        );
    }

    #[test]
    fn test_log_levels_parsing() {
        let cfg = RuntimeConfig::from_lookup(lookup(&[
            ("RUNTIME_KEY", "rk"),
            ("LOG_LEVELS", "toolbus::tools=debug, rmcp=warn"),
        ]))
        .unwrap();
        assert_eq!(
            cfg.log_levels,
            vec![
                ("toolbus::tools".to_string(), "debug".to_string()),
                ("rmcp".to_string(), "warn".to_string())
            ]
        );
    }

    #[test]
    fn test_invalid_port_rejected() {
        let err =
            RuntimeConfig::from_lookup(lookup(&[("REMOTE_PORT", "70000")])).unwrap_err();
        assert!(matches!(err, AgentError::ConfigInvalid(_)));
    }

    #[test]
    fn test_credential_debug_redacts_key() {
        let cred = Credential::SkillKey {
            key: "super-secret".into(),
        };
        assert!(!format!("{:?}", cred).contains("super-secret"));

        let cred = Credential::SystemKey {
            key: "super-secret".into(),
            runtime_name: "edge-1".into(),
        };
        let dbg = format!("{:?}", cred);
        assert!(!dbg.contains("super-secret"));
        assert!(dbg.contains("edge-1"));
    }

    fn stdio_config() -> ToolServerConfig {
        ToolServerConfig {
            name: ConfigId::new("filesystem"),
            transport: ServerTransport::Stdio,
            command: Some("npx".to_string()),
            args: vec![
                "-y".to_string(),
                "@example/server-filesystem".to_string(),
                "/tmp".to_string(),
            ],
            env: BTreeMap::new(),
            url: None,
            run_on: RunScope::Edge,
            roots: vec!["/tmp".to_string()],
            registry_ref: None,
        }
    }

    #[test]
    fn test_tool_server_signature_stable() {
        assert_eq!(stdio_config().signature(), stdio_config().signature());
    }

    #[test]
    fn test_tool_server_signature_changes_with_args() {
        let mut changed = stdio_config();
        changed.args.push("--readonly".to_string());
        assert_ne!(stdio_config().signature(), changed.signature());
    }

    #[test]
    fn test_tool_server_validate_stdio_needs_command() {
        let mut cfg = stdio_config();
        cfg.command = None;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_tool_server_validate_stream_needs_url() {
        let cfg = ToolServerConfig {
            name: ConfigId::new("remote"),
            transport: ServerTransport::Stream,
            command: None,
            args: vec![],
            env: BTreeMap::new(),
            url: None,
            run_on: RunScope::Global,
            roots: vec![],
            registry_ref: None,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_tool_server_config_wire_format() {
        let json = serde_json::json!({
            "name": "filesystem",
            "transport": "STDIO",
            "command": "npx",
            "args": ["-y", "@example/server-filesystem", "/tmp"],
            "runOn": "EDGE"
        });
        let cfg: ToolServerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(cfg.name.as_str(), "filesystem");
        assert_eq!(cfg.transport, ServerTransport::Stdio);
        assert_eq!(cfg.run_on, RunScope::Edge);
        assert!(cfg.roots.is_empty());
    }

    fn skill_config() -> SmartSkillConfig {
        SmartSkillConfig {
            id: ConfigId::new("summarizer"),
            name: "summarize".to_string(),
            provider_config: ProviderConfig {
                base_url: "https://api.example.com/v1".to_string(),
                api_key: None,
            },
            model: "example/large".to_string(),
            system_prompt: "Summarize the input in three bullet points.".to_string(),
            temperature: 0.2,
            max_tokens: 512,
        }
    }

    #[test]
    fn test_smart_skill_signature_ignores_prompt_tail() {
        let base = skill_config();
        let mut long = base.clone();
        long.system_prompt = "x".repeat(100);
        let mut longer = long.clone();
        longer.system_prompt.push_str("tail beyond the hundredth character");
        assert_eq!(long.signature(), longer.signature());
        assert_ne!(base.signature(), long.signature());
    }

    #[test]
    fn test_smart_skill_signature_tracks_model() {
        let base = skill_config();
        let mut changed = base.clone();
        changed.model = "example/small".to_string();
        assert_ne!(base.signature(), changed.signature());
    }
}
