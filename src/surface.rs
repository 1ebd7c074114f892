//! Per-session skill surfaces.
//!
//! A surface is the projection of "what tools are available to this client".
//! It rebuilds its descriptor list when the local tool service changes or
//! when a skill-scoped configuration update arrives over the bus, and
//! signals its session so a `tools/list_changed` notification can be pushed.
//! In standalone mode there is no tool service and the surface lists only
//! peer tools, relaying every call over the bus.

use crate::auth::Identity;
use crate::error::AgentError;
use crate::messaging::{BusClient, Envelope, subjects};
use crate::tools::{OriginKind, ToolDescriptor, ToolService, relay_peer_call};
use crate::types::IdentityId;
use rmcp::model::CallToolResult;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long the first population waits for a configuration signal before
/// falling back to the current snapshot, so `initialize` cannot hang on a
/// quiet bus.
const FIRST_LIST_GRACE: Duration = Duration::from_secs(1);

/// Deterministic duplicate handling: names are unique per surface, and when
/// two origins advertise the same name the lexicographically smaller
/// `origin_ref` wins. Collisions are logged.
pub fn dedupe_descriptors(mut all: Vec<ToolDescriptor>) -> Vec<ToolDescriptor> {
    all.sort_by(|a, b| {
        a.name
            .cmp(&b.name)
            .then_with(|| a.origin.origin_ref.cmp(&b.origin.origin_ref))
    });
    let mut out: Vec<ToolDescriptor> = Vec::with_capacity(all.len());
    for descriptor in all {
        match out.last() {
            Some(kept) if kept.name == descriptor.name => {
                warn!(
                    tool = %descriptor.name,
                    kept = %kept.origin.origin_ref,
                    dropped = %descriptor.origin.origin_ref,
                    "duplicate tool name on surface"
                );
            }
            _ => out.push(descriptor),
        }
    }
    out
}

pub struct SkillSurface {
    identity: Identity,
    bus: BusClient,
    tool_service: Option<Arc<ToolService>>,
    /// `None` until the first population; sessions gate `initialize` on it.
    tools: watch::Sender<Option<Vec<ToolDescriptor>>>,
    shutdown: CancellationToken,
}

impl SkillSurface {
    /// Create the surface and start its rebuild task.
    pub fn spawn(
        identity: Identity,
        bus: BusClient,
        tool_service: Option<Arc<ToolService>>,
    ) -> Arc<Self> {
        let (tools, _) = watch::channel(None);
        let surface = Arc::new(Self {
            identity,
            bus,
            tool_service,
            tools,
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(surface.clone().run());
        surface
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Stop the rebuild task and drop the bus subscription. Called when the
    /// session closes; the surface never outlives its session.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Stream of list versions. `None` → not yet populated.
    pub fn subscribe(&self) -> watch::Receiver<Option<Vec<ToolDescriptor>>> {
        self.tools.subscribe()
    }

    /// Block until the first tool list exists.
    pub async fn wait_ready(&self) {
        let mut rx = self.tools.subscribe();
        while rx.borrow().is_none() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// The current descriptor list (empty if not yet populated).
    pub fn current(&self) -> Vec<ToolDescriptor> {
        self.tools.borrow().clone().unwrap_or_default()
    }

    /// Route a call for this session.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<CallToolResult, AgentError> {
        if let Some(tool_service) = &self.tool_service {
            return tool_service
                .call_tool(name, arguments, &self.identity.id, 0)
                .await;
        }

        // Standalone: resolve against the surface's own list; everything is
        // a peer relay.
        let owner = self
            .current()
            .into_iter()
            .find(|d| d.name.as_str() == name)
            .ok_or_else(|| AgentError::ToolNotFound(name.to_string()))
            .and_then(|d| match d.origin.kind {
                OriginKind::PeerRuntime => Ok(IdentityId::new(d.origin.origin_ref)),
                _ => Err(AgentError::ToolServerUnavailable(name.to_string())),
            })?;

        relay_peer_call(&self.bus, &owner, &self.identity.id, name, arguments, 1).await
    }

    async fn run(self: Arc<Self>) {
        let subject = subjects::skill_tools_config(&self.identity.id);
        let mut skill_sub = match self.bus.subscribe(subject).await {
            Ok(sub) => Some(sub),
            Err(e) => {
                warn!(error = %e, "surface could not subscribe to its config stream");
                None
            }
        };

        let mut local_rx = self.tool_service.as_ref().map(|ts| ts.subscribe_changes());
        let mut bus_peers: Vec<ToolDescriptor> = Vec::new();

        // First population: wait for a signal, then fall back to whatever is
        // known so initialize() cannot block indefinitely.
        let grace = tokio::time::sleep(FIRST_LIST_GRACE);
        tokio::pin!(grace);
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = &mut grace => {}
            changed = wait_local(&mut local_rx), if local_rx.is_some() => {
                let _ = changed;
            }
            inbound = wait_bus(&mut skill_sub), if skill_sub.is_some() => {
                if let Some(update) = inbound {
                    bus_peers = peer_descriptors(&update, &self.identity.id);
                }
            }
        }
        self.publish(&bus_peers).await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                changed = wait_local(&mut local_rx), if local_rx.is_some() => {
                    if changed.is_err() {
                        break;
                    }
                    self.publish(&bus_peers).await;
                }
                inbound = wait_bus(&mut skill_sub), if skill_sub.is_some() => {
                    match inbound {
                        Some(update) => {
                            bus_peers = peer_descriptors(&update, &self.identity.id);
                            self.publish(&bus_peers).await;
                        }
                        None => {
                            skill_sub = None;
                            if local_rx.is_none() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        if let Some(sub) = skill_sub {
            sub.unsubscribe().await;
        }
        debug!(skill = %self.identity.id, "surface task ended");
    }

    async fn publish(&self, bus_peers: &[ToolDescriptor]) {
        let mut all = match &self.tool_service {
            Some(ts) => ts.descriptors().await,
            None => Vec::new(),
        };
        all.extend(bus_peers.iter().cloned());
        let deduped = dedupe_descriptors(all);

        self.tools.send_if_modified(|current| {
            if current.as_deref() == Some(deduped.as_slice()) {
                false
            } else {
                *current = Some(deduped);
                true
            }
        });
    }
}

async fn wait_local(
    rx: &mut Option<watch::Receiver<u64>>,
) -> Result<(), watch::error::RecvError> {
    match rx {
        Some(rx) => rx.changed().await,
        // Unreachable: guarded by `if local_rx.is_some()`.
        None => std::future::pending().await,
    }
}

async fn wait_bus(
    sub: &mut Option<crate::messaging::EnvelopeStream>,
) -> Option<crate::messaging::ToolsConfigUpdate> {
    match sub {
        Some(sub) => loop {
            match sub.next().await {
                Some(inbound) => {
                    if let Envelope::ToolsConfigUpdate(update) = inbound.envelope {
                        return Some(update);
                    }
                }
                None => return None,
            }
        },
        // Unreachable: guarded by `if skill_sub.is_some()`.
        None => std::future::pending().await,
    }
}

fn peer_descriptors(
    update: &crate::messaging::ToolsConfigUpdate,
    own_id: &IdentityId,
) -> Vec<ToolDescriptor> {
    update
        .peer_tools
        .iter()
        .filter(|peer| &peer.owner_runtime != own_id)
        .map(ToolDescriptor::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolOrigin;
    use crate::types::ToolName;

    fn descriptor(name: &str, origin_ref: &str, kind: OriginKind) -> ToolDescriptor {
        ToolDescriptor {
            name: ToolName::new(name),
            description: String::new(),
            input_schema: Map::new(),
            annotations: None,
            origin: ToolOrigin {
                kind,
                origin_ref: origin_ref.to_string(),
            },
        }
    }

    #[test]
    fn test_dedupe_keeps_unique_names() {
        let list = dedupe_descriptors(vec![
            descriptor("a", "s1", OriginKind::McpServer),
            descriptor("b", "s2", OriginKind::McpServer),
        ]);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_dedupe_collision_smaller_origin_wins() {
        let list = dedupe_descriptors(vec![
            descriptor("search", "zeta", OriginKind::PeerRuntime),
            descriptor("search", "alpha", OriginKind::McpServer),
        ]);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].origin.origin_ref, "alpha");
    }

    #[test]
    fn test_dedupe_is_sorted_by_name() {
        let list = dedupe_descriptors(vec![
            descriptor("zebra", "s", OriginKind::McpServer),
            descriptor("apple", "s", OriginKind::McpServer),
        ]);
        let names: Vec<_> = list.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["apple", "zebra"]);
    }

    #[test]
    fn test_peer_descriptors_skip_own_tools() {
        let update = crate::messaging::ToolsConfigUpdate {
            version: 1,
            tool_servers: vec![],
            smart_skills: vec![],
            peer_tools: vec![
                crate::config::PeerToolConfig {
                    name: "mine".to_string(),
                    description: String::new(),
                    input_schema: Map::new(),
                    annotations: None,
                    owner_runtime: IdentityId::new("me"),
                },
                crate::config::PeerToolConfig {
                    name: "theirs".to_string(),
                    description: String::new(),
                    input_schema: Map::new(),
                    annotations: None,
                    owner_runtime: IdentityId::new("them"),
                },
            ],
        };
        let peers = peer_descriptors(&update, &IdentityId::new("me"));
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].name.as_str(), "theirs");
    }
}
