//! Tool capability registry.
//!
//! The tool service reconciles the declarative configuration delivered over
//! the bus into running workers, keeps the unified descriptor list, routes
//! inbound calls to local workers or smart skills, and relays calls whose
//! target lives on a peer runtime.

pub mod smart_skill;
pub mod worker;

use crate::auth::Identity;
use crate::config::{PeerToolConfig, RunScope, SmartSkillConfig, ToolServerConfig};
use crate::coordinator::backoff_delay;
use crate::error::AgentError;
use crate::messaging::{
    BusClient, BusRequestError, Envelope, MAX_CALL_HOPS, ToolCallReply, ToolCallRequest, subjects,
};
use crate::types::{CallId, ConfigId, IdentityId, ToolName};
use rmcp::model::{CallToolResult, Content, Tool as McpTool};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use smart_skill::SmartSkillWorker;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use worker::{ToolServerWorker, WorkerState};

/// Deadline for one tool call, local or relayed.
pub const TOOL_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-worker retry backoff cap.
const RETRY_CAP: Duration = Duration::from_secs(600);

/// Transient call records kept for introspection.
const LEDGER_CAP: usize = 256;

/// Where a tool descriptor originates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OriginKind {
    McpServer,
    SmartSkill,
    PeerRuntime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOrigin {
    pub kind: OriginKind,
    /// Config id for local origins, runtime id for peers. The tie-breaker
    /// for duplicate tool names compares this field.
    pub origin_ref: String,
}

/// One advertised tool, annotated with its origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: ToolName,
    pub description: String,
    pub input_schema: Map<String, Value>,
    #[serde(default)]
    pub annotations: Option<Value>,
    pub origin: ToolOrigin,
}

impl ToolDescriptor {
    pub fn from_mcp_tool(tool: McpTool, origin: ToolOrigin) -> Self {
        Self {
            name: ToolName::new(tool.name.to_string()),
            description: tool.description.map(|d| d.to_string()).unwrap_or_default(),
            input_schema: (*tool.input_schema).clone(),
            annotations: tool
                .annotations
                .as_ref()
                .and_then(|a| serde_json::to_value(a).ok()),
            origin,
        }
    }

    pub fn to_mcp_tool(&self) -> McpTool {
        use std::borrow::Cow;

        McpTool {
            name: Cow::Owned(self.name.as_str().to_string()),
            title: None,
            description: Some(Cow::Owned(self.description.clone())),
            input_schema: Arc::new(self.input_schema.clone()),
            output_schema: None,
            annotations: self
                .annotations
                .clone()
                .and_then(|a| serde_json::from_value(a).ok()),
            icons: None,
            meta: None,
        }
    }
}

impl From<&PeerToolConfig> for ToolDescriptor {
    fn from(peer: &PeerToolConfig) -> Self {
        Self {
            name: ToolName::new(peer.name.clone()),
            description: peer.description.clone(),
            input_schema: peer.input_schema.clone(),
            annotations: peer.annotations.clone(),
            origin: ToolOrigin {
                kind: OriginKind::PeerRuntime,
                origin_ref: peer.owner_runtime.as_str().to_string(),
            },
        }
    }
}

/// What this runtime is, for `runOn` scoping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeScope {
    pub agent: bool,
    pub edge: bool,
}

impl RuntimeScope {
    pub fn matches(&self, run_on: RunScope) -> bool {
        match run_on {
            RunScope::Global => true,
            RunScope::Agent => self.agent,
            RunScope::Edge => self.edge,
        }
    }
}

/// Events consumed by the single-writer reconciliation loop.
pub enum ToolServiceEvent {
    /// New configuration document from the bus.
    ConfigUpdate(crate::messaging::ToolsConfigUpdate),
    /// A worker's child announced `tools/list_changed`.
    WorkerToolsChanged(ConfigId),
    /// A failed worker's backoff elapsed.
    RetryWorker(ConfigId),
    /// Inbound relayed call from a peer runtime.
    CallRelay(ToolCallRequest, Option<async_nats::Subject>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CallStatus {
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

/// Transient record of one tool call. Never persisted; durable history is
/// the control plane's job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    pub call_id: CallId,
    pub tool_name: ToolName,
    pub arguments: Map<String, Value>,
    pub called_by: IdentityId,
    pub target: String,
    pub status: CallStatus,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// The reconciliation decision for one configuration version.
#[derive(Debug, Default, PartialEq)]
pub struct ReconcilePlan {
    pub to_start: Vec<ConfigId>,
    pub to_restart: Vec<ConfigId>,
    pub to_stop: Vec<ConfigId>,
}

/// Diff current signatures against the desired set. Pure; the caller applies
/// the plan.
pub fn plan_reconcile(
    current: &HashMap<ConfigId, String>,
    desired: &[(ConfigId, String)],
) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();
    let desired_map: HashMap<&ConfigId, &String> =
        desired.iter().map(|(id, sig)| (id, sig)).collect();

    for (id, signature) in desired {
        match current.get(id) {
            None => plan.to_start.push(id.clone()),
            Some(existing) if existing != signature => plan.to_restart.push(id.clone()),
            Some(_) => {}
        }
    }
    for id in current.keys() {
        if !desired_map.contains_key(id) {
            plan.to_stop.push(id.clone());
        }
    }
    plan.to_start.sort();
    plan.to_restart.sort();
    plan.to_stop.sort();
    plan
}

enum ResolvedOrigin {
    Worker(ConfigId),
    Skill(ConfigId),
    Peer(IdentityId),
}

pub struct ToolService {
    bus: BusClient,
    identity: Arc<Identity>,
    scope: RuntimeScope,
    forward_stderr: bool,
    events_tx: mpsc::UnboundedSender<ToolServiceEvent>,
    workers: Mutex<HashMap<ConfigId, Arc<ToolServerWorker>>>,
    worker_signatures: Mutex<HashMap<ConfigId, String>>,
    worker_configs: Mutex<HashMap<ConfigId, ToolServerConfig>>,
    worker_failures: Mutex<HashMap<ConfigId, u32>>,
    skills: Mutex<HashMap<ConfigId, Arc<SmartSkillWorker>>>,
    peer_tools: RwLock<Vec<ToolDescriptor>>,
    index: RwLock<HashMap<ToolName, ResolvedOrigin>>,
    /// Version counter bumped on every descriptor-list mutation. Surfaces
    /// watch this to rebuild their projections.
    changed: watch::Sender<u64>,
    ledger: Mutex<VecDeque<ToolCallRecord>>,
}

impl ToolService {
    pub fn new(
        bus: BusClient,
        identity: Arc<Identity>,
        scope: RuntimeScope,
        forward_stderr: bool,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ToolServiceEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (changed, _) = watch::channel(0);
        let service = Arc::new(Self {
            bus,
            identity,
            scope,
            forward_stderr,
            events_tx,
            workers: Mutex::new(HashMap::new()),
            worker_signatures: Mutex::new(HashMap::new()),
            worker_configs: Mutex::new(HashMap::new()),
            worker_failures: Mutex::new(HashMap::new()),
            skills: Mutex::new(HashMap::new()),
            peer_tools: RwLock::new(Vec::new()),
            index: RwLock::new(HashMap::new()),
            changed,
            ledger: Mutex::new(VecDeque::new()),
        });
        (service, events_rx)
    }

    /// Version stream for surfaces: bumped whenever the unified descriptor
    /// list may have changed.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }

    /// The unified descriptor list across workers, smart skills and peers.
    pub async fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut all = Vec::new();
        {
            let workers = self.workers.lock().await;
            for worker in workers.values() {
                if worker.state().await == WorkerState::Ready {
                    all.extend(worker.list_tools().await);
                }
            }
        }
        {
            let skills = self.skills.lock().await;
            for skill in skills.values() {
                all.push(skill.descriptor());
            }
        }
        all.extend(self.peer_tools.read().await.iter().cloned());
        all
    }

    /// Recent transient call records, oldest first.
    pub async fn recent_calls(&self) -> Vec<ToolCallRecord> {
        self.ledger.lock().await.iter().cloned().collect()
    }

    /// Drive the service: subscribe to configuration and relayed calls, then
    /// process events one at a time. Reconciliation is single-writer by
    /// construction; queued updates wait behind the in-flight change.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<ToolServiceEvent>,
        shutdown: CancellationToken,
    ) -> Result<(), AgentError> {
        let config_subject = subjects::workspace_tools_config(&self.identity.workspace_id);
        let mut config_sub = self.bus.subscribe(config_subject).await?;
        let call_subject = subjects::runtime_call(&self.identity.id);
        let mut call_sub = self.bus.subscribe(call_subject).await?;

        let pump_shutdown = shutdown.clone();
        let events_tx = self.events_tx.clone();
        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pump_shutdown.cancelled() => break,
                    inbound = config_sub.next() => {
                        let Some(inbound) = inbound else { break };
                        if let Envelope::ToolsConfigUpdate(update) = inbound.envelope {
                            let _ = events_tx.send(ToolServiceEvent::ConfigUpdate(update));
                        }
                    }
                    inbound = call_sub.next() => {
                        let Some(inbound) = inbound else { break };
                        if let Envelope::ToolCallRequest(request) = inbound.envelope {
                            let _ = events_tx.send(ToolServiceEvent::CallRelay(request, inbound.reply));
                        }
                    }
                }
            }
            config_sub.unsubscribe().await;
            call_sub.unsubscribe().await;
        });

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    self.handle_event(event).await;
                }
            }
        }

        pump.abort();
        self.stop_all().await;
        Ok(())
    }

    async fn handle_event(self: &Arc<Self>, event: ToolServiceEvent) {
        match event {
            ToolServiceEvent::ConfigUpdate(update) => self.reconcile(update).await,
            ToolServiceEvent::WorkerToolsChanged(id) => {
                let worker = self.workers.lock().await.get(&id).cloned();
                if let Some(worker) = worker {
                    if let Err(e) = worker.refresh_tools().await {
                        warn!(worker = %id, error = %e, "tool list refresh failed");
                    }
                    self.rebuild_index().await;
                }
            }
            ToolServiceEvent::RetryWorker(id) => self.retry_worker(id).await,
            ToolServiceEvent::CallRelay(request, reply) => {
                self.serve_relayed_call(request, reply).await;
            }
        }
    }

    async fn reconcile(self: &Arc<Self>, update: crate::messaging::ToolsConfigUpdate) {
        info!(
            version = update.version,
            tool_servers = update.tool_servers.len(),
            smart_skills = update.smart_skills.len(),
            peer_tools = update.peer_tools.len(),
            "reconciling tool configuration"
        );

        let desired: Vec<ToolServerConfig> = update
            .tool_servers
            .into_iter()
            .filter(|cfg| self.scope.matches(cfg.run_on))
            .filter(|cfg| match cfg.validate() {
                Ok(()) => true,
                Err(e) => {
                    warn!(config = %cfg.name, error = %e, "skipping invalid tool server config");
                    false
                }
            })
            .collect();

        let desired_signatures: Vec<(ConfigId, String)> = desired
            .iter()
            .map(|cfg| (cfg.name.clone(), cfg.signature()))
            .collect();
        let desired_configs: HashMap<ConfigId, ToolServerConfig> = desired
            .into_iter()
            .map(|cfg| (cfg.name.clone(), cfg))
            .collect();

        let plan = {
            let signatures = self.worker_signatures.lock().await;
            plan_reconcile(&signatures, &desired_signatures)
        };

        for id in plan.to_stop.iter().chain(plan.to_restart.iter()) {
            let removed = self.workers.lock().await.remove(id);
            if let Some(worker) = removed {
                worker.stop().await;
            }
            self.worker_signatures.lock().await.remove(id);
            self.worker_configs.lock().await.remove(id);
            self.worker_failures.lock().await.remove(id);
        }

        for id in plan.to_start.iter().chain(plan.to_restart.iter()) {
            let config = desired_configs[id].clone();
            self.launch_worker(config).await;
        }

        self.reconcile_skills(update.smart_skills).await;

        *self.peer_tools.write().await = update
            .peer_tools
            .iter()
            .filter(|peer| peer.owner_runtime != self.identity.id)
            .map(ToolDescriptor::from)
            .collect();

        self.rebuild_index().await;
    }

    async fn launch_worker(self: &Arc<Self>, config: ToolServerConfig) {
        let id = config.name.clone();
        let signature = config.signature();
        let worker =
            ToolServerWorker::new(config.clone(), self.forward_stderr, self.events_tx.clone());

        let started = worker.start().await;
        self.workers.lock().await.insert(id.clone(), worker);
        self.worker_signatures
            .lock()
            .await
            .insert(id.clone(), signature);
        self.worker_configs.lock().await.insert(id.clone(), config);

        match started {
            Ok(()) => {
                self.worker_failures.lock().await.remove(&id);
            }
            Err(_) => self.schedule_retry(id).await,
        }
    }

    async fn retry_worker(self: &Arc<Self>, id: ConfigId) {
        // The config may have vanished or been replaced while we slept.
        let Some(worker) = self.workers.lock().await.get(&id).cloned() else {
            return;
        };
        if worker.state().await != WorkerState::Failed {
            return;
        }

        // A failed worker is replaced, never restarted in place.
        let Some(config) = self.worker_configs.lock().await.get(&id).cloned() else {
            return;
        };
        let replacement =
            ToolServerWorker::new(config, self.forward_stderr, self.events_tx.clone());
        let started = replacement.start().await;
        self.workers.lock().await.insert(id.clone(), replacement);
        match started {
            Ok(()) => {
                self.worker_failures.lock().await.remove(&id);
                self.rebuild_index().await;
            }
            Err(_) => self.schedule_retry(id).await,
        }
    }

    async fn schedule_retry(self: &Arc<Self>, id: ConfigId) {
        let failures = {
            let mut map = self.worker_failures.lock().await;
            let counter = map.entry(id.clone()).or_insert(0);
            *counter += 1;
            *counter
        };
        let delay = backoff_delay(failures).min(RETRY_CAP);
        debug!(worker = %id, failures, ?delay, "scheduling worker retry");

        let events = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(ToolServiceEvent::RetryWorker(id));
        });
    }

    async fn reconcile_skills(&self, configs: Vec<SmartSkillConfig>) {
        let desired: Vec<(ConfigId, String)> = configs
            .iter()
            .map(|cfg| (cfg.id.clone(), cfg.signature()))
            .collect();
        let current: HashMap<ConfigId, String> = {
            let skills = self.skills.lock().await;
            skills
                .iter()
                .map(|(id, skill)| (id.clone(), skill.signature().to_string()))
                .collect()
        };
        let plan = plan_reconcile(&current, &desired);

        let mut skills = self.skills.lock().await;
        for id in plan.to_stop.iter() {
            skills.remove(id);
            info!(skill = %id, "smart skill removed");
        }
        for config in configs {
            let id = config.id.clone();
            if plan.to_start.contains(&id) || plan.to_restart.contains(&id) {
                match SmartSkillWorker::new(config) {
                    Ok(skill) => {
                        skills.insert(id.clone(), Arc::new(skill));
                        info!(skill = %id, "smart skill ready");
                    }
                    Err(e) => warn!(skill = %id, error = %e, "smart skill rejected"),
                }
            }
        }
    }

    /// Rebuild the name → origin index and bump the change counter.
    async fn rebuild_index(&self) {
        let mut index = HashMap::new();
        for descriptor in self.descriptors().await {
            let origin = match descriptor.origin.kind {
                OriginKind::McpServer => {
                    ResolvedOrigin::Worker(ConfigId::new(descriptor.origin.origin_ref.clone()))
                }
                OriginKind::SmartSkill => {
                    ResolvedOrigin::Skill(ConfigId::new(descriptor.origin.origin_ref.clone()))
                }
                OriginKind::PeerRuntime => {
                    ResolvedOrigin::Peer(IdentityId::new(descriptor.origin.origin_ref.clone()))
                }
            };
            // Duplicate names resolve to the lexicographically smallest
            // origin_ref; the surface applies the same rule when listing.
            match index.entry(descriptor.name) {
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert((descriptor.origin.origin_ref.clone(), origin));
                }
                std::collections::hash_map::Entry::Occupied(mut slot) => {
                    if descriptor.origin.origin_ref < slot.get().0 {
                        slot.insert((descriptor.origin.origin_ref.clone(), origin));
                    }
                }
            }
        }
        *self.index.write().await = index
            .into_iter()
            .map(|(name, (_, origin))| (name, origin))
            .collect();
        self.changed.send_modify(|version| *version += 1);
    }

    /// Route one tool call. Unknown names fail locally without touching the
    /// bus.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
        caller: &IdentityId,
        incoming_hop: u8,
    ) -> Result<CallToolResult, AgentError> {
        enum Target {
            Worker(Arc<ToolServerWorker>),
            Skill(Arc<SmartSkillWorker>),
            Peer(IdentityId),
        }

        let target = {
            let index = self.index.read().await;
            match index.get(name) {
                None => return Err(AgentError::ToolNotFound(name.to_string())),
                Some(ResolvedOrigin::Worker(id)) => {
                    let workers = self.workers.lock().await;
                    Target::Worker(workers.get(id).cloned().ok_or_else(|| {
                        AgentError::ToolServerUnavailable(id.as_str().to_string())
                    })?)
                }
                Some(ResolvedOrigin::Skill(id)) => {
                    let skills = self.skills.lock().await;
                    Target::Skill(skills.get(id).cloned().ok_or_else(|| {
                        AgentError::ToolServerUnavailable(id.as_str().to_string())
                    })?)
                }
                Some(ResolvedOrigin::Peer(owner)) => Target::Peer(owner.clone()),
            }
        };

        match target {
            Target::Worker(worker) => {
                let record = self
                    .record_start(name, &arguments, caller, worker.config_id().as_str())
                    .await;
                let result = worker
                    .call_tool(name, Some(arguments), TOOL_CALL_TIMEOUT)
                    .await;
                self.record_end(&record, &result).await;
                result
            }
            Target::Skill(skill) => {
                let record = self
                    .record_start(name, &arguments, caller, skill.config().id.as_str())
                    .await;
                let result = skill.call(&arguments).await;
                self.record_end(&record, &result).await;
                result
            }
            Target::Peer(owner) => {
                self.relay_call(name, arguments, caller, incoming_hop, owner)
                    .await
            }
        }
    }

    async fn relay_call(
        &self,
        name: &str,
        arguments: Map<String, Value>,
        caller: &IdentityId,
        incoming_hop: u8,
        owner: IdentityId,
    ) -> Result<CallToolResult, AgentError> {
        let hop = incoming_hop + 1;
        let record = self
            .record_start(name, &arguments, caller, owner.as_str())
            .await;
        let result = relay_peer_call(&self.bus, &owner, caller, name, arguments, hop).await;
        self.record_end(&record, &result).await;
        result
    }

    /// Answer a call relayed to us by a peer runtime. The hop stamp on the
    /// request prevents a second relay, which breaks advertisement cycles.
    async fn serve_relayed_call(
        &self,
        request: ToolCallRequest,
        reply: Option<async_nats::Subject>,
    ) {
        let Some(reply) = reply else {
            warn!(call = %request.call_id, "relayed call without reply subject");
            return;
        };

        let outcome = if request.hop > MAX_CALL_HOPS {
            Err(AgentError::ToolCallFailed(format!(
                "relay hop limit exceeded for `{}`",
                request.tool_name
            )))
        } else {
            self.call_tool(
                request.tool_name.as_str(),
                request.arguments.clone(),
                &request.caller_id,
                request.hop,
            )
            .await
        };

        let envelope = Envelope::ToolCallReply(match outcome {
            Ok(result) => ToolCallReply {
                call_id: request.call_id,
                content: serde_json::to_value(&result.content).unwrap_or(Value::Null),
                is_error: result.is_error.unwrap_or(false),
                error: None,
            },
            Err(e) => ToolCallReply {
                call_id: request.call_id,
                content: Value::Null,
                is_error: true,
                error: Some(e.to_string()),
            },
        });

        if let Err(e) = self.bus.respond(reply, &envelope).await {
            warn!(error = %e, "relay reply failed");
        }
    }

    async fn record_start(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
        caller: &IdentityId,
        target: &str,
    ) -> ToolCallRecord {
        let record = ToolCallRecord {
            call_id: CallId::generate(),
            tool_name: ToolName::new(name),
            arguments: arguments.clone(),
            called_by: caller.clone(),
            target: target.to_string(),
            status: CallStatus::Running,
            started_at: chrono::Utc::now(),
            completed_at: None,
        };
        let mut ledger = self.ledger.lock().await;
        if ledger.len() >= LEDGER_CAP {
            ledger.pop_front();
        }
        ledger.push_back(record.clone());
        record
    }

    async fn record_end(
        &self,
        record: &ToolCallRecord,
        result: &Result<CallToolResult, AgentError>,
    ) {
        let status = match result {
            Ok(_) => CallStatus::Succeeded,
            Err(AgentError::ToolCallTimedOut(_)) => CallStatus::TimedOut,
            Err(_) => CallStatus::Failed,
        };
        let mut ledger = self.ledger.lock().await;
        if let Some(entry) = ledger
            .iter_mut()
            .find(|entry| entry.call_id == record.call_id)
        {
            entry.status = status;
            entry.completed_at = Some(chrono::Utc::now());
        }
    }

    async fn stop_all(&self) {
        let workers: Vec<_> = self.workers.lock().await.drain().collect();
        for (_, worker) in workers {
            worker.stop().await;
        }
        self.skills.lock().await.clear();
        self.worker_signatures.lock().await.clear();
        self.worker_configs.lock().await.clear();
        info!("tool service stopped");
    }
}

/// Relay one call to the runtime owning the tool. `hop` is the stamp on the
/// outgoing request; anything past [`MAX_CALL_HOPS`] is refused before the
/// bus is touched.
pub(crate) async fn relay_peer_call(
    bus: &BusClient,
    owner: &IdentityId,
    caller: &IdentityId,
    name: &str,
    arguments: Map<String, Value>,
    hop: u8,
) -> Result<CallToolResult, AgentError> {
    if hop > MAX_CALL_HOPS {
        return Err(AgentError::ToolCallFailed(format!(
            "relay hop limit exceeded for `{name}`"
        )));
    }

    let request = Envelope::ToolCallRequest(ToolCallRequest {
        call_id: CallId::generate(),
        tool_name: ToolName::new(name),
        arguments,
        caller_id: caller.clone(),
        hop,
    });

    let reply = bus
        .request(
            subjects::runtime_call(owner),
            &request,
            Some(TOOL_CALL_TIMEOUT),
        )
        .await;

    match reply {
        Ok(Envelope::ToolCallReply(reply)) => decode_reply(reply),
        Ok(other) => Err(AgentError::ToolCallFailed(format!(
            "unexpected relay reply: {:?}",
            other
        ))),
        Err(BusRequestError::TimedOut(d)) => Err(AgentError::ToolCallTimedOut(d)),
        Err(BusRequestError::Failed(msg)) => Err(AgentError::ToolCallFailed(msg)),
    }
}

fn decode_reply(reply: ToolCallReply) -> Result<CallToolResult, AgentError> {
    if reply.is_error {
        if let Some(message) = reply.error {
            return Err(AgentError::ToolCallFailed(message));
        }
    }
    let content: Vec<Content> = serde_json::from_value(reply.content)
        .map_err(|e| AgentError::ToolCallFailed(format!("relay content malformed: {e}")))?;
    if reply.is_error {
        Ok(CallToolResult::error(content))
    } else {
        Ok(CallToolResult::success(content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(id: &str, sig: &str) -> (ConfigId, String) {
        (ConfigId::new(id), sig.to_string())
    }

    #[test]
    fn test_plan_empty_to_some_starts_all() {
        let current = HashMap::new();
        let plan = plan_reconcile(&current, &[sig("a", "1"), sig("b", "2")]);
        assert_eq!(plan.to_start, vec![ConfigId::new("a"), ConfigId::new("b")]);
        assert!(plan.to_restart.is_empty());
        assert!(plan.to_stop.is_empty());
    }

    #[test]
    fn test_plan_signature_change_restarts() {
        let mut current = HashMap::new();
        current.insert(ConfigId::new("a"), "1".to_string());
        let plan = plan_reconcile(&current, &[sig("a", "changed")]);
        assert_eq!(plan.to_restart, vec![ConfigId::new("a")]);
        assert!(plan.to_start.is_empty());
        assert!(plan.to_stop.is_empty());
    }

    #[test]
    fn test_plan_vanished_config_stops_worker() {
        let mut current = HashMap::new();
        current.insert(ConfigId::new("a"), "1".to_string());
        current.insert(ConfigId::new("b"), "2".to_string());
        let plan = plan_reconcile(&current, &[sig("a", "1")]);
        assert_eq!(plan.to_stop, vec![ConfigId::new("b")]);
        assert!(plan.to_start.is_empty());
        assert!(plan.to_restart.is_empty());
    }

    #[test]
    fn test_plan_unchanged_is_noop() {
        let mut current = HashMap::new();
        current.insert(ConfigId::new("a"), "1".to_string());
        let plan = plan_reconcile(&current, &[sig("a", "1")]);
        assert_eq!(plan, ReconcilePlan::default());
    }

    #[test]
    fn test_scope_matching() {
        let edge = RuntimeScope {
            agent: false,
            edge: true,
        };
        assert!(edge.matches(RunScope::Global));
        assert!(edge.matches(RunScope::Edge));
        assert!(!edge.matches(RunScope::Agent));

        let agent = RuntimeScope {
            agent: true,
            edge: false,
        };
        assert!(agent.matches(RunScope::Global));
        assert!(agent.matches(RunScope::Agent));
        assert!(!agent.matches(RunScope::Edge));
    }

    #[test]
    fn test_descriptor_mcp_roundtrip() {
        let descriptor = ToolDescriptor {
            name: ToolName::new("list_directory"),
            description: "List a directory".to_string(),
            input_schema: serde_json::from_value(serde_json::json!({
                "type": "object",
                "properties": {"path": {"type": "string"}}
            }))
            .unwrap(),
            annotations: None,
            origin: ToolOrigin {
                kind: OriginKind::McpServer,
                origin_ref: "filesystem".to_string(),
            },
        };

        let tool = descriptor.to_mcp_tool();
        assert_eq!(tool.name, "list_directory");

        let back = ToolDescriptor::from_mcp_tool(
            tool,
            ToolOrigin {
                kind: OriginKind::McpServer,
                origin_ref: "filesystem".to_string(),
            },
        );
        assert_eq!(back.name, descriptor.name);
        assert_eq!(back.input_schema, descriptor.input_schema);
    }

    #[test]
    fn test_peer_tool_descriptor_origin() {
        let peer = PeerToolConfig {
            name: "remote_search".to_string(),
            description: "Search on the owning runtime".to_string(),
            input_schema: Map::new(),
            annotations: None,
            owner_runtime: IdentityId::new("rt-9"),
        };
        let descriptor = ToolDescriptor::from(&peer);
        assert_eq!(descriptor.origin.kind, OriginKind::PeerRuntime);
        assert_eq!(descriptor.origin.origin_ref, "rt-9");
    }

    #[test]
    fn test_decode_reply_success() {
        let reply = ToolCallReply {
            call_id: CallId::new("c-1"),
            content: serde_json::to_value(vec![Content::text("ok")]).unwrap(),
            is_error: false,
            error: None,
        };
        let result = decode_reply(reply).unwrap();
        assert_eq!(result.is_error, Some(false));
    }

    #[test]
    fn test_decode_reply_error_message() {
        let reply = ToolCallReply {
            call_id: CallId::new("c-1"),
            content: Value::Null,
            is_error: true,
            error: Some("boom".to_string()),
        };
        let err = decode_reply(reply).unwrap_err();
        assert!(matches!(err, AgentError::ToolCallFailed(_)));
        assert!(err.to_string().contains("boom"));
    }
}
