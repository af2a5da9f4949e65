//! Agent orchestration: candidate selection, fail-over, and supervision.
//!
//! The orchestrator owns the configured agent set. The set itself is fixed at
//! startup; the running [`AgentInstance`] inside each slot is replaced only
//! by the supervisor task, so request paths read a consistent snapshot and
//! never mutate. Dead agents are respawned with exponential backoff and
//! permanently disabled after too many failed respawns in a window.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use std::collections::VecDeque;

use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::breaker::{BreakerConfig, BreakerState, CircuitBreaker, Permit};
use super::executor::{AgentInstance, Invocation, InvokeError};
use super::{AgentSpec, AgentState, BreakerSignal};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub failover_enabled: bool,
    pub admission_queue_timeout: Duration,
    pub breaker: BreakerConfig,
    pub respawn_base: Duration,
    pub respawn_cap: Duration,
    pub disable_after_respawns: usize,
    pub disable_window: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            failover_enabled: true,
            admission_queue_timeout: Duration::from_millis(500),
            breaker: BreakerConfig::default(),
            respawn_base: Duration::from_millis(500),
            respawn_cap: Duration::from_secs(30),
            disable_after_respawns: 10,
            disable_window: Duration::from_secs(300),
        }
    }
}

/// One configured agent: its spec, breaker, and the current instance.
#[derive(Debug)]
pub struct AgentSlot {
    pub spec: Arc<AgentSpec>,
    pub breaker: CircuitBreaker,
    instance: RwLock<Option<AgentInstance>>,
    disabled: AtomicBool,
    unavailable_at_boot: AtomicBool,
    respawn_attempt: AtomicU32,
    respawn_failures: StdMutex<VecDeque<Instant>>,
}

impl AgentSlot {
    fn new(spec: Arc<AgentSpec>, breaker_cfg: BreakerConfig) -> Self {
        Self {
            breaker: CircuitBreaker::new(spec.name.clone(), breaker_cfg),
            spec,
            instance: RwLock::new(None),
            disabled: AtomicBool::new(false),
            unavailable_at_boot: AtomicBool::new(false),
            respawn_failures: StdMutex::new(VecDeque::new()),
            respawn_attempt: AtomicU32::new(0),
        }
    }

    pub async fn instance(&self) -> Option<AgentInstance> {
        self.instance.read().await.clone()
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    async fn state(&self) -> AgentState {
        match &*self.instance.read().await {
            Some(instance) => instance.state(),
            None => AgentState::Dead,
        }
    }
}

/// Why a dispatch could not be served.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// No candidate advertised the model, or every candidate was unavailable.
    #[error("no agent available for model '{model}'")]
    NoAgent { model: String },
    /// Candidates existed but every attempt failed before producing output.
    #[error("all agents failed for model '{model}': {last_error}")]
    Exhausted { model: String, last_error: String },
}

/// A successfully started invocation, handed to the chat pipeline.
#[derive(Debug)]
pub struct Dispatch {
    pub agent_name: String,
    /// Canonical model name to report in responses.
    pub model: String,
    pub invocation: Invocation,
    pub guard: DispatchGuard,
}

/// Settles the breaker permit and the agent's failure streak exactly once.
#[derive(Debug)]
pub struct DispatchGuard {
    slot: Arc<AgentSlot>,
    instance: AgentInstance,
    permit: Option<Permit>,
}

impl DispatchGuard {
    pub fn finish(mut self, signal: BreakerSignal) {
        self.settle(signal);
    }

    fn settle(&mut self, signal: BreakerSignal) {
        if let Some(permit) = self.permit.take() {
            self.slot.breaker.record(permit, signal);
            match signal {
                BreakerSignal::Success => self.instance.note_invoke_success(),
                BreakerSignal::Failure => self.instance.note_invoke_failure(),
                BreakerSignal::Neutral => {}
            }
        }
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        // An unsettled guard means the request ended without a verdict
        // (client went away mid-flight): neither success nor failure.
        self.settle(BreakerSignal::Neutral);
    }
}

#[derive(Debug)]
pub struct Orchestrator {
    slots: Arc<HashMap<String, Arc<AgentSlot>>>,
    order: Vec<String>,
    aliases: HashMap<String, String>,
    cfg: OrchestratorConfig,
    rr: AtomicUsize,
    exit_tx: mpsc::UnboundedSender<String>,
    exit_rx: StdMutex<Option<mpsc::UnboundedReceiver<String>>>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        specs: Vec<AgentSpec>,
        aliases: HashMap<String, String>,
        cfg: OrchestratorConfig,
    ) -> Self {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let mut slots = HashMap::new();
        let mut order = Vec::new();
        for spec in specs {
            let spec = Arc::new(spec);
            order.push(spec.name.clone());
            slots.insert(
                spec.name.clone(),
                Arc::new(AgentSlot::new(spec, cfg.breaker.clone())),
            );
        }
        Self {
            slots: Arc::new(slots),
            order,
            aliases,
            cfg,
            rr: AtomicUsize::new(0),
            exit_tx,
            exit_rx: StdMutex::new(Some(exit_rx)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Spawn every configured agent and the supervisor loop.
    pub async fn start(self: &Arc<Self>) {
        for name in &self.order {
            let slot = Arc::clone(&self.slots[name]);
            if !binary_is_executable(&slot.spec.binary_path) {
                tracing::error!(
                    agent = %slot.spec.name,
                    path = ?slot.spec.binary_path,
                    "agent binary missing or not executable, marking unavailable"
                );
                slot.unavailable_at_boot.store(true, Ordering::SeqCst);
                slot.disabled.store(true, Ordering::SeqCst);
                continue;
            }
            self.respawn(Arc::clone(&slot)).await;
        }

        let this = Arc::clone(self);
        let mut exit_rx = this
            .exit_rx
            .lock()
            .expect("exit_rx lock")
            .take()
            .expect("supervisor already started");
        tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    () = this.shutdown.cancelled() => break,
                    name = exit_rx.recv() => match name {
                        Some(name) => name,
                        None => break,
                    },
                };
                let Some(slot) = this.slots.get(&name).map(Arc::clone) else {
                    continue;
                };
                if slot.is_disabled() || this.shutdown.is_cancelled() {
                    continue;
                }
                if this.note_respawn_and_check_disable(&slot) {
                    continue;
                }
                let attempt = slot.respawn_attempt.fetch_add(1, Ordering::SeqCst);
                let delay = respawn_backoff(
                    this.cfg.respawn_base,
                    this.cfg.respawn_cap,
                    &name,
                    attempt,
                );
                tracing::info!(agent = %name, attempt, delay_ms = delay.as_millis() as u64, "scheduling agent respawn");
                let this2 = Arc::clone(&this);
                tokio::spawn(async move {
                    tokio::select! {
                        () = this2.shutdown.cancelled() => {}
                        () = tokio::time::sleep(delay) => {
                            this2.respawn(slot).await;
                        }
                    }
                });
            }
        });
    }

    /// Window-bounded respawn accounting; returns true when the agent has
    /// been permanently disabled.
    fn note_respawn_and_check_disable(&self, slot: &Arc<AgentSlot>) -> bool {
        let now = Instant::now();
        let mut failures = slot.respawn_failures.lock().expect("respawn lock");
        failures.push_back(now);
        while let Some(front) = failures.front() {
            if now.duration_since(*front) > self.cfg.disable_window {
                failures.pop_front();
            } else {
                break;
            }
        }
        if failures.len() >= self.cfg.disable_after_respawns {
            slot.disabled.store(true, Ordering::SeqCst);
            tracing::error!(
                agent = %slot.spec.name,
                respawns = failures.len(),
                "too many respawns in window, permanently disabling agent"
            );
            return true;
        }
        false
    }

    async fn respawn(&self, slot: Arc<AgentSlot>) {
        metrics::counter!("gateway_agent_respawns_total", "agent" => slot.spec.name.clone())
            .increment(1);
        match AgentInstance::spawn(Arc::clone(&slot.spec), self.exit_tx.clone()).await {
            Ok(instance) => {
                // Publish before readiness so /status can observe `spawning`.
                *slot.instance.write().await = Some(instance.clone());
                match instance.wait_ready().await {
                    Ok(()) => {
                        slot.respawn_attempt.store(0, Ordering::SeqCst);
                    }
                    Err(err) => {
                        tracing::error!(agent = %slot.spec.name, error = %err, "agent failed to become ready");
                        // stop() drives the waiter, which re-enqueues the
                        // respawn through the exit channel.
                        instance.stop(Duration::from_secs(2)).await;
                    }
                }
            }
            Err(err) => {
                tracing::error!(agent = %slot.spec.name, error = %err, "agent spawn failed");
                // No process, so no waiter will report an exit; re-enqueue
                // directly.
                let _ = self.exit_tx.send(slot.spec.name.clone());
            }
        }
    }

    /// Resolve the model a request names to its canonical form.
    pub fn resolve_model(&self, requested: &str) -> String {
        let direct = self
            .slots
            .values()
            .any(|s| s.spec.models_advertised.contains(requested));
        if direct {
            requested.to_owned()
        } else if let Some(canonical) = self.aliases.get(requested) {
            canonical.clone()
        } else {
            requested.to_owned()
        }
    }

    /// Build the ranked candidate list for a model: primary designation
    /// first, then lower in-flight count, then round-robin.
    pub async fn candidates(&self, model: &str) -> (String, Vec<Arc<AgentSlot>>) {
        let canonical = self.resolve_model(model);
        let mut matched: Vec<Arc<AgentSlot>> = self
            .order
            .iter()
            .filter_map(|name| self.slots.get(name))
            .filter(|slot| {
                !slot.is_disabled() && slot.spec.models_advertised.contains(&canonical)
            })
            .map(Arc::clone)
            .collect();

        let mut ranked = Vec::with_capacity(matched.len());
        for slot in matched.drain(..) {
            let state = slot.state().await;
            if !matches!(state, AgentState::Ready | AgentState::Busy) {
                continue;
            }
            if slot.breaker.state() == BreakerState::Open {
                continue;
            }
            let in_flight = match slot.instance().await {
                Some(instance) => instance.in_flight(),
                None => continue,
            };
            ranked.push((slot, in_flight));
        }

        let total = ranked.len().max(1);
        let offset = self.rr.fetch_add(1, Ordering::Relaxed);
        let mut indexed: Vec<(usize, (Arc<AgentSlot>, usize))> =
            ranked.into_iter().enumerate().collect();
        indexed.sort_by_key(|(idx, (slot, in_flight))| {
            (!slot.spec.primary, *in_flight, idx.wrapping_add(offset) % total)
        });
        (
            canonical,
            indexed.into_iter().map(|(_, (slot, _))| slot).collect(),
        )
    }

    /// Pick an agent and start the invocation, failing over across
    /// candidates on pre-stream errors.
    pub async fn dispatch(
        &self,
        requested_model: &str,
        body: serde_json::Value,
        stream: bool,
    ) -> Result<Dispatch, DispatchError> {
        let (canonical, candidates) = self.candidates(requested_model).await;
        if candidates.is_empty() {
            return Err(DispatchError::NoAgent {
                model: requested_model.to_owned(),
            });
        }

        // Agents see the canonical model name, not the alias.
        let mut body = body;
        if let Some(object) = body.as_object_mut() {
            object.insert(
                "model".to_owned(),
                serde_json::Value::String(canonical.clone()),
            );
        }

        let try_list: Vec<Arc<AgentSlot>> = if self.cfg.failover_enabled {
            candidates
        } else {
            candidates.into_iter().take(1).collect()
        };

        let mut saturated: Option<Arc<AgentSlot>> = None;
        let mut last_error: Option<String> = None;

        for slot in &try_list {
            let Ok(permit) = slot.breaker.allow() else {
                tracing::debug!(agent = %slot.spec.name, "breaker open, skipping candidate");
                continue;
            };
            let Some(instance) = slot.instance().await else {
                slot.breaker.record(permit, BreakerSignal::Neutral);
                continue;
            };
            let Some(admit) = instance.try_admit() else {
                slot.breaker.record(permit, BreakerSignal::Neutral);
                saturated.get_or_insert_with(|| Arc::clone(slot));
                continue;
            };
            match self
                .start_invocation(slot, &instance, permit, &canonical, body.clone(), stream, admit)
                .await
            {
                Ok(dispatch) => return Ok(dispatch),
                Err(message) => {
                    last_error = Some(message);
                }
            }
        }

        // Every candidate was tried; if one was merely saturated, queue on it
        // for the admission window before giving up.
        if let Some(slot) = saturated {
            if let Some(admit) = match slot.instance().await {
                Some(instance) => instance
                    .admit_within(self.cfg.admission_queue_timeout)
                    .await
                    .map(|permit| (instance, permit)),
                None => None,
            } {
                let (instance, admit) = admit;
                if let Ok(permit) = slot.breaker.allow() {
                    match self
                        .start_invocation(&slot, &instance, permit, &canonical, body, stream, admit)
                        .await
                    {
                        Ok(dispatch) => return Ok(dispatch),
                        Err(message) => last_error = Some(message),
                    }
                }
            }
        }

        match last_error {
            Some(last_error) => Err(DispatchError::Exhausted {
                model: requested_model.to_owned(),
                last_error,
            }),
            None => Err(DispatchError::NoAgent {
                model: requested_model.to_owned(),
            }),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn start_invocation(
        &self,
        slot: &Arc<AgentSlot>,
        instance: &AgentInstance,
        permit: Permit,
        model: &str,
        body: serde_json::Value,
        stream: bool,
        admit: tokio::sync::OwnedSemaphorePermit,
    ) -> Result<Dispatch, String> {
        let correlation_id = Uuid::new_v4().to_string();
        match instance
            .invoke(correlation_id, model, body, stream, admit)
            .await
        {
            Ok(invocation) => Ok(Dispatch {
                agent_name: slot.spec.name.clone(),
                model: model.to_owned(),
                invocation,
                guard: DispatchGuard {
                    slot: Arc::clone(slot),
                    instance: instance.clone(),
                    permit: Some(permit),
                },
            }),
            Err(InvokeError::Io(message)) => {
                tracing::warn!(agent = %slot.spec.name, error = %message, "pre-stream invocation failure, failing over");
                slot.breaker.record(permit, BreakerSignal::Failure);
                instance.note_invoke_failure();
                Err(message)
            }
            Err(err @ InvokeError::NotReady) => {
                slot.breaker.record(permit, BreakerSignal::Neutral);
                Err(err.to_string())
            }
        }
    }

    pub fn agent_names(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn primary_name(&self) -> Option<String> {
        self.order
            .iter()
            .find(|name| self.slots[*name].spec.primary)
            .or_else(|| self.order.first())
            .cloned()
    }

    /// Union of advertised models across non-dead agents.
    pub async fn models_union(&self) -> Vec<String> {
        let mut models = BTreeSet::new();
        for name in &self.order {
            let slot = &self.slots[name];
            if slot.is_disabled() {
                continue;
            }
            if matches!(slot.state().await, AgentState::Dead) {
                continue;
            }
            models.extend(slot.spec.models_advertised.iter().cloned());
        }
        models.into_iter().collect()
    }

    pub fn slots(&self) -> Vec<Arc<AgentSlot>> {
        self.order
            .iter()
            .filter_map(|name| self.slots.get(name))
            .map(Arc::clone)
            .collect()
    }

    /// Detailed per-agent status for `/status` and `/health`.
    pub async fn status(&self) -> Vec<AgentStatusReport> {
        let mut out = Vec::with_capacity(self.order.len());
        for slot in self.slots() {
            let (state, in_flight, pid, consecutive_failures, last_health_ok_secs) =
                match slot.instance().await {
                    Some(instance) => (
                        instance.state(),
                        instance.in_flight(),
                        instance.pid(),
                        instance.consecutive_failures(),
                        instance.last_health_ok().map(|t| t.elapsed().as_secs()),
                    ),
                    None => (AgentState::Dead, 0, None, 0, None),
                };
            out.push(AgentStatusReport {
                name: slot.spec.name.clone(),
                state,
                breaker: slot.breaker.state(),
                in_flight,
                max_concurrent: slot.spec.max_concurrent_invocations,
                pid,
                consecutive_failures,
                last_health_ok_secs,
                disabled: slot.is_disabled(),
                unavailable_at_boot: slot.unavailable_at_boot.load(Ordering::SeqCst),
                primary: slot.spec.primary,
                models: slot.spec.models_advertised.iter().cloned().collect(),
            });
        }
        out
    }

    /// Stop every agent and the supervisor.
    pub async fn stop_all(&self, grace: Duration) {
        self.shutdown.cancel();
        let mut stops = Vec::new();
        for slot in self.slots() {
            if let Some(instance) = slot.instance().await {
                stops.push(async move { instance.stop(grace).await });
            }
        }
        futures::future::join_all(stops).await;
    }
}

/// Per-agent status row, serialized into `/status`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AgentStatusReport {
    pub name: String,
    pub state: AgentState,
    pub breaker: BreakerState,
    pub in_flight: usize,
    pub max_concurrent: usize,
    pub pid: Option<u32>,
    pub consecutive_failures: u32,
    pub last_health_ok_secs: Option<u64>,
    pub disabled: bool,
    pub unavailable_at_boot: bool,
    pub primary: bool,
    pub models: Vec<String>,
}

fn binary_is_executable(path: &std::path::Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Exponential backoff with deterministic ±20% jitter derived from the agent
/// name and attempt number.
fn respawn_backoff(base: Duration, cap: Duration, name: &str, attempt: u32) -> Duration {
    let exp = base
        .saturating_mul(2u32.saturating_pow(attempt.min(16)))
        .min(cap);
    let mut hasher = DefaultHasher::new();
    (name, attempt).hash(&mut hasher);
    let jitter = (hasher.finish() % 401) as i64 - 200; // -200..=200 per-mille
    let nanos = exp.as_nanos() as i64;
    let adjusted = nanos + nanos * jitter / 1000;
    Duration::from_nanos(adjusted.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn spec(name: &str, models: &[&str], primary: bool) -> AgentSpec {
        AgentSpec {
            name: name.to_owned(),
            binary_path: "/bin/true".into(),
            argv: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            transport: super::super::Transport::StdioJsonlines,
            startup_timeout: Duration::from_secs(5),
            max_concurrent_invocations: 2,
            models_advertised: models.iter().map(|m| (*m).to_owned()).collect::<BTreeSet<_>>(),
            primary,
        }
    }

    fn orchestrator(aliases: &[(&str, &str)]) -> Orchestrator {
        Orchestrator::new(
            vec![
                spec("alpha", &["modelX", "modelY"], true),
                spec("beta", &["modelX"], false),
            ],
            aliases
                .iter()
                .map(|(a, b)| ((*a).to_owned(), (*b).to_owned()))
                .collect(),
            OrchestratorConfig::default(),
        )
    }

    #[test]
    fn resolve_prefers_exact_advertisement() {
        let orch = orchestrator(&[("modelX", "somewhere-else")]);
        assert_eq!(orch.resolve_model("modelX"), "modelX");
    }

    #[test]
    fn resolve_falls_back_to_alias() {
        let orch = orchestrator(&[("gpt-x-latest", "modelX")]);
        assert_eq!(orch.resolve_model("gpt-x-latest"), "modelX");
        assert_eq!(orch.resolve_model("unknown"), "unknown");
    }

    #[tokio::test]
    async fn candidates_exclude_agents_without_instances() {
        // No instance has been spawned, so every slot reads as dead.
        let orch = orchestrator(&[]);
        let (canonical, candidates) = orch.candidates("modelX").await;
        assert_eq!(canonical, "modelX");
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn dispatch_without_candidates_is_no_agent() {
        let orch = orchestrator(&[]);
        let err = orch
            .dispatch("modelX", serde_json::json!({}), false)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoAgent { .. }));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let base = Duration::from_millis(500);
        let cap = Duration::from_secs(30);
        let first = respawn_backoff(base, cap, "a", 0);
        let sixth = respawn_backoff(base, cap, "a", 6);
        let huge = respawn_backoff(base, cap, "a", 30);
        assert!(first >= Duration::from_millis(400) && first <= Duration::from_millis(600));
        assert!(sixth > first);
        assert!(huge <= Duration::from_secs(36)); // cap plus jitter
    }

    #[test]
    fn backoff_is_deterministic() {
        let base = Duration::from_millis(500);
        let cap = Duration::from_secs(30);
        assert_eq!(
            respawn_backoff(base, cap, "a", 3),
            respawn_backoff(base, cap, "a", 3)
        );
    }
}
