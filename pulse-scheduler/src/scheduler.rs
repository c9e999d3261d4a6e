//! Task admission, placement, execution and completion

use crate::retry::{RetryOutcome, RetryPolicy};
use crate::strategy::{AllocationStrategy, RelationAwareStrategy};
use chrono::Utc;
use dashmap::DashMap;
use futures_util::future::join_all;
use pulse_cache::SemanticCache;
use pulse_core::{
    new_entity_id, Embedding, GenerationParams, GovernorDecision, InferenceEngine, InferenceError,
    MessagePayload, NodeCapabilities, NodeId, PeerNode, Priority, PulseConfig, ResourceError,
    ResourceGovernor, SwarmError, SwarmMessage, SwarmResult, TaskComplexity, TaskId, TaskInfo,
    TaskOutcome, TaskStatus, TaskSubmitRequest, TaskType, TimeoutError, Timestamp, TransportError,
    ValidationError,
};
use pulse_evolution::NodeEvolution;
use pulse_predict::{
    queue_wait_estimate, CandidateNode, FeedbackOutcome, NetworkState, PredictionContext,
    PredictionFeedback, PredictiveScheduler, ScheduleDecision,
};
use pulse_relation::{CollaborationEvent, RelationModel};
use pulse_transport::{BroadcastReport, PeerRegistry};
use serde::Serialize;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

/// Smoothing factor of the observed transport latency.
const LATENCY_SMOOTHING: f64 = 0.3;

/// A latency sample older than this no longer describes the network.
pub(crate) const LATENCY_SAMPLE_TTL: Duration = Duration::from_secs(60);

/// How many recent submissions feed the need forecast.
const RECENT_SUBMISSIONS: usize = 32;

// ============================================================================
// OUTCOMES & OBSERVERS
// ============================================================================

/// Answer to [`TaskScheduler::submit_task`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SubmitOutcome {
    /// Work started (or was answered from cache) on these nodes
    Success { task_id: TaskId, nodes: Vec<NodeId> },
    Queued {
        task_id: TaskId,
        /// 1-based position in the queue
        position: usize,
        estimated_wait: Duration,
    },
    Rejected {
        task_id: TaskId,
        reason: String,
        alternatives: Vec<String>,
    },
}

impl SubmitOutcome {
    pub fn task_id(&self) -> TaskId {
        match self {
            SubmitOutcome::Success { task_id, .. }
            | SubmitOutcome::Queued { task_id, .. }
            | SubmitOutcome::Rejected { task_id, .. } => *task_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SubmitOutcome::Success { .. })
    }
}

/// Observer view of the swarm from this device.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NetworkStats {
    pub known_peers: usize,
    pub connected_peers: usize,
    pub active_tasks: usize,
    pub queued_tasks: usize,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub average_latency_ms: f64,
    pub average_load: f64,
}

/// Where a task runs.
#[derive(Debug, Clone, PartialEq)]
enum Placement {
    Local,
    Remote(Vec<NodeId>),
}

impl Placement {
    fn nodes(&self, local_id: &str) -> Vec<NodeId> {
        match self {
            Placement::Local => vec![local_id.to_string()],
            Placement::Remote(nodes) => nodes.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Preference {
    Local,
    Remote,
}

/// How a task is placed once the schedule decision is known.
#[derive(Debug, Clone)]
struct Dispatch {
    preference: Preference,
    priority: Priority,
    /// Predictor-ranked peers, tried before the allocation strategy's order
    preferred: Vec<NodeId>,
    /// Upper bound on waiting for a peer's answer
    allowance: Option<Duration>,
}

impl Dispatch {
    fn local(priority: Priority) -> Self {
        Self {
            preference: Preference::Local,
            priority,
            preferred: Vec::new(),
            allowance: None,
        }
    }

    fn remote(priority: Priority) -> Self {
        Self {
            preference: Preference::Remote,
            ..Self::local(priority)
        }
    }

    fn assigned(priority: Priority, nodes: Vec<NodeId>, allowance: Duration) -> Self {
        Self {
            preferred: nodes,
            allowance: Some(allowance),
            ..Self::remote(priority)
        }
    }

    /// Time to wait for a peer's answer on each attempt.
    fn remote_wait(&self, request: &TaskSubmitRequest) -> Duration {
        match self.allowance {
            Some(allowance) if !allowance.is_zero() => allowance.min(request.timeout),
            _ => request.timeout,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LatencySample {
    ms: f64,
    at: Instant,
}

/// Successful result of one attempt.
#[derive(Debug, Clone)]
struct Executed {
    result: serde_json::Value,
    quality: f64,
}

/// Experience earned for finishing a task of the given complexity.
pub fn experience_for(complexity: TaskComplexity) -> u64 {
    match complexity {
        TaskComplexity::Trivial => 5,
        TaskComplexity::Simple => 10,
        TaskComplexity::Moderate => 25,
        TaskComplexity::Complex => 50,
        TaskComplexity::Heavy => 100,
    }
}

/// Answer text carried by a task result, if any.
pub fn answer_text(result: &serde_json::Value) -> Option<&str> {
    result
        .get("answer")
        .and_then(|a| a.as_str())
        .or_else(|| result.as_str())
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// TASK SCHEDULER
// ============================================================================

/// Single entry point turning task requests into assignments, queue slots
/// or rejections, and the owner of everything that runs on their behalf.
pub struct TaskScheduler {
    pub(crate) local_id: NodeId,
    pub(crate) config: PulseConfig,
    local_capabilities: RwLock<NodeCapabilities>,
    pub(crate) registry: Arc<PeerRegistry>,
    pub(crate) cache: Arc<SemanticCache>,
    pub(crate) relations: Arc<RelationModel>,
    pub(crate) predictor: Arc<PredictiveScheduler>,
    pub(crate) evolution: Arc<NodeEvolution>,
    pub(crate) governor: Arc<dyn ResourceGovernor>,
    pub(crate) inference: Arc<dyn InferenceEngine>,
    strategy: Arc<dyn AllocationStrategy>,
    retry: RetryPolicy,
    pub(crate) tasks: DashMap<TaskId, TaskInfo>,
    handles: DashMap<TaskId, JoinHandle<()>>,
    /// Slots in use per node, this device included
    slots: DashMap<NodeId, u32>,
    /// Nodes holding a slot for each task
    reservations: DashMap<TaskId, Vec<NodeId>>,
    /// Executions waiting for a peer's `TaskResponse`
    responses: DashMap<(TaskId, NodeId), oneshot::Sender<TaskOutcome>>,
    pub(crate) peer_loads: DashMap<NodeId, f64>,
    /// Requests this device is executing for peers
    pub(crate) served: DashMap<(NodeId, TaskId), JoinHandle<()>>,
    queue: Mutex<VecDeque<TaskId>>,
    draining: tokio::sync::Mutex<()>,
    recent: Mutex<VecDeque<(Timestamp, TaskType)>>,
    /// Transport latency to peers, peer processing time excluded
    latency: Mutex<Option<LatencySample>>,
    completed: AtomicU64,
    failed: AtomicU64,
    stats_tx: watch::Sender<NetworkStats>,
}

impl TaskScheduler {
    /// Build a scheduler and the learning components it drives.
    pub fn new(
        config: PulseConfig,
        local_capabilities: NodeCapabilities,
        registry: Arc<PeerRegistry>,
        governor: Arc<dyn ResourceGovernor>,
        inference: Arc<dyn InferenceEngine>,
    ) -> Self {
        let local_id = registry.local_id().to_string();
        let cache = Arc::new(SemanticCache::new(local_id.clone(), config.cache.clone()));
        let relations = Arc::new(RelationModel::new(config.relation.clone()));
        let predictor = Arc::new(PredictiveScheduler::new(
            config.predictor.clone(),
            config.criticality.clone(),
        ));
        let evolution = Arc::new(NodeEvolution::new(config.evolution.clone()));
        let strategy: Arc<dyn AllocationStrategy> = Arc::new(RelationAwareStrategy::new(Arc::clone(&relations)));
        let (stats_tx, _) = watch::channel(NetworkStats::default());
        Self {
            retry: RetryPolicy::from_config(&config.scheduler),
            local_id,
            config,
            local_capabilities: RwLock::new(local_capabilities),
            registry,
            cache,
            relations,
            predictor,
            evolution,
            governor,
            inference,
            strategy,
            tasks: DashMap::new(),
            handles: DashMap::new(),
            slots: DashMap::new(),
            reservations: DashMap::new(),
            responses: DashMap::new(),
            peer_loads: DashMap::new(),
            served: DashMap::new(),
            queue: Mutex::new(VecDeque::new()),
            draining: tokio::sync::Mutex::new(()),
            recent: Mutex::new(VecDeque::new()),
            latency: Mutex::new(None),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            stats_tx,
        }
    }

    /// Replace the peer selection strategy.
    pub fn with_strategy(mut self, strategy: Arc<dyn AllocationStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn config(&self) -> &PulseConfig {
        &self.config
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<SemanticCache> {
        &self.cache
    }

    pub fn relations(&self) -> &Arc<RelationModel> {
        &self.relations
    }

    pub fn predictor(&self) -> &Arc<PredictiveScheduler> {
        &self.predictor
    }

    pub fn evolution(&self) -> &Arc<NodeEvolution> {
        &self.evolution
    }

    pub fn local_capabilities(&self) -> NodeCapabilities {
        self.local_capabilities
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace this device's capabilities and tell every peer.
    pub async fn update_local_capabilities(&self, capabilities: NodeCapabilities) -> BroadcastReport {
        *self
            .local_capabilities
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = capabilities.clone();
        let message = SwarmMessage::new(self.local_id.clone(), MessagePayload::CapabilityUpdate { capabilities });
        self.registry.broadcast(&message).await
    }

    pub fn task(&self, task_id: &TaskId) -> Option<TaskInfo> {
        self.tasks.get(task_id).map(|t| t.clone())
    }

    pub fn tasks(&self) -> Vec<TaskInfo> {
        let mut tasks: Vec<TaskInfo> = self.tasks.iter().map(|t| t.clone()).collect();
        tasks.sort_by_key(|t| t.task_id);
        tasks
    }

    pub fn queue_len(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn slots_in_use(&self, node_id: &str) -> u32 {
        self.slots.get(node_id).map(|s| *s).unwrap_or(0)
    }

    // ------------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------------

    /// Admit a task: validate it, gate it on hard requirements, try the
    /// semantic cache, then follow the predictor's schedule decision.
    pub async fn submit_task(self: &Arc<Self>, request: TaskSubmitRequest) -> SubmitOutcome {
        let task_id = new_entity_id();
        self.tasks.insert(task_id, TaskInfo::new(task_id, request.clone()));
        self.remember_submission(request.task_type);

        if let Err(err) = request.validate() {
            return self.reject(task_id, err.to_string(), Vec::new());
        }

        let peers = self.registry.peers();
        if !self.local_satisfies(&request) && !peers.iter().any(|p| satisfies(&p.capabilities, &request)) {
            let (reason, alternatives) = hard_requirement_gap(&request, &self.local_capabilities(), &peers);
            return self.reject(task_id, reason, alternatives);
        }

        if let Some(outcome) = self.answer_from_cache(task_id, &request).await {
            return outcome;
        }

        let decision = self.predictor.get_schedule_decision(&request, &self.network_state());
        info!(
            task_id = %task_id,
            task_type = %request.task_type,
            decision = decision.label(),
            "Scheduling task"
        );
        let outcome = match decision {
            ScheduleDecision::ExecuteLocally { .. } => {
                self.start_or_queue(task_id, &request, Dispatch::local(request.priority), None)
                    .await
            }
            ScheduleDecision::Assign { nodes, time_allowance } => {
                let dispatch = Dispatch::assigned(request.priority, nodes, time_allowance);
                self.start_or_queue(task_id, &request, dispatch, None).await
            }
            ScheduleDecision::RequestPremium { reason } => {
                debug!(task_id = %task_id, reason = %reason, "Premium handling, bypassing the queue");
                self.start_or_queue(task_id, &request, Dispatch::remote(Priority::Urgent), None)
                    .await
            }
            ScheduleDecision::Queue { estimated_wait, .. } => self.enqueue(task_id, &request, Some(estimated_wait)),
        };
        self.publish_stats();
        outcome
    }

    async fn start_or_queue(
        self: &Arc<Self>,
        task_id: TaskId,
        request: &TaskSubmitRequest,
        dispatch: Dispatch,
        estimated_wait: Option<Duration>,
    ) -> SubmitOutcome {
        match self.try_start(task_id, request, &dispatch).await {
            Ok(Some(nodes)) => SubmitOutcome::Success { task_id, nodes },
            Ok(None) => self.enqueue(task_id, request, estimated_wait),
            Err(err) => self.reject(task_id, err.to_string(), vec!["retry when the device allows work".to_string()]),
        }
    }

    fn reject(&self, task_id: TaskId, reason: String, alternatives: Vec<String>) -> SubmitOutcome {
        if let Some(mut info) = self.tasks.get_mut(&task_id) {
            if info.transition(TaskStatus::Rejected).is_ok() {
                info.error = Some(reason.clone());
            }
        }
        info!(task_id = %task_id, reason = %reason, "Task rejected");
        self.publish_stats();
        SubmitOutcome::Rejected {
            task_id,
            reason,
            alternatives,
        }
    }

    fn enqueue(&self, task_id: TaskId, request: &TaskSubmitRequest, estimated_wait: Option<Duration>) -> SubmitOutcome {
        let position = {
            let mut queue = lock(&self.queue);
            if queue.len() >= self.config.scheduler.max_queue_len {
                None
            } else {
                queue.push_back(task_id);
                Some(queue.len())
            }
        };
        let Some(position) = position else {
            return self.reject(task_id, "task queue is full".to_string(), vec!["retry later".to_string()]);
        };
        if let Some(mut info) = self.tasks.get_mut(&task_id) {
            let _ = info.transition(TaskStatus::Queued);
        }
        let estimated_wait = estimated_wait
            .unwrap_or_else(|| queue_wait_estimate(position, request.requirements.estimated_duration));
        info!(task_id = %task_id, position, wait_ms = estimated_wait.as_millis() as u64, "Task queued");
        self.publish_stats();
        SubmitOutcome::Queued {
            task_id,
            position,
            estimated_wait,
        }
    }

    /// Start queued tasks in FIFO order while capacity lasts. Returns the
    /// number of tasks started.
    pub async fn drain_queue(self: &Arc<Self>) -> usize {
        let _draining = self.draining.lock().await;
        let mut started = 0;
        loop {
            let Some(task_id) = lock(&self.queue).pop_front() else {
                break;
            };
            let request = match self.tasks.get(&task_id) {
                Some(info) if info.status == TaskStatus::Queued => info.request.clone(),
                _ => continue,
            };
            match self.try_start(task_id, &request, &Dispatch::remote(request.priority)).await {
                Ok(Some(nodes)) => {
                    debug!(task_id = %task_id, nodes = ?nodes, "Started queued task");
                    started += 1;
                }
                Ok(None) | Err(_) => {
                    lock(&self.queue).push_front(task_id);
                    break;
                }
            }
        }
        if started > 0 {
            self.publish_stats();
        }
        started
    }

    // ------------------------------------------------------------------------
    // Placement
    // ------------------------------------------------------------------------

    fn local_satisfies(&self, request: &TaskSubmitRequest) -> bool {
        satisfies(&self.local_capabilities(), request)
    }

    fn local_capacity(&self) -> u32 {
        self.evolution
            .max_concurrent_tasks()
            .min(self.local_capabilities().max_concurrent_tasks)
            .max(1)
    }

    fn capacity_of(&self, node_id: &str) -> u32 {
        if node_id == self.local_id {
            return self.local_capacity();
        }
        self.registry
            .get(node_id)
            .map(|p| p.capabilities.max_concurrent_tasks)
            .unwrap_or(0)
    }

    pub(crate) fn try_reserve_slot(&self, node_id: &str) -> bool {
        let capacity = self.capacity_of(node_id);
        let mut used = self.slots.entry(node_id.to_string()).or_insert(0);
        if *used >= capacity {
            return false;
        }
        *used += 1;
        true
    }

    pub(crate) fn release_slot(&self, node_id: &str) {
        if let Some(mut used) = self.slots.get_mut(node_id) {
            *used = used.saturating_sub(1);
        }
    }

    /// Release every slot held by `task_id`. Safe to call more than once.
    fn release(&self, task_id: &TaskId) {
        if let Some((_, nodes)) = self.reservations.remove(task_id) {
            for node in &nodes {
                self.release_slot(node);
            }
            debug!(task_id = %task_id, nodes = ?nodes, "Released reservations");
        }
    }

    fn load_of(&self, peer: &PeerNode) -> f64 {
        if let Some(load) = self.peer_loads.get(&peer.id) {
            return *load;
        }
        let capacity = peer.capabilities.max_concurrent_tasks;
        if capacity == 0 {
            return 1.0;
        }
        f64::from(self.slots_in_use(&peer.id)) / f64::from(capacity)
    }

    fn candidates(&self) -> Vec<CandidateNode> {
        self.registry
            .peers()
            .iter()
            .map(|p| CandidateNode::from_peer(p, self.load_of(p)))
            .collect()
    }

    pub fn network_state(&self) -> NetworkState {
        self.network_state_at(Instant::now())
    }

    /// Network view as of `now`; a stale latency sample counts as no sample.
    pub(crate) fn network_state_at(&self, now: Instant) -> NetworkState {
        let latency = lock(&self.latency)
            .filter(|sample| now.saturating_duration_since(sample.at) <= LATENCY_SAMPLE_TTL)
            .map(|sample| sample.ms)
            .unwrap_or(0.0);
        NetworkState::new(self.candidates(), latency)
    }

    fn local_load(&self) -> f64 {
        f64::from(self.slots_in_use(&self.local_id)) / f64::from(self.local_capacity())
    }

    /// Reserve slots and start the task. `Ok(None)` means no capacity is
    /// free right now; `Err` carries a governor denial when nothing else
    /// could take the task.
    async fn try_start(
        self: &Arc<Self>,
        task_id: TaskId,
        request: &TaskSubmitRequest,
        dispatch: &Dispatch,
    ) -> SwarmResult<Option<Vec<NodeId>>> {
        let order = match dispatch.preference {
            Preference::Local => [Preference::Local, Preference::Remote],
            Preference::Remote => [Preference::Remote, Preference::Local],
        };
        let mut denial = None;
        for choice in order {
            let placement = match choice {
                Preference::Local => match self.reserve_local(request).await {
                    Ok(placed) => placed,
                    Err(err) => {
                        denial = Some(err);
                        None
                    }
                },
                Preference::Remote => self.reserve_remote(request, &dispatch.preferred),
            };
            if let Some(placement) = placement {
                let nodes = placement.nodes(&self.local_id);
                self.reservations.insert(task_id, nodes.clone());
                let wait = dispatch.remote_wait(request);
                self.start(task_id, request.clone(), placement, dispatch.priority, wait);
                return Ok(Some(nodes));
            }
        }
        match denial {
            Some(err) => Err(err),
            None => Ok(None),
        }
    }

    async fn reserve_local(&self, request: &TaskSubmitRequest) -> SwarmResult<Option<Placement>> {
        if !self.local_satisfies(request) || !self.try_reserve_slot(&self.local_id) {
            return Ok(None);
        }
        match self.ask_governor(request).await {
            GovernorDecision::Allowed => Ok(Some(Placement::Local)),
            GovernorDecision::Denied { reason } => {
                self.release_slot(&self.local_id);
                Err(ResourceError::GovernorDenied { reason }.into())
            }
        }
    }

    /// Reserve up to `max_parallel_nodes` peers: `preferred` first, in
    /// order, then the strategy's ranking. Only peers the strategy deems
    /// feasible are taken.
    fn reserve_remote(&self, request: &TaskSubmitRequest, preferred: &[NodeId]) -> Option<Placement> {
        let wanted = request.max_parallel_nodes.max(1) as usize;
        let ranked: Vec<NodeId> = self
            .strategy
            .rank(request, &self.candidates())
            .into_iter()
            .map(|allocation| allocation.node_id)
            .collect();
        let order = preferred
            .iter()
            .filter(|id| ranked.contains(id))
            .chain(ranked.iter().filter(|id| !preferred.contains(id)));

        let mut nodes: Vec<NodeId> = Vec::new();
        for node_id in order {
            if nodes.len() == wanted {
                break;
            }
            if self.try_reserve_slot(node_id) {
                nodes.push(node_id.clone());
            }
        }
        (!nodes.is_empty()).then_some(Placement::Remote(nodes))
    }

    pub(crate) async fn ask_governor(&self, request: &TaskSubmitRequest) -> GovernorDecision {
        let requirements = &request.requirements;
        self.governor
            .can_execute_task(
                requirements.min_memory_mb,
                requirements.estimated_duration.as_secs(),
                requirements.requires_npu,
            )
            .await
    }

    // ------------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------------

    fn start(
        self: &Arc<Self>,
        task_id: TaskId,
        request: TaskSubmitRequest,
        placement: Placement,
        priority: Priority,
        remote_wait: Duration,
    ) {
        if let Some(mut info) = self.tasks.get_mut(&task_id) {
            if let Err(err) = info.transition(TaskStatus::Assigned) {
                warn!(task_id = %task_id, error = %err, "Cannot assign task");
                drop(info);
                self.release(&task_id);
                return;
            }
            info.assigned_nodes = placement.nodes(&self.local_id);
        }
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run(task_id, request, placement, priority, remote_wait).await });
        self.handles.insert(task_id, handle);
    }

    async fn run(
        self: Arc<Self>,
        task_id: TaskId,
        request: TaskSubmitRequest,
        placement: Placement,
        priority: Priority,
        remote_wait: Duration,
    ) {
        let max_attempts = request.requirements.max_retries.saturating_add(1);
        let outcome = self
            .retry
            .run(max_attempts, |attempt| {
                let this = Arc::clone(&self);
                let request = request.clone();
                let placement = placement.clone();
                async move {
                    this.set_status(&task_id, TaskStatus::Running, attempt);
                    let result = this.attempt(task_id, &request, &placement, priority, remote_wait).await;
                    if let Err(err) = &result {
                        debug!(task_id = %task_id, attempt, error = %err, "Attempt failed");
                        if err.is_retryable() {
                            this.set_status(&task_id, TaskStatus::Retrying, attempt);
                        }
                    }
                    result
                }
            })
            .await;
        self.finish(task_id, &request, &placement, outcome).await;
    }

    fn set_status(&self, task_id: &TaskId, status: TaskStatus, attempt: u32) {
        if let Some(mut info) = self.tasks.get_mut(task_id) {
            if info.transition(status).is_ok() {
                // a retrying task counts the retry it is waiting for
                info.retry_count = match status {
                    TaskStatus::Retrying => attempt,
                    _ => attempt.saturating_sub(1),
                };
            }
        }
    }

    async fn attempt(
        &self,
        task_id: TaskId,
        request: &TaskSubmitRequest,
        placement: &Placement,
        priority: Priority,
        remote_wait: Duration,
    ) -> SwarmResult<Executed> {
        match placement {
            Placement::Local => {
                let result = tokio::time::timeout(request.timeout, self.execute_locally(request))
                    .await
                    .map_err(|_| TimeoutError::TaskTimedOut {
                        task_id,
                        timeout: request.timeout,
                    })??;
                Ok(Executed {
                    result,
                    quality: self.config.scheduler.local_answer_quality,
                })
            }
            Placement::Remote(nodes) => {
                self.attempt_remote(task_id, request, nodes, priority, remote_wait)
                    .await
            }
        }
    }

    /// Ask every assigned peer at once; the best answer wins and every
    /// peer's result is folded into the relation model.
    async fn attempt_remote(
        &self,
        task_id: TaskId,
        request: &TaskSubmitRequest,
        nodes: &[NodeId],
        priority: Priority,
        wait: Duration,
    ) -> SwarmResult<Executed> {
        let results = join_all(nodes.iter().map(|node| async move {
            let started = Instant::now();
            let result = self.ask_peer(task_id, request, node, priority, wait).await;
            (result, started.elapsed())
        }))
        .await;

        let mut best: Option<Executed> = None;
        let mut last_error = None;
        for (node, (result, elapsed)) in nodes.iter().zip(results) {
            let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
            match result {
                Ok(outcome) => {
                    let quality = outcome.quality.clamp(0.0, 1.0);
                    self.relations.record_collaboration(&CollaborationEvent::new(
                        node.clone(),
                        request.task_type,
                        true,
                        quality,
                        elapsed_ms,
                    ));
                    self.predictor.record_outcome(node, request.task_type, true);
                    self.observe_latency(elapsed_ms.saturating_sub(outcome.processing_time_ms) as f64);
                    let better = best.as_ref().map(|b| quality > b.quality).unwrap_or(true);
                    if better {
                        best = Some(Executed {
                            result: outcome.result.unwrap_or(serde_json::Value::Null),
                            quality,
                        });
                    }
                }
                Err(err) => {
                    self.relations.record_collaboration(&CollaborationEvent::new(
                        node.clone(),
                        request.task_type,
                        false,
                        0.0,
                        elapsed_ms,
                    ));
                    self.predictor.record_outcome(node, request.task_type, false);
                    last_error = Some(err);
                }
            }
        }
        match (best, last_error) {
            (Some(executed), _) => Ok(executed),
            (None, Some(err)) => Err(err),
            (None, None) => Err(ValidationError::InvalidValue {
                field: "assigned_nodes".to_string(),
                reason: "no nodes assigned".to_string(),
            }
            .into()),
        }
    }

    async fn ask_peer(
        &self,
        task_id: TaskId,
        request: &TaskSubmitRequest,
        node: &NodeId,
        priority: Priority,
        wait: Duration,
    ) -> SwarmResult<TaskOutcome> {
        let key = (task_id, node.clone());
        let (tx, rx) = oneshot::channel();
        self.responses.insert(key.clone(), tx);

        let message = SwarmMessage::new(
            self.local_id.clone(),
            MessagePayload::TaskRequest {
                task_id,
                request: request.clone(),
            },
        )
        .to(node.clone())
        .with_priority(priority);
        if let Err(err) = self.registry.send(node, &message).await {
            self.responses.remove(&key);
            return Err(err);
        }

        let outcome = match tokio::time::timeout(wait, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                return Err(TransportError::ConnectionReset {
                    peer_id: node.clone(),
                    reason: "response channel closed".to_string(),
                }
                .into())
            }
            Err(_) => {
                self.responses.remove(&key);
                return Err(TimeoutError::ResponseTimedOut {
                    peer_id: node.clone(),
                    timeout: wait,
                }
                .into());
            }
        };
        if outcome.success {
            Ok(outcome)
        } else {
            Err(InferenceError::GenerationFailed {
                reason: outcome
                    .error
                    .unwrap_or_else(|| format!("{node} could not execute the task")),
            }
            .into())
        }
    }

    /// Hand a peer's `TaskResponse` to the execution waiting for it.
    pub(crate) fn route_response(&self, sender: &str, outcome: TaskOutcome) -> bool {
        match self.responses.remove(&(outcome.task_id, sender.to_string())) {
            Some((_, tx)) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Run a task on this device's inference runtime.
    pub(crate) async fn execute_locally(&self, request: &TaskSubmitRequest) -> SwarmResult<serde_json::Value> {
        let prompt = || {
            request.prompt().ok_or_else(|| -> SwarmError {
                ValidationError::RequiredFieldMissing {
                    field: "prompt".to_string(),
                }
                .into()
            })
        };
        match request.task_type {
            TaskType::TextGeneration => {
                let answer = self.inference.generate(prompt()?, &GenerationParams::default()).await?;
                Ok(json!({ "answer": answer }))
            }
            TaskType::Summarization => {
                let instruction = format!("Summarize the following text:\n{}", prompt()?);
                let answer = self.inference.generate(&instruction, &GenerationParams::default()).await?;
                Ok(json!({ "answer": answer }))
            }
            TaskType::Translation => {
                let target = request
                    .input
                    .get("target_language")
                    .and_then(|l| l.as_str())
                    .unwrap_or("English");
                let instruction = format!("Translate the following text to {target}:\n{}", prompt()?);
                let answer = self.inference.generate(&instruction, &GenerationParams::default()).await?;
                Ok(json!({ "answer": answer }))
            }
            TaskType::Embedding => {
                let embedding = self.inference.get_embedding(prompt()?).await?;
                Ok(json!({ "embedding": embedding }))
            }
            TaskType::Transcription => {
                let samples: Vec<f32> = request
                    .input
                    .get("samples")
                    .and_then(|s| s.as_array())
                    .ok_or_else(|| ValidationError::RequiredFieldMissing {
                        field: "samples".to_string(),
                    })?
                    .iter()
                    .filter_map(|v| v.as_f64())
                    .map(|v| v as f32)
                    .collect();
                let language = request.input.get("language").and_then(|l| l.as_str());
                let transcription = self.inference.transcribe(&samples, language).await?;
                serde_json::to_value(transcription).map_err(|e| {
                    InferenceError::GenerationFailed {
                        reason: e.to_string(),
                    }
                    .into()
                })
            }
            TaskType::ImageAnalysis => Err(InferenceError::GenerationFailed {
                reason: "no vision runtime on this device".to_string(),
            }
            .into()),
        }
    }

    pub(crate) async fn embed(&self, text: &str) -> Option<Embedding> {
        if !self.inference.is_model_loaded() {
            return None;
        }
        self.inference.get_embedding(text).await.ok()
    }

    /// Fold a transport latency sample into the average. A stale average
    /// is replaced rather than smoothed.
    pub(crate) fn observe_latency(&self, sample_ms: f64) {
        let now = Instant::now();
        let mut latency = lock(&self.latency);
        let ms = match *latency {
            Some(previous) if now.saturating_duration_since(previous.at) <= LATENCY_SAMPLE_TTL => {
                previous.ms + LATENCY_SMOOTHING * (sample_ms - previous.ms)
            }
            _ => sample_ms,
        };
        *latency = Some(LatencySample { ms, at: now });
    }

    // ------------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------------

    async fn finish(
        &self,
        task_id: TaskId,
        request: &TaskSubmitRequest,
        placement: &Placement,
        outcome: RetryOutcome<Executed>,
    ) {
        self.release(&task_id);
        self.handles.remove(&task_id);

        let RetryOutcome { result, attempts } = outcome;
        let recorded = match self.tasks.get_mut(&task_id) {
            Some(mut info) => match &result {
                _ if info.status.is_terminal() => false,
                Ok(executed) => {
                    let done = info.transition(TaskStatus::Completed).is_ok();
                    if done {
                        info.result = Some(executed.result.clone());
                    }
                    done
                }
                Err(err) => {
                    let done = info.transition(TaskStatus::Failed).is_ok();
                    if done {
                        info.error = Some(err.to_string());
                        info.retry_count = attempts.saturating_sub(1);
                    }
                    done
                }
            },
            None => false,
        };
        if !recorded {
            debug!(task_id = %task_id, "Execution ended after the task was cancelled");
            return;
        }

        match result {
            Ok(executed) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                info!(task_id = %task_id, attempts, quality = executed.quality, "Task completed");
                self.learn_from_completion(request, placement, &executed).await;
            }
            Err(err) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(task_id = %task_id, attempts, error = %err, "Task failed");
            }
        }
        self.publish_stats();
    }

    async fn learn_from_completion(&self, request: &TaskSubmitRequest, placement: &Placement, executed: &Executed) {
        if request.task_type.is_cacheable() {
            if let (Some(prompt), Some(answer)) = (request.prompt(), answer_text(&executed.result)) {
                let embedding = self.embed(prompt).await;
                self.cache.store(prompt, embedding, answer, executed.quality);
                self.cache.evict_to_capacity();
            }
        }
        let experience = match placement {
            Placement::Local => experience_for(request.complexity),
            // coordinating earns a quarter
            Placement::Remote(helpers) => {
                self.share_observations(request.task_type, helpers, executed.quality)
                    .await;
                experience_for(request.complexity) / 4
            }
        };
        self.evolution.gain_experience(request.task_type, experience);
        self.resolve_predictions(request.task_type);
    }

    /// Score retained predictions against a task that just completed.
    /// Predictions of the same type are hits; otherwise the oldest
    /// prediction is counted as a miss.
    fn resolve_predictions(&self, task_type: TaskType) {
        let pending = self.predictor.pending_predictions();
        let hits: Vec<_> = pending.iter().filter(|p| p.task_type == task_type).collect();
        if hits.is_empty() {
            if let Some(oldest) = pending.first() {
                self.predictor.update_model(PredictionFeedback {
                    prediction_id: oldest.id,
                    outcome: FeedbackOutcome::Miss,
                });
            }
            return;
        }
        for prediction in hits {
            self.predictor.update_model(PredictionFeedback {
                prediction_id: prediction.id,
                outcome: FeedbackOutcome::Hit,
            });
        }
    }

    async fn answer_from_cache(&self, task_id: TaskId, request: &TaskSubmitRequest) -> Option<SubmitOutcome> {
        if !request.task_type.is_cacheable() {
            return None;
        }
        let prompt = request.prompt()?;
        let embedding = self.embed(prompt).await;
        let hit = self.cache.query(prompt, embedding).into_hit()?;

        if let Some(mut info) = self.tasks.get_mut(&task_id) {
            for status in [TaskStatus::Assigned, TaskStatus::Running, TaskStatus::Completed] {
                if info.transition(status).is_err() {
                    return None;
                }
            }
            info.assigned_nodes = vec![self.local_id.clone()];
            info.result = Some(json!({
                "answer": hit.entry.answer,
                "cached": true,
                "similarity": hit.similarity,
                "source": hit.entry.source_node,
            }));
        }
        self.completed.fetch_add(1, Ordering::Relaxed);
        info!(
            task_id = %task_id,
            similarity = hit.similarity,
            origin = ?hit.origin,
            "Answered from semantic cache"
        );
        self.resolve_predictions(request.task_type);
        self.publish_stats();
        Some(SubmitOutcome::Success {
            task_id,
            nodes: vec![self.local_id.clone()],
        })
    }

    // ------------------------------------------------------------------------
    // Cancellation & housekeeping
    // ------------------------------------------------------------------------

    /// Cancel a task: abort in-flight work, release its reservations and
    /// tell the assigned peers (best effort).
    pub async fn cancel_task(&self, task_id: &TaskId) -> SwarmResult<TaskInfo> {
        let info = {
            let mut info = self.tasks.get_mut(task_id).ok_or_else(|| ValidationError::NotFound {
                entity: "task".to_string(),
                id: task_id.to_string(),
            })?;
            info.transition(TaskStatus::Cancelled)?;
            info.error = Some("cancelled".to_string());
            info.clone()
        };

        if let Some((_, handle)) = self.handles.remove(task_id) {
            handle.abort();
        }
        self.responses.retain(|(id, _), _| id != task_id);
        self.release(task_id);
        lock(&self.queue).retain(|id| id != task_id);

        for node in &info.assigned_nodes {
            if *node == self.local_id {
                self.inference.stop_generation();
                continue;
            }
            let message = SwarmMessage::new(
                self.local_id.clone(),
                MessagePayload::TaskCancel {
                    task_id: *task_id,
                    reason: Some("cancelled by requester".to_string()),
                },
            )
            .to(node.clone());
            if let Err(err) = self.registry.send(node, &message).await {
                warn!(task_id = %task_id, peer_id = %node, error = %err, "Could not deliver cancellation");
            }
        }
        info!(task_id = %task_id, nodes = ?info.assigned_nodes, "Task cancelled");
        self.publish_stats();
        Ok(info)
    }

    pub fn purge_terminal(&self) -> usize {
        self.purge_terminal_at(Utc::now())
    }

    /// Forget terminal tasks that finished more than the grace period ago.
    pub fn purge_terminal_at(&self, now: Timestamp) -> usize {
        let grace_ms = i64::try_from(self.config.scheduler.terminal_grace.as_millis()).unwrap_or(i64::MAX);
        let before = self.tasks.len();
        self.tasks.retain(|_, info| match info.finished_at {
            Some(finished) if info.status.is_terminal() => {
                now.signed_duration_since(finished).num_milliseconds() <= grace_ms
            }
            _ => true,
        });
        self.handles.retain(|id, _| self.tasks.contains_key(id));
        let purged = before.saturating_sub(self.tasks.len());
        if purged > 0 {
            debug!(purged, "Purged terminal tasks");
        }
        purged
    }

    // ------------------------------------------------------------------------
    // Swarm upkeep
    // ------------------------------------------------------------------------

    /// Share the best cached answers with every peer.
    pub async fn gossip_cache(&self) -> Option<BroadcastReport> {
        let entries = self.cache.shareable(self.config.cache.share_limit);
        if entries.is_empty() {
            return None;
        }
        let count = entries.len();
        let message = SwarmMessage::new(self.local_id.clone(), MessagePayload::CacheShare { entries })
            .with_ttl(1)
            .with_priority(Priority::Low);
        let report = self.registry.broadcast(&message).await;
        debug!(entries = count, delivered = report.delivered, "Gossiped cache entries");
        Some(report)
    }

    /// Tell peers this device is alive and how busy it is.
    pub async fn send_heartbeat(&self) -> BroadcastReport {
        let capabilities = self.local_capabilities();
        let message = SwarmMessage::new(
            self.local_id.clone(),
            MessagePayload::NodeHeartbeat {
                load: self.local_load().clamp(0.0, 1.0),
                available_memory_mb: capabilities
                    .available_memory_mb
                    .min(self.inference.available_memory_mb()),
                active_tasks: self.slots_in_use(&self.local_id),
            },
        )
        .with_ttl(1);
        self.registry.broadcast(&message).await
    }

    /// Drop peers that went silent, along with what was learned about
    /// their load.
    pub fn evict_silent_peers(&self) -> Vec<NodeId> {
        let evicted = self
            .registry
            .evict_silent(self.config.transport.max_silence, Utc::now());
        for peer_id in &evicted {
            self.peer_loads.remove(peer_id);
            self.predictor.forget_node(peer_id);
        }
        if !evicted.is_empty() {
            self.publish_stats();
        }
        evicted
    }

    fn remember_submission(&self, task_type: TaskType) {
        let mut recent = lock(&self.recent);
        recent.push_back((Utc::now(), task_type));
        while recent.len() > RECENT_SUBMISSIONS {
            recent.pop_front();
        }
    }

    /// Forecast upcoming needs from recent submissions.
    pub fn forecast_needs(&self) -> Vec<pulse_predict::Prediction> {
        let now = Utc::now();
        let (interactions, recent_types) = {
            let recent = lock(&self.recent);
            let hour_ago = now - chrono::Duration::hours(1);
            let interactions = recent.iter().filter(|(at, _)| *at >= hour_ago).count();
            let types: Vec<TaskType> = recent.iter().map(|(_, t)| *t).collect();
            (u32::try_from(interactions).unwrap_or(u32::MAX), types)
        };
        let mut context = PredictionContext::at(now).with_recent(interactions, recent_types.clone());
        if let Some(topic) = recent_types.last() {
            context = context.with_session_topic(*topic);
        }
        self.predictor.predict_next_needs(&context)
    }

    // ------------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------------

    pub fn stats(&self) -> NetworkStats {
        let network = self.network_state();
        let active_tasks = self
            .tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Assigned | TaskStatus::Running | TaskStatus::Retrying))
            .count();
        NetworkStats {
            known_peers: self.registry.len(),
            connected_peers: self.registry.connected_count(),
            active_tasks,
            queued_tasks: self.queue_len(),
            completed_tasks: self.completed.load(Ordering::Relaxed),
            failed_tasks: self.failed.load(Ordering::Relaxed),
            average_latency_ms: network.average_latency_ms,
            average_load: network.average_load,
        }
    }

    pub fn subscribe_stats(&self) -> WatchStream<NetworkStats> {
        WatchStream::new(self.stats_tx.subscribe())
    }

    pub(crate) fn publish_stats(&self) {
        let stats = self.stats();
        self.stats_tx.send_replace(stats);
    }
}

fn satisfies(capabilities: &NodeCapabilities, request: &TaskSubmitRequest) -> bool {
    capabilities.satisfies(request.requirements.min_memory_mb, request.requirements.requires_npu)
}

/// Why no device can take `request`, and what the caller could relax.
fn hard_requirement_gap(
    request: &TaskSubmitRequest,
    local: &NodeCapabilities,
    peers: &[PeerNode],
) -> (String, Vec<String>) {
    let requirements = &request.requirements;
    let devices = || std::iter::once(local).chain(peers.iter().map(|p| &p.capabilities));
    let mut reasons = Vec::new();
    let mut alternatives = Vec::new();

    if requirements.requires_npu && !devices().any(|c| c.has_npu) {
        reasons.push(ResourceError::NpuRequired.to_string());
        alternatives.push("relax NPU requirement".to_string());
    }
    let best_memory = devices()
        .filter(|c| !requirements.requires_npu || c.has_npu)
        .map(|c| c.available_memory_mb)
        .max()
        .unwrap_or(0);
    if best_memory < requirements.min_memory_mb {
        reasons.push(
            ResourceError::InsufficientMemory {
                required_mb: requirements.min_memory_mb,
                available_mb: best_memory,
            }
            .to_string(),
        );
        if best_memory > 0 {
            alternatives.push(format!("reduce min_memory_mb to {best_memory}"));
        }
    }
    if reasons.is_empty() {
        reasons.push("no device satisfies the task's hard requirements".to_string());
    }
    alternatives.push("wait for a more capable peer to join".to_string());
    (reasons.join("; "), alternatives)
}

// ============================================================================
// TESTS
// ============================================================================
