//! The pipeline scheduler.
//!
//! Nodes are dispatched the moment every predecessor has succeeded, in
//! declaration order among those ready, up to the concurrency limit. Each
//! dispatched node runs as its own tokio task that owns its handler and
//! sandbox; the scheduler loop owns every node record and the state store
//! and is the only place either changes.

use super::graph::ExecutionGraph;
use super::node::{ExecutionNode, FailureKind, NodeStatus, SkipReason};
use super::report::{NodeReport, PipelineReport};
use super::retry::{Clock, RetryEngine, RetryEvent, RetryOutcome, TokioClock};
use crate::cancellation::CancellationToken;
use crate::config::{BlastRadius, InstanceId, IsolationDescriptor, PipelineSpec};
use crate::errors::{ExecutionError, OrchestratorError, StateError, TaskError, TaskErrorKind};
use crate::events::{
    EventSink, NoOpEventSink, NODE_CLEANUP_FAILED, NODE_FAILED, NODE_RETRYING, NODE_SKIPPED, NODE_STARTED,
    NODE_SUCCEEDED, PIPELINE_CANCELLED, PIPELINE_COMPLETED, PIPELINE_STARTED,
};
use crate::handler::{sandbox_for, HandlerLifecycle, HandlerState, TaskHandler, TaskInit};
use crate::reference::Resolver;
use crate::registry::TaskRegistry;
use crate::state::{backend_from_config, PipelineStateStore, StateBackend, StateExporter};
use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type Running = FuturesUnordered<BoxFuture<'static, (usize, Result<NodeCompletion, JoinError>)>>;

/// Progress sent from a node task to the scheduler loop.
#[derive(Debug)]
struct NodeUpdate {
    index: usize,
    event: RetryEvent,
}

#[derive(Debug)]
enum NodeResult {
    Succeeded {
        outputs: Map<String, Value>,
        transient_state: Map<String, Value>,
    },
    Failed {
        kind: FailureKind,
        error: String,
    },
}

/// What a node task hands back when it is done with its handler.
#[derive(Debug)]
struct NodeCompletion {
    result: NodeResult,
    attempts: u32,
    handler_state: HandlerState,
    cleanup_error: Option<String>,
    state_errors: Vec<StateError>,
}

/// Everything a node task needs, owned.
struct NodeJob {
    index: usize,
    id: InstanceId,
    config: Value,
    stack_identifier: String,
    isolation: IsolationDescriptor,
    handler: Box<dyn TaskHandler>,
    engine: RetryEngine,
    exporter: StateExporter,
    timeout: Duration,
    grace: Duration,
}

/// Mutable bookkeeping for one run.
struct RunState {
    nodes: Vec<ExecutionNode>,
    remaining: Vec<usize>,
    ready: BTreeSet<usize>,
    store: PipelineStateStore,
    state_errors: Vec<StateError>,
    cancelled: bool,
    aborted: bool,
}

impl RunState {
    fn new(graph: &ExecutionGraph) -> Self {
        let nodes: Vec<ExecutionNode> = graph
            .node_ids()
            .iter()
            .enumerate()
            .map(|(i, id)| ExecutionNode::new(id.clone(), i))
            .collect();
        let remaining: Vec<usize> = (0..nodes.len()).map(|i| graph.predecessors(i).len()).collect();
        let ready = (0..nodes.len()).filter(|&i| remaining[i] == 0).collect();
        Self {
            nodes,
            remaining,
            ready,
            store: PipelineStateStore::new(),
            state_errors: Vec::new(),
            cancelled: false,
            aborted: false,
        }
    }

    fn record(&mut self, result: Result<(), StateError>) {
        if let Err(e) = result {
            error!(error = %e, "Pipeline bookkeeping error");
            self.state_errors.push(e);
        }
    }

    fn accepting(&self) -> bool {
        !self.cancelled && !self.aborted
    }
}

/// Runs a pipeline.
///
/// # Example
///
/// ```rust,ignore
/// let orchestrator = Orchestrator::new(spec, registry)?
///     .with_event_sink(Arc::new(LoggingEventSink::info()));
/// let report = orchestrator.run(Arc::new(CancellationToken::new())).await;
/// std::process::exit(report.exit_code());
/// ```
pub struct Orchestrator {
    spec: Arc<PipelineSpec>,
    graph: ExecutionGraph,
    registry: Arc<TaskRegistry>,
    backend: Arc<dyn StateBackend>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    max_concurrency: Option<usize>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("pipeline", &self.spec.name)
            .field("nodes", &self.graph.len())
            .field("max_concurrency", &self.max_concurrency)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Builds the execution graph and checks every task type is loaded.
    pub fn new(spec: PipelineSpec, registry: TaskRegistry) -> Result<Self, OrchestratorError> {
        let graph = ExecutionGraph::build(&spec)?;
        for task_type in spec.task_types() {
            registry.constructor(task_type)?;
        }
        Ok(Self {
            backend: backend_from_config(&spec.core.state_backend),
            max_concurrency: spec.core.max_concurrency,
            spec: Arc::new(spec),
            graph,
            registry: Arc::new(registry),
            sink: Arc::new(NoOpEventSink),
            clock: Arc::new(TokioClock),
        })
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Replaces the configured state backend.
    #[must_use]
    pub fn with_state_backend(mut self, backend: Arc<dyn StateBackend>) -> Self {
        self.backend = backend;
        self
    }

    /// Sets the clock used for retry backoff.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Caps the number of nodes running at once. Zero is treated as one.
    #[must_use]
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit.max(1));
        self
    }

    /// Returns the pipeline.
    #[must_use]
    pub fn spec(&self) -> &PipelineSpec {
        &self.spec
    }

    /// Returns the execution graph.
    #[must_use]
    pub fn graph(&self) -> &ExecutionGraph {
        &self.graph
    }

    /// Runs every node and returns the report.
    ///
    /// Never fails: node failures, cancellation and bookkeeping errors are
    /// all reported, with whatever outputs were stored before they happened.
    pub async fn run(&self, cancel: Arc<CancellationToken>) -> PipelineReport {
        let run_id = Uuid::now_v7();
        let started_at = Utc::now();
        let mut run = RunState::new(&self.graph);
        let mut running: Running = FuturesUnordered::new();
        let (updates_tx, mut updates_rx) = mpsc::unbounded_channel::<NodeUpdate>();

        info!(
            run_id = %run_id,
            pipeline = %self.spec.name,
            nodes = self.graph.len(),
            max_concurrency = ?self.max_concurrency,
            "Starting pipeline"
        );
        self.sink
            .emit(
                PIPELINE_STARTED,
                Some(json!({
                    "run_id": run_id.to_string(),
                    "pipeline": &self.spec.name,
                    "nodes": self.graph.len(),
                })),
            )
            .await;

        loop {
            if !run.cancelled && cancel.is_cancelled() {
                self.handle_cancellation(&mut run, &cancel).await;
            }
            if run.accepting() {
                self.dispatch_ready(&mut run, &mut running, &updates_tx, &cancel).await;
            }
            if running.is_empty() {
                break;
            }

            tokio::select! {
                () = cancel.cancelled(), if !run.cancelled => {}
                Some(update) = updates_rx.recv() => self.apply_update(&mut run, update).await,
                Some((index, joined)) = running.next() => {
                    // Progress sent before the task finished must land first.
                    while let Ok(update) = updates_rx.try_recv() {
                        self.apply_update(&mut run, update).await;
                    }
                    self.complete(&mut run, index, joined).await;
                }
            }
        }

        let leftover: Vec<usize> = (0..run.nodes.len())
            .filter(|&i| run.nodes[i].status() == NodeStatus::Pending)
            .collect();
        if !leftover.is_empty() {
            let names: Vec<String> = leftover.iter().map(|&i| run.nodes[i].id.to_string()).collect();
            run.record(Err(StateError::new(format!(
                "Deadlocked execution graph; remaining nodes: {names:?}"
            ))));
            self.skip_pending(&mut run, SkipReason::Aborted).await;
        }

        let finished_at = Utc::now();
        let report = PipelineReport {
            run_id,
            pipeline: self.spec.name.clone(),
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds(),
            nodes: run.nodes.iter().map(NodeReport::from).collect(),
            snapshot: run.store.snapshot(),
            cancelled: run.cancelled,
            aborted: run.aborted,
            state_errors: run.state_errors.iter().map(ToString::to_string).collect(),
        };

        info!(
            run_id = %run_id,
            exit_code = report.exit_code(),
            duration_ms = report.duration_ms,
            succeeded = report.nodes_with_status(NodeStatus::Succeeded).len(),
            failed = report.nodes_with_status(NodeStatus::Failed).len(),
            skipped = report.nodes_with_status(NodeStatus::Skipped).len(),
            "Pipeline finished"
        );
        self.sink
            .emit(
                PIPELINE_COMPLETED,
                Some(json!({
                    "run_id": run_id.to_string(),
                    "pipeline": &self.spec.name,
                    "success": report.is_success(),
                    "exit_code": report.exit_code(),
                    "duration_ms": report.duration_ms,
                })),
            )
            .await;

        report
    }

    async fn dispatch_ready(
        &self,
        run: &mut RunState,
        running: &mut Running,
        updates: &mpsc::UnboundedSender<NodeUpdate>,
        cancel: &Arc<CancellationToken>,
    ) {
        while run.accepting() {
            if self.max_concurrency.is_some_and(|limit| running.len() >= limit) {
                break;
            }
            let Some(index) = run.ready.pop_first() else {
                break;
            };
            self.dispatch(run, running, index, updates, cancel).await;
        }
    }

    async fn dispatch(
        &self,
        run: &mut RunState,
        running: &mut Running,
        index: usize,
        updates: &mpsc::UnboundedSender<NodeUpdate>,
        cancel: &Arc<CancellationToken>,
    ) {
        let id = run.nodes[index].id.clone();
        let Some(instance) = self.spec.instance(&id) else {
            run.record(Err(StateError::new("node has no declared instance").with_instance(id.to_string())));
            self.fail_node(run, index, FailureKind::Internal, "node has no declared instance".to_string())
                .await;
            return;
        };

        let snapshot = run.store.snapshot();
        let config = match Resolver::new(&self.spec.secrets, &snapshot).resolve(&id, &instance.template) {
            Ok(config) => config,
            Err(e) => {
                self.fail_node(run, index, FailureKind::Reference, e.to_string()).await;
                return;
            }
        };

        let handler = match self.registry.constructor(&instance.task_type) {
            Ok(constructor) => constructor(),
            Err(e) => {
                self.fail_node(run, index, FailureKind::Initialization, e.to_string()).await;
                return;
            }
        };

        let result = run.nodes[index].transition(NodeStatus::Running);
        run.record(result);
        run.nodes[index].resolved_config = Some(config.clone());

        let timeout = instance.timeout(self.spec.core.timeout());
        let job = NodeJob {
            index,
            config,
            stack_identifier: self.spec.stack_identifier(&id),
            isolation: instance.isolation.clone(),
            handler,
            engine: RetryEngine::new(instance.retry_policy(&self.spec.core.execution_defaults.retry), timeout)
                .with_clock(Arc::clone(&self.clock)),
            exporter: StateExporter::new(Arc::clone(&self.backend), self.spec.stack_name(), id.clone()),
            timeout,
            grace: self.spec.core.cancellation_grace(),
            id: id.clone(),
        };

        debug!(instance = %id, running = running.len() + 1, "Dispatching node");
        self.sink
            .emit(NODE_STARTED, Some(json!({ "node": id.to_string(), "task_type": id.task_type() })))
            .await;

        let handle = tokio::spawn(run_node(job, updates.clone(), Arc::clone(cancel)));
        running.push(handle.map(move |joined| (index, joined)).boxed());
    }

    async fn apply_update(&self, run: &mut RunState, update: NodeUpdate) {
        let node = &mut run.nodes[update.index];
        let result = match update.event {
            RetryEvent::AttemptStarted { attempt } => {
                node.attempts = attempt;
                if node.status() == NodeStatus::Retrying {
                    node.transition(NodeStatus::Running)
                } else {
                    Ok(())
                }
            }
            RetryEvent::RetryScheduled { attempt, delay, error } => {
                node.last_error = Some(error.to_string());
                let id = node.id.to_string();
                let result = node.transition(NodeStatus::Retrying);
                warn!(
                    instance = %id,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "Node attempt failed; retrying"
                );
                self.sink
                    .emit(
                        NODE_RETRYING,
                        Some(json!({
                            "node": id,
                            "attempt": attempt,
                            "delay_ms": u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            "error": error.to_string(),
                        })),
                    )
                    .await;
                result
            }
        };
        run.record(result);
    }

    async fn complete(&self, run: &mut RunState, index: usize, joined: Result<NodeCompletion, JoinError>) {
        let completion = match joined {
            Ok(completion) => completion,
            Err(e) => {
                self.fail_node(run, index, FailureKind::Execution, format!("node task panicked: {e}"))
                    .await;
                return;
            }
        };

        let id = run.nodes[index].id.clone();
        {
            let node = &mut run.nodes[index];
            node.attempts = node.attempts.max(completion.attempts);
            node.handler_state = Some(completion.handler_state);
            node.cleanup_error.clone_from(&completion.cleanup_error);
        }
        for e in completion.state_errors {
            run.record(Err(e));
        }

        if let Some(cleanup_error) = &completion.cleanup_error {
            warn!(instance = %id, error = %cleanup_error, "Node cleanup failed");
            self.sink
                .emit(
                    NODE_CLEANUP_FAILED,
                    Some(json!({ "node": id.to_string(), "error": cleanup_error })),
                )
                .await;
        }

        match completion.result {
            NodeResult::Succeeded {
                outputs,
                transient_state,
            } => {
                let attempt = completion.attempts;
                if let Err(e) = run.store.store(&id, attempt, outputs, transient_state) {
                    let message = e.to_string();
                    run.record(Err(e));
                    self.fail_node(run, index, FailureKind::Internal, message).await;
                    return;
                }
                if completion.cleanup_error.is_none() {
                    let result = run.store.clear_transient(&id);
                    run.record(result);
                }
                let result = run.nodes[index].transition(NodeStatus::Succeeded);
                run.record(result);

                info!(instance = %id, attempts = attempt, "Node succeeded");
                self.sink
                    .emit(NODE_SUCCEEDED, Some(json!({ "node": id.to_string(), "attempts": attempt })))
                    .await;

                for &next in self.graph.successors(index) {
                    run.remaining[next] = run.remaining[next].saturating_sub(1);
                    if run.remaining[next] == 0 && run.nodes[next].status() == NodeStatus::Pending {
                        run.ready.insert(next);
                    }
                }
            }
            NodeResult::Failed { kind, error } => {
                self.fail_node(run, index, kind, error).await;
            }
        }
    }

    /// Fails a node, skips its dependents and applies the blast radius.
    async fn fail_node(&self, run: &mut RunState, index: usize, kind: FailureKind, error: String) {
        let id = run.nodes[index].id.to_string();
        warn!(instance = %id, failure = ?kind, error = %error, "Node failed");
        let result = run.nodes[index].fail(kind, error.clone());
        run.record(result);
        self.sink
            .emit(
                NODE_FAILED,
                Some(json!({
                    "node": &id,
                    "failure": kind,
                    "error": error,
                    "attempts": run.nodes[index].attempts,
                })),
            )
            .await;

        for dependent in self.graph.dependents(index) {
            if run.nodes[dependent].status() != NodeStatus::Pending {
                continue;
            }
            run.ready.remove(&dependent);
            self.skip_node(run, dependent, SkipReason::UpstreamFailed, Some(&id)).await;
        }

        if self.spec.core.blast_radius == BlastRadius::Pipeline && !run.aborted {
            warn!(instance = %id, "Aborting pipeline after node failure");
            run.aborted = true;
            self.skip_pending(run, SkipReason::Aborted).await;
        }
    }

    async fn handle_cancellation(&self, run: &mut RunState, cancel: &CancellationToken) {
        run.cancelled = true;
        let reason = cancel.reason().unwrap_or_default();
        warn!(reason = %reason, "Pipeline cancelled; no further nodes will start");
        self.sink
            .emit(PIPELINE_CANCELLED, Some(json!({ "pipeline": &self.spec.name, "reason": reason })))
            .await;
        self.skip_pending(run, SkipReason::Cancelled).await;
    }

    async fn skip_pending(&self, run: &mut RunState, reason: SkipReason) {
        run.ready.clear();
        for index in 0..run.nodes.len() {
            if run.nodes[index].status() == NodeStatus::Pending {
                self.skip_node(run, index, reason, None).await;
            }
        }
    }

    async fn skip_node(&self, run: &mut RunState, index: usize, reason: SkipReason, cause: Option<&str>) {
        let result = run.nodes[index].skip(reason);
        run.record(result);
        let id = run.nodes[index].id.to_string();
        debug!(instance = %id, reason = ?reason, cause = ?cause, "Node skipped");
        self.sink
            .emit(NODE_SKIPPED, Some(json!({ "node": id, "reason": reason, "cause": cause })))
            .await;
    }
}

fn failure_kind(error: &TaskError) -> FailureKind {
    match &error.kind {
        TaskErrorKind::Isolation => FailureKind::Isolation,
        TaskErrorKind::Execution { name } if name == "TimeoutError" => FailureKind::Timeout,
        _ => FailureKind::Execution,
    }
}

fn advance(lifecycle: &mut HandlerLifecycle, next: HandlerState, id: &InstanceId, errors: &mut Vec<StateError>) {
    if let Err(e) = lifecycle.transition(next) {
        errors.push(e.with_instance(id.to_string()));
    }
}

/// Completes `grace` after cancellation is requested.
async fn grace_elapsed(cancel: &CancellationToken, grace: Duration) {
    cancel.cancelled().await;
    tokio::time::sleep(grace).await;
}

fn cancelled_result(id: &InstanceId, cancel: &CancellationToken, grace: Duration, phase: &str) -> NodeResult {
    warn!(
        instance = %id,
        phase,
        grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
        "Force-stopping node after cancellation grace period"
    );
    NodeResult::Failed {
        kind: FailureKind::Cancelled,
        error: format!(
            "cancelled during {phase}: {}",
            cancel.reason().unwrap_or_else(|| "no reason given".to_string())
        ),
    }
}

/// Drives one handler through its lifecycle inside its own task.
async fn run_node(
    job: NodeJob,
    updates: mpsc::UnboundedSender<NodeUpdate>,
    cancel: Arc<CancellationToken>,
) -> NodeCompletion {
    let NodeJob {
        index,
        id,
        config,
        stack_identifier,
        isolation,
        mut handler,
        engine,
        exporter,
        timeout,
        grace,
    } = job;

    let sandbox = sandbox_for(&isolation, &id);
    let mut lifecycle = HandlerLifecycle::new();
    let mut state_errors = Vec::new();
    let mut attempts = 0;

    let init = TaskInit {
        name: id.name().to_string(),
        config,
        stack_identifier,
        sandbox: Arc::clone(&sandbox),
    };

    let initialized = tokio::select! {
        biased;
        result = tokio::time::timeout(timeout, handler.initialize(init)) => Some(result),
        () = grace_elapsed(&cancel, grace) => None,
    };

    let result = match initialized {
        None => {
            advance(&mut lifecycle, HandlerState::Failed, &id, &mut state_errors);
            cancelled_result(&id, &cancel, grace, "initialize")
        }
        Some(Err(_)) => {
            debug!(instance = %id, "Initialization timed out");
            advance(&mut lifecycle, HandlerState::Failed, &id, &mut state_errors);
            NodeResult::Failed {
                kind: FailureKind::Timeout,
                error: format!("initialize exceeded {:.1}s", timeout.as_secs_f64()),
            }
        }
        Some(Ok(Err(e))) => {
            debug!(instance = %id, error = %e, "Initialization failed");
            advance(&mut lifecycle, HandlerState::Failed, &id, &mut state_errors);
            let kind = if matches!(e.kind, TaskErrorKind::Isolation) {
                FailureKind::Isolation
            } else {
                FailureKind::Initialization
            };
            NodeResult::Failed {
                kind,
                error: e.to_string(),
            }
        }
        Some(Ok(Ok(()))) => {
            advance(&mut lifecycle, HandlerState::Initialized, &id, &mut state_errors);
            advance(&mut lifecycle, HandlerState::Executing, &id, &mut state_errors);

            let outcome = {
                let mut observer = |event: RetryEvent| {
                    if let RetryEvent::AttemptStarted { attempt } = &event {
                        attempts = *attempt;
                    }
                    // The loop only goes away once every node task has finished.
                    let _ = updates.send(NodeUpdate { index, event });
                };
                let execution = engine.execute(handler.as_mut(), &mut observer);
                tokio::select! {
                    biased;
                    outcome = execution => Some(outcome),
                    () = grace_elapsed(&cancel, grace) => None,
                }
            };

            match outcome {
                Some(RetryOutcome { result: Ok(out), .. }) => {
                    advance(&mut lifecycle, HandlerState::Succeeded, &id, &mut state_errors);
                    let mut outputs = out.outputs;
                    outputs.extend(handler.get_output_data());
                    NodeResult::Succeeded {
                        outputs,
                        transient_state: out.transient_state,
                    }
                }
                Some(RetryOutcome { result: Err(e), attempts }) => {
                    advance(&mut lifecycle, HandlerState::Failed, &id, &mut state_errors);
                    let error = ExecutionError::new(id.to_string(), attempts, e);
                    NodeResult::Failed {
                        kind: failure_kind(&error.last_error),
                        error: error.to_string(),
                    }
                }
                None => {
                    advance(&mut lifecycle, HandlerState::Failed, &id, &mut state_errors);
                    cancelled_result(&id, &cancel, grace, "execute")
                }
            }
        }
    };

    let mut cleanup_errors = Vec::new();
    if lifecycle.needs_cleanup() {
        match tokio::time::timeout(timeout, handler.cleanup(&exporter)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => cleanup_errors.push(e.to_string()),
            Err(_) => cleanup_errors.push(format!("cleanup exceeded {:.1}s", timeout.as_secs_f64())),
        }
        advance(&mut lifecycle, HandlerState::Cleaned, &id, &mut state_errors);
    }
    if let Err(e) = sandbox.teardown().await {
        cleanup_errors.push(e.to_string());
    }

    NodeCompletion {
        result,
        attempts,
        handler_state: lifecycle.state(),
        cleanup_error: (!cleanup_errors.is_empty()).then(|| cleanup_errors.join("; ")),
        state_errors,
    }
}
