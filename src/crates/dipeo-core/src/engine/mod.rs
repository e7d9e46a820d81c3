//! Scheduler loop and execution engine
//!
//! One engine serves many executions; one spawned scheduler task owns each
//! execution's state mutation. Per tick the loop computes the ready set,
//! dispatches ready nodes as concurrent tasks (bounded by
//! `max_concurrent_nodes`), then awaits the next completion, control signal,
//! heartbeat, or timeout. Handlers run off-thread and only ever read the
//! context; every write (state transitions, outputs, staged variables,
//! branch decisions) happens back on the scheduler when a task completes.

mod options;
mod scheduler;

pub use options::ExecutionOptions;

use futures::FutureExt;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::diagram::{ExecutableDiagram, NodeId, NodeType, BRANCH_FALSE};
use crate::envelope::Envelope;
use crate::events::{EventBus, EventStream, EventType};
use crate::handlers::{HandlerRegistry, HandlerCtx, HookEvent, HookMailbox, VARIABLES_TO_SET};
use crate::resolve::resolve_inputs;
use crate::services::ServiceRegistry;
use crate::state::{ExecutionContext, ExecutionState, ExecutionStatus, Status, TokenUsage};

/// Engine-internal failure modes; everything else is per-node and reported
/// through events rather than errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("scheduler deadlock: no node can advance ({0})")]
    Deadlock(String),

    #[error("execution exceeded {0} seconds")]
    Timeout(u64),

    #[error("internal invariant violation: {0}")]
    Internal(String),
}

/// Control signals accepted by a running execution.
#[derive(Debug)]
pub enum ControlSignal {
    Pause,
    Resume,
    Abort,
    SkipNode(NodeId),
    Hook(HookEvent),
}

/// Handle returned by [`ExecutionEngine::execute`].
pub struct ExecutionHandle {
    pub execution_id: String,
    events: Option<EventStream>,
    ctrl: mpsc::UnboundedSender<ControlSignal>,
    join: tokio::task::JoinHandle<ExecutionState>,
    context: Arc<ExecutionContext>,
}

impl ExecutionHandle {
    /// Take the pre-attached event stream (attached before the first event
    /// was published). Callable once.
    pub fn take_events(&mut self) -> Option<EventStream> {
        self.events.take()
    }

    pub fn pause(&self) {
        let _ = self.ctrl.send(ControlSignal::Pause);
    }

    pub fn resume(&self) {
        let _ = self.ctrl.send(ControlSignal::Resume);
    }

    pub fn abort(&self) {
        let _ = self.ctrl.send(ControlSignal::Abort);
    }

    pub fn skip_node(&self, node_id: impl Into<NodeId>) {
        let _ = self.ctrl.send(ControlSignal::SkipNode(node_id.into()));
    }

    pub fn send_hook_event(&self, name: impl Into<String>, payload: Value) {
        let _ = self
            .ctrl
            .send(ControlSignal::Hook(HookEvent { name: name.into(), payload }));
    }

    /// Current state snapshot; usable while the execution is still running.
    pub fn snapshot(&self) -> ExecutionState {
        self.context.snapshot()
    }

    /// Await the scheduler task and return the final state.
    pub async fn wait(self) -> ExecutionState {
        match self.join.await {
            Ok(state) => state,
            Err(e) => {
                tracing::error!("scheduler task panicked: {e}");
                self.context.set_execution_status(ExecutionStatus::Failed);
                self.context.snapshot()
            }
        }
    }
}

/// The diagram execution engine.
pub struct ExecutionEngine {
    handlers: HandlerRegistry,
    bus: Arc<EventBus>,
}

impl ExecutionEngine {
    pub fn new(handlers: HandlerRegistry, bus: Arc<EventBus>) -> Self {
        Self { handlers, bus }
    }

    /// Engine with the built-in handler set and a fresh event bus.
    pub fn with_builtins() -> Self {
        Self::new(HandlerRegistry::builtin(), Arc::new(EventBus::new()))
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    /// Start executing a compiled diagram. Returns immediately; drive the
    /// run through the handle's event stream or `wait()`.
    pub fn execute(
        &self,
        diagram: Arc<ExecutableDiagram>,
        options: ExecutionOptions,
        services: ServiceRegistry,
    ) -> ExecutionHandle {
        let execution_id = Uuid::new_v4().to_string();
        let context = Arc::new(ExecutionContext::new(&execution_id, &diagram));
        context.set_variables(options.variables.clone());
        context.set_execution_status(ExecutionStatus::Running);

        let events = self.bus.subscribe(&execution_id);
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();

        let scheduler = Scheduler {
            execution_id: execution_id.clone(),
            diagram,
            context: context.clone(),
            services,
            options: Arc::new(options),
            handlers: self.handlers.clone(),
            bus: self.bus.clone(),
            hooks: Arc::new(HookMailbox::default()),
        };
        let join = tokio::spawn(scheduler.run(ctrl_rx));

        ExecutionHandle {
            execution_id,
            events: Some(events),
            ctrl: ctrl_tx,
            join,
            context,
        }
    }

    /// Convenience wrapper: execute and await the final state.
    pub async fn run_to_completion(
        &self,
        diagram: Arc<ExecutableDiagram>,
        options: ExecutionOptions,
        services: ServiceRegistry,
    ) -> ExecutionState {
        self.execute(diagram, options, services).wait().await
    }
}

/// Outcome of one node task, applied on the scheduler side.
struct NodeOutcome {
    node_id: NodeId,
    started: Instant,
    result: Result<Envelope, NodeFailure>,
}

struct NodeFailure {
    message: String,
    kind: &'static str,
}

struct Scheduler {
    execution_id: String,
    diagram: Arc<ExecutableDiagram>,
    context: Arc<ExecutionContext>,
    services: ServiceRegistry,
    options: Arc<ExecutionOptions>,
    handlers: HandlerRegistry,
    bus: Arc<EventBus>,
    hooks: Arc<HookMailbox>,
}

impl Scheduler {
    async fn run(self, mut ctrl: mpsc::UnboundedReceiver<ControlSignal>) -> ExecutionState {
        self.publish(
            EventType::ExecutionStarted,
            None,
            json!({ "diagram_id": self.diagram.id }),
        );

        let deadline = self
            .options
            .timeout_seconds
            .map(|s| Instant::now() + std::time::Duration::from_secs(s));
        let heartbeat = std::time::Duration::from_secs(self.options.heartbeat_seconds.max(1));

        let mut tasks: JoinSet<NodeOutcome> = JoinSet::new();
        let mut in_flight: HashSet<NodeId> = HashSet::new();
        let mut paused = false;
        let mut aborted = false;
        let mut first_failure: Option<(NodeId, String)> = None;

        let final_status = 'main: loop {
            // Drain pending control signals before scheduling.
            while let Ok(signal) = ctrl.try_recv() {
                self.handle_signal(signal, &mut paused, &mut aborted, &mut tasks, &mut in_flight);
            }
            if aborted {
                break 'main ExecutionStatus::Aborted;
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    self.abort_in_flight(&mut tasks, &mut in_flight, "execution timeout");
                    self.publish(
                        EventType::ExecutionAborted,
                        None,
                        json!({ "reason": format!(
                            "{}",
                            EngineError::Timeout(self.options.timeout_seconds.unwrap_or_default())
                        )}),
                    );
                    break 'main ExecutionStatus::Aborted;
                }
            }

            if !paused {
                let set = scheduler::compute_ready(
                    &self.diagram,
                    &self.context,
                    &in_flight,
                    self.options.max_iterations,
                );

                for node_id in set.maxiter {
                    self.apply_maxiter(&node_id);
                }

                let capacity = self
                    .options
                    .max_concurrent_nodes
                    .saturating_sub(in_flight.len());
                for node_id in set.ready.into_iter().take(capacity) {
                    self.dispatch(&node_id, &mut tasks, &mut in_flight);
                }
            }

            if tasks.is_empty() {
                if paused {
                    // Nothing running and dispatch is suspended: block until
                    // the next control signal.
                    match ctrl.recv().await {
                        Some(signal) => {
                            self.handle_signal(
                                signal,
                                &mut paused,
                                &mut aborted,
                                &mut tasks,
                                &mut in_flight,
                            );
                            if aborted {
                                break 'main ExecutionStatus::Aborted;
                            }
                            continue 'main;
                        }
                        None => break 'main ExecutionStatus::Aborted,
                    }
                }

                if self.context.all_nodes_terminal() {
                    break 'main self.settle(&mut first_failure);
                }

                // Re-check: the last applied outcome may have re-armed nodes.
                let set = scheduler::compute_ready(
                    &self.diagram,
                    &self.context,
                    &in_flight,
                    self.options.max_iterations,
                );
                if !set.ready.is_empty() || !set.maxiter.is_empty() {
                    continue 'main;
                }

                // Hook-gated start nodes keep the execution alive while they
                // wait; otherwise this is quiescence.
                break 'main self.quiesce(&mut first_failure);
            }

            tokio::select! {
                Some(joined) = tasks.join_next() => {
                    match joined {
                        Ok(outcome) => {
                            self.apply_outcome(outcome, &mut in_flight, &mut first_failure);
                        }
                        Err(join_error) => {
                            if join_error.is_cancelled() {
                                continue 'main;
                            }
                            tracing::error!("node task panicked: {join_error}");
                        }
                    }
                }
                signal = ctrl.recv() => {
                    match signal {
                        Some(signal) => self.handle_signal(
                            signal,
                            &mut paused,
                            &mut aborted,
                            &mut tasks,
                            &mut in_flight,
                        ),
                        None => {
                            // All handles dropped; keep draining tasks.
                        }
                    }
                    if aborted {
                        break 'main ExecutionStatus::Aborted;
                    }
                }
                _ = tokio::time::sleep(heartbeat) => {
                    let idle = self.bus.idle_seconds(&self.execution_id).unwrap_or(0);
                    if idle >= self.options.heartbeat_seconds {
                        self.publish(
                            EventType::ExecutionUpdate,
                            None,
                            json!({ "status": self.context.execution_status(), "heartbeat": true }),
                        );
                    }
                }
            }
        };

        self.finish(final_status, &first_failure)
    }

    fn handle_signal(
        &self,
        signal: ControlSignal,
        paused: &mut bool,
        aborted: &mut bool,
        tasks: &mut JoinSet<NodeOutcome>,
        in_flight: &mut HashSet<NodeId>,
    ) {
        match signal {
            ControlSignal::Pause => {
                if !*paused {
                    *paused = true;
                    self.context.set_execution_status(ExecutionStatus::Paused);
                    self.publish(EventType::ExecutionUpdate, None, json!({ "status": "paused" }));
                }
            }
            ControlSignal::Resume => {
                if *paused {
                    *paused = false;
                    self.context.set_execution_status(ExecutionStatus::Running);
                    self.publish(EventType::ExecutionUpdate, None, json!({ "status": "running" }));
                }
            }
            ControlSignal::Abort => {
                *aborted = true;
                self.abort_in_flight(tasks, in_flight, "execution aborted");
                self.publish(EventType::ExecutionAborted, None, json!({ "reason": "aborted" }));
            }
            ControlSignal::SkipNode(node_id) => {
                if self.context.get_status(&node_id) == Some(Status::Pending) {
                    if self.context.to_skipped(&node_id).is_ok() {
                        self.publish(
                            EventType::NodeSkipped,
                            Some(node_id.clone()),
                            json!({ "reason": "skip requested" }),
                        );
                    }
                }
            }
            ControlSignal::Hook(event) => self.hooks.push(event),
        }
    }

    /// Cancel all in-flight handler tasks and fail their nodes with a
    /// cancellation reason.
    fn abort_in_flight(
        &self,
        tasks: &mut JoinSet<NodeOutcome>,
        in_flight: &mut HashSet<NodeId>,
        reason: &str,
    ) {
        tasks.abort_all();
        for node_id in in_flight.drain() {
            if self.context.to_failed(&node_id, reason).is_ok() {
                self.publish(
                    EventType::NodeFailed,
                    Some(node_id.clone()),
                    json!({ "error": reason, "error_type": "Cancelled" }),
                );
            }
        }
    }

    fn dispatch(
        &self,
        node_id: &str,
        tasks: &mut JoinSet<NodeOutcome>,
        in_flight: &mut HashSet<NodeId>,
    ) {
        let iteration = match self.context.to_running(node_id) {
            Ok(count) => count,
            Err(e) => {
                tracing::error!(node_id = %node_id, "dispatch transition failed: {e}");
                return;
            }
        };
        in_flight.insert(node_id.to_string());
        self.publish(
            EventType::NodeStarted,
            Some(node_id.to_string()),
            json!({ "iteration": iteration }),
        );

        let node_id = node_id.to_string();
        let diagram = self.diagram.clone();
        let context = self.context.clone();
        let services = self.services.clone();
        let options = self.options.clone();
        let handlers = self.handlers.clone();
        let hooks = self.hooks.clone();
        let execution_id = self.execution_id.clone();

        tasks.spawn(async move {
            let started = Instant::now();
            let result = execute_node(
                &node_id,
                &diagram,
                &context,
                &services,
                &options,
                &handlers,
                &hooks,
                &execution_id,
            )
            .await;
            NodeOutcome { node_id, started, result }
        });
    }

    fn apply_outcome(
        &self,
        outcome: NodeOutcome,
        in_flight: &mut HashSet<NodeId>,
        first_failure: &mut Option<(NodeId, String)>,
    ) {
        in_flight.remove(&outcome.node_id);
        let node_id = outcome.node_id;
        let duration_ms = outcome.started.elapsed().as_millis() as u64;

        match outcome.result {
            Ok(mut envelope) => {
                // Apply staged variable writes atomically before anything
                // downstream can resolve.
                if let Some(Value::Object(vars)) = envelope.meta.remove(VARIABLES_TO_SET) {
                    self.context
                        .set_variables(vars.into_iter().collect::<BTreeMap<_, _>>());
                }

                let token_usage: Option<TokenUsage> = envelope
                    .meta
                    .get("token_usage")
                    .and_then(|v| serde_json::from_value(v.clone()).ok());

                let node = self.diagram.node(&node_id);
                let is_condition =
                    node.map(|n| n.is_condition()).unwrap_or(false);
                let iteration = self.context.get_execution_count(&node_id);

                let taken_branch = if is_condition {
                    let branch = envelope.branch_id().unwrap_or(BRANCH_FALSE).to_string();
                    self.context.mark_branch_taken(&node_id, &branch);
                    self.context
                        .update_loop_state(&node_id, branch == BRANCH_FALSE);
                    Some(branch)
                } else {
                    // Later loop passes tag their outputs so stale values
                    // are filtered at the consumers.
                    if iteration > 1 {
                        envelope = envelope.with_iteration(iteration);
                    }
                    None
                };

                if let Err(e) = self.context.to_completed(&node_id, &envelope, token_usage) {
                    tracing::error!(node_id = %node_id, "completion transition failed: {e}");
                    return;
                }

                let mut data = json!({
                    "status": "completed",
                    "metrics": { "duration_ms": duration_ms, "token_usage": token_usage },
                });
                if self.options.debug_mode {
                    data["output"] = envelope.serialize();
                }
                if let Some(branch) = &taken_branch {
                    data["branch"] = json!(branch);
                }
                self.publish(EventType::NodeCompleted, Some(node_id.clone()), data);

                self.rearm_downstream(&node_id, taken_branch.as_deref());
            }
            Err(failure) => {
                if first_failure.is_none() {
                    *first_failure = Some((node_id.clone(), failure.message.clone()));
                }
                if let Err(e) = self.context.to_failed(&node_id, &failure.message) {
                    tracing::error!(node_id = %node_id, "failure transition failed: {e}");
                }
                self.publish(
                    EventType::NodeFailed,
                    Some(node_id.clone()),
                    json!({
                        "error": failure.message,
                        "error_type": failure.kind,
                        "metrics": { "duration_ms": duration_ms },
                    }),
                );
            }
        }
    }

    /// Transition a capped `person_job` to `maxiter_reached` and wake its
    /// consumers, keeping the last recorded output visible downstream.
    fn apply_maxiter(&self, node_id: &str) {
        let last_output = self.context.get_output(node_id);
        if let Err(e) = self.context.to_maxiter(node_id, last_output.as_ref()) {
            tracing::error!(node_id = %node_id, "maxiter transition failed: {e}");
            return;
        }
        self.publish(
            EventType::NodeCompleted,
            Some(node_id.to_string()),
            json!({ "status": "maxiter_reached" }),
        );
        self.rearm_downstream(node_id, None);
    }

    /// Completed consumers of a node's fresh output return to `pending` so
    /// cycles re-execute. Only the taken branch re-arms for conditions.
    fn rearm_downstream(&self, node_id: &str, taken_branch: Option<&str>) {
        for edge in self.diagram.outgoing_edges(node_id) {
            if let Some(branch) = taken_branch {
                if edge.is_branch_edge() && edge.source_output != branch {
                    continue;
                }
            }
            let target = &edge.target_node_id;
            if self.context.get_status(target) == Some(Status::Completed) {
                if let Err(e) = self.context.reset(target) {
                    tracing::error!(target = %target, "re-arm failed: {e}");
                }
            }
        }
    }

    /// All nodes terminal: decide the overall status.
    fn settle(&self, first_failure: &mut Option<(NodeId, String)>) -> ExecutionStatus {
        let end_completed = self
            .diagram
            .nodes_of_type(NodeType::End)
            .any(|n| self.context.get_status(&n.id) == Some(Status::Completed));
        if end_completed {
            return ExecutionStatus::Completed;
        }
        if first_failure.is_some() {
            return ExecutionStatus::Failed;
        }
        ExecutionStatus::Completed
    }

    /// Nothing ready, nothing running, not everything terminal.
    fn quiesce(&self, first_failure: &mut Option<(NodeId, String)>) -> ExecutionStatus {
        let report = scheduler::analyze_quiescence(&self.diagram, &self.context);

        if !report.deadlocked.is_empty() {
            let diagnostic = format!(
                "nodes stuck with unsatisfiable dependencies: [{}]",
                report.deadlocked.join(", ")
            );
            tracing::error!(execution_id = %self.execution_id, "{diagnostic}");
            if first_failure.is_none() {
                *first_failure =
                    Some((report.deadlocked[0].clone(), EngineError::Deadlock(diagnostic).to_string()));
            }
            return ExecutionStatus::Failed;
        }

        for node_id in report.to_skip {
            if self.context.to_skipped(&node_id).is_ok() {
                self.publish(
                    EventType::NodeSkipped,
                    Some(node_id.clone()),
                    json!({ "reason": "unreachable branch" }),
                );
            }
        }

        self.settle(first_failure)
    }

    fn finish(
        self,
        status: ExecutionStatus,
        first_failure: &Option<(NodeId, String)>,
    ) -> ExecutionState {
        self.context.set_execution_status(status);

        match status {
            ExecutionStatus::Completed => {
                self.publish(EventType::ExecutionCompleted, None, json!({ "status": "completed" }));
            }
            ExecutionStatus::Failed => {
                let data = match first_failure {
                    Some((node, error)) => json!({ "node_id": node, "error": error }),
                    None => json!({ "error": "execution failed" }),
                };
                self.publish(EventType::ExecutionFailed, None, data);
            }
            // EXECUTION_ABORTED was already published at the abort site.
            ExecutionStatus::Aborted => self.bus.remove(&self.execution_id),
            other => {
                tracing::error!(?other, "finish with non-terminal status");
            }
        }

        self.context.snapshot()
    }

    fn publish(&self, event_type: EventType, node_id: Option<String>, data: Value) {
        self.bus.publish(&self.execution_id, event_type, node_id, data);
    }
}

/// Resolution + handler dispatch for one node, run off the scheduler.
#[allow(clippy::too_many_arguments)]
async fn execute_node(
    node_id: &str,
    diagram: &Arc<ExecutableDiagram>,
    context: &Arc<ExecutionContext>,
    services: &ServiceRegistry,
    options: &Arc<ExecutionOptions>,
    handlers: &HandlerRegistry,
    hooks: &Arc<HookMailbox>,
    execution_id: &str,
) -> Result<Envelope, NodeFailure> {
    let node = diagram.node(node_id).ok_or_else(|| NodeFailure {
        message: format!("unknown node '{node_id}'"),
        kind: "InternalError",
    })?;

    let handler = handlers.get(node.node_type()).ok_or_else(|| NodeFailure {
        message: format!("no handler registered for node type '{}'", node.node_type()),
        kind: "InternalError",
    })?;

    let inputs = resolve_inputs(node, context, diagram, services)
        .await
        .map_err(|e| NodeFailure { kind: e.kind_tag(), message: e.to_string() })?;

    // A required input that survived the defaults stage unfilled is fatal
    // before the handler ever runs.
    for required in &node.required_inputs {
        if !inputs.inputs.contains_key(required) {
            return Err(NodeFailure {
                message: format!(
                    "required input '{required}' has no upstream output and no default (node '{node_id}')"
                ),
                kind: "InputResolutionError",
            });
        }
    }

    let ctx = HandlerCtx {
        node,
        diagram: diagram.as_ref(),
        context: context.as_ref(),
        services,
        options: options.as_ref(),
        execution_id,
        hooks: hooks.as_ref(),
    };

    // Handler panics are engine-boundary failures, not process aborts.
    let executed = AssertUnwindSafe(handler.execute(ctx, &inputs))
        .catch_unwind()
        .await;
    match executed {
        Ok(Ok(envelope)) => Ok(envelope.with_trace(execution_id)),
        Ok(Err(e)) => Err(NodeFailure { kind: e.kind_tag(), message: e.to_string() }),
        Err(_) => Err(NodeFailure {
            message: "handler panicked".to_string(),
            kind: "InternalError",
        }),
    }
}
