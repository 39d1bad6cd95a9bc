//! Per-plan scheduling loop.
//!
//! Each accepted plan gets one [`Scheduler`] running as its own tokio task.
//! The loop owns every state transition for the plan: agent results,
//! timeouts, retry timers and external commands (approve, reject, deliver)
//! all arrive as messages on one channel and are applied one at a time.
//! Agent calls run in spawned attempt tasks, so a slow agent never blocks
//! the loop.
//!
//! Every attempt is numbered. A result or timeout is applied only if the
//! task is still `Running`/`FallbackRunning` and the attempt it belongs to
//! is the one in flight; anything else is discarded and logged. This is
//! what resolves the race between a timeout and a late result.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::alert::{AlertEngine, AlertQueue, OutcomeDetail, TaskOutcomeEvent};
use crate::core::{
    AttemptOutcome, ExecutionStore, PlanStatus, TaskError, TaskId, TaskStatus, ValidatedPlan,
};
use crate::error::{Error, Result};
use crate::orchestration::dispatch::{AgentDispatcher, DispatchRequest, DispatchResult};
use crate::orchestration::retry::{RetryController, RetryPolicy, TransitionEvent};
use crate::state::{PlanSnapshot, SnapshotStore};

/// Events emitted by the scheduler for plan and task lifecycle changes.
///
/// These let observers (dashboards, audit logs) follow execution without
/// polling the state store.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    TaskStateChanged {
        plan_id: String,
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
    /// Retry/fallback audit record.
    Transition {
        plan_id: String,
        event: TransitionEvent,
    },
    /// A result or command arrived for an attempt that is no longer live.
    ResultDiscarded {
        plan_id: String,
        task_id: TaskId,
        attempt: Option<u32>,
        reason: String,
    },
    PlanFinished {
        plan_id: String,
        status: PlanStatus,
    },
}

/// Collaborators shared by every plan an orchestrator runs.
#[derive(Clone)]
pub struct SchedulerContext {
    pub dispatcher: Arc<dyn AgentDispatcher>,
    pub alerts: Arc<AlertEngine>,
    pub retry: RetryPolicy,
    pub events: Option<mpsc::Sender<SchedulerEvent>>,
    pub snapshots: Option<SnapshotStore>,
}

enum Command {
    Approve {
        task: usize,
        reply: oneshot::Sender<Result<()>>,
    },
    Reject {
        task: usize,
        reason: Option<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    Deliver {
        task: usize,
        result: DispatchResult,
        reply: oneshot::Sender<bool>,
    },
}

enum Message {
    Command(Command),
    Completed {
        task: usize,
        attempt: u32,
        result: DispatchResult,
    },
    TimedOut {
        task: usize,
        attempt: u32,
        after: Duration,
    },
    /// Backoff elapsed for the retry following `attempt`.
    RetryDue { task: usize, attempt: u32 },
}

/// Caller-side handle to a running plan.
///
/// Status reads go straight to the state store and never wait on the loop.
pub struct PlanHandle {
    plan: Arc<ValidatedPlan>,
    store: Arc<ExecutionStore>,
    tx: mpsc::UnboundedSender<Message>,
    status: watch::Receiver<PlanStatus>,
    cancel: CancellationToken,
}

impl PlanHandle {
    pub fn plan_id(&self) -> &str {
        self.plan.plan_id()
    }

    pub fn plan(&self) -> &ValidatedPlan {
        &self.plan
    }

    pub fn store(&self) -> &ExecutionStore {
        &self.store
    }

    /// Last published plan status. Stays `Running` until the loop has
    /// drained its alerts and recorded the final status.
    pub fn status(&self) -> PlanStatus {
        *self.status.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.status().is_finished()
    }

    /// Resolve once the plan reaches a final status.
    pub async fn wait(&self) -> PlanStatus {
        let mut rx = self.status.clone();
        let result = rx.wait_for(|s| s.is_finished()).await.map(|s| *s);
        match result {
            Ok(status) => status,
            Err(_) => *rx.borrow(),
        }
    }

    /// Skip every unfinished task and stop in-flight attempts.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn task_index(&self, task_id: &TaskId) -> Result<usize> {
        self.plan
            .index_of(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.clone()))
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Message::Command(build(reply))).ok()?;
        rx.await.ok()
    }

    pub async fn approve(&self, task_id: &TaskId) -> Result<()> {
        let task = self.task_index(task_id)?;
        self.request(|reply| Command::Approve { task, reply })
            .await
            .unwrap_or_else(|| Err(Error::PlanFinished(self.plan_id().to_string())))
    }

    pub async fn reject(&self, task_id: &TaskId, reason: Option<String>) -> Result<()> {
        let task = self.task_index(task_id)?;
        self.request(|reply| Command::Reject {
            task,
            reason,
            reply,
        })
        .await
        .unwrap_or_else(|| Err(Error::PlanFinished(self.plan_id().to_string())))
    }

    /// Push a result for the task's in-flight attempt. Returns whether it
    /// was applied; results for tasks that are not running are discarded.
    pub async fn deliver_result(&self, task_id: &TaskId, result: DispatchResult) -> Result<bool> {
        let task = self.task_index(task_id)?;
        let applied = self
            .request(|reply| Command::Deliver {
                task,
                result,
                reply,
            })
            .await;
        if applied.is_none() {
            debug!(plan_id = %self.plan_id(), task_id = %task_id, "Result for finished plan discarded");
        }
        Ok(applied.unwrap_or(false))
    }
}

impl std::fmt::Debug for PlanHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanHandle")
            .field("plan_id", &self.plan_id())
            .field("status", &self.status())
            .finish()
    }
}

/// Control loop for one plan.
pub struct Scheduler {
    plan: Arc<ValidatedPlan>,
    store: Arc<ExecutionStore>,
    /// Task indices in topological order.
    order: Vec<usize>,
    dispatcher: Arc<dyn AgentDispatcher>,
    controller: RetryController,
    alerts: Arc<AlertEngine>,
    alert_queue: Option<AlertQueue>,
    events: Option<mpsc::Sender<SchedulerEvent>>,
    snapshots: Option<SnapshotStore>,
    tx: mpsc::UnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<Message>,
    status_tx: watch::Sender<PlanStatus>,
    cancel: CancellationToken,
    cancelled: bool,
}

impl Scheduler {
    /// Start executing `plan` on the current tokio runtime.
    pub fn spawn(plan: ValidatedPlan, ctx: &SchedulerContext) -> Arc<PlanHandle> {
        let plan = Arc::new(plan);
        let store = Arc::new(ExecutionStore::new(&plan));
        let order = plan
            .topological_order()
            .into_iter()
            .filter_map(|id| plan.index_of(id))
            .collect();
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(PlanStatus::Running);
        let cancel = CancellationToken::new();

        let handle = Arc::new(PlanHandle {
            plan: Arc::clone(&plan),
            store: Arc::clone(&store),
            tx: tx.clone(),
            status: status_rx,
            cancel: cancel.clone(),
        });

        let scheduler = Scheduler {
            plan,
            store,
            order,
            dispatcher: Arc::clone(&ctx.dispatcher),
            controller: RetryController::new(ctx.retry.clone()),
            alerts: Arc::clone(&ctx.alerts),
            alert_queue: None,
            events: ctx.events.clone(),
            snapshots: ctx.snapshots.clone(),
            tx,
            rx,
            status_tx,
            cancel,
            cancelled: false,
        };
        tokio::spawn(scheduler.run());
        handle
    }

    fn plan_id(&self) -> &str {
        self.plan.plan_id()
    }

    async fn run(mut self) {
        let (queue, worker) = self.alerts.spawn_worker();
        self.alert_queue = Some(queue);

        info!(
            plan_id = %self.plan_id(),
            tasks = self.store.len(),
            layers = self.plan.layers().len(),
            "Plan execution started"
        );
        self.tick();

        while !self.store.all_terminal() {
            tokio::select! {
                _ = self.cancel.cancelled(), if !self.cancelled => self.cancel_all(),
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => break,
                },
            }
        }

        // Drain alerts before publishing the final status.
        self.alert_queue = None;
        if let Err(e) = worker.await {
            warn!(plan_id = %self.plan_id(), error = %e, "Alert worker failed");
        }
        self.finish().await;
        // Release attempts whose agents never answered.
        self.cancel.cancel();
    }

    fn handle(&mut self, msg: Message) {
        match msg {
            Message::Completed {
                task,
                attempt,
                result,
            } => {
                self.apply_result(task, Some(attempt), result);
            }
            Message::TimedOut {
                task,
                attempt,
                after,
            } => self.on_timeout(task, attempt, after),
            Message::RetryDue { task, attempt } => self.on_retry_due(task, attempt),
            Message::Command(Command::Approve { task, reply }) => {
                let _ = reply.send(self.approve(task));
            }
            Message::Command(Command::Reject {
                task,
                reason,
                reply,
            }) => {
                let _ = reply.send(self.reject(task, reason));
            }
            Message::Command(Command::Deliver {
                task,
                result,
                reply,
            }) => {
                let applied = self.apply_result(task, None, result);
                let _ = reply.send(applied);
            }
        }
    }

    /// Observers that fall behind lose events rather than stall the loop.
    fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.events {
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(event) {
                debug!(plan_id = %self.plan_id(), "Event sink full; dropping scheduler event");
            }
        }
    }

    fn state_changed(&self, task: usize, from: TaskStatus, to: TaskStatus) {
        if from == to {
            return;
        }
        let task_id = self.store.task_id(task).clone();
        trace!(plan_id = %self.plan_id(), task_id = %task_id, %from, %to, "Task state changed");
        self.emit(SchedulerEvent::TaskStateChanged {
            plan_id: self.plan_id().to_string(),
            task_id,
            from,
            to,
        });
    }

    /// Transition a non-terminal task and emit the change.
    fn set_status(&self, task: usize, to: TaskStatus) -> bool {
        let from = self.store.update(task, |s| {
            let from = s.status;
            s.transition(to).then_some(from)
        });
        match from {
            Some(from) => {
                self.state_changed(task, from, to);
                true
            }
            None => false,
        }
    }

    fn dependencies_met(&self, task: usize) -> bool {
        self.plan
            .dependencies(task)
            .into_iter()
            .all(|d| self.store.status(d) == TaskStatus::Succeeded)
    }

    /// Move every task whose dependencies have all succeeded towards
    /// `Running`, stopping at `AwaitingApproval` where required.
    fn tick(&self) {
        if self.cancelled {
            return;
        }
        for &task in &self.order {
            let status = self.store.status(task);
            if !matches!(status, TaskStatus::Pending | TaskStatus::Blocked) {
                continue;
            }
            if !self.dependencies_met(task) {
                continue;
            }
            if status == TaskStatus::Blocked {
                self.set_status(task, TaskStatus::Pending);
            }
            if self.plan.task(task).approval_required {
                if self.set_status(task, TaskStatus::AwaitingApproval) {
                    info!(
                        plan_id = %self.plan_id(),
                        task_id = %self.store.task_id(task),
                        "Task awaiting approval"
                    );
                }
            } else if self.set_status(task, TaskStatus::Running) {
                self.dispatch(task);
            }
        }
    }

    /// Open a new attempt on the task's current agent and hand it to the
    /// dispatcher. The task must already be running.
    fn dispatch(&self, task: usize) {
        let spec = self.plan.task(task);
        let (attempt, agent) = self
            .store
            .update(task, |s| (s.begin_attempt(), s.current_agent.clone()));
        let request = DispatchRequest {
            plan_id: self.plan_id().to_string(),
            task_id: spec.task_id.clone(),
            agent,
            task_type: spec.task_type.clone(),
            content: spec.content.clone(),
            timeout: spec.timeout(),
            attempt,
        };
        debug!(
            plan_id = %request.plan_id,
            task_id = %request.task_id,
            agent = %request.agent,
            attempt,
            "Dispatching task"
        );

        let dispatcher = Arc::clone(&self.dispatcher);
        let tx = self.tx.clone();
        let token = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = run_attempt(dispatcher, request, tx, task) => {}
            }
        });
    }

    fn schedule_retry(&self, task: usize, delay: Duration) {
        if delay.is_zero() {
            self.dispatch(task);
            return;
        }
        let attempt = self.store.update(task, |s| s.current_attempt());
        debug!(
            plan_id = %self.plan_id(),
            task_id = %self.store.task_id(task),
            "Retry scheduled in {:?}",
            delay
        );
        let tx = self.tx.clone();
        let token = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(Message::RetryDue { task, attempt });
                }
            }
        });
    }

    fn on_retry_due(&self, task: usize, attempt: u32) {
        let due = self.store.update(task, |s| {
            s.status.is_active()
                && s.current_attempt() == attempt
                && s.last_attempt().map_or(true, |a| a.outcome.is_some())
        });
        if due {
            self.dispatch(task);
        }
    }

    /// Number of the attempt in flight, or why nothing can be applied.
    fn live_attempt(&self, task: usize, attempt: Option<u32>) -> std::result::Result<u32, String> {
        self.store.update(task, |s| {
            if !s.status.is_active() {
                return Err(format!("task is {}", s.status));
            }
            let open = s
                .last_attempt()
                .filter(|a| a.outcome.is_none())
                .map(|a| a.attempt);
            match (open, attempt) {
                (None, _) => Err("no attempt in flight".to_string()),
                (Some(current), Some(n)) if n != current => {
                    Err(format!("stale attempt (attempt {} in flight)", current))
                }
                (Some(current), _) => Ok(current),
            }
        })
    }

    fn apply_result(&self, task: usize, attempt: Option<u32>, result: DispatchResult) -> bool {
        if let Err(reason) = self.live_attempt(task, attempt) {
            let task_id = self.store.task_id(task).clone();
            warn!(
                plan_id = %self.plan_id(),
                task_id = %task_id,
                attempt = ?attempt,
                "Discarding result: {}",
                reason
            );
            self.emit(SchedulerEvent::ResultDiscarded {
                plan_id: self.plan_id().to_string(),
                task_id,
                attempt,
                reason,
            });
            return false;
        }

        match result {
            DispatchResult::Success { score, output } => self.on_success(task, score, output),
            DispatchResult::Error {
                error_code,
                message,
            } => self.on_failure(
                task,
                TaskError::new(error_code, message),
                AttemptOutcome::Failed,
            ),
        }
        true
    }

    fn on_timeout(&self, task: usize, attempt: u32, after: Duration) {
        if self.live_attempt(task, Some(attempt)).is_err() {
            trace!(plan_id = %self.plan_id(), task = task, attempt, "Timer for settled attempt ignored");
            return;
        }
        warn!(
            plan_id = %self.plan_id(),
            task_id = %self.store.task_id(task),
            attempt,
            "Task timed out after {:?}",
            after
        );
        self.on_failure(task, TaskError::timeout(after), AttemptOutcome::TimedOut);
    }

    fn on_success(&self, task: usize, score: Option<f64>, output: Option<serde_json::Value>) {
        let spec = self.plan.task(task);
        let (from, state) = self.store.update(task, |s| {
            let from = s.status;
            s.finish_attempt(AttemptOutcome::Succeeded, None);
            s.score = score;
            s.output = output.clone();
            s.transition(TaskStatus::Succeeded);
            (from, s.clone())
        });
        self.state_changed(task, from, TaskStatus::Succeeded);
        info!(
            plan_id = %self.plan_id(),
            task_id = %spec.task_id,
            agent = %state.current_agent,
            score = ?score,
            "Task succeeded"
        );

        if let Some(event) = self.controller.success_event(spec, &state) {
            self.emit(SchedulerEvent::Transition {
                plan_id: self.plan_id().to_string(),
                event,
            });
        }

        self.raise(TaskOutcomeEvent {
            plan_id: self.plan_id().to_string(),
            task_id: spec.task_id.clone(),
            agent: state.current_agent.clone(),
            timestamp: Utc::now(),
            retry_count: state.retry_count,
            detail: OutcomeDetail::TaskResult {
                score,
                output,
                duration_secs: state.last_attempt().and_then(|a| a.duration_secs()),
            },
        });
        self.tick();
    }

    fn on_failure(&self, task: usize, error: TaskError, outcome: AttemptOutcome) {
        let spec = self.plan.task(task);
        let controller = &self.controller;
        let (from, retry_count, agent, decision, event, to) = self.store.update(task, |s| {
            let from = s.status;
            let retry_count = s.retry_count;
            let agent = s.current_agent.clone();
            s.finish_attempt(outcome, Some(error.clone()));
            let (decision, event) = controller.handle_failure(spec, s, error.clone());
            (from, retry_count, agent, decision, event, s.status)
        });
        self.state_changed(task, from, TaskStatus::Failed);
        self.state_changed(task, TaskStatus::Failed, to);
        self.emit(SchedulerEvent::Transition {
            plan_id: self.plan_id().to_string(),
            event: event.clone(),
        });

        self.raise(TaskOutcomeEvent {
            plan_id: self.plan_id().to_string(),
            task_id: spec.task_id.clone(),
            agent,
            timestamp: Utc::now(),
            retry_count,
            detail: OutcomeDetail::Error {
                error,
                transition: event,
            },
        });

        match decision.delay() {
            Some(delay) => self.schedule_retry(task, delay),
            None => {
                let reason = format!("dependency {} permanently failed", spec.task_id);
                self.propagate_skip(task, &reason);
            }
        }
    }

    /// Skip every unstarted task downstream of `task`.
    fn propagate_skip(&self, task: usize, reason: &str) {
        for dependent in self.plan.transitive_dependents(task) {
            let from = self.store.update(dependent, |s| {
                if !s.status.is_unstarted() {
                    return None;
                }
                let from = s.status;
                s.status = TaskStatus::Skipped;
                s.skip_reason = Some(reason.to_string());
                Some(from)
            });
            if let Some(from) = from {
                info!(
                    plan_id = %self.plan_id(),
                    task_id = %self.store.task_id(dependent),
                    "Task skipped: {}",
                    reason
                );
                self.state_changed(dependent, from, TaskStatus::Skipped);
            }
        }
    }

    fn check_awaiting(&self, task: usize) -> Result<()> {
        let status = self.store.status(task);
        if status != TaskStatus::AwaitingApproval {
            return Err(Error::NotAwaitingApproval {
                task: self.store.task_id(task).clone(),
                status: status.to_string(),
            });
        }
        Ok(())
    }

    fn approve(&self, task: usize) -> Result<()> {
        self.check_awaiting(task)?;
        info!(plan_id = %self.plan_id(), task_id = %self.store.task_id(task), "Task approved");
        if self.set_status(task, TaskStatus::Running) {
            self.dispatch(task);
        }
        Ok(())
    }

    fn reject(&self, task: usize, reason: Option<String>) -> Result<()> {
        self.check_awaiting(task)?;
        let task_id = self.store.task_id(task).clone();
        let skip_reason = match reason {
            Some(reason) => format!("approval rejected: {}", reason),
            None => "approval rejected".to_string(),
        };
        info!(plan_id = %self.plan_id(), task_id = %task_id, "Task rejected: {}", skip_reason);
        self.store.update(task, |s| {
            s.status = TaskStatus::Skipped;
            s.skip_reason = Some(skip_reason);
        });
        self.state_changed(task, TaskStatus::AwaitingApproval, TaskStatus::Skipped);
        self.propagate_skip(task, &format!("dependency {} was rejected", task_id));
        Ok(())
    }

    fn cancel_all(&mut self) {
        self.cancelled = true;
        info!(plan_id = %self.plan_id(), "Cancelling plan");
        for task in 0..self.store.len() {
            let cancelled = self.store.update(task, |s| {
                if s.is_terminal() {
                    return None;
                }
                let from = s.status;
                let in_flight = s.last_attempt().map_or(false, |a| a.outcome.is_none());
                if in_flight {
                    s.finish_attempt(AttemptOutcome::Cancelled, None);
                }
                s.status = TaskStatus::Skipped;
                s.skip_reason = Some("plan cancelled".to_string());
                Some((from, in_flight.then(|| s.current_agent.clone())))
            });
            let Some((from, agent)) = cancelled else {
                continue;
            };
            self.state_changed(task, from, TaskStatus::Skipped);
            if let Some(agent) = agent {
                let dispatcher = Arc::clone(&self.dispatcher);
                let plan_id = self.plan_id().to_string();
                let task_id = self.store.task_id(task).clone();
                tokio::spawn(async move {
                    dispatcher.cancel(&plan_id, &task_id, &agent).await;
                });
            }
        }
    }

    /// Collect the alert outcome for delivery. Matching happens here, in
    /// the loop, before the outcome is dropped.
    fn raise(&self, outcome: TaskOutcomeEvent) {
        let firings = self.alerts.evaluate(&outcome);
        if firings.is_empty() {
            return;
        }
        if let Some(queue) = &self.alert_queue {
            queue.enqueue(firings);
        }
    }

    async fn finish(&mut self) {
        let status = self.store.plan_status(self.cancelled);
        match status {
            PlanStatus::Succeeded => info!(plan_id = %self.plan_id(), %status, "Plan finished"),
            _ => warn!(plan_id = %self.plan_id(), %status, "Plan finished"),
        }

        if let Some(snapshots) = &self.snapshots {
            let snapshot = PlanSnapshot::capture(self.plan.plan(), &self.store, status);
            if let Err(e) = snapshots.save(&snapshot).await {
                warn!(plan_id = %self.plan_id(), error = %e, "Failed to save plan snapshot");
            }
        }

        self.emit(SchedulerEvent::PlanFinished {
            plan_id: self.plan_id().to_string(),
            status,
        });
        self.status_tx.send_replace(status);
    }
}

/// One dispatch, raced against the task timeout. A result that arrives
/// after the timeout is still reported so the loop can discard it.
async fn run_attempt(
    dispatcher: Arc<dyn AgentDispatcher>,
    request: DispatchRequest,
    tx: mpsc::UnboundedSender<Message>,
    task: usize,
) {
    let attempt = request.attempt;
    let timeout = request.timeout;
    let mut dispatch = dispatcher.dispatch(request);
    let result = match timeout {
        Some(after) => {
            tokio::select! {
                result = &mut dispatch => result,
                _ = tokio::time::sleep(after) => {
                    let _ = tx.send(Message::TimedOut { task, attempt, after });
                    dispatch.await
                }
            }
        }
        None => dispatch.await,
    };
    let _ = tx.send(Message::Completed {
        task,
        attempt,
        result,
    });
}
