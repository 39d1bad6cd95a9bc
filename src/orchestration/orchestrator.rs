//! Plan submission and query interface.
//!
//! [`Orchestrator::submit`] validates a plan synchronously and, on success,
//! starts a [`Scheduler`] for it and returns at once. Everything else is
//! keyed by `plan_id`: status queries read the plan's state store directly,
//! while approvals, rejections and externally delivered results are routed
//! to the plan's control loop.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::alert::{ActionExecutor, AlertActionPort, AlertEngine, RuleSet};
use crate::config::{Config, DEFAULT_EVENT_BUFFER};
use crate::core::{validate, Plan, PlanStatus, TaskExecutionState, TaskId};
use crate::error::{Error, Result};
use crate::orchestration::dispatch::{AgentDispatcher, DispatchResult};
use crate::orchestration::retry::RetryPolicy;
use crate::orchestration::scheduler::{PlanHandle, Scheduler, SchedulerContext, SchedulerEvent};
use crate::state::SnapshotStore;

/// Acknowledgement returned for an accepted plan.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanAccepted {
    pub plan_id: String,
    pub task_count: usize,
    /// Advisory parallel layers, dependencies first.
    pub layers: Vec<Vec<TaskId>>,
}

pub struct Orchestrator {
    ctx: SchedulerContext,
    plans: RwLock<HashMap<String, Arc<PlanHandle>>>,
    /// Capacity for [`Orchestrator::with_events`].
    event_buffer: usize,
}

impl Orchestrator {
    pub fn new(dispatcher: Arc<dyn AgentDispatcher>, alerts: Arc<AlertEngine>) -> Self {
        Self {
            ctx: SchedulerContext {
                dispatcher,
                alerts,
                retry: RetryPolicy::default(),
                events: None,
                snapshots: None,
            },
            plans: RwLock::new(HashMap::new()),
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    /// Build from configuration: retry policy, alert policy files and the
    /// optional snapshot directory.
    pub fn from_config(
        config: &Config,
        dispatcher: Arc<dyn AgentDispatcher>,
        port: Option<Arc<dyn AlertActionPort>>,
    ) -> Result<Self> {
        let port: Arc<dyn AlertActionPort> = match port {
            Some(port) => port,
            None => Arc::new(ActionExecutor::new().map_err(|e| Error::Config(e.to_string()))?),
        };
        let rules = RuleSet::load_files(&config.policy_paths())?;
        let alerts = Arc::new(AlertEngine::new(rules, port));

        let mut orchestrator = Self::new(dispatcher, alerts).with_retry_policy(config.retry_policy());
        orchestrator.event_buffer = config.event_buffer;
        if let Some(dir) = config.persist_path() {
            orchestrator = orchestrator.with_snapshot_store(SnapshotStore::new(dir));
        }
        Ok(orchestrator)
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.ctx.retry = policy;
        self
    }

    /// Attach an observer for scheduler events of every plan.
    pub fn with_event_sink(mut self, sink: mpsc::Sender<SchedulerEvent>) -> Self {
        self.ctx.events = Some(sink);
        self
    }

    /// Attach a fresh event channel and return its receiving end.
    pub fn with_event_channel(self, capacity: usize) -> (Self, mpsc::Receiver<SchedulerEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (self.with_event_sink(tx), rx)
    }

    /// Attach an event channel sized by the configured `event_buffer`.
    pub fn with_events(self) -> (Self, mpsc::Receiver<SchedulerEvent>) {
        let capacity = self.event_buffer;
        self.with_event_channel(capacity)
    }

    pub fn with_snapshot_store(mut self, store: SnapshotStore) -> Self {
        self.ctx.snapshots = Some(store);
        self
    }

    pub fn alerts(&self) -> &Arc<AlertEngine> {
        &self.ctx.alerts
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.ctx.retry
    }

    /// Validate and start a plan.
    ///
    /// Validation errors are returned before anything runs. A `plan_id` may
    /// be reused once the earlier plan with that id has finished.
    pub async fn submit(&self, plan: Plan) -> Result<PlanAccepted> {
        let plan_id = plan.plan_id.clone();
        let validated = validate(plan).inspect_err(|e| {
            warn!(plan_id = %plan_id, error = %e, "Plan rejected");
        })?;

        let mut plans = self.plans.write();
        if plans.get(&plan_id).is_some_and(|h| !h.is_finished()) {
            return Err(Error::PlanExists(plan_id));
        }

        let accepted = PlanAccepted {
            plan_id: plan_id.clone(),
            task_count: validated.task_count(),
            layers: validated.layers().to_vec(),
        };
        info!(
            plan_id = %plan_id,
            tasks = accepted.task_count,
            dependencies = validated.dependency_count(),
            "Plan accepted"
        );
        let handle = Scheduler::spawn(validated, &self.ctx);
        plans.insert(plan_id, handle);
        Ok(accepted)
    }

    pub fn handle(&self, plan_id: &str) -> Result<Arc<PlanHandle>> {
        self.plans
            .read()
            .get(plan_id)
            .cloned()
            .ok_or_else(|| Error::PlanNotFound(plan_id.to_string()))
    }

    /// Known plan ids, sorted.
    pub fn plan_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.plans.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn plan_status(&self, plan_id: &str) -> Result<PlanStatus> {
        Ok(self.handle(plan_id)?.status())
    }

    pub fn task_status(&self, plan_id: &str, task_id: &TaskId) -> Result<TaskExecutionState> {
        let handle = self.handle(plan_id)?;
        let index = handle
            .store()
            .index_of(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.clone()))?;
        Ok(handle.store().get(index))
    }

    /// Every task's state in plan order.
    pub fn tasks(&self, plan_id: &str) -> Result<Vec<(TaskId, TaskExecutionState)>> {
        Ok(self.handle(plan_id)?.store().snapshot())
    }

    pub async fn approve(&self, plan_id: &str, task_id: &TaskId) -> Result<()> {
        self.handle(plan_id)?.approve(task_id).await
    }

    pub async fn reject(&self, plan_id: &str, task_id: &TaskId, reason: Option<String>) -> Result<()> {
        self.handle(plan_id)?.reject(task_id, reason).await
    }

    pub fn cancel(&self, plan_id: &str) -> Result<()> {
        let handle = self.handle(plan_id)?;
        if handle.is_finished() {
            return Err(Error::PlanFinished(plan_id.to_string()));
        }
        handle.cancel();
        Ok(())
    }

    /// Push a result from an out-of-band transport. Returns whether it was
    /// applied.
    pub async fn deliver_result(
        &self,
        plan_id: &str,
        task_id: &TaskId,
        result: DispatchResult,
    ) -> Result<bool> {
        self.handle(plan_id)?.deliver_result(task_id, result).await
    }

    /// Wait until the plan reaches a final status.
    pub async fn wait(&self, plan_id: &str) -> Result<PlanStatus> {
        Ok(self.handle(plan_id)?.wait().await)
    }

    /// Drop a finished plan and its state store, returning its final status.
    ///
    /// Running plans are kept; cancel them first.
    pub fn forget(&self, plan_id: &str) -> Result<PlanStatus> {
        let mut plans = self.plans.write();
        let status = plans
            .get(plan_id)
            .map(|h| h.status())
            .ok_or_else(|| Error::PlanNotFound(plan_id.to_string()))?;
        if !status.is_finished() {
            return Err(Error::PlanRunning(plan_id.to_string()));
        }
        plans.remove(plan_id);
        debug!(plan_id = %plan_id, status = %status, "Plan forgotten");
        Ok(status)
    }

    /// Drop every finished plan. Returns how many were removed.
    pub fn forget_finished(&self) -> usize {
        let mut plans = self.plans.write();
        let before = plans.len();
        plans.retain(|_, h| !h.is_finished());
        before - plans.len()
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("plans", &self.plans.read().len())
            .field("retry", &self.ctx.retry)
            .field("event_buffer", &self.event_buffer)
            .finish()
    }
}
