//! Orchestration layer: agent dispatch, retry/fallback decisions, the
//! per-plan scheduling loop and the submission interface on top of it.

pub mod dispatch;
pub mod orchestrator;
pub mod retry;
pub mod scheduler;

pub use dispatch::{AgentDispatcher, DispatchRequest, DispatchResult};
pub use orchestrator::{Orchestrator, PlanAccepted};
pub use retry::{
    BackoffPolicy, RetryController, RetryDecision, RetryPolicy, TransitionEvent, TransitionKind,
};
pub use scheduler::{PlanHandle, Scheduler, SchedulerContext, SchedulerEvent};
