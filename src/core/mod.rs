//! Core domain models for plan execution.
//!
//! This module contains the plan model, the DAG validator that turns a
//! submitted plan into a schedulable graph, and the per-task execution
//! state shared by the scheduler and status readers.

pub mod dag;
pub mod execution;
pub mod plan;

pub use dag::{validate, ValidatedPlan};
pub use execution::{
    AttemptOutcome, AttemptRecord, ExecutionStore, PlanStatus, TaskError, TaskExecutionState,
    TaskStatus,
};
pub use plan::{AgentId, Plan, TaskId, TaskSpec};
