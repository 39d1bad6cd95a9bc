//! Plan execution orchestrator.
//!
//! A plan is a DAG of tasks, each assigned to an external agent. baton
//! validates the graph, dispatches tasks as their dependencies succeed,
//! holds approval-gated tasks until someone decides, retries failures and
//! escalates to fallback agents, and evaluates alert policies against every
//! task outcome.

pub mod alert;
pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod state;
pub mod util;

pub use error::{Error, Result, ValidationError};
pub use orchestration::{Orchestrator, PlanAccepted, SchedulerEvent};
