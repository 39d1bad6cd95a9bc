//! Alert policies evaluated against task outcomes.

pub mod action;
pub mod engine;
pub mod policy;
pub mod rule;
pub mod template;

pub use action::{ActionExecutor, AlertActionError, AlertActionPort};
pub use engine::{AlertEngine, AlertQueue, Firing};
pub use policy::RuleSet;
pub use rule::{
    AlertAction, AlertCondition, AlertEvent, AlertRule, EventType, OutcomeDetail, PolicySet,
    TaskOutcomeEvent,
};
