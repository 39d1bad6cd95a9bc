//! Alert rule evaluation and action delivery.
//!
//! Evaluation is synchronous and pure: every enabled rule is checked against
//! the outcome on its own, so one outcome can fire several rules. Delivery is
//! asynchronous and goes through an [`AlertQueue`], a FIFO worker that runs
//! actions one after another in the order they were matched.

use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::alert::action::AlertActionPort;
use crate::alert::policy::RuleSet;
use crate::alert::rule::{AlertAction, AlertEvent, PolicySet, TaskOutcomeEvent};
use crate::error::Result;

/// A rule that matched, paired with the action to run.
#[derive(Debug, Clone)]
pub struct Firing {
    pub action: AlertAction,
    pub alert: AlertEvent,
}

pub struct AlertEngine {
    rules: RwLock<Arc<RuleSet>>,
    port: Arc<dyn AlertActionPort>,
}

impl AlertEngine {
    pub fn new(rules: RuleSet, port: Arc<dyn AlertActionPort>) -> Self {
        Self {
            rules: RwLock::new(Arc::new(rules)),
            port,
        }
    }

    /// Engine with no rules; nothing ever fires.
    pub fn disabled(port: Arc<dyn AlertActionPort>) -> Self {
        Self::new(RuleSet::new(), port)
    }

    /// The rule set currently in effect.
    pub fn rules(&self) -> Arc<RuleSet> {
        Arc::clone(&self.rules.read())
    }

    /// Replace the rule set with the merge of `sets`, in order.
    ///
    /// Evaluations already running keep the set they started with.
    pub fn reload(&self, sets: impl IntoIterator<Item = PolicySet>) {
        let merged = Arc::new(RuleSet::from_sets(sets));
        info!(rules = merged.len(), "Alert policies reloaded");
        *self.rules.write() = merged;
    }

    /// Reload from policy files. On error the current rules stay in place.
    pub fn reload_from_files<P: AsRef<Path>>(&self, paths: &[P]) -> Result<usize> {
        let merged = RuleSet::load_files(paths)?;
        let count = merged.len();
        *self.rules.write() = Arc::new(merged);
        info!(rules = count, "Alert policies reloaded from files");
        Ok(count)
    }

    /// Every enabled rule whose condition matches the outcome.
    pub fn evaluate(&self, outcome: &TaskOutcomeEvent) -> Vec<Firing> {
        let rules = self.rules();
        let outcome = Arc::new(outcome.clone());
        let firings: Vec<Firing> = rules
            .enabled()
            .filter(|rule| rule.condition.matches(&outcome))
            .map(|rule| Firing {
                action: rule.action.clone(),
                alert: AlertEvent::new(rule, Arc::clone(&outcome)),
            })
            .collect();
        if !firings.is_empty() {
            debug!(
                task_id = %outcome.task_id,
                event_type = %outcome.event_type(),
                fired = firings.len(),
                "Alert rules matched"
            );
        }
        firings
    }

    /// Run one action. Failures are logged and swallowed.
    pub async fn deliver(&self, firing: &Firing) -> bool {
        match self.port.execute(&firing.action, &firing.alert).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    rule = %firing.alert.rule_name,
                    task_id = %firing.alert.task_id,
                    action = firing.action.kind(),
                    error = %e,
                    "Alert action failed"
                );
                false
            }
        }
    }

    /// Start a delivery worker. The worker exits once every [`AlertQueue`]
    /// clone is dropped and the queue is drained.
    pub fn spawn_worker(self: &Arc<Self>) -> (AlertQueue, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Firing>();
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(firing) = rx.recv().await {
                engine.deliver(&firing).await;
            }
        });
        (AlertQueue { tx }, handle)
    }
}

impl std::fmt::Debug for AlertEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertEngine")
            .field("rules", &self.rules.read().len())
            .finish()
    }
}

/// Sending side of an alert delivery worker.
#[derive(Debug, Clone)]
pub struct AlertQueue {
    tx: mpsc::UnboundedSender<Firing>,
}

impl AlertQueue {
    pub fn enqueue(&self, firings: Vec<Firing>) {
        for firing in firings {
            if self.tx.send(firing).is_err() {
                warn!("Alert worker stopped; dropping alert");
                return;
            }
        }
    }
}
