//! DAG validation for submitted plans.
//!
//! Dependencies are represented as a petgraph `DiGraph` whose edges point
//! from a dependency to its dependent, so a task may start only once every
//! incoming neighbour has succeeded. Node `i` always corresponds to
//! `plan.tasks[i]`, which lets the execution store use the same index.

use crate::core::plan::{plan_id_problem, Plan, TaskId, TaskSpec};
use crate::error::ValidationError;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

/// A plan that passed validation, annotated with its topological layering.
pub struct ValidatedPlan {
    plan: Plan,
    graph: DiGraph<TaskId, ()>,
    task_index: HashMap<TaskId, NodeIndex>,
    layers: Vec<Vec<TaskId>>,
    layer_of: Vec<usize>,
}

/// Validate a plan and build its dependency graph.
///
/// # Errors
/// - `InvalidPlanId` if the plan id is empty or is not a single path component
/// - `EmptyPlan` if the plan has no tasks
/// - `DuplicateTaskId` if two tasks share an identifier
/// - `UnknownDependency` if a dependency names a task outside the plan
/// - `CyclicDependency` with the offending cycle if no topological order exists
pub fn validate(plan: Plan) -> Result<ValidatedPlan, ValidationError> {
    if let Some(reason) = plan_id_problem(&plan.plan_id) {
        return Err(ValidationError::InvalidPlanId {
            plan_id: plan.plan_id,
            reason,
        });
    }
    if plan.tasks.is_empty() {
        return Err(ValidationError::EmptyPlan);
    }

    let mut graph = DiGraph::with_capacity(plan.tasks.len(), plan.tasks.len());
    let mut task_index = HashMap::with_capacity(plan.tasks.len());
    for task in &plan.tasks {
        if task_index.contains_key(&task.task_id) {
            return Err(ValidationError::DuplicateTaskId(task.task_id.clone()));
        }
        let index = graph.add_node(task.task_id.clone());
        task_index.insert(task.task_id.clone(), index);
    }

    for task in &plan.tasks {
        let to = task_index[&task.task_id];
        for dep in &task.dependencies {
            let from = task_index
                .get(dep)
                .ok_or_else(|| ValidationError::UnknownDependency {
                    task: task.task_id.clone(),
                    dependency: dep.clone(),
                })?;
            // update_edge collapses repeated dependencies into one edge.
            graph.update_edge(*from, to, ());
        }
    }

    if let Some(cycle) = find_cycle(&graph) {
        return Err(ValidationError::CyclicDependency(cycle));
    }

    let (layers, layer_of) = compute_layers(&graph)?;

    Ok(ValidatedPlan {
        plan,
        graph,
        task_index,
        layers,
        layer_of,
    })
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

fn sorted_neighbors(graph: &DiGraph<TaskId, ()>, node: NodeIndex, dir: Direction) -> Vec<NodeIndex> {
    let mut out: Vec<NodeIndex> = graph.neighbors_directed(node, dir).collect();
    out.sort();
    out
}

/// Depth-first search with gray/black coloring.
///
/// Roots and neighbours are visited in plan order so the reported cycle is
/// deterministic. The returned path starts and ends at the same task.
fn find_cycle(graph: &DiGraph<TaskId, ()>) -> Option<Vec<TaskId>> {
    let mut color = vec![Color::White; graph.node_count()];

    for root in graph.node_indices() {
        if color[root.index()] != Color::White {
            continue;
        }

        // Each frame holds a node and the neighbours still to visit.
        let mut stack: Vec<(NodeIndex, Vec<NodeIndex>)> = Vec::new();
        color[root.index()] = Color::Gray;
        let mut next = sorted_neighbors(graph, root, Direction::Outgoing);
        next.reverse();
        stack.push((root, next));

        while let Some((node, pending)) = stack.last_mut() {
            let node = *node;
            match pending.pop() {
                Some(neighbor) => match color[neighbor.index()] {
                    Color::White => {
                        color[neighbor.index()] = Color::Gray;
                        let mut next = sorted_neighbors(graph, neighbor, Direction::Outgoing);
                        next.reverse();
                        stack.push((neighbor, next));
                    }
                    Color::Gray => {
                        let start = stack
                            .iter()
                            .position(|(n, _)| *n == neighbor)
                            .unwrap_or(0);
                        let mut cycle: Vec<TaskId> = stack[start..]
                            .iter()
                            .map(|(n, _)| graph[*n].clone())
                            .collect();
                        cycle.push(graph[neighbor].clone());
                        return Some(cycle);
                    }
                    Color::Black => {}
                },
                None => {
                    color[node.index()] = Color::Black;
                    stack.pop();
                }
            }
        }
    }

    None
}

/// Group tasks into the minimal number of layers such that every task's
/// layer exceeds those of all its dependencies.
fn compute_layers(
    graph: &DiGraph<TaskId, ()>,
) -> Result<(Vec<Vec<TaskId>>, Vec<usize>), ValidationError> {
    let order = toposort(graph, None).map_err(|cycle| {
        let id = graph[cycle.node_id()].clone();
        ValidationError::CyclicDependency(vec![id.clone(), id])
    })?;

    let mut layer_of = vec![0usize; graph.node_count()];
    for node in order {
        let layer = graph
            .neighbors_directed(node, Direction::Incoming)
            .map(|dep| layer_of[dep.index()] + 1)
            .max()
            .unwrap_or(0);
        layer_of[node.index()] = layer;
    }

    let depth = layer_of.iter().copied().max().map(|m| m + 1).unwrap_or(0);
    let mut layers = vec![Vec::new(); depth];
    for node in graph.node_indices() {
        layers[layer_of[node.index()]].push(graph[node].clone());
    }

    Ok((layers, layer_of))
}

impl ValidatedPlan {
    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn plan_id(&self) -> &str {
        &self.plan.plan_id
    }

    pub fn tasks(&self) -> &[TaskSpec] {
        &self.plan.tasks
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Arena index of a task.
    pub fn index_of(&self, id: &TaskId) -> Option<usize> {
        self.task_index.get(id).map(|n| n.index())
    }

    pub fn task(&self, index: usize) -> &TaskSpec {
        &self.plan.tasks[index]
    }

    /// Indices of the direct dependencies of a task.
    pub fn dependencies(&self, index: usize) -> Vec<usize> {
        sorted_neighbors(&self.graph, NodeIndex::new(index), Direction::Incoming)
            .into_iter()
            .map(|n| n.index())
            .collect()
    }

    /// Indices of the tasks that directly depend on a task.
    pub fn dependents(&self, index: usize) -> Vec<usize> {
        sorted_neighbors(&self.graph, NodeIndex::new(index), Direction::Outgoing)
            .into_iter()
            .map(|n| n.index())
            .collect()
    }

    /// All tasks reachable from `index` along dependent edges, excluding itself.
    pub fn transitive_dependents(&self, index: usize) -> Vec<usize> {
        let mut seen = HashSet::new();
        let mut stack = self.dependents(index);
        let mut out = Vec::new();
        while let Some(next) = stack.pop() {
            if seen.insert(next) {
                out.push(next);
                stack.extend(self.dependents(next));
            }
        }
        out.sort_unstable();
        out
    }

    /// Advisory parallelism layers; layer 0 holds tasks with no dependencies.
    pub fn layers(&self) -> &[Vec<TaskId>] {
        &self.layers
    }

    pub fn layer_of(&self, id: &TaskId) -> Option<usize> {
        self.index_of(id).map(|i| self.layer_of[i])
    }

    /// Tasks flattened layer by layer, which is a valid topological order.
    pub fn topological_order(&self) -> Vec<&TaskId> {
        self.layers.iter().flatten().collect()
    }
}

impl std::fmt::Debug for ValidatedPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidatedPlan")
            .field("plan_id", &self.plan.plan_id)
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .field("layers", &self.layers.len())
            .finish()
    }
}
