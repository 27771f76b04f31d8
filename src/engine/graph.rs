//! The dependency graph implied by port wiring.
//!
//! The graph is never stored. It is rebuilt on demand by walking each task's
//! ports and composites, freezing every task it touches, and is loaded into
//! `petgraph` to order it and to reject cycles before anything is scheduled.

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::core::TaskId;
use crate::engine::task::Task;
use crate::error::EngineError;

/// A frozen snapshot of the tasks reachable from a set of roots. Edges point
/// from a dependency to its dependent.
pub(crate) struct TaskGraph {
    pub(crate) graph: DiGraphMap<TaskId, ()>,
    pub(crate) tasks: HashMap<TaskId, Task>,
}

impl TaskGraph {
    /// Walks every task reachable from `roots`, freezing each one. Tasks that
    /// are already scheduled are only expanded when `expand_scheduled` is set,
    /// since their upstream was checked when they were scheduled.
    pub(crate) fn walk(roots: &[Task], expand_scheduled: bool) -> Self {
        let mut graph = DiGraphMap::new();
        let mut tasks = HashMap::new();
        let mut stack: Vec<Task> = roots.to_vec();

        while let Some(task) = stack.pop() {
            if tasks.contains_key(&task.id()) {
                continue;
            }

            task.freeze();
            graph.add_node(task.id());

            if expand_scheduled || !task.is_scheduled() {
                for dependency in task.dependencies() {
                    graph.add_edge(dependency.id(), task.id(), ());
                    stack.push(dependency);
                }
            }

            tasks.insert(task.id(), task);
        }

        Self { graph, tasks }
    }

    /// Task ids with every dependency ahead of its dependents.
    pub(crate) fn order(&self) -> Result<Vec<TaskId>, EngineError> {
        toposort(&self.graph, None).map_err(|cycle| {
            let id = cycle.node_id();
            let name = self.tasks.get(&id).map(Task::name).unwrap_or("?");
            EngineError::Cycle(name.to_string())
        })
    }

    /// Ids of the direct dependencies of `id`.
    pub(crate) fn dependencies_of(&self, id: TaskId) -> impl Iterator<Item = TaskId> + '_ {
        self.graph
            .neighbors_directed(id, petgraph::Direction::Incoming)
    }
}

/// Freezes everything reachable from `root` and returns the tasks that still
/// need scheduling, dependencies first.
pub(crate) fn plan(root: &Task) -> Result<Vec<Task>, EngineError> {
    let mut graph = TaskGraph::walk(std::slice::from_ref(root), false);
    let order = graph.order()?;

    Ok(order
        .into_iter()
        .filter_map(|id| graph.tasks.remove(&id))
        .filter(|task| !task.is_scheduled())
        .collect())
}
