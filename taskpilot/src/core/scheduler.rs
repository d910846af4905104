//! Dispatch decisions over the in-memory task table.

use std::collections::{BTreeSet, HashMap};

use crate::core::graph::ConflictMap;
use crate::task::{Task, TaskStatus};

/// Which tasks a run may execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    All,
    /// A single task whose dependencies are assumed already satisfied.
    Only(String),
}

impl Scope {
    pub fn from_filter(filter: Option<&str>) -> Self {
        match filter {
            Some(id) => Scope::Only(id.to_string()),
            None => Scope::All,
        }
    }

    pub fn includes(&self, id: &str) -> bool {
        match self {
            Scope::All => true,
            Scope::Only(only) => only == id,
        }
    }

    fn assumes_dependencies(&self) -> bool {
        matches!(self, Scope::Only(_))
    }
}

/// Task set indexed by id. The orchestrator owns exactly one of these per run.
#[derive(Debug, Clone, Default)]
pub struct TaskTable {
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
}

impl TaskTable {
    pub fn new(tasks: Vec<Task>) -> Self {
        let index = tasks
            .iter()
            .enumerate()
            .map(|(idx, task)| (task.id.clone(), idx))
            .collect();
        Self { tasks, index }
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.index.get(id).map(|&idx| &self.tasks[idx])
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.index.get(id).map(|&idx| &mut self.tasks[idx])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn tasks_mut(&mut self) -> &mut [Task] {
        &mut self.tasks
    }

    pub fn into_tasks(self) -> Vec<Task> {
        self.tasks
    }

    pub fn status(&self, id: &str) -> Option<TaskStatus> {
        self.get(id).map(|task| task.status)
    }

    /// All dependencies are `completed` or `skipped`.
    pub fn dependencies_satisfied(&self, task: &Task) -> bool {
        task.depends_on.iter().all(|dep| {
            self.status(dep)
                .is_some_and(TaskStatus::satisfies_dependents)
        })
    }

    /// True while some in-scope task is not terminal.
    pub fn has_unfinished(&self, scope: &Scope) -> bool {
        self.tasks
            .iter()
            .any(|task| scope.includes(&task.id) && !task.status.is_terminal())
    }
}

/// True if `task` may start now given the running set.
pub fn is_dispatchable(
    table: &TaskTable,
    task: &Task,
    running: &BTreeSet<String>,
    conflicts: &ConflictMap,
    scope: &Scope,
) -> bool {
    scope.includes(&task.id)
        && task.status == TaskStatus::Pending
        && task.remaining_attempts() > 0
        && !running.contains(&task.id)
        && (scope.assumes_dependencies() || table.dependencies_satisfied(task))
        && !conflicts.conflicts_with_any(&task.id, running.iter().map(String::as_str))
}

/// First dispatchable task id in topological `order`.
pub fn next_dispatchable<'a>(
    table: &TaskTable,
    order: &'a [String],
    running: &BTreeSet<String>,
    conflicts: &ConflictMap,
    scope: &Scope,
) -> Option<&'a str> {
    order
        .iter()
        .filter_map(|id| table.get(id).map(|task| (id, task)))
        .find(|(_, task)| is_dispatchable(table, task, running, conflicts, scope))
        .map(|(id, _)| id.as_str())
}

/// Predict dispatch waves assuming every attempted task completes.
///
/// Tasks that can never start (a dependency already failed) are left out.
pub fn plan_waves(
    table: &TaskTable,
    order: &[String],
    conflicts: &ConflictMap,
    scope: &Scope,
    concurrency: usize,
) -> Vec<Vec<String>> {
    let concurrency = concurrency.max(1);
    let mut simulated = table.clone();
    for task in simulated.tasks_mut() {
        if task.status == TaskStatus::InProgress {
            task.status = TaskStatus::Pending;
        }
    }

    let mut waves = Vec::new();
    loop {
        let mut wave: BTreeSet<String> = BTreeSet::new();
        let mut wave_order = Vec::new();
        for id in order {
            if wave.len() >= concurrency {
                break;
            }
            let Some(task) = simulated.get(id) else {
                continue;
            };
            if is_dispatchable(&simulated, task, &wave, conflicts, scope) {
                wave.insert(id.clone());
                wave_order.push(id.clone());
            }
        }
        if wave_order.is_empty() {
            break;
        }
        for id in &wave_order {
            if let Some(task) = simulated.get_mut(id) {
                task.status = TaskStatus::Completed;
            }
        }
        waves.push(wave_order);
    }
    waves
}
