//! Dependency graph validation for a task set.
//!
//! Produces a topological order, fatal errors (cycles, dangling references,
//! duplicate ids) and advisory warnings (file overlaps, shape hints). The
//! pairwise file-overlap data is also returned as a [`ConflictMap`] so the
//! scheduler can keep overlapping tasks from running at the same time.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::task::Task;

/// Fewer tasks than this triggers a "too coarse" warning.
pub const MIN_SUGGESTED_TASKS: usize = 3;
/// More tasks than this triggers a "too fine" warning.
pub const MAX_SUGGESTED_TASKS: usize = 30;

/// Two tasks that modify at least one common path with no direct dependency edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileConflict {
    pub first: String,
    pub second: String,
    pub paths: Vec<String>,
}

/// Symmetric lookup of file conflicts between task ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictMap {
    partners: BTreeMap<String, BTreeSet<String>>,
    conflicts: Vec<FileConflict>,
}

impl ConflictMap {
    fn insert(&mut self, conflict: FileConflict) {
        self.partners
            .entry(conflict.first.clone())
            .or_default()
            .insert(conflict.second.clone());
        self.partners
            .entry(conflict.second.clone())
            .or_default()
            .insert(conflict.first.clone());
        self.conflicts.push(conflict);
    }

    /// True if `a` and `b` must never run concurrently.
    pub fn conflicts_with(&self, a: &str, b: &str) -> bool {
        self.partners
            .get(a)
            .is_some_and(|partners| partners.contains(b))
    }

    /// True if `id` conflicts with any id in `others`.
    pub fn conflicts_with_any<'a>(
        &self,
        id: &str,
        others: impl IntoIterator<Item = &'a str>,
    ) -> bool {
        others.into_iter().any(|other| self.conflicts_with(id, other))
    }

    pub fn pairs(&self) -> &[FileConflict] {
        &self.conflicts
    }

    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// Result of validating a task set.
#[derive(Debug, Clone, Default)]
pub struct GraphReport {
    /// Task ids with every dependency ahead of its dependents.
    pub order: Vec<String>,
    /// Fatal problems: the run must not start when non-empty.
    pub errors: Vec<String>,
    /// Advisory problems.
    pub warnings: Vec<String>,
    pub conflicts: ConflictMap,
}

impl GraphReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validate `tasks` and compute their topological order.
pub fn validate_graph(tasks: &[Task]) -> GraphReport {
    let mut report = GraphReport::default();
    let sorted = sorted_by_sequence(tasks);

    let mut seen = HashSet::new();
    for task in &sorted {
        if !seen.insert(task.id.as_str()) {
            report.errors.push(format!("duplicate task id '{}'", task.id));
        }
    }

    for task in &sorted {
        for dep in &task.depends_on {
            if !seen.contains(dep.as_str()) {
                report.errors.push(format!(
                    "task '{}' depends on unknown task '{}'",
                    task.id, dep
                ));
            }
        }
    }

    let (order, cycle_errors) = topological_order(&sorted);
    report.order = order;
    report.errors.extend(cycle_errors);

    report.conflicts = detect_conflicts(&sorted);
    for conflict in report.conflicts.pairs() {
        report.warnings.push(format!(
            "tasks '{}' and '{}' both modify {} with no dependency between them; they will not run concurrently",
            conflict.first,
            conflict.second,
            conflict.paths.join(", ")
        ));
    }

    report.warnings.extend(shape_warnings(&sorted));
    report
}

fn sorted_by_sequence(tasks: &[Task]) -> Vec<&Task> {
    let mut sorted: Vec<&Task> = tasks.iter().collect();
    sorted.sort_by(|a, b| a.sequence.cmp(&b.sequence).then_with(|| a.id.cmp(&b.id)));
    sorted
}

struct Traversal<'a> {
    index: HashMap<&'a str, &'a Task>,
    visited: HashSet<&'a str>,
    stack: Vec<&'a str>,
    order: Vec<String>,
    errors: Vec<String>,
}

/// Post-order DFS over `depends_on` edges restricted to known ids.
///
/// Returns the order plus one error per back edge found.
fn topological_order(tasks: &[&Task]) -> (Vec<String>, Vec<String>) {
    let mut walk = Traversal {
        index: tasks.iter().map(|task| (task.id.as_str(), *task)).collect(),
        visited: HashSet::new(),
        stack: Vec::new(),
        order: Vec::with_capacity(tasks.len()),
        errors: Vec::new(),
    };
    for task in tasks {
        if !walk.visited.contains(task.id.as_str()) {
            visit(&mut walk, task.id.as_str());
        }
    }
    (walk.order, walk.errors)
}

fn visit<'a>(walk: &mut Traversal<'a>, id: &'a str) {
    let Some(task) = walk.index.get(id).copied() else {
        return;
    };
    walk.stack.push(id);
    for dep in &task.depends_on {
        let dep = dep.as_str();
        if !walk.index.contains_key(dep) {
            continue;
        }
        if let Some(pos) = walk.stack.iter().position(|on_stack| *on_stack == dep) {
            let mut cycle: Vec<&str> = walk.stack[pos..].to_vec();
            cycle.push(dep);
            walk.errors.push(format!(
                "dependency cycle at task '{}': {}",
                dep,
                cycle.join(" -> ")
            ));
            continue;
        }
        if !walk.visited.contains(dep) {
            visit(walk, dep);
        }
    }
    walk.stack.pop();
    if walk.visited.insert(id) {
        walk.order.push(id.to_string());
    }
}

/// Pairwise `files_to_modify` overlaps between tasks with no direct edge.
pub fn detect_conflicts(tasks: &[&Task]) -> ConflictMap {
    let mut map = ConflictMap::default();
    for (i, first) in tasks.iter().enumerate() {
        for second in &tasks[i + 1..] {
            if first.depends_on.contains(&second.id) || second.depends_on.contains(&first.id) {
                continue;
            }
            let paths: Vec<String> = first
                .files_to_modify
                .intersection(&second.files_to_modify)
                .cloned()
                .collect();
            if paths.is_empty() {
                continue;
            }
            map.insert(FileConflict {
                first: first.id.clone(),
                second: second.id.clone(),
                paths,
            });
        }
    }
    map
}

fn shape_warnings(tasks: &[&Task]) -> Vec<String> {
    let mut warnings = Vec::new();
    if tasks.len() < MIN_SUGGESTED_TASKS {
        warnings.push(format!(
            "only {} task(s); the decomposition may be too coarse",
            tasks.len()
        ));
    }
    if tasks.len() > MAX_SUGGESTED_TASKS {
        warnings.push(format!(
            "{} tasks; the decomposition may be too fine-grained (suggested max {})",
            tasks.len(),
            MAX_SUGGESTED_TASKS
        ));
    }
    for task in tasks {
        if task.files_to_modify.is_empty() {
            warnings.push(format!(
                "task '{}' lists no files_to_modify; conflicts cannot be detected for it",
                task.id
            ));
        }
    }
    warnings
}
