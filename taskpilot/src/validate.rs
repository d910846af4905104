//! Standalone validation of a stored task set.

use anyhow::{Context, Result};

use crate::core::graph::{FileConflict, validate_graph};
use crate::core::invariants::validate_task_invariants;
use crate::core::scheduler::{Scope, TaskTable, plan_waves};
use crate::io::store::RunStore;

/// Validator findings for one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub doc_id: String,
    pub task_count: usize,
    pub order: Vec<String>,
    /// Predicted dispatch waves; empty when the set is invalid.
    pub waves: Vec<Vec<String>>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub conflicts: Vec<FileConflict>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Load the task set of `doc_id` and run the graph and invariant checks.
///
/// Only loading can fail; an invalid task set is reported, not returned as `Err`.
pub fn validate_document(
    store: &dyn RunStore,
    doc_id: &str,
    concurrency: usize,
) -> Result<ValidationReport> {
    let tasks = store
        .load_tasks(doc_id)
        .with_context(|| format!("load tasks for {doc_id}"))?;
    let report = validate_graph(&tasks);
    let mut errors = report.errors.clone();
    errors.extend(validate_task_invariants(&tasks));

    let task_count = tasks.len();
    let waves = if errors.is_empty() {
        let table = TaskTable::new(tasks);
        plan_waves(
            &table,
            &report.order,
            &report.conflicts,
            &Scope::All,
            concurrency,
        )
    } else {
        Vec::new()
    };

    Ok(ValidationReport {
        doc_id: doc_id.to_string(),
        task_count,
        order: report.order,
        waves,
        errors,
        warnings: report.warnings,
        conflicts: report.conflicts.pairs().to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MemoryStore, task, task_with_deps, task_with_files};

    #[test]
    fn valid_set_reports_order_and_waves() {
        let store = MemoryStore::with_tasks(
            "doc_a",
            vec![
                task(1),
                task_with_deps(2, &["task_001"]),
                task_with_deps(3, &["task_001"]),
            ],
        );

        let report = validate_document(&store, "doc_a", 2).expect("validate");

        assert!(report.is_valid());
        assert_eq!(report.task_count, 3);
        assert_eq!(report.order[0], "task_001");
        assert_eq!(
            report.waves,
            vec![vec!["task_001".to_string()], vec!["task_002".into(), "task_003".into()]]
        );
    }

    #[test]
    fn dangling_dependency_is_reported_without_waves() {
        let store = MemoryStore::with_tasks("doc_a", vec![task_with_deps(1, &["task_009"])]);

        let report = validate_document(&store, "doc_a", 2).expect("validate");

        assert!(!report.is_valid());
        assert!(report.waves.is_empty());
    }

    #[test]
    fn conflicts_are_listed() {
        let store = MemoryStore::with_tasks(
            "doc_a",
            vec![
                task_with_files(1, &["src/lib.rs"]),
                task_with_files(2, &["src/lib.rs"]),
                task(3),
            ],
        );

        let report = validate_document(&store, "doc_a", 3).expect("validate");

        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.conflicts[0].paths, vec!["src/lib.rs"]);
    }

    #[test]
    fn unknown_document_is_an_error() {
        assert!(validate_document(&MemoryStore::new(), "doc_x", 1).is_err());
    }
}
