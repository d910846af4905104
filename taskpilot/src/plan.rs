//! Turning a feature description (or an existing document) into a stored task set.

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::agents::decomposer::{RawTask, parse_raw_tasks, tasks_from_raw};
use crate::agents::planner::{DocumentGenerator, TaskDecomposer};
use crate::core::graph::validate_graph;
use crate::core::invariants::validate_task_invariants;
use crate::error::RunError;
use crate::io::store::{DocumentRecord, RunStore, new_document_id};
use crate::task::Task;

const MAX_TITLE_CHARS: usize = 80;

/// A newly stored document and its task set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanOutcome {
    pub doc_id: String,
    pub title: String,
    pub tasks: Vec<Task>,
    /// Advisory findings of the validator.
    pub warnings: Vec<String>,
}

/// Description -> document -> raw tasks -> validated task set, stored as a new document.
#[instrument(skip_all)]
pub fn generate_plan(
    store: &dyn RunStore,
    generator: &dyn DocumentGenerator,
    decomposer: &dyn TaskDecomposer,
    description: &str,
    codebase: &str,
    max_attempts_default: u32,
) -> Result<PlanOutcome> {
    let document = generator.generate(description, codebase)?;
    let raw = decomposer.decompose(&document, codebase)?;
    store_plan(store, description, &document, raw, max_attempts_default)
}

/// Store a document together with decomposer output produced elsewhere.
#[instrument(skip_all)]
pub fn import_plan(
    store: &dyn RunStore,
    document: &str,
    decomposer_output: &str,
    max_attempts_default: u32,
) -> Result<PlanOutcome> {
    let raw = parse_raw_tasks(decomposer_output)?;
    store_plan(store, "", document, raw, max_attempts_default)
}

/// Validate first; nothing is written for an invalid task set.
fn store_plan(
    store: &dyn RunStore,
    description: &str,
    document: &str,
    raw: Vec<RawTask>,
    max_attempts_default: u32,
) -> Result<PlanOutcome> {
    let tasks = tasks_from_raw(raw, max_attempts_default);
    if tasks.is_empty() {
        return Err(RunError::validation("decomposer produced no tasks").into());
    }
    let report = validate_graph(&tasks);
    let mut errors = report.errors;
    errors.extend(validate_task_invariants(&tasks));
    if !errors.is_empty() {
        return Err(RunError::Validation(errors).into());
    }
    for warning in &report.warnings {
        warn!("{warning}");
    }

    let title = document_title(document, description);
    let record = DocumentRecord {
        id: new_document_id(),
        title: title.clone(),
        description: description.to_string(),
        created_at: Utc::now(),
    };
    store
        .save_document(&record, document)
        .with_context(|| format!("save document {}", record.id))?;
    store
        .save_tasks(&record.id, &tasks)
        .with_context(|| format!("save tasks of {}", record.id))?;
    info!(doc = %record.id, tasks = tasks.len(), "stored plan");

    Ok(PlanOutcome {
        doc_id: record.id,
        title,
        tasks,
        warnings: report.warnings,
    })
}

/// First markdown heading, else the first line of the description.
fn document_title(document: &str, description: &str) -> String {
    let heading = document
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix('#'))
        .map(|line| line.trim_start_matches('#').trim());
    let title = heading
        .filter(|h| !h.is_empty())
        .or_else(|| description.lines().map(str::trim).find(|l| !l.is_empty()))
        .unwrap_or("Untitled plan");
    title.chars().take(MAX_TITLE_CHARS).collect()
}
