//! Normalization of decomposer output into task records.
//!
//! Model responses arrive as a bare JSON array, an array inside a fenced code
//! block, or an array surrounded by prose. Each shape is tried in that order
//! and must satisfy the raw task schema.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use jsonschema::{Validator, validator_for};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::RunError;
use crate::task::{Priority, Task, task_id};

const RAW_TASKS_SCHEMA: &str = include_str!("../../schemas/raw_tasks.schema.json");

static RAW_TASKS_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(RAW_TASKS_SCHEMA).expect("raw task schema should be valid JSON");
    validator_for(&schema).expect("raw task schema should compile")
});

/// A dependency written either as a task id or as a 1-based position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependencyRef {
    Position(u32),
    Id(String),
}

impl DependencyRef {
    fn to_task_id(&self) -> String {
        match self {
            DependencyRef::Position(n) => task_id(*n),
            DependencyRef::Id(id) => id.trim().to_string(),
        }
    }
}

/// One task record as produced by the decomposer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub depends_on: Vec<DependencyRef>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub files_to_modify: Vec<String>,
    #[serde(default)]
    pub relevant_files: Vec<String>,
    #[serde(default)]
    pub context_queries: Vec<String>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

/// Parse decomposer output, trying direct JSON, a fenced block, then the
/// first-`[`-to-last-`]` slice.
///
/// Fails with [`RunError::Validation`] listing why each shape was rejected.
pub fn parse_raw_tasks(text: &str) -> Result<Vec<RawTask>> {
    let candidates = [
        ("direct", Some(text.trim())),
        ("fenced block", fenced_block(text)),
        ("bracket slice", bracket_slice(text)),
    ];

    let mut reasons = Vec::new();
    for (shape, candidate) in candidates {
        let Some(candidate) = candidate else {
            reasons.push(format!("{shape}: not present"));
            continue;
        };
        match parse_candidate(candidate) {
            Ok(tasks) => {
                debug!(shape, tasks = tasks.len(), "parsed decomposer output");
                return Ok(tasks);
            }
            Err(err) => reasons.push(format!("{shape}: {err:#}")),
        }
    }
    let mut errors = vec!["decomposer output did not contain a valid task array".to_string()];
    errors.extend(reasons);
    Err(RunError::Validation(errors).into())
}

fn parse_candidate(candidate: &str) -> Result<Vec<RawTask>> {
    let value: Value = serde_json::from_str(candidate)?;
    if !RAW_TASKS_VALIDATOR.is_valid(&value) {
        let messages = RAW_TASKS_VALIDATOR
            .iter_errors(&value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!("schema violations: {}", messages.join("; ")));
    }
    Ok(serde_json::from_value(value)?)
}

/// Contents of the first ``` fenced block, skipping any language tag.
fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after_fence = &text[start + 3..];
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let end = body.find("```")?;
    let block = body[..end].trim();
    (!block.is_empty()).then_some(block)
}

fn bracket_slice(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    (end > start).then(|| &text[start..=end])
}

/// Turn raw records into pending tasks numbered from 1 in the given order.
pub fn tasks_from_raw(raw: Vec<RawTask>, max_attempts_default: u32) -> Vec<Task> {
    raw.into_iter()
        .enumerate()
        .map(|(idx, record)| {
            let mut task = Task::new(idx as u32 + 1, record.title.trim(), record.description.trim());
            task.priority = record.priority;
            task.depends_on = record
                .depends_on
                .iter()
                .map(DependencyRef::to_task_id)
                .filter(|id| !id.is_empty())
                .collect();
            task.acceptance_criteria = non_empty(record.acceptance_criteria);
            task.files_to_modify = non_empty(record.files_to_modify)
                .into_iter()
                .collect::<BTreeSet<_>>();
            task.relevant_files = non_empty(record.relevant_files);
            task.context_queries = non_empty(record.context_queries);
            task.max_attempts = record.max_attempts.unwrap_or(max_attempts_default);
            task
        })
        .collect()
}

fn non_empty(items: Vec<String>) -> Vec<String> {
    items
        .into_iter()
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}
