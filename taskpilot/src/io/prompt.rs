//! Prompt composition for agent attempts and planning calls.
//!
//! A task prompt has two halves: a `system` block that is identical for every
//! task of a run, and a `user` block rendered from the task, the run's gates and
//! the assembled context. Retries reuse the previous `user` block, replacing
//! its failure section instead of appending another one.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::graph::{MAX_SUGGESTED_TASKS, MIN_SUGGESTED_TASKS};
use crate::core::types::BLOCKED_MARKER;
use crate::io::context::AssembledContext;
use crate::task::{QualityGate, Task};

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const TASK_TEMPLATE: &str = include_str!("prompts/task.md");
const RETRY_TEMPLATE: &str = include_str!("prompts/retry.md");
const GENERATOR_TEMPLATE: &str = include_str!("prompts/generator.md");
const DECOMPOSER_TEMPLATE: &str = include_str!("prompts/decomposer.md");

/// Boundary in front of the single failure section of a retry prompt.
pub const RETRY_MARKER: &str = "<!-- taskpilot:retry-context -->";

pub const DEFAULT_PROMPT_BUDGET_BYTES: usize = 60_000;
/// Gate output kept in a retry prompt, in characters from the end.
pub const GATE_TAIL_CHARS: usize = 2_000;
/// Agent output kept in a retry prompt, in characters from the end.
pub const AGENT_TAIL_CHARS: usize = 1_000;

const NO_ACCEPTANCE: &str = "(No explicit acceptance criteria; the quality gates define done)";
const NO_FILES: &str = "(No specific files predicted; determine from context)";
const NO_REFERENCE_FILES: &str = "(None listed)";
const NO_GATES: &str = "(No quality gates configured; verify the change yourself)";

/// Droppable sections, least valuable first.
const DROP_ORDER: [&str; 3] = ["recalled", "progress", "dead_ends"];

#[derive(Debug, Clone, Serialize)]
struct Placeholders {
    acceptance: &'static str,
    files_to_modify: &'static str,
    relevant_files: &'static str,
    gates: &'static str,
}

const PLACEHOLDERS: Placeholders = Placeholders {
    acceptance: NO_ACCEPTANCE,
    files_to_modify: NO_FILES,
    relevant_files: NO_REFERENCE_FILES,
    gates: NO_GATES,
};

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("system.md", SYSTEM_TEMPLATE)
            .expect("system template should be valid");
        env.add_template("task.md", TASK_TEMPLATE)
            .expect("task template should be valid");
        env.add_template("retry.md", RETRY_TEMPLATE)
            .expect("retry template should be valid");
        env.add_template("generator.md", GENERATOR_TEMPLATE)
            .expect("generator template should be valid");
        env.add_template("decomposer.md", DECOMPOSER_TEMPLATE)
            .expect("decomposer template should be valid");
        Self { env }
    }

    fn render(&self, name: &str, ctx: minijinja::Value) -> Result<String> {
        let template = self.env.get_template(name)?;
        template
            .render(ctx)
            .with_context(|| format!("render prompt template {name}"))
    }
}

static ENGINE: LazyLock<PromptEngine> = LazyLock::new(PromptEngine::new);

/// The two halves of a task prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposedPrompt {
    /// Static across every task of a run.
    pub system: String,
    pub user: String,
}

impl ComposedPrompt {
    /// Single text sent to the agent on stdin: system first, then user.
    pub fn render(&self) -> String {
        format!("{}\n\n{}\n", self.system.trim_end(), self.user.trim_end())
    }
}

/// Inputs for the failure section of a retry prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureContext {
    pub attempt_number: u32,
    pub gate_output: String,
    pub agent_output: String,
}

/// Renders task prompts within a byte budget.
#[derive(Debug, Clone)]
pub struct PromptComposer {
    budget_bytes: usize,
}

impl Default for PromptComposer {
    fn default() -> Self {
        Self::new(DEFAULT_PROMPT_BUDGET_BYTES)
    }
}

impl PromptComposer {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    /// System half of every task prompt.
    pub fn system_prompt(&self) -> Result<String> {
        ENGINE.render("system.md", context! { blocked_marker => BLOCKED_MARKER })
    }

    /// First-attempt prompt for `task`.
    pub fn compose(
        &self,
        task: &Task,
        gates: &[QualityGate],
        assembled: &AssembledContext,
    ) -> Result<ComposedPrompt> {
        let files_to_modify: Vec<&String> = task.files_to_modify.iter().collect();
        let dependencies: Vec<&String> = task.depends_on.iter().collect();
        let rendered = ENGINE.render(
            "task.md",
            context! {
                task => task,
                dependencies => dependencies,
                files_to_modify => files_to_modify,
                gates => gates,
                recalled => &assembled.recalled,
                dead_ends => &assembled.dead_ends,
                progress => &assembled.progress,
                placeholders => PLACEHOLDERS,
            },
        )?;

        let mut sections = parse_sections(&rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        Ok(ComposedPrompt {
            system: self.system_prompt()?,
            user: render_sections(&sections),
        })
    }

    /// Prompt for the next attempt: `previous` with its failure section replaced.
    pub fn retry(
        &self,
        previous: &ComposedPrompt,
        failure: &FailureContext,
    ) -> Result<ComposedPrompt> {
        Ok(ComposedPrompt {
            system: previous.system.clone(),
            user: apply_retry_context(&previous.user, failure)?,
        })
    }
}

/// Remove a previously appended failure section, if any.
pub fn strip_retry_context(user: &str) -> &str {
    match user.find(RETRY_MARKER) {
        Some(idx) => user[..idx].trim_end(),
        None => user.trim_end(),
    }
}

/// Strip any earlier failure section from `user` and append one for `failure`.
///
/// Output size is bounded by the base prompt plus the tail limits no matter how
/// often it is applied.
pub fn apply_retry_context(user: &str, failure: &FailureContext) -> Result<String> {
    let block = ENGINE.render(
        "retry.md",
        context! {
            attempt_number => failure.attempt_number,
            gate_output => or_none(tail_chars(&failure.gate_output, GATE_TAIL_CHARS)),
            agent_output => or_none(tail_chars(&failure.agent_output, AGENT_TAIL_CHARS)),
            blocked_marker => BLOCKED_MARKER,
        },
    )?;
    Ok(format!(
        "{}\n\n{RETRY_MARKER}\n{}\n",
        strip_retry_context(user),
        block.trim()
    ))
}

/// Prompt asking the agent to write an implementation document.
pub fn generator_prompt(description: &str, codebase: &str) -> Result<String> {
    ENGINE.render(
        "generator.md",
        context! { description => description, codebase => or_none(codebase) },
    )
}

/// Prompt asking the agent to split a document into raw task records.
pub fn decomposer_prompt(document: &str, codebase: &str) -> Result<String> {
    ENGINE.render(
        "decomposer.md",
        context! {
            document => document,
            codebase => or_none(codebase),
            min_tasks => MIN_SUGGESTED_TASKS,
            max_tasks => MAX_SUGGESTED_TASKS,
        },
    )
}

/// The last `max_chars` characters of `text`.
pub fn tail_chars(text: &str, max_chars: usize) -> &str {
    if max_chars == 0 {
        return "";
    }
    match text.char_indices().rev().nth(max_chars - 1) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

fn or_none(text: &str) -> &str {
    if text.trim().is_empty() { "(none)" } else { text }
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    /// Required sections are never dropped.
    required: bool,
    content: String,
}

/// Split rendered output on `<!-- section:KEY required|droppable -->` markers.
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
            .expect("section marker regex should be valid")
    });

    let markers: Vec<(usize, usize, String, bool)> = SECTION_RE
        .captures_iter(rendered)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some((
                whole.start(),
                whole.end(),
                caps.get(1)?.as_str().to_string(),
                caps.get(2)?.as_str() == "required",
            ))
        })
        .collect();

    let mut sections = Vec::new();
    for (i, (_, end, key, required)) in markers.iter().enumerate() {
        let next = markers
            .get(i + 1)
            .map_or(rendered.len(), |(start, ..)| *start);
        let content = rendered[*end..next].trim().to_string();
        if !content.is_empty() || *required {
            sections.push(ParsedSection {
                key: key.clone(),
                required: *required,
                content,
            });
        }
    }
    sections
}

/// Drop droppable sections in [`DROP_ORDER`] until the total fits `budget`,
/// then truncate the last section if still over.
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len = |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    let total = total_len(sections);
    let Some(last) = sections.last_mut() else {
        return;
    };
    if total <= budget {
        return;
    }
    let allowed = budget.saturating_sub(total - last.content.len());
    let before_len = last.content.len();
    let mut cut = allowed.saturating_sub(12);
    while !last.content.is_char_boundary(cut) {
        cut -= 1;
    }
    last.content.truncate(cut);
    last.content.push_str("\n[truncated]");
    debug!(
        section = %last.key,
        before_len,
        after_len = last.content.len(),
        "truncated section for budget"
    );
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::QualityGate;
    use crate::test_support::{task, task_with_files};

    fn gates() -> Vec<QualityGate> {
        vec![QualityGate {
            kind: "test".to_string(),
            command: "cargo test".to_string(),
        }]
    }

    fn failure(n: u32) -> FailureContext {
        FailureContext {
            attempt_number: n,
            gate_output: format!("gate failure {n}\n").repeat(500),
            agent_output: format!("agent said {n}\n").repeat(500),
        }
    }

    /// Verifies the system half does not depend on the task.
    #[test]
    fn system_half_is_static_across_tasks() {
        let composer = PromptComposer::default();
        let ctx = AssembledContext::from_progress("");
        let a = composer.compose(&task(1), &gates(), &ctx).expect("compose");
        let b = composer.compose(&task(2), &[], &ctx).expect("compose");
        assert_eq!(a.system, b.system);
        assert!(a.system.contains(BLOCKED_MARKER));
        assert_ne!(a.user, b.user);
    }

    /// Verifies every placeholder is filled, with documented defaults for empty lists.
    #[test]
    fn empty_lists_render_placeholders() {
        let composer = PromptComposer::default();
        let prompt = composer
            .compose(&task(1), &[], &AssembledContext::from_progress(""))
            .expect("compose");

        assert!(prompt.user.contains(NO_FILES));
        assert!(prompt.user.contains(NO_ACCEPTANCE));
        assert!(prompt.user.contains(NO_GATES));
        assert!(prompt.user.contains(crate::io::context::NO_MEMORIES));
        assert!(!prompt.user.contains("{{"));
        assert!(!prompt.user.contains("section:"));
    }

    /// Verifies task fields and gates appear in the user half.
    #[test]
    fn task_fields_are_rendered() {
        let mut t = task_with_files(3, &["src/api.rs"]);
        t.acceptance_criteria = vec!["endpoint returns 200".to_string()];
        t.depends_on.insert("task_001".to_string());
        let prompt = PromptComposer::default()
            .compose(&t, &gates(), &AssembledContext::from_progress("task_001 done"))
            .expect("compose");

        assert!(prompt.user.contains("## Task task_003"));
        assert!(prompt.user.contains("- src/api.rs"));
        assert!(prompt.user.contains("- endpoint returns 200"));
        assert!(prompt.user.contains("- test: `cargo test`"));
        assert!(prompt.user.contains("Depends on: task_001"));
        assert!(prompt.user.contains("task_001 done"));
        assert!(!prompt.user.contains(NO_FILES));
    }

    /// Verifies repeated retries keep exactly one failure section.
    #[test]
    fn retry_context_never_accumulates() {
        let composer = PromptComposer::default();
        let base = composer
            .compose(&task(1), &gates(), &AssembledContext::from_progress(""))
            .expect("compose");

        let first = composer.retry(&base, &failure(1)).expect("retry");
        let second = composer.retry(&first, &failure(2)).expect("retry");
        let tenth = (3..=10).fold(second.clone(), |prompt, n| {
            composer.retry(&prompt, &failure(n)).expect("retry")
        });

        assert_eq!(second.user.matches(RETRY_MARKER).count(), 1);
        assert!(second.user.contains("attempt 2"));
        assert!(!second.user.contains("attempt 1)"));
        assert_eq!(tenth.user.matches(RETRY_MARKER).count(), 1);
        assert!(tenth.user.len() <= first.user.len() + 16);
        assert!(strip_retry_context(&tenth.user).starts_with(strip_retry_context(&base.user)));
    }

    /// Verifies tails keep the end of long outputs.
    #[test]
    fn retry_block_keeps_output_tails() {
        let failure = FailureContext {
            attempt_number: 1,
            gate_output: format!("{}GATE_END", "x".repeat(5_000)),
            agent_output: format!("{}AGENT_END", "y".repeat(5_000)),
        };
        let user = apply_retry_context("base", &failure).expect("retry");
        assert!(user.contains("GATE_END"));
        assert!(user.contains("AGENT_END"));
        assert!(!user.contains(&"x".repeat(GATE_TAIL_CHARS + 1)));
        assert!(!user.contains(&"y".repeat(AGENT_TAIL_CHARS + 1)));
        assert!(user.contains(BLOCKED_MARKER));
    }

    #[test]
    fn tail_chars_respects_char_boundaries() {
        assert_eq!(tail_chars("héllo wörld", 5), "wörld");
        assert_eq!(tail_chars("abc", 10), "abc");
        assert_eq!(tail_chars("abc", 0), "");
    }

    /// Verifies budget enforcement drops recalled memories before dead ends.
    #[test]
    fn budget_drops_less_valuable_context_first() {
        let ctx = AssembledContext {
            recalled: "memory ".repeat(400),
            dead_ends: "dead end".to_string(),
            progress: "progress".to_string(),
        };
        let prompt = PromptComposer::new(1_500)
            .compose(&task(1), &gates(), &ctx)
            .expect("compose");

        assert!(!prompt.user.contains("## Relevant Memories"));
        assert!(prompt.user.contains("## Known Dead Ends"));
        assert!(prompt.user.contains("## Task task_001"));
        assert!(prompt.user.contains("## Quality Gates"));
    }

    #[test]
    fn planning_prompts_embed_inputs() {
        let generator = generator_prompt("add dark mode", "src/main.rs").expect("render");
        assert!(generator.contains("add dark mode"));
        assert!(generator.contains("src/main.rs"));

        let decomposer = decomposer_prompt("# Doc", "").expect("render");
        assert!(decomposer.contains("# Doc"));
        assert!(decomposer.contains("(none)"));
        assert!(decomposer.contains(&MAX_SUGGESTED_TASKS.to_string()));
    }
}
