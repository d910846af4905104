//! Task graph validation and agent execution orchestration.
//!
//! A feature description becomes an implementation document, the document
//! becomes a set of dependent tasks, and the orchestrator drives a coding
//! agent through them one attempt at a time, checking each attempt with
//! quality gates. The crate is split the usual way:
//!
//! - **[`core`]**: Pure, deterministic logic (graph validation, scheduling,
//!   task state transitions). No I/O.
//! - **[`io`]**: Side-effecting collaborators (agent processes, gates, recall,
//!   prompts, persistence, git), each behind a trait so tests can script them.
//! - **[`agents`]**: Model-backed planning (document generation, decomposition).
//!
//! Orchestration modules ([`orchestrator`], [`attempt`], [`plan`],
//! [`validate`], [`status`]) combine the two to implement CLI commands.

pub mod agents;
pub mod attempt;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod plan;
pub mod status;
pub mod task;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validate;
