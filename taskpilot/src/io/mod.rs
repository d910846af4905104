//! I/O helpers: processes, agents, gates, prompts, persistence and git.

pub mod config;
pub mod context;
pub mod executor;
pub mod gates;
pub mod git;
pub mod process;
pub mod prompt;
pub mod store;
