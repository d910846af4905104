//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! task sets and return deterministic outputs suitable for tests.

pub mod graph;
pub mod invariants;
pub mod lifecycle;
pub mod scheduler;
pub mod types;
