//! Model-backed planning collaborators: document generation and task decomposition.

pub mod decomposer;
pub mod planner;
