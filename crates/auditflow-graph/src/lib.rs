//! Workflow graph model and execution planning.
//!
//! A workflow is a directed graph of audit `Step`s connected by
//! `Dependency` edges ("target depends on source"). The `StepGraph` is the
//! pure in-memory structure; the `ExecutionPlanner` computes topological
//! order, the ready frontier, and advisory parallel waves against the acting
//! user's recorded step results.

pub mod model;
pub mod planner;

pub use model::StepGraph;
pub use planner::ExecutionPlanner;
