//! Per-run state machine, registry, and the approval/retry workflow.

pub mod registry;
pub mod state;
pub mod types;
pub mod workflow;
