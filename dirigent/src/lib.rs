//! Control plane for an LLM-driven design pipeline.
//!
//! One submitted input document becomes one *run*: a finite-state machine
//! that walks the pipeline stages (requirements analysis, design planning,
//! validation, execution) under human approval gates and a bounded retry
//! loop. The architecture keeps a strict separation:
//!
//! - **[`run`]**: the per-run state machine, registry, and approval/retry
//!   workflow. Transitions for one run are serialized; distinct runs are
//!   independent.
//! - **[`llm`]**: the resilience layer workers reach language models
//!   through — provider failover, response caching, credential rotation,
//!   and the local-backend lifecycle manager.
//! - **[`supervisor`]**, **[`sandbox`]**, **[`events`]**: side-effecting
//!   seams (worker subprocesses, confined file I/O, per-run event fan-out),
//!   each behind a trait or narrow type so tests can script them.

pub mod config;
pub mod events;
pub mod llm;
pub mod logging;
pub mod run;
pub mod sandbox;
pub mod supervisor;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
