//! # search-lifecycle
//!
//! Index-generation lifecycle: the state machine that takes a logical
//! index from unindexed through a full rebuild to steady-state
//! incremental updates.
//!
//! - [`IndexLifecycle`]: due-ness, generation allocation and reuse,
//!   validation, promotion, and the source-drain loop
//! - [`template`]: base + per-type template assembly with language
//!   filter injection
//! - [`ReindexRunner`] / [`ProcessReindexRunner`]: process-isolated
//!   asynchronous full rebuilds
//! - [`Plugin`]: ordered no-op-by-default hooks around the pipeline

pub mod error;
pub mod hooks;
pub mod lifecycle;
pub mod template;
pub mod worker;

pub use error::LifecycleError;
pub use hooks::Plugin;
pub use lifecycle::IndexLifecycle;
pub use worker::{ProcessReindexRunner, ReindexRunner, ReindexStatus, WORKER_SUCCESS_EXIT};
