//! Indexing daemon.
//!
//! Wires configuration, the write engine and the per-index lifecycles
//! together behind a small CLI: a `run` loop, a `names` dump of the
//! generation mapping, and the hidden `reindex-worker` subcommand the
//! daemon spawns for isolated full rebuilds.

pub mod cli;
pub mod commands;
pub mod orchestrator;

pub use orchestrator::Orchestrator;
