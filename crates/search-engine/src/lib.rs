//! # search-engine
//!
//! The write engine: owns the connection to the backing document-index
//! store and everything that writes through it.
//!
//! - [`StoreClient`]: thin HTTP client for the store's document API
//!   (external-versioned puts, bulk, index admin, aliases, stats)
//! - [`WriteEngine`]: optimistic-versioned single writes, buffered bulk
//!   writes with a degraded fallback mode, alias management, read-side
//!   query translation, and the master/slave heartbeat protocol
//! - [`MasterProbe`]: cached view of a remote master's heartbeat used by
//!   standby instances to decide whether to take over writing

pub mod client;
pub mod engine;
pub mod error;
pub mod heartbeat;

pub use client::{BulkReport, ServerInfo, StoreClient};
pub use engine::{SearchResult, WriteEngine, WriteOutcome, ENGINE_VERSION};
pub use error::EngineError;
pub use heartbeat::{MasterProbe, WriterRole, MASTER_PROBE_CACHE_SECS};
