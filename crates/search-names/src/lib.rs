//! # search-names
//!
//! The name store: a small on-disk key -> string mapping shared between
//! the active writer and any standby or read-replica process.
//!
//! Each logical index owns three keys: `<key>` (current physical
//! generation), `<key>.next` (generation being built) and `<key>.prev`
//! (retired generation pending offline deletion). The file is rewritten
//! atomically (write-temp-then-rename) and re-read when the in-memory
//! cache is older than its TTL, giving bounded staleness without locks.
//!
//! The heartbeat side file (`<prefix>.beat`) holds the active writer's
//! last successful pass timestamp and is what a standby consults, via
//! the read server, to decide whether the writer is still alive.

pub mod error;
pub mod heartbeat;
pub mod store;

pub use error::NamesError;
pub use heartbeat::{HeartbeatFile, MasterStatus, HEARTBEAT_WRITE_INTERVAL_SECS};
pub use store::{next_key, prev_key, NameStore};
