//! # search-source
//!
//! Upstream feed sources: everything between the remote record API and
//! the write engine.
//!
//! - [`Source`]: the pull interface the index lifecycle drains
//! - [`FeedSource`]: paginated polling with a skip window, an optional
//!   fast descending cursor, an LRU content cache for terminal
//!   documents, and rate shaping
//! - [`FeedClient`]: the stateful HTTP pagination cursor underneath

pub mod cache;
pub mod error;
pub mod feed;
pub mod source;

pub use cache::ContentCache;
pub use error::SourceError;
pub use feed::FeedClient;
pub use source::{FeedSource, Source};
