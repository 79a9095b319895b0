//! # search-types
//!
//! Shared domain types for the feed-indexing search system.
//!
//! This crate defines the structures that flow between the source pollers,
//! the write engine and the index lifecycle:
//! - [`DocumentEnvelope`]: a full document plus its write metadata
//! - [`DocMeta`]: id / doc_type / external version for one document
//! - [`FeedRef`]: a lightweight reference yielded by a paginated feed
//! - [`Settings`]: layered daemon configuration

pub mod config;
pub mod document;
pub mod error;

pub use config::{
    EngineSettings, FeedSettings, IndexSettings, NoindexRule, Settings,
};
pub use document::{long_version, parse_feed_date, DocMeta, DocumentEnvelope, FeedRef};
pub use error::TypesError;
