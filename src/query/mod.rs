//! Query service: read-only access to cached messages
//!
//! Search, retrieval, listings, statistics and audit lookups. All calls run
//! on the blocking pool and never write.

mod service;

pub use service::{QueryError, QueryService, SearchRequest};
