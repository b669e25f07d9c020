//! Secondary entity cache kept in step with committed storage.
//!
//! [`CachedDataMapper`] wraps a source mapper. Its writes go to the source immediately
//! (inside the unit of work's transaction) but only reach the cache from the
//! `after_commit` hook, so a rolled-back commit never leaves stale entries behind.

pub mod cached_mapper;
pub mod in_memory;
pub mod r#trait;

pub use cached_mapper::CachedDataMapper;
pub use in_memory::InMemoryCache;
pub use r#trait::Cache;
