//! Infrastructure layer: storage backends, data mappers and caches behind the core ports.

pub mod cache;
pub mod database;
pub mod mapper;


pub use cache::{Cache, CachedDataMapper, InMemoryCache};
pub use database::{CommitRecord, InMemoryDatabase};
pub use mapper::InMemoryDataMapper;
