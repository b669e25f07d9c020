//! Transactional storage backend.
//!
//! The in-memory database stands in for a relational store behind the core
//! [`Connection`](forgeorm_core::Connection) port: named tables of JSON rows, an
//! autoincrement sequence per table and single-level transactions.

pub mod in_memory;

pub use in_memory::{CommitRecord, InMemoryDatabase};
