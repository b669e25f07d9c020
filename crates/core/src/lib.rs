//! `forgeorm-core`: unit of work, identity map and change tracking.
//!
//! This crate contains the persistence-agnostic engine. Storage is reached only through
//! the [`DataMapper`], [`Connection`] and [`IdGenerator`] ports; `forgeorm-infra` provides
//! in-memory implementations of them.

pub mod change_tracker;
pub mod config;
pub mod connection;
pub mod data_mapper;
pub mod entity;
pub mod error;
pub mod id;
pub mod id_generator;
pub mod identity;
pub mod registry;
pub mod repository;
pub mod unit_of_work;

pub use change_tracker::ChangeTracker;
pub use config::UnitOfWorkConfig;
pub use connection::Connection;
pub use data_mapper::DataMapper;
pub use entity::{AnyHandle, Entity, EntityRef, Handle};
pub use error::{OrmError, OrmResult, StorageError};
pub use id::{EntityId, ObjectId};
pub use id_generator::{IdGenerator, SequenceIdGenerator, UuidIdGenerator};
pub use identity::IdAccessorRegistry;
pub use registry::{EntityRegistry, EntityState};
pub use repository::Repository;
pub use unit_of_work::UnitOfWork;
