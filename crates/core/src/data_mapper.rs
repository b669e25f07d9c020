//! Data mapper boundary: per-entity-type persistence adapters.
//!
//! The unit of work never talks to storage directly. For each entity type it is given
//! a [`DataMapper`] that knows how to write and read that type; the unit of work only
//! decides *when* and in *which order* mappers are called.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::entity::{AnyHandle, Entity, Handle};
use crate::error::{OrmError, OrmResult, StorageError};
use crate::id::EntityId;
use crate::id_generator::IdGenerator;
use crate::identity::IdAccessorRegistry;

/// Persistence adapter for one entity type.
///
/// ## Hooks
///
/// - `after_commit` runs once the surrounding transaction is durable. Mappers that keep a
///   secondary cache apply their staged cache writes here, so the cache never gets ahead
///   of the source of truth.
/// - `after_rollback` runs after an aborted commit was rolled back; staged side effects
///   should be discarded.
pub trait DataMapper<T>: Send + Sync {
    fn add(&self, entity: &T) -> Result<(), StorageError>;

    fn update(&self, entity: &T) -> Result<(), StorageError>;

    fn delete(&self, entity: &T) -> Result<(), StorageError>;

    fn get_by_id(&self, id: &EntityId) -> Result<Option<T>, StorageError>;

    fn get_all(&self) -> Result<Vec<T>, StorageError>;

    /// How ids of new entities are produced; `None` if the entity brings its own.
    fn id_generator(&self) -> Option<&dyn IdGenerator<T>> {
        None
    }

    fn after_commit(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn after_rollback(&self) {}
}

impl<T, M> DataMapper<T> for Arc<M>
where
    M: DataMapper<T> + ?Sized,
{
    fn add(&self, entity: &T) -> Result<(), StorageError> {
        (**self).add(entity)
    }

    fn update(&self, entity: &T) -> Result<(), StorageError> {
        (**self).update(entity)
    }

    fn delete(&self, entity: &T) -> Result<(), StorageError> {
        (**self).delete(entity)
    }

    fn get_by_id(&self, id: &EntityId) -> Result<Option<T>, StorageError> {
        (**self).get_by_id(id)
    }

    fn get_all(&self) -> Result<Vec<T>, StorageError> {
        (**self).get_all()
    }

    fn id_generator(&self) -> Option<&dyn IdGenerator<T>> {
        (**self).id_generator()
    }

    fn after_commit(&self) -> Result<(), StorageError> {
        (**self).after_commit()
    }

    fn after_rollback(&self) {
        (**self).after_rollback()
    }
}

/// Object-safe view of a typed mapper, driven by the unit of work over erased handles.
pub(crate) trait ErasedDataMapper: Send + Sync {
    /// Write a new entity, assigning its generated id before or after the write.
    fn add(&self, entity: &AnyHandle, accessors: &IdAccessorRegistry) -> OrmResult<()>;

    fn update(&self, entity: &AnyHandle) -> OrmResult<()>;

    fn delete(&self, entity: &AnyHandle) -> OrmResult<()>;

    /// Empty id to restore after a rollback, if the mapper generates ids.
    fn empty_id(&self, entity: &AnyHandle) -> Option<EntityId>;

    fn after_commit(&self) -> Result<(), StorageError>;

    fn after_rollback(&self);
}

pub(crate) struct MapperAdapter<T, M> {
    mapper: M,
    _entity: PhantomData<fn() -> T>,
}

impl<T, M> MapperAdapter<T, M> {
    pub(crate) fn new(mapper: M) -> Self {
        Self {
            mapper,
            _entity: PhantomData,
        }
    }
}

impl<T, M> MapperAdapter<T, M>
where
    T: Entity,
{
    fn typed(&self, entity: &AnyHandle) -> OrmResult<Handle<T>> {
        entity
            .downcast::<T>()
            .ok_or_else(|| OrmError::TypeMismatch(entity.type_name().to_string()))
    }
}

impl<T, M> ErasedDataMapper for MapperAdapter<T, M>
where
    T: Entity,
    M: DataMapper<T>,
{
    fn add(&self, entity: &AnyHandle, accessors: &IdAccessorRegistry) -> OrmResult<()> {
        let handle = self.typed(entity)?;
        let Some(generator) = self.mapper.id_generator() else {
            self.mapper.add(&handle.read())?;
            return Ok(());
        };

        if !generator.is_post_insert() {
            let id = generator.generate(&handle.read())?;
            accessors.set_entity_id(entity, id)?;
        }

        self.mapper.add(&handle.read())?;

        if generator.is_post_insert() {
            let id = generator.generate(&handle.read())?;
            accessors.set_entity_id(entity, id)?;
        }

        tracing::trace!(
            entity_type = entity.type_name(),
            id = %accessors.entity_id(entity).unwrap_or_default(),
            "entity added"
        );
        Ok(())
    }

    fn update(&self, entity: &AnyHandle) -> OrmResult<()> {
        let handle = self.typed(entity)?;
        self.mapper.update(&handle.read())?;
        Ok(())
    }

    fn delete(&self, entity: &AnyHandle) -> OrmResult<()> {
        let handle = self.typed(entity)?;
        self.mapper.delete(&handle.read())?;
        Ok(())
    }

    fn empty_id(&self, entity: &AnyHandle) -> Option<EntityId> {
        let generator = self.mapper.id_generator()?;
        let handle = entity.downcast::<T>()?;
        let value = handle.read();
        Some(generator.empty_value(&*value))
    }

    fn after_commit(&self) -> Result<(), StorageError> {
        self.mapper.after_commit()
    }

    fn after_rollback(&self) {
        self.mapper.after_rollback()
    }
}
