//! Typed repository facade over a data mapper and a unit of work.
//!
//! Reads go through the identity map first, so repeated loads of the same row hand out
//! the same [`Handle`]. Writes are only scheduled; they hit storage on the next commit.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::data_mapper::DataMapper;
use crate::entity::{Entity, Handle};
use crate::error::OrmResult;
use crate::id::EntityId;
use crate::unit_of_work::UnitOfWork;

pub struct Repository<T, M> {
    mapper: Arc<M>,
    _entity: PhantomData<fn() -> T>,
}

impl<T, M> Repository<T, M>
where
    T: Entity,
    M: DataMapper<T>,
{
    pub fn new(mapper: Arc<M>) -> Self {
        Self {
            mapper,
            _entity: PhantomData,
        }
    }

    pub fn mapper(&self) -> &Arc<M> {
        &self.mapper
    }

    pub fn add(&self, uow: &mut UnitOfWork, entity: &Handle<T>) {
        uow.schedule_for_insertion(entity);
    }

    pub fn delete(&self, uow: &mut UnitOfWork, entity: &Handle<T>) {
        uow.schedule_for_deletion(entity);
    }

    /// Canonical instance for `id`, loading and registering it on an identity-map miss.
    pub fn get_by_id(&self, uow: &mut UnitOfWork, id: &EntityId) -> OrmResult<Option<Handle<T>>> {
        if let Some(mapped) = uow.entity_registry().get_entity::<T>(id) {
            return Ok(Some(mapped));
        }

        let Some(loaded) = (*self.mapper).get_by_id(id)? else {
            return Ok(None);
        };
        let handle = uow.entity_registry_mut().register_entity(&Handle::new(loaded))?;
        Ok(Some(handle))
    }

    /// Every stored entity, each resolved through the identity map.
    ///
    /// Rows whose id is already mapped come back as the mapped instance, including any
    /// uncommitted changes made to it.
    pub fn get_all(&self, uow: &mut UnitOfWork) -> OrmResult<Vec<Handle<T>>> {
        let registry = uow.entity_registry_mut();
        (*self.mapper)
            .get_all()?
            .into_iter()
            .map(|loaded| registry.register_entity(&Handle::new(loaded)))
            .collect()
    }
}

impl<T, M> Clone for Repository<T, M> {
    fn clone(&self) -> Self {
        Self {
            mapper: self.mapper.clone(),
            _entity: PhantomData,
        }
    }
}
