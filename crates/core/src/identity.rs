//! Identity accessors: how the unit of work reads and writes entity ids.
//!
//! Entity types register a getter (and, if the unit of work should assign generated
//! ids, a setter) once per type. Nothing else about the entity's shape is assumed.

use std::collections::HashMap;

use crate::entity::{AnyHandle, Entity, EntityRef};
use crate::error::{OrmError, OrmResult};
use crate::id::EntityId;

type Getter<T> = Box<dyn Fn(&T) -> EntityId + Send + Sync>;
type Setter<T> = Box<dyn Fn(&mut T, EntityId) + Send + Sync>;

struct TypedAccessor<T> {
    getter: Getter<T>,
    setter: Option<Setter<T>>,
}

trait ErasedIdAccessor: Send + Sync {
    fn get(&self, entity: &AnyHandle) -> Option<EntityId>;
    fn set(&self, entity: &AnyHandle, id: EntityId) -> bool;
    fn has_setter(&self) -> bool;
}

impl<T: Entity> ErasedIdAccessor for TypedAccessor<T> {
    fn get(&self, entity: &AnyHandle) -> Option<EntityId> {
        let handle = entity.downcast::<T>()?;
        let value = handle.read();
        Some((self.getter)(&*value))
    }

    fn set(&self, entity: &AnyHandle, id: EntityId) -> bool {
        let (Some(setter), Some(handle)) = (&self.setter, entity.downcast::<T>()) else {
            return false;
        };
        let mut value = handle.write();
        setter(&mut *value, id);
        true
    }

    fn has_setter(&self) -> bool {
        self.setter.is_some()
    }
}

/// Lookup table of id getters/setters keyed by entity type name.
#[derive(Default)]
pub struct IdAccessorRegistry {
    accessors: HashMap<&'static str, Box<dyn ErasedIdAccessor>>,
}

impl IdAccessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the id getter and setter for `T`, replacing any previous pair.
    pub fn register_accessors<T: Entity>(
        &mut self,
        getter: impl Fn(&T) -> EntityId + Send + Sync + 'static,
        setter: impl Fn(&mut T, EntityId) + Send + Sync + 'static,
    ) {
        self.accessors.insert(
            T::TYPE_NAME,
            Box::new(TypedAccessor::<T> {
                getter: Box::new(getter),
                setter: Some(Box::new(setter)),
            }),
        );
    }

    /// Register a read-only accessor (ids are never assigned by the unit of work).
    pub fn register_getter<T: Entity>(
        &mut self,
        getter: impl Fn(&T) -> EntityId + Send + Sync + 'static,
    ) {
        self.accessors.insert(
            T::TYPE_NAME,
            Box::new(TypedAccessor::<T> {
                getter: Box::new(getter),
                setter: None,
            }),
        );
    }

    pub fn has_accessor(&self, type_name: &str) -> bool {
        self.accessors.contains_key(type_name)
    }

    pub fn has_setter(&self, type_name: &str) -> bool {
        self.accessors
            .get(type_name)
            .is_some_and(|accessor| accessor.has_setter())
    }

    /// Read the persistent id of `entity`.
    pub fn entity_id(&self, entity: &impl EntityRef) -> OrmResult<EntityId> {
        let type_name = entity.type_name();
        self.accessors
            .get(type_name)
            .and_then(|accessor| accessor.get(&entity.to_any()))
            .ok_or_else(|| OrmError::NoIdAccessor(type_name.to_string()))
    }

    /// Overwrite the persistent id of `entity`.
    pub fn set_entity_id(&self, entity: &impl EntityRef, id: EntityId) -> OrmResult<()> {
        let type_name = entity.type_name();
        let written = self
            .accessors
            .get(type_name)
            .is_some_and(|accessor| accessor.set(&entity.to_any(), id));
        if written {
            Ok(())
        } else {
            Err(OrmError::NoIdAccessor(type_name.to_string()))
        }
    }
}

impl core::fmt::Debug for IdAccessorRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut types: Vec<_> = self.accessors.keys().collect();
        types.sort();
        f.debug_struct("IdAccessorRegistry")
            .field("types", &types)
            .finish()
    }
}
