//! Entities and the handles the unit of work tracks them through.
//!
//! An entity is any domain value with a persistent identity. The identifier itself is
//! *not* part of the [`Entity`] trait: it is read and written through the accessor
//! registered in [`IdAccessorRegistry`](crate::identity::IdAccessorRegistry), so domain
//! types don't have to agree on an id field or method.
//!
//! ## Handles
//!
//! In-memory instances are shared between the caller and the unit of work through a
//! [`Handle<T>`]: a reference-counted, lockable cell with a process-unique [`ObjectId`].
//! Clones of a handle are the *same* object (same `ObjectId`); two handles created from
//! equal values are *different* objects. Every side table (lifecycle state, change
//! baseline, pending schedules, aggregate callbacks) is keyed by `ObjectId`, never by the
//! persistent id, which may not exist yet.
//!
//! [`AnyHandle`] is the type-erased form used for heterogeneous collections.

use std::any::Any;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Serialize, Serializer};
use serde_json::Value as JsonValue;

use crate::id::ObjectId;

/// Entity marker + minimal interface.
///
/// `Serialize` drives structural change detection: the serialized field map taken at
/// registration is the baseline compared against on commit.
pub trait Entity: Clone + Serialize + Send + Sync + 'static {
    /// Stable type name used to key the identity map, accessors and data mappers.
    const TYPE_NAME: &'static str;
}

struct Slot<T> {
    object_id: ObjectId,
    value: RwLock<T>,
}

/// Shared handle to one in-memory entity instance.
pub struct Handle<T>(Arc<Slot<T>>);

impl<T> Handle<T> {
    pub fn new(value: T) -> Self {
        Self(Arc::new(Slot {
            object_id: ObjectId::next(),
            value: RwLock::new(value),
        }))
    }

    pub fn object_id(&self) -> ObjectId {
        self.0.object_id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.0.value.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.0.value.write()
    }

    /// `true` if both handles refer to the same object.
    pub fn ptr_eq(&self, other: &Handle<T>) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<T: Clone> Handle<T> {
    /// Copy of the current value.
    pub fn get(&self) -> T {
        self.read().clone()
    }
}

impl<T: Entity> Handle<T> {
    /// Type-erased view of this handle (same object).
    pub fn erase(&self) -> AnyHandle {
        let slot: Arc<dyn ErasedSlot> = self.0.clone();
        AnyHandle(slot)
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let value = self.0.value.try_read();
        f.debug_struct("Handle")
            .field("object_id", &self.0.object_id)
            .field("value", &value.as_deref())
            .finish()
    }
}

/// A handle stored in an entity field serializes as the object it points to, so
/// structural change detection compares such fields by reference.
impl<T> Serialize for Handle<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.object_id.serialize(serializer)
    }
}

/// Baseline copy of an entity, captured when tracking starts.
pub(crate) struct Snapshot {
    /// Typed clone, handed to per-type comparators.
    pub(crate) value: Box<dyn Any + Send + Sync>,
    /// Serialized field map used for structural comparison.
    pub(crate) fields: JsonValue,
}

pub(crate) trait ErasedSlot: Send + Sync {
    fn object_id(&self) -> ObjectId;
    fn type_name(&self) -> &'static str;
    fn capture(&self) -> Result<Snapshot, serde_json::Error>;
    fn fields(&self) -> Result<JsonValue, serde_json::Error>;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Entity> ErasedSlot for Slot<T> {
    fn object_id(&self) -> ObjectId {
        self.object_id
    }

    fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }

    fn capture(&self) -> Result<Snapshot, serde_json::Error> {
        let value = self.value.read().clone();
        let fields = serde_json::to_value(&value)?;
        Ok(Snapshot {
            value: Box::new(value),
            fields,
        })
    }

    fn fields(&self) -> Result<JsonValue, serde_json::Error> {
        serde_json::to_value(&*self.value.read())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Type-erased entity handle.
#[derive(Clone)]
pub struct AnyHandle(Arc<dyn ErasedSlot>);

impl AnyHandle {
    pub fn object_id(&self) -> ObjectId {
        self.0.object_id()
    }

    pub fn type_name(&self) -> &'static str {
        self.0.type_name()
    }

    /// Recover the typed handle; `None` if this handle holds a different type.
    pub fn downcast<T: Entity>(&self) -> Option<Handle<T>> {
        self.0.clone().into_any().downcast::<Slot<T>>().ok().map(Handle)
    }

    pub fn is<T: Entity>(&self) -> bool {
        self.downcast::<T>().is_some()
    }

    pub(crate) fn capture(&self) -> Result<Snapshot, serde_json::Error> {
        self.0.capture()
    }

    pub(crate) fn fields(&self) -> Result<JsonValue, serde_json::Error> {
        self.0.fields()
    }
}

impl core::fmt::Debug for AnyHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AnyHandle")
            .field("type_name", &self.type_name())
            .field("object_id", &self.object_id())
            .finish()
    }
}

/// Anything that refers to a tracked entity instance.
///
/// Registry and unit-of-work operations accept both typed and erased handles.
pub trait EntityRef {
    fn object_id(&self) -> ObjectId;
    fn type_name(&self) -> &'static str;
    fn to_any(&self) -> AnyHandle;
}

impl<T: Entity> EntityRef for Handle<T> {
    fn object_id(&self) -> ObjectId {
        Handle::object_id(self)
    }

    fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }

    fn to_any(&self) -> AnyHandle {
        self.erase()
    }
}

impl EntityRef for AnyHandle {
    fn object_id(&self) -> ObjectId {
        AnyHandle::object_id(self)
    }

    fn type_name(&self) -> &'static str {
        AnyHandle::type_name(self)
    }

    fn to_any(&self) -> AnyHandle {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Debug, Clone, PartialEq, Serialize)]
    struct Note {
        id: i64,
        body: String,
    }

    impl Entity for Note {
        const TYPE_NAME: &'static str = "note";
    }

    #[derive(Debug, Clone, Serialize)]
    struct Tag {
        label: String,
    }

    impl Entity for Tag {
        const TYPE_NAME: &'static str = "tag";
    }

    #[test]
    fn clones_share_identity_and_state() {
        let a = Handle::new(Note { id: 1, body: "a".into() });
        let b = a.clone();
        b.write().body = "b".into();

        assert!(a.ptr_eq(&b));
        assert_eq!(a.object_id(), b.object_id());
        assert_eq!(a.read().body, "b");
    }

    #[test]
    fn equal_values_are_distinct_objects() {
        let a = Handle::new(Note { id: 1, body: "a".into() });
        let b = Handle::new(Note { id: 1, body: "a".into() });
        assert!(!a.ptr_eq(&b));
        assert_ne!(a.object_id(), b.object_id());
    }

    #[test]
    fn erased_handle_downcasts_to_its_own_type_only() {
        let note = Handle::new(Note { id: 1, body: "a".into() });
        let any = note.erase();

        assert_eq!(any.type_name(), "note");
        assert_eq!(any.object_id(), note.object_id());
        assert!(any.downcast::<Note>().unwrap().ptr_eq(&note));
        assert!(any.downcast::<Tag>().is_none());
    }

    #[test]
    fn snapshot_is_independent_of_live_value() {
        let note = Handle::new(Note { id: 1, body: "before".into() });
        let snapshot = note.erase().capture().unwrap();
        note.write().body = "after".into();

        let baseline = snapshot.value.downcast_ref::<Note>().unwrap();
        assert_eq!(baseline.body, "before");
        assert_eq!(snapshot.fields["body"], "before");
    }

    #[test]
    fn handle_fields_serialize_as_object_identity() {
        #[derive(Clone, Serialize)]
        struct Holder {
            target: Handle<Tag>,
        }

        let tag = Handle::new(Tag { label: "x".into() });
        let holder = Holder { target: tag.clone() };
        let value = serde_json::to_value(&holder).unwrap();
        assert_eq!(value["target"], tag.object_id().as_u64());
    }
}
