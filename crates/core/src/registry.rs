//! Entity registry: the identity map and per-instance lifecycle bookkeeping.
//!
//! The registry guarantees that at most one in-memory instance per `(type, id)` is handed
//! out. Registering a second instance for an id that is already mapped does not replace
//! the mapped one; the caller receives the canonical instance back and is expected to
//! continue with it (`let user = registry.register_entity(&user)?;`).
//!
//! ## Lifecycle
//!
//! ```text
//! NeverRegistered ──schedule_for_insertion──▶ Queued ──insert committed──▶ Registered
//! NeverRegistered ──register_entity──▶ Registered ──deregister_entity──▶ Unregistered
//! Registered ──delete committed──▶ Dequeued
//! ```
//!
//! States are keyed by object identity, never by persistent id.
//!
//! ## Aggregate-root callbacks
//!
//! A child entity whose foreign key depends on an aggregate root's generated id registers
//! a callback `(root, child, fn)`. All callbacks for a child run in registration order
//! right before the child is written, so the root's id (assigned earlier in the same
//! commit) is copied into the child first. A child may hang off several roots.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::change_tracker::ChangeTracker;
use crate::entity::{AnyHandle, Entity, EntityRef, Handle};
use crate::error::{OrmError, OrmResult};
use crate::id::{EntityId, ObjectId};
use crate::identity::IdAccessorRegistry;

/// Lifecycle state of one entity instance.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityState {
    /// Never seen by this registry.
    NeverRegistered,
    /// Identity-mapped with a change baseline.
    Registered,
    /// Scheduled for insertion; not mapped by id yet.
    Queued,
    /// Deleted by a committed unit of work.
    Dequeued,
    /// Explicitly detached.
    Unregistered,
}

type Propagate = Box<dyn Fn(&AnyHandle, &AnyHandle) + Send + Sync>;

struct AggregateRootCallback {
    root: AnyHandle,
    child: AnyHandle,
    propagate: Propagate,
}

#[derive(Default)]
struct TypeBucket {
    order: Vec<EntityId>,
    entities: HashMap<EntityId, AnyHandle>,
}

/// `(type name, id) -> instance`, iterated in insertion order.
#[derive(Default)]
struct IdentityMap {
    type_order: Vec<&'static str>,
    buckets: HashMap<&'static str, TypeBucket>,
}

impl IdentityMap {
    fn get(&self, type_name: &str, id: &EntityId) -> Option<&AnyHandle> {
        self.buckets.get(type_name)?.entities.get(id)
    }

    fn insert(&mut self, type_name: &'static str, id: EntityId, entity: AnyHandle) {
        let bucket = self.buckets.entry(type_name).or_insert_with(|| {
            self.type_order.push(type_name);
            TypeBucket::default()
        });
        if bucket.entities.insert(id.clone(), entity).is_none() {
            bucket.order.push(id);
        }
    }

    fn remove(&mut self, type_name: &str, id: &EntityId) -> Option<AnyHandle> {
        let bucket = self.buckets.get_mut(type_name)?;
        let removed = bucket.entities.remove(id)?;
        bucket.order.retain(|existing| existing != id);
        Some(removed)
    }

    fn iter(&self) -> impl Iterator<Item = &AnyHandle> + '_ {
        self.type_order.iter().flat_map(move |type_name| {
            let bucket = &self.buckets[type_name];
            bucket.order.iter().map(move |id| &bucket.entities[id])
        })
    }

    fn of_type(&self, type_name: &str) -> impl Iterator<Item = &AnyHandle> + '_ {
        self.buckets
            .get(type_name)
            .into_iter()
            .flat_map(|bucket| bucket.order.iter().map(move |id| &bucket.entities[id]))
    }

    fn len(&self) -> usize {
        self.buckets.values().map(|b| b.entities.len()).sum()
    }

    fn clear(&mut self) {
        self.type_order.clear();
        self.buckets.clear();
    }
}

/// Identity map + lifecycle states + change baselines + aggregate-root callbacks.
#[derive(Default)]
pub struct EntityRegistry {
    id_accessors: IdAccessorRegistry,
    change_tracker: ChangeTracker,
    identity_map: IdentityMap,
    states: HashMap<ObjectId, EntityState>,
    aggregate_roots: HashMap<ObjectId, Vec<AggregateRootCallback>>,
}

impl EntityRegistry {
    pub fn new(id_accessors: IdAccessorRegistry, change_tracker: ChangeTracker) -> Self {
        Self {
            id_accessors,
            change_tracker,
            ..Self::default()
        }
    }

    pub fn id_accessors(&self) -> &IdAccessorRegistry {
        &self.id_accessors
    }

    pub fn id_accessors_mut(&mut self) -> &mut IdAccessorRegistry {
        &mut self.id_accessors
    }

    pub fn change_tracker(&self) -> &ChangeTracker {
        &self.change_tracker
    }

    pub fn change_tracker_mut(&mut self) -> &mut ChangeTracker {
        &mut self.change_tracker
    }

    /// Persistent id of `entity` through its registered accessor.
    pub fn entity_id(&self, entity: &impl EntityRef) -> OrmResult<EntityId> {
        self.id_accessors.entity_id(entity)
    }

    /// Register `entity` and return the canonical instance for its `(type, id)`.
    ///
    /// If another instance is already mapped under the same id, that instance is
    /// returned and nothing else happens. Otherwise tracking starts, the entity is
    /// identity-mapped and its state becomes `Registered`.
    pub fn register_entity<T: Entity>(&mut self, entity: &Handle<T>) -> OrmResult<Handle<T>> {
        let canonical = self.register_any(entity)?;
        canonical
            .downcast::<T>()
            .ok_or_else(|| OrmError::TypeMismatch(T::TYPE_NAME.to_string()))
    }

    /// Type-erased form of [`register_entity`](Self::register_entity).
    pub fn register_any(&mut self, entity: &impl EntityRef) -> OrmResult<AnyHandle> {
        let type_name = entity.type_name();
        let id = self.id_accessors.entity_id(entity)?;

        if let Some(existing) = self.identity_map.get(type_name, &id) {
            return Ok(existing.clone());
        }

        self.change_tracker.start_tracking(entity)?;
        let handle = entity.to_any();
        self.identity_map.insert(type_name, id, handle.clone());
        self.states.insert(entity.object_id(), EntityState::Registered);
        tracing::trace!(entity_type = type_name, object = %entity.object_id(), "entity registered");
        Ok(handle)
    }

    /// Stop managing `entity`.
    ///
    /// Only acts on `Queued` or `Registered` instances; anything else is a silent
    /// no-op. The identity-map slot is only freed if it holds this very instance.
    pub fn deregister_entity(&mut self, entity: &impl EntityRef) -> OrmResult<()> {
        let state = self.entity_state(entity);
        if !matches!(state, EntityState::Queued | EntityState::Registered) {
            return Ok(());
        }

        let id = self.id_accessors.entity_id(entity)?;
        self.remove_aggregate_root_callbacks(entity);
        self.evict(entity, &id);
        self.states
            .insert(entity.object_id(), EntityState::Unregistered);
        self.change_tracker.stop_tracking(entity);
        Ok(())
    }

    pub fn get_entity<T: Entity>(&self, id: &EntityId) -> Option<Handle<T>> {
        self.identity_map
            .get(T::TYPE_NAME, id)
            .and_then(|entity| entity.downcast::<T>())
    }

    pub fn get_entity_by_name(&self, type_name: &str, id: &EntityId) -> Option<AnyHandle> {
        self.identity_map.get(type_name, id).cloned()
    }

    /// Every identity-mapped entity: types in first-registration order, entities in
    /// insertion order within a type.
    pub fn entities(&self) -> Vec<AnyHandle> {
        self.identity_map.iter().cloned().collect()
    }

    pub fn entities_of<T: Entity>(&self) -> Vec<Handle<T>> {
        self.identity_map
            .of_type(T::TYPE_NAME)
            .filter_map(|entity| entity.downcast::<T>())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.identity_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `true` if `entity` is `Registered` or its `(type, id)` is already mapped.
    ///
    /// A type without an id accessor is reported as not registered rather than
    /// failing the caller.
    pub fn is_registered(&self, entity: &impl EntityRef) -> bool {
        if self.entity_state(entity) == EntityState::Registered {
            return true;
        }
        match self.id_accessors.entity_id(entity) {
            Ok(id) => self.identity_map.get(entity.type_name(), &id).is_some(),
            Err(_) => false,
        }
    }

    pub fn entity_state(&self, entity: &impl EntityRef) -> EntityState {
        self.states
            .get(&entity.object_id())
            .copied()
            .unwrap_or(EntityState::NeverRegistered)
    }

    pub fn set_state(&mut self, entity: &impl EntityRef, state: EntityState) {
        self.states.insert(entity.object_id(), state);
    }

    /// Register `propagate(root, child)` to run right before `child` is persisted.
    pub fn register_aggregate_root_callback<R, C>(
        &mut self,
        root: &Handle<R>,
        child: &Handle<C>,
        propagate: impl Fn(&R, &mut C) + Send + Sync + 'static,
    ) where
        R: Entity,
        C: Entity,
    {
        let callback: Propagate = Box::new(move |root: &AnyHandle, child: &AnyHandle| {
            if root.object_id() == child.object_id() {
                tracing::warn!(
                    entity_type = root.type_name(),
                    "aggregate root callback targets its own root; skipped"
                );
                return;
            }
            let (Some(root), Some(child)) = (root.downcast::<R>(), child.downcast::<C>()) else {
                return;
            };
            let root = root.read();
            let mut child = child.write();
            propagate(&*root, &mut *child);
        });

        self.aggregate_roots
            .entry(child.object_id())
            .or_default()
            .push(AggregateRootCallback {
                root: root.erase(),
                child: child.erase(),
                propagate: callback,
            });
    }

    /// Run every callback registered for `child`, in registration order.
    pub fn run_aggregate_root_callbacks(&self, child: &impl EntityRef) {
        let Some(callbacks) = self.aggregate_roots.get(&child.object_id()) else {
            return;
        };
        for callback in callbacks {
            (callback.propagate)(&callback.root, &callback.child);
        }
    }

    pub fn has_aggregate_root_callbacks(&self, child: &impl EntityRef) -> bool {
        self.aggregate_roots
            .get(&child.object_id())
            .is_some_and(|callbacks| !callbacks.is_empty())
    }

    /// Drop every callback keyed to `child`.
    pub fn remove_aggregate_root_callbacks(&mut self, child: &impl EntityRef) {
        self.aggregate_roots.remove(&child.object_id());
    }

    pub fn clear_aggregate_roots(&mut self) {
        self.aggregate_roots.clear();
    }

    /// Drop every tracked entity, state and callback.
    pub fn clear(&mut self) {
        self.change_tracker.stop_tracking_all();
        self.identity_map.clear();
        self.states.clear();
        self.clear_aggregate_roots();
    }

    /// Undo the registration an aborted insert performed: free the identity-map slot
    /// (if it holds this instance), drop the baseline and put it back in `Queued`.
    pub(crate) fn unwind_insertion(&mut self, entity: &AnyHandle) {
        if let Ok(id) = self.id_accessors.entity_id(entity) {
            self.evict(entity, &id);
        }
        self.change_tracker.stop_tracking(entity);
        self.states.insert(entity.object_id(), EntityState::Queued);
    }

    fn evict(&mut self, entity: &impl EntityRef, id: &EntityId) {
        let mapped_here = self
            .identity_map
            .get(entity.type_name(), id)
            .is_some_and(|mapped| mapped.object_id() == entity.object_id());
        if mapped_here {
            self.identity_map.remove(entity.type_name(), id);
        }
    }
}

impl core::fmt::Debug for EntityRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EntityRegistry")
            .field("entities", &self.identity_map.len())
            .field("states", &self.states.len())
            .field("aggregate_roots", &self.aggregate_roots.len())
            .field("id_accessors", &self.id_accessors)
            .field("change_tracker", &self.change_tracker)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Debug, Clone, PartialEq, Serialize)]
    struct User {
        id: i64,
        name: String,
    }

    impl Entity for User {
        const TYPE_NAME: &'static str = "user";
    }

    #[derive(Debug, Clone, PartialEq, Serialize)]
    struct Post {
        id: i64,
        user_id: i64,
        editor_id: i64,
    }

    impl Entity for Post {
        const TYPE_NAME: &'static str = "post";
    }

    #[derive(Debug, Clone, Serialize)]
    struct Anonymous;

    impl Entity for Anonymous {
        const TYPE_NAME: &'static str = "anonymous";
    }

    fn registry() -> EntityRegistry {
        let mut accessors = IdAccessorRegistry::new();
        accessors.register_accessors::<User>(
            |u| EntityId::Int(u.id),
            |u, id| u.id = id.as_int().unwrap_or_default(),
        );
        accessors.register_accessors::<Post>(
            |p| EntityId::Int(p.id),
            |p, id| p.id = id.as_int().unwrap_or_default(),
        );
        EntityRegistry::new(accessors, ChangeTracker::new())
    }

    fn user(id: i64, name: &str) -> Handle<User> {
        Handle::new(User {
            id,
            name: name.into(),
        })
    }

    #[test]
    fn register_maps_tracks_and_marks_registered() {
        let mut registry = registry();
        let u = user(1, "foo");

        let canonical = registry.register_entity(&u).unwrap();

        assert!(canonical.ptr_eq(&u));
        assert_eq!(registry.entity_state(&u), EntityState::Registered);
        assert!(registry.is_registered(&u));
        assert!(registry.change_tracker().is_tracking(&u));
        assert!(registry.get_entity::<User>(&EntityId::Int(1)).unwrap().ptr_eq(&u));
        assert!(registry.get_entity_by_name("user", &EntityId::Int(1)).is_some());
    }

    #[test]
    fn second_instance_with_same_id_resolves_to_the_canonical_one() {
        let mut registry = registry();
        let first = user(1, "foo");
        let second = user(1, "foo");

        let first = registry.register_entity(&first).unwrap();
        let second = registry.register_entity(&second).unwrap();

        assert!(first.ptr_eq(&second));
        assert_eq!(registry.entities().len(), 1);
    }

    #[test]
    fn reconciled_duplicate_is_not_tracked_itself() {
        let mut registry = registry();
        let first = user(1, "foo");
        let duplicate = user(1, "foo");
        registry.register_entity(&first).unwrap();
        registry.register_entity(&duplicate).unwrap();

        assert_eq!(registry.entity_state(&duplicate), EntityState::NeverRegistered);
        assert!(!registry.change_tracker().is_tracking(&duplicate));
        // Same (type, id) is mapped, so it still reports as registered.
        assert!(registry.is_registered(&duplicate));
    }

    #[test]
    fn entities_are_listed_in_registration_order() {
        let mut registry = registry();
        let a = user(1, "a");
        let p = Handle::new(Post { id: 10, user_id: 1, editor_id: 0 });
        let b = user(2, "b");
        registry.register_entity(&a).unwrap();
        registry.register_entity(&p).unwrap();
        registry.register_entity(&b).unwrap();

        let ids: Vec<_> = registry.entities().iter().map(|e| e.object_id()).collect();
        assert_eq!(ids, vec![a.object_id(), b.object_id(), p.object_id()]);

        let users = registry.entities_of::<User>();
        assert_eq!(users.len(), 2);
        assert!(users[0].ptr_eq(&a));
    }

    #[test]
    fn deregister_unmaps_and_stops_tracking() {
        let mut registry = registry();
        let u = user(1, "foo");
        registry.register_entity(&u).unwrap();

        registry.deregister_entity(&u).unwrap();

        assert_eq!(registry.entity_state(&u), EntityState::Unregistered);
        assert!(!registry.is_registered(&u));
        assert!(registry.get_entity::<User>(&EntityId::Int(1)).is_none());
        assert!(!registry.change_tracker().is_tracking(&u));
    }

    #[test]
    fn deregister_is_a_no_op_for_unmanaged_entities() {
        let mut registry = registry();
        let u = user(1, "foo");
        registry.deregister_entity(&u).unwrap();
        assert_eq!(registry.entity_state(&u), EntityState::NeverRegistered);

        registry.register_entity(&u).unwrap();
        registry.deregister_entity(&u).unwrap();
        registry.deregister_entity(&u).unwrap();
        assert_eq!(registry.entity_state(&u), EntityState::Unregistered);

        // No accessor, but nothing to do either.
        registry.deregister_entity(&Handle::new(Anonymous)).unwrap();
    }

    #[test]
    fn deregistering_a_duplicate_keeps_the_canonical_mapping() {
        let mut registry = registry();
        let canonical = user(1, "foo");
        let duplicate = user(1, "foo");
        registry.register_entity(&canonical).unwrap();
        registry.set_state(&duplicate, EntityState::Queued);

        registry.deregister_entity(&duplicate).unwrap();

        assert!(registry.get_entity::<User>(&EntityId::Int(1)).unwrap().ptr_eq(&canonical));
    }

    #[test]
    fn is_registered_swallows_missing_accessor() {
        let registry = registry();
        assert!(!registry.is_registered(&Handle::new(Anonymous)));
    }

    #[test]
    fn register_without_accessor_propagates() {
        let mut registry = registry();
        let err = registry.register_any(&Handle::new(Anonymous)).unwrap_err();
        assert!(matches!(err, OrmError::NoIdAccessor(_)));
    }

    #[test]
    fn aggregate_root_callbacks_run_in_order_for_each_root() {
        let mut registry = registry();
        let author = user(5, "author");
        let editor = user(6, "editor");
        let post = Handle::new(Post { id: 1, user_id: 0, editor_id: 0 });

        registry.register_aggregate_root_callback(&author, &post, |root: &User, child: &mut Post| {
            child.user_id = root.id;
        });
        registry.register_aggregate_root_callback(&editor, &post, |root: &User, child: &mut Post| {
            child.editor_id = root.id;
        });
        // Later callbacks see earlier writes.
        registry.register_aggregate_root_callback(&editor, &post, |_: &User, child: &mut Post| {
            child.id = child.user_id * 100 + child.editor_id;
        });

        assert!(registry.has_aggregate_root_callbacks(&post));
        registry.run_aggregate_root_callbacks(&post);

        let post = post.read();
        assert_eq!((post.user_id, post.editor_id, post.id), (5, 6, 506));
    }

    #[test]
    fn running_callbacks_without_registrations_is_a_no_op() {
        let registry = registry();
        let post = Handle::new(Post { id: 1, user_id: 0, editor_id: 0 });
        registry.run_aggregate_root_callbacks(&post);
        assert_eq!(post.read().user_id, 0);
    }

    #[test]
    fn deregister_drops_callbacks_keyed_to_the_child() {
        let mut registry = registry();
        let author = user(5, "author");
        let post = Handle::new(Post { id: 1, user_id: 0, editor_id: 0 });
        registry.register_entity(&post).unwrap();
        registry.register_aggregate_root_callback(&author, &post, |root: &User, child: &mut Post| {
            child.user_id = root.id;
        });

        registry.deregister_entity(&post).unwrap();
        registry.run_aggregate_root_callbacks(&post);

        assert_eq!(post.read().user_id, 0);
    }

    #[test]
    fn clear_resets_everything() {
        let mut registry = registry();
        let u = user(1, "foo");
        registry.register_entity(&u).unwrap();

        registry.clear();

        assert!(registry.is_empty());
        assert_eq!(registry.entity_state(&u), EntityState::NeverRegistered);
        assert_eq!(registry.change_tracker().tracked_count(), 0);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: whatever the registration sequence, one instance per id survives.
            #[test]
            fn one_canonical_instance_per_id(ids in proptest::collection::vec(1i64..20, 1..40)) {
                let mut registry = registry();
                let mut resolved: HashMap<i64, Handle<User>> = HashMap::new();

                for id in ids {
                    let handle = registry.register_entity(&user(id, "x")).unwrap();
                    let canonical = resolved.entry(id).or_insert_with(|| handle.clone());
                    prop_assert!(canonical.ptr_eq(&handle));
                }

                prop_assert_eq!(registry.entities().len(), resolved.len());
            }
        }
    }
}
