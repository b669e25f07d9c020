//! Unit of work: collects entity writes and commits them in one transaction.
//!
//! Callers schedule inserts, updates and deletes against in-memory entity handles; nothing
//! touches storage until [`UnitOfWork::commit`]. Mutations of already registered entities
//! are picked up automatically by comparing them against their change baseline.
//!
//! ## Commit protocol
//!
//! ```text
//! commit()
//!   ↓
//! 1. No connection?            → NoConnection (nothing else happens)
//!   ↓
//! 2. check_for_updates         (dirty Registered entities join the update schedule)
//!   ↓
//! 3. begin transaction
//!   ↓
//! 4. insertions: aggregate callbacks → mapper.add (+ id assignment) → register
//! 5. updates:    aggregate callbacks → mapper.update → register
//! 6. deletions:  mapper.delete
//!   ↓
//! 7. commit transaction
//!   ↓
//! 8. deleted entities: detach → Dequeued; refresh baselines; clear schedules
//!   ↓
//! 9. mapper.after_commit for every mapper (all run; the first failure is reported)
//! ```
//!
//! If anything in steps 4-7 fails the transaction is rolled back, the insertions that
//! step 4 had registered are unwound, every scheduled insertion gets its id reset to the
//! mapper's empty value, mappers get `after_rollback`, and the cause is returned wrapped
//! in [`OrmError::CommitFailed`]. Schedules survive a failed commit.
//!
//! One `UnitOfWork` belongs to one logical operation; it is `Send` but takes `&mut self`
//! everywhere and does no internal synchronization.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::config::UnitOfWorkConfig;
use crate::connection::Connection;
use crate::data_mapper::{DataMapper, ErasedDataMapper, MapperAdapter};
use crate::entity::{AnyHandle, Entity, EntityRef, Handle};
use crate::error::{OrmError, OrmResult};
use crate::id::ObjectId;
use crate::registry::{EntityRegistry, EntityState};

type MapperMap = BTreeMap<&'static str, Box<dyn ErasedDataMapper>>;

/// Ordered set of scheduled entities, keyed by object identity.
#[derive(Default)]
struct Schedule {
    entries: Vec<AnyHandle>,
    members: HashSet<ObjectId>,
}

impl Schedule {
    fn insert(&mut self, entity: AnyHandle) -> bool {
        if !self.members.insert(entity.object_id()) {
            return false;
        }
        self.entries.push(entity);
        true
    }

    fn remove(&mut self, object_id: ObjectId) -> bool {
        if !self.members.remove(&object_id) {
            return false;
        }
        self.entries.retain(|entity| entity.object_id() != object_id);
        true
    }

    fn contains(&self, object_id: ObjectId) -> bool {
        self.members.contains(&object_id)
    }

    fn to_vec(&self) -> Vec<AnyHandle> {
        self.entries.clone()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.members.clear();
    }
}

/// Transactional write coordinator over an [`EntityRegistry`].
pub struct UnitOfWork {
    registry: EntityRegistry,
    connection: Option<Arc<dyn Connection>>,
    mappers: MapperMap,
    insertions: Schedule,
    updates: Schedule,
    deletions: Schedule,
    config: UnitOfWorkConfig,
}

impl Default for UnitOfWork {
    fn default() -> Self {
        Self::new()
    }
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::with_config(UnitOfWorkConfig::default())
    }

    pub fn with_config(config: UnitOfWorkConfig) -> Self {
        Self {
            registry: EntityRegistry::default(),
            connection: None,
            mappers: BTreeMap::new(),
            insertions: Schedule::default(),
            updates: Schedule::default(),
            deletions: Schedule::default(),
            config,
        }
    }

    /// Replace the (empty) default registry, typically one with id accessors set up.
    pub fn with_registry(mut self, registry: EntityRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &UnitOfWorkConfig {
        &self.config
    }

    pub fn set_connection(&mut self, connection: impl Connection + 'static) {
        self.connection = Some(Arc::new(connection));
    }

    pub fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    /// Use `mapper` to persist entities of type `T`, replacing any previous mapper.
    pub fn register_data_mapper<T, M>(&mut self, mapper: M)
    where
        T: Entity,
        M: DataMapper<T> + 'static,
    {
        self.mappers
            .insert(T::TYPE_NAME, Box::new(MapperAdapter::<T, M>::new(mapper)));
    }

    pub fn has_data_mapper(&self, type_name: &str) -> bool {
        self.mappers.contains_key(type_name)
    }

    pub fn entity_registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn entity_registry_mut(&mut self) -> &mut EntityRegistry {
        &mut self.registry
    }

    /// Schedule `entity` to be added; its state becomes `Queued`.
    pub fn schedule_for_insertion(&mut self, entity: &impl EntityRef) {
        if self.insertions.insert(entity.to_any()) {
            tracing::debug!(
                entity_type = entity.type_name(),
                object = %entity.object_id(),
                "scheduled for insertion"
            );
        }
        self.registry.set_state(entity, EntityState::Queued);
    }

    pub fn schedule_for_update(&mut self, entity: &impl EntityRef) {
        if self.updates.insert(entity.to_any()) {
            tracing::debug!(
                entity_type = entity.type_name(),
                object = %entity.object_id(),
                "scheduled for update"
            );
        }
    }

    pub fn schedule_for_deletion(&mut self, entity: &impl EntityRef) {
        if self.deletions.insert(entity.to_any()) {
            tracing::debug!(
                entity_type = entity.type_name(),
                object = %entity.object_id(),
                "scheduled for deletion"
            );
        }
    }

    pub fn scheduled_for_insertion(&self) -> Vec<AnyHandle> {
        self.insertions.to_vec()
    }

    pub fn scheduled_for_update(&self) -> Vec<AnyHandle> {
        self.updates.to_vec()
    }

    pub fn scheduled_for_deletion(&self) -> Vec<AnyHandle> {
        self.deletions.to_vec()
    }

    /// `true` if `entity` sits in any of the three schedules.
    pub fn is_scheduled(&self, entity: &impl EntityRef) -> bool {
        let object_id = entity.object_id();
        self.insertions.contains(object_id)
            || self.updates.contains(object_id)
            || self.deletions.contains(object_id)
    }

    /// Forget `entity`: unschedule it, drop its aggregate callbacks and deregister it.
    ///
    /// Safe for entities that were never scheduled or registered.
    pub fn detach(&mut self, entity: &impl EntityRef) -> OrmResult<()> {
        let object_id = entity.object_id();
        self.insertions.remove(object_id);
        self.updates.remove(object_id);
        self.deletions.remove(object_id);
        self.registry.remove_aggregate_root_callbacks(entity);
        self.registry.deregister_entity(entity)
    }

    /// Reset to a fresh state: no schedules, no callbacks, empty registry.
    pub fn dispose(&mut self) {
        self.clear_schedules();
        self.registry.clear();
    }

    /// Register `propagate(root, child)` to run right before `child` is written.
    pub fn register_aggregate_root_callback<R, C>(
        &mut self,
        root: &Handle<R>,
        child: &Handle<C>,
        propagate: impl Fn(&R, &mut C) + Send + Sync + 'static,
    ) where
        R: Entity,
        C: Entity,
    {
        self.registry
            .register_aggregate_root_callback(root, child, propagate);
    }

    /// Schedule every `Registered`, unscheduled entity that differs from its baseline
    /// for update.
    pub fn check_for_updates(&mut self) -> OrmResult<()> {
        for entity in self.registry.entities() {
            if self.registry.entity_state(&entity) != EntityState::Registered
                || self.is_scheduled(&entity)
            {
                continue;
            }

            let tracker = self.registry.change_tracker();
            if !tracker.has_changed(&entity)? {
                continue;
            }

            if tracing::enabled!(tracing::Level::DEBUG) {
                let fields = tracker.changed_fields(&entity)?;
                tracing::debug!(
                    entity_type = entity.type_name(),
                    object = %entity.object_id(),
                    fields = ?fields,
                    "dirty entity scheduled for update"
                );
            }
            self.updates.insert(entity);
        }
        Ok(())
    }

    /// Write every scheduled change in one transaction.
    ///
    /// See the module docs for the protocol and failure handling.
    pub fn commit(&mut self) -> OrmResult<()> {
        let connection = self.connection.clone().ok_or(OrmError::NoConnection)?;

        if self.config.detect_changes {
            self.check_for_updates()?;
        }

        let span = tracing::info_span!(
            "unit_of_work.commit",
            insertions = self.insertions.len(),
            updates = self.updates.len(),
            deletions = self.deletions.len(),
        );
        let _enter = span.enter();

        connection
            .begin_transaction()
            .map_err(|e| OrmError::commit_failed(e.into()))?;

        let mut newly_registered = Vec::new();
        let outcome = self
            .write_scheduled(&mut newly_registered)
            .and_then(|()| connection.commit().map_err(OrmError::from));

        if let Err(cause) = outcome {
            return Err(self.abort(connection.as_ref(), &newly_registered, cause));
        }

        self.finish()
    }

    /// Steps 4-6 of the protocol; runs inside the transaction.
    fn write_scheduled(&mut self, newly_registered: &mut Vec<AnyHandle>) -> OrmResult<()> {
        let Self {
            registry,
            mappers,
            insertions,
            updates,
            deletions,
            ..
        } = self;

        // Children scheduled for insertion and update get their callbacks run once.
        let mut propagated = HashSet::new();

        for entity in &insertions.entries {
            registry.run_aggregate_root_callbacks(entity);
            propagated.insert(entity.object_id());
            mapper_for(mappers, entity)?.add(entity, registry.id_accessors())?;

            let tracked_before = registry.change_tracker().is_tracking(entity);
            let canonical = registry.register_any(entity)?;
            if canonical.object_id() != entity.object_id() {
                tracing::debug!(
                    entity_type = entity.type_name(),
                    object = %entity.object_id(),
                    canonical = %canonical.object_id(),
                    "inserted entity resolved to an already mapped instance"
                );
                continue;
            }
            registry.set_state(entity, EntityState::Registered);
            if !tracked_before {
                newly_registered.push(entity.clone());
            }
        }

        for entity in &updates.entries {
            if propagated.insert(entity.object_id()) {
                registry.run_aggregate_root_callbacks(entity);
            }
            mapper_for(mappers, entity)?.update(entity)?;
            registry.register_any(entity)?;
        }

        for entity in &deletions.entries {
            mapper_for(mappers, entity)?.delete(entity)?;
        }

        Ok(())
    }

    fn abort(
        &mut self,
        connection: &dyn Connection,
        newly_registered: &[AnyHandle],
        cause: OrmError,
    ) -> OrmError {
        tracing::warn!(error = %cause, "commit failed, rolling back");
        if let Err(err) = connection.roll_back() {
            tracing::error!(error = %err, "rollback failed");
        }

        for entity in newly_registered {
            self.registry.unwind_insertion(entity);
        }

        for entity in &self.insertions.entries {
            let Some(empty) = self
                .mappers
                .get(entity.type_name())
                .and_then(|mapper| mapper.empty_id(entity))
            else {
                continue;
            };
            if let Err(err) = self.registry.id_accessors().set_entity_id(entity, empty) {
                tracing::warn!(
                    entity_type = entity.type_name(),
                    error = %err,
                    "could not reset id of aborted insertion"
                );
            }
        }

        for mapper in self.mappers.values() {
            mapper.after_rollback();
        }

        OrmError::commit_failed(cause)
    }

    /// Steps 8-9: bookkeeping after the transaction is durable.
    fn finish(&mut self) -> OrmResult<()> {
        let (inserted, updated, deleted) = (
            self.insertions.len(),
            self.updates.len(),
            self.deletions.len(),
        );

        for entity in self.deletions.to_vec() {
            if let Err(err) = self.detach(&entity) {
                tracing::warn!(
                    entity_type = entity.type_name(),
                    error = %err,
                    "could not detach deleted entity"
                );
            }
            self.registry.set_state(&entity, EntityState::Dequeued);
        }

        if self.config.refresh_baselines {
            for entity in &self.updates.entries {
                if self.registry.entity_state(entity) != EntityState::Registered {
                    continue;
                }
                if let Err(err) = self.registry.change_tracker_mut().start_tracking(entity) {
                    tracing::warn!(
                        entity_type = entity.type_name(),
                        error = %err,
                        "could not refresh change baseline"
                    );
                }
            }
        }

        self.clear_schedules();
        tracing::info!(inserted, updated, deleted, "commit succeeded");

        let mut first_failure = None;
        for (type_name, mapper) in &self.mappers {
            if let Err(source) = mapper.after_commit() {
                tracing::warn!(entity_type = *type_name, error = %source, "post-commit hook failed");
                first_failure.get_or_insert(OrmError::PostCommit {
                    type_name: type_name.to_string(),
                    source,
                });
            }
        }
        first_failure.map_or(Ok(()), Err)
    }

    fn clear_schedules(&mut self) {
        self.insertions.clear();
        self.updates.clear();
        self.deletions.clear();
        self.registry.clear_aggregate_roots();
    }
}

impl core::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("insertions", &self.insertions.len())
            .field("updates", &self.updates.len())
            .field("deletions", &self.deletions.len())
            .field("mappers", &self.mappers.keys().collect::<Vec<_>>())
            .field("has_connection", &self.connection.is_some())
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish()
    }
}

fn mapper_for<'a>(mappers: &'a MapperMap, entity: &AnyHandle) -> OrmResult<&'a dyn ErasedDataMapper> {
    mappers
        .get(entity.type_name())
        .map(|mapper| &**mapper)
        .ok_or_else(|| OrmError::NoDataMapper(entity.type_name().to_string()))
}
