//! Snapshot-and-diff change detection.
//!
//! When tracking starts, the tracker stores a baseline copy of the entity: a typed clone
//! plus its serialized field map. `has_changed` later compares the live entity against
//! that baseline, so domain types never maintain dirty flags themselves.
//!
//! ## Comparison rules
//!
//! - If a comparator was registered for the entity's type, it decides. It returns `true`
//!   when the two values are *equal*.
//! - Otherwise fields are compared structurally: a different field count is a change,
//!   and every baseline field must exist on the live entity with an equal value. Fields
//!   that only exist on the live entity therefore also count as a change.
//! - Fields holding a [`Handle`](crate::entity::Handle) compare by object identity.

use std::any::Any;
use std::collections::{BTreeSet, HashMap};

use serde_json::Value as JsonValue;

use crate::entity::{AnyHandle, Entity, EntityRef, Snapshot};
use crate::error::{OrmError, OrmResult};
use crate::id::ObjectId;

type Comparator = Box<dyn Fn(&AnyHandle, &(dyn Any + Send + Sync)) -> Option<bool> + Send + Sync>;

/// Baseline store + change detection for tracked entity instances.
#[derive(Default)]
pub struct ChangeTracker {
    baselines: HashMap<ObjectId, Snapshot>,
    comparators: HashMap<&'static str, Comparator>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an equality function for `T` that takes priority over structural comparison.
    ///
    /// `are_equal(live, baseline)` must return `true` when nothing changed.
    pub fn register_comparator<T: Entity>(
        &mut self,
        are_equal: impl Fn(&T, &T) -> bool + Send + Sync + 'static,
    ) {
        let comparator: Comparator = Box::new(
            move |live: &AnyHandle, baseline: &(dyn Any + Send + Sync)| {
                let live = live.downcast::<T>()?;
                let baseline = baseline.downcast_ref::<T>()?;
                let live = live.read();
                Some(are_equal(&*live, baseline))
            },
        );
        self.comparators.insert(T::TYPE_NAME, comparator);
    }

    pub fn has_comparator(&self, type_name: &str) -> bool {
        self.comparators.contains_key(type_name)
    }

    /// Capture (or re-capture) the baseline for `entity`.
    pub fn start_tracking(&mut self, entity: &impl EntityRef) -> OrmResult<()> {
        let snapshot = entity
            .to_any()
            .capture()
            .map_err(|e| snapshot_error(entity, e))?;
        self.baselines.insert(entity.object_id(), snapshot);
        Ok(())
    }

    pub fn stop_tracking(&mut self, entity: &impl EntityRef) {
        self.baselines.remove(&entity.object_id());
    }

    pub fn stop_tracking_all(&mut self) {
        self.baselines.clear();
    }

    pub fn is_tracking(&self, entity: &impl EntityRef) -> bool {
        self.baselines.contains_key(&entity.object_id())
    }

    pub fn tracked_count(&self) -> usize {
        self.baselines.len()
    }

    /// Whether `entity` differs from its baseline.
    pub fn has_changed(&self, entity: &impl EntityRef) -> OrmResult<bool> {
        let baseline = self.baseline(entity)?;
        let live = entity.to_any();

        if let Some(comparator) = self.comparators.get(entity.type_name()) {
            if let Some(equal) = comparator(&live, &*baseline.value) {
                return Ok(!equal);
            }
        }

        let current = live.fields().map_err(|e| snapshot_error(entity, e))?;
        Ok(fields_differ(&baseline.fields, &current))
    }

    /// Names of the fields that differ from the baseline, sorted.
    ///
    /// Types decided by a comparator have no field-level view and report `["*"]`
    /// when changed.
    pub fn changed_fields(&self, entity: &impl EntityRef) -> OrmResult<Vec<String>> {
        let baseline = self.baseline(entity)?;
        if self.comparators.contains_key(entity.type_name()) {
            return Ok(if self.has_changed(entity)? {
                vec!["*".to_string()]
            } else {
                Vec::new()
            });
        }

        let current = entity
            .to_any()
            .fields()
            .map_err(|e| snapshot_error(entity, e))?;

        Ok(match (&baseline.fields, &current) {
            (JsonValue::Object(before), JsonValue::Object(after)) => {
                let names: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
                names
                    .into_iter()
                    .filter(|name| before.get(*name) != after.get(*name))
                    .cloned()
                    .collect()
            }
            (before, after) if before != after => vec!["*".to_string()],
            _ => Vec::new(),
        })
    }

    fn baseline(&self, entity: &impl EntityRef) -> OrmResult<&Snapshot> {
        self.baselines
            .get(&entity.object_id())
            .ok_or_else(|| OrmError::NotTracked(entity.type_name().to_string()))
    }
}

impl core::fmt::Debug for ChangeTracker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChangeTracker")
            .field("tracked", &self.baselines.len())
            .field("comparators", &self.comparators.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn fields_differ(baseline: &JsonValue, current: &JsonValue) -> bool {
    match (baseline, current) {
        (JsonValue::Object(before), JsonValue::Object(after)) => {
            if before.len() != after.len() {
                return true;
            }
            before
                .iter()
                .any(|(name, value)| after.get(name) != Some(value))
        }
        (before, after) => before != after,
    }
}

fn snapshot_error(entity: &impl EntityRef, err: serde_json::Error) -> OrmError {
    OrmError::Snapshot {
        type_name: entity.type_name().to_string(),
        message: err.to_string(),
    }
}
