use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use forgeorm_core::{Connection, EntityId, StorageError};

/// One durable commit, as recorded in the database's commit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    /// 1-based position in the log.
    pub sequence: u64,
    pub committed_at: DateTime<Utc>,
    /// Row writes (insert/update/delete) that became durable with this commit.
    pub writes: usize,
    /// `false` for writes issued outside an explicit transaction.
    pub explicit: bool,
}

#[derive(Debug, Default, Clone)]
struct Table {
    rows: BTreeMap<EntityId, JsonValue>,
    sequence: i64,
}

type Tables = HashMap<String, Table>;

#[derive(Debug, Default)]
struct State {
    committed: Tables,
    /// Working copy of the tables while a transaction is open.
    staged: Option<Tables>,
    staged_writes: usize,
    last_insert: Option<EntityId>,
    last_insert_by_table: HashMap<String, EntityId>,
    commits: Vec<CommitRecord>,
}

impl State {
    fn record_commit(&mut self, writes: usize, explicit: bool) {
        let sequence = self.commits.len() as u64 + 1;
        self.commits.push(CommitRecord {
            sequence,
            committed_at: Utc::now(),
            writes,
            explicit,
        });
    }
}

/// In-memory transactional table store.
///
/// Intended for tests/dev. Not optimized for performance: `begin_transaction` copies
/// every committed table.
///
/// Reads see the open transaction's own writes. Writes outside a transaction apply
/// immediately (autocommit). Insert ids are connection state and survive a rollback,
/// like autoincrement values in most relational stores.
#[derive(Debug, Default)]
pub struct InMemoryDatabase {
    state: RwLock<State>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `row` into `table`, keyed by the value of its `id_field`.
    ///
    /// An empty id (missing, `null`, `0`, `""`) takes the table sequence's next value,
    /// which is also written back into the row. An explicit integer id advances the
    /// sequence past it. Inserting an existing id is a conflict.
    pub fn insert(
        &self,
        table: &str,
        id_field: &str,
        mut row: JsonValue,
    ) -> Result<EntityId, StorageError> {
        let Some(fields) = row.as_object() else {
            return Err(StorageError::Serialization(format!(
                "row for `{table}` is not a JSON object"
            )));
        };
        let given = match fields.get(id_field) {
            Some(value) => EntityId::from_json(value).ok_or_else(|| {
                StorageError::Serialization(format!(
                    "`{table}.{id_field}` does not hold an id: {value}"
                ))
            })?,
            None => EntityId::Null,
        };

        self.write(move |state| {
            let tables = working_tables(state);
            let entry = tables.entry(table.to_string()).or_default();

            let id = if given.is_empty() {
                entry.sequence += 1;
                EntityId::Int(entry.sequence)
            } else {
                if let EntityId::Int(n) = given {
                    entry.sequence = entry.sequence.max(n);
                }
                given
            };

            if entry.rows.contains_key(&id) {
                return Err(StorageError::conflict(format!(
                    "duplicate key {id} in `{table}`"
                )));
            }
            if let Some(fields) = row.as_object_mut() {
                fields.insert(id_field.to_string(), id.to_json());
            }
            entry.rows.insert(id.clone(), row);

            state.last_insert = Some(id.clone());
            state
                .last_insert_by_table
                .insert(table.to_string(), id.clone());
            Ok(id)
        })
    }

    /// Replace the row stored under `id`.
    pub fn update(&self, table: &str, id: &EntityId, row: JsonValue) -> Result<(), StorageError> {
        self.write(|state| {
            let existing = working_tables(state)
                .get_mut(table)
                .and_then(|entry| entry.rows.get_mut(id))
                .ok_or_else(|| StorageError::not_found(format!("no row {id} in `{table}`")))?;
            *existing = row;
            Ok(())
        })
    }

    pub fn delete(&self, table: &str, id: &EntityId) -> Result<(), StorageError> {
        self.write(|state| {
            working_tables(state)
                .get_mut(table)
                .and_then(|entry| entry.rows.remove(id))
                .map(|_| ())
                .ok_or_else(|| StorageError::not_found(format!("no row {id} in `{table}`")))
        })
    }

    pub fn get(&self, table: &str, id: &EntityId) -> Result<Option<JsonValue>, StorageError> {
        self.read(|tables| {
            tables
                .get(table)
                .and_then(|entry| entry.rows.get(id))
                .cloned()
        })
    }

    /// Every row of `table`, ordered by id.
    pub fn all(&self, table: &str) -> Result<Vec<JsonValue>, StorageError> {
        self.read(|tables| {
            tables
                .get(table)
                .map(|entry| entry.rows.values().cloned().collect())
                .unwrap_or_default()
        })
    }

    pub fn count(&self, table: &str) -> Result<usize, StorageError> {
        self.read(|tables| tables.get(table).map_or(0, |entry| entry.rows.len()))
    }

    /// The commit log, oldest first.
    pub fn commits(&self) -> Result<Vec<CommitRecord>, StorageError> {
        Ok(self
            .state
            .read()
            .map_err(|_| poisoned())?
            .commits
            .clone())
    }

    fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> Result<R, StorageError> {
        let state = self.state.read().map_err(|_| poisoned())?;
        Ok(f(state.staged.as_ref().unwrap_or(&state.committed)))
    }

    fn write<R>(
        &self,
        f: impl FnOnce(&mut State) -> Result<R, StorageError>,
    ) -> Result<R, StorageError> {
        let mut state = self.lock()?;
        let result = f(&mut *state)?;
        if state.staged.is_some() {
            state.staged_writes += 1;
        } else {
            state.record_commit(1, false);
        }
        Ok(result)
    }

    fn lock(&self) -> Result<RwLockWriteGuard<'_, State>, StorageError> {
        self.state.write().map_err(|_| poisoned())
    }
}

fn working_tables(state: &mut State) -> &mut Tables {
    state.staged.as_mut().unwrap_or(&mut state.committed)
}

fn poisoned() -> StorageError {
    StorageError::transaction("lock poisoned")
}

impl Connection for InMemoryDatabase {
    fn begin_transaction(&self) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        if state.staged.is_some() {
            return Err(StorageError::transaction("transaction already open"));
        }
        state.staged = Some(state.committed.clone());
        state.staged_writes = 0;
        tracing::trace!("transaction started");
        Ok(())
    }

    fn commit(&self) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        let staged = state
            .staged
            .take()
            .ok_or_else(|| StorageError::transaction("no open transaction to commit"))?;
        state.committed = staged;
        let writes = std::mem::take(&mut state.staged_writes);
        state.record_commit(writes, true);
        tracing::trace!(writes, "transaction committed");
        Ok(())
    }

    fn roll_back(&self) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        if state.staged.take().is_none() {
            return Err(StorageError::transaction("no open transaction to roll back"));
        }
        let discarded = std::mem::take(&mut state.staged_writes);
        tracing::trace!(discarded, "transaction rolled back");
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.state
            .read()
            .map(|state| state.staged.is_some())
            .unwrap_or(false)
    }

    fn last_insert_id(&self, sequence: Option<&str>) -> Result<EntityId, StorageError> {
        let state = self.state.read().map_err(|_| poisoned())?;
        let id = match sequence {
            Some(table) => state.last_insert_by_table.get(table).cloned(),
            None => state.last_insert.clone(),
        };
        Ok(id.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_ids_take_the_next_sequence_value() {
        let db = InMemoryDatabase::new();

        let a = db.insert("users", "id", json!({ "id": 0, "name": "a" })).unwrap();
        let b = db.insert("users", "id", json!({ "name": "b" })).unwrap();
        let c = db.insert("users", "id", json!({ "id": 10, "name": "c" })).unwrap();
        let d = db.insert("users", "id", json!({ "id": null, "name": "d" })).unwrap();

        assert_eq!(
            [a, b, c, d.clone()],
            [EntityId::Int(1), EntityId::Int(2), EntityId::Int(10), EntityId::Int(11)]
        );
        assert_eq!(db.get("users", &d).unwrap().unwrap()["id"], 11);
        assert_eq!(db.last_insert_id(Some("users")).unwrap(), EntityId::Int(11));
        assert_eq!(db.last_insert_id(Some("posts")).unwrap(), EntityId::Null);
    }

    #[test]
    fn duplicate_keys_conflict() {
        let db = InMemoryDatabase::new();
        db.insert("users", "id", json!({ "id": 1 })).unwrap();
        let err = db.insert("users", "id", json!({ "id": 1 })).unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }

    #[test]
    fn non_object_rows_are_rejected() {
        let db = InMemoryDatabase::new();
        let err = db.insert("users", "id", json!([1, 2])).unwrap_err();
        assert!(matches!(err, StorageError::Serialization(_)));
    }

    #[test]
    fn rollback_discards_transactional_writes() {
        let db = InMemoryDatabase::new();
        db.insert("users", "id", json!({ "id": 1, "name": "kept" })).unwrap();

        db.begin_transaction().unwrap();
        assert!(db.in_transaction());
        db.insert("users", "id", json!({ "name": "gone" })).unwrap();
        db.update("users", &EntityId::Int(1), json!({ "id": 1, "name": "changed" }))
            .unwrap();
        assert_eq!(db.count("users").unwrap(), 2);
        db.roll_back().unwrap();

        assert!(!db.in_transaction());
        assert_eq!(db.count("users").unwrap(), 1);
        assert_eq!(db.get("users", &EntityId::Int(1)).unwrap().unwrap()["name"], "kept");
        // Sequence values are not reused.
        assert_eq!(db.last_insert_id(None).unwrap(), EntityId::Int(2));
    }

    #[test]
    fn commit_publishes_and_logs() {
        let db = InMemoryDatabase::new();
        db.insert("users", "id", json!({ "id": 1 })).unwrap();

        db.begin_transaction().unwrap();
        db.insert("users", "id", json!({ "id": 2 })).unwrap();
        db.delete("users", &EntityId::Int(1)).unwrap();
        db.commit().unwrap();

        let ids: Vec<_> = db
            .all("users")
            .unwrap()
            .iter()
            .map(|row| row["id"].clone())
            .collect();
        assert_eq!(ids, vec![json!(2)]);

        let log = db.commits().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!((log[0].writes, log[0].explicit), (1, false));
        assert_eq!((log[1].sequence, log[1].writes, log[1].explicit), (2, 2, true));
    }

    #[test]
    fn transaction_misuse_is_reported() {
        let db = InMemoryDatabase::new();
        assert!(matches!(db.commit(), Err(StorageError::Transaction(_))));
        assert!(matches!(db.roll_back(), Err(StorageError::Transaction(_))));

        db.begin_transaction().unwrap();
        assert!(matches!(
            db.begin_transaction(),
            Err(StorageError::Transaction(_))
        ));
    }

    #[test]
    fn missing_rows_are_not_found() {
        let db = InMemoryDatabase::new();
        let id = EntityId::Int(3);
        assert!(matches!(
            db.update("users", &id, json!({})),
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(db.delete("users", &id), Err(StorageError::NotFound(_))));
        assert!(db.get("users", &id).unwrap().is_none());
    }
}
