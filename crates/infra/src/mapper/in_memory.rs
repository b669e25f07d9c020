use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use forgeorm_core::{DataMapper, Entity, EntityId, IdGenerator, SequenceIdGenerator, StorageError};

use crate::database::InMemoryDatabase;

/// Serde-based mapper storing one entity type in one [`InMemoryDatabase`] table.
///
/// Rows are the entity's serialized form, keyed by the value of `id_field`. By default
/// ids are post-insert: an entity written with an empty id receives the table's next
/// autoincrement value, which the unit of work then copies back into the entity.
pub struct InMemoryDataMapper<T> {
    database: Arc<InMemoryDatabase>,
    table: String,
    id_field: String,
    generator: Option<Box<dyn IdGenerator<T>>>,
    _entity: PhantomData<fn() -> T>,
}

impl<T: 'static> InMemoryDataMapper<T> {
    pub fn new(
        database: Arc<InMemoryDatabase>,
        table: impl Into<String>,
        id_field: impl Into<String>,
    ) -> Self {
        let table = table.into();
        let generator = SequenceIdGenerator::<T>::new(database.clone()).with_sequence(table.clone());
        Self {
            database,
            table,
            id_field: id_field.into(),
            generator: Some(Box::new(generator)),
            _entity: PhantomData,
        }
    }

    /// Replace the autoincrement generator, e.g. with a pre-insert UUID generator.
    pub fn with_id_generator(mut self, generator: impl IdGenerator<T> + 'static) -> Self {
        self.generator = Some(Box::new(generator));
        self
    }

    /// Entities bring their own ids; nothing is assigned or reset by the unit of work.
    pub fn without_id_generator(mut self) -> Self {
        self.generator = None;
        self
    }
}

impl<T> InMemoryDataMapper<T> {
    pub fn table(&self) -> &str {
        &self.table
    }

    fn row_id(&self, row: &JsonValue) -> Result<EntityId, StorageError> {
        row.get(&self.id_field)
            .and_then(EntityId::from_json)
            .ok_or_else(|| {
                StorageError::Serialization(format!(
                    "`{}` rows need an id in `{}`",
                    self.table, self.id_field
                ))
            })
    }
}

impl<T> InMemoryDataMapper<T>
where
    T: Serialize,
{
    fn to_row(&self, entity: &T) -> Result<(JsonValue, EntityId), StorageError> {
        let row = serde_json::to_value(entity)?;
        let id = self.row_id(&row)?;
        Ok((row, id))
    }
}

impl<T> DataMapper<T> for InMemoryDataMapper<T>
where
    T: Entity + DeserializeOwned,
{
    fn add(&self, entity: &T) -> Result<(), StorageError> {
        let row = serde_json::to_value(entity)?;
        let id = self.database.insert(&self.table, &self.id_field, row)?;
        tracing::debug!(table = %self.table, %id, "row inserted");
        Ok(())
    }

    fn update(&self, entity: &T) -> Result<(), StorageError> {
        let (row, id) = self.to_row(entity)?;
        self.database.update(&self.table, &id, row)?;
        tracing::debug!(table = %self.table, %id, "row updated");
        Ok(())
    }

    fn delete(&self, entity: &T) -> Result<(), StorageError> {
        let (_, id) = self.to_row(entity)?;
        self.database.delete(&self.table, &id)?;
        tracing::debug!(table = %self.table, %id, "row deleted");
        Ok(())
    }

    fn get_by_id(&self, id: &EntityId) -> Result<Option<T>, StorageError> {
        self.database
            .get(&self.table, id)?
            .map(|row| serde_json::from_value(row).map_err(StorageError::from))
            .transpose()
    }

    fn get_all(&self) -> Result<Vec<T>, StorageError> {
        self.database
            .all(&self.table)?
            .into_iter()
            .map(|row| serde_json::from_value(row).map_err(StorageError::from))
            .collect()
    }

    fn id_generator(&self) -> Option<&dyn IdGenerator<T>> {
        self.generator.as_deref()
    }
}

impl<T> core::fmt::Debug for InMemoryDataMapper<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryDataMapper")
            .field("table", &self.table)
            .field("id_field", &self.id_field)
            .field("generates_ids", &self.generator.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgeorm_core::{Connection, UuidIdGenerator};
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Invoice {
        id: i64,
        number: String,
        total_cents: i64,
    }

    impl Entity for Invoice {
        const TYPE_NAME: &'static str = "invoice";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Attachment {
        id: Option<uuid::Uuid>,
        file: String,
    }

    impl Entity for Attachment {
        const TYPE_NAME: &'static str = "attachment";
    }

    fn invoice(id: i64, number: &str) -> Invoice {
        Invoice {
            id,
            number: number.into(),
            total_cents: 1_000,
        }
    }

    #[test]
    fn add_uses_the_table_sequence_for_empty_ids() {
        let db = Arc::new(InMemoryDatabase::new());
        let mapper = InMemoryDataMapper::<Invoice>::new(db.clone(), "invoices", "id");

        mapper.add(&invoice(0, "INV-1")).unwrap();

        let generator = mapper.id_generator().unwrap();
        assert!(generator.is_post_insert());
        assert_eq!(generator.generate(&invoice(0, "")).unwrap(), EntityId::Int(1));
        assert_eq!(generator.empty_value(&invoice(1, "")), EntityId::Int(0));
        assert_eq!(
            mapper.get_by_id(&EntityId::Int(1)).unwrap(),
            Some(invoice(1, "INV-1"))
        );
    }

    #[test]
    fn update_and_delete_address_rows_by_id() {
        let db = Arc::new(InMemoryDatabase::new());
        let mapper = InMemoryDataMapper::<Invoice>::new(db, "invoices", "id");
        mapper.add(&invoice(7, "INV-7")).unwrap();

        let mut changed = invoice(7, "INV-7");
        changed.total_cents = 2_500;
        mapper.update(&changed).unwrap();
        assert_eq!(mapper.get_all().unwrap(), vec![changed.clone()]);

        mapper.delete(&changed).unwrap();
        assert!(mapper.get_by_id(&EntityId::Int(7)).unwrap().is_none());
        assert!(matches!(
            mapper.update(&changed),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn pre_insert_uuid_ids_round_trip_through_rows() {
        let db = Arc::new(InMemoryDatabase::new());
        let mapper = InMemoryDataMapper::<Attachment>::new(db, "attachments", "id")
            .with_id_generator(UuidIdGenerator::new());
        let id = uuid::Uuid::now_v7();

        mapper
            .add(&Attachment {
                id: Some(id),
                file: "a.pdf".into(),
            })
            .unwrap();

        let loaded = mapper.get_by_id(&EntityId::Uuid(id)).unwrap().unwrap();
        assert_eq!(loaded.file, "a.pdf");
        assert!(!mapper.id_generator().unwrap().is_post_insert());
    }

    #[test]
    fn writes_inside_a_transaction_vanish_on_rollback() {
        let db = Arc::new(InMemoryDatabase::new());
        let mapper = InMemoryDataMapper::<Invoice>::new(db.clone(), "invoices", "id")
            .without_id_generator();
        assert!(mapper.id_generator().is_none());

        db.begin_transaction().unwrap();
        mapper.add(&invoice(1, "INV-1")).unwrap();
        db.roll_back().unwrap();

        assert!(mapper.get_all().unwrap().is_empty());
    }
}
