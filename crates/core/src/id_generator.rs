//! Id generation strategies.
//!
//! A generator is either *pre-insert* (the id is produced and assigned before the
//! mapper writes the row, e.g. UUIDs) or *post-insert* (the store produces the id while
//! writing and it is read back afterwards, e.g. autoincrement columns / sequences).
//! Either way the generator also defines the "empty" id that an entity is reset to when
//! the commit that inserted it is rolled back.

use std::marker::PhantomData;
use std::sync::Arc;

use uuid::Uuid;

use crate::connection::Connection;
use crate::error::StorageError;
use crate::id::EntityId;

pub trait IdGenerator<T>: Send + Sync {
    /// `true` if the id only exists after the row was written.
    fn is_post_insert(&self) -> bool;

    fn generate(&self, entity: &T) -> Result<EntityId, StorageError>;

    /// Id value meaning "not persisted".
    fn empty_value(&self, entity: &T) -> EntityId;
}

/// Pre-insert generator producing time-ordered UUIDv7 ids.
#[derive(Debug)]
pub struct UuidIdGenerator<T> {
    _entity: PhantomData<fn(&T)>,
}

impl<T> UuidIdGenerator<T> {
    pub fn new() -> Self {
        Self {
            _entity: PhantomData,
        }
    }
}

impl<T> Default for UuidIdGenerator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> IdGenerator<T> for UuidIdGenerator<T> {
    fn is_post_insert(&self) -> bool {
        false
    }

    fn generate(&self, _entity: &T) -> Result<EntityId, StorageError> {
        Ok(EntityId::Uuid(Uuid::now_v7()))
    }

    fn empty_value(&self, _entity: &T) -> EntityId {
        EntityId::Null
    }
}

/// Post-insert generator reading the connection's last inserted id.
pub struct SequenceIdGenerator<T> {
    connection: Arc<dyn Connection>,
    sequence: Option<String>,
    _entity: PhantomData<fn(&T)>,
}

impl<T> SequenceIdGenerator<T> {
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self {
            connection,
            sequence: None,
            _entity: PhantomData,
        }
    }

    /// Read ids from a named sequence instead of the connection-wide last insert id.
    pub fn with_sequence(mut self, sequence: impl Into<String>) -> Self {
        self.sequence = Some(sequence.into());
        self
    }
}

impl<T> core::fmt::Debug for SequenceIdGenerator<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SequenceIdGenerator")
            .field("sequence", &self.sequence)
            .finish()
    }
}

impl<T> IdGenerator<T> for SequenceIdGenerator<T> {
    fn is_post_insert(&self) -> bool {
        true
    }

    fn generate(&self, _entity: &T) -> Result<EntityId, StorageError> {
        let id = self.connection.last_insert_id(self.sequence.as_deref())?;
        if id.is_empty() {
            return Err(StorageError::not_found(format!(
                "no insert id available for sequence {:?}",
                self.sequence
            )));
        }
        Ok(id)
    }

    fn empty_value(&self, _entity: &T) -> EntityId {
        EntityId::Int(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FixedConnection {
        last: Mutex<Option<(Option<String>, i64)>>,
    }

    impl Connection for FixedConnection {
        fn begin_transaction(&self) -> Result<(), StorageError> {
            Ok(())
        }

        fn commit(&self) -> Result<(), StorageError> {
            Ok(())
        }

        fn roll_back(&self) -> Result<(), StorageError> {
            Ok(())
        }

        fn in_transaction(&self) -> bool {
            false
        }

        fn last_insert_id(&self, sequence: Option<&str>) -> Result<EntityId, StorageError> {
            let last = self.last.lock().unwrap();
            Ok(match &*last {
                Some((seq, id)) if seq.as_deref() == sequence => EntityId::Int(*id),
                _ => EntityId::Int(0),
            })
        }
    }

    #[test]
    fn uuid_generator_is_pre_insert() {
        let generator = UuidIdGenerator::<()>::new();
        assert!(!generator.is_post_insert());
        let a = generator.generate(&()).unwrap();
        let b = generator.generate(&()).unwrap();
        assert!(a.as_uuid().is_some());
        assert_ne!(a, b);
        assert_eq!(generator.empty_value(&()), EntityId::Null);
    }

    #[test]
    fn sequence_generator_reads_named_sequence() {
        let connection = Arc::new(FixedConnection::default());
        *connection.last.lock().unwrap() = Some((Some("users_id_seq".into()), 41));

        let generator =
            SequenceIdGenerator::<()>::new(connection.clone()).with_sequence("users_id_seq");
        assert!(generator.is_post_insert());
        assert_eq!(generator.generate(&()).unwrap(), EntityId::Int(41));
        assert_eq!(generator.empty_value(&()), EntityId::Int(0));

        let unnamed = SequenceIdGenerator::<()>::new(connection);
        assert!(matches!(
            unnamed.generate(&()),
            Err(StorageError::NotFound(_))
        ));
    }
}
