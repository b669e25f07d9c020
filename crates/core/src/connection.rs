//! Transactional connection boundary.

use std::sync::Arc;

use crate::error::StorageError;
use crate::id::EntityId;

/// Connection the unit of work drives a commit through.
///
/// The unit of work only controls the transaction (`begin → commit | roll_back`);
/// the actual writes go through data mappers, which are expected to share the same
/// underlying connection.
pub trait Connection: Send + Sync {
    fn begin_transaction(&self) -> Result<(), StorageError>;

    fn commit(&self) -> Result<(), StorageError>;

    fn roll_back(&self) -> Result<(), StorageError>;

    fn in_transaction(&self) -> bool;

    /// Id generated by the most recent insert, optionally for a named sequence.
    fn last_insert_id(&self, sequence: Option<&str>) -> Result<EntityId, StorageError>;
}

impl<C> Connection for Arc<C>
where
    C: Connection + ?Sized,
{
    fn begin_transaction(&self) -> Result<(), StorageError> {
        (**self).begin_transaction()
    }

    fn commit(&self) -> Result<(), StorageError> {
        (**self).commit()
    }

    fn roll_back(&self) -> Result<(), StorageError> {
        (**self).roll_back()
    }

    fn in_transaction(&self) -> bool {
        (**self).in_transaction()
    }

    fn last_insert_id(&self, sequence: Option<&str>) -> Result<EntityId, StorageError> {
        (**self).last_insert_id(sequence)
    }
}
