use std::sync::{Arc, Mutex};

use forgeorm_core::{Connection, DataMapper, Entity, EntityId, IdGenerator, StorageError};

use super::r#trait::Cache;

enum CacheWrite<T> {
    Put(EntityId, T),
    Evict(EntityId),
}

/// Write-through-on-commit cache in front of a source mapper.
///
/// - `add`/`update`/`delete` hit the source immediately and stage the matching cache write.
/// - `after_commit` applies staged writes; `after_rollback` drops them.
/// - `get_by_id` serves from the cache and fills it from the source on a miss.
/// - While `connection` has a transaction open, `get_by_id` reads the source (which sees the
///   transaction's own writes) and stages the fill like any other write.
///
/// Entities added without an id yet (post-insert ids) are not staged; they are cached on
/// their first read.
pub struct CachedDataMapper<T, M, C> {
    source: M,
    cache: C,
    connection: Arc<dyn Connection>,
    id_of: Box<dyn Fn(&T) -> EntityId + Send + Sync>,
    staged: Mutex<Vec<CacheWrite<T>>>,
}

impl<T, M, C> CachedDataMapper<T, M, C>
where
    T: Entity,
    M: DataMapper<T>,
    C: Cache<T>,
{
    /// `connection` must be the one the source mapper writes through.
    pub fn new(
        source: M,
        cache: C,
        connection: Arc<dyn Connection>,
        id_of: impl Fn(&T) -> EntityId + Send + Sync + 'static,
    ) -> Self {
        Self {
            source,
            cache,
            connection,
            id_of: Box::new(id_of),
            staged: Mutex::new(Vec::new()),
        }
    }

    pub fn source(&self) -> &M {
        &self.source
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// Cache writes waiting for the next commit.
    pub fn staged_writes(&self) -> usize {
        self.staged.lock().map(|staged| staged.len()).unwrap_or(0)
    }

    fn stage(&self, write: CacheWrite<T>) -> Result<(), StorageError> {
        self.staged
            .lock()
            .map_err(|_| StorageError::transaction("cache staging lock poisoned"))?
            .push(write);
        Ok(())
    }
}

impl<T, M, C> DataMapper<T> for CachedDataMapper<T, M, C>
where
    T: Entity,
    M: DataMapper<T>,
    C: Cache<T>,
{
    fn add(&self, entity: &T) -> Result<(), StorageError> {
        self.source.add(entity)?;
        let id = (self.id_of)(entity);
        if id.is_empty() {
            return Ok(());
        }
        self.stage(CacheWrite::Put(id, entity.clone()))
    }

    fn update(&self, entity: &T) -> Result<(), StorageError> {
        self.source.update(entity)?;
        self.stage(CacheWrite::Put((self.id_of)(entity), entity.clone()))
    }

    fn delete(&self, entity: &T) -> Result<(), StorageError> {
        self.source.delete(entity)?;
        self.stage(CacheWrite::Evict((self.id_of)(entity)))
    }

    fn get_by_id(&self, id: &EntityId) -> Result<Option<T>, StorageError> {
        if self.connection.in_transaction() {
            let loaded = self.source.get_by_id(id)?;
            if let Some(entity) = &loaded {
                self.stage(CacheWrite::Put(id.clone(), entity.clone()))?;
            }
            return Ok(loaded);
        }

        if let Some(hit) = self.cache.get(id) {
            return Ok(Some(hit));
        }
        let loaded = self.source.get_by_id(id)?;
        if let Some(entity) = &loaded {
            self.cache.put(id.clone(), entity.clone());
        }
        Ok(loaded)
    }

    fn get_all(&self) -> Result<Vec<T>, StorageError> {
        self.source.get_all()
    }

    fn id_generator(&self) -> Option<&dyn IdGenerator<T>> {
        self.source.id_generator()
    }

    fn after_commit(&self) -> Result<(), StorageError> {
        self.source.after_commit()?;

        let writes = std::mem::take(
            &mut *self
                .staged
                .lock()
                .map_err(|_| StorageError::transaction("cache staging lock poisoned"))?,
        );
        let applied = writes.len();
        for write in writes {
            match write {
                CacheWrite::Put(id, entity) => self.cache.put(id, entity),
                CacheWrite::Evict(id) => self.cache.evict(&id),
            }
        }
        tracing::debug!(entity_type = T::TYPE_NAME, applied, "cache writes applied");
        Ok(())
    }

    fn after_rollback(&self) {
        self.source.after_rollback();
        if let Ok(mut staged) = self.staged.lock() {
            let discarded = staged.len();
            staged.clear();
            tracing::debug!(entity_type = T::TYPE_NAME, discarded, "cache writes discarded");
        }
    }
}
