use std::collections::HashMap;
use std::sync::RwLock;

use forgeorm_core::EntityId;

use super::r#trait::Cache;

/// In-memory cache for tests/dev.
#[derive(Debug)]
pub struct InMemoryCache<T> {
    inner: RwLock<HashMap<EntityId, T>>,
}

impl<T> InMemoryCache<T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> Default for InMemoryCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Cache<T> for InMemoryCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn get(&self, id: &EntityId) -> Option<T> {
        let map = self.inner.read().ok()?;
        map.get(id).cloned()
    }

    fn put(&self, id: EntityId, value: T) {
        if let Ok(mut map) = self.inner.write() {
            map.insert(id, value);
        }
    }

    fn evict(&self, id: &EntityId) {
        if let Ok(mut map) = self.inner.write() {
            map.remove(id);
        }
    }

    fn clear(&self) {
        if let Ok(mut map) = self.inner.write() {
            map.clear();
        }
    }

    fn len(&self) -> usize {
        self.inner.read().map(|map| map.len()).unwrap_or(0)
    }
}
