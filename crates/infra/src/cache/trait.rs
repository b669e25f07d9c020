use std::sync::Arc;

use forgeorm_core::EntityId;

/// Key/value cache of entities by persistent id.
pub trait Cache<T>: Send + Sync {
    fn get(&self, id: &EntityId) -> Option<T>;
    fn put(&self, id: EntityId, value: T);
    fn evict(&self, id: &EntityId);
    fn clear(&self);
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T, C> Cache<T> for Arc<C>
where
    C: Cache<T> + ?Sized,
{
    fn get(&self, id: &EntityId) -> Option<T> {
        (**self).get(id)
    }

    fn put(&self, id: EntityId, value: T) {
        (**self).put(id, value)
    }

    fn evict(&self, id: &EntityId) {
        (**self).evict(id)
    }

    fn clear(&self) {
        (**self).clear()
    }

    fn len(&self) -> usize {
        (**self).len()
    }
}
