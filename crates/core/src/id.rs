//! Identifiers: persistent entity ids and in-memory object identities.

use core::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Persistent identifier of an entity.
///
/// Entity types choose their own identifier representation; the unit of work only
/// needs a value it can hash, compare and hand back to data mappers. Integer ids
/// (autoincrement / sequences), UUIDs and natural string keys are all supported.
///
/// `Null`, `Int(0)` and an empty `Text` are treated as "no id yet" (see [`EntityId::is_empty`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum EntityId {
    #[default]
    Null,
    Int(i64),
    Uuid(Uuid),
    Text(String),
}

impl EntityId {
    /// Returns `true` if this id marks an entity that has not been persisted yet.
    pub fn is_empty(&self) -> bool {
        match self {
            EntityId::Null => true,
            EntityId::Int(v) => *v == 0,
            EntityId::Uuid(_) => false,
            EntityId::Text(s) => s.is_empty(),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            EntityId::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<&Uuid> {
        match self {
            EntityId::Uuid(u) => Some(u),
            _ => None,
        }
    }

    /// Interpret a serialized field value as an id.
    ///
    /// Strings that parse as UUIDs become `Uuid` so that rows keyed from JSON and
    /// ids read through an accessor agree on the same key.
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::Null => Some(EntityId::Null),
            JsonValue::Number(n) => n.as_i64().map(EntityId::Int),
            JsonValue::String(s) => Some(s.parse().unwrap_or_else(|_| EntityId::Text(s.clone()))),
            _ => None,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            EntityId::Null => JsonValue::Null,
            EntityId::Int(v) => JsonValue::from(*v),
            EntityId::Uuid(u) => JsonValue::String(u.to_string()),
            EntityId::Text(s) => JsonValue::String(s.clone()),
        }
    }
}

impl core::fmt::Display for EntityId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            EntityId::Null => f.write_str("null"),
            EntityId::Int(v) => core::fmt::Display::fmt(v, f),
            EntityId::Uuid(u) => core::fmt::Display::fmt(u, f),
            EntityId::Text(s) => f.write_str(s),
        }
    }
}

impl FromStr for EntityId {
    type Err = core::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(v) = s.parse::<i64>() {
            return Ok(EntityId::Int(v));
        }
        if let Ok(u) = Uuid::from_str(s) {
            return Ok(EntityId::Uuid(u));
        }
        Ok(EntityId::Text(s.to_string()))
    }
}

macro_rules! impl_entity_id_from_int {
    ($($t:ty),*) => {
        $(
            impl From<$t> for EntityId {
                fn from(value: $t) -> Self {
                    EntityId::Int(i64::from(value))
                }
            }
        )*
    };
}

impl_entity_id_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<Uuid> for EntityId {
    fn from(value: Uuid) -> Self {
        EntityId::Uuid(value)
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        EntityId::Text(value)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        EntityId::Text(value.to_string())
    }
}

impl<T: Into<EntityId>> From<Option<T>> for EntityId {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(EntityId::Null)
    }
}

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// In-memory identity of one entity instance.
///
/// Allocated from a process-wide monotonic counter when a handle is created and
/// never reused, so it stays valid as a map key after the handle is dropped.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(u64);

impl ObjectId {
    pub(crate) fn next() -> Self {
        Self(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "#{}", self.0)
    }
}
