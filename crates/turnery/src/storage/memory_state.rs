use crate::error::RuntimeError;
use crate::state_store::StateStore;
use crate::types::EntityId;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// In-memory state store.
///
/// `try_create` is atomic via the map's entry API, which is the whole point
/// of the primitive: concurrent creators observe exactly one winner.
pub struct MemoryStateStore {
    entries: DashMap<(EntityId, String), Vec<u8>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Number of stored keys across all entities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn try_create(
        &self,
        entity_id: &EntityId,
        key: &str,
        initial: Vec<u8>,
    ) -> Result<bool, RuntimeError> {
        match self.entries.entry((entity_id.clone(), key.to_string())) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(vacant) => {
                vacant.insert(initial);
                Ok(true)
            }
        }
    }

    async fn get(&self, entity_id: &EntityId, key: &str) -> Result<Option<Vec<u8>>, RuntimeError> {
        Ok(self
            .entries
            .get(&(entity_id.clone(), key.to_string()))
            .map(|value| value.clone()))
    }

    async fn set(
        &self,
        entity_id: &EntityId,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(), RuntimeError> {
        self.entries.insert((entity_id.clone(), key.to_string()), value);
        Ok(())
    }
}
