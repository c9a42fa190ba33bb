use crate::error::RuntimeError;
use crate::types::EntityId;
use async_trait::async_trait;

/// Per-entity durable key-value persistence.
///
/// Committed state survives process restart. Each call is a single atomic
/// operation, so a failed turn leaves prior committed state intact. Keys are
/// scoped per entity; no two entities ever share a key.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Atomically create a key with an initial value if it does not exist.
    /// Returns `false` (without modifying anything) when the key already exists.
    async fn try_create(
        &self,
        entity_id: &EntityId,
        key: &str,
        initial: Vec<u8>,
    ) -> Result<bool, RuntimeError>;

    /// Read a key. Absence is `None`, never an error.
    async fn get(&self, entity_id: &EntityId, key: &str) -> Result<Option<Vec<u8>>, RuntimeError>;

    /// Overwrite a key, creating it if absent.
    async fn set(&self, entity_id: &EntityId, key: &str, value: Vec<u8>)
        -> Result<(), RuntimeError>;
}
