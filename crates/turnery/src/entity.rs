use crate::error::RuntimeError;
use crate::message::{CorrelationContext, FiredReminder};
use crate::reminder::ReminderRegistry;
use crate::state_store::StateStore;
use crate::types::{EntityId, RequestId};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Context provided to entity instances when they are activated.
#[derive(Clone)]
pub struct EntityContext {
    /// Identity of this entity instance.
    pub entity_id: EntityId,
    /// Durable key-value persistence scoped to this entity.
    pub state: Arc<dyn StateStore>,
    /// Durable reminder scheduling scoped to this entity.
    pub reminders: Arc<dyn ReminderRegistry>,
    /// Cancellation token for this instance's lifetime.
    pub cancellation: CancellationToken,
}

/// Defines an entity type and its behavior.
///
/// Users implement this trait to define an entity. The factory method
/// (`spawn`) creates one handler per entity identity, lazily on the first
/// operation addressed to that identity.
#[async_trait]
pub trait Entity: Send + Sync + 'static {
    /// Mailbox capacity for instances of this entity. None = use config default.
    fn mailbox_capacity(&self) -> Option<usize> {
        None
    }

    /// Create a handler instance for the given entity identity.
    /// The returned handler lives for the lifetime of the activation.
    async fn spawn(&self, ctx: EntityContext) -> Result<Box<dyn EntityHandler>, RuntimeError>;
}

/// Handles operations for a specific entity instance.
///
/// Every method runs under the turn scheduler: one call at a time per
/// instance, never concurrently, in arrival order.
#[async_trait]
pub trait EntityHandler: Send + Sync {
    /// Activation hook, invoked once per activation before the first turn.
    ///
    /// The default body is the base activation behavior; overrides may add
    /// diagnostics but must not mutate durable state, since activation repeats
    /// across process restarts for the same identity.
    async fn on_activate(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    /// Handle an external "start processing" request.
    async fn start_processing(
        &self,
        request_id: &RequestId,
        correlation: &CorrelationContext,
    ) -> Result<(), RuntimeError>;

    /// Handle a reminder firing. Delivery is at-least-once; unrecognized
    /// names must be ignored.
    async fn on_reminder(&self, fire: &FiredReminder) -> Result<(), RuntimeError>;
}
