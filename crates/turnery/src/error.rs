use crate::types::{EntityId, RequestId};

/// Errors that can occur in the entity runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Processing was already started for this entity. Returned (never retried)
    /// when a second start request hits an entity whose counter state exists.
    #[error("processing already started for entity {entity_id}")]
    AlreadyStarted { entity_id: EntityId },

    /// A reminder fired before state was created. Expected and recoverable:
    /// the reminder handler treats it as a no-op skip.
    #[error("no state under key {key} for entity {entity_id}")]
    StateMissing { entity_id: EntityId, key: String },

    #[error("reminder registration error: {reason}")]
    RegistrationFailure {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("persistence error: {reason}")]
    PersistenceFailure {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("mailbox full for entity {entity_id}")]
    MailboxFull { entity_id: EntityId },

    /// The request's cancellation token fired. If the turn had already begun
    /// it still ran to completion; the caller learns of the cancellation only
    /// after the turn finished.
    #[error("request {request_id} cancelled")]
    Cancelled { request_id: RequestId },

    #[error("handler for entity {entity_id} panicked: {reason}")]
    HandlerPanicked { entity_id: EntityId, reason: String },

    #[error("runtime is shutting down")]
    ShuttingDown,

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}
