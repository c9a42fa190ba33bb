//! Durable single-turn entity runtime.
//!
//! Models addressable, stateful entities with serialized ("single-turn")
//! execution: all operations on one entity identity run one at a time, in
//! arrival order, while distinct identities run fully in parallel. Durable
//! counter state and recurring reminders live in two collaborator traits
//! ([`state_store::StateStore`] and [`reminder::ReminderRegistry`]) with
//! in-memory reference backends under [`storage`].
//!
//! The [`runtime::EntityRuntime`] facade wires one [`entity::Entity`]
//! definition to the collaborators, runs the reminder delivery pump, and
//! exposes the entity-facing request API. [`processor::Processor`] is the
//! reference entity: started exactly once per identity, then advanced by
//! reminder firings. Reminder delivery is at-least-once and deliberately
//! undeduplicated; handlers must tolerate redelivery.

pub mod config;
pub mod entity;
pub mod error;
pub mod message;
pub mod metrics;
pub mod processor;
pub mod reminder;
pub mod runtime;
pub mod scheduler;
pub mod state_store;
pub mod storage;
pub mod testing;
pub mod types;

/// Prelude module for convenient glob imports.
pub mod prelude {
    pub use crate::config::RuntimeConfig;
    pub use crate::entity::{Entity, EntityContext, EntityHandler};
    pub use crate::error::RuntimeError;
    pub use crate::message::{CorrelationContext, FiredReminder};
    pub use crate::reminder::{ReminderRegistration, ReminderRegistry};
    pub use crate::runtime::EntityRuntime;
    pub use crate::state_store::StateStore;
    pub use crate::types::{EntityId, RequestId};
}
