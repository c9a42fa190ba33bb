use crate::error::RuntimeError;
use crate::types::EntityId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A durable reminder record scoped to one entity.
///
/// At most one registration exists per (entity, name) pair at a time. Absence
/// of a named registration is the signal that the associated processing has
/// not started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderRegistration {
    pub name: String,
    /// Delay from registration to the first firing.
    pub due: Duration,
    /// Interval between subsequent firings.
    pub period: Duration,
}

/// A registration whose next fire instant has passed, drained by the pump.
#[derive(Debug, Clone)]
pub struct DueReminder {
    pub entity_id: EntityId,
    pub registration: ReminderRegistration,
}

/// Durable, replicated scheduling primitive.
///
/// Registration is idempotent-safe only if the caller checks existence first
/// (`lookup` before `register`). Firing is at-least-once: a drained
/// registration that fails delivery is simply picked up again on its next
/// period, so handlers must tolerate redelivery.
#[async_trait]
pub trait ReminderRegistry: Send + Sync {
    /// Look up a registration by name. Absence is `None`, never an error.
    async fn lookup(
        &self,
        entity_id: &EntityId,
        name: &str,
    ) -> Result<Option<ReminderRegistration>, RuntimeError>;

    /// Register a reminder. Replaces any existing registration with the same
    /// name, keeping the at-most-one-per-name invariant.
    async fn register(
        &self,
        entity_id: &EntityId,
        registration: ReminderRegistration,
    ) -> Result<(), RuntimeError>;

    /// Remove a registration. Removing an absent name is a no-op.
    async fn unregister(&self, entity_id: &EntityId, name: &str) -> Result<(), RuntimeError>;

    /// Drain all registrations due at or before `now`, advancing each drained
    /// registration's next fire instant to `now + period`.
    async fn due_reminders(&self, now: DateTime<Utc>) -> Result<Vec<DueReminder>, RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_serde_round_trip() {
        let reg = ReminderRegistration {
            name: "Reminder".to_string(),
            due: Duration::from_secs(60),
            period: Duration::from_secs(600),
        };
        let json = serde_json::to_string(&reg).unwrap();
        let back: ReminderRegistration = serde_json::from_str(&json).unwrap();
        assert_eq!(back, reg);
    }
}
