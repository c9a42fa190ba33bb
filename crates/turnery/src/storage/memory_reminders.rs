use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::RuntimeError;
use crate::reminder::{DueReminder, ReminderRegistration, ReminderRegistry};
use crate::types::EntityId;

/// In-memory reminder registry.
///
/// Tracks the next fire instant per registration for the delivery pump; that
/// bookkeeping is internal and not part of the registration contract.
pub struct MemoryReminderRegistry {
    inner: Mutex<Inner>,
}

struct Inner {
    registrations: HashMap<(EntityId, String), StoredRegistration>,
}

struct StoredRegistration {
    registration: ReminderRegistration,
    next_fire: DateTime<Utc>,
    period: chrono::Duration,
}

fn to_chrono(duration: Duration, field: &str) -> Result<chrono::Duration, RuntimeError> {
    chrono::Duration::from_std(duration).map_err(|e| RuntimeError::RegistrationFailure {
        reason: format!("{field} out of range: {e}"),
        source: Some(Box::new(e)),
    })
}

impl MemoryReminderRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                registrations: HashMap::new(),
            }),
        }
    }

    /// Number of live registrations across all entities.
    pub fn len(&self) -> usize {
        self.inner.lock().registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().registrations.is_empty()
    }
}

impl Default for MemoryReminderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReminderRegistry for MemoryReminderRegistry {
    async fn lookup(
        &self,
        entity_id: &EntityId,
        name: &str,
    ) -> Result<Option<ReminderRegistration>, RuntimeError> {
        let inner = self.inner.lock();
        Ok(inner
            .registrations
            .get(&(entity_id.clone(), name.to_string()))
            .map(|stored| stored.registration.clone()))
    }

    async fn register(
        &self,
        entity_id: &EntityId,
        registration: ReminderRegistration,
    ) -> Result<(), RuntimeError> {
        let due = to_chrono(registration.due, "due")?;
        let period = to_chrono(registration.period, "period")?;
        let mut inner = self.inner.lock();
        inner.registrations.insert(
            (entity_id.clone(), registration.name.clone()),
            StoredRegistration {
                registration,
                next_fire: Utc::now() + due,
                period,
            },
        );
        Ok(())
    }

    async fn unregister(&self, entity_id: &EntityId, name: &str) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock();
        inner
            .registrations
            .remove(&(entity_id.clone(), name.to_string()));
        Ok(())
    }

    async fn due_reminders(&self, now: DateTime<Utc>) -> Result<Vec<DueReminder>, RuntimeError> {
        let mut inner = self.inner.lock();
        let mut due = Vec::new();
        for ((entity_id, _name), stored) in inner.registrations.iter_mut() {
            if stored.next_fire <= now {
                stored.next_fire = now + stored.period;
                due.push(DueReminder {
                    entity_id: entity_id.clone(),
                    registration: stored.registration.clone(),
                });
            }
        }
        Ok(due)
    }
}
