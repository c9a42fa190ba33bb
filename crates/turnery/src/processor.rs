use crate::entity::{Entity, EntityContext, EntityHandler};
use crate::error::RuntimeError;
use crate::message::{CorrelationContext, FiredReminder};
use crate::reminder::ReminderRegistration;
use crate::types::RequestId;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Name of the recurring reminder that advances the counter.
pub const REMINDER_NAME: &str = "Reminder";

/// State key holding the durable counter.
pub const COUNT_KEY: &str = "Count";

/// Timing settings for the processor's reminder, injected at construction.
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    /// Delay before the first reminder firing. Default: 1 minute.
    pub reminder_due: Duration,
    /// Interval between firings. Default: 10 minutes.
    pub reminder_period: Duration,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            reminder_due: Duration::from_secs(60),
            reminder_period: Duration::from_secs(600),
        }
    }
}

/// The reference entity: a durable counter advanced by reminder firings.
///
/// `start_processing` transitions an entity from "not started" to "started
/// exactly once"; each matching reminder firing then increments the counter
/// by one. Redelivered firings increment again; no de-duplication is done.
pub struct Processor {
    settings: ProcessorSettings,
}

impl Processor {
    pub fn new(settings: ProcessorSettings) -> Self {
        Self { settings }
    }
}

impl Default for Processor {
    fn default() -> Self {
        Self::new(ProcessorSettings::default())
    }
}

#[async_trait]
impl Entity for Processor {
    async fn spawn(&self, ctx: EntityContext) -> Result<Box<dyn EntityHandler>, RuntimeError> {
        Ok(Box::new(ProcessorHandler {
            ctx,
            settings: self.settings.clone(),
        }))
    }
}

struct ProcessorHandler {
    ctx: EntityContext,
    settings: ProcessorSettings,
}

fn encode_count(count: u64) -> Result<Vec<u8>, RuntimeError> {
    rmp_serde::to_vec(&count).map_err(|e| RuntimeError::PersistenceFailure {
        reason: format!("failed to encode counter: {e}"),
        source: Some(Box::new(e)),
    })
}

fn decode_count(bytes: &[u8]) -> Result<u64, RuntimeError> {
    rmp_serde::from_slice(bytes).map_err(|e| RuntimeError::PersistenceFailure {
        reason: format!("failed to decode counter: {e}"),
        source: Some(Box::new(e)),
    })
}

impl ProcessorHandler {
    async fn read_count(&self) -> Result<u64, RuntimeError> {
        match self.ctx.state.get(&self.ctx.entity_id, COUNT_KEY).await? {
            Some(bytes) => decode_count(&bytes),
            None => Err(RuntimeError::StateMissing {
                entity_id: self.ctx.entity_id.clone(),
                key: COUNT_KEY.to_string(),
            }),
        }
    }
}

#[async_trait]
impl EntityHandler for ProcessorHandler {
    async fn on_activate(&self) -> Result<(), RuntimeError> {
        // Diagnostics only. Activation repeats across restarts, so nothing
        // durable may happen here.
        debug!(entity_id = %self.ctx.entity_id, "processor activated");
        Ok(())
    }

    async fn start_processing(
        &self,
        request_id: &RequestId,
        _correlation: &CorrelationContext,
    ) -> Result<(), RuntimeError> {
        let entity_id = &self.ctx.entity_id;

        // Lookup-before-register keeps repeated starts from duplicating the
        // timer: registration is skipped when one already exists.
        if self
            .ctx
            .reminders
            .lookup(entity_id, REMINDER_NAME)
            .await?
            .is_none()
        {
            self.ctx
                .reminders
                .register(
                    entity_id,
                    ReminderRegistration {
                        name: REMINDER_NAME.to_string(),
                        due: self.settings.reminder_due,
                        period: self.settings.reminder_period,
                    },
                )
                .await?;
        }

        // Create-if-absent is the idempotency guard: under turn serialization
        // this makes check-and-create atomic per entity, so at most one start
        // ever succeeds and a later start never resets the counter.
        let created = self
            .ctx
            .state
            .try_create(entity_id, COUNT_KEY, encode_count(0)?)
            .await?;
        if !created {
            return Err(RuntimeError::AlreadyStarted {
                entity_id: entity_id.clone(),
            });
        }

        tracing::info!(
            entity_id = %entity_id,
            request_id = %request_id,
            "processing started"
        );
        Ok(())
    }

    async fn on_reminder(&self, fire: &FiredReminder) -> Result<(), RuntimeError> {
        // Unrecognized names are a forward-compatible no-op.
        if !fire.name.eq_ignore_ascii_case(REMINDER_NAME) {
            debug!(
                entity_id = %self.ctx.entity_id,
                name = %fire.name,
                "ignoring unrecognized reminder"
            );
            return Ok(());
        }

        let current = match self.read_count().await {
            Ok(count) => count,
            // A firing racing with start, a stray registration, or redelivery
            // after an external state reset: skip rather than fail.
            Err(RuntimeError::StateMissing { .. }) => {
                debug!(
                    entity_id = %self.ctx.entity_id,
                    "reminder fired before processing started, skipping"
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.ctx
            .state
            .set(&self.ctx.entity_id, COUNT_KEY, encode_count(current + 1)?)
            .await
    }
}
