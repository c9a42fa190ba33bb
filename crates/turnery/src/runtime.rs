use crate::config::RuntimeConfig;
use crate::entity::Entity;
use crate::error::RuntimeError;
use crate::message::{CorrelationContext, FiredReminder, Operation};
use crate::metrics::RuntimeMetrics;
use crate::reminder::ReminderRegistry;
use crate::scheduler::EntityScheduler;
use crate::state_store::StateStore;
use crate::types::{EntityId, RequestId};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

/// The runtime facade: one entity definition wired to its collaborators.
///
/// Owns the turn scheduler and the reminder delivery pump, and exposes the
/// entity-facing request API. Construct with [`EntityRuntime::new`], then call
/// [`start`](Self::start) to begin pumping reminder firings.
pub struct EntityRuntime {
    scheduler: EntityScheduler,
    reminders: Arc<dyn ReminderRegistry>,
    config: RuntimeConfig,
    metrics: Arc<RuntimeMetrics>,
    cancel: CancellationToken,
    pump_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
    /// Synthesizes a distinct request id per firing for trace correlation.
    reminder_sequence: AtomicU64,
    shutdown_started: AtomicBool,
}

impl EntityRuntime {
    /// Build a runtime over the given entity and collaborators.
    ///
    /// Configuration is validated here; nothing reads ambient globals.
    pub fn new(
        entity: Arc<dyn Entity>,
        state: Arc<dyn StateStore>,
        reminders: Arc<dyn ReminderRegistry>,
        config: RuntimeConfig,
        metrics: Arc<RuntimeMetrics>,
    ) -> Result<Arc<Self>, RuntimeError> {
        config.validate()?;
        let scheduler = EntityScheduler::new(
            entity,
            state,
            Arc::clone(&reminders),
            config.clone(),
            Arc::clone(&metrics),
        );
        Ok(Arc::new(Self {
            scheduler,
            reminders,
            config,
            metrics,
            cancel: CancellationToken::new(),
            pump_handle: parking_lot::Mutex::new(None),
            reminder_sequence: AtomicU64::new(0),
            shutdown_started: AtomicBool::new(false),
        }))
    }

    /// Spawn the reminder delivery pump. Idempotent; a second call is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.pump_handle.lock();
        if guard.is_some() {
            return;
        }
        let runtime = Arc::clone(self);
        *guard = Some(tokio::spawn(async move { runtime.pump_loop().await }));
    }

    /// Entity-facing request API: transition an entity to "started exactly
    /// once". A second call on a started entity fails with `AlreadyStarted`.
    #[instrument(skip(self, correlation, cancellation), fields(
        entity_id = %entity_id,
        request_id = %request_id,
    ))]
    pub async fn start_processing(
        &self,
        entity_id: &EntityId,
        request_id: RequestId,
        correlation: CorrelationContext,
        cancellation: Option<CancellationToken>,
    ) -> Result<(), RuntimeError> {
        self.scheduler
            .run_turn(
                entity_id,
                request_id,
                Operation::StartProcessing { correlation },
                cancellation,
            )
            .await
    }

    /// The Timer Registry's delivery edge, used by the pump and directly by
    /// tests. At-least-once: a failed delivery is not retried here; the
    /// periodic schedule makes the registry re-fire on the next period.
    pub async fn deliver_reminder(
        &self,
        entity_id: &EntityId,
        fire: FiredReminder,
    ) -> Result<(), RuntimeError> {
        let sequence = self.reminder_sequence.fetch_add(1, Ordering::Relaxed);
        let request_id = RequestId::new(format!("reminder-{}-{sequence}", fire.name));
        self.metrics.reminder_firings.inc();
        self.scheduler
            .run_turn(entity_id, request_id, Operation::Reminder { fire }, None)
            .await
    }

    /// Number of live (activated) entity instances.
    pub fn active_entities(&self) -> usize {
        self.scheduler.active_count()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_started.load(Ordering::Acquire)
    }

    /// Stop the pump, drain entity inboxes within `termination_timeout`, and
    /// tear down instances. Idempotent. Durable state is untouched.
    pub async fn shutdown(&self) {
        if self.shutdown_started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        let handle = { self.pump_handle.lock().take() };
        if let Some(handle) = handle {
            if handle.await.is_err() {
                warn!("reminder pump task panicked during shutdown");
            }
        }
        self.scheduler.shutdown().await;
    }

    /// Background loop: poll the registry for due registrations and post one
    /// reminder turn per drained registration onto the owning entity's inbox.
    async fn pump_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.reminder_poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    let due = match self.reminders.due_reminders(Utc::now()).await {
                        Ok(due) => due,
                        Err(e) => {
                            warn!(error = %e, "failed to poll due reminders");
                            continue;
                        }
                    };
                    for item in due {
                        let fire = FiredReminder {
                            name: item.registration.name.clone(),
                            context: Vec::new(),
                            due: item.registration.due,
                            period: item.registration.period,
                        };
                        if let Err(e) = self.deliver_reminder(&item.entity_id, fire).await {
                            warn!(
                                entity_id = %item.entity_id,
                                name = %item.registration.name,
                                error = %e,
                                "reminder delivery failed, registry will re-fire next period"
                            );
                        }
                    }
                }
            }
        }
    }
}
