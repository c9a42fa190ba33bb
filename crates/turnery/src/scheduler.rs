use crate::config::RuntimeConfig;
use crate::entity::{Entity, EntityContext, EntityHandler};
use crate::error::RuntimeError;
use crate::message::{Operation, TurnRequest};
use crate::metrics::RuntimeMetrics;
use crate::reminder::ReminderRegistry;
use crate::state_store::StateStore;
use crate::types::{EntityId, RequestId};
use dashmap::DashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

/// Per-identity spawn lock to prevent double-activation races.
///
/// When two concurrent first-operations arrive for a new entity, both miss
/// the `instances.get()` fast path. Without serialization, both would call
/// `entity.spawn()` and run the activation hook twice. This lock ensures only
/// one task performs the activation while the other waits and then uses the
/// result.
type SpawnLocks = DashMap<EntityId, Arc<Mutex<()>>>;

/// Enforces the single-entity turn model.
///
/// All operations addressed to one entity identity execute one at a time, in
/// arrival order, to completion, regardless of whether they originate from
/// external requests or reminder firings. Distinct identities run fully in
/// parallel. Instances are activated lazily on the first operation.
pub struct EntityScheduler {
    entity: Arc<dyn Entity>,
    state: Arc<dyn StateStore>,
    reminders: Arc<dyn ReminderRegistry>,
    instances: Arc<DashMap<EntityId, Arc<EntityInstance>>>,
    spawn_locks: Arc<SpawnLocks>,
    config: RuntimeConfig,
    metrics: Arc<RuntimeMetrics>,
    /// Whether the scheduler is in "closing" state. New turns are rejected
    /// with `ShuttingDown`; queued turns still drain.
    closing: AtomicBool,
}

/// A live entity instance with its handler and lifecycle state.
struct EntityInstance {
    /// Behind an `RwLock<Arc<...>>` so panic recovery can swap in a fresh
    /// handler (write lock) while the mailbox loop clones for dispatch
    /// (read lock).
    handler: RwLock<Arc<dyn EntityHandler>>,
    /// Accepted-but-not-yet-completed turns. Incremented on enqueue,
    /// decremented when the turn's outcome is reported.
    active_turns: AtomicUsize,
    cancel: CancellationToken,
    /// Uses an unbounded channel; capacity is enforced by checking
    /// `active_turns` against `mailbox_capacity` before sending.
    mailbox_tx: mpsc::UnboundedSender<TurnRequest>,
    mailbox_capacity: usize,
    /// JoinHandle for the mailbox task, awaited during shutdown.
    ///
    /// `parking_lot::Mutex` so the handle can be stored synchronously right
    /// after `tokio::spawn`, eliminating the race where the spawned task
    /// completes before the handle is stored.
    join_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

enum TurnOutcome {
    Completed(Result<(), RuntimeError>),
    Panicked(String),
}

impl EntityScheduler {
    pub fn new(
        entity: Arc<dyn Entity>,
        state: Arc<dyn StateStore>,
        reminders: Arc<dyn ReminderRegistry>,
        config: RuntimeConfig,
        metrics: Arc<RuntimeMetrics>,
    ) -> Self {
        Self {
            entity,
            state,
            reminders,
            instances: Arc::new(DashMap::new()),
            spawn_locks: Arc::new(DashMap::new()),
            config,
            metrics,
            closing: AtomicBool::new(false),
        }
    }

    /// Execute one operation as a turn against the given entity, activating
    /// the entity if needed, and await its outcome.
    ///
    /// The outcome is whatever the handler returned, or `Cancelled` /
    /// `HandlerPanicked` / `MailboxFull` / `ShuttingDown` from the turn
    /// machinery itself. A faulted turn is never retried here; subsequent
    /// queued turns proceed regardless.
    #[instrument(skip(self, operation, cancellation), fields(
        entity_id = %entity_id,
        request_id = %request_id,
        tag = operation.tag(),
    ))]
    pub async fn run_turn(
        &self,
        entity_id: &EntityId,
        request_id: RequestId,
        operation: Operation,
        cancellation: Option<CancellationToken>,
    ) -> Result<(), RuntimeError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(RuntimeError::ShuttingDown);
        }

        let (completion, outcome_rx) = oneshot::channel();
        let turn = TurnRequest {
            request_id: request_id.clone(),
            operation,
            cancellation,
            completion,
        };
        self.enqueue(entity_id, turn).await?;

        match outcome_rx.await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    entity_id = %entity_id,
                    request_id = %request_id,
                    "turn observer channel closed without an outcome"
                );
                Err(RuntimeError::ShuttingDown)
            }
        }
    }

    /// Transition to "closing" and drain.
    ///
    /// Queued and in-flight turns are given `termination_timeout` to finish,
    /// then instance tasks are cancelled and awaited. Idempotent.
    pub async fn shutdown(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }

        let timeout = self.config.termination_timeout;
        if !timeout.is_zero() {
            let drain_check = async {
                loop {
                    let drained = self
                        .instances
                        .iter()
                        .all(|entry| entry.value().active_turns.load(Ordering::Acquire) == 0);
                    if drained {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            };
            let _ = tokio::time::timeout(timeout, drain_check).await;
        }

        let removed: Vec<Arc<EntityInstance>> = self
            .instances
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for instance in &removed {
            instance.cancel.cancel();
        }

        let mut handles = Vec::new();
        for instance in &removed {
            let handle_opt = { instance.join_handle.lock().take() };
            if let Some(handle) = handle_opt {
                handles.push(handle);
            }
        }
        if !handles.is_empty() {
            let await_all = futures::future::join_all(handles);
            if tokio::time::timeout(Duration::from_secs(5), await_all)
                .await
                .is_err()
            {
                warn!("timed out waiting for entity tasks to exit during shutdown");
            }
        }
    }

    /// Get the number of live entity instances.
    pub fn active_count(&self) -> usize {
        self.instances.len()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    async fn enqueue(&self, entity_id: &EntityId, turn: TurnRequest) -> Result<(), RuntimeError> {
        let instance = self.get_or_spawn(entity_id).await?;

        if instance.active_turns.load(Ordering::Acquire) >= instance.mailbox_capacity {
            return Err(RuntimeError::MailboxFull {
                entity_id: entity_id.clone(),
            });
        }

        // Increment before sending so concurrent enqueues see the updated
        // count immediately (no race window).
        instance.active_turns.fetch_add(1, Ordering::Release);
        match instance.mailbox_tx.send(turn) {
            Ok(()) => Ok(()),
            Err(rejected) => {
                // Instance task already exited (evicted); retry once on a
                // fresh instance. Whichever remove wins the race with the
                // task's own cleanup decrements the gauge.
                instance.active_turns.fetch_sub(1, Ordering::Release);
                if self.instances.remove(entity_id).is_some() {
                    self.spawn_locks.remove(entity_id);
                    self.metrics.entities.dec();
                }

                let instance = self.get_or_spawn(entity_id).await?;
                if instance.active_turns.load(Ordering::Acquire) >= instance.mailbox_capacity {
                    return Err(RuntimeError::MailboxFull {
                        entity_id: entity_id.clone(),
                    });
                }
                instance.active_turns.fetch_add(1, Ordering::Release);
                match instance.mailbox_tx.send(rejected.0) {
                    Ok(()) => Ok(()),
                    Err(_) => {
                        instance.active_turns.fetch_sub(1, Ordering::Release);
                        warn!(
                            entity_id = %entity_id,
                            "entity mailbox closed immediately after re-activation"
                        );
                        Err(RuntimeError::ShuttingDown)
                    }
                }
            }
        }
    }

    #[instrument(skip(self), fields(entity_id = %entity_id))]
    async fn get_or_spawn(&self, entity_id: &EntityId) -> Result<Arc<EntityInstance>, RuntimeError> {
        // Fast path: instance already exists
        if let Some(entry) = self.instances.get(entity_id) {
            return Ok(Arc::clone(entry.value()));
        }

        // Slow path: acquire per-identity spawn lock to prevent double-activation.
        let lock = self
            .spawn_locks
            .entry(entity_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Re-check after acquiring lock — another task may have activated it
        if let Some(entry) = self.instances.get(entity_id) {
            return Ok(Arc::clone(entry.value()));
        }

        let ctx = EntityContext {
            entity_id: entity_id.clone(),
            state: Arc::clone(&self.state),
            reminders: Arc::clone(&self.reminders),
            cancellation: CancellationToken::new(),
        };
        let cancel = ctx.cancellation.clone();

        let handler = match Self::activate(&self.entity, ctx.clone()).await {
            Ok(handler) => handler,
            Err(e) => {
                // Clean up the spawn lock so a later operation can retry
                // activation instead of hitting a stale entry.
                self.spawn_locks.remove(entity_id);
                return Err(e);
            }
        };

        let mailbox_capacity = self
            .entity
            .mailbox_capacity()
            .unwrap_or(self.config.mailbox_capacity);

        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();

        let instance = Arc::new(EntityInstance {
            handler: RwLock::new(handler),
            active_turns: AtomicUsize::new(0),
            cancel: cancel.clone(),
            mailbox_tx,
            mailbox_capacity,
            join_handle: parking_lot::Mutex::new(None),
        });

        // Insert into the instances map BEFORE spawning the mailbox task, so
        // the task's exit cleanup can never race ahead of the insert and
        // leave a stale entry.
        self.instances
            .insert(entity_id.clone(), Arc::clone(&instance));
        self.metrics.entities.inc();

        let instance_for_loop = Arc::clone(&instance);
        let entity = Arc::clone(&self.entity);
        let metrics = Arc::clone(&self.metrics);
        let metrics_for_cleanup = Arc::clone(&self.metrics);
        let instances_ref = Arc::clone(&self.instances);
        let spawn_locks_ref = Arc::clone(&self.spawn_locks);
        let entity_id_clone = entity_id.clone();
        let handle = tokio::spawn(async move {
            Self::process_mailbox(instance_for_loop, mailbox_rx, cancel, entity, ctx, metrics)
                .await;

            // Clean up when the mailbox loop exits (eviction or shutdown).
            if instances_ref.remove(&entity_id_clone).is_some() {
                spawn_locks_ref.remove(&entity_id_clone);
                metrics_for_cleanup.entities.dec();
            }
        });

        // Store the JoinHandle synchronously so shutdown can await task exit.
        *instance.join_handle.lock() = Some(handle);

        Ok(instance)
    }

    /// Build a handler and run its activation hook.
    ///
    /// Activation performs no durable state mutation, so it may repeat across
    /// process restarts and panic recoveries for the same identity.
    async fn activate(
        entity: &Arc<dyn Entity>,
        ctx: EntityContext,
    ) -> Result<Arc<dyn EntityHandler>, RuntimeError> {
        let entity_id = ctx.entity_id.clone();
        tracing::debug!(entity_id = %entity_id, "activating entity instance");
        let handler: Arc<dyn EntityHandler> = Arc::from(entity.spawn(ctx).await?);
        handler.on_activate().await?;
        Ok(handler)
    }

    /// Serial mailbox loop: the turn property lives here. One turn at a time,
    /// FIFO, each run to completion (including its I/O) before the next starts.
    async fn process_mailbox(
        instance: Arc<EntityInstance>,
        mut mailbox_rx: mpsc::UnboundedReceiver<TurnRequest>,
        cancel: CancellationToken,
        entity: Arc<dyn Entity>,
        ctx: EntityContext,
        metrics: Arc<RuntimeMetrics>,
    ) {
        let entity_id = ctx.entity_id.clone();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    Self::drain_failing(&instance, &mut mailbox_rx, || RuntimeError::ShuttingDown)
                        .await;
                    break;
                }
                turn = mailbox_rx.recv() => {
                    let Some(turn) = turn else { break };

                    // Cancelled before its turn began: abandon without starting.
                    if turn
                        .cancellation
                        .as_ref()
                        .is_some_and(|token| token.is_cancelled())
                    {
                        instance.active_turns.fetch_sub(1, Ordering::Release);
                        let _ = turn.completion.send(Err(RuntimeError::Cancelled {
                            request_id: turn.request_id,
                        }));
                        continue;
                    }

                    metrics.turns.inc();
                    let outcome = Self::execute_turn(&instance, &turn).await;

                    let result = match outcome {
                        TurnOutcome::Completed(result) => result,
                        TurnOutcome::Panicked(reason) => {
                            tracing::error!(
                                entity_id = %entity_id,
                                request_id = %turn.request_id,
                                panic_info = %reason,
                                "entity handler panicked during turn"
                            );
                            // Re-activate a fresh handler so subsequent turns
                            // still run. Durable state is untouched.
                            match Self::activate(&entity, ctx.clone()).await {
                                Ok(new_handler) => {
                                    let mut guard = instance.handler.write().await;
                                    *guard = new_handler;
                                    Err(RuntimeError::HandlerPanicked {
                                        entity_id: entity_id.clone(),
                                        reason,
                                    })
                                }
                                Err(spawn_err) => {
                                    // Evict: fail this turn and everything queued,
                                    // then exit so the next operation re-activates.
                                    warn!(
                                        entity_id = %entity_id,
                                        error = %spawn_err,
                                        "re-activation failed after panic, evicting entity"
                                    );
                                    metrics.turn_failures.inc();
                                    instance.active_turns.fetch_sub(1, Ordering::Release);
                                    let _ = turn.completion.send(Err(
                                        RuntimeError::HandlerPanicked {
                                            entity_id: entity_id.clone(),
                                            reason,
                                        },
                                    ));
                                    let evicted = entity_id.clone();
                                    Self::drain_failing(&instance, &mut mailbox_rx, move || {
                                        RuntimeError::HandlerPanicked {
                                            entity_id: evicted.clone(),
                                            reason: "entity evicted after failed re-activation"
                                                .to_string(),
                                        }
                                    })
                                    .await;
                                    return;
                                }
                            }
                        }
                    };

                    // Mid-turn cancellation: the turn ran to completion for
                    // state consistency; the observer learns of the
                    // cancellation only now.
                    let result = match (&turn.cancellation, result) {
                        (Some(token), result) if token.is_cancelled() => {
                            if let Err(e) = result {
                                tracing::debug!(
                                    entity_id = %entity_id,
                                    request_id = %turn.request_id,
                                    error = %e,
                                    "turn outcome superseded by cancellation"
                                );
                            }
                            Err(RuntimeError::Cancelled {
                                request_id: turn.request_id.clone(),
                            })
                        }
                        (_, result) => result,
                    };

                    if result.is_err() {
                        metrics.turn_failures.inc();
                    }
                    instance.active_turns.fetch_sub(1, Ordering::Release);
                    let _ = turn.completion.send(result);
                }
            }
        }
    }

    /// Close the mailbox and fail every queued turn with the given error.
    async fn drain_failing<F>(
        instance: &Arc<EntityInstance>,
        mailbox_rx: &mut mpsc::UnboundedReceiver<TurnRequest>,
        error: F,
    ) where
        F: Fn() -> RuntimeError,
    {
        mailbox_rx.close();
        while let Some(turn) = mailbox_rx.recv().await {
            instance.active_turns.fetch_sub(1, Ordering::Release);
            let _ = turn.completion.send(Err(error()));
        }
    }

    /// Run one turn against the current handler, catching panics.
    async fn execute_turn(instance: &Arc<EntityInstance>, turn: &TurnRequest) -> TurnOutcome {
        use futures::FutureExt;

        // Read-lock to clone the Arc, then release before executing.
        let handler = {
            let guard = instance.handler.read().await;
            Arc::clone(&guard)
        };

        // SAFETY: AssertUnwindSafe is fine because on panic the handler is
        // discarded and replaced; its post-panic state is never observed.
        let fut = AssertUnwindSafe(async {
            match &turn.operation {
                Operation::StartProcessing { correlation } => {
                    handler.start_processing(&turn.request_id, correlation).await
                }
                Operation::Reminder { fire } => handler.on_reminder(fire).await,
            }
        })
        .catch_unwind();

        match fut.await {
            Ok(result) => TurnOutcome::Completed(result),
            Err(panic_payload) => {
                let info = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                TurnOutcome::Panicked(info)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CorrelationContext, FiredReminder};
    use crate::storage::memory_reminders::MemoryReminderRegistry;
    use crate::storage::memory_state::MemoryStateStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tokio::sync::Notify;

    /// Test entity whose handler is scripted through the correlation map:
    /// mode=panic panics, mode=block waits on the shared gate, anything else
    /// records the request id.
    struct ScriptedEntity {
        shared: Arc<Shared>,
    }

    #[derive(Default)]
    struct Shared {
        spawn_count: AtomicUsize,
        running: AtomicUsize,
        max_running: AtomicUsize,
        log: parking_lot::Mutex<Vec<String>>,
        gate: Notify,
    }

    impl ScriptedEntity {
        fn new() -> (Self, Arc<Shared>) {
            let shared = Arc::new(Shared::default());
            (
                Self {
                    shared: Arc::clone(&shared),
                },
                shared,
            )
        }
    }

    #[async_trait]
    impl Entity for ScriptedEntity {
        async fn spawn(&self, _ctx: EntityContext) -> Result<Box<dyn EntityHandler>, RuntimeError> {
            self.shared.spawn_count.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedHandler {
                shared: Arc::clone(&self.shared),
            }))
        }
    }

    struct ScriptedHandler {
        shared: Arc<Shared>,
    }

    #[async_trait]
    impl EntityHandler for ScriptedHandler {
        async fn start_processing(
            &self,
            request_id: &RequestId,
            correlation: &CorrelationContext,
        ) -> Result<(), RuntimeError> {
            let running = self.shared.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.shared.max_running.fetch_max(running, Ordering::SeqCst);

            let result = match correlation.get("mode").map(String::as_str) {
                Some("panic") => panic!("scripted panic"),
                Some("block") => {
                    self.shared.gate.notified().await;
                    self.shared.log.lock().push(request_id.0.clone());
                    Ok(())
                }
                _ => {
                    self.shared.log.lock().push(request_id.0.clone());
                    Ok(())
                }
            };

            self.shared.running.fetch_sub(1, Ordering::SeqCst);
            result
        }

        async fn on_reminder(&self, fire: &FiredReminder) -> Result<(), RuntimeError> {
            self.shared.log.lock().push(format!("reminder:{}", fire.name));
            Ok(())
        }
    }

    /// Entity whose activation always fails.
    struct BrokenEntity;

    #[async_trait]
    impl Entity for BrokenEntity {
        async fn spawn(&self, ctx: EntityContext) -> Result<Box<dyn EntityHandler>, RuntimeError> {
            Err(RuntimeError::RegistrationFailure {
                reason: format!("no handler for {}", ctx.entity_id),
                source: None,
            })
        }
    }

    fn scheduler_with(entity: impl Entity, config: RuntimeConfig) -> Arc<EntityScheduler> {
        Arc::new(EntityScheduler::new(
            Arc::new(entity),
            Arc::new(MemoryStateStore::new()),
            Arc::new(MemoryReminderRegistry::new()),
            config,
            Arc::new(RuntimeMetrics::unregistered()),
        ))
    }

    fn start_op(pairs: &[(&str, &str)]) -> Operation {
        let correlation: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Operation::StartProcessing { correlation }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached within 2.5s");
    }

    #[tokio::test]
    async fn turns_are_serialized_in_fifo_order() {
        let (entity, shared) = ScriptedEntity::new();
        let scheduler = scheduler_with(entity, RuntimeConfig::default());
        let id = EntityId::new("e-1");

        // First turn blocks on the gate so the others queue behind it.
        let s1 = Arc::clone(&scheduler);
        let id1 = id.clone();
        let t1 = tokio::spawn(async move {
            s1.run_turn(&id1, RequestId::new("r1"), start_op(&[("mode", "block")]), None)
                .await
        });
        let sh = Arc::clone(&shared);
        wait_until(move || sh.running.load(Ordering::SeqCst) == 1).await;

        let s2 = Arc::clone(&scheduler);
        let id2 = id.clone();
        let t2 = tokio::spawn(async move {
            s2.run_turn(&id2, RequestId::new("r2"), start_op(&[]), None).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let s3 = Arc::clone(&scheduler);
        let id3 = id.clone();
        let t3 = tokio::spawn(async move {
            s3.run_turn(&id3, RequestId::new("r3"), start_op(&[]), None).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        shared.gate.notify_one();
        t1.await.unwrap().unwrap();
        t2.await.unwrap().unwrap();
        t3.await.unwrap().unwrap();

        assert_eq!(*shared.log.lock(), vec!["r1", "r2", "r3"]);
        assert_eq!(shared.max_running.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_entities_run_in_parallel() {
        let (entity, shared) = ScriptedEntity::new();
        let scheduler = scheduler_with(entity, RuntimeConfig::default());

        let s1 = Arc::clone(&scheduler);
        let t1 = tokio::spawn(async move {
            s1.run_turn(
                &EntityId::new("e-1"),
                RequestId::new("r1"),
                start_op(&[("mode", "block")]),
                None,
            )
            .await
        });
        let sh = Arc::clone(&shared);
        wait_until(move || sh.running.load(Ordering::SeqCst) == 1).await;

        // e-2 completes while e-1 is still mid-turn.
        scheduler
            .run_turn(&EntityId::new("e-2"), RequestId::new("r2"), start_op(&[]), None)
            .await
            .unwrap();
        assert_eq!(*shared.log.lock(), vec!["r2"]);
        assert_eq!(scheduler.active_count(), 2);

        shared.gate.notify_one();
        t1.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn mailbox_capacity_is_enforced() {
        let (entity, shared) = ScriptedEntity::new();
        let scheduler = scheduler_with(
            entity,
            RuntimeConfig {
                mailbox_capacity: 1,
                ..Default::default()
            },
        );
        let id = EntityId::new("e-1");

        let s1 = Arc::clone(&scheduler);
        let id1 = id.clone();
        let t1 = tokio::spawn(async move {
            s1.run_turn(&id1, RequestId::new("r1"), start_op(&[("mode", "block")]), None)
                .await
        });
        let sh = Arc::clone(&shared);
        wait_until(move || sh.running.load(Ordering::SeqCst) == 1).await;

        let err = scheduler
            .run_turn(&id, RequestId::new("r2"), start_op(&[]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::MailboxFull { .. }));

        shared.gate.notify_one();
        t1.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancellation_before_turn_abandons_it() {
        let (entity, shared) = ScriptedEntity::new();
        let scheduler = scheduler_with(entity, RuntimeConfig::default());
        let id = EntityId::new("e-1");

        let s1 = Arc::clone(&scheduler);
        let id1 = id.clone();
        let t1 = tokio::spawn(async move {
            s1.run_turn(&id1, RequestId::new("r1"), start_op(&[("mode", "block")]), None)
                .await
        });
        let sh = Arc::clone(&shared);
        wait_until(move || sh.running.load(Ordering::SeqCst) == 1).await;

        let token = CancellationToken::new();
        let s2 = Arc::clone(&scheduler);
        let id2 = id.clone();
        let token2 = token.clone();
        let t2 = tokio::spawn(async move {
            s2.run_turn(&id2, RequestId::new("r2"), start_op(&[]), Some(token2))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        shared.gate.notify_one();

        t1.await.unwrap().unwrap();
        let err = t2.await.unwrap().unwrap_err();
        assert!(matches!(err, RuntimeError::Cancelled { .. }));
        // r2's handler never ran.
        assert_eq!(*shared.log.lock(), vec!["r1"]);
    }

    #[tokio::test]
    async fn cancellation_mid_turn_completes_then_reports() {
        let (entity, shared) = ScriptedEntity::new();
        let scheduler = scheduler_with(entity, RuntimeConfig::default());
        let id = EntityId::new("e-1");

        let token = CancellationToken::new();
        let s1 = Arc::clone(&scheduler);
        let id1 = id.clone();
        let token1 = token.clone();
        let t1 = tokio::spawn(async move {
            s1.run_turn(
                &id1,
                RequestId::new("r1"),
                start_op(&[("mode", "block")]),
                Some(token1),
            )
            .await
        });
        let sh = Arc::clone(&shared);
        wait_until(move || sh.running.load(Ordering::SeqCst) == 1).await;

        token.cancel();
        shared.gate.notify_one();

        let err = t1.await.unwrap().unwrap_err();
        assert!(matches!(err, RuntimeError::Cancelled { .. }));
        // The turn ran to completion: its effect is applied.
        assert_eq!(*shared.log.lock(), vec!["r1"]);
    }

    #[tokio::test]
    async fn panic_is_isolated_and_handler_respawned() {
        let (entity, shared) = ScriptedEntity::new();
        let scheduler = scheduler_with(entity, RuntimeConfig::default());
        let id = EntityId::new("e-1");

        let err = scheduler
            .run_turn(&id, RequestId::new("r1"), start_op(&[("mode", "panic")]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::HandlerPanicked { .. }));

        // Next turn on the same entity still runs, against a fresh handler.
        scheduler
            .run_turn(&id, RequestId::new("r2"), start_op(&[]), None)
            .await
            .unwrap();
        assert_eq!(*shared.log.lock(), vec!["r2"]);
        assert_eq!(shared.spawn_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn activation_failure_surfaces_and_leaves_no_instance() {
        let scheduler = scheduler_with(BrokenEntity, RuntimeConfig::default());
        let err = scheduler
            .run_turn(&EntityId::new("e-1"), RequestId::new("r1"), start_op(&[]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::RegistrationFailure { .. }));
        assert_eq!(scheduler.active_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_turns_and_is_idempotent() {
        let (entity, _shared) = ScriptedEntity::new();
        let scheduler = scheduler_with(
            entity,
            RuntimeConfig {
                termination_timeout: Duration::from_secs(2),
                ..Default::default()
            },
        );
        let id = EntityId::new("e-1");

        scheduler
            .run_turn(&id, RequestId::new("r1"), start_op(&[]), None)
            .await
            .unwrap();

        scheduler.shutdown().await;
        assert!(scheduler.is_closing());

        let err = scheduler
            .run_turn(&id, RequestId::new("r2"), start_op(&[]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ShuttingDown));

        // Second shutdown is a no-op.
        scheduler.shutdown().await;
    }
}
