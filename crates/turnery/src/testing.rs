//! In-memory test runtime for unit and integration testing.
//!
//! Wires a [`Processor`] to fresh in-memory backends with test-friendly
//! timings and exposes direct handles to the backends for state inspection.

use std::sync::Arc;
use std::time::Duration;

use crate::config::RuntimeConfig;
use crate::metrics::RuntimeMetrics;
use crate::processor::{Processor, ProcessorSettings, COUNT_KEY};
use crate::runtime::EntityRuntime;
use crate::state_store::StateStore;
use crate::storage::memory_reminders::MemoryReminderRegistry;
use crate::storage::memory_state::MemoryStateStore;
use crate::types::EntityId;

/// A single-process runtime over in-memory backends.
///
/// # Example
///
/// ```ignore
/// let harness = TestRuntime::new();
/// harness
///     .runtime()
///     .start_processing(&EntityId::new("e-1"), RequestId::new("r1"), Default::default(), None)
///     .await?;
/// assert_eq!(harness.count(&EntityId::new("e-1")).await, Some(0));
/// harness.shutdown().await;
/// ```
pub struct TestRuntime {
    runtime: Arc<EntityRuntime>,
    state: Arc<MemoryStateStore>,
    reminders: Arc<MemoryReminderRegistry>,
}

impl TestRuntime {
    /// Default test configuration: fast pump polling, short drain timeout.
    pub fn test_config() -> RuntimeConfig {
        RuntimeConfig {
            mailbox_capacity: 100,
            termination_timeout: Duration::from_secs(2),
            reminder_poll_interval: Duration::from_millis(20),
        }
    }

    /// Runtime with default settings; the pump is already started.
    pub fn new() -> Self {
        Self::with_settings(Self::test_config(), ProcessorSettings::default())
    }

    /// Runtime with custom config and processor settings; the pump is
    /// already started.
    pub fn with_settings(config: RuntimeConfig, settings: ProcessorSettings) -> Self {
        let state = Arc::new(MemoryStateStore::new());
        let reminders = Arc::new(MemoryReminderRegistry::new());
        let runtime = EntityRuntime::new(
            Arc::new(Processor::new(settings)),
            Arc::clone(&state) as Arc<dyn StateStore>,
            Arc::clone(&reminders) as Arc<dyn crate::reminder::ReminderRegistry>,
            config,
            Arc::new(RuntimeMetrics::unregistered()),
        )
        .expect("TestRuntime config should be valid");
        runtime.start();

        Self {
            runtime,
            state,
            reminders,
        }
    }

    pub fn runtime(&self) -> &Arc<EntityRuntime> {
        &self.runtime
    }

    /// Direct handle to the in-memory state store.
    pub fn state(&self) -> &Arc<MemoryStateStore> {
        &self.state
    }

    /// Direct handle to the in-memory reminder registry.
    pub fn reminders(&self) -> &Arc<MemoryReminderRegistry> {
        &self.reminders
    }

    /// Read and decode the entity's durable counter. `None` = never started.
    pub async fn count(&self, entity_id: &EntityId) -> Option<u64> {
        let bytes = self
            .state
            .get(entity_id, COUNT_KEY)
            .await
            .expect("memory state store is infallible")?;
        Some(rmp_serde::from_slice(&bytes).expect("counter bytes should decode"))
    }

    pub async fn shutdown(&self) {
        self.runtime.shutdown().await;
    }
}

impl Default for TestRuntime {
    fn default() -> Self {
        Self::new()
    }
}
