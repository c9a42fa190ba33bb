use prometheus::{IntCounter, IntGauge, Opts, Registry};

/// Runtime-level prometheus metrics. Purely observational.
pub struct RuntimeMetrics {
    /// Number of live entity instances.
    pub entities: IntGauge,
    /// Total turns executed.
    pub turns: IntCounter,
    /// Total turns that completed with an error (including panics).
    pub turn_failures: IntCounter,
    /// Total reminder firings delivered by the pump.
    pub reminder_firings: IntCounter,
}

impl RuntimeMetrics {
    /// Create metrics and register them with the given prometheus registry.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let entities = IntGauge::with_opts(Opts::new(
            "turnery_entities",
            "Number of live entity instances",
        ))?;
        let turns = IntCounter::with_opts(Opts::new("turnery_turns", "Total turns executed"))?;
        let turn_failures = IntCounter::with_opts(Opts::new(
            "turnery_turn_failures",
            "Total turns that completed with an error",
        ))?;
        let reminder_firings = IntCounter::with_opts(Opts::new(
            "turnery_reminder_firings",
            "Total reminder firings delivered",
        ))?;

        registry.register(Box::new(entities.clone()))?;
        registry.register(Box::new(turns.clone()))?;
        registry.register(Box::new(turn_failures.clone()))?;
        registry.register(Box::new(reminder_firings.clone()))?;

        Ok(Self {
            entities,
            turns,
            turn_failures,
            reminder_firings,
        })
    }

    /// Create metrics without registering (for testing).
    pub fn unregistered() -> Self {
        Self {
            entities: IntGauge::new("turnery_entities", "entities").expect("valid metric name"),
            turns: IntCounter::new("turnery_turns", "turns").expect("valid metric name"),
            turn_failures: IntCounter::new("turnery_turn_failures", "failures")
                .expect("valid metric name"),
            reminder_firings: IntCounter::new("turnery_reminder_firings", "firings")
                .expect("valid metric name"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_metrics_work() {
        let m = RuntimeMetrics::unregistered();
        m.entities.set(3);
        m.turns.inc();
        assert_eq!(m.entities.get(), 3);
        assert_eq!(m.turns.get(), 1);
    }

    #[test]
    fn registered_metrics_work() {
        let r = Registry::new();
        let m = RuntimeMetrics::new(&r).unwrap();
        m.reminder_firings.inc();
        assert_eq!(m.reminder_firings.get(), 1);
    }
}
