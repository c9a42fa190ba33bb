use crate::error::RuntimeError;
use std::time::Duration;

/// Configuration for the entity runtime.
///
/// Always passed in explicitly at construction; nothing in the runtime or in
/// entity logic reads ambient global configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Maximum accepted-but-not-yet-completed turns per entity before new
    /// enqueues are rejected with `MailboxFull`. Default: 100.
    pub mailbox_capacity: usize,
    /// How long shutdown waits for in-flight and queued turns to drain before
    /// cancelling entity tasks. Default: 15s.
    pub termination_timeout: Duration,
    /// How often the reminder pump polls the registry for due registrations.
    /// Default: 100ms.
    pub reminder_poll_interval: Duration,
}

impl RuntimeConfig {
    /// Validate configuration values.
    ///
    /// Checks:
    /// - `mailbox_capacity >= 1` (a zero-capacity mailbox can never accept a turn)
    /// - all durations are non-zero
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.mailbox_capacity == 0 {
            return Err(RuntimeError::InvalidConfig {
                reason: "mailbox_capacity must be >= 1".to_string(),
            });
        }
        if self.termination_timeout.is_zero() {
            return Err(RuntimeError::InvalidConfig {
                reason: "termination_timeout must be > 0".to_string(),
            });
        }
        if self.reminder_poll_interval.is_zero() {
            return Err(RuntimeError::InvalidConfig {
                reason: "reminder_poll_interval must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 100,
            termination_timeout: Duration::from_secs(15),
            reminder_poll_interval: Duration::from_millis(100),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = RuntimeConfig::default();
        assert_eq!(config.mailbox_capacity, 100);
        assert_eq!(config.termination_timeout, Duration::from_secs(15));
        assert_eq!(config.reminder_poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn default_config_is_valid() {
        RuntimeConfig::default().validate().unwrap();
    }

    #[test]
    fn custom_config() {
        let config = RuntimeConfig {
            mailbox_capacity: 8,
            ..Default::default()
        };
        assert_eq!(config.mailbox_capacity, 8);
        // Other fields keep defaults
        assert_eq!(config.termination_timeout, Duration::from_secs(15));
    }

    #[test]
    fn validate_zero_mailbox_capacity() {
        let config = RuntimeConfig {
            mailbox_capacity: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("mailbox_capacity"), "got: {msg}");
    }

    #[test]
    fn validate_zero_termination_timeout() {
        let config = RuntimeConfig {
            termination_timeout: Duration::ZERO,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("termination_timeout"), "got: {msg}");
    }

    #[test]
    fn validate_zero_poll_interval() {
        let config = RuntimeConfig {
            reminder_poll_interval: Duration::ZERO,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("reminder_poll_interval"), "got: {msg}");
    }
}
