//! When a polling engine fires.

use std::time::Duration;

use amgrid_core::{AllocatorConfig, ConfigError, TriggerKind};

/// Default period between polls.
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Wait `period` after each poll completes.
    FixedDelay {
        period: Duration,
        initial_delay: Duration,
    },
    /// Fire every `period`; ticks missed while a poll ran long are skipped.
    FixedRate {
        period: Duration,
        initial_delay: Duration,
    },
}

impl Trigger {
    pub fn fixed_delay(period: Duration) -> Self {
        Trigger::FixedDelay {
            period,
            initial_delay: Duration::ZERO,
        }
    }

    pub fn fixed_rate(period: Duration) -> Self {
        Trigger::FixedRate {
            period,
            initial_delay: Duration::ZERO,
        }
    }

    pub fn with_initial_delay(self, delay: Duration) -> Self {
        match self {
            Trigger::FixedDelay { period, .. } => Trigger::FixedDelay {
                period,
                initial_delay: delay,
            },
            Trigger::FixedRate { period, .. } => Trigger::FixedRate {
                period,
                initial_delay: delay,
            },
        }
    }

    /// Build the heartbeat trigger described by an allocator config.
    pub fn from_config(config: &AllocatorConfig) -> Result<Self, ConfigError> {
        let period = config.heartbeat_interval()?;
        let trigger = match config.trigger {
            TriggerKind::FixedDelay => Trigger::fixed_delay(period),
            TriggerKind::FixedRate => Trigger::fixed_rate(period),
        };
        Ok(trigger.with_initial_delay(config.initial_delay()?))
    }

    pub fn period(&self) -> Duration {
        match self {
            Trigger::FixedDelay { period, .. } | Trigger::FixedRate { period, .. } => *period,
        }
    }

    pub fn initial_delay(&self) -> Duration {
        match self {
            Trigger::FixedDelay { initial_delay, .. }
            | Trigger::FixedRate { initial_delay, .. } => *initial_delay,
        }
    }
}

impl Default for Trigger {
    fn default() -> Self {
        Trigger::fixed_delay(DEFAULT_PERIOD)
    }
}
