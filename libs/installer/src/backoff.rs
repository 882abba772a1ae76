use std::time::Duration;

use backon::{BackoffBuilder, ConstantBuilder, ExponentialBuilder};
use clap::ValueEnum;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum BackoffKind {
    #[default]
    Constant,
    Exponential,
}

/// Delays applied between polls of a condition.
#[derive(Clone, Debug, PartialEq)]
pub enum BackoffPolicy {
    /// Same delay between every attempt.
    Constant { delay: Duration },
    /// Delay doubling from `initial` up to `max`.
    Exponential {
        initial: Duration,
        max: Duration,
        factor: f32,
    },
}

impl BackoffPolicy {
    pub fn new(kind: BackoffKind, interval: Duration) -> Self {
        match kind {
            BackoffKind::Constant => BackoffPolicy::Constant { delay: interval },
            // a single wait is capped at twelve intervals
            BackoffKind::Exponential => BackoffPolicy::Exponential {
                initial: interval,
                max: interval.saturating_mul(12),
                factor: 2.0,
            },
        }
    }

    /// Endless iterator of delays; callers bound the number of attempts themselves.
    pub fn delays(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        match self {
            BackoffPolicy::Constant { delay } => Box::new(
                ConstantBuilder::default()
                    .with_delay(*delay)
                    .without_max_times()
                    .build(),
            ),
            BackoffPolicy::Exponential {
                initial,
                max,
                factor,
            } => Box::new(
                ExponentialBuilder::default()
                    .with_min_delay(*initial)
                    .with_max_delay(*max)
                    .with_factor(*factor)
                    .without_max_times()
                    .build(),
            ),
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Constant {
            delay: Duration::from_secs(5),
        }
    }
}
