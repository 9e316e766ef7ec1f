use std::time::Duration;

use rand::prelude::*;

/// Exponential backoff with full jitter, used by the reconnect dial loop.
///
/// See <https://aws.amazon.com/blogs/architecture/exponential-backoff-and-jitter/>
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub init_backoff: Duration,
    pub max_backoff: Duration,
    pub base: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            base: 3.,
        }
    }
}

/// Consecutive calls to [`Backoff::next`] yield growing, jittered intervals
/// capped at the configured maximum.
#[derive(Debug)]
pub struct Backoff {
    init_secs: f64,
    ceiling_secs: f64,
    max_secs: f64,
    base: f64,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        let init_secs = config.init_backoff.as_secs_f64();
        Self {
            init_secs,
            ceiling_secs: init_secs,
            max_secs: config.max_backoff.as_secs_f64(),
            base: config.base,
        }
    }

    /// Next interval to sleep, sampled uniformly from `[init, ceiling]`.
    pub fn next(&mut self) -> Duration {
        let sampled = if self.ceiling_secs > self.init_secs {
            thread_rng().gen_range(self.init_secs..=self.ceiling_secs)
        } else {
            self.init_secs
        };
        self.ceiling_secs = (self.ceiling_secs * self.base).min(self.max_secs);
        Duration::from_secs_f64(sampled)
    }
}
