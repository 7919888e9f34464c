// src/rabbitmq/backoff.rs

use std::time::Duration;

/// How long to wait between attempts to restore a lost connection or subscription.
///
/// Attempts never stop on their own; only shutdown ends a retry loop.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay applied as random +/- jitter (0.15 = 15%).
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.15,
        }
    }
}

impl ReconnectPolicy {
    /// A fixed delay without jitter.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            current: self.initial_delay,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    current: Duration,
}

impl Backoff {
    /// Returns the delay before the next attempt and grows the base delay.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        let grown = base.as_secs_f64() * self.policy.multiplier;
        self.current = Duration::from_secs_f64(grown.min(self.policy.max_delay.as_secs_f64()));

        if self.policy.jitter <= 0.0 {
            return base;
        }

        // Exponential backoff with jitter
        let spread = (rand::random::<f64>() * 2.0 - 1.0) * self.policy.jitter;
        let jittered = base.as_secs_f64() * (1.0 + spread);
        Duration::from_secs_f64(jittered.max(0.0))
    }

    pub fn reset(&mut self) {
        self.current = self.policy.initial_delay;
    }
}
