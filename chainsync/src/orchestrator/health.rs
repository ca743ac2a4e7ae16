use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::HealthConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthTransition {
    Degrade,
    Recover,
}

/// Decides when a chain degrades and when it recovers.
///
/// Degrades once `failure_threshold` consecutive failures fall within the sliding
/// `failure_window_ms`, recovers after `recovery_threshold` consecutive successes.
#[derive(Debug)]
pub struct HealthMonitor {
    config: HealthConfig,
    failures: VecDeque<Instant>,
    consecutive_failures: u32,
    consecutive_successes: u32,
    degraded: bool,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, degraded: bool) -> Self {
        Self {
            config,
            failures: VecDeque::new(),
            consecutive_failures: 0,
            consecutive_successes: 0,
            degraded,
        }
    }

    pub fn config(&self) -> HealthConfig {
        self.config
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Failures since the last success, used to scale backoff.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn record_failure(&mut self, at: Instant) -> Option<HealthTransition> {
        self.consecutive_successes = 0;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        let window = Duration::from_millis(self.config.failure_window_ms);
        self.failures.push_back(at);
        while let Some(oldest) = self.failures.front() {
            if at.saturating_duration_since(*oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }

        if !self.degraded && self.failures.len() as u32 >= self.config.failure_threshold {
            self.failures.clear();
            self.degraded = true;

            return Some(HealthTransition::Degrade);
        }

        None
    }

    pub fn record_success(&mut self) -> Option<HealthTransition> {
        self.failures.clear();
        self.consecutive_failures = 0;

        if !self.degraded {
            return None;
        }

        self.consecutive_successes += 1;
        if self.consecutive_successes >= self.config.recovery_threshold {
            self.consecutive_successes = 0;
            self.degraded = false;

            return Some(HealthTransition::Recover);
        }

        None
    }

    /// Degrades regardless of recent failures. Returns false when already degraded.
    pub fn force_degrade(&mut self) -> bool {
        self.consecutive_successes = 0;
        self.failures.clear();

        !std::mem::replace(&mut self.degraded, true)
    }
}
