//! Crash accounting and exponential backoff schedules.

use std::time::Duration;

use tokio::time::Instant;

/// Largest exponent applied to a base delay.
const MAX_EXPONENT: u32 = 16;

/// Tunables for crash recovery, port polling, and health checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryPolicy {
    /// Crashes closer together than this count as consecutive.
    pub crash_window: Duration,
    /// Consecutive crashes tolerated before giving up.
    pub max_consecutive_crashes: u32,
    /// Base delay before restarting after a crash.
    pub crash_base_delay: Duration,
    /// Base delay before restarting after a port-in-use exit.
    pub port_in_use_base_delay: Duration,
    /// Attempts when polling for a port to become free.
    pub port_poll_attempts: u32,
    /// First delay of the port polling schedule.
    pub port_poll_base_delay: Duration,
    /// Ceiling for any single port polling delay.
    pub port_poll_max_delay: Duration,
    /// Bind probes after terminating a stale instance of our own server.
    pub conflict_retry_attempts: u32,
    /// First delay of the stale-instance retry schedule.
    pub conflict_retry_base_delay: Duration,
    /// Health monitor polling interval.
    pub health_interval: Duration,
    /// Alternative ports proposed for a foreign-owned port.
    pub alternative_port_count: usize,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            crash_window: Duration::from_secs(60),
            max_consecutive_crashes: 3,
            crash_base_delay: Duration::from_secs(2),
            port_in_use_base_delay: Duration::from_secs(5),
            port_poll_attempts: 5,
            port_poll_base_delay: Duration::from_millis(500),
            port_poll_max_delay: Duration::from_secs(4),
            conflict_retry_attempts: 4,
            conflict_retry_base_delay: Duration::from_millis(200),
            health_interval: Duration::from_secs(10),
            alternative_port_count: 3,
        }
    }
}

impl RecoveryPolicy {
    /// Restart delay for the `count`-th consecutive crash.
    #[must_use]
    pub fn crash_delay(&self, count: u32, port_in_use: bool) -> Duration {
        let base = if port_in_use {
            self.port_in_use_base_delay
        } else {
            self.crash_base_delay
        };
        exponential_delay(base, count)
    }

    /// Delay before the `attempt`-th port poll.
    #[must_use]
    pub fn port_poll_delay(&self, attempt: u32) -> Duration {
        capped_delay(self.port_poll_base_delay, attempt, self.port_poll_max_delay)
    }
}

/// `base * 2^(attempt - 1)`, with `attempt` starting at 1.
#[must_use]
pub fn exponential_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(MAX_EXPONENT);
    base.saturating_mul(1_u32 << exponent)
}

/// [`exponential_delay`] clamped to `max`.
#[must_use]
pub fn capped_delay(base: Duration, attempt: u32, max: Duration) -> Duration {
    exponential_delay(base, attempt).min(max)
}

/// Consecutive-crash bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrashState {
    consecutive: u32,
    last_crash: Option<Instant>,
}

impl CrashState {
    /// Record a crash at `now` and return the updated consecutive count.
    ///
    /// The count grows while crashes arrive within `window` of each other and
    /// restarts at 1 after a longer gap.
    pub fn record(&mut self, now: Instant, window: Duration) -> u32 {
        let within_window = self
            .last_crash
            .is_some_and(|last| now.saturating_duration_since(last) < window);

        self.consecutive = if within_window {
            self.consecutive.saturating_add(1)
        } else {
            1
        };
        self.last_crash = Some(now);
        self.consecutive
    }

    /// Forget all crash history.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Current consecutive count.
    #[must_use]
    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    /// Time of the most recent crash.
    #[must_use]
    pub fn last_crash(&self) -> Option<Instant> {
        self.last_crash
    }
}
