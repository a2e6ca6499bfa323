use std::time::Duration;

/// Tunables for the orchestration engine. Retry and timeout values are
/// deliberately configurable; the defaults are bounded-exponential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum number of merged messages in a fresh query's display window.
    /// Each load-earlier round extends the session cap by this amount.
    pub window_cap: usize,
    /// Maximum messages a single host returns per query round.
    pub max_lines_per_host: usize,
    /// Handshake deadline for one connect attempt.
    pub connect_timeout: Duration,
    /// Bounded wait for one host's query round. Exceeding it excludes the
    /// host from the round; a future round will try it again.
    pub round_timeout: Duration,
    /// First reconnect delay after a transient failure.
    pub backoff_base: Duration,
    /// Ceiling for the exponential reconnect delay.
    pub backoff_cap: Duration,
    /// Consecutive transient failures tolerated before the host is parked
    /// in the errored state.
    pub retry_budget: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window_cap: 250,
            max_lines_per_host: 250,
            connect_timeout: Duration::from_secs(10),
            round_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(15),
            retry_budget: 5,
        }
    }
}

impl EngineConfig {
    /// Delay before reconnect attempt number `attempt` (0-based), doubling
    /// from `backoff_base` and capped at `backoff_cap`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(16);
        let delay = self.backoff_base.saturating_mul(1u32 << exp);
        delay.min(self.backoff_cap)
    }
}
