use std::cmp::min;
use std::time::Duration;

/// Growing delay between consecutive failed attempts, reset by a successful one
pub struct ExponentialBackoff {
    next_delay: Duration,

    config_initial_delay: Duration,
    config_max_delay: Duration,
    config_factor_eighths: u32,
}

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self::with_factor_eighths(initial_delay, max_delay, 8*2)
    }

    pub fn with_factor_eighths(initial_delay: Duration, max_delay: Duration, factor_eighths: u32) -> Self {
        assert!(factor_eighths >= 8);
        assert!(initial_delay <= max_delay);

        ExponentialBackoff {
            next_delay: initial_delay,
            config_initial_delay: initial_delay,
            config_max_delay: max_delay,
            config_factor_eighths: factor_eighths,
        }
    }

    /// returns the delay to wait before the next attempt, growing the delay for the attempt
    ///  after that
    #[must_use]
    pub fn next_delay(&mut self) -> Duration {
        let result = self.next_delay;
        self.next_delay = min(self.next_delay * self.config_factor_eighths / 8, self.config_max_delay);
        result
    }

    pub fn reset(&mut self) {
        self.next_delay = self.config_initial_delay;
    }
}
