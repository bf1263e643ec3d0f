use std::time;

use rand::Rng;

/// The retry policy used to decide how far `run_after` moves out when a failed
/// job is scheduled for another attempt.
#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    /// The backoff interval charged for the first failed attempt.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries, before jitter.
    maximum_interval: time::Duration,
    /// Exclusive upper bound on the uniform jitter added to every backoff.
    jitter: time::Duration,
}

impl RetryPolicy {
    pub fn new(
        initial_interval: time::Duration,
        maximum_interval: time::Duration,
        jitter: time::Duration,
    ) -> Self {
        Self {
            initial_interval,
            maximum_interval,
            jitter,
        }
    }

    /// Calculate the time until the next retry after `attempt` failed.
    ///
    /// `attempt` is 1-based: a job failing its first execution reports
    /// attempt 1 and backs off by `initial_interval` plus jitter. Doubles per
    /// subsequent attempt up to `maximum_interval`.
    pub fn time_until_next_retry(&self, attempt: u32) -> time::Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let candidate = self
            .initial_interval
            .saturating_mul(2u32.saturating_pow(exponent));

        std::cmp::min(candidate, self.maximum_interval) + self.jitter_interval()
    }

    fn jitter_interval(&self) -> time::Duration {
        let bound = self.jitter.as_millis() as u64;
        if bound == 0 {
            return time::Duration::ZERO;
        }

        time::Duration::from_millis(rand::thread_rng().gen_range(0..bound))
    }
}

impl Default for RetryPolicy {
    /// Base 10 s doubling per attempt, capped at 15 min, with up to 1 s of
    /// jitter to spread thundering retries.
    fn default() -> Self {
        Self {
            initial_interval: time::Duration::from_secs(10),
            maximum_interval: time::Duration::from_secs(15 * 60),
            jitter: time::Duration::from_millis(1000),
        }
    }
}
