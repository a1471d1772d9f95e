use log::{error, warn};
use rand::Rng;
use std::fmt::{self, Display};
use std::thread;
use std::time::Duration;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_JITTER: f64 = 0.1;

const RETRYABLE_KEYWORDS: [&str; 10] = [
    "timeout", "deadline", "unavailable", "internal", "ratelimitexceeded", "rate limit", "429", "500", "502", "503",
];

/// Errors that know whether another attempt could succeed.
pub trait Classify {
    fn is_retryable(&self) -> bool;
}

/// Keyword classification for errors that only carry a message.
pub fn is_retryable_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    RETRYABLE_KEYWORDS.iter().any(|k| lower.contains(k))
}

fn classify_by_error(err: &dyn Classify) -> bool {
    err.is_retryable()
}

/// Bounded exponential backoff shared by the fetcher, the lookup and the bulk loader.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random extra delay, as a fraction of the computed delay.
    pub jitter: f64,
    pub retryable: fn(&dyn Classify) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: DEFAULT_JITTER,
            retryable: classify_by_error,
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self { max_retries, base_delay, ..Self::default() }
    }

    /// No sleeping between attempts.
    pub fn immediate(max_retries: u32) -> Self {
        Self { max_retries, base_delay: Duration::ZERO, max_delay: Duration::ZERO, jitter: 0.0, ..Self::default() }
    }

    pub fn should_retry(&self, err: &dyn Classify, attempt: u32) -> bool {
        attempt < self.max_retries && (self.retryable)(err)
    }

    /// Delay before retry number `attempt + 1`: `base * 2^attempt`, capped, plus jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.jitter);
        delay + delay.mul_f64(extra)
    }

    pub fn pause(&self, attempt: u32) -> Duration {
        let wait = self.delay_for(attempt);
        if !wait.is_zero() {
            thread::sleep(wait);
        }
        wait
    }

    pub fn run<T, E, F>(&self, operation: &str, mut op: F) -> Result<T, E>
    where
        E: Classify + Display,
        F: FnMut() -> Result<T, E>,
    {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !(self.retryable)(&e) {
                        error!("Non-retryable error in {}: {}", operation, e);
                        return Err(e);
                    }
                    if attempt >= self.max_retries {
                        error!("Max retries ({}) exceeded for {}: {}", self.max_retries, operation, e);
                        return Err(e);
                    }
                    let wait = self.delay_for(attempt);
                    warn!("Attempt {} failed for {}: {}. Retrying in {:?}...", attempt + 1, operation, e, wait);
                    if !wait.is_zero() {
                        thread::sleep(wait);
                    }
                    attempt += 1;
                }
            }
        }
    }
}
