use rand::Rng;
use std::fmt;
use std::thread;
use std::time::Duration;
use tracing::{error, warn};

pub trait Transient {
    fn is_transient(&self) -> bool;
}

#[derive(Debug)]
pub enum RetryError<E> {
    Fatal(E),
    Exhausted { attempts: usize, last: E },
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Fatal(err) | RetryError::Exhausted { last: err, .. } => err,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Fatal(err) => write!(f, "{err}"),
            RetryError::Exhausted { attempts, last } => {
                write!(f, "gave up after {attempts} attempts: {last}")
            }
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Adds up to 25% random extra delay per sleep, still capped at
    /// `max_delay`. Off by default.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exp = u32::try_from(attempt).unwrap_or(u32::MAX);
        let factor = 2u32.checked_pow(exp).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    fn sleep_duration(&self, attempt: usize) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if !self.jitter {
            return delay;
        }
        let spread = u64::try_from(delay.as_micros() / 4).unwrap_or(u64::MAX);
        if spread == 0 {
            return delay;
        }
        let extra = Duration::from_micros(rand::thread_rng().gen_range(0..=spread));
        delay.saturating_add(extra).min(self.max_delay)
    }

    fn sleep_before_retry(&self, attempt: usize) {
        thread::sleep(self.sleep_duration(attempt));
    }

    pub fn run<T, E, F>(&self, label: &str, op: F) -> Result<T, RetryError<E>>
    where
        E: Transient + fmt::Display,
        F: FnMut(usize) -> Result<T, E>,
    {
        self.run_classified(label, E::is_transient, op)
    }

    pub fn run_classified<T, E, C, F>(
        &self,
        label: &str,
        is_transient: C,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: fmt::Display,
        C: Fn(&E) -> bool,
        F: FnMut(usize) -> Result<T, E>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if !is_transient(&err) => return Err(RetryError::Fatal(err)),
                Err(err) if attempt >= self.max_retries => {
                    error!(
                        op = label,
                        attempts = attempt + 1,
                        "all retries failed: {err}"
                    );
                    return Err(RetryError::Exhausted {
                        attempts: attempt + 1,
                        last: err,
                    });
                }
                Err(err) => {
                    warn!(
                        op = label,
                        attempt = attempt + 1,
                        of = self.max_retries + 1,
                        delay_ms = self.delay_for_attempt(attempt).as_millis() as u64,
                        "transient failure, retrying: {err}"
                    );
                    self.sleep_before_retry(attempt);
                    attempt += 1;
                }
            }
        }
    }

    pub fn wrap<T, E, F>(
        self,
        label: &'static str,
        mut op: F,
    ) -> impl FnMut() -> Result<T, RetryError<E>>
    where
        E: Transient + fmt::Display,
        F: FnMut() -> Result<T, E>,
    {
        move || self.run(label, |_| op())
    }
}
