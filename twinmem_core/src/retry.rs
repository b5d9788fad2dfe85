use std::fmt;
use std::time::Duration;

use crate::region::{Region, RegionError, StmError};
use crate::txn::Transaction;

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub base_backoff_us: u64,
    pub max_backoff_us: u64,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub const BASE_BACKOFF_US: u64 = 50;
    pub const MAX_BACKOFF_US: u64 = 2_000;
    pub const MAX_ATTEMPTS: u32 = 64;

    pub const fn contended_default() -> Self {
        Self {
            base_backoff_us: Self::BASE_BACKOFF_US,
            max_backoff_us: Self::MAX_BACKOFF_US,
            max_attempts: Self::MAX_ATTEMPTS,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::contended_default()
    }
}

pub struct RetryBackoff {
    policy: RetryPolicy,
    rng_state: u64,
}

impl RetryBackoff {
    pub fn with_seed(seed: u64, policy: RetryPolicy) -> Self {
        let mut seeded = seed ^ 0x9E37_79B9_7F4A_7C15_u64;
        if seeded == 0 {
            seeded = 1;
        }
        Self {
            policy,
            rng_state: seeded,
        }
    }

    pub fn next_delay(&mut self, attempt: u32) -> Duration {
        let nominal_us = self.nominal_us(attempt);
        let min_us = (nominal_us / 2).max(1);
        let max_us = nominal_us.saturating_add(nominal_us / 2).max(min_us);
        let span = max_us.saturating_sub(min_us).saturating_add(1);
        let jitter = self.next_u64() % span;
        Duration::from_micros(min_us.saturating_add(jitter))
    }

    pub fn sleep_for_attempt(&mut self, attempt: u32) -> Duration {
        let delay = self.next_delay(attempt);
        std::thread::sleep(delay);
        delay
    }

    fn nominal_us(&self, attempt: u32) -> u64 {
        let shift = attempt.min(31);
        let scaled = self
            .policy
            .base_backoff_us
            .saturating_mul(1_u64 << shift)
            .max(self.policy.base_backoff_us);
        scaled.min(self.policy.max_backoff_us)
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.rng_state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng_state = x;
        x
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunError {
    /// Conflicts persisted through every allowed attempt.
    Exhausted { attempts: u32 },
    /// The body failed with a non-conflict error; not retried.
    Stm(StmError),
    Region(RegionError),
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::Exhausted { attempts } => {
                write!(f, "transaction kept conflicting after {} attempts", attempts)
            }
            RunError::Stm(err) => write!(f, "transaction failed: {}", err),
            RunError::Region(err) => write!(f, "region error: {}", err),
        }
    }
}

impl std::error::Error for RunError {}

impl Region {
    /// Run `body` in a fresh transaction, retrying conflict aborts with
    /// jittered backoff until it commits. Conflicts are the normal path
    /// for this engine; everything else propagates after discarding the
    /// attempt.
    pub fn run<T, F>(&self, read_only: bool, policy: RetryPolicy, mut body: F) -> Result<T, RunError>
    where
        F: FnMut(&Region, &mut Transaction) -> Result<T, StmError>,
    {
        let mut backoff = RetryBackoff::with_seed(self.seed_for_backoff(), policy);

        for attempt in 0..policy.max_attempts {
            let mut tx = self.begin(read_only).map_err(RunError::Region)?;

            match body(self, &mut tx) {
                Ok(value) => {
                    if self.end(tx) {
                        return Ok(value);
                    }
                }
                Err(err) if err.is_conflict() => {
                    let _ = self.end(tx);
                }
                Err(err) => {
                    // Discard partial effects of the failed attempt.
                    tx.aborted = true;
                    let _ = self.end(tx);
                    return Err(RunError::Stm(err));
                }
            }

            if attempt + 1 < policy.max_attempts {
                backoff.sleep_for_attempt(attempt);
            }
        }

        Err(RunError::Exhausted {
            attempts: policy.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{RetryBackoff, RetryPolicy, RunError};
    use crate::region::{Region, StmError};

    #[test]
    fn next_delay_stays_within_the_jitter_window() {
        let policy = RetryPolicy {
            base_backoff_us: 100,
            max_backoff_us: 1_600,
            max_attempts: 8,
        };
        let mut backoff = RetryBackoff::with_seed(7, policy);

        for attempt in 0..16 {
            let nominal = (100_u64 << attempt.min(31)).min(1_600);
            let delay = backoff.next_delay(attempt).as_micros() as u64;
            assert!(delay >= nominal / 2, "attempt {}: {} too small", attempt, delay);
            assert!(
                delay <= nominal + nominal / 2,
                "attempt {}: {} too large",
                attempt,
                delay
            );
        }
    }

    #[test]
    fn zero_seed_still_produces_jitter() {
        let mut backoff = RetryBackoff::with_seed(0, RetryPolicy::default());
        let a = backoff.next_delay(0);
        let b = backoff.next_delay(0);
        assert!(a.as_micros() > 0 && b.as_micros() > 0);
    }

    #[test]
    fn run_commits_a_simple_body_first_try() {
        let region = Region::with_first_segment(32, 8).expect("region");
        let value = region
            .run(false, RetryPolicy::default(), |region, tx| {
                region.write(tx, &0xAB_u64.to_le_bytes(), region.first_addr())?;
                Ok(0xAB_u64)
            })
            .expect("commit");
        assert_eq!(value, 0xAB);
    }

    #[test]
    fn run_propagates_non_conflict_errors_without_retrying() {
        let region = Region::with_first_segment(32, 8).expect("region");
        let err = region
            .run::<(), _>(false, RetryPolicy::default(), |region, tx| {
                region.alloc(tx, 12).map(|_| ())
            })
            .expect_err("invalid alloc size");
        assert!(matches!(
            err,
            RunError::Stm(StmError::InvalidLength { len: 12, .. })
        ));
        assert_eq!(region.stats().commits, 0);
    }
}
