//! C5 Retry Engine (§4.5).
//!
//! The teacher crate never abstracts retries: `qwen3_api::client::qwen3_tts_infer`
//! hand-rolls a 3-attempt loop with a flat `sleep(Duration::from_secs(2))`
//! between attempts. This module generalizes that loop into a strategy
//! trait plus a cancellation-aware executor, since §4.5 names four distinct
//! schedules used by different callers (LLM passes, TTS workers).

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{ConversionError, ErrorKind};

/// A retry schedule: how many attempts, whether a given failure is worth
/// retrying, and how long to wait before the next attempt.
pub trait RetryStrategy: Send + Sync {
    /// `None` means unbounded (the Infinite strategy).
    fn max_attempts(&self) -> Option<u32>;
    fn should_retry(&self, error: &ConversionError, attempt: u32) -> bool {
        if error.is_cancellation() {
            return false;
        }
        if !error.kind.is_retriable() {
            return false;
        }
        match self.max_attempts() {
            Some(max) => attempt + 1 < max,
            None => true,
        }
    }
    fn delay_for(&self, attempt: u32) -> Duration;
}

/// `base * multiplier^attempt`, capped at `max_delay`, finite attempts.
pub struct ExponentialBackoff {
    pub base: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl RetryStrategy for ExponentialBackoff {
    fn max_attempts(&self) -> Option<u32> {
        Some(self.max_attempts)
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.base.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(scaled).min(self.max_delay)
    }
}

/// Explicit delay array. The LLM schedule per §4.5:
/// `[1s, 3s, 5s, 10s, 30s, 60s, 120s, 300s, 600s]`.
pub struct FixedDelays {
    pub delays: Vec<Duration>,
}

impl FixedDelays {
    pub fn llm() -> Self {
        Self {
            delays: [1, 3, 5, 10, 30, 60, 120, 300, 600]
                .into_iter()
                .map(Duration::from_secs)
                .collect(),
        }
    }
}

impl RetryStrategy for FixedDelays {
    fn max_attempts(&self) -> Option<u32> {
        Some(self.delays.len() as u32 + 1)
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        self.delays
            .get(attempt as usize)
            .copied()
            .unwrap_or_else(|| *self.delays.last().unwrap())
    }
}

/// Unbounded attempts; only cancellation terminates the loop. Used for TTS.
/// Delay schedule: `10s, 30s, then 30s * 3^(attempt-1)` capped at 10 min.
pub struct InfiniteRetry;

impl RetryStrategy for InfiniteRetry {
    fn max_attempts(&self) -> Option<u32> {
        None
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let cap = Duration::from_secs(600);
        match attempt {
            0 => Duration::from_secs(10),
            1 => Duration::from_secs(30),
            n => {
                let scaled = 30.0 * 3f64.powi((n - 1) as i32);
                Duration::from_secs_f64(scaled).min(cap)
            }
        }
    }
}

/// `base + increment * attempt`.
pub struct Linear {
    pub base: Duration,
    pub increment: Duration,
    pub max_attempts: u32,
}

impl RetryStrategy for Linear {
    fn max_attempts(&self) -> Option<u32> {
        Some(self.max_attempts)
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        self.base + self.increment * attempt
    }
}

/// Runs `operation` under `strategy`, honoring `cancel` at every suspension
/// point (§4.5): checks cancellation before each attempt, and the sleep
/// between attempts is itself cancellation-aware.
pub async fn run_with_retry<T, F, Fut>(
    strategy: &dyn RetryStrategy,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, ConversionError>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, ConversionError>>,
{
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(ConversionError::cancelled());
        }

        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if error.is_cancellation() {
                    return Err(error);
                }
                if !strategy.should_retry(&error, attempt) {
                    return Err(error);
                }
                let delay = strategy.delay_for(attempt);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ConversionError::cancelled()),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

fn retriable_error() -> ConversionError {
    ConversionError::new(ErrorKind::LlmApiError, "transient")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infinite_retry_delays_are_monotonically_non_decreasing_up_to_cap() {
        let strategy = InfiniteRetry;
        let mut previous = Duration::from_secs(0);
        for attempt in 0..20 {
            let delay = strategy.delay_for(attempt);
            assert!(delay >= previous || delay == Duration::from_secs(600));
            assert!(delay <= Duration::from_secs(600));
            previous = delay;
        }
    }

    #[test]
    fn fixed_delays_follow_llm_schedule() {
        let strategy = FixedDelays::llm();
        assert_eq!(strategy.delay_for(0), Duration::from_secs(1));
        assert_eq!(strategy.delay_for(1), Duration::from_secs(3));
        assert_eq!(strategy.delay_for(2), Duration::from_secs(5));
    }

    #[test]
    fn should_retry_rejects_cancellation_regardless_of_strategy() {
        let strategy = InfiniteRetry;
        let err = ConversionError::cancelled();
        assert!(!strategy.should_retry(&err, 0));
    }

    #[test]
    fn should_retry_respects_max_attempts_for_finite_strategies() {
        let strategy = ExponentialBackoff {
            base: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(1),
            max_attempts: 3,
        };
        assert!(strategy.should_retry(&retriable_error(), 0));
        assert!(strategy.should_retry(&retriable_error(), 1));
        assert!(!strategy.should_retry(&retriable_error(), 2));
    }

    #[tokio::test]
    async fn run_with_retry_succeeds_after_transient_failures() {
        let strategy = ExponentialBackoff {
            base: Duration::from_millis(1),
            multiplier: 1.0,
            max_delay: Duration::from_millis(5),
            max_attempts: 5,
        };
        let cancel = CancellationToken::new();
        let attempts = std::sync::atomic::AtomicU32::new(0);

        let result = run_with_retry(&strategy, &cancel, |_attempt| {
            let count = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move {
                if count < 2 {
                    Err(retriable_error())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_with_retry_stops_immediately_on_cancellation() {
        let strategy = InfiniteRetry;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<i32, ConversionError> =
            run_with_retry(&strategy, &cancel, |_attempt| async { Err(retriable_error()) }).await;

        assert!(result.unwrap_err().is_cancellation());
    }
}
