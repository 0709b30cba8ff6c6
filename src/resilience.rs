//! Resilience guard: circuit breaker plus retry-with-backoff.
//!
//! Wraps calls to flaky external operations (package installs, network
//! fetches). Each named resource gets its own breaker, created lazily on
//! first use and shared by every module that touches that resource:
//!
//! - **Closed**: calls pass through; consecutive failures up to a threshold
//!   trip the breaker open.
//! - **Open**: calls are rejected immediately (fail-fast) until the open
//!   timeout elapses, then exactly one trial call is let through.
//! - **HalfOpen**: trial success closes the breaker, trial failure re-opens
//!   it and restarts the timeout.
//!
//! The retry layer sits on top: up to `max_retries` attempts with exponential
//! backoff and ±50% jitter (so concurrently-running modules don't retry in
//! lockstep). A `CircuitOpen` rejection is never retried.

use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Breaker state for one named external resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Tunables for a circuit breaker.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker open
    pub failure_threshold: u32,
    /// Successes in HalfOpen needed to close (default 1)
    pub success_threshold: u32,
    /// How long an open breaker rejects calls before allowing a trial
    pub open_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 1,
            open_timeout: Duration::from_secs(60),
        }
    }
}

/// Tunables for the retry wrapper.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Maximum attempts for a protected call (first attempt included)
    pub max_retries: u32,
    /// Backoff for the first retry
    pub base_delay: Duration,
    /// Exponential growth factor per attempt
    pub backoff_factor: f64,
    /// Hard cap on a single backoff sleep
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Failure of a guarded call.
#[derive(Error, Debug)]
pub enum GuardError {
    /// The resource's breaker is rejecting calls (fail-fast, not retryable)
    #[error("circuit breaker for '{resource}' is open")]
    CircuitOpen { resource: String },

    /// The wrapped operation itself failed on its final attempt
    #[error(transparent)]
    Operation(#[from] anyhow::Error),
}

/// One breaker's mutable state. Guarded by the per-name lock in
/// [`ResilienceGuard`]; multiple modules may share a breaker name.
#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    last_opened_at: Option<Instant>,
    /// True while the single HalfOpen trial call is in flight
    probe_in_flight: bool,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            last_opened_at: None,
            probe_in_flight: false,
        }
    }

    /// Decide whether a call may proceed right now, transitioning
    /// Open -> HalfOpen when the timeout has elapsed.
    fn try_acquire(&mut self, config: &BreakerConfig) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = self
                    .last_opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= config.open_timeout {
                    self.state = CircuitState::HalfOpen;
                    self.half_open_successes = 0;
                    self.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            // Only one trial call at a time.
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    false
                } else {
                    self.probe_in_flight = true;
                    true
                }
            }
        }
    }

    fn on_success(&mut self, config: &BreakerConfig) {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                self.probe_in_flight = false;
                self.half_open_successes += 1;
                if self.half_open_successes >= config.success_threshold {
                    self.state = CircuitState::Closed;
                    self.consecutive_failures = 0;
                    self.last_opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&mut self, config: &BreakerConfig) {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= config.failure_threshold {
                    self.state = CircuitState::Open;
                    self.last_opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                self.probe_in_flight = false;
                self.state = CircuitState::Open;
                self.last_opened_at = Some(Instant::now());
            }
            CircuitState::Open => {}
        }
    }
}

/// Shared guard wrapping flaky external calls in breaker + retry.
///
/// Lives for the process lifetime of the orchestrator; breakers are keyed by
/// resource name and created lazily on first use.
pub struct ResilienceGuard {
    breaker_config: BreakerConfig,
    retry_config: RetryConfig,
    breakers: Mutex<HashMap<String, Arc<Mutex<Breaker>>>>,
}

impl ResilienceGuard {
    pub fn new(breaker_config: BreakerConfig, retry_config: RetryConfig) -> Self {
        Self {
            breaker_config,
            retry_config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Run `op` under the named resource's breaker with retry and backoff.
    ///
    /// Only failures of the wrapped operation are retried; callers must
    /// validate inputs before invoking this, since input errors would be
    /// pointlessly re-attempted. Returns `GuardError::CircuitOpen`
    /// immediately (no retries) once the breaker rejects.
    pub fn protect<T>(
        &self,
        resource: &str,
        mut op: impl FnMut() -> anyhow::Result<T>,
    ) -> Result<T, GuardError> {
        let breaker = self.breaker(resource);
        let mut last_err: Option<anyhow::Error> = None;

        for attempt in 0..self.retry_config.max_retries {
            if attempt > 0 {
                let delay = self.backoff_delay(attempt - 1);
                debug!(resource, attempt, ?delay, "retrying protected call");
                std::thread::sleep(delay);
            }

            let admitted = {
                let mut guard = breaker.lock().expect("breaker mutex poisoned");
                guard.try_acquire(&self.breaker_config)
            };
            if !admitted {
                // Fail-fast; retrying an open circuit is pointless.
                return Err(GuardError::CircuitOpen {
                    resource: resource.to_string(),
                });
            }

            // The operation may panic (module phases are allowed to) and the
            // breaker must still record the outcome, or a HalfOpen trial
            // would hold its probe slot forever.
            let outcome =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(&mut op));
            match outcome {
                Ok(Ok(value)) => {
                    let mut guard = breaker.lock().expect("breaker mutex poisoned");
                    guard.on_success(&self.breaker_config);
                    return Ok(value);
                }
                Ok(Err(err)) => {
                    warn!(resource, attempt, error = %err, "protected call failed");
                    let mut guard = breaker.lock().expect("breaker mutex poisoned");
                    guard.on_failure(&self.breaker_config);
                    last_err = Some(err);
                }
                Err(panic) => {
                    warn!(resource, attempt, "protected call panicked");
                    {
                        let mut guard = breaker.lock().expect("breaker mutex poisoned");
                        guard.on_failure(&self.breaker_config);
                    }
                    std::panic::resume_unwind(panic);
                }
            }
        }

        Err(GuardError::Operation(last_err.unwrap_or_else(|| {
            anyhow::anyhow!("protected call failed with no attempts")
        })))
    }

    /// Current state of the named breaker (Closed if never used).
    pub fn state(&self, resource: &str) -> CircuitState {
        let breakers = self.breakers.lock().expect("breaker registry poisoned");
        breakers
            .get(resource)
            .map(|b| b.lock().expect("breaker mutex poisoned").state)
            .unwrap_or(CircuitState::Closed)
    }

    fn breaker(&self, resource: &str) -> Arc<Mutex<Breaker>> {
        let mut breakers = self.breakers.lock().expect("breaker registry poisoned");
        breakers
            .entry(resource.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Breaker::new())))
            .clone()
    }

    /// `base * factor^attempt`, capped at `max_delay`, with ±50% jitter.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.retry_config.base_delay.as_secs_f64()
            * self.retry_config.backoff_factor.powi(attempt as i32);
        let capped = base.min(self.retry_config.max_delay.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.5..=1.5);
        Duration::from_secs_f64(capped * jitter)
    }
}

impl Default for ResilienceGuard {
    fn default() -> Self {
        Self::new(BreakerConfig::default(), RetryConfig::default())
    }
}
