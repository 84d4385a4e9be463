//! Circuit breaker guarding the inference backend.
//!
//! Prevents cascading failures by fast-failing while the backend is
//! misbehaving.
//!
//! ## States
//! - **Closed**: calls pass through; counted failures within the sliding
//!   window accumulate toward the threshold
//! - **Open**: calls are rejected immediately; after the cooldown the next
//!   call becomes the half-open trial
//! - **Half-Open**: exactly one trial call is admitted; its outcome alone
//!   decides closed (success) or open (counted failure)
//!
//! Only counted failures ([`GovernorError::is_counted`]) move the breaker:
//! a caller's malformed input says nothing about backend health and passes
//! through unrecorded.

use crate::GovernorError;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitStatus {
    /// Requests flow through normally.
    Closed,
    /// Requests are rejected immediately without reaching the backend.
    Open,
    /// One trial request is allowed through to test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct BreakerConfig {
    failure_threshold: usize,
    window: Duration,
    cooldown: Duration,
}

#[derive(Debug)]
struct BreakerState {
    status: CircuitStatus,
    consecutive_failures: usize,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    last_transition: Instant,
    trial_in_flight: bool,
    successes_total: u64,
    failures_total: u64,
}

/// Point-in-time breaker statistics.
#[derive(Debug, Clone, Copy)]
pub struct BreakerStats {
    /// Current state.
    pub status: CircuitStatus,
    /// Counted failures in the current window.
    pub consecutive_failures: usize,
    /// Total successes recorded over the breaker's lifetime.
    pub successes_total: u64,
    /// Total counted failures recorded over the breaker's lifetime.
    pub failures_total: u64,
    /// Wall-clock time spent in the current state.
    pub time_in_state: Duration,
}

/// Per-backend failure-rate gate. Cheap to clone; clones share state.
///
/// One instance guards one backend for the process lifetime.
#[derive(Clone)]
pub struct CircuitBreaker {
    state: Arc<RwLock<BreakerState>>,
    config: BreakerConfig,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("failure_threshold", &self.config.failure_threshold)
            .field("window", &self.config.window)
            .field("cooldown", &self.config.cooldown)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Create a breaker.
    ///
    /// `failure_threshold` counted failures within `window` open the
    /// circuit; after `cooldown` one half-open trial is admitted.
    pub fn new(failure_threshold: usize, window: Duration, cooldown: Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(BreakerState {
                status: CircuitStatus::Closed,
                consecutive_failures: 0,
                last_failure: None,
                opened_at: None,
                last_transition: Instant::now(),
                trial_in_flight: false,
                successes_total: 0,
                failures_total: 0,
            })),
            config: BreakerConfig {
                failure_threshold: failure_threshold.max(1),
                window,
                cooldown,
            },
        }
    }

    /// Execute an operation through the breaker.
    ///
    /// While open, the operation is never invoked and
    /// [`GovernorError::CircuitOpen`] is returned immediately. Counted
    /// failures move the state machine; uncounted errors pass through
    /// without recording.
    ///
    /// # Errors
    ///
    /// [`GovernorError::CircuitOpen`] on rejection, otherwise whatever the
    /// operation returns.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T, GovernorError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, GovernorError>>,
    {
        self.admit().await?;

        let result = f().await;

        match &result {
            Ok(_) => self.record_success().await,
            Err(e) if e.is_counted() => self.record_failure().await,
            Err(e) => self.release_trial(e).await,
        }

        result
    }

    /// Run a health probe through the gate without recording its outcome.
    ///
    /// While open, the probe is rejected like any call — but it never
    /// consumes the half-open trial and never moves the state machine, so
    /// periodic health checks cannot flap the breaker.
    ///
    /// # Errors
    ///
    /// [`GovernorError::CircuitOpen`] while open, otherwise whatever the
    /// probe returns.
    pub async fn probe<F, Fut, T>(&self, f: F) -> Result<T, GovernorError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, GovernorError>>,
    {
        {
            let state = self.state.read().await;
            if state.status == CircuitStatus::Open {
                return Err(GovernorError::CircuitOpen);
            }
        }
        f().await
    }

    /// Admission check, transitioning open → half-open once the cooldown
    /// elapses. Holds the write lock so two concurrent callers cannot both
    /// claim the half-open trial.
    async fn admit(&self) -> Result<(), GovernorError> {
        let mut state = self.state.write().await;
        match state.status {
            CircuitStatus::Closed => Ok(()),
            CircuitStatus::Open => {
                let cooled_down = state
                    .opened_at
                    .is_some_and(|t| t.elapsed() >= self.config.cooldown);
                if cooled_down {
                    state.status = CircuitStatus::HalfOpen;
                    state.trial_in_flight = true;
                    state.last_transition = Instant::now();
                    info!("circuit breaker: half-open, admitting trial call");
                    Ok(())
                } else {
                    debug!("circuit breaker: request rejected (open)");
                    Err(GovernorError::CircuitOpen)
                }
            }
            CircuitStatus::HalfOpen => {
                if state.trial_in_flight {
                    debug!("circuit breaker: trial already in flight, rejecting");
                    Err(GovernorError::CircuitOpen)
                } else {
                    state.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    async fn record_success(&self) {
        let mut state = self.state.write().await;
        state.successes_total += 1;
        match state.status {
            CircuitStatus::HalfOpen => {
                state.status = CircuitStatus::Closed;
                state.consecutive_failures = 0;
                state.trial_in_flight = false;
                state.last_transition = Instant::now();
                info!("circuit breaker: closed (trial succeeded)");
            }
            CircuitStatus::Closed => {
                state.consecutive_failures = 0;
            }
            CircuitStatus::Open => {}
        }
    }

    async fn record_failure(&self) {
        let mut state = self.state.write().await;
        state.failures_total += 1;

        let now = Instant::now();
        // A quiet window since the last failure resets the count.
        if let Some(last) = state.last_failure {
            if now.duration_since(last) > self.config.window {
                state.consecutive_failures = 0;
            }
        }
        state.consecutive_failures += 1;
        state.last_failure = Some(now);

        match state.status {
            CircuitStatus::Closed => {
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.status = CircuitStatus::Open;
                    state.opened_at = Some(now);
                    state.last_transition = now;
                    warn!(
                        failures = state.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        "circuit breaker: opened"
                    );
                }
            }
            CircuitStatus::HalfOpen => {
                state.status = CircuitStatus::Open;
                state.opened_at = Some(now);
                state.trial_in_flight = false;
                state.last_transition = now;
                warn!("circuit breaker: reopened (trial failed), cooldown restarted");
            }
            CircuitStatus::Open => {}
        }
    }

    /// An uncounted error during the half-open trial neither closes nor
    /// reopens the circuit; it just releases the trial slot.
    async fn release_trial(&self, error: &GovernorError) {
        let mut state = self.state.write().await;
        if state.status == CircuitStatus::HalfOpen && state.trial_in_flight {
            state.trial_in_flight = false;
            debug!(error = %error, "circuit breaker: uncounted error, trial slot released");
        }
    }

    /// Current state.
    pub async fn status(&self) -> CircuitStatus {
        self.state.read().await.status
    }

    /// Current statistics.
    pub async fn stats(&self) -> BreakerStats {
        let state = self.state.read().await;
        BreakerStats {
            status: state.status,
            consecutive_failures: state.consecutive_failures,
            successes_total: state.successes_total,
            failures_total: state.failures_total,
            time_in_state: state.last_transition.elapsed(),
        }
    }

    /// Manually reset to closed (operational override).
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        state.status = CircuitStatus::Closed;
        state.consecutive_failures = 0;
        state.trial_in_flight = false;
        state.last_transition = Instant::now();
        info!("circuit breaker: manually reset to closed");
    }

    /// Force open (maintenance override).
    pub async fn trip(&self) {
        let mut state = self.state.write().await;
        state.status = CircuitStatus::Open;
        state.opened_at = Some(Instant::now());
        state.trial_in_flight = false;
        state.last_transition = Instant::now();
        warn!("circuit breaker: manually tripped to open");
    }
}
