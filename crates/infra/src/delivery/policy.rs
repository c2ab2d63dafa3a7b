//! Timeout + circuit breaker guard around one asynchronous call site.
//!
//! ```text
//!            failures >= threshold
//!   Closed ───────────────────────────▶ Open ◀──────────┐
//!     ▲                                   │             │ trial fails
//!     │ trial succeeds                    │ break over  │
//!     └────────────── HalfOpen ◀──────────┘─────────────┘
//! ```
//!
//! All state lives in one `Mutex`-guarded struct owned by the policy. The admit
//! decision (fail fast, normal call, or the single HalfOpen trial) is taken under
//! that lock, so two callers can never both believe they are the trial.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Per publish path settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryPolicyConfig {
    /// Longest a single guarded call may run.
    pub timeout_budget: Duration,
    /// Consecutive failures that open the circuit (>= 1).
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial is allowed.
    pub break_duration: Duration,
}

impl Default for DeliveryPolicyConfig {
    fn default() -> Self {
        Self {
            timeout_budget: Duration::from_secs(5),
            failure_threshold: 2,
            break_duration: Duration::from_secs(8),
        }
    }
}

impl DeliveryPolicyConfig {
    pub fn new(timeout_budget: Duration, failure_threshold: u32, break_duration: Duration) -> Self {
        Self {
            timeout_budget,
            failure_threshold,
            break_duration,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold", "must be at least 1"));
        }
        if self.timeout_budget.is_zero() {
            return Err(ConfigError::invalid("timeout_budget", "must be greater than zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError<E> {
    /// The dependency is judged unhealthy; the action was not invoked.
    #[error("circuit open; retry after {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    /// The action did not finish within its deadline. Its effect is unknown.
    #[error("call exceeded its deadline of {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Failed(E),
}

/// Point-in-time view of the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
}

#[derive(Debug)]
struct BreakerState {
    circuit: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            circuit: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
        }
    }

    fn open(&mut self, now: Instant) {
        self.circuit = CircuitState::Open;
        self.opened_at = Some(now);
        self.trial_in_flight = false;
    }
}

/// Timeout + circuit breaker shared by every caller of one publish path.
///
/// Share it as `Arc<DeliveryPolicy>`; cloning the config into a second policy
/// gives an independent breaker.
#[derive(Debug)]
pub struct DeliveryPolicy {
    name: String,
    config: DeliveryPolicyConfig,
    state: Mutex<BreakerState>,
}

impl DeliveryPolicy {
    pub fn new(name: impl Into<String>, config: DeliveryPolicyConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState::closed()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &DeliveryPolicyConfig {
        &self.config
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let state = self.lock();
        CircuitSnapshot {
            state: state.circuit,
            consecutive_failures: state.consecutive_failures,
            opened_at: state.opened_at,
        }
    }

    /// Run `action` under the breaker with the full timeout budget.
    pub async fn execute<T, E, F, Fut>(&self, action: F) -> Result<T, DeliveryError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_within(self.config.timeout_budget, action).await
    }

    /// Run `action` under the breaker with deadline `min(deadline, timeout_budget)`.
    pub async fn execute_within<T, E, F, Fut>(
        &self,
        deadline: Duration,
        action: F,
    ) -> Result<T, DeliveryError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let guard = self
            .admit()
            .map_err(|retry_after| DeliveryError::CircuitOpen { retry_after })?;
        let budget = deadline.min(self.config.timeout_budget);

        match tokio::time::timeout(budget, action()).await {
            Ok(Ok(value)) => {
                guard.succeed();
                Ok(value)
            }
            Ok(Err(err)) => {
                guard.fail();
                Err(DeliveryError::Failed(err))
            }
            Err(_elapsed) => {
                guard.fail();
                Err(DeliveryError::Timeout(budget))
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decide whether a call may proceed. `Err` carries the suggested wait.
    fn admit(&self) -> Result<CallGuard<'_>, Duration> {
        let now = Instant::now();
        let mut state = self.lock();

        match state.circuit {
            CircuitState::Closed => Ok(CallGuard::new(self, false)),
            CircuitState::Open => {
                let opened_at = state.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed < self.config.break_duration {
                    return Err(self.config.break_duration - elapsed);
                }
                state.circuit = CircuitState::HalfOpen;
                state.trial_in_flight = true;
                info!(policy = %self.name, "circuit half-open; admitting trial call");
                Ok(CallGuard::new(self, true))
            }
            CircuitState::HalfOpen if state.trial_in_flight => Err(self.config.timeout_budget),
            CircuitState::HalfOpen => {
                state.trial_in_flight = true;
                Ok(CallGuard::new(self, true))
            }
        }
    }

    fn record_success(&self, trial: bool) {
        let mut state = self.lock();
        state.consecutive_failures = 0;
        if trial {
            state.circuit = CircuitState::Closed;
            state.opened_at = None;
            state.trial_in_flight = false;
            info!(policy = %self.name, "trial succeeded; circuit closed");
        }
    }

    fn record_failure(&self, trial: bool) {
        let now = Instant::now();
        let mut state = self.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);

        if trial {
            state.open(now);
            warn!(
                policy = %self.name,
                break_duration = ?self.config.break_duration,
                "trial failed; circuit re-opened"
            );
            return;
        }

        // Late failures from calls admitted before the circuit opened leave
        // `opened_at` alone.
        if state.circuit == CircuitState::Closed
            && state.consecutive_failures >= self.config.failure_threshold
        {
            state.open(now);
            warn!(
                policy = %self.name,
                consecutive_failures = state.consecutive_failures,
                break_duration = ?self.config.break_duration,
                "failure threshold reached; circuit opened"
            );
        } else {
            debug!(
                policy = %self.name,
                consecutive_failures = state.consecutive_failures,
                "guarded call failed"
            );
        }
    }
}

/// Admission ticket for one call. A trial dropped before it settles counts as a
/// failed trial, so the HalfOpen slot is never leaked by a cancelled caller.
struct CallGuard<'a> {
    policy: &'a DeliveryPolicy,
    trial: bool,
    settled: bool,
}

impl<'a> CallGuard<'a> {
    fn new(policy: &'a DeliveryPolicy, trial: bool) -> Self {
        Self {
            policy,
            trial,
            settled: false,
        }
    }

    fn succeed(mut self) {
        self.settled = true;
        self.policy.record_success(self.trial);
    }

    fn fail(mut self) {
        self.settled = true;
        self.policy.record_failure(self.trial);
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.policy.record_failure(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn policy(threshold: u32, break_secs: u64) -> DeliveryPolicy {
        DeliveryPolicy::new(
            "test",
            DeliveryPolicyConfig::new(Duration::from_secs(5), threshold, Duration::from_secs(break_secs)),
        )
        .unwrap()
    }

    async fn fail(policy: &DeliveryPolicy, calls: &AtomicUsize) -> Result<(), DeliveryError<&'static str>> {
        policy
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("broker down")
            })
            .await
    }

    async fn succeed(policy: &DeliveryPolicy, calls: &AtomicUsize) -> Result<(), DeliveryError<&'static str>> {
        policy
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<(), &'static str>(())
            })
            .await
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let config = DeliveryPolicyConfig::new(Duration::from_secs(1), 0, Duration::from_secs(1));
        assert!(DeliveryPolicy::new("bad", config).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_admits_trial_after_break() {
        let policy = policy(2, 8);
        let calls = AtomicUsize::new(0);

        assert_eq!(fail(&policy, &calls).await, Err(DeliveryError::Failed("broker down")));
        assert_eq!(policy.snapshot().state, CircuitState::Closed);
        assert!(fail(&policy, &calls).await.is_err());
        assert_eq!(policy.snapshot().state, CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tokio::time::advance(Duration::from_secs(1)).await;
        let err = succeed(&policy, &calls).await.unwrap_err();
        assert_eq!(
            err,
            DeliveryError::CircuitOpen {
                retry_after: Duration::from_secs(7)
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2, "open circuit must not invoke the action");

        tokio::time::advance(Duration::from_secs(8)).await;
        succeed(&policy, &calls).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let snapshot = policy.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.opened_at, None);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens_and_restarts_the_break() {
        let policy = policy(2, 8);
        let calls = AtomicUsize::new(0);
        let _ = fail(&policy, &calls).await;
        let _ = fail(&policy, &calls).await;
        let first_opened = policy.snapshot().opened_at.unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(matches!(fail(&policy, &calls).await, Err(DeliveryError::Failed(_))));

        let snapshot = policy.snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert!(snapshot.opened_at.unwrap() > first_opened);

        // Break counts from the failed trial, not from the first opening.
        tokio::time::advance(Duration::from_secs(7)).await;
        assert!(matches!(
            succeed(&policy, &calls).await,
            Err(DeliveryError::CircuitOpen { .. })
        ));
        tokio::time::advance(Duration::from_secs(1)).await;
        succeed(&policy, &calls).await.unwrap();
        assert_eq!(policy.snapshot().state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_failure_count() {
        let policy = policy(2, 8);
        let calls = AtomicUsize::new(0);

        let _ = fail(&policy, &calls).await;
        succeed(&policy, &calls).await.unwrap();
        let _ = fail(&policy, &calls).await;

        let snapshot = policy.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_action_times_out_within_budget() {
        let policy = policy(2, 8);
        let started = Instant::now();

        let result = policy
            .execute(|| std::future::pending::<Result<(), &'static str>>())
            .await;

        assert_eq!(result, Err(DeliveryError::Timeout(Duration::from_secs(5))));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_secs(6));
        assert_eq!(policy.snapshot().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn caller_deadline_shortens_the_budget() {
        let policy = policy(2, 8);
        let result = policy
            .execute_within(Duration::from_millis(250), || {
                std::future::pending::<Result<(), &'static str>>()
            })
            .await;
        assert_eq!(result, Err(DeliveryError::Timeout(Duration::from_millis(250))));

        let result = policy
            .execute_within(Duration::from_secs(60), || {
                std::future::pending::<Result<(), &'static str>>()
            })
            .await;
        assert_eq!(result, Err(DeliveryError::Timeout(Duration::from_secs(5))));
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_trial_runs_while_half_open() {
        let policy = Arc::new(policy(1, 8));
        let calls = Arc::new(AtomicUsize::new(0));
        let _ = fail(&policy, &calls).await;
        tokio::time::advance(Duration::from_secs(8)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let policy = Arc::clone(&policy);
            tokio::spawn(async move {
                policy
                    .execute(|| async move {
                        let _ = release_rx.await;
                        Ok::<(), &'static str>(())
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(policy.snapshot().state, CircuitState::HalfOpen);

        let second = succeed(&policy, &calls).await;
        assert!(matches!(second, Err(DeliveryError::CircuitOpen { .. })));

        release_tx.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(policy.snapshot().state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_trial_counts_as_failed() {
        let policy = policy(1, 8);
        let calls = AtomicUsize::new(0);
        let _ = fail(&policy, &calls).await;
        tokio::time::advance(Duration::from_secs(8)).await;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            policy.execute(|| std::future::pending::<Result<(), &'static str>>()),
        )
        .await;
        assert!(abandoned.is_err());

        let snapshot = policy.snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert!(matches!(
            succeed(&policy, &calls).await,
            Err(DeliveryError::CircuitOpen { .. })
        ));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: consecutive failures invoke the action exactly `threshold` times,
            /// after which every call fails fast.
            #[test]
            fn failures_beyond_threshold_never_reach_the_action(threshold in 1u32..6, extra in 0u32..6) {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();

                runtime.block_on(async {
                    let policy = policy(threshold, 8);
                    let calls = AtomicUsize::new(0);
                    for _ in 0..threshold + extra {
                        let _ = fail(&policy, &calls).await;
                    }
                    prop_assert_eq!(calls.load(Ordering::SeqCst), threshold as usize);
                    prop_assert_eq!(policy.snapshot().state, CircuitState::Open);
                    Ok(())
                })?;
            }
        }
    }
}
