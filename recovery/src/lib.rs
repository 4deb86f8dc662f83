//! Error-recovery core: every fallible outbound operation in the relayer is
//! executed through [`RecoveryManager::execute`], which layers a per-kind
//! circuit breaker, exponential backoff with jitter, and the process-wide
//! emergency stop over the underlying call.

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    time::{Duration, Instant},
};

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use relayer_types::{config::RetryOptions, OperationKind, RelayError};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

pub mod breaker;

pub use breaker::{BreakerSnapshot, BreakerState, CircuitBreaker};

/// Rolling window over which per-kind error rates are computed.
const STATS_WINDOW: Duration = Duration::from_secs(300);

/// Minimum samples in the window before an error rate counts against health.
const STATS_MIN_SAMPLES: usize = 5;

/// Error rate above which an operation kind is considered unhealthy.
const UNHEALTHY_ERROR_RATE: f64 = 0.5;

/// Open breakers tolerated before the whole process reports unhealthy.
const MAX_OPEN_BREAKERS: usize = 2;

/// Chain errors (accepted-but-rejected transactions) retry fewer times than
/// plain network transients.
const CHAIN_ERROR_MAX_ATTEMPTS: u32 = 2;

/// Deadline applied to every guarded call. A hung RPC surfaces as a
/// transient timeout instead of stalling its worker.
const OPERATION_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
struct OpStats {
    window: VecDeque<(Instant, bool)>,
    total: u64,
    failures: u64,
    last_latency: Option<Duration>,
}

impl OpStats {
    fn record(&mut self, ok: bool, latency: Duration) {
        self.total += 1;
        if !ok {
            self.failures += 1;
        }
        self.last_latency = Some(latency);
        self.window.push_back((Instant::now(), ok));
        let horizon = Instant::now() - STATS_WINDOW;
        while self.window.front().is_some_and(|(at, _)| *at < horizon) {
            self.window.pop_front();
        }
    }

    fn error_rate(&self) -> f64 {
        if self.window.len() < STATS_MIN_SAMPLES {
            return 0.0;
        }
        let failures = self.window.iter().filter(|(_, ok)| !ok).count();
        failures as f64 / self.window.len() as f64
    }
}

/// Per-kind operation counters for health reporting.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperationStats {
    pub kind: OperationKind,
    pub total: u64,
    pub failures: u64,
    pub error_rate: f64,
    pub last_latency_ms: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecoveryHealth {
    pub healthy: bool,
    pub emergency_stop: Option<String>,
    pub breakers: Vec<BreakerSnapshot>,
    pub operations: Vec<OperationStats>,
}

/// Process-wide recovery state: breakers, retry policy, emergency stop.
#[derive(Debug)]
pub struct RecoveryManager {
    opt: RetryOptions,
    evm: CircuitBreaker,
    ibc: CircuitBreaker,
    ibc_transfer: CircuitBreaker,
    fallback: CircuitBreaker,
    stopped: RwLock<Option<String>>,
    stats: Mutex<HashMap<OperationKind, OpStats>>,
}

impl RecoveryManager {
    pub fn new(opt: RetryOptions) -> Self {
        let threshold = opt.failure_threshold;
        let cooldown = opt.cooldown;
        Self {
            opt,
            evm: CircuitBreaker::new("evm", threshold, cooldown),
            ibc: CircuitBreaker::new("ibc", threshold, cooldown),
            ibc_transfer: CircuitBreaker::new("ibc-transfer", threshold, cooldown),
            fallback: CircuitBreaker::new("default", threshold, cooldown),
            stopped: RwLock::new(None),
            stats: Mutex::new(HashMap::new()),
        }
    }

    fn breaker_for(&self, kind: OperationKind) -> &CircuitBreaker {
        match kind {
            OperationKind::EvmRpc | OperationKind::ContractCall | OperationKind::HtlcCreation => {
                &self.evm
            },
            OperationKind::IbcRpc => &self.ibc,
            OperationKind::IbcTransfer => &self.ibc_transfer,
            _ => &self.fallback,
        }
    }

    fn max_attempts(&self, kind: OperationKind) -> u32 {
        match kind {
            // The relay engine runs its own attempt accounting; one pass
            // through here per engine attempt.
            OperationKind::Relay => 1,
            // Refunds are re-attempted by the next scan cycle anyway.
            OperationKind::RecoveryCheck => 2,
            _ => self.opt.max_attempts,
        }
        .max(1)
    }

    /// Execute `op`, retrying transient failures with exponential backoff.
    ///
    /// Ordering per attempt: emergency stop, breaker gate, the call itself.
    /// An open breaker surfaces [`RelayError::CircuitOpen`] without invoking
    /// the operation and without retrying. Non-retriable errors
    /// (validation, business outcomes) short-circuit immediately.
    pub async fn execute<T, Fut>(
        &self,
        kind: OperationKind,
        id: &str,
        op: impl Fn() -> Fut,
    ) -> Result<T, RelayError>
    where
        Fut: Future<Output = Result<T, RelayError>>,
    {
        let breaker = self.breaker_for(kind);
        let max = self.max_attempts(kind);
        let mut last_err = RelayError::TransientNetwork("no attempt was made".into());

        for attempt in 1..=max {
            if let Some(reason) = self.stopped.read().clone() {
                return Err(RelayError::EmergencyStopped(reason));
            }
            if !breaker.try_acquire() {
                tracing::warn!(%kind, id, breaker = breaker.name(), "refusing operation, breaker open");
                return Err(RelayError::CircuitOpen { kind });
            }

            let start = Instant::now();
            // `Relay` wraps a whole pipeline of guarded calls, each carrying
            // its own deadline; a second outer deadline would cut inner
            // retries short.
            let result = if kind == OperationKind::Relay {
                op().await
            } else {
                match tokio::time::timeout(OPERATION_DEADLINE, op()).await {
                    Ok(result) => result,
                    Err(_) => Err(RelayError::TransientNetwork(format!(
                        "operation exceeded the {}s deadline",
                        OPERATION_DEADLINE.as_secs()
                    ))),
                }
            };
            match result {
                Ok(value) => {
                    breaker.record_success();
                    self.record(kind, true, start.elapsed());
                    return Ok(value);
                },
                Err(err) => {
                    self.record(kind, false, start.elapsed());
                    if !err.is_retriable() {
                        // Business and validation outcomes say nothing
                        // about the health of the underlying subsystem.
                        return Err(err);
                    }
                    breaker.record_failure();
                    let bound = if matches!(err, RelayError::Chain(_)) {
                        max.min(CHAIN_ERROR_MAX_ATTEMPTS)
                    } else {
                        max
                    };
                    tracing::warn!(%kind, id, attempt, error = %err, "operation failed");
                    last_err = err;
                    if attempt >= bound {
                        break;
                    }
                    sleep(self.delay(attempt)).await;
                },
            }
        }

        tracing::error!(%kind, id, error = %last_err, "operation failed after all attempts");
        Err(last_err)
    }

    /// Backoff for the given (1-based) attempt number.
    fn delay(&self, attempt: u32) -> Duration {
        let base = self.opt.base_delay.as_millis() as f64
            * self.opt.multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.opt.max_delay.as_millis() as f64);
        let millis = if self.opt.jitter {
            capped * rand::thread_rng().gen_range(0.75..=1.25)
        } else {
            capped
        };
        Duration::from_millis(millis as u64)
    }

    fn record(&self, kind: OperationKind, ok: bool, latency: Duration) {
        self.stats
            .lock()
            .entry(kind)
            .or_default()
            .record(ok, latency);
    }

    pub fn emergency_stop(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!(%reason, "EMERGENCY STOP");
        *self.stopped.write() = Some(reason);
    }

    pub fn resume(&self) {
        tracing::info!("emergency stop lifted");
        *self.stopped.write() = None;
    }

    pub fn stop_reason(&self) -> Option<String> {
        self.stopped.read().clone()
    }

    /// Operator command: force the breaker guarding `kind` open.
    pub fn trip(&self, kind: OperationKind, reason: &str) {
        self.breaker_for(kind).trip(reason);
    }

    /// Operator command: reset the breaker guarding `kind`.
    pub fn reset(&self, kind: OperationKind) {
        self.breaker_for(kind).reset();
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers() {
            breaker.reset();
        }
    }

    fn breakers(&self) -> [&CircuitBreaker; 4] {
        [&self.evm, &self.ibc, &self.ibc_transfer, &self.fallback]
    }

    /// Healthy = not stopped, at most [`MAX_OPEN_BREAKERS`] breakers open,
    /// and no operation kind failing more than half the time over the
    /// rolling window.
    pub fn is_healthy(&self) -> bool {
        if self.stopped.read().is_some() {
            return false;
        }
        let open = self
            .breakers()
            .iter()
            .filter(|b| b.state() == BreakerState::Open)
            .count();
        if open > MAX_OPEN_BREAKERS {
            return false;
        }
        let stats = self.stats.lock();
        stats.values().all(|s| s.error_rate() <= UNHEALTHY_ERROR_RATE)
    }

    pub fn health(&self) -> RecoveryHealth {
        let operations = {
            let stats = self.stats.lock();
            let mut ops: Vec<_> = stats
                .iter()
                .map(|(kind, s)| OperationStats {
                    kind: *kind,
                    total: s.total,
                    failures: s.failures,
                    error_rate: s.error_rate(),
                    last_latency_ms: s.last_latency.map(|l| l.as_millis() as u64),
                })
                .collect();
            ops.sort_by_key(|s| s.kind.to_string());
            ops
        };
        RecoveryHealth {
            healthy: self.is_healthy(),
            emergency_stop: self.stopped.read().clone(),
            breakers: self.breakers().iter().map(|b| b.snapshot()).collect(),
            operations,
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU32, Ordering};

    use relayer_utils::test_utils::setup_test;

    use super::*;

    fn fast_options() -> RetryOptions {
        RetryOptions {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            multiplier: 2.0,
            jitter: false,
            max_attempts: 4,
            failure_threshold: 3,
            cooldown: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        setup_test();
        let mgr = RecoveryManager::new(fast_options());
        let calls = AtomicU32::new(0);

        let result = mgr
            .execute(OperationKind::EvmRpc, "relay-1", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RelayError::TransientNetwork("timeout".into()))
                } else {
                    Ok(42u64)
                }
            })
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Fewer failures than the threshold: the breaker stays closed.
        assert!(mgr.is_healthy());
    }

    #[tokio::test]
    async fn exhaustion_surfaces_the_last_error() {
        setup_test();
        let mgr = RecoveryManager::new(fast_options());
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = mgr
            .execute(OperationKind::IbcRpc, "relay-2", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RelayError::TransientNetwork("still down".into()))
            })
            .await;

        assert_eq!(
            result,
            Err(RelayError::TransientNetwork("still down".into()))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn chain_errors_get_a_lower_retry_bound() {
        setup_test();
        let mgr = RecoveryManager::new(fast_options());
        let calls = AtomicU32::new(0);

        let _: Result<(), _> = mgr
            .execute(OperationKind::ContractCall, "relay-3", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RelayError::Chain("execution reverted".into()))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), CHAIN_ERROR_MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn validation_errors_short_circuit() {
        setup_test();
        let mgr = RecoveryManager::new(fast_options());
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = mgr
            .execute(OperationKind::Relay, "relay-4", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RelayError::Validation("bad memo".into()))
            })
            .await;

        assert_eq!(result, Err(RelayError::Validation("bad memo".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn open_breaker_refuses_without_invoking_the_operation() {
        setup_test();
        let mut opt = fast_options();
        opt.cooldown = Duration::from_secs(600);
        let mgr = RecoveryManager::new(opt);
        mgr.trip(OperationKind::EvmRpc, "test");

        let calls = AtomicU32::new(0);
        let result: Result<(), _> = mgr
            .execute(OperationKind::EvmRpc, "relay-5", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert_eq!(
            result,
            Err(RelayError::CircuitOpen {
                kind: OperationKind::EvmRpc
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // ContractCall maps to the same breaker; IbcRpc does not.
        let result: Result<(), _> = mgr
            .execute(OperationKind::ContractCall, "relay-5", || async { Ok(()) })
            .await;
        assert!(matches!(result, Err(RelayError::CircuitOpen { .. })));
        let result = mgr
            .execute(OperationKind::IbcRpc, "relay-5", || async { Ok(1) })
            .await;
        assert_eq!(result, Ok(1));
    }

    #[tokio::test]
    async fn emergency_stop_fails_everything_immediately() {
        setup_test();
        let mgr = RecoveryManager::new(fast_options());
        mgr.emergency_stop("drill");
        assert!(!mgr.is_healthy());

        let result = mgr
            .execute(OperationKind::IbcTransfer, "relay-6", || async { Ok(()) })
            .await;
        assert_eq!(result, Err(RelayError::EmergencyStopped("drill".into())));

        mgr.resume();
        assert!(mgr.is_healthy());
        let result = mgr
            .execute(OperationKind::IbcTransfer, "relay-6", || async { Ok(()) })
            .await;
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn breaker_recovers_after_cooldown() {
        setup_test();
        let mgr = RecoveryManager::new(fast_options());

        // Trip the EVM breaker through real failures.
        for _ in 0..3 {
            let _: Result<(), _> = mgr
                .execute(OperationKind::EvmRpc, "relay-7", || async {
                    Err(RelayError::Chain("revert".into()))
                })
                .await;
        }
        let result: Result<(), _> = mgr
            .execute(OperationKind::EvmRpc, "relay-7", || async { Ok(()) })
            .await;
        assert!(matches!(result, Err(RelayError::CircuitOpen { .. })));

        // After the cooldown, the next call is the half-open probe.
        sleep(Duration::from_millis(20)).await;
        let result = mgr
            .execute(OperationKind::EvmRpc, "relay-7", || async { Ok(7) })
            .await;
        assert_eq!(result, Ok(7));
        assert!(mgr.health().breakers.iter().all(|b| b.state == BreakerState::Closed));
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let mgr = RecoveryManager::new(fast_options());
        assert_eq!(mgr.delay(1), Duration::from_millis(1));
        assert_eq!(mgr.delay(2), Duration::from_millis(2));
        assert_eq!(mgr.delay(3), Duration::from_millis(4));
        assert_eq!(mgr.delay(10), Duration::from_millis(4));
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let mut opt = fast_options();
        opt.jitter = true;
        opt.base_delay = Duration::from_millis(100);
        opt.max_delay = Duration::from_secs(10);
        let mgr = RecoveryManager::new(opt);
        for _ in 0..100 {
            let d = mgr.delay(1).as_millis();
            assert!((75..=125).contains(&d), "delay {d}ms outside jitter band");
        }
    }
}
