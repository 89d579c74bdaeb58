use std::future::Future;
use std::sync::Mutex;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    HalfOpen,
    Open,
}

impl BreakerState {
    /// Numeric code used by the metrics endpoint (0 closed, 1 half-open,
    /// 2 open).
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::HalfOpen => 1,
            Self::Open => 2,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::HalfOpen => "half_open",
            Self::Open => "open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub endpoint: &'static str,
    pub state: BreakerState,
    pub failures: u32,
}

struct BreakerInner {
    state: BreakerState,
    failures: u32,
    successes: u32,
    next_attempt_at: Option<Instant>,
}

/// Circuit breaker guarding one remote endpoint.
///
/// Three consecutive failures open the circuit; while open, calls return
/// the endpoint fallback without touching the wire. After the reset delay a
/// single probe is allowed (half-open); two probe successes close the
/// circuit again, one probe failure re-opens it.
pub struct CircuitBreaker {
    endpoint: &'static str,
    failure_threshold: u32,
    success_threshold: u32,
    reset_delay: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(endpoint: &'static str) -> Self {
        Self::with_thresholds(endpoint, 3, 2, Duration::from_millis(30_000))
    }

    #[must_use]
    pub fn with_thresholds(
        endpoint: &'static str,
        failure_threshold: u32,
        success_threshold: u32,
        reset_delay: Duration,
    ) -> Self {
        Self {
            endpoint,
            failure_threshold,
            success_threshold,
            reset_delay,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: 0,
                successes: 0,
                next_attempt_at: None,
            }),
        }
    }

    /// Runs `op` under the breaker, producing `fallback()` when the circuit
    /// is open or the call fails. The fallback value should carry an
    /// explicit stale marker so callers can reason about degradation.
    pub async fn execute<T, F, Fut>(&self, op: F, fallback: impl FnOnce() -> T) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if !self.try_pass() {
            tracing::debug!("Circuit open for {}, serving fallback", self.endpoint);
            return fallback();
        }

        match op().await {
            Ok(value) => {
                self.record_success();
                value
            }
            Err(e) => {
                self.record_failure(&e);
                fallback()
            }
        }
    }

    /// Gate check: false means the circuit is open and still inside the
    /// reset delay. Crossing the delay flips to half-open and admits one
    /// probe.
    fn try_pass(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let ready = inner
                    .next_attempt_at
                    .is_none_or(|deadline| Instant::now() >= deadline);
                if ready {
                    tracing::info!("Circuit for {} probing (half-open)", self.endpoint);
                    inner.state = BreakerState::HalfOpen;
                    inner.successes = 0;
                }
                ready
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        inner.failures = 0;
        if inner.state == BreakerState::HalfOpen {
            inner.successes += 1;
            if inner.successes >= self.success_threshold {
                tracing::info!("Circuit for {} closed", self.endpoint);
                inner.state = BreakerState::Closed;
                inner.next_attempt_at = None;
            }
        }
    }

    fn record_failure(&self, error: &anyhow::Error) {
        let mut inner = self.lock();
        inner.failures += 1;
        let should_open =
            inner.state == BreakerState::HalfOpen || inner.failures >= self.failure_threshold;
        if should_open {
            inner.state = BreakerState::Open;
            inner.next_attempt_at = Some(Instant::now() + self.reset_delay);
            tracing::warn!(
                "Circuit for {} opened after {} failures: {:#}",
                self.endpoint,
                inner.failures,
                error
            );
        } else {
            tracing::debug!(
                "Call to {} failed ({}/{}): {:#}",
                self.endpoint,
                inner.failures,
                self.failure_threshold,
                error
            );
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            endpoint: self.endpoint,
            state: inner.state,
            failures: inner.failures,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
