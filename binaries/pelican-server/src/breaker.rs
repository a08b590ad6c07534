//! Circuit breaker for the outbound transport. Transitions are pure
//! functions of `(state, event, now)`; the shared wrapper keeps its lock
//! only for the transition itself.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Consecutive failures that open the breaker.
pub const FAILURE_THRESHOLD: u32 = 5;

/// How long the breaker stays open before admitting a probe.
pub const OPEN_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// The state machine proper. Single-threaded; see [`SharedBreaker`] for the
/// concurrent wrapper.
#[derive(Debug)]
pub struct Breaker {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    probe_outstanding: bool,
}

impl Breaker {
    pub fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            probe_outstanding: false,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// May a call go out now? In `Open`, the cooldown elapsing moves to
    /// `HalfOpen` and admits exactly one probe; further calls are rejected
    /// until the probe reports back.
    pub fn admit(&mut self, now: Instant) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let cooled_down = self
                    .last_failure_at
                    .is_none_or(|at| now.duration_since(at) >= OPEN_COOLDOWN);
                if cooled_down {
                    self.state = BreakerState::HalfOpen;
                    self.probe_outstanding = true;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if self.probe_outstanding {
                    false
                } else {
                    self.probe_outstanding = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.last_failure_at = None;
        self.probe_outstanding = false;
    }

    pub fn record_failure(&mut self, now: Instant) {
        match self.state {
            BreakerState::HalfOpen => {
                // The probe failed; straight back to open.
                self.state = BreakerState::Open;
                self.last_failure_at = Some(now);
                self.probe_outstanding = false;
                self.consecutive_failures += 1;
            }
            _ => {
                self.consecutive_failures += 1;
                self.last_failure_at = Some(now);
                if self.consecutive_failures >= FAILURE_THRESHOLD {
                    self.state = BreakerState::Open;
                }
            }
        }
    }
}

impl Default for Breaker {
    fn default() -> Self {
        Self::new()
    }
}

/// Concurrent wrapper used by the worker pool.
pub struct SharedBreaker {
    inner: Mutex<Breaker>,
}

impl SharedBreaker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Breaker::new()),
        }
    }

    pub fn admit(&self) -> bool {
        let admitted = self
            .inner
            .lock()
            .expect("breaker lock poisoned")
            .admit(Instant::now());
        if !admitted {
            tracing::debug!("breaker rejected outbound call");
        }
        admitted
    }

    pub fn record_success(&self) {
        self.inner
            .lock()
            .expect("breaker lock poisoned")
            .record_success();
    }

    pub fn record_failure(&self) {
        let mut breaker = self.inner.lock().expect("breaker lock poisoned");
        breaker.record_failure(Instant::now());
        if breaker.state() == BreakerState::Open {
            tracing::warn!(
                failures = breaker.consecutive_failures(),
                "circuit breaker open"
            );
        }
    }

    pub fn snapshot(&self) -> (BreakerState, u32) {
        let breaker = self.inner.lock().expect("breaker lock poisoned");
        (breaker.state(), breaker.consecutive_failures())
    }
}

impl Default for SharedBreaker {
    fn default() -> Self {
        Self::new()
    }
}
