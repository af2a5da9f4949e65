//! Per-agent circuit breaker.
//!
//! One breaker guards each configured agent. Invocation failures within a
//! rolling window trip the breaker open; after a cooldown a single trial
//! invocation is admitted at a time, and consecutive trial successes close
//! it again. Callers must obtain a [`Permit`] via [`CircuitBreaker::allow`]
//! and hand it back through [`CircuitBreaker::record`] exactly once; permits
//! that are never recorded are swept as failures after a fixed timeout so
//! the counters cannot drift.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::BreakerSignal;

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures within `window` that trip the breaker open.
    pub failure_threshold: usize,
    pub window: Duration,
    /// How long the breaker stays open before admitting a trial.
    pub open_for: Duration,
    /// Consecutive half-open successes required to close.
    pub half_open_successes: u32,
    /// An unrecorded permit older than this is treated as a failure.
    pub permit_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            open_for: Duration::from_secs(30),
            half_open_successes: 2,
            permit_timeout: Duration::from_secs(300),
        }
    }
}

/// Observable breaker state, for `/status` and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum State {
    Closed { failures: VecDeque<Instant> },
    Open { opened_at: Instant },
    HalfOpen { successes: u32, trial_active: bool },
}

#[derive(Debug)]
struct Inner {
    state: State,
    issued: HashMap<u64, Instant>,
    next_permit: u64,
}

/// Proof that the breaker admitted an invocation. Not cloneable; consumed by
/// [`CircuitBreaker::record`].
#[derive(Debug)]
pub struct Permit {
    id: u64,
}

#[derive(Debug, thiserror::Error)]
#[error("breaker open for agent '{agent}'")]
pub struct BreakerOpen {
    pub agent: String,
    pub retry_in: Duration,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    cfg: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, cfg: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            cfg,
            inner: Mutex::new(Inner {
                state: State::Closed {
                    failures: VecDeque::new(),
                },
                issued: HashMap::new(),
                next_permit: 0,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        self.maybe_half_open(&mut inner, Instant::now());
        match &inner.state {
            State::Closed { .. } => BreakerState::Closed,
            State::Open { .. } => BreakerState::Open,
            State::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    /// Ask to pass. Returns a permit that must be recorded exactly once.
    pub fn allow(&self) -> Result<Permit, BreakerOpen> {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        self.sweep_stale(&mut inner, now);
        self.maybe_half_open(&mut inner, now);

        match &mut inner.state {
            State::Closed { .. } => {}
            State::Open { opened_at } => {
                let retry_in = self
                    .cfg
                    .open_for
                    .saturating_sub(now.duration_since(*opened_at));
                return Err(BreakerOpen {
                    agent: self.name.clone(),
                    retry_in,
                });
            }
            State::HalfOpen { trial_active, .. } => {
                if *trial_active {
                    return Err(BreakerOpen {
                        agent: self.name.clone(),
                        retry_in: Duration::from_secs(1),
                    });
                }
                *trial_active = true;
            }
        }

        let id = inner.next_permit;
        inner.next_permit += 1;
        inner.issued.insert(id, now);
        Ok(Permit { id })
    }

    /// Report the terminal outcome of an admitted invocation.
    pub fn record(&self, permit: Permit, signal: BreakerSignal) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.issued.remove(&permit.id).is_none() {
            // Already swept as stale; the sweep applied a failure for it.
            return;
        }
        self.apply(&mut inner, signal, now);
    }

    fn apply(&self, inner: &mut Inner, signal: BreakerSignal, now: Instant) {
        match signal {
            BreakerSignal::Neutral => {
                if let State::HalfOpen { trial_active, .. } = &mut inner.state {
                    *trial_active = false;
                }
            }
            BreakerSignal::Success => match &mut inner.state {
                State::Closed { .. } | State::Open { .. } => {}
                State::HalfOpen {
                    successes,
                    trial_active,
                } => {
                    *trial_active = false;
                    *successes += 1;
                    if *successes >= self.cfg.half_open_successes {
                        self.transition(inner, State::Closed {
                            failures: VecDeque::new(),
                        });
                    }
                }
            },
            BreakerSignal::Failure => match &mut inner.state {
                State::Closed { failures } => {
                    failures.push_back(now);
                    let horizon = now.checked_sub(self.cfg.window);
                    while let Some(front) = failures.front() {
                        match horizon {
                            Some(h) if *front < h => {
                                failures.pop_front();
                            }
                            _ => break,
                        }
                    }
                    if failures.len() >= self.cfg.failure_threshold {
                        self.transition(inner, State::Open { opened_at: now });
                    }
                }
                State::HalfOpen { .. } => {
                    self.transition(inner, State::Open { opened_at: now });
                }
                State::Open { .. } => {}
            },
        }
    }

    fn maybe_half_open(&self, inner: &mut Inner, now: Instant) {
        let opened_at = match &inner.state {
            State::Open { opened_at } => *opened_at,
            _ => return,
        };
        if now.duration_since(opened_at) >= self.cfg.open_for {
            self.transition(inner, State::HalfOpen {
                successes: 0,
                trial_active: false,
            });
        }
    }

    fn sweep_stale(&self, inner: &mut Inner, now: Instant) {
        let timeout = self.cfg.permit_timeout;
        let stale: Vec<u64> = inner
            .issued
            .iter()
            .filter(|(_, issued_at)| now.duration_since(**issued_at) > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            inner.issued.remove(&id);
            tracing::warn!(agent = %self.name, permit = id, "breaker permit expired unrecorded, counting as failure");
            self.apply(inner, BreakerSignal::Failure, now);
        }
    }

    fn transition(&self, inner: &mut Inner, next: State) {
        let to = match next {
            State::Closed { .. } => "closed",
            State::Open { .. } => "open",
            State::HalfOpen { .. } => "half_open",
        };
        tracing::info!(agent = %self.name, to, "breaker transition");
        metrics::counter!(
            "gateway_breaker_transitions_total",
            "agent" => self.name.clone(),
            "to" => to,
        )
        .increment(1);
        inner.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(open_for: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold: 5,
                window: Duration::from_secs(60),
                open_for,
                half_open_successes: 2,
                permit_timeout: Duration::from_secs(300),
            },
        )
    }

    fn fail_once(b: &CircuitBreaker) {
        let permit = b.allow().expect("breaker should admit");
        b.record(permit, BreakerSignal::Failure);
    }

    #[test]
    fn five_failures_trip_open() {
        let b = breaker(Duration::from_secs(30));
        for _ in 0..4 {
            fail_once(&b);
            assert_eq!(b.state(), BreakerState::Closed);
        }
        fail_once(&b);
        assert_eq!(b.state(), BreakerState::Open);
        assert!(b.allow().is_err());
    }

    #[test]
    fn successes_do_not_trip() {
        let b = breaker(Duration::from_secs(30));
        for _ in 0..20 {
            let permit = b.allow().unwrap();
            b.record(permit, BreakerSignal::Success);
        }
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn open_admits_single_trial_after_cooldown() {
        let b = breaker(Duration::from_millis(10));
        for _ in 0..5 {
            fail_once(&b);
        }
        assert!(b.allow().is_err());

        std::thread::sleep(Duration::from_millis(15));
        let trial = b.allow().expect("half-open should admit one trial");
        // Second concurrent trial is rejected.
        assert!(b.allow().is_err());
        b.record(trial, BreakerSignal::Success);
    }

    #[test]
    fn two_half_open_successes_close() {
        let b = breaker(Duration::from_millis(10));
        for _ in 0..5 {
            fail_once(&b);
        }
        std::thread::sleep(Duration::from_millis(15));

        let first = b.allow().unwrap();
        b.record(first, BreakerSignal::Success);
        assert_eq!(b.state(), BreakerState::HalfOpen);

        let second = b.allow().unwrap();
        b.record(second, BreakerSignal::Success);
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let b = breaker(Duration::from_millis(10));
        for _ in 0..5 {
            fail_once(&b);
        }
        std::thread::sleep(Duration::from_millis(15));

        let trial = b.allow().unwrap();
        b.record(trial, BreakerSignal::Failure);
        assert_eq!(b.state(), BreakerState::Open);
        assert!(b.allow().is_err());
    }

    #[test]
    fn neutral_releases_trial_slot_without_closing() {
        let b = breaker(Duration::from_millis(10));
        for _ in 0..5 {
            fail_once(&b);
        }
        std::thread::sleep(Duration::from_millis(15));

        let trial = b.allow().unwrap();
        b.record(trial, BreakerSignal::Neutral);
        assert_eq!(b.state(), BreakerState::HalfOpen);
        // Slot is free again.
        assert!(b.allow().is_ok());
    }

    #[test]
    fn stale_permit_counts_as_failure() {
        let b = CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold: 1,
                permit_timeout: Duration::from_millis(5),
                ..BreakerConfig::default()
            },
        );
        let leaked = b.allow().unwrap();
        std::thread::sleep(Duration::from_millis(10));
        // Next allow sweeps the leaked permit, which trips the breaker.
        assert!(b.allow().is_err());
        assert_eq!(b.state(), BreakerState::Open);
        // Late record of the swept permit is a no-op.
        b.record(leaked, BreakerSignal::Success);
        assert_eq!(b.state(), BreakerState::Open);
    }
}
