//! Per-mirror circuit breaker. Three states (Closed, Open, Half-Open) with
//! a small, purpose-built state machine rather than a generic resilience
//! crate: the eviction coupling this system needs (publish a target for
//! removal once it has failed persistently) is specific enough that a
//! general-purpose breaker would need the same glue code anyway.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

/// Consecutive failures required to trip from Closed to Open.
const FAILURE_THRESHOLD: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Counts {
    consecutive_failures: u32,
}

struct State {
    breaker: BreakerState,
    counts: Counts,
    /// Set when Open was entered; used to gate the next probe.
    opened_at: Option<Instant>,
    /// Set only when Open was entered directly from Closed, since the
    /// original's eviction check is gated on this, not on any Open transition.
    first_failure_time: Option<Instant>,
    /// Whether the single allowed Half-Open probe is currently outstanding.
    /// MaxRequests in Half-Open is 1: only the caller that flips this from
    /// false to true is admitted, everyone else short-circuits until the
    /// probe reports back.
    half_open_probe_in_flight: bool,
}

/// Error returned by [`CircuitBreaker::call`] when the breaker is open and
/// the call was rejected without being attempted.
#[derive(Debug, thiserror::Error)]
#[error("circuit breaker open for {0}")]
pub struct BreakerOpen(pub String);

/// Transition notifications, fired synchronously from inside `call`/`report`
/// while the breaker's lock is held, so handlers must be quick and non-blocking.
/// `first_failure_age` is the time elapsed since `first_failure_time` was
/// set, present only on transitions into `Open`; it is `None` if no prior
/// Closed→Open trip has ever set that timestamp.
pub trait MirrorStatusSink: Send + Sync {
    fn on_transition(
        &self,
        name: &str,
        from: BreakerState,
        to: BreakerState,
        first_failure_age: Option<Duration>,
    );
}

/// Never evicts: transitions are logged but the mirror stays in the set
/// regardless of how long it fails.
pub struct PersistentSink;

impl MirrorStatusSink for PersistentSink {
    fn on_transition(
        &self,
        name: &str,
        from: BreakerState,
        to: BreakerState,
        _first_failure_age: Option<Duration>,
    ) {
        log_transition(name, from, to);
    }
}

/// Evicts a mirror once it has been failing continuously for longer than
/// `persistent_failure_timeout`, by invoking `on_target_failed`. The check
/// only fires on an Open transition that is *not* the direct Closed→Open
/// trip (it fires on a later re-open while still failing), and only once
/// `first_failure_time` has actually been set by that earlier Closed→Open
/// trip. A breaker that has only ever gone straight to Open from Half-Open
/// without a prior Closed state (a cold start racing failures before the
/// first success) will not evict until a Closed→Open cycle happens.
pub struct AutoRemovingSink<F>
where
    F: Fn(&str) + Send + Sync,
{
    persistent_failure_timeout: Duration,
    on_target_failed: F,
}

impl<F> AutoRemovingSink<F>
where
    F: Fn(&str) + Send + Sync,
{
    pub fn new(persistent_failure_timeout: Duration, on_target_failed: F) -> Self {
        Self {
            persistent_failure_timeout,
            on_target_failed,
        }
    }
}

impl<F> MirrorStatusSink for AutoRemovingSink<F>
where
    F: Fn(&str) + Send + Sync,
{
    fn on_transition(
        &self,
        name: &str,
        from: BreakerState,
        to: BreakerState,
        first_failure_age: Option<Duration>,
    ) {
        log_transition(name, from, to);
        if to == BreakerState::Open && from != BreakerState::Closed {
            if let Some(age) = first_failure_age {
                if age > self.persistent_failure_timeout {
                    info!(target = name, "target persistently failing, evicting");
                    (self.on_target_failed)(name);
                }
            }
        }
    }
}

fn log_transition(name: &str, from: BreakerState, to: BreakerState) {
    match to {
        BreakerState::Open if from == BreakerState::Closed => {
            info!(target = name, "temporarily not mirroring to target");
        }
        BreakerState::Open => {
            debug!(target = name, "breaker re-opened");
        }
        BreakerState::HalfOpen => info!(target = name, "retrying target"),
        BreakerState::Closed => info!(target = name, "resuming mirroring to target"),
    }
}

/// A single-target breaker guarding outbound calls to one mirror.
pub struct CircuitBreaker {
    name: String,
    retry_after: Duration,
    sink: Box<dyn MirrorStatusSink>,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(name: String, retry_after: Duration, sink: Box<dyn MirrorStatusSink>) -> Self {
        Self {
            name,
            retry_after,
            sink,
            state: Mutex::new(State {
                breaker: BreakerState::Closed,
                counts: Counts {
                    consecutive_failures: 0,
                },
                opened_at: None,
                first_failure_time: None,
                half_open_probe_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state.lock().breaker
    }

    pub fn first_failure_time(&self) -> Option<Instant> {
        self.state.lock().first_failure_time
    }

    /// Returns `Ok(())` if the call is allowed to proceed (Closed, or
    /// Half-Open admitting its one probe); `Err` if it must be
    /// short-circuited.
    pub fn before_call(&self) -> Result<(), BreakerOpen> {
        let mut state = self.state.lock();
        match state.breaker {
            BreakerState::Closed => Ok(()),
            BreakerState::HalfOpen => {
                if state.half_open_probe_in_flight {
                    Err(BreakerOpen(self.name.clone()))
                } else {
                    state.half_open_probe_in_flight = true;
                    Ok(())
                }
            }
            BreakerState::Open => {
                let elapsed = state
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.retry_after {
                    self.transition(&mut state, BreakerState::HalfOpen);
                    state.half_open_probe_in_flight = true;
                    Ok(())
                } else {
                    Err(BreakerOpen(self.name.clone()))
                }
            }
        }
    }

    /// Reports the outcome of a call previously admitted by `before_call`.
    pub fn report(&self, success: bool) {
        let mut state = self.state.lock();
        match state.breaker {
            BreakerState::HalfOpen => {
                state.half_open_probe_in_flight = false;
                if success {
                    state.counts.consecutive_failures = 0;
                    self.transition(&mut state, BreakerState::Closed);
                } else {
                    state.counts.consecutive_failures += 1;
                    self.transition(&mut state, BreakerState::Open);
                }
            }
            BreakerState::Closed => {
                if success {
                    state.counts.consecutive_failures = 0;
                } else {
                    state.counts.consecutive_failures += 1;
                    if state.counts.consecutive_failures >= FAILURE_THRESHOLD {
                        self.transition(&mut state, BreakerState::Open);
                    }
                }
            }
            BreakerState::Open => {
                // A stray report racing a concurrent open transition; counts
                // still accumulate but no further transition is possible
                // until the next before_call() admits a half-open probe.
                if !success {
                    state.counts.consecutive_failures += 1;
                }
            }
        }
    }

    fn transition(&self, state: &mut State, to: BreakerState) {
        let from = state.breaker;
        if from == to {
            return;
        }
        state.breaker = to;
        match to {
            BreakerState::Open => {
                state.opened_at = Some(Instant::now());
                if from == BreakerState::Closed {
                    state.first_failure_time = Some(Instant::now());
                }
            }
            BreakerState::Closed => {
                state.first_failure_time = None;
            }
            BreakerState::HalfOpen => {}
        }
        let first_failure_age = state.first_failure_time.map(|t| t.elapsed());
        self.sink.on_transition(&self.name, from, to, first_failure_age);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn breaker(retry_after: Duration) -> CircuitBreaker {
        CircuitBreaker::new("t".into(), retry_after, Box::new(PersistentSink))
    }

    #[test]
    fn opens_after_five_consecutive_failures() {
        let b = breaker(Duration::from_secs(60));
        for _ in 0..4 {
            b.before_call().unwrap();
            b.report(false);
            assert_eq!(b.state(), BreakerState::Closed);
        }
        b.before_call().unwrap();
        b.report(false);
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let b = breaker(Duration::from_secs(60));
        for _ in 0..4 {
            b.before_call().unwrap();
            b.report(false);
        }
        b.before_call().unwrap();
        b.report(true);
        assert_eq!(b.state(), BreakerState::Closed);
        for _ in 0..4 {
            b.before_call().unwrap();
            b.report(false);
            assert_eq!(b.state(), BreakerState::Closed);
        }
    }

    #[test]
    fn open_rejects_until_retry_after_elapses() {
        let b = breaker(Duration::from_millis(10));
        for _ in 0..5 {
            b.before_call().unwrap();
            b.report(false);
        }
        assert!(b.before_call().is_err());
        std::thread::sleep(Duration::from_millis(20));
        assert!(b.before_call().is_ok());
        assert_eq!(b.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn half_open_admits_only_one_concurrent_probe() {
        let b = breaker(Duration::from_millis(1));
        for _ in 0..5 {
            b.before_call().unwrap();
            b.report(false);
        }
        std::thread::sleep(Duration::from_millis(5));

        // First caller into Half-Open gets the probe; a second caller
        // racing it before the probe reports back must be rejected.
        assert!(b.before_call().is_ok());
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert!(b.before_call().is_err());

        // Once the probe reports, the next episode admits exactly one again.
        b.report(true);
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_success_closes_failure_reopens() {
        let b = breaker(Duration::from_millis(1));
        for _ in 0..5 {
            b.before_call().unwrap();
            b.report(false);
        }
        std::thread::sleep(Duration::from_millis(5));
        b.before_call().unwrap();
        assert_eq!(b.state(), BreakerState::HalfOpen);
        b.report(true);
        assert_eq!(b.state(), BreakerState::Closed);

        for _ in 0..5 {
            b.before_call().unwrap();
            b.report(false);
        }
        std::thread::sleep(Duration::from_millis(5));
        b.before_call().unwrap();
        assert_eq!(b.state(), BreakerState::HalfOpen);
        b.report(false);
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[test]
    fn auto_removing_sink_evicts_after_persistent_timeout() {
        let evicted = Arc::new(AtomicBool::new(false));
        let evicted_clone = evicted.clone();
        let sink = AutoRemovingSink::new(Duration::from_millis(5), move |_name| {
            evicted_clone.store(true, Ordering::SeqCst);
        });
        let b = CircuitBreaker::new("t".into(), Duration::from_millis(1), Box::new(sink));

        // First Closed -> Open trip sets first_failure_time, no eviction yet
        // (not enough time has passed).
        for _ in 0..5 {
            b.before_call().unwrap();
            b.report(false);
        }
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!evicted.load(Ordering::SeqCst));

        std::thread::sleep(Duration::from_millis(10));
        // Half-open probe, fails again -> Open from HalfOpen. first_failure_time
        // is already set and old enough, so this should trigger eviction.
        b.before_call().unwrap();
        b.report(false);
        assert_eq!(b.state(), BreakerState::Open);
        assert!(evicted.load(Ordering::SeqCst));
    }
}
