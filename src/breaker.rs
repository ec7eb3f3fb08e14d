//! Circuit breaker gating calls to an unhealthy target.
//!
//! The breaker is a three-state machine:
//!
//! - **Closed**: calls pass through and failures are counted. When the
//!   trip predicate fires, the breaker opens. If a rolling interval is
//!   configured, the counting window rolls over when it expires.
//! - **Open**: calls are rejected immediately with
//!   [`Error::CircuitOpen`]. After the timeout the breaker half-opens.
//! - **Half-open**: at most `max_requests` probes are admitted
//!   concurrently; the rest are rejected with
//!   [`Error::TooManyRequests`]. One failure re-opens the breaker; once
//!   consecutive successes reach `max_requests` it closes.
//!
//! Every state change advances a generation counter. A call admitted
//! under an older generation reports its outcome into the void: counts
//! only ever reflect the current generation, so a transition that races
//! an in-flight call cannot corrupt the window that follows it.

use crate::error::Error;
use futures::FutureExt;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

type TripFn = Arc<dyn Fn(Counts) -> bool + Send + Sync>;
type StateChangeFn = Arc<dyn Fn(&str, State, State) + Send + Sync>;
type SuccessFn = Arc<dyn Fn(Option<&Error>) -> bool + Send + Sync>;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Calls pass through.
    Closed,
    /// Limited probes are admitted.
    HalfOpen,
    /// Calls are rejected.
    Open,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half-open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Request statistics for the current generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    /// Requests admitted in this generation.
    pub requests: u32,
    /// Total successes in this generation.
    pub total_successes: u32,
    /// Total failures in this generation.
    pub total_failures: u32,
    /// Successes since the last failure.
    pub consecutive_successes: u32,
    /// Failures since the last success.
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests += 1;
    }

    fn on_success(&mut self) {
        self.total_successes += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug)]
struct Shared {
    state: State,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
}

/// A generation-reconciled circuit breaker.
///
/// # Examples
///
/// ```
/// use mrpc::breaker::CircuitBreaker;
/// use std::time::Duration;
///
/// let breaker = CircuitBreaker::builder()
///     .name("payments")
///     .max_requests(5)
///     .interval(Duration::from_secs(10))
///     .timeout(Duration::from_secs(30))
///     .build();
/// ```
pub struct CircuitBreaker {
    name: String,
    max_requests: u32,
    interval: Duration,
    timeout: Duration,
    ready_to_trip: TripFn,
    is_successful: SuccessFn,
    on_state_change: Option<StateChangeFn>,
    shared: Mutex<Shared>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("max_requests", &self.max_requests)
            .field("state", &self.shared.lock().state)
            .finish_non_exhaustive()
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl CircuitBreaker {
    /// Creates a builder with the default settings.
    #[must_use]
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Returns the breaker's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the current state, applying any pending expiry transition.
    pub fn state(&self) -> State {
        let mut shared = self.shared.lock();
        let (state, _) = self.current_state(&mut shared, Instant::now());
        state
    }

    /// Returns the current generation's counts.
    pub fn counts(&self) -> Counts {
        self.shared.lock().counts
    }

    /// Runs `f` under the breaker.
    ///
    /// The future is only invoked when the breaker admits the call. Its
    /// outcome is judged by the configured success predicate. A panic
    /// unwinding out of the future is recorded as a failure before it is
    /// propagated.
    ///
    /// # Errors
    ///
    /// [`Error::CircuitOpen`] when the breaker is open,
    /// [`Error::TooManyRequests`] when half-open probes are saturated,
    /// otherwise whatever `f` returned.
    pub async fn execute<T, F, Fut>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let generation = self.before_request()?;

        match AssertUnwindSafe(f()).catch_unwind().await {
            Ok(result) => {
                let success = (self.is_successful)(result.as_ref().err());
                self.after_request(generation, success);
                result
            }
            Err(panic) => {
                self.after_request(generation, false);
                std::panic::resume_unwind(panic);
            }
        }
    }

    /// Two-step admission for callers that cannot shape the protected
    /// work as a closure.
    ///
    /// # Errors
    ///
    /// Same admission errors as [`execute`](Self::execute).
    pub fn allow(&self) -> Result<Permit<'_>, Error> {
        let generation = self.before_request()?;
        Ok(Permit {
            breaker: self,
            generation,
        })
    }

    fn before_request(&self) -> Result<u64, Error> {
        let mut shared = self.shared.lock();
        let now = Instant::now();
        let (state, generation) = self.current_state(&mut shared, now);

        match state {
            State::Open => Err(Error::CircuitOpen),
            State::HalfOpen if shared.counts.requests >= self.max_requests => {
                Err(Error::TooManyRequests)
            }
            _ => {
                shared.counts.on_request();
                Ok(generation)
            }
        }
    }

    fn after_request(&self, before: u64, success: bool) {
        let mut shared = self.shared.lock();
        let now = Instant::now();
        let (state, generation) = self.current_state(&mut shared, now);
        if generation != before {
            return;
        }

        if success {
            self.on_success(&mut shared, state, now);
        } else {
            self.on_failure(&mut shared, state, now);
        }
    }

    fn on_success(&self, shared: &mut Shared, state: State, now: Instant) {
        match state {
            State::Closed => shared.counts.on_success(),
            State::HalfOpen => {
                shared.counts.on_success();
                if shared.counts.consecutive_successes >= self.max_requests {
                    self.set_state(shared, State::Closed, now);
                }
            }
            State::Open => {}
        }
    }

    fn on_failure(&self, shared: &mut Shared, state: State, now: Instant) {
        match state {
            State::Closed => {
                shared.counts.on_failure();
                if (self.ready_to_trip)(shared.counts) {
                    self.set_state(shared, State::Open, now);
                }
            }
            State::HalfOpen => self.set_state(shared, State::Open, now),
            State::Open => {}
        }
    }

    fn current_state(&self, shared: &mut Shared, now: Instant) -> (State, u64) {
        match shared.state {
            State::Closed => {
                if shared.expiry.is_some_and(|expiry| expiry <= now) {
                    self.new_generation(shared, now);
                }
            }
            State::Open => {
                if shared.expiry.is_some_and(|expiry| expiry <= now) {
                    self.set_state(shared, State::HalfOpen, now);
                }
            }
            State::HalfOpen => {}
        }

        (shared.state, shared.generation)
    }

    fn set_state(&self, shared: &mut Shared, state: State, now: Instant) {
        if shared.state == state {
            return;
        }

        let prev = shared.state;
        shared.state = state;
        self.new_generation(shared, now);

        if let Some(on_state_change) = &self.on_state_change {
            on_state_change(&self.name, prev, state);
        }
    }

    fn new_generation(&self, shared: &mut Shared, now: Instant) {
        shared.generation += 1;
        shared.counts.clear();
        shared.expiry = match shared.state {
            State::Closed => {
                if self.interval.is_zero() {
                    None
                } else {
                    Some(now + self.interval)
                }
            }
            State::Open => Some(now + self.timeout),
            State::HalfOpen => None,
        };
    }
}

/// Admission handle returned by [`CircuitBreaker::allow`].
///
/// Dropping the permit without calling [`record`](Permit::record) leaves
/// the admitted request counted but unresolved, the same as a call that
/// never completes.
#[must_use = "record the call's outcome through the permit"]
#[derive(Debug)]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
}

impl Permit<'_> {
    /// Reports the protected call's outcome.
    pub fn record(self, success: bool) {
        self.breaker.after_request(self.generation, success);
    }
}

/// Builder for [`CircuitBreaker`].
pub struct Builder {
    name: String,
    max_requests: u32,
    interval: Duration,
    timeout: Duration,
    ready_to_trip: Option<TripFn>,
    is_successful: Option<SuccessFn>,
    on_state_change: Option<StateChangeFn>,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            name: String::new(),
            max_requests: 1,
            interval: Duration::ZERO,
            timeout: DEFAULT_TIMEOUT,
            ready_to_trip: None,
            is_successful: None,
            on_state_change: None,
        }
    }
}

impl Builder {
    /// Sets the breaker's name, used in state-change notifications.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the number of probes admitted while half-open. Zero means one.
    #[must_use]
    pub fn max_requests(mut self, max_requests: u32) -> Self {
        self.max_requests = max_requests.max(1);
        self
    }

    /// Sets the rolling window for counts in the closed state. Zero
    /// disables rolling; counts accumulate until a state change.
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets how long the breaker stays open before half-opening.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() {
            self.timeout = timeout;
        }
        self
    }

    /// Sets the trip predicate evaluated after every failure while
    /// closed. The default trips when consecutive failures exceed 5.
    #[must_use]
    pub fn ready_to_trip<F>(mut self, f: F) -> Self
    where
        F: Fn(Counts) -> bool + Send + Sync + 'static,
    {
        self.ready_to_trip = Some(Arc::new(f));
        self
    }

    /// Sets the predicate deciding whether a completed call counts as a
    /// success. The default treats any `Ok` as success.
    #[must_use]
    pub fn is_successful<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<&Error>) -> bool + Send + Sync + 'static,
    {
        self.is_successful = Some(Arc::new(f));
        self
    }

    /// Registers a state-change observer.
    #[must_use]
    pub fn on_state_change<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, State, State) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(f));
        self
    }

    /// Builds the breaker.
    #[must_use]
    pub fn build(self) -> CircuitBreaker {
        CircuitBreaker {
            name: self.name,
            max_requests: self.max_requests,
            interval: self.interval,
            timeout: self.timeout,
            ready_to_trip: self
                .ready_to_trip
                .unwrap_or_else(|| Arc::new(|counts| counts.consecutive_failures > 5)),
            is_successful: self
                .is_successful
                .unwrap_or_else(|| Arc::new(|err| err.is_none())),
            on_state_change: self.on_state_change,
            shared: Mutex::new(Shared {
                state: State::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn trip_after(failures: u32) -> CircuitBreaker {
        CircuitBreaker::builder()
            .max_requests(1)
            .timeout(Duration::from_millis(100))
            .ready_to_trip(move |counts| counts.consecutive_failures > failures)
            .build()
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), Error> {
        breaker
            .execute(|| async { Err::<(), _>(Error::UnexpectedEof) })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), Error> {
        breaker.execute(|| async { Ok(()) }).await
    }

    #[tokio::test]
    async fn test_trips_open_then_half_opens_then_closes() {
        let breaker = trip_after(2);

        for _ in 0..3 {
            assert!(fail(&breaker).await.is_err());
        }
        assert_eq!(breaker.state(), State::Open);

        // Open state rejects without invoking the closure.
        let invoked = AtomicU32::new(0);
        let err = breaker
            .execute::<(), _, _>(|| {
                invoked.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CircuitOpen));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(breaker.state(), State::HalfOpen);

        succeed(&breaker).await.expect("probe succeeds");
        assert_eq!(breaker.state(), State::Closed);
    }

    #[tokio::test]
    async fn test_half_open_saturation() {
        let breaker = CircuitBreaker::builder()
            .max_requests(1)
            .timeout(Duration::from_millis(10))
            .ready_to_trip(|counts| counts.consecutive_failures > 0)
            .build();

        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), State::Open);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(breaker.state(), State::HalfOpen);

        let _probe = breaker.allow().expect("first probe admitted");
        let err = breaker.allow().unwrap_err();
        assert!(matches!(err, Error::TooManyRequests));
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::builder()
            .max_requests(2)
            .timeout(Duration::from_millis(10))
            .ready_to_trip(|counts| counts.consecutive_failures > 0)
            .build();

        fail(&breaker).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(breaker.state(), State::HalfOpen);

        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), State::Open);
    }

    #[tokio::test]
    async fn test_stale_generation_outcome_is_discarded() {
        let breaker = trip_after(0);

        let permit = breaker.allow().expect("admitted while closed");

        // A failure trips the breaker, advancing the generation.
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), State::Open);
        let counts = breaker.counts();

        // The stale permit's outcome must leave the new window untouched.
        permit.record(true);
        assert_eq!(breaker.counts(), counts);
    }

    #[tokio::test]
    async fn test_consecutive_counters_are_mutually_exclusive() {
        let breaker = CircuitBreaker::builder()
            .ready_to_trip(|_| false)
            .build();

        for _ in 0..3 {
            succeed(&breaker).await.unwrap();
            let counts = breaker.counts();
            assert_eq!(counts.consecutive_successes * counts.consecutive_failures, 0);
        }
        for _ in 0..2 {
            fail(&breaker).await.unwrap_err();
            let counts = breaker.counts();
            assert_eq!(counts.consecutive_successes * counts.consecutive_failures, 0);
        }

        let counts = breaker.counts();
        assert_eq!(counts.consecutive_failures, 2);
        assert_eq!(counts.total_successes, 3);
        assert_eq!(counts.total_failures, 2);
    }

    #[tokio::test]
    async fn test_closed_interval_rolls_the_window() {
        let breaker = CircuitBreaker::builder()
            .interval(Duration::from_millis(20))
            .ready_to_trip(|_| false)
            .build();

        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.counts().total_failures, 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(breaker.state(), State::Closed);
        assert_eq!(breaker.counts(), Counts::default());
    }

    #[tokio::test]
    async fn test_panic_is_recorded_as_failure() {
        let breaker = Arc::new(trip_after(0));

        let task = tokio::spawn({
            let breaker = Arc::clone(&breaker);
            async move {
                breaker
                    .execute::<(), _, _>(|| async { panic!("handler exploded") })
                    .await
            }
        });
        let join_err = task.await.unwrap_err();
        assert!(join_err.is_panic());

        // One failure with trip-on-first-failure means the panic opened it.
        assert_eq!(breaker.state(), State::Open);
    }

    #[tokio::test]
    async fn test_custom_success_predicate() {
        // Service errors do not count against the target.
        let breaker = CircuitBreaker::builder()
            .ready_to_trip(|counts| counts.consecutive_failures > 0)
            .is_successful(|err| !matches!(err, Some(e) if e.is_connection_error()))
            .build();

        breaker
            .execute(|| async { Err::<(), _>(Error::Service("bad input".to_string())) })
            .await
            .unwrap_err();
        assert_eq!(breaker.state(), State::Closed);

        breaker
            .execute(|| async { Err::<(), _>(Error::UnexpectedEof) })
            .await
            .unwrap_err();
        assert_eq!(breaker.state(), State::Open);
    }

    #[tokio::test]
    async fn test_state_change_observer() {
        let transitions = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let breaker = CircuitBreaker::builder()
            .name("observer")
            .timeout(Duration::from_millis(10))
            .ready_to_trip(|counts| counts.consecutive_failures > 0)
            .on_state_change({
                let transitions = Arc::clone(&transitions);
                move |name, from, to| transitions.lock().push((name.to_string(), from, to))
            })
            .build();

        fail(&breaker).await.unwrap_err();
        assert_eq!(
            transitions.lock().as_slice(),
            &[("observer".to_string(), State::Closed, State::Open)]
        );
    }
}
