//! Circuit breaker pattern implementation
//!
//! A breaker counts failures inside a sliding window. Reaching the threshold
//! opens it; once the cooldown has elapsed it is half-open and admits exactly
//! one trial, whose outcome either closes it again or restarts the cooldown.
//! The Open to HalfOpen edge is evaluated on every query, so an open breaker
//! can never stay open past its cooldown.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests pass through normally
    Closed,
    /// Requests fail fast
    Open,
    /// One trial request is allowed to test recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// What a breaker guards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitScope {
    /// Aggregate over every worker
    Pool,
    /// A numbered worker slot; replacements inherit their predecessor's slot
    Slot(usize),
}

impl fmt::Display for CircuitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitScope::Pool => write!(f, "pool"),
            CircuitScope::Slot(n) => write!(f, "slot-{}", n),
        }
    }
}

/// A state change, reported to the listener and returned by `record_*`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Callback fired after every transition, outside the breaker's lock
pub type TransitionListener = Arc<dyn Fn(CircuitScope, Transition) + Send + Sync>;

/// Result of asking a breaker for permission to dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Closed; dispatch freely
    Allowed,
    /// Half-open; the caller holds the single trial and must report its outcome
    Trial,
    /// Open, or half-open with the trial already taken
    Rejected { retry_after: Option<Duration> },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Admission::Rejected { .. })
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures within `window` that open the circuit
    pub failure_threshold: u32,

    /// Sliding window for counting failures
    #[serde(with = "humantime_serde")]
    pub window: Duration,

    /// Time spent open before a trial is allowed
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Circuit breaker metrics
#[derive(Debug, Clone, Default)]
pub struct CircuitMetrics {
    pub total_successes: u64,
    pub total_failures: u64,
    /// Requests refused while open or while the trial was taken
    pub total_rejected: u64,
    /// Failures currently inside the window
    pub window_failures: u32,
    pub last_failure_time: Option<Instant>,
    pub last_state_change: Option<Instant>,
}

struct BreakerInner {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    metrics: CircuitMetrics,
}

/// Thread-safe circuit breaker for one scope
#[derive(Clone)]
pub struct CircuitBreaker {
    scope: CircuitScope,
    inner: Arc<Mutex<BreakerInner>>,
    listener: Option<TransitionListener>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("scope", &self.scope)
            .field("state", &self.inner.lock().state)
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(scope: CircuitScope, config: CircuitBreakerConfig) -> Self {
        Self {
            scope,
            inner: Arc::new(Mutex::new(BreakerInner {
                config,
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                trial_in_flight: false,
                metrics: CircuitMetrics::default(),
            })),
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: TransitionListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn scope(&self) -> CircuitScope {
        self.scope
    }

    /// Get the current state
    pub fn state(&self) -> CircuitState {
        let (state, transition) = {
            let mut inner = self.inner.lock();
            let transition = self.refresh(&mut inner);
            (inner.state, transition)
        };
        self.notify(transition);
        state
    }

    /// Whether `try_acquire` would currently admit, without claiming a trial
    pub fn would_admit(&self) -> bool {
        let (admit, transition) = {
            let mut inner = self.inner.lock();
            let transition = self.refresh(&mut inner);
            let admit = match inner.state {
                CircuitState::Closed => true,
                CircuitState::HalfOpen => !inner.trial_in_flight,
                CircuitState::Open => false,
            };
            (admit, transition)
        };
        self.notify(transition);
        admit
    }

    /// Ask for permission to dispatch
    pub fn try_acquire(&self) -> Admission {
        let (admission, transition) = {
            let mut inner = self.inner.lock();
            let transition = self.refresh(&mut inner);
            let admission = match inner.state {
                CircuitState::Closed => Admission::Allowed,
                CircuitState::HalfOpen if !inner.trial_in_flight => {
                    inner.trial_in_flight = true;
                    log::debug!("Circuit {} admitting trial request", self.scope);
                    Admission::Trial
                }
                CircuitState::HalfOpen => {
                    inner.metrics.total_rejected += 1;
                    Admission::Rejected { retry_after: None }
                }
                CircuitState::Open => {
                    inner.metrics.total_rejected += 1;
                    Admission::Rejected {
                        retry_after: Self::remaining_cooldown(&inner),
                    }
                }
            };
            (admission, transition)
        };
        self.notify(transition);
        admission
    }

    /// Release a trial that was acquired but never dispatched
    pub fn abandon_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen && inner.trial_in_flight {
            inner.trial_in_flight = false;
            log::debug!("Circuit {} trial abandoned", self.scope);
        }
    }

    /// Time until an open circuit allows a trial
    pub fn retry_after(&self) -> Option<Duration> {
        let mut inner = self.inner.lock();
        let transition = self.refresh(&mut inner);
        let remaining = Self::remaining_cooldown(&inner);
        drop(inner);
        self.notify(transition);
        remaining
    }

    /// Record a successful operation admitted as `Allowed`
    ///
    /// While half-open this only counts: the circuit closes on the trial's result alone.
    pub fn record_success(&self) -> Option<Transition> {
        self.record(true, false)
    }

    /// Record a failed operation admitted as `Allowed`
    pub fn record_failure(&self) -> Option<Transition> {
        self.record(false, false)
    }

    /// Record the result of the operation admitted as [`Admission::Trial`]
    pub fn record_trial(&self, success: bool) -> Option<Transition> {
        self.record(success, true)
    }

    fn record(&self, success: bool, trial: bool) -> Option<Transition> {
        let transitions = {
            let mut inner = self.inner.lock();
            let lazy = self.refresh(&mut inner);
            let now = Instant::now();
            if success {
                inner.metrics.total_successes += 1;
            } else {
                inner.metrics.total_failures += 1;
                inner.metrics.last_failure_time = Some(now);
                inner.failures.push_back(now);
            }
            Self::prune_window(&mut inner, now);

            let changed = match (inner.state, success) {
                (CircuitState::HalfOpen, _) if !trial => {
                    log::debug!("Circuit {} half-open; non-trial outcome only counted", self.scope);
                    None
                }
                (CircuitState::HalfOpen, true) => {
                    inner.trial_in_flight = false;
                    inner.failures.clear();
                    inner.metrics.window_failures = 0;
                    log::info!("Circuit {} closed after successful trial", self.scope);
                    Some(Self::transition_to(&mut inner, CircuitState::Closed))
                }
                (CircuitState::HalfOpen, false) => {
                    inner.trial_in_flight = false;
                    log::warn!("Circuit {} reopened after failed trial", self.scope);
                    inner.opened_at = Some(now);
                    Some(Self::transition_to(&mut inner, CircuitState::Open))
                }
                (CircuitState::Closed, false)
                    if inner.failures.len() as u32 >= inner.config.failure_threshold =>
                {
                    log::warn!(
                        "Circuit {} opened after {} failures within {:?}",
                        self.scope,
                        inner.failures.len(),
                        inner.config.window
                    );
                    inner.opened_at = Some(now);
                    Some(Self::transition_to(&mut inner, CircuitState::Open))
                }
                // Outcomes of requests dispatched before the circuit opened
                _ => None,
            };
            [lazy, changed]
        };
        self.notify_all(transitions)
    }

    /// Get current metrics
    pub fn metrics(&self) -> CircuitMetrics {
        let mut inner = self.inner.lock();
        Self::prune_window(&mut inner, Instant::now());
        inner.metrics.clone()
    }

    /// Replace the thresholds; the current state is kept
    pub fn configure(&self, config: CircuitBreakerConfig) {
        self.inner.lock().config = config;
    }

    /// Reset the circuit breaker to closed state
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.failures.clear();
            inner.opened_at = None;
            inner.trial_in_flight = false;
            inner.metrics = CircuitMetrics::default();
            if inner.state != CircuitState::Closed {
                Some(Self::transition_to(&mut inner, CircuitState::Closed))
            } else {
                None
            }
        };
        self.notify(transition);
    }

    fn refresh(&self, inner: &mut BreakerInner) -> Option<Transition> {
        if inner.state != CircuitState::Open {
            return None;
        }
        let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
        if elapsed >= inner.config.cooldown {
            log::info!("Circuit {} half-open after {:?} cooldown", self.scope, inner.config.cooldown);
            inner.trial_in_flight = false;
            Some(Self::transition_to(inner, CircuitState::HalfOpen))
        } else {
            None
        }
    }

    fn transition_to(inner: &mut BreakerInner, to: CircuitState) -> Transition {
        let from = inner.state;
        inner.state = to;
        inner.metrics.last_state_change = Some(Instant::now());
        Transition { from, to }
    }

    fn prune_window(inner: &mut BreakerInner, now: Instant) {
        let window = inner.config.window;
        while let Some(&oldest) = inner.failures.front() {
            if now.duration_since(oldest) > window {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
        inner.metrics.window_failures = inner.failures.len() as u32;
    }

    fn remaining_cooldown(inner: &BreakerInner) -> Option<Duration> {
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened)) => {
                Some(inner.config.cooldown.saturating_sub(opened.elapsed()))
            }
            _ => None,
        }
    }

    fn notify(&self, transition: Option<Transition>) {
        if let (Some(listener), Some(transition)) = (&self.listener, transition) {
            listener(self.scope, transition);
        }
    }

    fn notify_all(&self, transitions: [Option<Transition>; 2]) -> Option<Transition> {
        let mut last = None;
        for transition in transitions.into_iter().flatten() {
            self.notify(Some(transition));
            last = Some(transition);
        }
        last
    }
}

/// Builder for circuit breaker configuration
pub struct CircuitBreakerBuilder {
    scope: CircuitScope,
    config: CircuitBreakerConfig,
    listener: Option<TransitionListener>,
}

impl CircuitBreakerBuilder {
    /// Create a new builder with default config
    pub fn new(scope: CircuitScope) -> Self {
        Self {
            scope,
            config: CircuitBreakerConfig::default(),
            listener: None,
        }
    }

    /// Set failure threshold
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    /// Set time window for failure counting
    pub fn window(mut self, window: Duration) -> Self {
        self.config.window = window;
        self
    }

    /// Set time spent open before a trial
    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.config.cooldown = cooldown;
        self
    }

    pub fn listener(mut self, listener: TransitionListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Build the circuit breaker
    pub fn build(self) -> CircuitBreaker {
        let breaker = CircuitBreaker::new(self.scope, self.config);
        match self.listener {
            Some(listener) => breaker.with_listener(listener),
            None => breaker,
        }
    }
}

/// Breakers keyed by scope, created on first use with shared settings
pub struct CircuitRegistry {
    config: Mutex<CircuitBreakerConfig>,
    breakers: Mutex<HashMap<CircuitScope, CircuitBreaker>>,
    listener: Option<TransitionListener>,
}

impl CircuitRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config: Mutex::new(config),
            breakers: Mutex::new(HashMap::new()),
            listener: None,
        }
    }

    pub fn with_listener(config: CircuitBreakerConfig, listener: TransitionListener) -> Self {
        Self {
            listener: Some(listener),
            ..Self::new(config)
        }
    }

    /// Breaker for `scope`, creating it if needed
    pub fn get(&self, scope: CircuitScope) -> CircuitBreaker {
        let mut breakers = self.breakers.lock();
        breakers
            .entry(scope)
            .or_insert_with(|| {
                let breaker = CircuitBreaker::new(scope, self.config.lock().clone());
                match &self.listener {
                    Some(listener) => breaker.with_listener(listener.clone()),
                    None => breaker,
                }
            })
            .clone()
    }

    /// Existing breaker for `scope`, if any
    pub fn find(&self, scope: CircuitScope) -> Option<CircuitBreaker> {
        self.breakers.lock().get(&scope).cloned()
    }

    /// Apply new thresholds to every breaker; a no-op when unchanged
    pub fn configure(&self, config: &CircuitBreakerConfig) {
        let mut current = self.config.lock();
        if *current == *config {
            return;
        }
        *current = config.clone();
        drop(current);

        for breaker in self.breakers.lock().values() {
            breaker.configure(config.clone());
        }
        log::debug!("Circuit breaker settings updated: {:?}", config);
    }

    /// Current state of every known scope, ordered by scope
    pub fn states(&self) -> Vec<(CircuitScope, CircuitState)> {
        let breakers: Vec<CircuitBreaker> = self.breakers.lock().values().cloned().collect();
        let mut states: Vec<_> = breakers.iter().map(|b| (b.scope(), b.state())).collect();
        states.sort_by_key(|(scope, _)| *scope);
        states
    }

    pub fn remove(&self, scope: CircuitScope) {
        self.breakers.lock().remove(&scope);
    }
}
