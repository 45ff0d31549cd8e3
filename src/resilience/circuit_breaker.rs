//! Circuit breaker keyed by resource identity.
//!
//! # States
//! - Closed: normal operation, attempts pass through
//! - Open: resource assumed down, attempts fail fast
//! - Half-Open: testing if resource recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure_count >= threshold within window
//! Open → Half-Open: on the first attempt after the cooldown
//! Half-Open → Closed: probe succeeds
//! Half-Open → Open: probe fails (cooldown restarts)
//! ```
//!
//! # Design Decisions
//! - One registry per resource class, owned by the component using it
//! - Per-key breakers (not global), created lazily on first use
//! - Single probe in Half-Open (prevents hammering a recovering resource)
//! - Pure state: the breaker never performs the guarded work

use std::fmt::Display;
use std::hash::Hash;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::BreakerConfig;
use crate::observability::metrics;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Outcome of asking the breaker for permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Thresholds shared by every breaker in a registry.
#[derive(Debug, Clone, Copy)]
pub struct BreakerPolicy {
    pub failure_threshold: u32,
    pub failure_window: Duration,
    pub cooldown: Duration,
}

impl From<&BreakerConfig> for BreakerPolicy {
    fn from(config: &BreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            failure_window: config.failure_window(),
            cooldown: config.cooldown(),
        }
    }
}

/// State machine for a single key.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    failure_window_start: Option<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            failure_window_start: None,
            opened_at: None,
            probe_in_flight: false,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Ask for permission. Returns the decision and the state entered, if any.
    pub fn attempt(&mut self, policy: &BreakerPolicy, now: Instant) -> (Decision, Option<CircuitState>) {
        match self.state {
            CircuitState::Closed => (Decision::Allow, None),
            CircuitState::Open => {
                let cooled = self
                    .opened_at
                    .map_or(true, |opened| now >= opened + policy.cooldown);
                if cooled {
                    self.state = CircuitState::HalfOpen;
                    self.probe_in_flight = true;
                    (Decision::Allow, Some(CircuitState::HalfOpen))
                } else {
                    (Decision::Deny, None)
                }
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    (Decision::Deny, None)
                } else {
                    self.probe_in_flight = true;
                    (Decision::Allow, None)
                }
            }
        }
    }

    pub fn record_success(&mut self) -> Option<CircuitState> {
        match self.state {
            CircuitState::HalfOpen => {
                self.close();
                Some(CircuitState::Closed)
            }
            // A late success from an attempt admitted before the circuit opened.
            CircuitState::Open | CircuitState::Closed => None,
        }
    }

    pub fn record_failure(&mut self, policy: &BreakerPolicy, now: Instant) -> Option<CircuitState> {
        match self.state {
            CircuitState::Closed => {
                let in_window = self
                    .failure_window_start
                    .map_or(false, |start| now.duration_since(start) <= policy.failure_window);
                if in_window {
                    self.failure_count += 1;
                } else {
                    self.failure_window_start = Some(now);
                    self.failure_count = 1;
                }
                if self.failure_count >= policy.failure_threshold {
                    self.open(now);
                    Some(CircuitState::Open)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                self.open(now);
                Some(CircuitState::Open)
            }
            CircuitState::Open => None,
        }
    }

    /// Give back a half-open probe slot without judging the resource.
    pub fn release_probe(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.probe_in_flight = false;
        }
    }

    /// Remaining cooldown while open.
    pub fn cooldown_remaining(&self, policy: &BreakerPolicy, now: Instant) -> Option<Duration> {
        match (self.state, self.opened_at) {
            (CircuitState::Open, Some(opened)) => {
                Some((opened + policy.cooldown).saturating_duration_since(now))
            }
            _ => None,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.probe_in_flight = false;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.failure_window_start = None;
        self.opened_at = None;
        self.probe_in_flight = false;
    }
}

/// Point-in-time view of one breaker, for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub key: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub cooldown_remaining_ms: Option<u64>,
}

/// One granted attempt against a key.
///
/// Consume it with [`success`](Permit::success) or
/// [`failure`](Permit::failure). Dropping it unconsumed returns a held
/// half-open probe slot, so an abandoned attempt (a cancelled future, a
/// timed-out caller) never leaves the key stuck in half-open.
#[derive(Debug)]
#[must_use = "a permit should be resolved with success() or failure()"]
pub struct Permit<'a, K>
where
    K: Eq + Hash + Clone + Display,
{
    registry: &'a BreakerRegistry<K>,
    key: K,
    probe: bool,
}

impl<K> Permit<'_, K>
where
    K: Eq + Hash + Clone + Display,
{
    /// Whether this attempt is the half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.probe = false;
        self.registry.record_success(&self.key);
    }

    pub fn failure(mut self) {
        self.probe = false;
        self.registry.record_failure(&self.key);
    }
}

impl<K> Drop for Permit<'_, K>
where
    K: Eq + Hash + Clone + Display,
{
    fn drop(&mut self) {
        if self.probe {
            self.registry.release_probe(&self.key);
        }
    }
}

/// Breakers for one resource class, one per key.
#[derive(Debug)]
pub struct BreakerRegistry<K>
where
    K: Eq + Hash,
{
    class: &'static str,
    policy: BreakerPolicy,
    breakers: DashMap<K, CircuitBreaker>,
}

impl<K> BreakerRegistry<K>
where
    K: Eq + Hash + Clone + Display,
{
    /// Create an empty registry for the named resource class.
    pub fn new(class: &'static str, policy: BreakerPolicy) -> Self {
        Self {
            class,
            policy,
            breakers: DashMap::new(),
        }
    }

    pub fn class(&self) -> &'static str {
        self.class
    }

    pub fn policy(&self) -> &BreakerPolicy {
        &self.policy
    }

    /// Ask whether an attempt against `key` may proceed.
    ///
    /// A granted half-open probe stays taken until `record_success`,
    /// `record_failure` or `release_probe`; prefer [`permit`](Self::permit)
    /// when the attempt spans an await.
    pub fn attempt(&self, key: &K) -> Decision {
        self.decide(key).0
    }

    /// Like `attempt`, but the grant is a [`Permit`] that gives a half-open
    /// probe back if it is dropped without an outcome.
    pub fn permit(&self, key: &K) -> Option<Permit<'_, K>> {
        let (decision, probe) = self.decide(key);
        decision.is_allowed().then(|| Permit {
            registry: self,
            key: key.clone(),
            probe,
        })
    }

    /// Returns the decision and whether it granted the half-open probe.
    fn decide(&self, key: &K) -> (Decision, bool) {
        let now = Instant::now();
        let (decision, transition, probe) = match self.breakers.get_mut(key) {
            Some(mut breaker) => {
                let (decision, transition) = breaker.attempt(&self.policy, now);
                let probe = decision.is_allowed() && breaker.state() == CircuitState::HalfOpen;
                (decision, transition, probe)
            }
            None => return (Decision::Allow, false),
        };
        if let Some(to) = transition {
            self.log_transition(key, to);
        }
        (decision, probe)
    }

    pub fn record_success(&self, key: &K) {
        let transition = self
            .breakers
            .get_mut(key)
            .and_then(|mut breaker| breaker.record_success());
        if let Some(to) = transition {
            self.log_transition(key, to);
        }
    }

    pub fn record_failure(&self, key: &K) {
        let now = Instant::now();
        let transition = self
            .breakers
            .entry(key.clone())
            .or_default()
            .record_failure(&self.policy, now);
        if let Some(to) = transition {
            self.log_transition(key, to);
        }
    }

    /// Return an unused half-open probe slot.
    pub fn release_probe(&self, key: &K) {
        if let Some(mut breaker) = self.breakers.get_mut(key) {
            breaker.release_probe();
        }
    }

    pub fn state(&self, key: &K) -> CircuitState {
        self.breakers
            .get(key)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    /// Force a key back to Closed.
    pub fn reset(&self, key: &K) {
        if self.breakers.remove(key).is_some() {
            tracing::info!(class = self.class, key = %key, "Breaker reset");
        }
    }

    /// Snapshot of every known breaker, sorted by key.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let now = Instant::now();
        let mut out: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| BreakerSnapshot {
                key: entry.key().to_string(),
                state: entry.state(),
                failure_count: entry.failure_count(),
                cooldown_remaining_ms: entry
                    .cooldown_remaining(&self.policy, now)
                    .map(|d| d.as_millis() as u64),
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    fn log_transition(&self, key: &K, to: CircuitState) {
        match to {
            CircuitState::Open => {
                tracing::warn!(class = self.class, key = %key, cooldown = ?self.policy.cooldown, "Circuit opened")
            }
            CircuitState::HalfOpen => {
                tracing::info!(class = self.class, key = %key, "Circuit half-open, probing")
            }
            CircuitState::Closed => tracing::info!(class = self.class, key = %key, "Circuit closed"),
        }
        metrics::record_breaker_transition(self.class, to.as_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy() -> BreakerPolicy {
        BreakerPolicy {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }

    fn registry() -> BreakerRegistry<String> {
        BreakerRegistry::new("test", policy())
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_within_window() {
        let reg = registry();
        let key = "svc".to_string();

        for _ in 0..4 {
            reg.record_failure(&key);
            tokio::time::advance(Duration::from_secs(10)).await;
        }
        assert_eq!(reg.state(&key), CircuitState::Closed);

        reg.record_failure(&key);
        assert_eq!(reg.state(&key), CircuitState::Open);
        assert_eq!(reg.attempt(&key), Decision::Deny);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_outside_window_restart_count() {
        let reg = registry();
        let key = "svc".to_string();

        for _ in 0..4 {
            reg.record_failure(&key);
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        reg.record_failure(&key);
        assert_eq!(reg.state(&key), CircuitState::Closed);
        assert_eq!(reg.snapshot()[0].failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_allows_single_probe() {
        let reg = registry();
        let key = "svc".to_string();
        for _ in 0..5 {
            reg.record_failure(&key);
        }

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(reg.attempt(&key), Decision::Deny);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(reg.attempt(&key), Decision::Allow);
        assert_eq!(reg.state(&key), CircuitState::HalfOpen);
        assert_eq!(reg.attempt(&key), Decision::Deny);

        reg.record_success(&key);
        assert_eq!(reg.state(&key), CircuitState::Closed);
        assert_eq!(reg.attempt(&key), Decision::Allow);
        assert_eq!(reg.snapshot()[0].failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_failure_restarts_cooldown() {
        let reg = registry();
        let key = "svc".to_string();
        for _ in 0..5 {
            reg.record_failure(&key);
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(reg.attempt(&key).is_allowed());
        reg.record_failure(&key);
        assert_eq!(reg.state(&key), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(reg.attempt(&key), Decision::Deny);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(reg.attempt(&key), Decision::Allow);
    }

    #[tokio::test(start_paused = true)]
    async fn released_probe_can_be_retaken() {
        let reg = registry();
        let key = "svc".to_string();
        for _ in 0..5 {
            reg.record_failure(&key);
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(reg.attempt(&key).is_allowed());
        reg.release_probe(&key);
        assert!(reg.attempt(&key).is_allowed());
        assert_eq!(reg.attempt(&key), Decision::Deny);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_permit_frees_half_open_slot() {
        let reg = registry();
        let key = "svc".to_string();
        for _ in 0..5 {
            reg.record_failure(&key);
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        let permit = reg.permit(&key).unwrap();
        assert!(permit.is_probe());
        assert!(reg.permit(&key).is_none());
        drop(permit);

        let permit = reg.permit(&key).unwrap();
        assert!(permit.is_probe());
        permit.success();
        assert_eq!(reg.state(&key), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn resolved_permit_does_not_release() {
        let reg = registry();
        let key = "svc".to_string();
        for _ in 0..5 {
            reg.record_failure(&key);
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        reg.permit(&key).unwrap().failure();
        assert_eq!(reg.state(&key), CircuitState::Open);
        assert!(reg.permit(&key).is_none());

        // A closed-state permit is not a probe and dropping it changes nothing.
        let other = "other".to_string();
        let permit = reg.permit(&other).unwrap();
        assert!(!permit.is_probe());
        drop(permit);
        assert_eq!(reg.state(&other), CircuitState::Closed);
    }

    #[test]
    fn keys_are_independent() {
        let reg = registry();
        let a = "a".to_string();
        let b = "b".to_string();
        for _ in 0..5 {
            reg.record_failure(&a);
        }
        assert_eq!(reg.state(&a), CircuitState::Open);
        assert_eq!(reg.attempt(&b), Decision::Allow);
        reg.reset(&a);
        assert_eq!(reg.state(&a), CircuitState::Closed);
    }

    proptest! {
        #[test]
        fn never_more_than_one_half_open_probe(ops in proptest::collection::vec(0u8..4, 1..200)) {
            let policy = BreakerPolicy {
                failure_threshold: 2,
                failure_window: Duration::from_secs(60),
                cooldown: Duration::ZERO,
            };
            let mut breaker = CircuitBreaker::new();
            let now = Instant::now();
            let mut outstanding_probes = 0u32;

            for op in ops {
                match op {
                    0 => {
                        let was_half_open_or_open = breaker.state() != CircuitState::Closed;
                        let (decision, _) = breaker.attempt(&policy, now);
                        if decision.is_allowed() && was_half_open_or_open {
                            outstanding_probes += 1;
                        }
                    }
                    1 => {
                        if breaker.state() == CircuitState::HalfOpen {
                            outstanding_probes = outstanding_probes.saturating_sub(1);
                        }
                        breaker.record_success();
                    }
                    2 => {
                        if breaker.state() == CircuitState::HalfOpen {
                            outstanding_probes = outstanding_probes.saturating_sub(1);
                        }
                        breaker.record_failure(&policy, now);
                    }
                    _ => {
                        if breaker.state() == CircuitState::HalfOpen {
                            outstanding_probes = outstanding_probes.saturating_sub(1);
                        }
                        breaker.release_probe();
                    }
                }
                if breaker.state() != CircuitState::HalfOpen {
                    outstanding_probes = 0;
                }
                prop_assert!(outstanding_probes <= 1);
            }
        }
    }
}
