//! Guarded invocation of cross-boundary calls.
//!
//! # Flow per attempt
//! ```text
//! breaker.attempt(channel)
//!     Deny  → fallback if supplied, else BreakerOpen
//!     Allow → run_with_deadline(timeout, call)
//!               ok        → record_success, return Completed
//!               failure   → record_failure
//!                           retry if attempts remain and the breaker is not open
//!                           else fallback if supplied, else the last error
//! ```
//!
//! # Design Decisions
//! - One breaker per channel, owned by this boundary
//! - Every attempt gets a child of the boundary's root token; drain cancels the root
//! - Correlation ID is minted once per invocation and shared by all attempts

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::boundary::types::{CallContext, CallError, CallOutcome, InvokeOptions, TransportError};
use crate::config::CallConfig;
use crate::lifecycle::InFlightTracker;
use crate::observability::{metrics, CorrelationId};
use crate::resilience::retries::RetryPolicy;
use crate::resilience::timeouts::run_with_deadline;
use crate::resilience::{BreakerPolicy, BreakerRegistry, BreakerSnapshot, CircuitState};

#[derive(Debug, Default)]
struct ChannelCounters {
    attempts: AtomicU64,
    successes: AtomicU64,
    timeouts: AtomicU64,
    transport_failures: AtomicU64,
    breaker_denied: AtomicU64,
    fallbacks: AtomicU64,
}

/// How a single attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptResult {
    Success,
    TransportFailure,
    Timeout,
    BreakerDenied,
}

impl AttemptResult {
    /// Metric label for `bulkhead_call_attempts_total`.
    fn label(self) -> &'static str {
        match self {
            AttemptResult::Success => "success",
            AttemptResult::TransportFailure => "transport_failure",
            AttemptResult::Timeout => "timeout",
            AttemptResult::BreakerDenied => "breaker_denied",
        }
    }
}

/// Per-channel call statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub channel: String,
    pub attempts: u64,
    pub successes: u64,
    pub timeouts: u64,
    pub transport_failures: u64,
    pub breaker_denied: u64,
    pub fallbacks: u64,
}

/// Wraps outbound calls with timeout, retry, breaker and fallback.
#[derive(Debug)]
pub struct CallBoundary {
    config: CallConfig,
    breakers: BreakerRegistry<String>,
    channels: DashMap<String, ChannelCounters>,
    in_flight: InFlightTracker,
    root: CancellationToken,
}

impl CallBoundary {
    pub fn new(config: CallConfig, breaker: BreakerPolicy) -> Self {
        tracing::info!(
            timeout = ?config.timeout(),
            max_retries = config.max_retries,
            "Call boundary created"
        );
        Self {
            config,
            breakers: BreakerRegistry::new("channel", breaker),
            channels: DashMap::new(),
            in_flight: InFlightTracker::new(),
            root: CancellationToken::new(),
        }
    }

    /// Invoke `call` across `channel`.
    ///
    /// `call` is invoked once per attempt with a clone of `payload`. Returns
    /// `Completed` when an attempt succeeds and `Fallback` when the call could
    /// not complete but `options.fallback` was supplied.
    pub async fn invoke<P, T, F, Fut>(
        &self,
        channel: &str,
        payload: P,
        options: InvokeOptions<T>,
        mut call: F,
    ) -> Result<CallOutcome<T>, CallError>
    where
        P: Clone,
        F: FnMut(P, CallContext) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let Some(_guard) = self.in_flight.enter() else {
            return Err(CallError::Draining);
        };

        let key = channel.to_string();
        let correlation_id = options.correlation_id.unwrap_or_default();
        let timeout = options.timeout.unwrap_or_else(|| self.config.timeout());
        let retries = RetryPolicy {
            max_retries: options.max_retries.unwrap_or(self.config.max_retries),
            ..RetryPolicy::from(&self.config)
        };
        let mut fallback = options.fallback;

        let mut attempt = 0;
        loop {
            attempt += 1;

            let Some(permit) = self.breakers.permit(&key) else {
                self.count(&key, |c| &c.breaker_denied);
                metrics::record_call_attempt(
                    channel,
                    AttemptResult::BreakerDenied.label(),
                    std::time::Instant::now(),
                );
                tracing::debug!(
                    correlation_id = %correlation_id,
                    channel = %channel,
                    attempt,
                    "Call short-circuited, breaker open"
                );
                return self.fall_back(
                    &key,
                    correlation_id,
                    fallback.take(),
                    CallError::BreakerOpen { channel: key.clone() },
                );
            };

            self.count(&key, |c| &c.attempts);
            let start_time = std::time::Instant::now();
            let run = run_with_deadline(timeout, &self.root, |cancellation| {
                call(
                    payload.clone(),
                    CallContext {
                        correlation_id,
                        channel: key.clone(),
                        attempt,
                        timeout,
                        cancellation,
                    },
                )
            });
            let result = tokio::select! {
                result = run => result,
                _ = self.root.cancelled() => {
                    tracing::warn!(correlation_id = %correlation_id, channel = %channel, "Call abandoned by drain");
                    return Err(CallError::Draining);
                }
            };

            let error = match result {
                Ok(Ok(value)) => {
                    permit.success();
                    self.count(&key, |c| &c.successes);
                    metrics::record_call_attempt(channel, AttemptResult::Success.label(), start_time);
                    tracing::debug!(correlation_id = %correlation_id, channel = %channel, attempt, "Call succeeded");
                    return Ok(CallOutcome::Completed(value));
                }
                Ok(Err(e)) => {
                    permit.failure();
                    self.count(&key, |c| &c.transport_failures);
                    metrics::record_call_attempt(channel, AttemptResult::TransportFailure.label(), start_time);
                    tracing::warn!(
                        correlation_id = %correlation_id,
                        channel = %channel,
                        attempt,
                        error = %e,
                        "Call failed"
                    );
                    CallError::TransportFailure {
                        channel: key.clone(),
                        message: e.to_string(),
                    }
                }
                Err(_) => {
                    permit.failure();
                    self.count(&key, |c| &c.timeouts);
                    metrics::record_call_attempt(channel, AttemptResult::Timeout.label(), start_time);
                    tracing::warn!(
                        correlation_id = %correlation_id,
                        channel = %channel,
                        attempt,
                        timeout = ?timeout,
                        "Call timed out"
                    );
                    CallError::CallTimeout {
                        channel: key.clone(),
                        timeout,
                    }
                }
            };

            if !retries.allows_another(attempt) || self.breakers.state(&key) == CircuitState::Open {
                return self.fall_back(&key, correlation_id, fallback.take(), error);
            }

            let delay = retries.delay_after(attempt);
            tracing::info!(correlation_id = %correlation_id, channel = %channel, attempt, delay = ?delay, "Retrying call");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.root.cancelled() => return Err(CallError::Draining),
            }
        }
    }

    fn fall_back<T>(
        &self,
        key: &str,
        correlation_id: CorrelationId,
        fallback: Option<T>,
        error: CallError,
    ) -> Result<CallOutcome<T>, CallError> {
        match fallback {
            Some(value) => {
                self.count(key, |c| &c.fallbacks);
                tracing::info!(
                    correlation_id = %correlation_id,
                    channel = %key,
                    reason = error.kind(),
                    "Returning fallback"
                );
                Ok(CallOutcome::Fallback(value))
            }
            None => Err(error),
        }
    }

    fn count(&self, key: &str, field: impl FnOnce(&ChannelCounters) -> &AtomicU64) {
        if let Some(c) = self.channels.get(key) {
            field(c.value()).fetch_add(1, Ordering::Relaxed);
            return;
        }
        let c = self.channels.entry(key.to_string()).or_default();
        field(c.value()).fetch_add(1, Ordering::Relaxed);
    }

    pub fn breaker_state(&self, channel: &str) -> CircuitState {
        self.breakers.state(&channel.to_string())
    }

    pub fn breaker_states(&self) -> Vec<BreakerSnapshot> {
        self.breakers.snapshot()
    }

    /// Force a channel's breaker closed, e.g. after an operator fixed the peer.
    pub fn reset_breaker(&self, channel: &str) {
        self.breakers.reset(&channel.to_string());
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.active()
    }

    pub fn stats(&self) -> Vec<ChannelStats> {
        let mut stats: Vec<ChannelStats> = self
            .channels
            .iter()
            .map(|entry| {
                let c = entry.value();
                ChannelStats {
                    channel: entry.key().clone(),
                    attempts: c.attempts.load(Ordering::Relaxed),
                    successes: c.successes.load(Ordering::Relaxed),
                    timeouts: c.timeouts.load(Ordering::Relaxed),
                    transport_failures: c.transport_failures.load(Ordering::Relaxed),
                    breaker_denied: c.breaker_denied.load(Ordering::Relaxed),
                    fallbacks: c.fallbacks.load(Ordering::Relaxed),
                }
            })
            .collect();
        stats.sort_by(|a, b| a.channel.cmp(&b.channel));
        stats
    }

    /// Refuse new calls, wait up to `grace` for in-flight ones, then cancel the rest.
    pub async fn drain(&self, grace: Duration) {
        if !self.in_flight.drain(grace).await {
            tracing::warn!(
                remaining = self.in_flight.active(),
                "Drain grace elapsed, cancelling in-flight calls"
            );
        }
        self.root.cancel();
        tracing::info!("Call boundary drained");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    use super::*;

    fn boundary(threshold: u32, max_retries: u32) -> CallBoundary {
        let config = CallConfig {
            timeout_ms: 1_000,
            max_retries,
            base_delay_ms: 10,
            max_delay_ms: 100,
        };
        let policy = BreakerPolicy {
            failure_threshold: threshold,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        };
        CallBoundary::new(config, policy)
    }

    #[tokio::test(start_paused = true)]
    async fn completes_on_first_attempt() {
        let b = boundary(5, 2);
        let out = b
            .invoke("peer", 21u32, InvokeOptions::new(), |n, ctx| async move {
                assert_eq!(ctx.attempt, 1);
                Ok(n * 2)
            })
            .await
            .unwrap();
        assert_eq!(out, CallOutcome::Completed(42));
        assert_eq!(b.stats()[0].successes, 1);
        assert_eq!(b.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transport_failures() {
        let b = boundary(5, 2);
        let calls = AtomicU32::new(0);
        let out = b
            .invoke("peer", (), InvokeOptions::new(), |_, ctx| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if ctx.attempt < 3 {
                        Err(TransportError::new("connection reset"))
                    } else {
                        Ok("pong")
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(out.into_inner(), "pong");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(b.stats()[0].transport_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_cancels_attempt_and_surfaces_error() {
        let b = boundary(10, 1);
        let cancelled = Arc::new(AtomicU32::new(0));
        let err = b
            .invoke::<_, (), _, _>(
                "slow",
                (),
                InvokeOptions::new().timeout(Duration::from_millis(200)),
                |_, ctx| {
                    let cancelled = cancelled.clone();
                    async move {
                        let token = ctx.cancellation.clone();
                        tokio::spawn(async move {
                            token.cancelled().await;
                            cancelled.fetch_add(1, Ordering::SeqCst);
                        });
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok(())
                    }
                },
            )
            .await
            .unwrap_err();

        assert_eq!(
            err,
            CallError::CallTimeout {
                channel: "slow".into(),
                timeout: Duration::from_millis(200)
            }
        );
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(cancelled.load(Ordering::SeqCst), 2);
        assert_eq!(b.stats()[0].timeouts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_returns_fallback_without_invoking() {
        let b = boundary(5, 0);
        let calls = AtomicU32::new(0);
        let failing = |_: (), _: CallContext| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<&str, _>(TransportError::new("refused")) }
        };

        for _ in 0..5 {
            let err = b.invoke("peer", (), InvokeOptions::new(), failing).await.unwrap_err();
            assert!(matches!(err, CallError::TransportFailure { .. }));
            tokio::time::advance(Duration::from_secs(5)).await;
        }
        assert_eq!(b.breaker_state("peer"), CircuitState::Open);

        let out = b
            .invoke("peer", (), InvokeOptions::new().fallback("cached"), failing)
            .await
            .unwrap();
        assert_eq!(out, CallOutcome::Fallback("cached"));
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        let err = b.invoke("peer", (), InvokeOptions::new(), failing).await.unwrap_err();
        assert_eq!(err, CallError::BreakerOpen { channel: "peer".into() });

        let stats = &b.stats()[0];
        assert_eq!(stats.breaker_denied, 2);
        assert_eq!(stats.fallbacks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_opening_mid_sequence_stops_retries() {
        let b = boundary(2, 5);
        let calls = AtomicU32::new(0);
        let err = b
            .invoke::<_, (), _, _>("peer", (), InvokeOptions::new(), |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TransportError::new("refused")) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::TransportFailure { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_probe_success_closes() {
        let b = boundary(1, 0);
        let _ = b
            .invoke::<_, (), _, _>("peer", (), InvokeOptions::new(), |_, _| async {
                Err(TransportError::new("down"))
            })
            .await;
        assert_eq!(b.breaker_state("peer"), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        let out = b
            .invoke("peer", (), InvokeOptions::new(), |_, _| async { Ok(1) })
            .await
            .unwrap();
        assert_eq!(out, CallOutcome::Completed(1));
        assert_eq!(b.breaker_state("peer"), CircuitState::Closed);
    }

    #[test]
    fn denied_attempt_label_matches_stats_field() {
        let stats = ChannelStats {
            channel: "peer".into(),
            attempts: 0,
            successes: 0,
            timeouts: 0,
            transport_failures: 0,
            breaker_denied: 3,
            fallbacks: 0,
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(AttemptResult::BreakerDenied.label(), "breaker_denied");
        assert_eq!(json[AttemptResult::BreakerDenied.label()], 3);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_half_open_call_does_not_wedge_breaker() {
        let b = boundary(1, 0);
        let _ = b
            .invoke::<_, (), _, _>("peer", (), InvokeOptions::new(), |_, _| async {
                Err(TransportError::new("down"))
            })
            .await;
        tokio::time::advance(Duration::from_secs(31)).await;

        // The caller gives up on the half-open call before it resolves.
        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            b.invoke("peer", (), InvokeOptions::new(), |_, _| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(0)
            }),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(b.breaker_state("peer"), CircuitState::HalfOpen);
        assert_eq!(b.in_flight(), 0);

        let out = b
            .invoke("peer", (), InvokeOptions::new(), |_, _| async { Ok(1) })
            .await
            .unwrap();
        assert_eq!(out, CallOutcome::Completed(1));
        assert_eq!(b.breaker_state("peer"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn channels_are_isolated() {
        let b = boundary(1, 0);
        let _ = b
            .invoke::<_, (), _, _>("bad", (), InvokeOptions::new(), |_, _| async {
                Err(TransportError::new("down"))
            })
            .await;
        let out = b
            .invoke("good", (), InvokeOptions::new(), |_, _| async { Ok(()) })
            .await;
        assert!(out.is_ok());
        assert_eq!(b.breaker_state("bad"), CircuitState::Open);
        assert_eq!(b.breaker_state("good"), CircuitState::Closed);
        assert_eq!(b.stats().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_cancels_stuck_calls_and_refuses_new_ones() {
        let b = Arc::new(boundary(5, 0));
        let stuck = {
            let b = b.clone();
            tokio::spawn(async move {
                b.invoke::<_, (), _, _>(
                    "peer",
                    (),
                    InvokeOptions::new().timeout(Duration::from_secs(600)),
                    |_, _| async {
                        tokio::time::sleep(Duration::from_secs(300)).await;
                        Ok(())
                    },
                )
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(b.in_flight(), 1);

        b.drain(Duration::from_secs(1)).await;
        assert_eq!(stuck.await.unwrap().unwrap_err(), CallError::Draining);
        let err = b
            .invoke("peer", (), InvokeOptions::new(), |_, _| async { Ok(()) })
            .await
            .unwrap_err();
        assert_eq!(err, CallError::Draining);
    }
}
