//! Disk health tracking for the WARM tier.
//!
//! # State Transitions
//! ```text
//! Normal → MemoryOnly: consecutive failures (probes or writes) reach the threshold
//! MemoryOnly → MemoryOnly: recovery probe fails, next probe at the next backoff step
//! MemoryOnly → Normal: recovery probe succeeds
//! ```
//!
//! Only the health monitor, the recovery scheduler and the write path
//! mutate this state.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::resilience::backoff::RecoveryBackoff;

/// Whether the WARM tier is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskMode {
    Normal,
    MemoryOnly,
}

impl DiskMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskMode::Normal => "normal",
            DiskMode::MemoryOnly => "memory_only",
        }
    }
}

/// Point-in-time view of disk health for stats and the admin surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskHealth {
    pub mode: DiskMode,
    pub consecutive_failures: u32,
    pub last_probe_ok: Option<bool>,
    pub last_probe_age_ms: Option<u64>,
    pub recovery_attempt: u32,
    /// Time until the next recovery probe while memory-only.
    pub recovery_countdown_ms: Option<u64>,
}

#[derive(Debug)]
pub(crate) struct DiskHealthState {
    consecutive_failures: u32,
    last_probe_at: Option<Instant>,
    last_probe_ok: Option<bool>,
    mode: DiskMode,
    next_recovery_at: Option<Instant>,
    recovery_attempt: u32,
}

impl DiskHealthState {
    pub(crate) fn new() -> Self {
        Self {
            consecutive_failures: 0,
            last_probe_at: None,
            last_probe_ok: None,
            mode: DiskMode::Normal,
            next_recovery_at: None,
            recovery_attempt: 0,
        }
    }

    pub(crate) fn mode(&self) -> DiskMode {
        self.mode
    }

    pub(crate) fn next_recovery_at(&self) -> Option<Instant> {
        self.next_recovery_at
    }

    pub(crate) fn record_probe(&mut self, ok: bool, now: Instant) {
        self.last_probe_at = Some(now);
        self.last_probe_ok = Some(ok);
    }

    pub(crate) fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Count a probe or write failure. Returns true if this failure switched
    /// the tier to memory-only.
    pub(crate) fn record_failure(&mut self, threshold: u32, now: Instant, backoff: &RecoveryBackoff) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.mode == DiskMode::Normal && self.consecutive_failures >= threshold {
            self.mode = DiskMode::MemoryOnly;
            self.recovery_attempt = 0;
            self.next_recovery_at = Some(now + backoff.delay(0));
            return true;
        }
        false
    }

    /// A recovery probe failed; schedule the next one.
    pub(crate) fn recovery_failed(&mut self, now: Instant, backoff: &RecoveryBackoff) -> Duration {
        self.recovery_attempt += 1;
        let delay = backoff.delay(self.recovery_attempt);
        self.next_recovery_at = Some(now + delay);
        delay
    }

    pub(crate) fn recovered(&mut self) {
        self.mode = DiskMode::Normal;
        self.consecutive_failures = 0;
        self.recovery_attempt = 0;
        self.next_recovery_at = None;
    }

    pub(crate) fn snapshot(&self, now: Instant) -> DiskHealth {
        DiskHealth {
            mode: self.mode,
            consecutive_failures: self.consecutive_failures,
            last_probe_ok: self.last_probe_ok,
            last_probe_age_ms: self
                .last_probe_at
                .map(|at| now.saturating_duration_since(at).as_millis() as u64),
            recovery_attempt: self.recovery_attempt,
            recovery_countdown_ms: self
                .next_recovery_at
                .map(|at| at.saturating_duration_since(now).as_millis() as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> RecoveryBackoff {
        RecoveryBackoff::new(
            [5u64, 10, 20, 40].iter().map(|m| Duration::from_secs(m * 60)).collect(),
            Duration::from_secs(3600),
        )
    }

    #[test]
    fn threshold_switches_to_memory_only() {
        let backoff = backoff();
        let now = Instant::now();
        let mut state = DiskHealthState::new();

        assert!(!state.record_failure(3, now, &backoff));
        assert!(!state.record_failure(3, now, &backoff));
        assert!(state.record_failure(3, now, &backoff));
        assert_eq!(state.mode(), DiskMode::MemoryOnly);
        assert_eq!(state.next_recovery_at(), Some(now + Duration::from_secs(300)));

        // Already memory-only; no second switch.
        assert!(!state.record_failure(3, now, &backoff));
    }

    #[test]
    fn success_resets_the_streak() {
        let backoff = backoff();
        let now = Instant::now();
        let mut state = DiskHealthState::new();
        state.record_failure(3, now, &backoff);
        state.record_failure(3, now, &backoff);
        state.record_success();
        assert!(!state.record_failure(3, now, &backoff));
        assert_eq!(state.mode(), DiskMode::Normal);
    }

    #[test]
    fn recovery_walks_the_schedule() {
        let backoff = backoff();
        let now = Instant::now();
        let mut state = DiskHealthState::new();
        for _ in 0..3 {
            state.record_failure(3, now, &backoff);
        }

        let delays: Vec<u64> = (0..5).map(|_| state.recovery_failed(now, &backoff).as_secs() / 60).collect();
        assert_eq!(delays, vec![10, 20, 40, 60, 60]);

        state.recovered();
        let snap = state.snapshot(now);
        assert_eq!(snap.mode, DiskMode::Normal);
        assert_eq!(snap.recovery_countdown_ms, None);
        assert_eq!(snap.consecutive_failures, 0);
    }
}
