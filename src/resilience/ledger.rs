//! Capacity accounting for a bounded resource.
//!
//! # Responsibilities
//! - Track used units (connections, bytes) against a total capacity
//! - Enforce an optional per-identity limit
//! - Clamp and log mismatched releases instead of underflowing
//!
//! # Design Decisions
//! - Accounting only, never execution
//! - One mutex per ledger, held for the increment/decrement only (never across I/O)
//! - Identities with nothing outstanding are dropped from the map

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Mutex;

use thiserror::Error;

/// Why an acquisition was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Denial {
    #[error("capacity exceeded")]
    CapacityExceeded,
    #[error("per-identity limit exceeded")]
    PerIdentityExceeded,
}

#[derive(Debug)]
struct LedgerState<I> {
    capacity: u64,
    used: u64,
    per_identity_used: HashMap<I, u64>,
}

/// Used-vs-capacity ledger for one resource class.
#[derive(Debug)]
pub struct ResourceLedger<I = String>
where
    I: Eq + Hash,
{
    name: &'static str,
    per_identity_limit: Option<u64>,
    state: Mutex<LedgerState<I>>,
}

impl<I> ResourceLedger<I>
where
    I: Eq + Hash + Clone + Display,
{
    /// Create a ledger. `per_identity_limit = None` disables the per-identity check.
    pub fn new(name: &'static str, capacity: u64, per_identity_limit: Option<u64>) -> Self {
        Self {
            name,
            per_identity_limit,
            state: Mutex::new(LedgerState {
                capacity,
                used: 0,
                per_identity_used: HashMap::new(),
            }),
        }
    }

    /// Reserve `cost` units for `identity`.
    pub fn try_acquire(&self, identity: &I, cost: u64) -> Result<(), Denial> {
        let mut state = self.state.lock().expect("ledger mutex poisoned");

        if state.used.saturating_add(cost) > state.capacity {
            return Err(Denial::CapacityExceeded);
        }
        let identity_used = state.per_identity_used.get(identity).copied().unwrap_or(0);
        if let Some(limit) = self.per_identity_limit {
            if identity_used.saturating_add(cost) > limit {
                return Err(Denial::PerIdentityExceeded);
            }
        }

        state.used += cost;
        state
            .per_identity_used
            .insert(identity.clone(), identity_used + cost);
        Ok(())
    }

    /// Return `cost` units previously acquired for `identity`.
    pub fn release(&self, identity: &I, cost: u64) {
        let mut state = self.state.lock().expect("ledger mutex poisoned");

        let held = state.per_identity_used.get(identity).copied().unwrap_or(0);
        if cost > held {
            tracing::warn!(
                ledger = self.name,
                identity = %identity,
                cost,
                held,
                "Release exceeds identity usage, clamping"
            );
        }
        let released = cost.min(held);
        if released == held {
            state.per_identity_used.remove(identity);
        } else {
            state.per_identity_used.insert(identity.clone(), held - released);
        }
        // An identity only gives back what it holds.
        state.used = state.used.saturating_sub(released);
    }

    /// Change the capacity. Existing usage above a lowered capacity is kept;
    /// new acquisitions are denied until usage falls below it.
    pub fn set_capacity(&self, capacity: u64) {
        let mut state = self.state.lock().expect("ledger mutex poisoned");
        tracing::debug!(ledger = self.name, from = state.capacity, to = capacity, "Ledger capacity changed");
        state.capacity = capacity;
    }

    pub fn used(&self) -> u64 {
        self.state.lock().expect("ledger mutex poisoned").used
    }

    pub fn capacity(&self) -> u64 {
        self.state.lock().expect("ledger mutex poisoned").capacity
    }

    pub fn identity_used(&self, identity: &I) -> u64 {
        self.state
            .lock()
            .expect("ledger mutex poisoned")
            .per_identity_used
            .get(identity)
            .copied()
            .unwrap_or(0)
    }

    /// `used / capacity`, or 1.0 for a zero-capacity ledger.
    pub fn utilization(&self) -> f64 {
        let state = self.state.lock().expect("ledger mutex poisoned");
        if state.capacity == 0 {
            1.0
        } else {
            state.used as f64 / state.capacity as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn admits_up_to_capacity() {
        let ledger: ResourceLedger = ResourceLedger::new("test", 3, None);
        let id = "a".to_string();
        assert!(ledger.try_acquire(&id, 1).is_ok());
        assert!(ledger.try_acquire(&id, 2).is_ok());
        assert_eq!(ledger.try_acquire(&id, 1), Err(Denial::CapacityExceeded));
        assert_eq!(ledger.used(), 3);
    }

    #[test]
    fn enforces_per_identity_limit() {
        let ledger: ResourceLedger = ResourceLedger::new("test", 10, Some(2));
        let a = "a".to_string();
        let b = "b".to_string();
        ledger.try_acquire(&a, 1).unwrap();
        ledger.try_acquire(&a, 1).unwrap();
        assert_eq!(ledger.try_acquire(&a, 1), Err(Denial::PerIdentityExceeded));
        assert!(ledger.try_acquire(&b, 1).is_ok());
        assert_eq!(ledger.identity_used(&a), 2);
    }

    #[test]
    fn over_release_clamps_at_zero() {
        let ledger: ResourceLedger = ResourceLedger::new("test", 10, None);
        let a = "a".to_string();
        ledger.try_acquire(&a, 2).unwrap();
        ledger.release(&a, 5);
        assert_eq!(ledger.used(), 0);
        assert_eq!(ledger.identity_used(&a), 0);
        ledger.release(&a, 1);
        assert_eq!(ledger.used(), 0);
    }

    #[test]
    fn release_by_other_identity_does_not_free_slots() {
        let ledger: ResourceLedger = ResourceLedger::new("test", 2, None);
        let a = "a".to_string();
        let b = "b".to_string();
        ledger.try_acquire(&a, 2).unwrap();
        ledger.release(&b, 2);
        assert_eq!(ledger.used(), 2);
        assert_eq!(ledger.try_acquire(&b, 1), Err(Denial::CapacityExceeded));
    }

    #[test]
    fn lowered_capacity_blocks_new_work() {
        let ledger: ResourceLedger = ResourceLedger::new("test", 4, None);
        let a = "a".to_string();
        ledger.try_acquire(&a, 3).unwrap();
        ledger.set_capacity(2);
        assert_eq!(ledger.try_acquire(&a, 1), Err(Denial::CapacityExceeded));
        ledger.release(&a, 2);
        assert!(ledger.try_acquire(&a, 1).is_ok());
        assert!((ledger.utilization() - 1.0).abs() < f64::EPSILON);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Acquire(u8, u64),
        Release(u8, u64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..4, 0u64..5).prop_map(|(i, c)| Op::Acquire(i, c)),
            (0u8..4, 0u64..5).prop_map(|(i, c)| Op::Release(i, c)),
        ]
    }

    proptest! {
        #[test]
        fn used_stays_within_bounds(ops in proptest::collection::vec(op(), 1..300)) {
            let ledger: ResourceLedger = ResourceLedger::new("prop", 10, Some(6));
            for op in ops {
                match op {
                    Op::Acquire(i, c) => { let _ = ledger.try_acquire(&i.to_string(), c); }
                    Op::Release(i, c) => ledger.release(&i.to_string(), c),
                }
                prop_assert!(ledger.used() <= ledger.capacity());
                let per_identity: u64 = (0u8..4).map(|i| ledger.identity_used(&i.to_string())).sum();
                prop_assert_eq!(per_identity, ledger.used());
                for i in 0u8..4 {
                    prop_assert!(ledger.identity_used(&i.to_string()) <= 6);
                }
            }
        }
    }
}
