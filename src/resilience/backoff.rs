//! Backoff schedules.
//!
//! - `retry_delay`: exponential backoff with jitter between call retries
//! - `RecoveryBackoff`: the stepped schedule used by disk recovery probes

use std::time::Duration;

use rand::Rng;

/// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`, capped
/// at `max`, plus up to 10% jitter. Retry 0 never waits.
pub fn retry_delay(retry: u32, base: Duration, max: Duration) -> Duration {
    if retry == 0 {
        return Duration::ZERO;
    }
    let factor = 1u32.checked_shl(retry - 1).unwrap_or(u32::MAX);
    let delay = base.saturating_mul(factor).min(max);

    let spread = delay.as_millis() as u64 / 10;
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..spread))
}

/// Stepped recovery schedule: explicit steps, then a constant cap.
///
/// With a strictly increasing schedule whose last step is at most `cap`,
/// successive delays strictly increase until they reach the cap and then
/// stay there.
#[derive(Debug, Clone)]
pub struct RecoveryBackoff {
    steps: Vec<Duration>,
    cap: Duration,
}

impl RecoveryBackoff {
    pub fn new(steps: Vec<Duration>, cap: Duration) -> Self {
        Self { steps, cap }
    }

    /// Delay before recovery attempt number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.steps
            .get(attempt as usize)
            .copied()
            .unwrap_or(self.cap)
            .min(self.cap)
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn retry_delays_double_until_capped() {
        let ms = Duration::from_millis;
        assert_eq!(retry_delay(0, ms(100), ms(2000)), Duration::ZERO);

        let first = retry_delay(1, ms(100), ms(2000));
        assert!(first >= ms(100) && first < ms(110));

        let third = retry_delay(3, ms(100), ms(2000));
        assert!(third >= ms(400) && third < ms(440));

        let capped = retry_delay(40, ms(100), ms(1000));
        assert!(capped >= ms(1000) && capped < ms(1100));
    }

    #[test]
    fn default_recovery_schedule() {
        let mins = |m: u64| Duration::from_secs(m * 60);
        let backoff = RecoveryBackoff::new(vec![mins(5), mins(10), mins(20), mins(40)], mins(60));
        let delays: Vec<_> = (0..7).map(|a| backoff.delay(a)).collect();
        assert_eq!(
            delays,
            vec![mins(5), mins(10), mins(20), mins(40), mins(60), mins(60), mins(60)]
        );
    }

    proptest! {
        #[test]
        fn recovery_delays_increase_then_hold(
            steps in proptest::collection::btree_set(1u64..1000, 0..8),
            extra in 0u64..500,
        ) {
            let steps: Vec<u64> = steps.into_iter().collect();
            let cap = steps.last().copied().unwrap_or(1) + extra;
            let backoff = RecoveryBackoff::new(
                steps.iter().map(|s| Duration::from_secs(*s)).collect(),
                Duration::from_secs(cap),
            );

            let delays: Vec<_> = (0..(steps.len() as u32 + 4)).map(|a| backoff.delay(a)).collect();
            let mut reached_cap = false;
            for pair in delays.windows(2) {
                if pair[0] == backoff.cap() {
                    reached_cap = true;
                }
                if reached_cap {
                    prop_assert_eq!(pair[1], backoff.cap());
                } else {
                    prop_assert!(pair[1] > pair[0] || pair[1] == backoff.cap());
                }
            }
            prop_assert_eq!(*delays.last().unwrap(), backoff.cap());
        }
    }
}
