//! Exponential backoff between resurrection attempts.

use jiff::SignedDuration;

/// `clamp(base * multiplier^attempt, floor, ceiling)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: SignedDuration,
    pub multiplier: f64,
    pub floor: SignedDuration,
    pub ceiling: SignedDuration,
}

impl BackoffPolicy {
    /// Delay before the next wake after `attempt` consecutive failures.
    pub fn delay(&self, attempt: u32) -> SignedDuration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        // max/min rather than clamp: a misordered floor/ceiling must not panic.
        let secs = raw
            .max(self.floor.as_secs_f64())
            .min(self.ceiling.as_secs_f64());
        if secs.is_nan() {
            return self.ceiling;
        }
        SignedDuration::try_from_secs_f64(secs).unwrap_or(self.ceiling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            base: SignedDuration::from_mins(5),
            multiplier: 2.0,
            floor: SignedDuration::from_mins(30),
            ceiling: SignedDuration::from_hours(6),
        }
    }

    #[test]
    fn floor_applies_while_exponential_is_small() {
        // 10m and 20m are both below the 30m floor.
        assert_eq!(policy().delay(1), SignedDuration::from_mins(30));
        assert_eq!(policy().delay(2), SignedDuration::from_mins(30));
    }

    #[test]
    fn escalates_once_past_floor() {
        assert_eq!(policy().delay(3), SignedDuration::from_mins(40));
        assert_eq!(policy().delay(4), SignedDuration::from_mins(80));
        assert_eq!(policy().delay(6), SignedDuration::from_mins(320));
    }

    #[test]
    fn ceiling_caps_growth() {
        assert_eq!(policy().delay(7), SignedDuration::from_hours(6));
        assert_eq!(policy().delay(u32::MAX), SignedDuration::from_hours(6));
    }

    #[test]
    fn delays_are_monotonic_and_bounded() {
        let p = policy();
        let delays: Vec<_> = (1..=64).map(|n| p.delay(n)).collect();
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1], "{:?} > {:?}", pair[0], pair[1]);
        }
        assert!(delays.iter().all(|d| *d >= p.floor && *d <= p.ceiling));
    }

    #[test]
    fn misordered_bounds_do_not_panic() {
        let p = BackoffPolicy {
            floor: SignedDuration::from_hours(7),
            ..policy()
        };
        assert_eq!(p.delay(1), SignedDuration::from_hours(6));
    }
}
