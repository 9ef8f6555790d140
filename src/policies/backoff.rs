//! # Backoff between respawns of a crashing worker slot.
//!
//! [`BackoffPolicy`] turns the number of consecutive crashes of a slot into a
//! delay before the next spawn:
//!
//! ```text
//! delay(n) = jitter( min(first × factor^n, max) )
//! ```
//!
//! The base is derived from `n` alone, so jitter never feeds back into later
//! delays. [`BackoffPolicy::immediate`] (all zeros) respawns in the same
//! monitoring tick that reaped the crash.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use procvisor::{BackoffPolicy, JitterPolicy};
//!
//! let backoff = BackoffPolicy {
//!     first: Duration::from_millis(250),
//!     max: Duration::from_secs(5),
//!     factor: 2.0,
//!     jitter: JitterPolicy::None,
//! };
//!
//! assert_eq!(backoff.next(0), Duration::from_millis(250));
//! assert_eq!(backoff.next(2), Duration::from_secs(1));
//! assert_eq!(backoff.next(10), Duration::from_secs(5));
//! assert_eq!(BackoffPolicy::immediate().next(7), Duration::ZERO);
//! ```

use std::time::Duration;

use crate::policies::jitter::JitterPolicy;

/// Respawn backoff policy.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first crash.
    pub first: Duration,
    /// Upper bound of any delay.
    pub max: Duration,
    /// Growth per consecutive crash (`>= 1.0` recommended).
    pub factor: f64,
    pub jitter: JitterPolicy,
}

impl Default for BackoffPolicy {
    /// Immediate respawn, matching a supervisor without backoff.
    fn default() -> Self {
        Self::immediate()
    }
}

impl BackoffPolicy {
    /// No delay at all.
    pub const fn immediate() -> Self {
        Self {
            first: Duration::ZERO,
            max: Duration::ZERO,
            factor: 1.0,
            jitter: JitterPolicy::None,
        }
    }

    /// True if every delay this policy produces is zero.
    #[inline]
    pub fn is_immediate(&self) -> bool {
        self.first.is_zero() || self.max.is_zero()
    }

    /// Delay before the respawn following `consecutive` earlier crashes (0-indexed).
    pub fn next(&self, consecutive: u32) -> Duration {
        if self.is_immediate() {
            return Duration::ZERO;
        }

        let max_secs = self.max.as_secs_f64();
        let exp = consecutive.min(i32::MAX as u32) as i32;
        let raw = self.first.as_secs_f64() * self.factor.powi(exp);

        let base = if !raw.is_finite() || raw < 0.0 || raw > max_secs {
            self.max
        } else {
            Duration::from_secs_f64(raw)
        };

        match self.jitter {
            JitterPolicy::Decorrelated => {
                self.jitter
                    .apply_decorrelated(self.first.min(self.max), base, self.max)
            }
            _ => self.jitter.apply(base),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: JitterPolicy) -> BackoffPolicy {
        BackoffPolicy {
            first: Duration::from_millis(100),
            max: Duration::from_secs(30),
            factor: 2.0,
            jitter,
        }
    }

    #[test]
    fn immediate_is_always_zero() {
        let p = BackoffPolicy::default();
        assert!(p.is_immediate());
        for n in [0, 1, 50, u32::MAX] {
            assert_eq!(p.next(n), Duration::ZERO);
        }
    }

    #[test]
    fn grows_exponentially_without_jitter() {
        let p = policy(JitterPolicy::None);
        let got: Vec<u64> = (0..5).map(|n| p.next(n).as_millis() as u64).collect();
        assert_eq!(got, vec![100, 200, 400, 800, 1600]);
    }

    #[test]
    fn clamps_to_max_and_survives_overflow() {
        let p = BackoffPolicy {
            max: Duration::from_secs(1),
            ..policy(JitterPolicy::None)
        };
        assert_eq!(p.next(10), Duration::from_secs(1));
        assert_eq!(p.next(u32::MAX), Duration::from_secs(1));

        let first_over_max = BackoffPolicy {
            first: Duration::from_secs(10),
            max: Duration::from_secs(5),
            ..policy(JitterPolicy::None)
        };
        assert_eq!(first_over_max.next(0), Duration::from_secs(5));
    }

    #[test]
    fn equal_jitter_stays_in_upper_half() {
        let p = policy(JitterPolicy::Equal);
        for n in 0..12 {
            let base = (100.0 * 2.0f64.powi(n as i32)).min(30_000.0) as u64;
            let d = p.next(n).as_millis() as u64;
            assert!(d >= base / 2 && d <= base, "n={n} d={d} base={base}");
        }
    }

    #[test]
    fn full_jitter_never_exceeds_base() {
        let p = policy(JitterPolicy::Full);
        for n in 0..12 {
            let base = (100.0 * 2.0f64.powi(n as i32)).min(30_000.0) as u64;
            assert!(p.next(n).as_millis() as u64 <= base);
        }
    }

    #[test]
    fn decorrelated_stays_between_first_and_max() {
        let p = policy(JitterPolicy::Decorrelated);
        for _ in 0..100 {
            let d = p.next(8);
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_secs(30));
        }
    }
}
