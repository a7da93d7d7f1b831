//! Opt-in amount and timing obfuscation.
//!
//! None of these run unless [`PrivacyConfig`](crate::config::PrivacyConfig)
//! enables them. They never touch the ledger or the selector.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use cairn_core::constants::ROUND_AMOUNT_TRAILING_ZEROS;

/// True when `value` ends in at least three decimal zeros. Zero is not a
/// payment amount and is never round.
pub fn is_round_amount(value: u64) -> bool {
    value != 0 && value % 10u64.pow(ROUND_AMOUNT_TRAILING_ZEROS) == 0
}

/// Perturb `value` uniformly within `±variance_fraction`, rounded to the
/// nearest satoshi and clamped to at least 1.
pub fn randomize_amount(value: u64, variance_fraction: f64) -> u64 {
    randomize_amount_with_rng(value, variance_fraction, &mut rand::thread_rng())
}

pub fn randomize_amount_with_rng<R: Rng + ?Sized>(
    value: u64,
    variance_fraction: f64,
    rng: &mut R,
) -> u64 {
    if !variance_fraction.is_finite() || variance_fraction <= 0.0 {
        return value.max(1);
    }
    let fraction = variance_fraction.min(1.0);
    let perturbation = rng.gen_range(-fraction..=fraction);
    let perturbed = (value as f64 * (1.0 + perturbation)).round();
    if perturbed < 1.0 {
        1
    } else if perturbed >= u64::MAX as f64 {
        u64::MAX
    } else {
        perturbed as u64
    }
}

/// Inclusive millisecond range for randomized delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JitterRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl JitterRange {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self {
            min_ms: min_ms.min(max_ms),
            max_ms: min_ms.max(max_ms),
        }
    }

    pub fn sample(&self) -> Duration {
        jitter_delay(self.min_ms, self.max_ms)
    }
}

/// Uniform duration in `[min_ms, max_ms]`. Bounds given in either order.
pub fn jitter_delay(min_ms: u64, max_ms: u64) -> Duration {
    jitter_delay_with_rng(min_ms, max_ms, &mut rand::thread_rng())
}

pub fn jitter_delay_with_rng<R: Rng + ?Sized>(min_ms: u64, max_ms: u64, rng: &mut R) -> Duration {
    let (lo, hi) = if min_ms <= max_ms {
        (min_ms, max_ms)
    } else {
        (max_ms, min_ms)
    };
    Duration::from_millis(rng.gen_range(lo..=hi))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn round_amounts() {
        assert!(is_round_amount(10_000_000));
        assert!(!is_round_amount(10_234_567));
        assert!(is_round_amount(1_000));
        assert!(!is_round_amount(100));
        assert!(!is_round_amount(0));
    }

    #[test]
    fn randomized_amount_stays_within_variance() {
        let mut rng = StdRng::seed_from_u64(11);
        let value = 10_000_000;
        let mut changed = false;
        for _ in 0..500 {
            let v = randomize_amount_with_rng(value, 0.001, &mut rng);
            assert!((9_990_000..=10_010_000).contains(&v), "out of range: {v}");
            changed |= v != value;
        }
        assert!(changed);
    }

    #[test]
    fn randomized_amount_clamped_to_one() {
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..100 {
            assert!(randomize_amount_with_rng(1, 1.0, &mut rng) >= 1);
        }
        assert_eq!(randomize_amount(0, 0.001), 1);
    }

    #[test]
    fn zero_or_invalid_variance_is_identity() {
        assert_eq!(randomize_amount(12_345, 0.0), 12_345);
        assert_eq!(randomize_amount(12_345, f64::NAN), 12_345);
        assert_eq!(randomize_amount(12_345, -0.5), 12_345);
    }

    #[test]
    fn jitter_within_bounds() {
        let mut rng = StdRng::seed_from_u64(2);
        for _ in 0..200 {
            let d = jitter_delay_with_rng(100, 250, &mut rng);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(250));
        }
        let reversed = jitter_delay(30, 10);
        assert!(reversed >= Duration::from_millis(10) && reversed <= Duration::from_millis(30));
        assert_eq!(jitter_delay(7, 7), Duration::from_millis(7));
    }

    #[test]
    fn jitter_range_normalizes() {
        let range = JitterRange::new(500, 100);
        assert_eq!(range.min_ms, 100);
        assert_eq!(range.max_ms, 500);
        let d = range.sample();
        assert!(d <= Duration::from_millis(500));
    }
}
