// Integer distributions used at draw sites.
//
// A distribution is a pure function from a random source to an integer,
// paired with a validity predicate over integers. The predicate is what makes
// structural shrinking possible: a candidate replacement for a recorded draw
// is only replayed if the distribution that produced the original value still
// accepts the candidate.

use rand::Rng;
use rand_chacha::ChaCha8Rng;

/// The closed set of integer distributions understood by the engine.
///
/// Every value returned by [`IntDistribution::sample`] satisfies
/// [`IntDistribution::is_valid`]. A violation is a bug in this module and
/// panics instead of corrupting the recorded tree.
#[derive(Debug, Clone, PartialEq)]
pub enum IntDistribution {
    /// Uniform over the inclusive range `[min, max]`.
    Uniform { min: i64, max: i64 },
    /// Geometric with success probability `1 / (mean + 1)`; produces any
    /// non-negative integer. Collection-size draws use this so that larger
    /// size hints yield larger collections on average.
    Geometric { mean: usize },
    /// An index into `weights`, chosen with probability proportional to the
    /// weight at that index.
    Frequency { weights: Vec<u64> },
    /// `inner` clamped into `[min, max]`. A value is valid only if it lies in
    /// the range *and* is valid for `inner`.
    Bound {
        min: i64,
        max: i64,
        inner: Box<IntDistribution>,
    },
}

impl IntDistribution {
    pub fn uniform(min: i64, max: i64) -> IntDistribution {
        assert!(min <= max, "empty uniform range {}..={}", min, max);
        IntDistribution::Uniform { min, max }
    }

    pub fn geometric(mean: usize) -> IntDistribution {
        IntDistribution::Geometric { mean }
    }

    pub fn frequency(weights: Vec<u64>) -> IntDistribution {
        assert!(
            weights.iter().sum::<u64>() > 0,
            "frequency weights must not be empty or all zero"
        );
        IntDistribution::Frequency { weights }
    }

    pub fn bound(min: i64, max: i64, inner: IntDistribution) -> IntDistribution {
        assert!(min <= max, "empty bound range {}..={}", min, max);
        IntDistribution::Bound {
            min,
            max,
            inner: Box::new(inner),
        }
    }

    /// Draw one integer from `rng`.
    pub fn sample(&self, rng: &mut ChaCha8Rng) -> i64 {
        match self {
            IntDistribution::Uniform { min, max } => {
                if min == max {
                    return *min;
                }
                // One raw draw per site; out-of-range values fold into range.
                let span = (*max as i128 - *min as i128 + 1) as u128;
                let raw: i64 = rng.gen();
                let folded = (raw.unsigned_abs() as u128 % span) as i128;
                (*min as i128 + folded) as i64
            }
            IntDistribution::Geometric { mean } => {
                let p = 1.0 / (*mean as f64 + 1.0);
                let u = rng.gen::<f64>().max(f64::MIN_POSITIVE);
                let value = (u.ln() / (1.0 - p).ln()).floor();
                if value.is_finite() {
                    value as i64
                } else {
                    0
                }
            }
            IntDistribution::Frequency { weights } => {
                let total: u64 = weights.iter().sum();
                let mut remainder =
                    IntDistribution::uniform(0, total as i64 - 1).sample(rng);
                for (index, weight) in weights.iter().enumerate() {
                    remainder -= *weight as i64;
                    if remainder < 0 {
                        return index as i64;
                    }
                }
                unreachable!("frequency draw exceeded total weight")
            }
            IntDistribution::Bound { min, max, inner } => {
                inner.sample(rng).clamp(*min, *max)
            }
        }
    }

    /// Whether `value` could have been produced by this distribution. Used to
    /// gate shrink candidates before they are replayed.
    pub fn is_valid(&self, value: i64) -> bool {
        match self {
            IntDistribution::Uniform { min, max } => *min <= value && value <= *max,
            IntDistribution::Geometric { .. } => value >= 0,
            IntDistribution::Frequency { weights } => {
                value >= 0 && (value as usize) < weights.len()
            }
            IntDistribution::Bound { min, max, inner } => {
                *min <= value && value <= *max && inner.is_valid(value)
            }
        }
    }
}
