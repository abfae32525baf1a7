//! Probabilistic interval estimates
//!
//! Cardinalities, loads, times and costs are all intervals `[lower, upper]`
//! annotated with a correctness probability. Interval arithmetic keeps the
//! bounds and combines probabilities with `min`.

use serde::{Deserialize, Serialize};

/// Estimated number of data units produced at an output slot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CardinalityEstimate {
    pub lower: u64,
    pub upper: u64,
    pub correctness_prob: f64,
}

impl CardinalityEstimate {
    pub fn new(lower: u64, upper: u64, correctness_prob: f64) -> Self {
        debug_assert!(lower <= upper);
        debug_assert!((0.0..=1.0).contains(&correctness_prob));
        Self {
            lower,
            upper,
            correctness_prob,
        }
    }

    /// An exact estimate, as produced by a measured cardinality.
    pub fn exact(cardinality: u64) -> Self {
        Self::new(cardinality, cardinality, 1.0)
    }

    pub fn is_exact(&self) -> bool {
        self.lower == self.upper && self.correctness_prob == 1.0
    }

    pub fn plus(&self, other: &CardinalityEstimate) -> CardinalityEstimate {
        CardinalityEstimate::new(
            self.lower.saturating_add(other.lower),
            self.upper.saturating_add(other.upper),
            self.correctness_prob.min(other.correctness_prob),
        )
    }

    /// Scale both bounds by a non-negative factor, degrading the probability
    /// to `prob_factor * p`.
    pub fn scale(&self, factor: f64, prob_factor: f64) -> CardinalityEstimate {
        CardinalityEstimate::new(
            (self.lower as f64 * factor).round() as u64,
            (self.upper as f64 * factor).round() as u64,
            (self.correctness_prob * prob_factor).clamp(0.0, 1.0),
        )
    }

    pub fn times(&self, other: &CardinalityEstimate) -> CardinalityEstimate {
        CardinalityEstimate::new(
            self.lower.saturating_mul(other.lower),
            self.upper.saturating_mul(other.upper),
            self.correctness_prob.min(other.correctness_prob),
        )
    }

    /// Geometric mean of the bounds; robust midpoint for wide intervals.
    pub fn geometric_mean(&self) -> u64 {
        ((self.lower as f64 * self.upper as f64).sqrt()).round() as u64
    }

    pub fn average(&self) -> u64 {
        (self.lower + self.upper) / 2
    }
}

impl std::fmt::Display for CardinalityEstimate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({}..{}, {:.1}%)",
            self.lower,
            self.upper,
            self.correctness_prob * 100.0
        )
    }
}

/// Estimated machine load (CPU cycles, bytes, ...) imposed by an operator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadEstimate {
    pub lower: u64,
    pub upper: u64,
    pub correctness_prob: f64,
}

impl LoadEstimate {
    pub fn new(lower: u64, upper: u64, correctness_prob: f64) -> Self {
        debug_assert!(lower <= upper);
        Self {
            lower,
            upper,
            correctness_prob,
        }
    }

    pub fn exact(load: u64) -> Self {
        Self::new(load, load, 1.0)
    }

    pub fn zero() -> Self {
        Self::new(0, 0, 1.0)
    }

    pub fn plus(&self, other: &LoadEstimate) -> LoadEstimate {
        LoadEstimate::new(
            self.lower.saturating_add(other.lower),
            self.upper.saturating_add(other.upper),
            self.correctness_prob.min(other.correctness_prob),
        )
    }

    pub fn average(&self) -> u64 {
        (self.lower + self.upper) / 2
    }
}

/// Estimated wallclock time in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeEstimate {
    pub lower_millis: u64,
    pub upper_millis: u64,
    pub correctness_prob: f64,
}

impl TimeEstimate {
    /// Floor estimate; keeps zero-load operators from vanishing in sums.
    pub const MINIMUM: TimeEstimate = TimeEstimate {
        lower_millis: 1,
        upper_millis: 1,
        correctness_prob: 1.0,
    };

    pub const ZERO: TimeEstimate = TimeEstimate {
        lower_millis: 0,
        upper_millis: 0,
        correctness_prob: 1.0,
    };

    pub fn new(lower_millis: u64, upper_millis: u64, correctness_prob: f64) -> Self {
        debug_assert!(lower_millis <= upper_millis);
        Self {
            lower_millis,
            upper_millis,
            correctness_prob,
        }
    }

    pub fn exact(millis: u64) -> Self {
        Self::new(millis, millis, 1.0)
    }

    pub fn plus(&self, other: &TimeEstimate) -> TimeEstimate {
        TimeEstimate::new(
            self.lower_millis.saturating_add(other.lower_millis),
            self.upper_millis.saturating_add(other.upper_millis),
            self.correctness_prob.min(other.correctness_prob),
        )
    }

    pub fn times(&self, factor: u64) -> TimeEstimate {
        TimeEstimate::new(
            self.lower_millis.saturating_mul(factor),
            self.upper_millis.saturating_mul(factor),
            self.correctness_prob,
        )
    }

    pub fn average_millis(&self) -> u64 {
        (self.lower_millis + self.upper_millis) / 2
    }
}

impl Default for TimeEstimate {
    fn default() -> Self {
        TimeEstimate::ZERO
    }
}

impl std::fmt::Display for TimeEstimate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({}..{} ms, {:.1}%)",
            self.lower_millis,
            self.upper_millis,
            self.correctness_prob * 100.0
        )
    }
}

/// Probabilistic interval over `f64`, used for monetary cost estimates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbabilisticDoubleInterval {
    pub lower: f64,
    pub upper: f64,
    pub correctness_prob: f64,
}

impl ProbabilisticDoubleInterval {
    pub fn new(lower: f64, upper: f64, correctness_prob: f64) -> Self {
        debug_assert!(lower <= upper);
        Self {
            lower,
            upper,
            correctness_prob,
        }
    }

    pub fn zero() -> Self {
        Self::new(0.0, 0.0, 1.0)
    }

    pub fn plus(&self, other: &ProbabilisticDoubleInterval) -> ProbabilisticDoubleInterval {
        ProbabilisticDoubleInterval::new(
            self.lower + other.lower,
            self.upper + other.upper,
            self.correctness_prob.min(other.correctness_prob),
        )
    }

    pub fn times(&self, factor: f64) -> ProbabilisticDoubleInterval {
        ProbabilisticDoubleInterval::new(self.lower * factor, self.upper * factor, self.correctness_prob)
    }

    pub fn shift(&self, offset: f64) -> ProbabilisticDoubleInterval {
        ProbabilisticDoubleInterval::new(self.lower + offset, self.upper + offset, self.correctness_prob)
    }

    /// Probability-weighted midpoint; the default figure plans are ranked by.
    pub fn expectation(&self) -> f64 {
        (self.lower + self.upper) / 2.0 * self.correctness_prob.max(f64::MIN_POSITIVE)
    }

    /// Default plan comparator: expectation first, then the tighter upper
    /// bound wins.
    pub fn compare_by_expectation(&self, other: &ProbabilisticDoubleInterval) -> std::cmp::Ordering {
        self.expectation()
            .partial_cmp(&other.expectation())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                self.upper
                    .partial_cmp(&other.upper)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }
}

impl Default for ProbabilisticDoubleInterval {
    fn default() -> Self {
        ProbabilisticDoubleInterval::zero()
    }
}

impl std::fmt::Display for ProbabilisticDoubleInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({:.2}..{:.2}, {:.1}%)",
            self.lower,
            self.upper,
            self.correctness_prob * 100.0
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cardinality_plus_keeps_min_probability() {
        let a = CardinalityEstimate::new(10, 20, 0.9);
        let b = CardinalityEstimate::new(5, 5, 0.5);
        let sum = a.plus(&b);
        assert_eq!(sum.lower, 15);
        assert_eq!(sum.upper, 25);
        assert!((sum.correctness_prob - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_cardinality_scale() {
        let a = CardinalityEstimate::new(100, 200, 1.0);
        let scaled = a.scale(0.1, 0.9);
        assert_eq!(scaled.lower, 10);
        assert_eq!(scaled.upper, 20);
        assert!((scaled.correctness_prob - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_cardinality_monotonicity() {
        let small = CardinalityEstimate::new(10, 20, 1.0);
        let large = CardinalityEstimate::new(15, 30, 1.0);
        let scaled_small = small.scale(0.5, 1.0);
        let scaled_large = large.scale(0.5, 1.0);
        assert!(scaled_large.lower >= scaled_small.lower);
        assert!(scaled_large.upper >= scaled_small.upper);
    }

    #[test]
    fn test_time_estimate_sum() {
        let a = TimeEstimate::new(100, 200, 0.8);
        let b = TimeEstimate::new(50, 50, 1.0);
        let sum = a.plus(&b);
        assert_eq!(sum.lower_millis, 150);
        assert_eq!(sum.upper_millis, 250);
        assert!((sum.correctness_prob - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_cost_comparison_tiebreak() {
        // Same expectation, different upper bound: the tighter one wins.
        let a = ProbabilisticDoubleInterval::new(40.0, 60.0, 1.0);
        let b = ProbabilisticDoubleInterval::new(30.0, 70.0, 1.0);
        assert_eq!(a.compare_by_expectation(&b), std::cmp::Ordering::Less);
    }

    #[test]
    fn test_exact_estimate() {
        let m = CardinalityEstimate::exact(42);
        assert!(m.is_exact());
        assert_eq!(m.average(), 42);
    }
}
