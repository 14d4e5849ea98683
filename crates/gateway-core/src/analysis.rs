//! Threshold verdicts for rollout analysis

use serde::{Deserialize, Serialize};

/// Outcome of one analysis run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Every sampled point stayed within the threshold
    Pass,
    /// At least one sampled point breached the threshold
    Fail,
    /// The metric could not be read
    Inconclusive,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::Fail => write!(f, "fail"),
            Self::Inconclusive => write!(f, "inconclusive"),
        }
    }
}

/// Direction in which a metric is healthy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    /// Healthy while `value <= threshold` (latency)
    #[default]
    AtMost,
    /// Healthy while `value >= threshold` (hit rate)
    AtLeast,
}

impl Comparison {
    /// Whether `value` breaches `threshold`
    #[must_use]
    pub fn breaches(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::AtMost => value > threshold,
            Self::AtLeast => value < threshold,
        }
    }

    /// The least healthy of two values
    #[must_use]
    pub fn worse(self, a: f64, b: f64) -> f64 {
        match self {
            Self::AtMost => a.max(b),
            Self::AtLeast => a.min(b),
        }
    }
}

/// Judge sampled points against `threshold`.
///
/// `None` (and NaN) marks a point the source could not produce. A breach
/// anywhere is a `Fail` even if other points are missing; otherwise any
/// missing point, or no points at all, is `Inconclusive`.
#[must_use]
pub fn judge(points: &[Option<f64>], threshold: f64, comparison: Comparison) -> Verdict {
    let mut missing = points.is_empty();

    for point in points {
        match point {
            Some(v) if v.is_nan() => missing = true,
            Some(v) if comparison.breaches(*v, threshold) => return Verdict::Fail,
            Some(_) => {}
            None => missing = true,
        }
    }

    if missing {
        Verdict::Inconclusive
    } else {
        Verdict::Pass
    }
}

/// The least healthy observed point, used as the run's reported metric value
#[must_use]
pub fn worst_point(points: &[Option<f64>], comparison: Comparison) -> Option<f64> {
    points
        .iter()
        .flatten()
        .copied()
        .filter(|v| !v.is_nan())
        .reduce(|a, b| comparison.worse(a, b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_points_within_threshold_pass() {
        let points = [Some(120.0), Some(250.0), Some(300.0)];
        assert_eq!(judge(&points, 300.0, Comparison::AtMost), Verdict::Pass);
    }

    #[test]
    fn a_single_breach_fails() {
        let points = [Some(120.0), Some(800.0), Some(130.0)];
        assert_eq!(judge(&points, 300.0, Comparison::AtMost), Verdict::Fail);
    }

    #[test]
    fn missing_points_are_inconclusive() {
        let points = [Some(120.0), None];
        assert_eq!(judge(&points, 300.0, Comparison::AtMost), Verdict::Inconclusive);
        assert_eq!(judge(&[], 300.0, Comparison::AtMost), Verdict::Inconclusive);
        assert_eq!(
            judge(&[Some(f64::NAN)], 300.0, Comparison::AtMost),
            Verdict::Inconclusive
        );
    }

    #[test]
    fn breach_wins_over_missing_points() {
        let points = [None, Some(900.0)];
        assert_eq!(judge(&points, 300.0, Comparison::AtMost), Verdict::Fail);
    }

    #[test]
    fn hit_rate_comparison_is_inverted() {
        assert_eq!(
            judge(&[Some(0.9), Some(0.8)], 0.75, Comparison::AtLeast),
            Verdict::Pass
        );
        assert_eq!(
            judge(&[Some(0.9), Some(0.5)], 0.75, Comparison::AtLeast),
            Verdict::Fail
        );
    }

    #[test]
    fn worst_point_follows_comparison() {
        let points = [Some(0.9), None, Some(0.4)];
        assert_eq!(worst_point(&points, Comparison::AtMost), Some(0.9));
        assert_eq!(worst_point(&points, Comparison::AtLeast), Some(0.4));
        assert_eq!(worst_point(&[None], Comparison::AtMost), None);
    }
}
