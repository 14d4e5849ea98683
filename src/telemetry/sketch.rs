//! Relative-error quantile sketch
//!
//! Values are counted in logarithmic buckets: bucket `i` covers
//! `(gamma^(i-1), gamma^i]` with `gamma = (1 + a) / (1 - a)`. Reporting
//! `2 * gamma^i / (gamma + 1)` for a bucket keeps every estimate within
//! relative error `a` of the true value at that rank. Buckets are sparse,
//! so memory grows with the dynamic range of the data, not with its count.

use std::collections::BTreeMap;

/// Mergeable log-bucket quantile sketch
#[derive(Debug, Clone, PartialEq)]
pub struct LogSketch {
    relative_error: f64,
    gamma_ln: f64,
    buckets: BTreeMap<i32, u64>,
    zero_count: u64,
    count: u64,
    min: f64,
    max: f64,
}

impl LogSketch {
    /// Create an empty sketch with relative error `relative_error` (0 < a < 1)
    #[must_use]
    pub fn new(relative_error: f64) -> Self {
        let a = relative_error.clamp(1e-6, 0.5);
        let gamma = (1.0 + a) / (1.0 - a);
        Self {
            relative_error: a,
            gamma_ln: gamma.ln(),
            buckets: BTreeMap::new(),
            zero_count: 0,
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    /// Configured relative error
    #[must_use]
    pub fn relative_error(&self) -> f64 {
        self.relative_error
    }

    /// Number of recorded values
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Whether nothing was recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Record one value; negative and NaN values are ignored
    pub fn insert(&mut self, value: f64) {
        if value.is_nan() || value < 0.0 {
            return;
        }
        if value == 0.0 {
            self.zero_count += 1;
        } else {
            *self.buckets.entry(self.index(value)).or_insert(0) += 1;
        }
        self.count += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// Fold `other` into `self`
    ///
    /// Both sketches must share the same relative error.
    pub fn merge(&mut self, other: &Self) {
        debug_assert!((self.gamma_ln - other.gamma_ln).abs() < f64::EPSILON);
        for (&index, &n) in &other.buckets {
            *self.buckets.entry(index).or_insert(0) += n;
        }
        self.zero_count += other.zero_count;
        self.count += other.count;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    /// Estimated value at quantile `q` in [0, 1] (nearest rank)
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if self.count == 0 || q.is_nan() {
            return None;
        }
        let q = q.clamp(0.0, 1.0);
        let rank = ((q * self.count as f64).ceil() as u64).clamp(1, self.count);

        if rank <= self.zero_count {
            return Some(0.0);
        }
        let mut seen = self.zero_count;
        for (&index, &n) in &self.buckets {
            seen += n;
            if seen >= rank {
                // Never report outside the observed range
                return Some(self.value(index).clamp(self.min, self.max));
            }
        }
        Some(self.max)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn index(&self, value: f64) -> i32 {
        (value.ln() / self.gamma_ln).ceil() as i32
    }

    fn value(&self, index: i32) -> f64 {
        let gamma = self.gamma_ln.exp();
        2.0 * (f64::from(index) * self.gamma_ln).exp() / (gamma + 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact(sorted: &[f64], q: f64) -> f64 {
        let rank = ((q * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len());
        sorted[rank - 1]
    }

    #[test]
    fn empty_sketch_has_no_quantiles() {
        assert_eq!(LogSketch::new(0.01).quantile(0.95), None);
    }

    #[test]
    fn p95_within_relative_error() {
        let mut sketch = LogSketch::new(0.01);
        // Skewed latency-like distribution: many fast, long tail
        let mut values: Vec<f64> = (1..=5000)
            .map(|i| {
                let x = f64::from(i);
                if i % 20 == 0 { x * 3.7 } else { 5.0 + (x % 250.0) }
            })
            .collect();
        for &v in &values {
            sketch.insert(v);
        }
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());

        for q in [0.5, 0.9, 0.95, 0.99] {
            let truth = exact(&values, q);
            let estimate = sketch.quantile(q).unwrap();
            let error = (estimate - truth).abs() / truth;
            assert!(error <= 0.01 + 1e-9, "q={q} truth={truth} estimate={estimate}");
        }
    }

    #[test]
    fn zeros_and_invalid_values() {
        let mut sketch = LogSketch::new(0.02);
        sketch.insert(0.0);
        sketch.insert(0.0);
        sketch.insert(10.0);
        sketch.insert(-1.0);
        sketch.insert(f64::NAN);

        assert_eq!(sketch.count(), 3);
        assert_eq!(sketch.quantile(0.5), Some(0.0));
        let p100 = sketch.quantile(1.0).unwrap();
        assert!((p100 - 10.0).abs() / 10.0 <= 0.02);
    }

    #[test]
    fn merge_matches_single_sketch() {
        let mut a = LogSketch::new(0.01);
        let mut b = LogSketch::new(0.01);
        let mut whole = LogSketch::new(0.01);
        for i in 1..=1000 {
            let v = f64::from(i);
            if i % 2 == 0 { a.insert(v) } else { b.insert(v) }
            whole.insert(v);
        }
        a.merge(&b);
        assert_eq!(a.count(), 1000);
        assert_eq!(a.quantile(0.95), whole.quantile(0.95));
    }

    #[test]
    fn single_value_is_reported_exactly() {
        let mut sketch = LogSketch::new(0.01);
        sketch.insert(250.0);
        assert_eq!(sketch.quantile(0.95), Some(250.0));
    }
}
