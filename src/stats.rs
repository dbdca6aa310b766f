// ============================================================================
// SECTION 20: STATISTICS
// ============================================================================
// Percentiles, relative deltas, sample moments and Prometheus-style histogram
// quantile reconstruction.
// ============================================================================

use ordered_float::OrderedFloat;
use serde::Serialize;

/// Round to `places` decimal places.
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Nearest-rank percentile over a pre-sorted slice: `idx = floor(n·q)`
/// clamped to `n − 1`. Empty input → 0.
pub fn percentile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let n = sorted.len();
    let idx = ((n as f64 * q).floor() as usize).min(n - 1);
    round_to(sorted[idx], 2)
}

fn sorted_samples(samples: &[f64]) -> Vec<f64> {
    let mut sorted: Vec<OrderedFloat<f64>> = samples
        .iter()
        .copied()
        .filter(|v| !v.is_nan())
        .map(OrderedFloat)
        .collect();
    sorted.sort_unstable();
    sorted.into_iter().map(|v| v.0).collect()
}

pub fn percentile(samples: &[f64], q: f64) -> f64 {
    percentile_sorted(&sorted_samples(samples), q)
}

/// p50 / p90 / p99 of a latency sample.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Percentiles {
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
}

impl Percentiles {
    pub fn compute(samples: &[f64]) -> Self {
        let sorted = sorted_samples(samples);
        Self {
            p50: percentile_sorted(&sorted, 0.50),
            p90: percentile_sorted(&sorted, 0.90),
            p99: percentile_sorted(&sorted, 0.99),
        }
    }
}

/// Percentage change from `pre` to `post`, one decimal. A zero baseline
/// yields `+∞` for growth and `0` otherwise.
pub fn delta_pct(pre: f64, post: f64) -> f64 {
    if pre == 0.0 {
        if post > 0.0 {
            f64::INFINITY
        } else {
            0.0
        }
    } else {
        round_to((post - pre) / pre * 100.0, 1)
    }
}

/// Mean and sample standard deviation; σ needs at least two points.
pub fn mean_and_stddev(values: &[f64]) -> Option<(f64, Option<f64>)> {
    if values.is_empty() {
        return None;
    }
    let mean = statistical::mean(values);
    let sd = (values.len() >= 2).then(|| statistical::standard_deviation(values, Some(mean)));
    Some((mean, sd))
}

/// Indices of values strictly above `mean + k·σ`. Nothing is anomalous
/// without spread.
pub fn outliers_above(values: &[f64], k: f64) -> Vec<usize> {
    match mean_and_stddev(values) {
        Some((mean, Some(sd))) if sd > 0.0 => {
            let threshold = mean + k * sd;
            values
                .iter()
                .enumerate()
                .filter(|(_, v)| **v > threshold)
                .map(|(i, _)| i)
                .collect()
        }
        _ => Vec::new(),
    }
}

// ----------------------------------------------------------------------------
// 20.1 Histogram Quantile
// ----------------------------------------------------------------------------

/// Quantile `q` of a cumulative histogram given as `(le, cumulative_count)`
/// pairs. The `+Inf` bucket reports the previous finite bound.
pub fn histogram_quantile(q: f64, buckets: &[(f64, f64)]) -> Option<f64> {
    let mut buckets: Vec<(f64, f64)> = buckets
        .iter()
        .copied()
        .filter(|(le, cnt)| !le.is_nan() && !cnt.is_nan())
        .collect();
    if buckets.is_empty() {
        return None;
    }
    buckets.sort_by_key(|(le, _)| OrderedFloat(*le));

    let total = buckets[buckets.len() - 1].1;
    if total <= 0.0 {
        return None;
    }

    let rank = q * total;
    let (mut prev_le, mut prev_cnt) = (0.0, 0.0);
    for &(le, cnt) in &buckets {
        if cnt >= rank {
            if le == f64::INFINITY {
                return Some(prev_le);
            }
            let in_bucket = cnt - prev_cnt;
            if in_bucket <= 0.0 {
                return Some(le);
            }
            return Some(prev_le + (le - prev_le) * ((rank - prev_cnt) / in_bucket));
        }
        prev_le = le;
        prev_cnt = cnt;
    }
    Some(buckets[buckets.len() - 1].0)
}

/// Parse a bucket bound, accepting `+Inf`/`inf`.
pub fn parse_le(raw: &str) -> Option<f64> {
    match raw.trim() {
        "+Inf" | "Inf" | "inf" | "+inf" => Some(f64::INFINITY),
        other => other.parse().ok(),
    }
}

#[cfg(test)]
mod stats_tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test]
    fn test_empty_percentiles_are_zero() {
        assert_eq!(Percentiles::compute(&[]), Percentiles::default());
    }

    #[test]
    fn test_percentile_index_clamped() {
        let samples: Vec<f64> = (1..=10).map(f64::from).collect();
        let p = Percentiles::compute(&samples);
        assert_eq!(p.p50, 6.0);
        assert_eq!(p.p90, 10.0);
        assert_eq!(p.p99, 10.0);
    }

    #[test_case(0.0, 0.0, 0.0 ; "both zero")]
    #[test_case(0.0, 5.0, f64::INFINITY ; "growth from zero")]
    #[test_case(100.0, 250.0, 150.0 ; "increase")]
    #[test_case(200.0, 100.0, -50.0 ; "decrease")]
    #[test_case(3.0, 4.0, 33.3 ; "rounded")]
    fn test_delta_pct(pre: f64, post: f64, expected: f64) {
        assert_eq!(delta_pct(pre, post), expected);
    }

    #[test]
    fn test_histogram_quantile_interpolates() {
        let q = histogram_quantile(0.5, &[(1.0, 10.0), (5.0, 40.0), (f64::INFINITY, 50.0)]).unwrap();
        assert!(q > 1.0 && q < 5.0, "got {}", q);
    }

    #[test]
    fn test_histogram_quantile_inf_bucket_returns_previous_bound() {
        let q = histogram_quantile(0.99, &[(1.0, 10.0), (5.0, 40.0), (f64::INFINITY, 50.0)]).unwrap();
        assert_eq!(q, 5.0);
    }

    #[test]
    fn test_histogram_quantile_degenerate() {
        assert_eq!(histogram_quantile(0.5, &[]), None);
        assert_eq!(histogram_quantile(0.5, &[(1.0, 0.0), (f64::INFINITY, 0.0)]), None);
    }

    #[test]
    fn test_outliers_need_spread() {
        assert!(outliers_above(&[5.0, 5.0, 5.0], 2.0).is_empty());
        assert!(outliers_above(&[5.0], 2.0).is_empty());
        let mut values = vec![10.0; 20];
        values.push(100.0);
        assert_eq!(outliers_above(&values, 2.0), vec![20]);
    }

    #[test]
    fn test_parse_le() {
        assert_eq!(parse_le("+Inf"), Some(f64::INFINITY));
        assert_eq!(parse_le("0.25"), Some(0.25));
        assert_eq!(parse_le("bogus"), None);
    }

    proptest! {
        #[test]
        fn test_percentiles_within_sample_bounds(samples in proptest::collection::vec(0.0f64..1.0e6, 1..200)) {
            let p = Percentiles::compute(&samples);
            let min = samples.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            for v in [p.p50, p.p90, p.p99] {
                prop_assert!(v >= round_to(min, 2) && v <= round_to(max, 2));
            }
            prop_assert!(p.p50 <= p.p90 && p.p90 <= p.p99);
        }
    }
}
