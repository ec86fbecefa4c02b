//! Welch two-sample t-test.

use super::aggregate::GroupAggregate;
use super::distributions::{student_t_quantile, student_t_two_sided_p};
use crate::error::{AnalyticsError, ErrorKind, Result};
use crate::models::{ConfidenceInterval, TTestRequest, TTestResult};

/// Compare the means of two groups without assuming equal variances.
pub fn welch_t_test(
    request: &TTestRequest,
    group_a: &GroupAggregate,
    group_b: &GroupAggregate,
) -> Result<TTestResult> {
    for g in [group_a, group_b] {
        if g.moments.n < 2 {
            return Err(AnalyticsError::insufficient_sample(format!(
                "Group '{}' has {} records, the t-test needs at least 2",
                g.group_id, g.moments.n
            )));
        }
    }

    let a = &group_a.moments;
    let b = &group_b.moments;
    let (na, nb) = (a.n as f64, b.n as f64);
    let va = a.m2 / (na - 1.0);
    let vb = b.m2 / (nb - 1.0);

    let sa = va / na;
    let sb = vb / nb;
    let se = (sa + sb).sqrt();
    if se == 0.0 {
        return Err(AnalyticsError::new(
            ErrorKind::ZeroVariance,
            "Both groups have zero variance",
        ));
    }

    let difference = a.mean - b.mean;
    let t = difference / se;
    let df = (sa + sb).powi(2) / (sa * sa / (na - 1.0) + sb * sb / (nb - 1.0));
    let p_value = student_t_two_sided_p(t, df);

    let level = request.confidence_level;
    let critical = student_t_quantile(1.0 - (1.0 - level) / 2.0, df);
    let interval = ConfidenceInterval {
        lower: difference - critical * se,
        upper: difference + critical * se,
    };

    let pooled = (((na - 1.0) * va + (nb - 1.0) * vb) / (na + nb - 2.0)).sqrt();
    let effect_size = if pooled > 0.0 { difference / pooled } else { 0.0 };

    Ok(TTestResult {
        variable: request.variable.clone(),
        group_a: group_a.summary(false),
        group_b: group_b.summary(false),
        mean_difference: difference,
        t_statistic: t,
        degrees_of_freedom: df,
        p_value,
        confidence_level: level,
        confidence_interval: interval,
        effect_size,
        significant: p_value < 1.0 - level,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::aggregate::Moments;
    use crate::models::GroupBy;
    use crate::testing::partial;

    fn group(id: &str, n: u64, mean: f64, variance: f64) -> GroupAggregate {
        let mut g = GroupAggregate::empty(id);
        g.moments = Moments::from_partial(&partial(n, mean, variance)).unwrap();
        g
    }

    fn request() -> TTestRequest {
        TTestRequest {
            variable: "age".to_string(),
            group_a: "ios".to_string(),
            group_b: "android".to_string(),
            group_by: GroupBy::DeviceGroup,
            confidence_level: 0.95,
            filters: None,
        }
    }

    #[test]
    fn test_known_welch_values() {
        // n=10 mean=5 var=4 against n=20 mean=7 var=9:
        // se² = 0.4 + 0.45, t = -2 / sqrt(0.85)
        let result =
            welch_t_test(&request(), &group("ios", 10, 5.0, 4.0), &group("android", 20, 7.0, 9.0))
                .unwrap();

        let expected_t = -2.0 / 0.85f64.sqrt();
        assert!((result.t_statistic - expected_t).abs() < 1e-9);
        let expected_df = 0.85f64.powi(2) / (0.16 / 9.0 + 0.2025 / 19.0);
        assert!((result.degrees_of_freedom - expected_df).abs() < 1e-9);
        assert!(result.p_value > 0.03 && result.p_value < 0.05);
        assert!(result.significant);
        assert!(result.confidence_interval.contains(result.mean_difference));
        assert!(result.confidence_interval.upper < 0.0);
        assert!(result.effect_size < 0.0);
    }

    #[test]
    fn test_equal_means_are_not_significant() {
        let result =
            welch_t_test(&request(), &group("ios", 30, 5.0, 4.0), &group("android", 30, 5.0, 4.0))
                .unwrap();
        assert!(result.t_statistic.abs() < 1e-12);
        assert!((result.p_value - 1.0).abs() < 1e-9);
        assert!(!result.significant);
    }

    #[test]
    fn test_small_group_is_rejected() {
        let err =
            welch_t_test(&request(), &group("ios", 1, 5.0, 0.0), &group("android", 20, 7.0, 9.0))
                .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InsufficientSampleSize);
    }

    #[test]
    fn test_zero_variance_is_rejected() {
        let err =
            welch_t_test(&request(), &group("ios", 5, 5.0, 0.0), &group("android", 5, 7.0, 0.0))
                .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ZeroVariance);
    }

    #[test]
    fn test_interval_contains_difference_across_inputs() {
        let groups = [
            (2, 0.0, 1.0),
            (3, -4.5, 0.25),
            (10, 5.0, 4.0),
            (57, 1e3, 1e4),
            (1_000, 12.5, 0.0),
            (250_000, -0.001, 3.0),
        ];
        let levels = [0.5, 0.8, 0.9, 0.95, 0.99, 0.999];

        for &(na, mean_a, var_a) in &groups {
            for &(nb, mean_b, var_b) in &groups {
                if var_a == 0.0 && var_b == 0.0 {
                    continue;
                }
                let a = group("ios", na, mean_a, var_a);
                let b = group("android", nb, mean_b + 0.75, var_b);
                let mut previous_width = 0.0;
                for &level in &levels {
                    let mut req = request();
                    req.confidence_level = level;
                    let result = welch_t_test(&req, &a, &b).unwrap();
                    let ci = &result.confidence_interval;
                    assert!(
                        ci.contains(result.mean_difference),
                        "({}, {}, {}) vs ({}, {}, {}) at {}: {:?} misses {}",
                        na, mean_a, var_a, nb, mean_b, var_b, level, ci, result.mean_difference
                    );
                    assert!((0.0..=1.0).contains(&result.p_value));
                    let width = ci.upper - ci.lower;
                    assert!(width > previous_width, "interval must widen with the level");
                    previous_width = width;
                }
            }
        }
    }
}
