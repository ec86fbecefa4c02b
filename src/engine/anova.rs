//! One-way analysis of variance with Tukey–Kramer post-hoc comparisons.

use super::aggregate::GroupAggregate;
use super::distributions::{f_sf, studentized_range_cdf, studentized_range_quantile};
use crate::error::{AnalyticsError, ErrorKind, Result};
use crate::models::{AnovaRequest, AnovaResult, ConfidenceInterval, PairwiseComparison};
use tracing::debug;

pub const POST_HOC_TOO_FEW_GROUPS: &str =
    "Post-hoc comparisons need at least 3 non-empty groups";
pub const POST_HOC_NOT_SIGNIFICANT: &str =
    "Post-hoc comparisons skipped: the overall F-test is not significant";

/// Run one-way ANOVA over the non-empty groups.
///
/// Empty groups stay in the reported summaries but do not count towards
/// `k`.
pub fn one_way_anova(request: &AnovaRequest, groups: &[GroupAggregate]) -> Result<AnovaResult> {
    let active: Vec<&GroupAggregate> = groups.iter().filter(|g| g.moments.n > 0).collect();
    let k = active.len();
    if k < 2 {
        return Err(AnalyticsError::insufficient_sample(format!(
            "ANOVA needs at least 2 non-empty groups, got {}",
            k
        )));
    }

    let total_n: u64 = active.iter().map(|g| g.moments.n).sum();
    if total_n <= k as u64 {
        return Err(AnalyticsError::insufficient_sample(format!(
            "ANOVA needs more records ({}) than groups ({})",
            total_n, k
        )));
    }

    let grand_mean = active
        .iter()
        .map(|g| g.moments.n as f64 * g.moments.mean)
        .sum::<f64>()
        / total_n as f64;

    let ss_between: f64 = active
        .iter()
        .map(|g| {
            let d = g.moments.mean - grand_mean;
            g.moments.n as f64 * d * d
        })
        .sum();
    let ss_within: f64 = active.iter().map(|g| g.moments.m2).sum();

    if ss_within <= 0.0 {
        return Err(AnalyticsError::new(
            ErrorKind::ZeroVariance,
            "Every group has zero within-group variance",
        ));
    }

    let df_between = (k - 1) as u64;
    let df_within = total_n - k as u64;
    let ms_between = ss_between / df_between as f64;
    let ms_within = ss_within / df_within as f64;
    let f_statistic = ms_between / ms_within;
    let p_value = f_sf(f_statistic, df_between as f64, df_within as f64);

    let level = request.confidence_level;
    let significant = p_value < 1.0 - level;

    let (post_hoc, post_hoc_note) = if !request.post_hoc {
        (None, None)
    } else if k < 3 {
        (None, Some(POST_HOC_TOO_FEW_GROUPS.to_string()))
    } else if !significant {
        (None, Some(POST_HOC_NOT_SIGNIFICANT.to_string()))
    } else {
        (
            Some(tukey_kramer(&active, ms_within, df_within as f64, level)),
            None,
        )
    };

    Ok(AnovaResult {
        variable: request.variable.clone(),
        group_by: request.group_by,
        groups: groups.iter().map(|g| g.summary(false)).collect(),
        f_statistic,
        df_between,
        df_within,
        ss_between,
        ss_within,
        p_value,
        confidence_level: level,
        significant,
        effect_size: ss_between / (ss_between + ss_within),
        post_hoc,
        post_hoc_note,
    })
}

/// All pairwise comparisons with unequal-n standard errors.
fn tukey_kramer(
    groups: &[&GroupAggregate],
    ms_within: f64,
    df_within: f64,
    level: f64,
) -> Vec<PairwiseComparison> {
    let k = groups.len() as f64;
    let critical = studentized_range_quantile(level, k, df_within);
    debug!("Tukey-Kramer critical q = {:.4} (k = {}, df = {})", critical, k, df_within);

    let mut comparisons = Vec::new();
    for (i, a) in groups.iter().enumerate() {
        for b in &groups[i + 1..] {
            let difference = a.moments.mean - b.moments.mean;
            let se = (ms_within / 2.0
                * (1.0 / a.moments.n as f64 + 1.0 / b.moments.n as f64))
                .sqrt();
            let q = difference.abs() / se;
            let p_value = (1.0 - studentized_range_cdf(q, k, df_within)).clamp(0.0, 1.0);

            comparisons.push(PairwiseComparison {
                group_a: a.group_id.clone(),
                group_b: b.group_id.clone(),
                mean_difference: difference,
                q_statistic: q,
                p_value,
                confidence_interval: ConfidenceInterval {
                    lower: difference - critical * se,
                    upper: difference + critical * se,
                },
                significant: p_value < 1.0 - level,
            });
        }
    }
    comparisons
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

    fn request(post_hoc: bool) -> AnovaRequest {
        AnovaRequest {
            variable: "age".to_string(),
            group_by: GroupBy::DeviceGroup,
            group_ids: None,
            confidence_level: 0.95,
            post_hoc,
            filters: None,
        }
    }

    #[test]
    fn test_identical_means_give_zero_f() {
        let groups = vec![
            group("a", 10, 5.0, 2.0),
            group("b", 12, 5.0, 3.0),
            group("c", 8, 5.0, 1.0),
        ];
        let result = one_way_anova(&request(true), &groups).unwrap();
        assert!(result.f_statistic.abs() < 1e-12);
        assert!((result.p_value - 1.0).abs() < 1e-9);
        assert!(!result.significant);
        assert_eq!(result.df_between, 2);
        assert_eq!(result.df_within, 27);
        assert!(result.post_hoc.is_none());
        assert_eq!(result.post_hoc_note.as_deref(), Some(POST_HOC_NOT_SIGNIFICANT));
    }

    #[test]
    fn test_known_f_statistic() {
        // Means 4, 5, 9 with 5 records each and unit variance:
        // grand mean 6, SSB = 5 * (4 + 1 + 9) = 70, SSW = 3 * 4 = 12.
        let groups = vec![group("a", 5, 4.0, 1.0), group("b", 5, 5.0, 1.0), group("c", 5, 9.0, 1.0)];
        let result = one_way_anova(&request(false), &groups).unwrap();

        assert!((result.ss_between - 70.0).abs() < 1e-9);
        assert!((result.ss_within - 12.0).abs() < 1e-9);
        assert!((result.f_statistic - 35.0).abs() < 1e-9);
        assert!((result.effect_size - 70.0 / 82.0).abs() < 1e-12);
        assert!(result.p_value < 1e-4);
        assert!(result.significant);
        // Not requested: no comparisons and no note.
        assert!(result.post_hoc.is_none());
        assert!(result.post_hoc_note.is_none());
    }

    #[test]
    fn test_post_hoc_pairs() {
        let groups = vec![group("a", 5, 4.0, 1.0), group("b", 5, 5.0, 1.0), group("c", 5, 9.0, 1.0)];
        let result = one_way_anova(&request(true), &groups).unwrap();
        let pairs = result.post_hoc.unwrap();

        assert_eq!(pairs.len(), 3);
        let ab = &pairs[0];
        assert_eq!((ab.group_a.as_str(), ab.group_b.as_str()), ("a", "b"));
        assert!(!ab.significant);
        assert!(ab.confidence_interval.contains(0.0));

        let ac = &pairs[1];
        assert!(ac.significant);
        assert!(ac.confidence_interval.upper < 0.0);
        assert!(ac.p_value < ab.p_value);
    }

    #[test]
    fn test_two_groups_skip_post_hoc_with_note() {
        let groups = vec![group("a", 5, 4.0, 1.0), group("b", 5, 9.0, 1.0)];
        let result = one_way_anova(&request(true), &groups).unwrap();
        assert!(result.significant);
        assert_eq!(result.post_hoc_note.as_deref(), Some(POST_HOC_TOO_FEW_GROUPS));
    }

    #[test]
    fn test_single_group_is_insufficient() {
        let groups = vec![group("a", 10, 5.0, 2.0), GroupAggregate::empty("b")];
        let err = one_way_anova(&request(false), &groups).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InsufficientSampleSize);
    }

    #[test]
    fn test_one_record_per_group_is_insufficient() {
        let groups = vec![group("a", 1, 5.0, 0.0), group("b", 1, 6.0, 0.0)];
        let err = one_way_anova(&request(false), &groups).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InsufficientSampleSize);
    }

    #[test]
    fn test_zero_within_variance() {
        let groups = vec![group("a", 3, 5.0, 0.0), group("b", 3, 6.0, 0.0)];
        let err = one_way_anova(&request(false), &groups).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ZeroVariance);
    }

    #[test]
    fn test_empty_groups_are_reported_but_not_counted() {
        let groups = vec![
            group("a", 5, 4.0, 1.0),
            GroupAggregate::empty("empty"),
            group("b", 5, 9.0, 1.0),
        ];
        let result = one_way_anova(&request(false), &groups).unwrap();
        assert_eq!(result.groups.len(), 3);
        assert_eq!(result.df_between, 1);
        assert_eq!(result.groups[1].n, 0);
    }
}
