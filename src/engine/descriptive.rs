//! Descriptive statistics per group and overall.

use super::aggregate::{overall, GroupAggregate};
use crate::models::{DescriptiveRequest, DescriptiveResult};

/// Summarize combined groups. Groups with no records are kept with `n = 0`.
pub fn describe(request: &DescriptiveRequest, groups: &[GroupAggregate]) -> DescriptiveResult {
    let include = request.include_percentiles;
    let total = overall(groups);

    DescriptiveResult {
        variable: request.variable.clone(),
        group_by: request.group_by,
        groups: groups.iter().map(|g| g.summary(include)).collect(),
        overall: total.summary(include),
        percentiles_approximate: include,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::aggregate::Moments;
    use crate::models::{Centroid, GroupBy, QuantileSketch};
    use crate::testing::partial;

    fn group(id: &str, n: u64, mean: f64, variance: f64) -> GroupAggregate {
        let mut g = GroupAggregate::empty(id);
        g.moments = Moments::from_partial(&partial(n, mean, variance)).unwrap();
        g
    }

    fn request(include_percentiles: bool) -> DescriptiveRequest {
        DescriptiveRequest {
            variable: "age".to_string(),
            group_by: GroupBy::DeviceGroup,
            group_ids: None,
            include_percentiles,
            filters: None,
        }
    }

    #[test]
    fn test_describe_groups_and_overall() {
        let groups = vec![group("ios", 10, 5.0, 4.0), group("android", 20, 7.0, 9.0)];
        let result = describe(&request(false), &groups);

        assert_eq!(result.groups.len(), 2);
        assert_eq!(result.groups[0].n, 10);
        assert!((result.groups[0].mean.unwrap() - 5.0).abs() < 1e-12);
        assert!((result.groups[1].variance.unwrap() - 9.0).abs() < 1e-9);
        assert_eq!(result.overall.n, 30);
        assert!((result.overall.mean.unwrap() - 6.333333333).abs() < 1e-6);
        assert!(result.groups[0].percentiles.is_none());
        assert!(!result.percentiles_approximate);
    }

    #[test]
    fn test_empty_group_has_no_moments() {
        let groups = vec![GroupAggregate::empty("ios"), group("android", 1, 3.0, 0.0)];
        let result = describe(&request(false), &groups);

        assert_eq!(result.groups[0].n, 0);
        assert!(result.groups[0].mean.is_none());
        // A single record has a mean but no sample variance.
        assert_eq!(result.groups[1].mean, Some(3.0));
        assert!(result.groups[1].variance.is_none());
    }

    #[test]
    fn test_percentiles_are_flagged_approximate() {
        let mut g = group("ios", 4, 2.5, 5.0 / 3.0);
        g.moments.min = Some(1.0);
        g.moments.max = Some(4.0);
        g.sketch = Some(QuantileSketch {
            centroids: (1..=4)
                .map(|v| Centroid {
                    mean: v as f64,
                    weight: 1.0,
                })
                .collect(),
        });

        let result = describe(&request(true), &[g]);
        assert!(result.percentiles_approximate);
        let percentiles = result.groups[0].percentiles.as_ref().unwrap();
        assert_eq!(percentiles.len(), 5);
        assert!(percentiles.windows(2).all(|w| w[0].value <= w[1].value));
        assert!(result.overall.percentiles.is_some());
    }
}
