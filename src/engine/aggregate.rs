//! Combination of per-site partial aggregates.
//!
//! Each partial `(n, sum, sumSquares)` is turned into `(n, mean, M2)` and
//! merged pairwise with the parallel (Chan) update, so the combined
//! variance never goes through one big `sumSquares - sum²/n` subtraction.
//! Merging is commutative: the order sites answered in does not matter.

use crate::error::{ensure_finite, AnalyticsError, ErrorKind, Result};
use crate::models::{
    Centroid, GroupSummary, PartialAggregate, PercentileEstimate, QuantileSketch, SiteAggregate,
};
use crate::resolver::ResolvedScope;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Percentiles reported when a descriptive query asks for them.
pub const REPORTED_PERCENTILES: [f64; 5] = [5.0, 25.0, 50.0, 75.0, 95.0];

/// Count, mean and sum of squared deviations of one group.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Moments {
    pub n: u64,
    pub mean: f64,
    pub m2: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Moments {
    /// Convert a site partial, rejecting anything non-finite or impossible.
    pub fn from_partial(partial: &PartialAggregate) -> Result<Self> {
        let sum = ensure_finite(partial.sum, "sum")?;
        let sum_squares = ensure_finite(partial.sum_squares, "sumSquares")?;
        let min = partial.min.map(|v| ensure_finite(v, "min")).transpose()?;
        let max = partial.max.map(|v| ensure_finite(v, "max")).transpose()?;

        if partial.n == 0 {
            if sum != 0.0 || sum_squares != 0.0 {
                return Err(AnalyticsError::corrupt(
                    "Partial aggregate has n = 0 but nonzero sums",
                ));
            }
            return Ok(Self::default());
        }
        if sum_squares < 0.0 {
            return Err(AnalyticsError::corrupt("sumSquares is negative"));
        }

        let n = partial.n as f64;
        let mean = sum / n;
        let m2 = sum_squares - sum * mean;
        // Rounding may leave a tiny negative residue; anything larger means
        // the sums cannot come from real data.
        if m2 < -1e-9 * sum_squares.max(1.0) {
            return Err(AnalyticsError::corrupt(format!(
                "sumSquares {} is smaller than sum²/n for n = {}",
                sum_squares, partial.n
            )));
        }

        Ok(Self {
            n: partial.n,
            mean,
            m2: m2.max(0.0),
            min,
            max,
        })
    }

    /// Parallel combination of two sets of moments.
    pub fn merge(&self, other: &Moments) -> Moments {
        if other.n == 0 {
            return Moments {
                min: min_option(self.min, other.min),
                max: max_option(self.max, other.max),
                ..*self
            };
        }
        if self.n == 0 {
            return Moments {
                min: min_option(self.min, other.min),
                max: max_option(self.max, other.max),
                ..*other
            };
        }

        let na = self.n as f64;
        let nb = other.n as f64;
        let n = na + nb;
        let delta = other.mean - self.mean;

        Moments {
            n: self.n + other.n,
            mean: self.mean + delta * nb / n,
            m2: self.m2 + other.m2 + delta * delta * na * nb / n,
            min: min_option(self.min, other.min),
            max: max_option(self.max, other.max),
        }
    }

    /// Sample variance (n - 1 denominator), defined for n >= 2.
    pub fn variance(&self) -> Option<f64> {
        (self.n >= 2).then(|| self.m2 / (self.n - 1) as f64)
    }

    pub fn mean(&self) -> Option<f64> {
        (self.n >= 1).then_some(self.mean)
    }
}

fn min_option(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

fn max_option(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

/// Combined statistics for one group across every site that reported it.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupAggregate {
    pub group_id: String,
    pub moments: Moments,
    pub sketch: Option<QuantileSketch>,
}

impl GroupAggregate {
    pub fn empty(group_id: &str) -> Self {
        Self {
            group_id: group_id.to_string(),
            moments: Moments::default(),
            sketch: None,
        }
    }

    /// Fold one site partial into the group.
    pub fn absorb(&mut self, partial: &PartialAggregate) -> Result<()> {
        let moments = Moments::from_partial(partial)?;
        self.moments = self.moments.merge(&moments);

        if let Some(ref sketch) = partial.sketch {
            validate_sketch(sketch)?;
            let merged = self.sketch.get_or_insert_with(QuantileSketch::default);
            merged.centroids.extend(sketch.centroids.iter().copied());
        }
        Ok(())
    }

    /// Public summary of the group.
    pub fn summary(&self, include_percentiles: bool) -> GroupSummary {
        let variance = self.moments.variance();
        let percentiles = if include_percentiles {
            self.sketch.as_ref().map(|sketch| {
                REPORTED_PERCENTILES
                    .iter()
                    .filter_map(|&p| {
                        sketch_quantile(sketch, p / 100.0, self.moments.min, self.moments.max)
                            .map(|value| PercentileEstimate {
                                percentile: p,
                                value,
                            })
                    })
                    .collect()
            })
        } else {
            None
        };

        GroupSummary {
            group_id: self.group_id.clone(),
            n: self.moments.n,
            mean: self.moments.mean(),
            variance,
            std_dev: variance.map(f64::sqrt),
            min: self.moments.min,
            max: self.moments.max,
            percentiles,
        }
    }
}

fn validate_sketch(sketch: &QuantileSketch) -> Result<()> {
    for centroid in &sketch.centroids {
        ensure_finite(centroid.mean, "sketch centroid mean")?;
        let weight = ensure_finite(centroid.weight, "sketch centroid weight")?;
        if weight <= 0.0 {
            return Err(AnalyticsError::corrupt("Sketch centroid weight must be positive"));
        }
    }
    Ok(())
}

/// Approximate quantile `q` in `[0, 1]` from merged centroids.
///
/// Each centroid's weight is centred on its mean; the quantile is
/// interpolated linearly between neighbouring centres and clamped to the
/// known extremes.
pub fn sketch_quantile(
    sketch: &QuantileSketch,
    q: f64,
    min: Option<f64>,
    max: Option<f64>,
) -> Option<f64> {
    if sketch.centroids.is_empty() {
        return None;
    }

    let mut centroids: Vec<Centroid> = sketch.centroids.clone();
    centroids.sort_by(|a, b| a.mean.partial_cmp(&b.mean).unwrap_or(std::cmp::Ordering::Equal));

    let total: f64 = centroids.iter().map(|c| c.weight).sum();
    let target = q.clamp(0.0, 1.0) * total;

    let mut cumulative = 0.0;
    let mut previous: Option<(f64, f64)> = None;
    let mut estimate = centroids[centroids.len() - 1].mean;

    for centroid in &centroids {
        let centre = cumulative + centroid.weight / 2.0;
        if target <= centre {
            estimate = match previous {
                None => centroid.mean,
                Some((prev_centre, prev_mean)) => {
                    let span = centre - prev_centre;
                    if span <= 0.0 {
                        centroid.mean
                    } else {
                        prev_mean + (target - prev_centre) / span * (centroid.mean - prev_mean)
                    }
                }
            };
            break;
        }
        previous = Some((centre, centroid.mean));
        cumulative += centroid.weight;
    }

    if let Some(lo) = min {
        estimate = estimate.max(lo);
    }
    if let Some(hi) = max {
        estimate = estimate.min(hi);
    }
    Some(estimate)
}

/// Combine site aggregates into one aggregate per scope group.
///
/// A site only contributes to the groups the scope assigned it; a group
/// it was assigned but did not report counts as empty for that site.
pub fn combine_groups(
    scope: &ResolvedScope,
    sites: &BTreeMap<String, SiteAggregate>,
) -> Result<Vec<GroupAggregate>> {
    let mut groups: Vec<GroupAggregate> = scope
        .groups
        .iter()
        .map(|g| GroupAggregate::empty(&g.id))
        .collect();

    for (site_id, aggregate) in sites {
        let assigned = scope.groups_for_site(site_id);
        for group in groups.iter_mut() {
            if !assigned.contains(&group.group_id) {
                continue;
            }
            if let Some(partial) = aggregate.groups.get(&group.group_id) {
                group.absorb(partial).map_err(|e| {
                    AnalyticsError::new(e.kind, format!("site '{}': {}", site_id, e.message))
                })?;
            }
        }

        let unexpected: Vec<&String> = aggregate
            .groups
            .keys()
            .filter(|g| !assigned.contains(g))
            .collect();
        if !unexpected.is_empty() {
            debug!(
                "Ignoring groups {:?} reported by site {} outside its scope",
                unexpected, site_id
            );
        }
    }

    Ok(groups)
}

/// Merge every group into one overall aggregate.
pub fn overall(groups: &[GroupAggregate]) -> GroupAggregate {
    let mut total = GroupAggregate::empty("overall");
    for group in groups {
        total.moments = total.moments.merge(&group.moments);
        if let Some(ref sketch) = group.sketch {
            let merged = total.sketch.get_or_insert_with(QuantileSketch::default);
            merged.centroids.extend(sketch.centroids.iter().copied());
        }
    }
    total
}

/// Contingency table merged from site category counts.
#[derive(Debug, Clone, PartialEq)]
pub struct ContingencyTable {
    pub rows: Vec<String>,
    pub columns: Vec<String>,
    pub counts: Vec<Vec<u64>>,
}

impl ContingencyTable {
    /// Build the table from every in-scope partial.
    ///
    /// Declared categories fix the shape (and reject unknown labels);
    /// otherwise levels are the sorted union of what sites reported.
    pub fn from_sites(
        scope: &ResolvedScope,
        sites: &BTreeMap<String, SiteAggregate>,
        declared_rows: &[String],
        declared_columns: &[String],
    ) -> Result<Self> {
        let mut cells: BTreeMap<(String, String), u64> = BTreeMap::new();
        let mut seen_rows = BTreeSet::new();
        let mut seen_columns = BTreeSet::new();

        for (site_id, aggregate) in sites {
            let assigned = scope.groups_for_site(site_id);
            for (group_id, partial) in &aggregate.groups {
                if !assigned.contains(group_id) {
                    continue;
                }
                let Some(ref counts) = partial.category_counts else {
                    continue;
                };
                for cell in counts {
                    if !declared_rows.is_empty() && !declared_rows.contains(&cell.row) {
                        return Err(AnalyticsError::corrupt(format!(
                            "site '{}' reported unknown row category '{}'",
                            site_id, cell.row
                        )));
                    }
                    if !declared_columns.is_empty() && !declared_columns.contains(&cell.column) {
                        return Err(AnalyticsError::corrupt(format!(
                            "site '{}' reported unknown column category '{}'",
                            site_id, cell.column
                        )));
                    }
                    seen_rows.insert(cell.row.clone());
                    seen_columns.insert(cell.column.clone());
                    let slot = cells
                        .entry((cell.row.clone(), cell.column.clone()))
                        .or_default();
                    *slot = slot.checked_add(cell.count).ok_or_else(|| {
                        AnalyticsError::new(ErrorKind::CorruptAggregate, "category count overflow")
                    })?;
                }
            }
        }

        let rows: Vec<String> = if declared_rows.is_empty() {
            seen_rows.into_iter().collect()
        } else {
            declared_rows.to_vec()
        };
        let columns: Vec<String> = if declared_columns.is_empty() {
            seen_columns.into_iter().collect()
        } else {
            declared_columns.to_vec()
        };

        let counts = rows
            .iter()
            .map(|r| {
                columns
                    .iter()
                    .map(|c| cells.get(&(r.clone(), c.clone())).copied().unwrap_or(0))
                    .collect()
            })
            .collect();

        Ok(Self {
            rows,
            columns,
            counts,
        })
    }

    /// Number of observations in the table.
    pub fn total(&self) -> Result<u64> {
        checked_sum(self.counts.iter().flatten().copied())
    }

    pub fn row_totals(&self) -> Result<Vec<u64>> {
        self.counts
            .iter()
            .map(|r| checked_sum(r.iter().copied()))
            .collect()
    }

    pub fn column_totals(&self) -> Result<Vec<u64>> {
        (0..self.columns.len())
            .map(|j| checked_sum(self.counts.iter().map(|r| r[j])))
            .collect()
    }
}

fn checked_sum(mut counts: impl Iterator<Item = u64>) -> Result<u64> {
    counts.try_fold(0u64, |acc, count| {
        acc.checked_add(count)
            .ok_or_else(|| AnalyticsError::corrupt("category count total overflows"))
    })
}
