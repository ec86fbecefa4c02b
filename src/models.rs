//! Data models for the analytics engine.
//!
//! This module contains the request, query, aggregate and result types
//! shared by the resolver, collector, engine and lifecycle manager.
//! Everything that crosses the service boundary serializes as camelCase.

use crate::error::{AnalyticsError, ErrorKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Identifier of a submitted query.
pub type QueryId = Uuid;

/// The statistical test a query runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryKind {
    #[serde(rename = "descriptive")]
    Descriptive,
    #[serde(rename = "t-test")]
    TTest,
    #[serde(rename = "chi-square")]
    ChiSquare,
    #[serde(rename = "anova")]
    Anova,
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryKind::Descriptive => write!(f, "descriptive"),
            QueryKind::TTest => write!(f, "t-test"),
            QueryKind::ChiSquare => write!(f, "chi-square"),
            QueryKind::Anova => write!(f, "anova"),
        }
    }
}

/// Lifecycle state of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl QueryStatus {
    /// Completed and failed queries never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueryStatus::Completed | QueryStatus::Failed)
    }

    /// Returns an emoji representation of the status.
    pub fn emoji(&self) -> &'static str {
        match self {
            QueryStatus::Pending => "⏳",
            QueryStatus::Running => "🔄",
            QueryStatus::Completed => "✅",
            QueryStatus::Failed => "❌",
        }
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryStatus::Pending => write!(f, "pending"),
            QueryStatus::Running => write!(f, "running"),
            QueryStatus::Completed => write!(f, "completed"),
            QueryStatus::Failed => write!(f, "failed"),
        }
    }
}

/// How sites are partitioned into comparison groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    /// Groups are device groups declared by members; a member may carry several.
    #[default]
    DeviceGroup,
    /// Every federation member is its own group.
    FederationMember,
}

impl fmt::Display for GroupBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupBy::DeviceGroup => write!(f, "device_group"),
            GroupBy::FederationMember => write!(f, "federation_member"),
        }
    }
}

/// A filter as it arrives on the wire. Validated into a typed predicate
/// by the resolver before anything is dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsFilter {
    pub field: String,
    pub operator: String,
    pub value: serde_json::Value,
}

/// Body of the descriptive statistics endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptiveRequest {
    pub variable: String,
    #[serde(default)]
    pub group_by: GroupBy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_ids: Option<Vec<String>>,
    #[serde(default)]
    pub include_percentiles: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Vec<AnalyticsFilter>>,
}

/// Body of the two-sample comparison endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TTestRequest {
    pub variable: String,
    pub group_a: String,
    pub group_b: String,
    #[serde(default)]
    pub group_by: GroupBy,
    #[serde(default = "default_confidence_level")]
    pub confidence_level: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Vec<AnalyticsFilter>>,
}

/// Body of the categorical independence endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChiSquareRequest {
    pub variable1: String,
    pub variable2: String,
    #[serde(default)]
    pub group_by: GroupBy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_ids: Option<Vec<String>>,
    #[serde(default = "default_confidence_level")]
    pub confidence_level: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Vec<AnalyticsFilter>>,
}

/// Body of the variance analysis endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnovaRequest {
    pub variable: String,
    #[serde(default)]
    pub group_by: GroupBy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_ids: Option<Vec<String>>,
    #[serde(default = "default_confidence_level")]
    pub confidence_level: f64,
    #[serde(default)]
    pub post_hoc: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Vec<AnalyticsFilter>>,
}

pub(crate) fn default_confidence_level() -> f64 {
    0.95
}

/// Parameters of a submitted query, one variant per test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "request")]
pub enum QueryParameters {
    #[serde(rename = "descriptive")]
    Descriptive(DescriptiveRequest),
    #[serde(rename = "t-test")]
    TTest(TTestRequest),
    #[serde(rename = "chi-square")]
    ChiSquare(ChiSquareRequest),
    #[serde(rename = "anova")]
    Anova(AnovaRequest),
}

impl QueryParameters {
    pub fn kind(&self) -> QueryKind {
        match self {
            QueryParameters::Descriptive(_) => QueryKind::Descriptive,
            QueryParameters::TTest(_) => QueryKind::TTest,
            QueryParameters::ChiSquare(_) => QueryKind::ChiSquare,
            QueryParameters::Anova(_) => QueryKind::Anova,
        }
    }

    /// Confidence level requested, if the test uses one.
    pub fn confidence_level(&self) -> Option<f64> {
        match self {
            QueryParameters::Descriptive(_) => None,
            QueryParameters::TTest(r) => Some(r.confidence_level),
            QueryParameters::ChiSquare(r) => Some(r.confidence_level),
            QueryParameters::Anova(r) => Some(r.confidence_level),
        }
    }
}

/// One centroid of a quantile sketch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Centroid {
    pub mean: f64,
    pub weight: f64,
}

/// Mergeable quantile sketch reported by a site.
///
/// Sites compress their values into weighted centroids; merging sketches
/// from several sites and interpolating over cumulative weight yields
/// approximate percentiles. Exact percentiles would need raw records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuantileSketch {
    pub centroids: Vec<Centroid>,
}

/// One cell of a site's contingency counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCount {
    pub row: String,
    pub column: String,
    pub count: u64,
}

/// Summary statistics a site computed for one group.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialAggregate {
    pub n: u64,
    pub sum: f64,
    pub sum_squares: f64,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub category_counts: Option<Vec<CategoryCount>>,
    #[serde(default)]
    pub sketch: Option<QuantileSketch>,
}

/// Per-site summary statistics, keyed by group.
///
/// Deserialize-only: site aggregates are consumed by the engine and never
/// leave it individually.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteAggregate {
    pub site_id: String,
    pub groups: BTreeMap<String, PartialAggregate>,
}

/// A site left out of a collection, by id and reason only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExcludedSite {
    pub site_id: String,
    pub reason: String,
}

/// Non-fatal condition attached to a completed query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryWarning {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_sites: Vec<ExcludedSite>,
}

/// Percentile estimate derived from merged sketches.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PercentileEstimate {
    pub percentile: f64,
    pub value: f64,
}

/// Combined statistics for one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSummary {
    pub group_id: String,
    pub n: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean: Option<f64>,
    /// Sample variance (n - 1 denominator).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub std_dev: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percentiles: Option<Vec<PercentileEstimate>>,
}

/// Two-sided confidence interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
}

impl ConfidenceInterval {
    pub fn contains(&self, value: f64) -> bool {
        self.lower <= value && value <= self.upper
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptiveResult {
    pub variable: String,
    pub group_by: GroupBy,
    pub groups: Vec<GroupSummary>,
    pub overall: GroupSummary,
    /// Percentiles come from merged sketches and are approximate.
    pub percentiles_approximate: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TTestResult {
    pub variable: String,
    pub group_a: GroupSummary,
    pub group_b: GroupSummary,
    /// Mean of group A minus mean of group B.
    pub mean_difference: f64,
    pub t_statistic: f64,
    /// Welch–Satterthwaite degrees of freedom.
    pub degrees_of_freedom: f64,
    pub p_value: f64,
    pub confidence_level: f64,
    pub confidence_interval: ConfidenceInterval,
    /// Cohen's d using the pooled standard deviation.
    pub effect_size: f64,
    pub significant: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChiSquareResult {
    pub variable1: String,
    pub variable2: String,
    pub statistic: f64,
    pub degrees_of_freedom: u64,
    pub p_value: f64,
    pub confidence_level: f64,
    pub significant: bool,
    /// Cramér's V.
    pub effect_size: f64,
    pub rows: Vec<String>,
    pub columns: Vec<String>,
    pub total: u64,
}

/// Tukey–Kramer comparison of two groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairwiseComparison {
    pub group_a: String,
    pub group_b: String,
    pub mean_difference: f64,
    pub q_statistic: f64,
    pub p_value: f64,
    pub confidence_interval: ConfidenceInterval,
    pub significant: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnovaResult {
    pub variable: String,
    pub group_by: GroupBy,
    pub groups: Vec<GroupSummary>,
    pub f_statistic: f64,
    pub df_between: u64,
    pub df_within: u64,
    pub ss_between: f64,
    pub ss_within: f64,
    pub p_value: f64,
    pub confidence_level: f64,
    pub significant: bool,
    /// η² = SS_between / SS_total.
    pub effect_size: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_hoc: Option<Vec<PairwiseComparison>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_hoc_note: Option<String>,
}

/// Result attached to a completed query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum QueryResult {
    #[serde(rename = "descriptive")]
    Descriptive(DescriptiveResult),
    #[serde(rename = "t-test")]
    TTest(TTestResult),
    #[serde(rename = "chi-square")]
    ChiSquare(ChiSquareResult),
    #[serde(rename = "anova")]
    Anova(AnovaResult),
}

/// A status the query entered, with the time it entered it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: QueryStatus,
    pub at: DateTime<Utc>,
}

/// A submitted analysis, tracked by the lifecycle manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsQuery {
    pub id: QueryId,
    pub federation_id: String,
    pub kind: QueryKind,
    pub parameters: QueryParameters,
    pub status: QueryStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<QueryResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AnalyticsError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<QueryWarning>,
    #[serde(default)]
    pub status_history: Vec<StatusChange>,
    /// Submission order, used to break creation-time ties.
    #[serde(default)]
    pub sequence: u64,
}

impl AnalyticsQuery {
    /// Creates a new pending query.
    pub fn new(federation_id: String, parameters: QueryParameters, sequence: u64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            federation_id,
            kind: parameters.kind(),
            parameters,
            status: QueryStatus::Pending,
            created_at: now,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            warnings: Vec::new(),
            status_history: vec![StatusChange {
                status: QueryStatus::Pending,
                at: now,
            }],
            sequence,
        }
    }

    /// Short listing form used by history pages.
    pub fn summary(&self) -> QuerySummary {
        QuerySummary {
            id: self.id,
            federation_id: self.federation_id.clone(),
            kind: self.kind,
            status: self.status,
            created_at: self.created_at,
            completed_at: self.completed_at,
            error_kind: self.error.as_ref().map(|e| e.kind),
        }
    }

    /// Wall time between creation and reaching a terminal state.
    pub fn duration_seconds(&self) -> Option<f64> {
        self.completed_at
            .map(|done| (done - self.created_at).num_milliseconds() as f64 / 1000.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySummary {
    pub id: QueryId,
    pub federation_id: String,
    pub kind: QueryKind,
    pub status: QueryStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

/// One page of query history, newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPage {
    pub items: Vec<QuerySummary>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

/// Handle returned by asynchronous submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryHandle {
    pub query_id: QueryId,
    pub status: QueryStatus,
}
