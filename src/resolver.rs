//! Filter and group resolution.
//!
//! Validates `groupBy`, `groupIds` and free-form filters against a
//! federation membership snapshot and turns a request into a
//! [`QueryPlan`]: the sites to ask, the groups each belongs to, and the
//! typed predicates every site applies before aggregating. Nothing here
//! touches the network.

use crate::error::{AnalyticsError, Result};
use crate::models::{AnalyticsFilter, GroupBy, QueryParameters};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Declared type of a federation variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum VariableSpec {
    Numeric,
    Categorical {
        /// Known levels. Empty means "whatever the sites report".
        #[serde(default)]
        categories: Vec<String>,
    },
}

impl VariableSpec {
    pub fn is_numeric(&self) -> bool {
        matches!(self, VariableSpec::Numeric)
    }

    fn type_name(&self) -> &'static str {
        match self {
            VariableSpec::Numeric => "numeric",
            VariableSpec::Categorical { .. } => "categorical",
        }
    }
}

/// One participating site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederationMember {
    pub id: String,
    pub endpoint: String,
    #[serde(default)]
    pub device_groups: Vec<String>,
}

/// Read-only membership snapshot used for the lifetime of a query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FederationSnapshot {
    pub id: String,
    pub members: Vec<FederationMember>,
    pub variables: BTreeMap<String, VariableSpec>,
}

impl FederationSnapshot {
    pub fn member(&self, id: &str) -> Option<&FederationMember> {
        self.members.iter().find(|m| m.id == id)
    }

    /// All group ids available under a grouping.
    pub fn group_ids(&self, group_by: GroupBy) -> BTreeSet<String> {
        match group_by {
            GroupBy::FederationMember => self.members.iter().map(|m| m.id.clone()).collect(),
            GroupBy::DeviceGroup => self
                .members
                .iter()
                .flat_map(|m| m.device_groups.iter().cloned())
                .collect(),
        }
    }

    /// Sites contributing to a group.
    pub fn sites_for_group(&self, group_by: GroupBy, group_id: &str) -> Vec<String> {
        self.members
            .iter()
            .filter(|m| match group_by {
                GroupBy::FederationMember => m.id == group_id,
                GroupBy::DeviceGroup => m.device_groups.iter().any(|g| g == group_id),
            })
            .map(|m| m.id.clone())
            .collect()
    }
}

/// Scalar operand of a filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Number(f64),
    Bool(bool),
    Text(String),
}

/// Typed filter predicate, one variant per supported operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FilterPredicate {
    Eq { value: FilterValue },
    Ne { value: FilterValue },
    Gt { value: f64 },
    Gte { value: f64 },
    Lt { value: f64 },
    Lte { value: f64 },
    In { values: Vec<FilterValue> },
    Between { low: f64, high: f64 },
}

/// A validated filter, applied identically at every site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedFilter {
    pub field: String,
    #[serde(flatten)]
    pub predicate: FilterPredicate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedGroup {
    pub id: String,
    pub sites: Vec<String>,
}

/// Output of resolution: which groups, which sites, which filters.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedScope {
    pub federation_id: String,
    pub group_by: GroupBy,
    pub groups: Vec<ResolvedGroup>,
    pub filters: Vec<ResolvedFilter>,
}

impl ResolvedScope {
    /// Distinct sites across all groups.
    pub fn sites(&self) -> BTreeSet<String> {
        self.groups
            .iter()
            .flat_map(|g| g.sites.iter().cloned())
            .collect()
    }

    /// Groups of this scope a site contributes to.
    pub fn groups_for_site(&self, site_id: &str) -> Vec<String> {
        self.groups
            .iter()
            .filter(|g| g.sites.iter().any(|s| s == site_id))
            .map(|g| g.id.clone())
            .collect()
    }

    pub fn group_ids(&self) -> Vec<String> {
        self.groups.iter().map(|g| g.id.clone()).collect()
    }
}

/// What each site is asked to measure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Measurement {
    /// Count, sum, sum of squares (and optionally a sketch) of one variable.
    Numeric {
        variable: String,
        include_sketch: bool,
    },
    /// Cross-tabulated counts of two categorical variables. Declared
    /// levels fix the table shape; empty means "as reported".
    Contingency {
        row_variable: String,
        column_variable: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        row_categories: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        column_categories: Vec<String>,
    },
}

/// Fully validated execution plan for one query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub scope: ResolvedScope,
    pub measurement: Measurement,
}

/// Resolve `groupBy` / `groupIds` / `filters` into a scope.
pub fn resolve(
    snapshot: &FederationSnapshot,
    group_by: GroupBy,
    group_ids: Option<&[String]>,
    filters: Option<&[AnalyticsFilter]>,
) -> Result<ResolvedScope> {
    let available = snapshot.group_ids(group_by);

    let selected: Vec<String> = match group_ids {
        Some(ids) => {
            if ids.is_empty() {
                return Err(AnalyticsError::validation("groupIds must not be empty"));
            }
            let mut seen = BTreeSet::new();
            for id in ids {
                if !seen.insert(id.as_str()) {
                    return Err(AnalyticsError::validation(format!(
                        "Group '{}' is listed more than once",
                        id
                    )));
                }
                if !available.contains(id) {
                    return Err(AnalyticsError::unknown_group(id));
                }
            }
            ids.to_vec()
        }
        None => available.into_iter().collect(),
    };

    let groups: Vec<ResolvedGroup> = selected
        .into_iter()
        .map(|id| ResolvedGroup {
            sites: snapshot.sites_for_group(group_by, &id),
            id,
        })
        .collect();

    if groups.iter().all(|g| g.sites.is_empty()) {
        return Err(AnalyticsError::validation(format!(
            "Federation '{}' has no sites for the requested groups",
            snapshot.id
        )));
    }

    let filters = filters
        .unwrap_or_default()
        .iter()
        .map(|f| resolve_filter(snapshot, f))
        .collect::<Result<Vec<_>>>()?;

    Ok(ResolvedScope {
        federation_id: snapshot.id.clone(),
        group_by,
        groups,
        filters,
    })
}

/// Validate one wire filter into a typed predicate.
pub fn resolve_filter(snapshot: &FederationSnapshot, filter: &AnalyticsFilter) -> Result<ResolvedFilter> {
    let field = filter.field.trim();
    if field.is_empty() {
        return Err(AnalyticsError::invalid_filter("Filter field must not be empty"));
    }

    let spec = snapshot.variables.get(field).ok_or_else(|| {
        AnalyticsError::invalid_filter(format!("Unknown filter field '{}'", field))
    })?;

    let operator = filter.operator.trim().to_lowercase();
    let predicate = match operator.as_str() {
        "eq" | "=" | "==" => FilterPredicate::Eq {
            value: scalar_for(spec, field, &filter.value)?,
        },
        "ne" | "!=" | "<>" => FilterPredicate::Ne {
            value: scalar_for(spec, field, &filter.value)?,
        },
        "gt" | ">" => FilterPredicate::Gt {
            value: ordered_number(spec, field, &operator, &filter.value)?,
        },
        "gte" | ">=" => FilterPredicate::Gte {
            value: ordered_number(spec, field, &operator, &filter.value)?,
        },
        "lt" | "<" => FilterPredicate::Lt {
            value: ordered_number(spec, field, &operator, &filter.value)?,
        },
        "lte" | "<=" => FilterPredicate::Lte {
            value: ordered_number(spec, field, &operator, &filter.value)?,
        },
        "in" => {
            let items = filter.value.as_array().ok_or_else(|| {
                AnalyticsError::invalid_filter(format!("'in' on '{}' needs an array value", field))
            })?;
            if items.is_empty() {
                return Err(AnalyticsError::invalid_filter(format!(
                    "'in' on '{}' needs at least one value",
                    field
                )));
            }
            let values = items
                .iter()
                .map(|v| scalar_for(spec, field, v))
                .collect::<Result<Vec<_>>>()?;
            FilterPredicate::In { values }
        }
        "between" => {
            let bounds = filter.value.as_array().filter(|a| a.len() == 2).ok_or_else(|| {
                AnalyticsError::invalid_filter(format!(
                    "'between' on '{}' needs a [low, high] array",
                    field
                ))
            })?;
            let low = ordered_number(spec, field, &operator, &bounds[0])?;
            let high = ordered_number(spec, field, &operator, &bounds[1])?;
            if low > high {
                return Err(AnalyticsError::invalid_filter(format!(
                    "'between' on '{}' has low {} above high {}",
                    field, low, high
                )));
            }
            FilterPredicate::Between { low, high }
        }
        other => {
            return Err(AnalyticsError::invalid_filter(format!(
                "Unsupported filter operator '{}'",
                other
            )))
        }
    };

    Ok(ResolvedFilter {
        field: field.to_string(),
        predicate,
    })
}

/// Equality operand: numbers for numeric fields, strings/bools for categorical ones.
fn scalar_for(spec: &VariableSpec, field: &str, value: &Value) -> Result<FilterValue> {
    match (spec, value) {
        (VariableSpec::Numeric, Value::Number(n)) => n
            .as_f64()
            .map(FilterValue::Number)
            .ok_or_else(|| AnalyticsError::invalid_filter(format!("Bad number for '{}'", field))),
        (VariableSpec::Categorical { categories }, Value::String(s)) => {
            if !categories.is_empty() && !categories.contains(s) {
                return Err(AnalyticsError::invalid_filter(format!(
                    "'{}' is not a category of '{}'",
                    s, field
                )));
            }
            Ok(FilterValue::Text(s.clone()))
        }
        (VariableSpec::Categorical { .. }, Value::Bool(b)) => Ok(FilterValue::Bool(*b)),
        (spec, other) => Err(AnalyticsError::invalid_filter(format!(
            "Value {} does not fit {} field '{}'",
            other,
            spec.type_name(),
            field
        ))),
    }
}

/// Ordering operands only make sense on numeric fields.
fn ordered_number(spec: &VariableSpec, field: &str, operator: &str, value: &Value) -> Result<f64> {
    if !spec.is_numeric() {
        return Err(AnalyticsError::invalid_filter(format!(
            "Operator '{}' is not supported on categorical field '{}'",
            operator, field
        )));
    }
    value.as_f64().ok_or_else(|| {
        AnalyticsError::invalid_filter(format!(
            "Operator '{}' on '{}' needs a numeric value, got {}",
            operator, field, value
        ))
    })
}

/// Look up a variable and check its declared type.
pub fn resolve_variable<'a>(
    snapshot: &'a FederationSnapshot,
    name: &str,
    numeric: bool,
) -> Result<&'a VariableSpec> {
    let spec = snapshot.variables.get(name).ok_or_else(|| {
        AnalyticsError::validation(format!(
            "Unknown variable '{}' in federation '{}'",
            name, snapshot.id
        ))
    })?;

    if spec.is_numeric() != numeric {
        return Err(AnalyticsError::validation(format!(
            "Variable '{}' is {}, this test needs a {} variable",
            name,
            spec.type_name(),
            if numeric { "numeric" } else { "categorical" }
        )));
    }

    Ok(spec)
}

fn categories_of(spec: &VariableSpec) -> Vec<String> {
    match spec {
        VariableSpec::Categorical { categories } => categories.clone(),
        VariableSpec::Numeric => Vec::new(),
    }
}

/// Confidence levels must lie strictly between 0 and 1.
pub fn validate_confidence_level(level: f64) -> Result<f64> {
    if level.is_finite() && level > 0.0 && level < 1.0 {
        Ok(level)
    } else {
        Err(AnalyticsError::validation(format!(
            "confidenceLevel must be in (0, 1), got {}",
            level
        )))
    }
}

/// Validate a whole request and build its execution plan.
pub fn resolve_query(snapshot: &FederationSnapshot, params: &QueryParameters) -> Result<QueryPlan> {
    if let Some(level) = params.confidence_level() {
        validate_confidence_level(level)?;
    }

    match params {
        QueryParameters::Descriptive(req) => {
            resolve_variable(snapshot, &req.variable, true)?;
            let scope = resolve(
                snapshot,
                req.group_by,
                req.group_ids.as_deref(),
                req.filters.as_deref(),
            )?;
            Ok(QueryPlan {
                scope,
                measurement: Measurement::Numeric {
                    variable: req.variable.clone(),
                    include_sketch: req.include_percentiles,
                },
            })
        }
        QueryParameters::TTest(req) => {
            resolve_variable(snapshot, &req.variable, true)?;
            if req.group_a == req.group_b {
                return Err(AnalyticsError::validation(
                    "groupA and groupB must be different groups",
                ));
            }
            let pair = [req.group_a.clone(), req.group_b.clone()];
            let scope = resolve(snapshot, req.group_by, Some(&pair), req.filters.as_deref())?;
            Ok(QueryPlan {
                scope,
                measurement: Measurement::Numeric {
                    variable: req.variable.clone(),
                    include_sketch: false,
                },
            })
        }
        QueryParameters::ChiSquare(req) => {
            if req.variable1 == req.variable2 {
                return Err(AnalyticsError::validation(
                    "variable1 and variable2 must be different variables",
                ));
            }
            let rows = categories_of(resolve_variable(snapshot, &req.variable1, false)?);
            let columns = categories_of(resolve_variable(snapshot, &req.variable2, false)?);
            let scope = resolve(
                snapshot,
                req.group_by,
                req.group_ids.as_deref(),
                req.filters.as_deref(),
            )?;
            Ok(QueryPlan {
                scope,
                measurement: Measurement::Contingency {
                    row_variable: req.variable1.clone(),
                    column_variable: req.variable2.clone(),
                    row_categories: rows,
                    column_categories: columns,
                },
            })
        }
        QueryParameters::Anova(req) => {
            resolve_variable(snapshot, &req.variable, true)?;
            let scope = resolve(
                snapshot,
                req.group_by,
                req.group_ids.as_deref(),
                req.filters.as_deref(),
            )?;
            Ok(QueryPlan {
                scope,
                measurement: Measurement::Numeric {
                    variable: req.variable.clone(),
                    include_sketch: false,
                },
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::{ChiSquareRequest, TTestRequest};
    use crate::testing::snapshot;
    use serde_json::json;

    fn filter(field: &str, operator: &str, value: Value) -> AnalyticsFilter {
        AnalyticsFilter {
            field: field.to_string(),
            operator: operator.to_string(),
            value,
        }
    }

    #[test]
    fn test_resolve_all_device_groups() {
        let scope = resolve(&snapshot(), GroupBy::DeviceGroup, None, None).unwrap();
        assert_eq!(scope.group_ids(), vec!["android", "ios"]);
        assert_eq!(scope.sites().len(), 3);
        assert_eq!(scope.groups_for_site("site-a"), vec!["android", "ios"]);
        assert_eq!(scope.groups_for_site("site-b"), vec!["ios"]);
    }

    #[test]
    fn test_resolve_members() {
        let ids = vec!["site-b".to_string()];
        let scope = resolve(&snapshot(), GroupBy::FederationMember, Some(&ids), None).unwrap();
        assert_eq!(scope.groups.len(), 1);
        assert_eq!(scope.groups[0].sites, vec!["site-b"]);
    }

    #[test]
    fn test_unknown_group() {
        let ids = vec!["windows".to_string()];
        let err = resolve(&snapshot(), GroupBy::DeviceGroup, Some(&ids), None).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownGroup);

        // A device group id is not a member id.
        let ids = vec!["ios".to_string()];
        let err = resolve(&snapshot(), GroupBy::FederationMember, Some(&ids), None).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownGroup);
    }

    #[test]
    fn test_duplicate_and_empty_group_ids() {
        let ids = vec!["ios".to_string(), "ios".to_string()];
        let err = resolve(&snapshot(), GroupBy::DeviceGroup, Some(&ids), None).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValidationError);

        let err = resolve(&snapshot(), GroupBy::DeviceGroup, Some(&[]), None).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValidationError);
    }

    #[test]
    fn test_filters_resolve_to_predicates() {
        let snap = snapshot();
        let f = resolve_filter(&snap, &filter("age", ">=", json!(18))).unwrap();
        assert_eq!(f.predicate, FilterPredicate::Gte { value: 18.0 });

        let f = resolve_filter(&snap, &filter("age", "between", json!([18, 65]))).unwrap();
        assert_eq!(f.predicate, FilterPredicate::Between { low: 18.0, high: 65.0 });

        let f = resolve_filter(&snap, &filter("smoker", "IN", json!(["yes"]))).unwrap();
        assert_eq!(
            f.predicate,
            FilterPredicate::In {
                values: vec![FilterValue::Text("yes".to_string())]
            }
        );

        let f = resolve_filter(&snap, &filter("region", "eq", json!("north"))).unwrap();
        assert_eq!(
            f.predicate,
            FilterPredicate::Eq {
                value: FilterValue::Text("north".to_string())
            }
        );
    }

    #[test]
    fn test_invalid_filters() {
        let snap = snapshot();
        let cases = vec![
            filter("height", "eq", json!(1)),
            filter("age", "like", json!("1%")),
            filter("age", "gt", json!("old")),
            filter("smoker", "gt", json!(1)),
            filter("smoker", "eq", json!("sometimes")),
            filter("age", "in", json!([])),
            filter("age", "in", json!(5)),
            filter("age", "between", json!([65, 18])),
            filter("age", "between", json!([1, 2, 3])),
            filter("age", "eq", json!(null)),
            filter(" ", "eq", json!(1)),
        ];
        for case in cases {
            let err = resolve_filter(&snap, &case).unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidFilter, "case {:?}", case);
        }
    }

    #[test]
    fn test_filter_wire_form() {
        let f = resolve_filter(&snapshot(), &filter("age", "lt", json!(40))).unwrap();
        let json = serde_json::to_value(&f).unwrap();
        assert_eq!(json, json!({"field": "age", "op": "lt", "value": 40.0}));
    }

    #[test]
    fn test_resolve_query_checks_variable_types() {
        let snap = snapshot();
        let params = QueryParameters::ChiSquare(ChiSquareRequest {
            variable1: "smoker".to_string(),
            variable2: "age".to_string(),
            group_by: GroupBy::DeviceGroup,
            group_ids: None,
            confidence_level: 0.95,
            filters: None,
        });
        let err = resolve_query(&snap, &params).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValidationError);
    }

    #[test]
    fn test_resolve_ttest_plan() {
        let snap = snapshot();
        let mut req = TTestRequest {
            variable: "age".to_string(),
            group_a: "ios".to_string(),
            group_b: "android".to_string(),
            group_by: GroupBy::DeviceGroup,
            confidence_level: 0.95,
            filters: None,
        };
        let plan = resolve_query(&snap, &QueryParameters::TTest(req.clone())).unwrap();
        assert_eq!(plan.scope.group_ids(), vec!["ios", "android"]);

        req.confidence_level = 1.0;
        let err = resolve_query(&snap, &QueryParameters::TTest(req.clone())).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValidationError);

        req.confidence_level = 0.9;
        req.group_b = "ios".to_string();
        let err = resolve_query(&snap, &QueryParameters::TTest(req)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValidationError);
    }
}
