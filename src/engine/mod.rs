//! Statistical test engine.
//!
//! Turns collected site aggregates into descriptive summaries, t-tests,
//! chi-square tests and ANOVA. Every formula here works from `n`, sums
//! and counts only; raw records never reach this module.

pub mod aggregate;
pub mod anova;
pub mod chisquare;
pub mod descriptive;
pub mod distributions;
pub mod ttest;

use crate::error::{AnalyticsError, Result};
use crate::models::{QueryParameters, QueryResult, SiteAggregate};
use crate::resolver::{Measurement, QueryPlan};
use aggregate::{combine_groups, ContingencyTable, GroupAggregate};
use std::collections::BTreeMap;

/// Run the test a query asked for over the collected site aggregates.
pub fn run(
    plan: &QueryPlan,
    params: &QueryParameters,
    sites: &BTreeMap<String, SiteAggregate>,
) -> Result<QueryResult> {
    match params {
        QueryParameters::Descriptive(req) => {
            let groups = combine_groups(&plan.scope, sites)?;
            Ok(QueryResult::Descriptive(descriptive::describe(req, &groups)))
        }
        QueryParameters::TTest(req) => {
            let groups = combine_groups(&plan.scope, sites)?;
            let a = find_group(&groups, &req.group_a)?;
            let b = find_group(&groups, &req.group_b)?;
            Ok(QueryResult::TTest(ttest::welch_t_test(req, a, b)?))
        }
        QueryParameters::ChiSquare(req) => {
            let (rows, columns) = match &plan.measurement {
                Measurement::Contingency {
                    row_categories,
                    column_categories,
                    ..
                } => (row_categories.as_slice(), column_categories.as_slice()),
                Measurement::Numeric { .. } => {
                    return Err(AnalyticsError::internal(
                        "chi-square plan is missing a contingency measurement",
                    ))
                }
            };
            let table = ContingencyTable::from_sites(&plan.scope, sites, rows, columns)?;
            Ok(QueryResult::ChiSquare(chisquare::chi_square_test(req, &table)?))
        }
        QueryParameters::Anova(req) => {
            let groups = combine_groups(&plan.scope, sites)?;
            Ok(QueryResult::Anova(anova::one_way_anova(req, &groups)?))
        }
    }
}

fn find_group<'a>(groups: &'a [GroupAggregate], id: &str) -> Result<&'a GroupAggregate> {
    groups
        .iter()
        .find(|g| g.group_id == id)
        .ok_or_else(|| AnalyticsError::internal(format!("group '{}' missing from plan", id)))
}
