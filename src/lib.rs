//! fedstat - federated analytics query engine
//!
//! Statistical tests (descriptive statistics, Welch t-test, chi-square
//! independence, one-way ANOVA) computed over a federation of sites.
//! Sites answer with per-group partial aggregates only; the engine merges
//! them and runs the test on the combined summaries.
//!
//! The flow of one query:
//!   1. [`resolver`] validates the request against a federation snapshot
//!   2. [`collector`] fetches partial aggregates from every site in scope
//!   3. [`engine`] merges the partials and computes the statistic
//!   4. [`lifecycle`] tracks the query from pending to completed or failed

pub mod api;
pub mod cli;
pub mod collector;
pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod models;
pub mod report;
pub mod resolver;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{AnalyticsService, ApiResponse};
pub use error::{AnalyticsError, ErrorKind};
pub use lifecycle::{QueryManager, QueryRepository};
