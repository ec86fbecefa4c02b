//! Aggregate collection.
//!
//! Dispatches one request per resolved site in parallel, bounded by a
//! semaphore shared by every query. Each fetch has its own deadline and
//! gets one retry on a transient failure. Sites that still fail are
//! excluded; the collection proceeds only while the excluded share stays
//! under the configured threshold.

pub mod client;

pub use client::{HttpSiteClient, SiteClient, SiteError, SiteRequest};

use crate::error::{ensure_finite, AnalyticsError, ErrorKind, Result};
use crate::models::{ExcludedSite, QueryWarning, SiteAggregate};
use crate::resolver::{FederationSnapshot, QueryPlan};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Collector tuning.
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    /// Site fetches in flight across all queries.
    pub max_concurrent_fetches: usize,
    pub site_timeout: Duration,
    /// Collection fails once `excluded / total` reaches this value.
    pub max_excluded_fraction: f64,
    /// Pause before the single retry.
    pub retry_delay: Duration,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 8,
            site_timeout: Duration::from_secs(30),
            max_excluded_fraction: 0.5,
            retry_delay: Duration::from_millis(200),
        }
    }
}

/// Site aggregates gathered for one query.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    pub sites: BTreeMap<String, SiteAggregate>,
    pub excluded: Vec<ExcludedSite>,
    pub total_sites: usize,
}

impl Collection {
    /// `PartialFailure` warning naming every excluded site, if any.
    pub fn partial_failure(&self) -> Option<QueryWarning> {
        if self.excluded.is_empty() {
            return None;
        }
        Some(QueryWarning {
            kind: ErrorKind::PartialFailure,
            message: format!(
                "{} of {} sites were excluded from the result",
                self.excluded.len(),
                self.total_sites
            ),
            excluded_sites: self.excluded.clone(),
        })
    }
}

enum SiteOutcome {
    Answered(SiteAggregate),
    Excluded(ExcludedSite),
}

/// Fetches site aggregates for queries.
pub struct AggregateCollector {
    client: Arc<dyn SiteClient>,
    permits: Arc<Semaphore>,
    settings: CollectorSettings,
}

impl AggregateCollector {
    pub fn new(client: Arc<dyn SiteClient>, settings: CollectorSettings) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent_fetches.max(1)));
        Self {
            client,
            permits,
            settings,
        }
    }

    /// Collect aggregates from every site in the plan's scope.
    ///
    /// Returns `Cancelled` as soon as `cancel` fires; dropping the pending
    /// fetches aborts their requests.
    pub async fn collect(
        &self,
        snapshot: &FederationSnapshot,
        plan: &QueryPlan,
        cancel: &CancellationToken,
    ) -> Result<Collection> {
        let site_ids = plan.scope.sites();
        let total_sites = site_ids.len();
        info!(
            "Collecting aggregates from {} sites of federation {}",
            total_sites, snapshot.id
        );

        let mut pending: FuturesUnordered<_> = site_ids
            .iter()
            .map(|site_id| {
                let request = SiteRequest {
                    federation_id: snapshot.id.clone(),
                    measurement: plan.measurement.clone(),
                    group_by: plan.scope.group_by,
                    groups: plan.scope.groups_for_site(site_id),
                    filters: plan.scope.filters.clone(),
                };
                self.fetch_site(snapshot, site_id.clone(), request)
            })
            .collect();

        let mut collection = Collection {
            total_sites,
            ..Default::default()
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Collection cancelled with {} fetches pending", pending.len());
                    return Err(AnalyticsError::cancelled());
                }
                next = pending.next() => match next {
                    Some(SiteOutcome::Answered(aggregate)) => {
                        collection.sites.insert(aggregate.site_id.clone(), aggregate);
                    }
                    Some(SiteOutcome::Excluded(site)) => {
                        warn!("Excluding site {}: {}", site.site_id, site.reason);
                        collection.excluded.push(site);
                    }
                    None => break,
                }
            }
        }

        collection.excluded.sort_by(|a, b| a.site_id.cmp(&b.site_id));
        self.check_threshold(&collection)?;
        Ok(collection)
    }

    fn check_threshold(&self, collection: &Collection) -> Result<()> {
        let excluded = collection.excluded.len();
        let total = collection.total_sites;
        let fraction = if total == 0 {
            1.0
        } else {
            excluded as f64 / total as f64
        };

        if collection.sites.is_empty() || fraction >= self.settings.max_excluded_fraction {
            let reasons: Vec<String> = collection
                .excluded
                .iter()
                .map(|s| format!("{} ({})", s.site_id, s.reason))
                .collect();
            return Err(AnalyticsError::new(
                ErrorKind::InsufficientSites,
                format!(
                    "{} of {} sites excluded, need fewer than {:.0}%: {}",
                    excluded,
                    total,
                    self.settings.max_excluded_fraction * 100.0,
                    reasons.join(", ")
                ),
            ));
        }
        Ok(())
    }

    async fn fetch_site(
        &self,
        snapshot: &FederationSnapshot,
        site_id: String,
        request: SiteRequest,
    ) -> SiteOutcome {
        let exclude = |reason: String| {
            SiteOutcome::Excluded(ExcludedSite {
                site_id: site_id.clone(),
                reason,
            })
        };

        let Some(member) = snapshot.member(&site_id) else {
            return exclude("not a member of the federation".to_string());
        };

        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => return exclude("collector is shutting down".to_string()),
        };

        let timeout = self.settings.site_timeout;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::time::timeout(timeout, self.client.fetch(member, &request)).await;

            let error = match result {
                Err(_) => {
                    return exclude(format!("{}: no answer within {:?}", ErrorKind::Timeout, timeout))
                }
                Ok(Ok(aggregate)) => {
                    return match validate_site_aggregate(&site_id, &aggregate) {
                        Ok(()) => {
                            debug!("Site {} answered on attempt {}", site_id, attempt);
                            SiteOutcome::Answered(aggregate)
                        }
                        Err(e) => exclude(e.to_string()),
                    };
                }
                Ok(Err(error)) => error,
            };

            if error.transient && attempt == 1 {
                debug!("Retrying site {} after transient failure: {}", site_id, error);
                tokio::time::sleep(self.settings.retry_delay).await;
                continue;
            }
            return exclude(error.to_string());
        }
    }
}

/// Reject answers for another site and any non-finite numbers.
fn validate_site_aggregate(site_id: &str, aggregate: &SiteAggregate) -> Result<()> {
    if aggregate.site_id != site_id {
        return Err(AnalyticsError::corrupt(format!(
            "answer is labelled as site '{}'",
            aggregate.site_id
        )));
    }
    for (group, partial) in &aggregate.groups {
        let check = |value: f64, what: &str| ensure_finite(value, &format!("{} of group '{}'", what, group));
        check(partial.sum, "sum")?;
        check(partial.sum_squares, "sumSquares")?;
        if let Some(min) = partial.min {
            check(min, "min")?;
        }
        if let Some(max) = partial.max {
            check(max, "max")?;
        }
        if let Some(ref sketch) = partial.sketch {
            for centroid in &sketch.centroids {
                check(centroid.mean, "sketch mean")?;
                check(centroid.weight, "sketch weight")?;
            }
        }
    }
    Ok(())
}
