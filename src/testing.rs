//! Shared fixtures for unit tests.

use crate::collector::{SiteClient, SiteError, SiteRequest};
use crate::error::ErrorKind;
use crate::models::{CategoryCount, PartialAggregate, SiteAggregate};
use crate::resolver::{FederationMember, FederationSnapshot, VariableSpec};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Federation "fed": site-a serves ios and android, site-b ios, site-c android.
pub(crate) fn snapshot() -> FederationSnapshot {
    let member = |id: &str, groups: &[&str]| FederationMember {
        id: id.to_string(),
        endpoint: format!("http://{}.local", id),
        device_groups: groups.iter().map(|g| g.to_string()).collect(),
    };

    let mut variables = BTreeMap::new();
    variables.insert("age".to_string(), VariableSpec::Numeric);
    variables.insert(
        "smoker".to_string(),
        VariableSpec::Categorical {
            categories: vec!["yes".to_string(), "no".to_string()],
        },
    );
    variables.insert(
        "region".to_string(),
        VariableSpec::Categorical { categories: vec![] },
    );

    FederationSnapshot {
        id: "fed".to_string(),
        members: vec![
            member("site-a", &["ios", "android"]),
            member("site-b", &["ios"]),
            member("site-c", &["android"]),
        ],
        variables,
    }
}

/// Federation "fed" with `n` members `site-0..`, all in device group "all".
pub(crate) fn wide_snapshot(n: usize) -> FederationSnapshot {
    let mut snap = snapshot();
    snap.members = (0..n)
        .map(|i| FederationMember {
            id: format!("site-{}", i),
            endpoint: format!("http://site-{}.local", i),
            device_groups: vec!["all".to_string()],
        })
        .collect();
    snap
}

/// Partial aggregate with the given count, mean and sample variance.
pub(crate) fn partial(n: u64, mean: f64, variance: f64) -> PartialAggregate {
    let count = n as f64;
    PartialAggregate {
        n,
        sum: count * mean,
        sum_squares: (count - 1.0).max(0.0) * variance + count * mean * mean,
        ..Default::default()
    }
}

/// Partial aggregate carrying contingency counts only.
pub(crate) fn counts(cells: &[(&str, &str, u64)]) -> PartialAggregate {
    PartialAggregate {
        n: cells.iter().map(|c| c.2).sum(),
        category_counts: Some(
            cells
                .iter()
                .map(|(row, column, count)| CategoryCount {
                    row: row.to_string(),
                    column: column.to_string(),
                    count: *count,
                })
                .collect(),
        ),
        ..Default::default()
    }
}

pub(crate) fn site(site_id: &str, groups: &[(&str, PartialAggregate)]) -> SiteAggregate {
    SiteAggregate {
        site_id: site_id.to_string(),
        groups: groups
            .iter()
            .map(|(id, p)| (id.to_string(), p.clone()))
            .collect(),
    }
}

/// What a scripted site does on one call.
#[derive(Debug, Clone)]
pub(crate) enum SiteBehavior {
    Answer(SiteAggregate),
    Slow(Duration, SiteAggregate),
    Fail(SiteError),
    Hang,
}

/// In-memory `SiteClient` replaying a script per site. The last step of
/// a script repeats once the earlier ones are used up.
#[derive(Default)]
pub(crate) struct ScriptedClient {
    scripts: Mutex<HashMap<String, Vec<SiteBehavior>>>,
    calls: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedClient {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn script(self, site_id: &str, steps: Vec<SiteBehavior>) -> Self {
        self.scripts.lock().insert(site_id.to_string(), steps);
        self
    }

    /// Same answer for every member of a snapshot-like list of ids.
    pub(crate) fn answering(site_ids: &[&str], groups: &[(&str, PartialAggregate)]) -> Self {
        site_ids.iter().fold(Self::new(), |client, id| {
            client.script(id, vec![SiteBehavior::Answer(site(id, groups))])
        })
    }

    pub(crate) fn calls(&self, site_id: &str) -> usize {
        self.calls.lock().get(site_id).copied().unwrap_or(0)
    }

    pub(crate) fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_step(&self, site_id: &str) -> SiteBehavior {
        *self.calls.lock().entry(site_id.to_string()).or_default() += 1;
        let mut scripts = self.scripts.lock();
        match scripts.get_mut(site_id) {
            Some(steps) if steps.len() > 1 => steps.remove(0),
            Some(steps) if !steps.is_empty() => steps[0].clone(),
            _ => SiteBehavior::Fail(SiteError::permanent(
                ErrorKind::NotFound,
                format!("no script for {}", site_id),
            )),
        }
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SiteClient for ScriptedClient {
    async fn fetch(
        &self,
        member: &FederationMember,
        _request: &SiteRequest,
    ) -> Result<SiteAggregate, SiteError> {
        let step = self.next_step(&member.id);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        match step {
            SiteBehavior::Answer(aggregate) => Ok(aggregate),
            SiteBehavior::Slow(delay, aggregate) => {
                tokio::time::sleep(delay).await;
                Ok(aggregate)
            }
            SiteBehavior::Fail(error) => Err(error),
            SiteBehavior::Hang => std::future::pending().await,
        }
    }
}
