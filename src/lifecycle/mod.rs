//! Query lifecycle management.
//!
//! `submit` validates a request against the federation snapshot, records a
//! pending query and spawns a task that collects aggregates and runs the
//! test. Each task owns a cancellation token and an overall deadline;
//! state changes go through the [`QueryRepository`].

pub mod repository;

pub use repository::QueryRepository;

use crate::collector::AggregateCollector;
use crate::engine;
use crate::error::{AnalyticsError, ErrorKind, Result};
use crate::models::{
    AnalyticsQuery, QueryHandle, QueryId, QueryPage, QueryParameters, QueryResult, QueryStatus,
    QueryWarning,
};
use crate::resolver::{resolve_query, FederationSnapshot, QueryPlan};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle tuning.
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub query_timeout: Duration,
    pub default_page_size: usize,
    pub max_page_size: usize,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(300),
            default_page_size: 50,
            max_page_size: 200,
        }
    }
}

/// Handles of a query whose task has not finished.
struct Tracked {
    cancel: CancellationToken,
    status: Arc<watch::Sender<QueryStatus>>,
}

struct Inner {
    federations: RwLock<HashMap<String, Arc<FederationSnapshot>>>,
    repository: Arc<QueryRepository>,
    collector: Arc<AggregateCollector>,
    settings: LifecycleSettings,
    tracked: Mutex<HashMap<QueryId, Tracked>>,
}

/// Runs queries asynchronously and answers history lookups.
#[derive(Clone)]
pub struct QueryManager {
    inner: Arc<Inner>,
}

impl QueryManager {
    pub fn new(
        collector: Arc<AggregateCollector>,
        repository: Arc<QueryRepository>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                federations: RwLock::new(HashMap::new()),
                repository,
                collector,
                settings,
                tracked: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register or replace a federation. Running queries keep the snapshot
    /// they started with.
    pub fn register_federation(&self, snapshot: FederationSnapshot) {
        info!(
            "Registered federation {} with {} members",
            snapshot.id,
            snapshot.members.len()
        );
        self.inner
            .federations
            .write()
            .insert(snapshot.id.clone(), Arc::new(snapshot));
    }

    pub fn federation(&self, federation_id: &str) -> Result<Arc<FederationSnapshot>> {
        self.inner
            .federations
            .read()
            .get(federation_id)
            .cloned()
            .ok_or_else(|| {
                AnalyticsError::not_found(format!("Federation '{}' not found", federation_id))
            })
    }

    /// Validate and start a query. Validation errors are returned here and
    /// nothing is recorded.
    pub fn submit(&self, federation_id: &str, parameters: QueryParameters) -> Result<QueryHandle> {
        let snapshot = self.federation(federation_id)?;
        let plan = resolve_query(&snapshot, &parameters)?;

        let query = self.inner.repository.create(federation_id, parameters.clone());
        let id = query.id;
        info!("Submitted {} query {} on federation {}", query.kind, id, federation_id);

        let cancel = CancellationToken::new();
        let (sender, _) = watch::channel(QueryStatus::Pending);
        let status = Arc::new(sender);
        self.inner.tracked.lock().insert(
            id,
            Tracked {
                cancel: cancel.clone(),
                status: status.clone(),
            },
        );

        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.execute(id, snapshot, plan, parameters, cancel).await;
            let final_status = inner
                .repository
                .get(id)
                .map(|q| q.status)
                .unwrap_or(QueryStatus::Failed);
            inner.tracked.lock().remove(&id);
            status.send_replace(final_status);
        });

        Ok(QueryHandle {
            query_id: id,
            status: QueryStatus::Pending,
        })
    }

    /// Current state of a query of this federation.
    pub fn get(&self, federation_id: &str, id: QueryId) -> Result<AnalyticsQuery> {
        self.inner
            .repository
            .get(id)
            .filter(|q| q.federation_id == federation_id)
            .ok_or_else(|| AnalyticsError::not_found(format!("Query {} not found", id)))
    }

    /// History page, newest first.
    pub fn list(
        &self,
        federation_id: &str,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<QueryPage> {
        self.federation(federation_id)?;
        let settings = &self.inner.settings;
        let limit = limit.unwrap_or(settings.default_page_size);
        if limit == 0 {
            return Err(AnalyticsError::validation("limit must be at least 1"));
        }
        let limit = limit.min(settings.max_page_size);
        Ok(self
            .inner
            .repository
            .list(federation_id, limit, offset.unwrap_or(0)))
    }

    /// Cancel a pending or running query. It fails with `Cancelled` at once.
    pub fn cancel(&self, federation_id: &str, id: QueryId) -> Result<AnalyticsQuery> {
        let query = self.get(federation_id, id)?;
        if query.status.is_terminal() {
            return Err(AnalyticsError::new(
                ErrorKind::InvalidTransition,
                format!("Query {} is already {}", id, query.status),
            ));
        }

        let failed = self.inner.repository.fail(id, AnalyticsError::cancelled())?;
        if let Some(tracked) = self.inner.tracked.lock().get(&id) {
            tracked.cancel.cancel();
            tracked.status.send_replace(QueryStatus::Failed);
        }
        info!("Cancelled query {}", id);
        Ok(failed)
    }

    /// Wait until a query reaches a terminal state.
    pub async fn wait(&self, id: QueryId) -> Result<AnalyticsQuery> {
        let mut receiver = self
            .inner
            .tracked
            .lock()
            .get(&id)
            .map(|t| t.status.subscribe());

        loop {
            let query = self
                .inner
                .repository
                .get(id)
                .ok_or_else(|| AnalyticsError::not_found(format!("Query {} not found", id)))?;
            if query.status.is_terminal() {
                return Ok(query);
            }

            match receiver.as_mut() {
                Some(rx) => {
                    if rx.changed().await.is_err() {
                        receiver = None;
                    }
                }
                None => {
                    return Err(AnalyticsError::internal(format!(
                        "Query {} is {} but has no running task",
                        id, query.status
                    )))
                }
            }
        }
    }

    /// Cancel every query still in flight.
    pub fn shutdown(&self) {
        let ids: Vec<QueryId> = self.inner.tracked.lock().keys().copied().collect();
        for id in ids {
            if let Some(query) = self.inner.repository.get(id) {
                if let Err(e) = self.cancel(&query.federation_id, id) {
                    debug!("Query {} finished before shutdown: {}", id, e);
                }
            }
        }
    }
}

impl Inner {
    async fn execute(
        &self,
        id: QueryId,
        snapshot: Arc<FederationSnapshot>,
        plan: QueryPlan,
        parameters: QueryParameters,
        cancel: CancellationToken,
    ) {
        if cancel.is_cancelled() {
            return;
        }
        if let Err(e) = self.repository.mark_running(id) {
            debug!("Query {} did not start: {}", id, e);
            return;
        }
        info!("Query {} running", id);

        let timeout = self.settings.query_timeout;
        let outcome = match tokio::time::timeout(
            timeout,
            self.run(&snapshot, plan, parameters, &cancel),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                cancel.cancel();
                Err(AnalyticsError::new(
                    ErrorKind::Timeout,
                    format!("Query exceeded its {:?} deadline", timeout),
                ))
            }
        };

        let recorded = match outcome {
            Ok((result, warnings)) => {
                if !warnings.is_empty() {
                    warn!("Query {} completed with {} warnings", id, warnings.len());
                }
                self.repository.complete(id, result, warnings)
            }
            Err(e) => {
                if e.kind == ErrorKind::Internal {
                    error!("Query {} failed: {}", id, e);
                } else {
                    info!("Query {} failed: {}", id, e);
                }
                self.repository.fail(id, e)
            }
        };

        match recorded {
            Ok(query) => info!("Query {} is {}", id, query.status),
            Err(e) => debug!("Outcome of query {} discarded: {}", id, e),
        }
    }

    async fn run(
        &self,
        snapshot: &FederationSnapshot,
        plan: QueryPlan,
        parameters: QueryParameters,
        cancel: &CancellationToken,
    ) -> Result<(QueryResult, Vec<QueryWarning>)> {
        let collection = self.collector.collect(snapshot, &plan, cancel).await?;
        let warnings: Vec<QueryWarning> = collection.partial_failure().into_iter().collect();

        let result = tokio::task::spawn_blocking(move || {
            engine::run(&plan, &parameters, &collection.sites)
        })
        .await
        .map_err(|e| AnalyticsError::internal(format!("Test computation aborted: {}", e)))??;

        if cancel.is_cancelled() {
            return Err(AnalyticsError::cancelled());
        }
        Ok((result, warnings))
    }
}
