//! Owned query store.
//!
//! The repository is the only place query state changes. Every change goes
//! through a guarded transition, so a completed or failed query can never be
//! touched again. History can optionally be mirrored to a JSON file.

use crate::error::{AnalyticsError, ErrorKind, Result};
use crate::models::{
    AnalyticsQuery, QueryId, QueryPage, QueryParameters, QueryResult, QueryStatus, QueryWarning,
    StatusChange,
};
use anyhow::Context;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// On-disk layout of the history file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryFile {
    queries: Vec<AnalyticsQuery>,
}

struct Store {
    queries: HashMap<QueryId, AnalyticsQuery>,
    next_sequence: u64,
    /// Bumped on every change; orders history snapshots.
    version: u64,
}

/// Single writer of the history file. A snapshot is only written when it
/// is newer than the last one on disk.
struct HistoryWriter {
    path: PathBuf,
    written: Mutex<u64>,
}

impl HistoryWriter {
    fn write(&self, version: u64, queries: Vec<AnalyticsQuery>) {
        let mut written = self.written.lock();
        if version <= *written {
            return;
        }
        match self.write_file(queries) {
            Ok(()) => *written = version,
            Err(e) => warn!("Failed to persist query history: {:#}", e),
        }
    }

    fn write_file(&self, queries: Vec<AnalyticsQuery>) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(&HistoryFile { queries })
            .context("Failed to serialize query history")?;

        let dir = match self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(parent) => {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
                parent
            }
            None => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create a temporary file in {}", dir.display()))?;
        tmp.write_all(content.as_bytes())
            .context("Failed to write query history")?;
        tmp.persist(&self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

pub struct QueryRepository {
    store: RwLock<Store>,
    writer: Option<Arc<HistoryWriter>>,
}

impl QueryRepository {
    /// Repository that keeps history in memory only.
    pub fn in_memory() -> Self {
        Self {
            store: RwLock::new(Store {
                queries: HashMap::new(),
                next_sequence: 0,
                version: 0,
            }),
            writer: None,
        }
    }

    /// Repository backed by a JSON history file, created on first write.
    ///
    /// Queries that were still pending or running when the file was written
    /// are failed as interrupted.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let mut history = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read history file: {}", path.display()))?;
            serde_json::from_str::<HistoryFile>(&content)
                .with_context(|| format!("Failed to parse history file: {}", path.display()))?
        } else {
            HistoryFile::default()
        };

        let mut interrupted = 0;
        let now = Utc::now();
        for query in history.queries.iter_mut().filter(|q| !q.status.is_terminal()) {
            query.status = QueryStatus::Failed;
            query.completed_at = Some(now);
            query.result = None;
            query.error = Some(AnalyticsError::new(
                ErrorKind::Cancelled,
                "Query was interrupted before completion",
            ));
            query.status_history.push(StatusChange {
                status: QueryStatus::Failed,
                at: now,
            });
            interrupted += 1;
        }

        let next_sequence = history
            .queries
            .iter()
            .map(|q| q.sequence + 1)
            .max()
            .unwrap_or(0);
        info!(
            "Loaded {} queries from {} ({} interrupted)",
            history.queries.len(),
            path.display(),
            interrupted
        );

        let repository = Self {
            store: RwLock::new(Store {
                queries: history.queries.into_iter().map(|q| (q.id, q)).collect(),
                next_sequence,
                version: 0,
            }),
            writer: Some(Arc::new(HistoryWriter {
                path: path.to_path_buf(),
                written: Mutex::new(0),
            })),
        };
        if interrupted > 0 {
            repository.store.write().version += 1;
            repository.flush();
        }
        Ok(repository)
    }

    /// Record a new pending query.
    pub fn create(&self, federation_id: &str, parameters: QueryParameters) -> AnalyticsQuery {
        let query = {
            let mut store = self.store.write();
            let sequence = store.next_sequence;
            store.next_sequence += 1;
            store.version += 1;
            let query = AnalyticsQuery::new(federation_id.to_string(), parameters, sequence);
            store.queries.insert(query.id, query.clone());
            query
        };
        self.persist();
        query
    }

    pub fn get(&self, id: QueryId) -> Option<AnalyticsQuery> {
        self.store.read().queries.get(&id).cloned()
    }

    /// `pending -> running`.
    pub fn mark_running(&self, id: QueryId) -> Result<AnalyticsQuery> {
        self.transition(id, QueryStatus::Running, |query| {
            query.started_at = Some(Utc::now());
        })
    }

    /// `running -> completed`, attaching the result and any warnings.
    pub fn complete(
        &self,
        id: QueryId,
        result: QueryResult,
        warnings: Vec<QueryWarning>,
    ) -> Result<AnalyticsQuery> {
        self.transition(id, QueryStatus::Completed, move |query| {
            query.completed_at = Some(Utc::now());
            query.result = Some(result);
            query.warnings = warnings;
        })
    }

    /// `pending | running -> failed`.
    pub fn fail(&self, id: QueryId, error: AnalyticsError) -> Result<AnalyticsQuery> {
        self.transition(id, QueryStatus::Failed, move |query| {
            query.completed_at = Some(Utc::now());
            query.result = None;
            query.error = Some(error);
        })
    }

    fn transition<F>(&self, id: QueryId, to: QueryStatus, apply: F) -> Result<AnalyticsQuery>
    where
        F: FnOnce(&mut AnalyticsQuery),
    {
        let updated = {
            let mut store = self.store.write();
            let version = store.version + 1;
            let query = store
                .queries
                .get_mut(&id)
                .ok_or_else(|| AnalyticsError::not_found(format!("Query {} not found", id)))?;

            if !is_allowed(query.status, to) {
                return Err(AnalyticsError::new(
                    ErrorKind::InvalidTransition,
                    format!("Query {} cannot go from {} to {}", id, query.status, to),
                ));
            }

            apply(query);
            query.status = to;
            query.status_history.push(StatusChange {
                status: to,
                at: Utc::now(),
            });
            let updated = query.clone();
            store.version = version;
            updated
        };

        debug!("Query {} is now {}", id, to);
        self.persist();
        Ok(updated)
    }

    /// One page of a federation's history, newest first. Ties on creation
    /// time fall back to submission order.
    pub fn list(&self, federation_id: &str, limit: usize, offset: usize) -> QueryPage {
        let store = self.store.read();
        let mut matching: Vec<&AnalyticsQuery> = store
            .queries
            .values()
            .filter(|q| q.federation_id == federation_id)
            .collect();
        matching.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.sequence.cmp(&a.sequence))
        });

        let total = matching.len();
        let items = matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|q| q.summary())
            .collect();

        QueryPage {
            items,
            total,
            limit,
            offset,
        }
    }

    /// Write the history file now, on the calling thread. Returns once the
    /// latest state is on disk (or the write failed and was logged).
    pub fn flush(&self) {
        if let Some((writer, version, queries)) = self.snapshot() {
            writer.write(version, queries);
        }
    }

    /// Mirror the current state to the history file. Inside a tokio runtime
    /// the write runs on the blocking pool. Failures are logged, not
    /// propagated: the in-memory state stays authoritative.
    fn persist(&self) {
        let Some((writer, version, queries)) = self.snapshot() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || writer.write(version, queries));
            }
            Err(_) => writer.write(version, queries),
        }
    }

    fn snapshot(&self) -> Option<(Arc<HistoryWriter>, u64, Vec<AnalyticsQuery>)> {
        let writer = self.writer.clone()?;
        let store = self.store.read();
        let mut queries: Vec<AnalyticsQuery> = store.queries.values().cloned().collect();
        queries.sort_by_key(|q| q.sequence);
        Some((writer, store.version, queries))
    }
}

fn is_allowed(from: QueryStatus, to: QueryStatus) -> bool {
    matches!(
        (from, to),
        (QueryStatus::Pending, QueryStatus::Running)
            | (QueryStatus::Running, QueryStatus::Completed)
            | (QueryStatus::Pending, QueryStatus::Failed)
            | (QueryStatus::Running, QueryStatus::Failed)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DescriptiveRequest, DescriptiveResult, GroupBy, GroupSummary};
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn params() -> QueryParameters {
        QueryParameters::Descriptive(DescriptiveRequest {
            variable: "age".to_string(),
            group_by: GroupBy::DeviceGroup,
            group_ids: None,
            include_percentiles: false,
            filters: None,
        })
    }

    fn result() -> QueryResult {
        let summary = GroupSummary {
            group_id: "overall".to_string(),
            n: 0,
            mean: None,
            variance: None,
            std_dev: None,
            min: None,
            max: None,
            percentiles: None,
        };
        QueryResult::Descriptive(DescriptiveResult {
            variable: "age".to_string(),
            group_by: GroupBy::DeviceGroup,
            groups: vec![],
            overall: summary,
            percentiles_approximate: false,
        })
    }

    #[test]
    fn test_happy_path_history() {
        let repo = QueryRepository::in_memory();
        let query = repo.create("fed", params());
        repo.mark_running(query.id).unwrap();
        let done = repo.complete(query.id, result(), vec![]).unwrap();

        let statuses: Vec<QueryStatus> = done.status_history.iter().map(|c| c.status).collect();
        assert_eq!(
            statuses,
            vec![QueryStatus::Pending, QueryStatus::Running, QueryStatus::Completed]
        );
        assert!(done.result.is_some());
        assert!(done.error.is_none());
        assert!(done.started_at.is_some());
        assert!(done.completed_at.is_some());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let repo = QueryRepository::in_memory();
        let query = repo.create("fed", params());
        repo.fail(query.id, AnalyticsError::cancelled()).unwrap();

        for err in [
            repo.mark_running(query.id).unwrap_err(),
            repo.complete(query.id, result(), vec![]).unwrap_err(),
            repo.fail(query.id, AnalyticsError::internal("again")).unwrap_err(),
        ] {
            assert_eq!(err.kind, ErrorKind::InvalidTransition);
        }

        let stored = repo.get(query.id).unwrap();
        assert_eq!(stored.error.unwrap().kind, ErrorKind::Cancelled);
        assert_eq!(stored.status_history.len(), 2);
    }

    #[test]
    fn test_pending_cannot_complete() {
        let repo = QueryRepository::in_memory();
        let query = repo.create("fed", params());
        let err = repo.complete(query.id, result(), vec![]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidTransition);
    }

    #[test]
    fn test_pages_are_disjoint_and_complete() {
        let repo = QueryRepository::in_memory();
        let mut ids = HashSet::new();
        for _ in 0..7 {
            ids.insert(repo.create("fed", params()).id);
        }
        repo.create("other", params());

        let mut seen = HashSet::new();
        let mut previous_sequence = u64::MAX;
        for offset in (0..7).step_by(3) {
            let page = repo.list("fed", 3, offset);
            assert_eq!(page.total, 7);
            for item in &page.items {
                assert!(seen.insert(item.id), "query listed twice");
                let sequence = repo.get(item.id).unwrap().sequence;
                assert!(sequence < previous_sequence, "not newest first");
                previous_sequence = sequence;
            }
        }
        assert_eq!(seen, ids);
        assert!(repo.list("fed", 3, 10).items.is_empty());
    }

    #[test]
    fn test_history_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.json");

        let (done, interrupted) = {
            let repo = QueryRepository::open(&path).unwrap();
            let done = repo.create("fed", params());
            repo.mark_running(done.id).unwrap();
            repo.complete(done.id, result(), vec![]).unwrap();
            let interrupted = repo.create("fed", params());
            repo.mark_running(interrupted.id).unwrap();
            (done.id, interrupted.id)
        };

        let repo = QueryRepository::open(&path).unwrap();
        assert_eq!(repo.get(done).unwrap().status, QueryStatus::Completed);

        let lost = repo.get(interrupted).unwrap();
        assert_eq!(lost.status, QueryStatus::Failed);
        assert_eq!(lost.error.unwrap().kind, ErrorKind::Cancelled);

        // New queries continue the submission order.
        let next = repo.create("fed", params());
        assert_eq!(next.sequence, 2);
    }

    #[test]
    fn test_concurrent_transitions_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.json");
        let repo = Arc::new(QueryRepository::open(&path).unwrap());

        let ids: Vec<QueryId> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    let repo = repo.clone();
                    scope.spawn(move || {
                        (0..5)
                            .map(|_| {
                                let query = repo.create("fed", params());
                                repo.mark_running(query.id).unwrap();
                                repo.complete(query.id, result(), vec![]).unwrap();
                                query.id
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            workers
                .into_iter()
                .flat_map(|w| w.join().unwrap())
                .collect()
        });
        drop(repo);

        let reopened = QueryRepository::open(&path).unwrap();
        assert_eq!(reopened.list("fed", 100, 0).total, 40);
        for id in ids {
            let query = reopened.get(id).unwrap();
            assert_eq!(query.status, QueryStatus::Completed, "query {}", id);
            assert!(query.error.is_none());
        }
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1, "stray files {:?}", leftovers);
    }

    #[tokio::test]
    async fn test_flush_inside_runtime() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.json");
        let repo = QueryRepository::open(&path).unwrap();
        let query = repo.create("fed", params());
        repo.mark_running(query.id).unwrap();
        repo.complete(query.id, result(), vec![]).unwrap();
        repo.flush();

        let reopened = QueryRepository::open(&path).unwrap();
        assert_eq!(reopened.get(query.id).unwrap().status, QueryStatus::Completed);
    }
}
