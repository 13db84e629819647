//! Batch coordinator
//!
//! One run moves through `Idle → Dispatching → Draining → Idle`, or ends in
//! `Terminated` on a run-level error. While dispatching, pages of unprocessed
//! documents are fetched from staging and fanned out to at most `workers`
//! concurrent [`DocumentWorker`]s. Workers push row-sets onto a bounded queue
//! that a single drain task empties in batches. Cancellation stops new pages
//! and unstarted documents; whatever is already queued is still committed.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RunConfig;
use crate::contract::Contract;
use crate::error::{FailureCategory, IngestError};
use crate::persist::{DocumentOutcome, PersistenceEngine};
use crate::scanner::CursorScanner;
use crate::storage::{LedgerStore, StagingSource, TargetStore};
use crate::types::{BatchBounds, DocumentContext};
use crate::worker::{DocumentWorker, QueuedRowSet, WorkerOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Dispatching,
    Draining,
    Terminated,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Dispatching => "dispatching",
            RunState::Draining => "draining",
            RunState::Terminated => "terminated",
        }
    }

    pub fn can_transition_to(self, next: RunState) -> bool {
        matches!(
            (self, next),
            (RunState::Idle, RunState::Dispatching)
                | (RunState::Dispatching, RunState::Draining)
                | (RunState::Dispatching, RunState::Terminated)
                | (RunState::Draining, RunState::Idle)
                | (RunState::Draining, RunState::Terminated)
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-document counters shared by the dispatcher and the drain task
#[derive(Debug, Clone, Default)]
struct Tally {
    succeeded: usize,
    failed: usize,
    rows_per_table: BTreeMap<String, usize>,
    failures_by_category: BTreeMap<FailureCategory, usize>,
}

impl Tally {
    fn record(&mut self, outcome: &DocumentOutcome) {
        match outcome {
            DocumentOutcome::Committed(result) => {
                self.succeeded += 1;
                for (table, count) in &result.rows_per_table {
                    *self.rows_per_table.entry(table.clone()).or_insert(0) += count;
                }
            }
            DocumentOutcome::Failed(failure) => self.record_failure(failure.category),
        }
    }

    fn record_failure(&mut self, category: FailureCategory) {
        self.failed += 1;
        *self.failures_by_category.entry(category).or_insert(0) += 1;
    }

    fn merge(&mut self, other: Tally) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        for (table, count) in other.rows_per_table {
            *self.rows_per_table.entry(table).or_insert(0) += count;
        }
        for (category, count) in other.failures_by_category {
            *self.failures_by_category.entry(category).or_insert(0) += count;
        }
    }
}

#[derive(Debug, Default)]
struct DispatchStats {
    dispatched: usize,
    enqueued: usize,
    fallback_persists: usize,
    not_started: usize,
    final_cursor: Option<i64>,
    cancelled: bool,
    tally: Tally,
}

impl DispatchStats {
    fn absorb(&mut self, outcome: WorkerOutcome) {
        match outcome {
            WorkerOutcome::Enqueued => self.enqueued += 1,
            WorkerOutcome::Fallback(outcome) => {
                self.fallback_persists += 1;
                self.tally.record(&outcome);
            }
            WorkerOutcome::Failed(failure) => self.tally.record_failure(failure.category),
            WorkerOutcome::NotStarted => self.not_started += 1,
        }
    }
}

/// Outcome of one run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Row-sets handed to the drain task
    pub queued: usize,
    /// Documents persisted by their worker because the queue was full
    pub fallback_persists: usize,
    /// Documents skipped after cancellation; they have no ledger entry
    pub not_started: usize,
    pub rows_per_table: BTreeMap<String, usize>,
    pub failures_by_category: BTreeMap<FailureCategory, usize>,
    pub elapsed_secs: f64,
    pub documents_per_minute: f64,
    /// Highest document id dispatched in this run
    pub final_cursor: Option<i64>,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn total_rows(&self) -> usize {
        self.rows_per_table.values().sum()
    }

    pub fn log(&self) {
        info!(
            run_id = %self.run_id,
            dispatched = self.dispatched,
            succeeded = self.succeeded,
            failed = self.failed,
            queued = self.queued,
            fallback_persists = self.fallback_persists,
            not_started = self.not_started,
            rows = self.total_rows(),
            elapsed_secs = self.elapsed_secs,
            documents_per_minute = self.documents_per_minute,
            cancelled = self.cancelled,
            "Run complete"
        );
        for (category, count) in &self.failures_by_category {
            info!(run_id = %self.run_id, category = category.as_str(), count, "Failures by category");
        }
    }
}

/// Sizing knobs for one run
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    pub workers: usize,
    pub batch_size: usize,
    pub queue_capacity: usize,
    pub drain_batch_size: usize,
    pub document_timeout: Duration,
    pub range_start: Option<i64>,
    pub range_end: Option<i64>,
    pub max_documents: Option<usize>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from(&RunConfig::default())
    }
}

impl From<&RunConfig> for CoordinatorConfig {
    fn from(config: &RunConfig) -> Self {
        Self {
            workers: config.workers.max(1),
            batch_size: config.batch_size.max(1),
            queue_capacity: config.queue_capacity.max(1),
            drain_batch_size: config.drain_batch_size.max(1),
            document_timeout: config.document_timeout(),
            range_start: config.range_start,
            range_end: config.range_end,
            max_documents: config.max_documents,
        }
    }
}

pub struct Coordinator {
    contract: Arc<Contract>,
    staging: Arc<dyn StagingSource>,
    engine: Arc<PersistenceEngine>,
    scanner: CursorScanner,
    config: CoordinatorConfig,
    state: RunState,
}

impl Coordinator {
    pub fn new(
        contract: Arc<Contract>,
        staging: Arc<dyn StagingSource>,
        target: Arc<dyn TargetStore>,
        ledger: Arc<dyn LedgerStore>,
        config: CoordinatorConfig,
    ) -> Self {
        let engine = Arc::new(PersistenceEngine::new(
            Arc::clone(&contract),
            target,
            Arc::clone(&ledger),
        ));
        let scanner = CursorScanner::new(Arc::clone(&staging), ledger);
        Self {
            contract,
            staging,
            engine,
            scanner,
            config,
            state: RunState::Idle,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, next: RunState) -> Result<(), IngestError> {
        if !self.state.can_transition_to(next) {
            return Err(IngestError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        debug!(from = %self.state, to = %next, "Run state change");
        self.state = next;
        Ok(())
    }

    /// Process every unprocessed document in the configured range.
    ///
    /// Per-document failures end up in the ledger and the summary; only
    /// store outages and task failures abort the run.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<RunSummary, IngestError> {
        self.transition(RunState::Dispatching)?;
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        info!(
            run_id = %run_id,
            workers = self.config.workers,
            batch_size = self.config.batch_size,
            queue_capacity = self.config.queue_capacity,
            range_start = ?self.config.range_start,
            range_end = ?self.config.range_end,
            "Starting run"
        );

        let (tx, rx) = mpsc::channel(self.config.queue_capacity);
        let drain = tokio::spawn(drain_queue(
            rx,
            Arc::clone(&self.engine),
            self.config.drain_batch_size,
        ));

        let dispatched = self.dispatch(run_id, tx, &cancel).await;

        if let Err(e) = self.transition(RunState::Draining) {
            drain.abort();
            return Err(e);
        }
        let drained = drain.await;

        let (mut stats, drained) = match (dispatched, drained) {
            (Ok(stats), Ok(drained)) => (stats, drained),
            (Err(e), _) => {
                self.state = RunState::Terminated;
                error!(run_id = %run_id, error = %e, "Run terminated during dispatch");
                return Err(e);
            }
            (_, Err(join_err)) => {
                self.state = RunState::Terminated;
                error!(run_id = %run_id, error = %join_err, "Drain task failed");
                return Err(join_err.into());
            }
        };
        self.transition(RunState::Idle)?;

        stats.tally.merge(drained);
        let elapsed = started.elapsed().as_secs_f64();
        let finished = stats.tally.succeeded + stats.tally.failed;
        let summary = RunSummary {
            run_id,
            dispatched: stats.dispatched,
            succeeded: stats.tally.succeeded,
            failed: stats.tally.failed,
            queued: stats.enqueued,
            fallback_persists: stats.fallback_persists,
            not_started: stats.not_started,
            rows_per_table: stats.tally.rows_per_table,
            failures_by_category: stats.tally.failures_by_category,
            elapsed_secs: elapsed,
            documents_per_minute: if elapsed > 0.0 {
                finished as f64 * 60.0 / elapsed
            } else {
                0.0
            },
            final_cursor: stats.final_cursor,
            cancelled: stats.cancelled,
        };
        Ok(summary)
    }

    async fn dispatch(
        &self,
        run_id: Uuid,
        queue: mpsc::Sender<QueuedRowSet>,
        cancel: &CancellationToken,
    ) -> Result<DispatchStats, IngestError> {
        let worker = DocumentWorker::new(
            Arc::clone(&self.contract),
            Arc::clone(&self.engine),
            queue,
            self.config.document_timeout,
            cancel.clone(),
        );
        let mut stats = DispatchStats::default();
        let mut cursor = self
            .config
            .range_start
            .map_or(i64::MIN, |start| start.saturating_sub(1));

        loop {
            if cancel.is_cancelled() {
                info!(run_id = %run_id, cursor, "Cancellation requested; no further pages");
                stats.cancelled = true;
                break;
            }

            let limit = match self.config.max_documents {
                Some(max) => self.config.batch_size.min(max.saturating_sub(stats.dispatched)),
                None => self.config.batch_size,
            };
            if limit == 0 {
                info!(run_id = %run_id, dispatched = stats.dispatched, "Document cap reached");
                break;
            }

            let refs = self
                .scanner
                .next_batch(cursor, limit, self.config.range_end)
                .await?;
            let (Some(first), Some(last)) = (refs.first(), refs.last()) else {
                break;
            };
            let batch = BatchBounds {
                start: first.document_id,
                end: last.document_id,
            };
            cursor = batch.end;
            stats.final_cursor = Some(cursor);

            let documents = self.staging.fetch_documents(&refs).await?;
            if documents.len() < refs.len() {
                warn!(
                    run_id = %run_id,
                    expected = refs.len(),
                    fetched = documents.len(),
                    "Some staged documents disappeared before fetch"
                );
            }
            stats.dispatched += documents.len();
            debug!(
                run_id = %run_id,
                batch_start = batch.start,
                batch_end = batch.end,
                documents = documents.len(),
                "Dispatching page"
            );

            let outcomes: Vec<WorkerOutcome> = stream::iter(documents)
                .map(|source| {
                    let ctx = DocumentContext {
                        document_id: source.document_id,
                        run_id,
                        batch,
                    };
                    let worker = worker.clone();
                    async move { worker.process(source, ctx).await }
                })
                .buffer_unordered(self.config.workers)
                .collect()
                .await;

            for outcome in outcomes {
                stats.absorb(outcome);
            }
        }

        info!(
            run_id = %run_id,
            dispatched = stats.dispatched,
            enqueued = stats.enqueued,
            fallback_persists = stats.fallback_persists,
            "Dispatch finished"
        );
        Ok(stats)
    }
}

/// Commit queued row-sets until every sender is gone and the queue is empty
async fn drain_queue(
    mut rx: mpsc::Receiver<QueuedRowSet>,
    engine: Arc<PersistenceEngine>,
    batch_size: usize,
) -> Tally {
    let mut tally = Tally::default();
    let mut buffer = Vec::with_capacity(batch_size);
    loop {
        let received = rx.recv_many(&mut buffer, batch_size).await;
        if received == 0 {
            break;
        }
        for item in buffer.drain(..) {
            let outcome = engine
                .persist_before(&item.row_set, &item.ctx, item.deadline)
                .await;
            tally.record(&outcome);
        }
        debug!(received, "Drained queue batch");
    }
    debug!(
        succeeded = tally.succeeded,
        failed = tally.failed,
        "Drain task finished"
    );
    tally
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use crate::types::SourceDocument;
    use crate::worker::prepare_document;

    #[test]
    fn test_state_transitions() {
        assert!(RunState::Idle.can_transition_to(RunState::Dispatching));
        assert!(RunState::Dispatching.can_transition_to(RunState::Draining));
        assert!(RunState::Draining.can_transition_to(RunState::Idle));
        assert!(RunState::Draining.can_transition_to(RunState::Terminated));
        assert!(!RunState::Idle.can_transition_to(RunState::Draining));
        assert!(!RunState::Terminated.can_transition_to(RunState::Dispatching));
        assert!(!RunState::Dispatching.can_transition_to(RunState::Idle));
    }

    #[test]
    fn test_tally_merges_counts() {
        let mut a = Tally::default();
        a.record_failure(FailureCategory::Parse);
        a.rows_per_table.insert("app_base".to_string(), 2);

        let mut b = Tally::default();
        b.succeeded = 3;
        b.record_failure(FailureCategory::Parse);
        b.rows_per_table.insert("app_base".to_string(), 3);

        a.merge(b);
        assert_eq!(a.succeeded, 3);
        assert_eq!(a.failed, 2);
        assert_eq!(a.failures_by_category[&FailureCategory::Parse], 2);
        assert_eq!(a.rows_per_table["app_base"], 5);
    }

    #[tokio::test]
    async fn test_drain_honours_the_worker_deadline() {
        let contract = Arc::new(
            Contract::from_json(
                &serde_json::json!({
                    "target_schema": "dbo",
                    "root": { "table": "app_base", "element_path": "/App", "identifier_attribute": "id" },
                    "table_insertion_order": ["app_base"],
                    "tables": [{ "name": "app_base", "key_column": "app_id" }],
                    "column_rules": [
                        { "table": "app_base", "column": "app_id", "source": { "attribute": "id" },
                          "transforms": [{ "op": "coerce", "to": "int" }] }
                    ]
                })
                .to_string(),
            )
            .unwrap(),
        );
        let store = MemoryStore::new();
        store.set_insert_delay(Duration::from_millis(100));
        let engine = Arc::new(PersistenceEngine::new(
            Arc::clone(&contract),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
        ));

        let source = SourceDocument {
            document_id: 5,
            payload: r#"<App id="5"/>"#.to_string(),
        };
        let row_set = prepare_document(&contract, &source).unwrap();
        let ctx = DocumentContext {
            document_id: 5,
            run_id: Uuid::new_v4(),
            batch: BatchBounds { start: 5, end: 5 },
        };

        let (tx, rx) = mpsc::channel(1);
        tx.try_send(QueuedRowSet {
            row_set,
            ctx,
            deadline: tokio::time::Instant::now() + Duration::from_millis(10),
        })
        .unwrap();
        drop(tx);

        let tally = drain_queue(rx, engine, 4).await;
        assert_eq!(tally.failures_by_category[&FailureCategory::Timeout], 1);
        assert_eq!(store.total_rows(), 0);
    }

    #[test]
    fn test_config_from_run_config() {
        let run = RunConfig {
            workers: 2,
            document_timeout_secs: 7,
            max_documents: Some(10),
            ..RunConfig::default()
        };
        let config = CoordinatorConfig::from(&run);
        assert_eq!(config.workers, 2);
        assert_eq!(config.document_timeout, Duration::from_secs(7));
        assert_eq!(config.max_documents, Some(10));
    }
}
