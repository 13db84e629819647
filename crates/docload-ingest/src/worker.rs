//! Document worker
//!
//! A worker turns one staged document into a row-set on the blocking pool and
//! hands it to the drain task over the bounded queue. The hand-off never
//! waits: when the queue is full (or already closed) the worker persists the
//! row-set itself. Either way the persist is bounded by the deadline set when
//! the worker picked the document up. Every document that is started ends with exactly one
//! ledger entry, written either here or by the drain task.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::contract::Contract;
use crate::document::Document;
use crate::error::{DocumentFailure, FailureCategory};
use crate::persist::{DocumentOutcome, PersistenceEngine};
use crate::selector::select;
use crate::transform::{transform, RowSet};
use crate::types::{DocumentContext, SourceDocument};

/// A row-set travelling from a worker to the drain task
#[derive(Debug)]
pub struct QueuedRowSet {
    pub row_set: RowSet,
    pub ctx: DocumentContext,
    /// Set when the worker started the document; the drain persists against
    /// the same deadline as the synchronous fallback would
    pub deadline: Instant,
}

/// What happened to one dispatched document
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    /// Handed to the drain task, which writes the ledger entry
    Enqueued,
    /// Persisted synchronously because the queue could not take it
    Fallback(DocumentOutcome),
    /// Failed before reaching persistence; already recorded
    Failed(DocumentFailure),
    /// Skipped after cancellation; no ledger entry, picked up by the next run
    NotStarted,
}

/// Parse, select and transform one document
pub fn prepare_document(
    contract: &Contract,
    source: &SourceDocument,
) -> Result<RowSet, DocumentFailure> {
    let document = Document::parse(&source.payload)?;
    let selection = select(&document, contract, Some(source.document_id))?;
    let row_set = transform(&document, &selection, contract)?;
    Ok(row_set)
}

#[derive(Clone)]
pub struct DocumentWorker {
    contract: Arc<Contract>,
    engine: Arc<PersistenceEngine>,
    queue: mpsc::Sender<QueuedRowSet>,
    timeout: Duration,
    cancel: CancellationToken,
}

impl DocumentWorker {
    pub fn new(
        contract: Arc<Contract>,
        engine: Arc<PersistenceEngine>,
        queue: mpsc::Sender<QueuedRowSet>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            contract,
            engine,
            queue,
            timeout,
            cancel,
        }
    }

    /// Process one document under the per-document timeout
    pub async fn process(&self, source: SourceDocument, ctx: DocumentContext) -> WorkerOutcome {
        if self.cancel.is_cancelled() {
            return WorkerOutcome::NotStarted;
        }

        let deadline = Instant::now() + self.timeout;
        let contract = Arc::clone(&self.contract);
        let task = tokio::task::spawn_blocking(move || prepare_document(&contract, &source));

        let prepared = match tokio::time::timeout_at(deadline, task).await {
            Ok(Ok(prepared)) => prepared,
            Ok(Err(join_err)) => Err(DocumentFailure::new(
                FailureCategory::Transform,
                format!("transformation aborted: {join_err}"),
            )),
            Err(_) => Err(DocumentFailure::new(
                FailureCategory::Timeout,
                format!("transformation exceeded {}ms", self.timeout.as_millis()),
            )),
        };

        let row_set = match prepared {
            Ok(row_set) => row_set,
            Err(failure) => {
                return WorkerOutcome::Failed(self.engine.record_failure(&ctx, failure).await);
            }
        };

        if !row_set.report.issues.is_empty() {
            debug!(
                document_id = ctx.document_id,
                issues = row_set.report.issues.len(),
                "Columns omitted after transform issues"
            );
        }

        let item = QueuedRowSet {
            row_set,
            ctx,
            deadline,
        };
        match self.queue.try_send(item) {
            Ok(()) => WorkerOutcome::Enqueued,
            Err(TrySendError::Full(item)) | Err(TrySendError::Closed(item)) => {
                warn!(
                    document_id = item.ctx.document_id,
                    "Queue unavailable; persisting synchronously"
                );
                let outcome = self
                    .engine
                    .persist_before(&item.row_set, &item.ctx, item.deadline)
                    .await;
                WorkerOutcome::Fallback(outcome)
            }
        }
    }
}
