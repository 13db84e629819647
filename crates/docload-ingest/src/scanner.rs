//! Resume cursor scanner
//!
//! Selects the next batch of staged documents that have no terminal ledger
//! entry. Paging is keyed on the last seen id, never on offsets, so documents
//! committed by concurrent writers can neither be skipped nor picked twice.

use std::sync::Arc;
use tracing::debug;

use crate::error::StoreResult;
use crate::storage::{LedgerStore, StagingSource};
use crate::types::DocumentRef;

pub struct CursorScanner {
    staging: Arc<dyn StagingSource>,
    ledger: Arc<dyn LedgerStore>,
}

impl CursorScanner {
    pub fn new(staging: Arc<dyn StagingSource>, ledger: Arc<dyn LedgerStore>) -> Self {
        Self { staging, ledger }
    }

    /// Up to `limit` unprocessed refs with ids in `(cursor, range_end]`, ascending.
    ///
    /// Staging ids are read page by page until `limit` unprocessed refs are
    /// found or staging is exhausted, so a long run of already-loaded ids
    /// never yields a short batch while work remains.
    pub async fn next_batch(
        &self,
        cursor: i64,
        limit: usize,
        range_end: Option<i64>,
    ) -> StoreResult<Vec<DocumentRef>> {
        let mut batch = Vec::with_capacity(limit);
        if limit == 0 {
            return Ok(batch);
        }

        let mut after = cursor;
        let mut already_done = 0usize;
        loop {
            let page = self.staging.list_refs(after, range_end, limit).await?;
            let Some(last) = page.last() else {
                break;
            };
            after = last.document_id;
            let exhausted = page.len() < limit;

            let ids: Vec<i64> = page.iter().map(|r| r.document_id).collect();
            let done = self.ledger.terminal_ids(&ids).await?;
            already_done += done.len();

            for doc_ref in page {
                if done.contains(&doc_ref.document_id) {
                    continue;
                }
                batch.push(doc_ref);
                if batch.len() == limit {
                    break;
                }
            }

            if batch.len() == limit || exhausted {
                break;
            }
        }

        debug!(
            cursor,
            selected = batch.len(),
            already_done,
            "Scanned staging for unprocessed documents"
        );
        Ok(batch)
    }
}
