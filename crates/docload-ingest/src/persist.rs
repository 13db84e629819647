//! Persistence engine
//!
//! Writes one row-set per unit of work. Rows go in in contract insertion
//! order; the key each insert returns is bound to the row's placeholder and
//! written into the foreign-key column of every child that points at it. The
//! `success` ledger entry is part of the same unit of work, so a document is
//! either fully loaded and recorded, or not loaded at all.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::contract::Contract;
use crate::error::{DocumentFailure, FailureCategory, PersistError, StoreResult};
use crate::storage::{LedgerStore, TableName, TargetStore, UnitOfWork};
use crate::transform::{RowRef, RowSet, TargetRow};
use crate::types::{DocumentContext, LedgerEntry};
use crate::value::Value;

/// Rows written for one committed document
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommitResult {
    pub document_id: i64,
    pub rows_per_table: BTreeMap<String, usize>,
}

impl CommitResult {
    pub fn total_rows(&self) -> usize {
        self.rows_per_table.values().sum()
    }
}

/// Terminal outcome of one document
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentOutcome {
    Committed(CommitResult),
    Failed(DocumentFailure),
}

pub struct PersistenceEngine {
    contract: Arc<Contract>,
    target: Arc<dyn TargetStore>,
    ledger: Arc<dyn LedgerStore>,
}

impl PersistenceEngine {
    pub fn new(
        contract: Arc<Contract>,
        target: Arc<dyn TargetStore>,
        ledger: Arc<dyn LedgerStore>,
    ) -> Self {
        Self {
            contract,
            target,
            ledger,
        }
    }

    pub fn contract(&self) -> &Contract {
        &self.contract
    }

    /// Commit a row-set and its `success` ledger entry atomically.
    ///
    /// The duplicate check reads committed data outside the unit of work and
    /// never blocks on concurrent writers. Any failure after the unit of work
    /// begins rolls it back; nothing of the document stays in the target.
    pub async fn commit(
        &self,
        row_set: &RowSet,
        ctx: &DocumentContext,
    ) -> Result<CommitResult, PersistError> {
        if self.is_duplicate(row_set).await? {
            return Err(PersistError::Duplicate(row_set.document_id));
        }

        let mut uow = self.target.begin_unit_of_work().await?;
        match self.write_rows(uow.as_mut(), row_set, ctx).await {
            Ok(result) => {
                uow.commit().await?;
                debug!(
                    document_id = ctx.document_id,
                    rows = result.total_rows(),
                    "Committed document"
                );
                Ok(result)
            }
            Err(e) => {
                if let Err(rollback_err) = uow.rollback().await {
                    warn!(
                        document_id = ctx.document_id,
                        error = %rollback_err,
                        "Rollback failed; the unit of work is discarded"
                    );
                }
                Err(e)
            }
        }
    }

    /// Commit a row-set, recording a `failed` ledger entry when that fails
    pub async fn persist(&self, row_set: &RowSet, ctx: &DocumentContext) -> DocumentOutcome {
        match self.commit(row_set, ctx).await {
            Ok(result) => DocumentOutcome::Committed(result),
            Err(e) => {
                let failure = DocumentFailure::from(e);
                DocumentOutcome::Failed(self.record_failure(ctx, failure).await)
            }
        }
    }

    /// [`persist`](Self::persist) bounded by the document's `deadline`. A
    /// persist still running at the deadline is dropped, which discards its
    /// unit of work, and the document is recorded as `timeout`.
    pub async fn persist_before(
        &self,
        row_set: &RowSet,
        ctx: &DocumentContext,
        deadline: Instant,
    ) -> DocumentOutcome {
        match tokio::time::timeout_at(deadline, self.persist(row_set, ctx)).await {
            Ok(outcome) => outcome,
            Err(_) => DocumentOutcome::Failed(
                self.fail(
                    ctx,
                    FailureCategory::Timeout,
                    "document deadline passed during persist",
                )
                .await,
            ),
        }
    }

    /// Append the `failed` ledger entry for a document in its own unit of work.
    ///
    /// A ledger that cannot be written is logged and otherwise ignored: the
    /// document then has no terminal entry and is picked up by the next run.
    pub async fn record_failure(
        &self,
        ctx: &DocumentContext,
        failure: DocumentFailure,
    ) -> DocumentFailure {
        let entry = LedgerEntry::failed(ctx, failure.category, failure.reason.clone());
        match self.ledger.append(&entry).await {
            Ok(()) => {
                info!(
                    document_id = ctx.document_id,
                    run_id = %ctx.run_id,
                    category = failure.category.as_str(),
                    reason = %failure.reason,
                    "Document failed"
                );
            }
            Err(e) => {
                error!(
                    document_id = ctx.document_id,
                    category = failure.category.as_str(),
                    error = %e,
                    "Failed to record ledger entry"
                );
            }
        }
        failure
    }

    /// Shorthand for failures that never reached a row-set
    pub async fn fail(
        &self,
        ctx: &DocumentContext,
        category: FailureCategory,
        reason: impl Into<String>,
    ) -> DocumentFailure {
        self.record_failure(ctx, DocumentFailure::new(category, reason))
            .await
    }

    async fn is_duplicate(&self, row_set: &RowSet) -> StoreResult<bool> {
        let root = &self.contract.root().table;
        if self.contract.has_generated_key(root) {
            return Ok(false);
        }
        let Some(key_column) = self.contract.key_column_for(root) else {
            return Ok(false);
        };
        let Some(key) = row_set
            .rows_for(root)
            .next()
            .and_then(|row| row.columns.get(key_column))
        else {
            return Ok(false);
        };

        let table = TableName::new(self.contract.target_schema(), root);
        let exists = self.target.exists_row(table, key_column, key).await?;
        if exists {
            warn!(
                document_id = row_set.document_id,
                table = %table,
                key = %key,
                "Root row already present in target"
            );
        }
        Ok(exists)
    }

    async fn write_rows(
        &self,
        uow: &mut dyn UnitOfWork,
        row_set: &RowSet,
        ctx: &DocumentContext,
    ) -> Result<CommitResult, PersistError> {
        let mut ordered: Vec<&TargetRow> = row_set.rows.iter().collect();
        ordered.sort_by_key(|row| self.contract.table_position(&row.table).unwrap_or(usize::MAX));

        let schema = self.contract.target_schema();
        let mut keys: HashMap<RowRef, Value> = HashMap::new();
        let mut rows_per_table: BTreeMap<String, usize> = BTreeMap::new();

        for row in ordered {
            let mut columns = row.columns.clone();
            if let Some(link) = &row.parent {
                let key = keys.get(&link.row).cloned().ok_or_else(|| {
                    PersistError::UnresolvedParentKey {
                        table: row.table.clone(),
                        column: link.foreign_key_column.clone(),
                    }
                })?;
                columns.insert(link.foreign_key_column.clone(), key);
            }

            let key_column = self.contract.key_column_for(&row.table);
            let returned = uow
                .insert_row(TableName::new(schema, &row.table), key_column, &columns)
                .await?;
            let key = returned.or_else(|| key_column.and_then(|k| columns.get(k).cloned()));
            if let Some(key) = key {
                keys.insert(row.row_ref, key);
            }
            *rows_per_table.entry(row.table.clone()).or_insert(0) += 1;
        }

        uow.append_ledger(&LedgerEntry::success(ctx)).await?;

        Ok(CommitResult {
            document_id: row_set.document_id,
            rows_per_table,
        })
    }
}
