//! Store adapter interfaces
//!
//! Three external stores are reached through trait objects so the pipeline
//! runs unchanged against PostgreSQL ([`postgres`]) or in memory ([`memory`]):
//!
//! - [`StagingSource`]: read-only staged payloads keyed by document id
//! - [`TargetStore`] / [`UnitOfWork`]: the relational target, one unit of
//!   work per document
//! - [`LedgerStore`]: the append-only processing ledger
//!
//! A unit of work also appends the ledger entry for its document, so a target
//! store and the ledger it writes to always belong to the same backend.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};

use crate::error::StoreResult;
use crate::types::{DocumentRef, LedgerEntry, SourceDocument};
use crate::value::Value;

/// Schema-qualified target table name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableName<'a> {
    pub schema: &'a str,
    pub table: &'a str,
}

impl<'a> TableName<'a> {
    pub fn new(schema: &'a str, table: &'a str) -> Self {
        Self { schema, table }
    }
}

impl std::fmt::Display for TableName<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

#[async_trait]
pub trait StagingSource: Send + Sync {
    /// Ids strictly greater than `after`, up to `range_end`, ascending
    async fn list_refs(
        &self,
        after: i64,
        range_end: Option<i64>,
        limit: usize,
    ) -> StoreResult<Vec<DocumentRef>>;

    /// Payloads with ids in `id_start..=id_end`, ascending
    async fn fetch_batch(
        &self,
        id_start: i64,
        id_end: i64,
        limit: usize,
    ) -> StoreResult<Vec<SourceDocument>>;

    /// Payloads for exactly the given refs. Refs whose payload vanished from
    /// staging are left out of the result.
    async fn fetch_documents(&self, refs: &[DocumentRef]) -> StoreResult<Vec<SourceDocument>> {
        let (Some(first), Some(last)) = (refs.first(), refs.last()) else {
            return Ok(Vec::new());
        };
        let wanted: HashSet<i64> = refs.iter().map(|r| r.document_id).collect();
        let start = first.document_id.min(last.document_id);
        let end = first.document_id.max(last.document_id);
        let documents = self.fetch_batch(start, end, usize::MAX).await?;
        Ok(documents
            .into_iter()
            .filter(|d| wanted.contains(&d.document_id))
            .collect())
    }
}

#[async_trait]
pub trait UnitOfWork: Send {
    /// Insert one row and return the stored value of `key_column`, if named
    async fn insert_row(
        &mut self,
        table: TableName<'_>,
        key_column: Option<&str>,
        columns: &BTreeMap<String, Value>,
    ) -> StoreResult<Option<Value>>;

    /// Append a ledger entry that commits or rolls back with the rows
    async fn append_ledger(&mut self, entry: &LedgerEntry) -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

#[async_trait]
pub trait TargetStore: Send + Sync {
    async fn begin_unit_of_work(&self) -> StoreResult<Box<dyn UnitOfWork>>;

    /// Whether a committed row with `key` exists. Reads outside any unit of
    /// work and never waits on concurrent writers.
    async fn exists_row(
        &self,
        table: TableName<'_>,
        key_column: &str,
        key: &Value,
    ) -> StoreResult<bool>;
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Append an entry in its own unit of work
    async fn append(&self, entry: &LedgerEntry) -> StoreResult<()>;

    async fn has_terminal_entry(&self, document_id: i64) -> StoreResult<bool>;

    /// Subset of `ids` that already have a terminal entry
    async fn terminal_ids(&self, ids: &[i64]) -> StoreResult<HashSet<i64>> {
        let mut done = HashSet::new();
        for id in ids {
            if self.has_terminal_entry(*id).await? {
                done.insert(*id);
            }
        }
        Ok(done)
    }

    /// Every entry recorded for a document, oldest first
    async fn entries_for(&self, document_id: i64) -> StoreResult<Vec<LedgerEntry>>;
}
