//! In-memory store adapters
//!
//! [`MemoryStore`] implements both [`TargetStore`] and [`LedgerStore`]: a unit
//! of work buffers its rows and ledger entries and applies them under one lock
//! on commit, so readers never observe half of a document. Key columns behave
//! like primary keys (unique, generated from a per-table sequence when the row
//! does not supply them). Faults can be injected to exercise rollback paths.
//!
//! Tables are keyed by name only; the schema part of [`TableName`] is ignored.
//!
//! [`MemoryStaging`] serves payloads from a map, optionally loaded from a
//! directory of `<document_id>.xml` files.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use super::{LedgerStore, StagingSource, TableName, TargetStore, UnitOfWork};
use crate::error::{StoreError, StoreResult};
use crate::types::{DocumentRef, LedgerEntry, SourceDocument};
use crate::value::Value;

type Row = BTreeMap<String, Value>;

#[derive(Debug, Default)]
struct MemoryState {
    tables: HashMap<String, Vec<Row>>,
    sequences: HashMap<String, i64>,
    ledger: Vec<LedgerEntry>,
}

#[derive(Debug, Clone)]
struct InsertFault {
    table: String,
    when: Option<(String, Value)>,
}

#[derive(Debug, Default)]
struct FaultPlan {
    inserts: Vec<InsertFault>,
    insert_delay: Option<Duration>,
}

impl FaultPlan {
    fn insert_fails(&self, table: &str, row: &Row) -> bool {
        self.inserts.iter().any(|fault| {
            fault.table == table
                && match &fault.when {
                    None => true,
                    Some((column, value)) => row.get(column) == Some(value),
                }
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> StoreResult<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
}

/// Target tables and ledger held in process memory
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    faults: Arc<Mutex<FaultPlan>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every insert into `table` fails with a constraint violation
    pub fn fail_inserts_into(&self, table: &str) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.inserts.push(InsertFault {
                table: table.to_string(),
                when: None,
            });
        }
    }

    /// Inserts into `table` fail when `column` holds `value`
    pub fn fail_inserts_where(&self, table: &str, column: &str, value: Value) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.inserts.push(InsertFault {
                table: table.to_string(),
                when: Some((column.to_string(), value)),
            });
        }
    }

    /// Delay every insert, to simulate a slow target
    pub fn set_insert_delay(&self, delay: Duration) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.insert_delay = Some(delay);
        }
    }

    pub fn clear_faults(&self) {
        if let Ok(mut faults) = self.faults.lock() {
            *faults = FaultPlan::default();
        }
    }

    /// Committed rows of one table
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state
            .lock()
            .map(|s| s.tables.get(table).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.state
            .lock()
            .map(|s| s.tables.get(table).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    pub fn total_rows(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.tables.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Full ledger in append order
    pub fn ledger(&self) -> Vec<LedgerEntry> {
        self.state
            .lock()
            .map(|s| s.ledger.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TargetStore for MemoryStore {
    async fn begin_unit_of_work(&self) -> StoreResult<Box<dyn UnitOfWork>> {
        Ok(Box::new(MemoryUnitOfWork {
            state: Arc::clone(&self.state),
            faults: Arc::clone(&self.faults),
            pending_rows: Vec::new(),
            pending_ledger: Vec::new(),
        }))
    }

    async fn exists_row(
        &self,
        table: TableName<'_>,
        key_column: &str,
        key: &Value,
    ) -> StoreResult<bool> {
        let state = lock(&self.state)?;
        Ok(committed_key(&state, table.table, key_column, key))
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn append(&self, entry: &LedgerEntry) -> StoreResult<()> {
        lock(&self.state)?.ledger.push(entry.clone());
        Ok(())
    }

    async fn has_terminal_entry(&self, document_id: i64) -> StoreResult<bool> {
        let state = lock(&self.state)?;
        Ok(state
            .ledger
            .iter()
            .any(|e| e.document_id == document_id && e.is_terminal()))
    }

    async fn terminal_ids(&self, ids: &[i64]) -> StoreResult<HashSet<i64>> {
        let wanted: HashSet<i64> = ids.iter().copied().collect();
        let state = lock(&self.state)?;
        Ok(state
            .ledger
            .iter()
            .filter(|e| e.is_terminal() && wanted.contains(&e.document_id))
            .map(|e| e.document_id)
            .collect())
    }

    async fn entries_for(&self, document_id: i64) -> StoreResult<Vec<LedgerEntry>> {
        let state = lock(&self.state)?;
        Ok(state
            .ledger
            .iter()
            .filter(|e| e.document_id == document_id)
            .cloned()
            .collect())
    }
}

struct PendingRow {
    table: String,
    key_column: Option<String>,
    row: Row,
}

fn committed_key(state: &MemoryState, table: &str, key_column: &str, key: &Value) -> bool {
    state
        .tables
        .get(table)
        .is_some_and(|rows| rows.iter().any(|r| r.get(key_column) == Some(key)))
}

/// Buffered writes of one document; dropped without commit means rolled back
pub struct MemoryUnitOfWork {
    state: Arc<Mutex<MemoryState>>,
    faults: Arc<Mutex<FaultPlan>>,
    pending_rows: Vec<PendingRow>,
    pending_ledger: Vec<LedgerEntry>,
}

impl MemoryUnitOfWork {
    fn key_taken(&self, state: &MemoryState, table: &str, key_column: &str, key: &Value) -> bool {
        let pending = self
            .pending_rows
            .iter()
            .any(|p| p.table == table && p.row.get(key_column) == Some(key));
        pending || committed_key(state, table, key_column, key)
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn insert_row(
        &mut self,
        table: TableName<'_>,
        key_column: Option<&str>,
        columns: &BTreeMap<String, Value>,
    ) -> StoreResult<Option<Value>> {
        let delay = lock(&self.faults)?.insert_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if lock(&self.faults)?.insert_fails(table.table, columns) {
            return Err(StoreError::Constraint {
                table: table.to_string(),
                message: "injected insert failure".to_string(),
            });
        }

        let mut row = columns.clone();
        let key = {
            let mut state = lock(&self.state)?;
            match key_column {
                None => None,
                Some(key_column) => match row.get(key_column).cloned() {
                    Some(key) => {
                        if self.key_taken(&state, table.table, key_column, &key) {
                            return Err(StoreError::Constraint {
                                table: table.to_string(),
                                message: format!("duplicate key {key_column} = {key}"),
                            });
                        }
                        Some(key)
                    }
                    None => {
                        let mut next = state.sequences.get(table.table).copied().unwrap_or(0);
                        let key = loop {
                            next += 1;
                            let candidate = Value::Int(next);
                            if !self.key_taken(&state, table.table, key_column, &candidate) {
                                break candidate;
                            }
                        };
                        state.sequences.insert(table.table.to_string(), next);
                        row.insert(key_column.to_string(), key.clone());
                        Some(key)
                    }
                },
            }
        };

        self.pending_rows.push(PendingRow {
            table: table.table.to_string(),
            key_column: key_column.map(str::to_string),
            row,
        });
        Ok(key)
    }

    async fn append_ledger(&mut self, entry: &LedgerEntry) -> StoreResult<()> {
        self.pending_ledger.push(entry.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let this = *self;
        let mut state = lock(&this.state)?;

        // Another unit of work may have committed the same key since insert
        for pending in &this.pending_rows {
            let Some(key_column) = &pending.key_column else {
                continue;
            };
            if let Some(key) = pending.row.get(key_column) {
                if committed_key(&state, &pending.table, key_column, key) {
                    return Err(StoreError::Constraint {
                        table: pending.table.clone(),
                        message: format!("duplicate key {key_column} = {key}"),
                    });
                }
            }
        }

        for pending in this.pending_rows {
            state.tables.entry(pending.table).or_default().push(pending.row);
        }
        state.ledger.extend(this.pending_ledger);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        debug!(
            rows = self.pending_rows.len(),
            "Discarding in-memory unit of work"
        );
        Ok(())
    }
}

/// Staged payloads held in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryStaging {
    documents: Arc<Mutex<BTreeMap<i64, String>>>,
}

impl MemoryStaging {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_documents<I, S>(documents: I) -> Self
    where
        I: IntoIterator<Item = (i64, S)>,
        S: Into<String>,
    {
        let staging = Self::new();
        for (id, payload) in documents {
            staging.insert(id, payload);
        }
        staging
    }

    pub fn insert(&self, document_id: i64, payload: impl Into<String>) {
        if let Ok(mut documents) = self.documents.lock() {
            documents.insert(document_id, payload.into());
        }
    }

    pub fn len(&self) -> usize {
        self.documents.lock().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load every `<document_id>.xml` file in `dir`
    pub fn from_dir(dir: impl AsRef<Path>) -> StoreResult<Self> {
        let staging = Self::new();
        for entry in std::fs::read_dir(dir.as_ref())? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("xml") {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<i64>().ok())
            else {
                warn!(path = %path.display(), "Skipping staging file without a numeric name");
                continue;
            };
            staging.insert(id, std::fs::read_to_string(&path)?);
        }
        debug!(
            dir = %dir.as_ref().display(),
            documents = staging.len(),
            "Loaded staging directory"
        );
        Ok(staging)
    }
}

#[async_trait]
impl StagingSource for MemoryStaging {
    async fn list_refs(
        &self,
        after: i64,
        range_end: Option<i64>,
        limit: usize,
    ) -> StoreResult<Vec<DocumentRef>> {
        if range_end.is_some_and(|end| end <= after) {
            return Ok(Vec::new());
        }
        let upper = range_end.map_or(Bound::Unbounded, Bound::Included);
        let documents = lock(&self.documents)?;
        Ok(documents
            .range((Bound::Excluded(after), upper))
            .take(limit)
            .map(|(id, _)| DocumentRef::new(*id))
            .collect())
    }

    async fn fetch_batch(
        &self,
        id_start: i64,
        id_end: i64,
        limit: usize,
    ) -> StoreResult<Vec<SourceDocument>> {
        if id_start > id_end {
            return Ok(Vec::new());
        }
        let documents = lock(&self.documents)?;
        Ok(documents
            .range(id_start..=id_end)
            .take(limit)
            .map(|(id, payload)| SourceDocument {
                document_id: *id,
                payload: payload.clone(),
            })
            .collect())
    }
}
