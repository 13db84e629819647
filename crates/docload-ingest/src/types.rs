//! Records exchanged with the staging, target and ledger stores

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FailureCategory;

/// Identifier of a staged document, as returned by the cursor scanner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentRef {
    pub document_id: i64,
}

impl DocumentRef {
    pub fn new(document_id: i64) -> Self {
        Self { document_id }
    }
}

/// A staged document and its raw payload
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDocument {
    pub document_id: i64,
    pub payload: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerStatus {
    Success,
    Failed,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerStatus::Success => "success",
            LedgerStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for LedgerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(LedgerStatus::Success),
            "failed" => Ok(LedgerStatus::Failed),
            other => Err(format!("unknown ledger status: {other}")),
        }
    }
}

/// Identifier range of the dispatch page a document belonged to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchBounds {
    pub start: i64,
    pub end: i64,
}

/// Per-document context threaded from dispatch to the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentContext {
    pub document_id: i64,
    pub run_id: Uuid,
    pub batch: BatchBounds,
}

/// One terminal outcome of one document in one run attempt. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub document_id: i64,
    pub status: LedgerStatus,
    pub category: Option<FailureCategory>,
    pub reason: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub run_id: Uuid,
    pub batch_start: i64,
    pub batch_end: i64,
}

impl LedgerEntry {
    pub fn success(ctx: &DocumentContext) -> Self {
        Self {
            document_id: ctx.document_id,
            status: LedgerStatus::Success,
            category: None,
            reason: None,
            recorded_at: Utc::now(),
            run_id: ctx.run_id,
            batch_start: ctx.batch.start,
            batch_end: ctx.batch.end,
        }
    }

    pub fn failed(ctx: &DocumentContext, category: FailureCategory, reason: impl Into<String>) -> Self {
        Self {
            document_id: ctx.document_id,
            status: LedgerStatus::Failed,
            category: Some(category),
            reason: Some(reason.into()),
            recorded_at: Utc::now(),
            run_id: ctx.run_id,
            batch_start: ctx.batch.start,
            batch_end: ctx.batch.end,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, LedgerStatus::Success | LedgerStatus::Failed)
    }
}
