//! Error taxonomy for the load pipeline
//!
//! Per-document errors ([`DocumentError`], [`SelectionError`], [`TransformError`],
//! [`PersistError`]) never end a run: workers and the drain task turn them into
//! ledger entries tagged with a [`FailureCategory`]. Run-level problems surface
//! as [`IngestError`] and terminate the process with a non-zero exit code.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::transform::ColumnIssue;

/// Malformed or inconsistent mapping contract. Fatal before processing starts.
#[derive(Error, Debug)]
pub enum ContractError {
    #[error("Failed to read contract {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Contract is not valid JSON: {0}")]
    Syntax(#[from] serde_json::Error),

    #[error("Invalid contract: {0}")]
    Invalid(String),

    #[error("Expression for {table}.{column} does not parse: {message}")]
    Expression {
        table: String,
        column: String,
        message: String,
    },
}

impl ContractError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}

/// Raw payload could not be read as a hierarchical document
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DocumentError {
    #[error("Malformed document: {0}")]
    Malformed(String),

    #[error("Document has no root element")]
    Empty,
}

/// Critical identity data is missing; the whole document is abandoned
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SelectionError {
    #[error("missing root element {0}")]
    MissingRootElement(String),

    #[error("missing root identifier")]
    MissingRootIdentifier,

    #[error("invalid root identifier '{0}'")]
    InvalidRootIdentifier(String),

    #[error("root identifier mismatch: staged as {staged}, document carries {found}")]
    RootIdentifierMismatch { staged: i64, found: i64 },

    #[error("critical {element_type} element rejected: {reason}")]
    CriticalElement {
        element_type: String,
        reason: String,
    },

    #[error("missing required key identifier {0}")]
    MissingKeyIdentifier(String),
}

/// A column could not be produced and its rule says to abandon the document
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error("{0}")]
    Column(ColumnIssue),

    #[error("required column {table}.{column} has no value")]
    RequiredColumnMissing { table: String, column: String },
}

/// Failures raised by a store adapter
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Constraint violation on {table}: {message}")]
    Constraint { table: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Unsupported value: {0}")]
    Unsupported(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Unit of work for one document could not be committed
#[derive(Error, Debug)]
pub enum PersistError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no generated key available for {table}.{column}")]
    UnresolvedParentKey { table: String, column: String },

    #[error("document {0} is already present in the target store")]
    Duplicate(i64),
}

impl PersistError {
    pub fn category(&self) -> FailureCategory {
        match self {
            PersistError::Duplicate(_) => FailureCategory::Duplicate,
            _ => FailureCategory::Persist,
        }
    }
}

/// Classification recorded with every `failed` ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Parse,
    Selection,
    Transform,
    Persist,
    Duplicate,
    Timeout,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::Parse => "parse",
            FailureCategory::Selection => "selection",
            FailureCategory::Transform => "transform",
            FailureCategory::Persist => "persist",
            FailureCategory::Duplicate => "duplicate",
            FailureCategory::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FailureCategory {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "parse" => Ok(FailureCategory::Parse),
            "selection" => Ok(FailureCategory::Selection),
            "transform" => Ok(FailureCategory::Transform),
            "persist" => Ok(FailureCategory::Persist),
            "duplicate" => Ok(FailureCategory::Duplicate),
            "timeout" => Ok(FailureCategory::Timeout),
            other => Err(format!("unknown failure category: {other}")),
        }
    }
}

/// Terminal failure of one document, ready to be written to the ledger
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentFailure {
    pub category: FailureCategory,
    pub reason: String,
}

impl DocumentFailure {
    pub fn new(category: FailureCategory, reason: impl Into<String>) -> Self {
        Self {
            category,
            reason: reason.into(),
        }
    }
}

impl From<DocumentError> for DocumentFailure {
    fn from(err: DocumentError) -> Self {
        Self::new(FailureCategory::Parse, err.to_string())
    }
}

impl From<SelectionError> for DocumentFailure {
    fn from(err: SelectionError) -> Self {
        Self::new(FailureCategory::Selection, err.to_string())
    }
}

impl From<TransformError> for DocumentFailure {
    fn from(err: TransformError) -> Self {
        Self::new(FailureCategory::Transform, err.to_string())
    }
}

impl From<PersistError> for DocumentFailure {
    fn from(err: PersistError) -> Self {
        Self::new(err.category(), err.to_string())
    }
}

/// Run-level errors; these abort the run
#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Contract(#[from] ContractError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Invalid run state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_category_round_trip_names() {
        for category in [
            FailureCategory::Parse,
            FailureCategory::Selection,
            FailureCategory::Transform,
            FailureCategory::Persist,
            FailureCategory::Duplicate,
            FailureCategory::Timeout,
        ] {
            assert_eq!(category.as_str().parse::<FailureCategory>(), Ok(category));
        }
        assert!("lost".parse::<FailureCategory>().is_err());
    }

    #[test]
    fn test_selection_error_becomes_selection_failure() {
        let failure: DocumentFailure = SelectionError::MissingRootIdentifier.into();
        assert_eq!(failure.category, FailureCategory::Selection);
        assert_eq!(failure.reason, "missing root identifier");
    }

    #[test]
    fn test_duplicate_persist_error_category() {
        let failure: DocumentFailure = PersistError::Duplicate(1001).into();
        assert_eq!(failure.category, FailureCategory::Duplicate);
    }
}
