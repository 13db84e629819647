//! docload ingestion library
//!
//! Loads staged XML documents into a normalized multi-table relational target,
//! driven by a declarative mapping contract.
//!
//! # Pipeline
//!
//! - [`scanner`]: pick the next unprocessed documents by id cursor and ledger
//! - [`document`]: parse the raw payload into an element tree
//! - [`selector`]: locate repeatable elements, apply filter rules and severity
//! - [`transform`]: run column transform chains and build sparse row-sets
//! - [`persist`]: write one row-set per unit of work, threading generated keys
//! - [`coordinator`] / [`worker`]: worker pool, bounded queue and drain task
//!
//! The [`storage`] traits keep the pipeline independent of the backing store:
//! [`storage::postgres`] for production, [`storage::memory`] for tests and
//! dry runs.

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod cli;
pub mod config;
pub mod contract;
pub mod coordinator;
pub mod document;
pub mod error;
pub mod expression;
pub mod persist;
pub mod scanner;
pub mod selector;
pub mod storage;
pub mod transform;
pub mod types;
pub mod value;
pub mod worker;

pub use cli::Cli;
pub use contract::Contract;
pub use coordinator::{Coordinator, CoordinatorConfig, RunState, RunSummary};
pub use error::{DocumentFailure, FailureCategory, IngestError};
pub use persist::{CommitResult, DocumentOutcome, PersistenceEngine};
pub use transform::RowSet;
pub use value::Value;
