//! End-to-end runs against the in-memory stores and the fixture contract

use async_trait::async_trait;
use docload_ingest::coordinator::{Coordinator, CoordinatorConfig, RunState};
use docload_ingest::error::{FailureCategory, IngestError, StoreError, StoreResult};
use docload_ingest::scanner::CursorScanner;
use docload_ingest::storage::memory::{MemoryStaging, MemoryStore};
use docload_ingest::storage::{StagingSource, TableName, TargetStore, UnitOfWork};
use docload_ingest::types::{DocumentRef, LedgerStatus, SourceDocument};
use docload_ingest::{Contract, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn contract() -> Arc<Contract> {
    Arc::new(Contract::load(fixture("contract.json")).unwrap())
}

fn application(id: i64, city: &str) -> String {
    format!(
        r#"<Provenir><Request ID="{id}"><CustData>
            <application joint_ind="N" annual_income="1200"/>
            <contact con_key="1" ac_role_tp_c="PR" ssn="{id:09}" first_name="Applicant {id}">
                <contact_address address_tp_c="CURR" city="{city}"/>
            </contact>
        </CustData></Request></Provenir>"#
    )
}

fn staging_with(ids: impl IntoIterator<Item = i64>) -> MemoryStaging {
    MemoryStaging::with_documents(ids.into_iter().map(|id| (id, application(id, "Austin"))))
}

fn config() -> CoordinatorConfig {
    CoordinatorConfig {
        workers: 4,
        batch_size: 10,
        queue_capacity: 16,
        drain_batch_size: 4,
        document_timeout: Duration::from_secs(5),
        ..CoordinatorConfig::default()
    }
}

fn coordinator(staging: &MemoryStaging, store: &MemoryStore, config: CoordinatorConfig) -> Coordinator {
    Coordinator::new(
        contract(),
        Arc::new(staging.clone()),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        config,
    )
}

fn ledger_counts(store: &MemoryStore) -> HashMap<i64, usize> {
    let mut counts = HashMap::new();
    for entry in store.ledger() {
        *counts.entry(entry.document_id).or_insert(0) += 1;
    }
    counts
}

#[tokio::test]
async fn test_fixture_documents_load_with_severity_rules() {
    let staging = MemoryStaging::from_dir(fixture("staging")).unwrap();
    let store = MemoryStore::new();

    let summary = coordinator(&staging, &store, config())
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.dispatched, 2);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failures_by_category[&FailureCategory::Selection], 1);

    // 1001: root, application and the primary contact; the contact without a
    // role produces nothing
    assert_eq!(store.row_count("app_base"), 1);
    assert_eq!(store.row_count("app_operational"), 1);
    assert_eq!(store.row_count("contact_base"), 1);
    assert_eq!(store.row_count("contact_address"), 1);

    let root = &store.rows("app_base")[0];
    assert_eq!(root["app_id"], Value::Int(1001));
    assert_eq!(root["app_source_code"], Value::text("X"));
    assert_eq!(root["primary_ssn"], Value::text("666123456"));

    let contact = &store.rows("contact_base")[0];
    assert_eq!(contact["app_id"], Value::Int(1001));
    assert_eq!(contact["contact_type_enum"], Value::Int(281));
    let address = &store.rows("contact_address")[0];
    assert_eq!(address["con_id"], contact["con_id"]);

    // Only columns with a resolved source or fallback are populated
    let operational = &store.rows("app_operational")[0];
    let columns: Vec<&str> = operational.keys().map(String::as_str).collect();
    assert_eq!(columns, vec!["annual_income", "app_id", "joint_ind", "monthly_income"]);
    assert_eq!(
        operational["monthly_income"].to_decimal(),
        Value::Int(5000).to_decimal()
    );

    let ledger = store.ledger();
    assert_eq!(ledger.len(), 2);
    let success = ledger.iter().find(|e| e.document_id == 1001).unwrap();
    assert_eq!(success.status, LedgerStatus::Success);
    let failed = ledger.iter().find(|e| e.document_id == 1002).unwrap();
    assert_eq!(failed.status, LedgerStatus::Failed);
    assert_eq!(failed.category, Some(FailureCategory::Selection));
    assert_eq!(failed.reason.as_deref(), Some("missing root identifier"));
}

#[tokio::test]
async fn test_rerun_never_reprocesses_finished_documents() {
    let staging = MemoryStaging::from_dir(fixture("staging")).unwrap();
    let store = MemoryStore::new();
    coordinator(&staging, &store, config())
        .run(CancellationToken::new())
        .await
        .unwrap();

    let scanner = CursorScanner::new(Arc::new(staging.clone()), Arc::new(store.clone()));
    assert!(scanner.next_batch(1000, 10, None).await.unwrap().is_empty());

    let rerun = coordinator(&staging, &store, config())
        .run(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(rerun.dispatched, 0);
    assert_eq!(store.total_rows(), 4);
    assert_eq!(store.ledger().len(), 2);
}

#[tokio::test]
async fn test_injected_insert_failure_leaves_no_partial_document() {
    let staging = staging_with(1..=5);
    staging.insert(3, application(3, "Boston"));
    let store = MemoryStore::new();
    store.fail_inserts_where("contact_address", "city", Value::text("Boston"));

    let summary = coordinator(&staging, &store, config())
        .run(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.succeeded, 4);
    assert_eq!(summary.failures_by_category[&FailureCategory::Persist], 1);

    assert!(!store
        .rows("app_base")
        .iter()
        .any(|r| r["app_id"] == Value::Int(3)));
    assert!(!store
        .rows("contact_base")
        .iter()
        .any(|r| r["app_id"] == Value::Int(3)));
    for table in ["app_base", "app_operational", "contact_base", "contact_address"] {
        assert_eq!(store.row_count(table), 4, "{table}");
    }

    // The failure is terminal: clearing the fault does not bring it back
    store.clear_faults();
    let rerun = coordinator(&staging, &store, config())
        .run(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(rerun.dispatched, 0);
    assert!(ledger_counts(&store).values().all(|&n| n == 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_saturated_queue_loses_nothing() {
    let staging = staging_with(1..=40);
    let store = MemoryStore::new();
    // The drain spends 40ms per document, far longer than a transform takes,
    // so workers finishing together find the single queue slot taken
    store.set_insert_delay(Duration::from_millis(10));

    let summary = coordinator(
        &staging,
        &store,
        CoordinatorConfig {
            workers: 8,
            batch_size: 40,
            queue_capacity: 1,
            drain_batch_size: 1,
            ..config()
        },
    )
    .run(CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(summary.dispatched, 40);
    assert_eq!(summary.succeeded, 40);
    assert_eq!(summary.failed, 0);
    assert!(summary.fallback_persists > 0);
    assert!(summary.queued > 0);
    assert_eq!(summary.queued + summary.fallback_persists, 40);
    assert_eq!(summary.rows_per_table["contact_base"], 40);
    assert_eq!(store.row_count("app_base"), 40);

    // Fallback and queued paths write identical ledger entries
    let ledger = store.ledger();
    assert_eq!(ledger.len(), 40);
    assert!(ledger
        .iter()
        .all(|e| e.status == LedgerStatus::Success && e.category.is_none() && e.reason.is_none()));
    assert!(ledger_counts(&store).values().all(|&n| n == 1));
}

#[tokio::test]
async fn test_root_already_in_target_is_a_duplicate() {
    let staging = staging_with([7, 8]);
    let store = MemoryStore::new();

    let mut uow = store.begin_unit_of_work().await.unwrap();
    uow.insert_row(
        TableName::new("dbo", "app_base"),
        Some("app_id"),
        &BTreeMap::from([("app_id".to_string(), Value::Int(7))]),
    )
    .await
    .unwrap();
    uow.commit().await.unwrap();

    let summary = coordinator(&staging, &store, config())
        .run(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failures_by_category[&FailureCategory::Duplicate], 1);
    assert_eq!(store.row_count("app_base"), 2);
    assert_eq!(store.row_count("contact_base"), 1);

    let entry = store
        .ledger()
        .into_iter()
        .find(|e| e.document_id == 7)
        .unwrap();
    assert_eq!(entry.category, Some(FailureCategory::Duplicate));
}

#[tokio::test]
async fn test_slow_target_times_out_documents() {
    let staging = staging_with(1..=3);
    let store = MemoryStore::new();
    store.set_insert_delay(Duration::from_millis(300));

    let summary = coordinator(
        &staging,
        &store,
        CoordinatorConfig {
            document_timeout: Duration::from_millis(50),
            ..config()
        },
    )
    .run(CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(summary.failed, 3);
    assert_eq!(summary.failures_by_category[&FailureCategory::Timeout], 3);
    assert_eq!(store.total_rows(), 0);
    assert!(store
        .ledger()
        .iter()
        .all(|e| e.category == Some(FailureCategory::Timeout)));
}

#[tokio::test]
async fn test_cancelled_run_dispatches_nothing() {
    let staging = staging_with(1..=5);
    let store = MemoryStore::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let mut coordinator = coordinator(&staging, &store, config());
    let summary = coordinator.run(cancel).await.unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.dispatched, 0);
    assert!(store.ledger().is_empty());
    assert_eq!(coordinator.state(), RunState::Idle);

    // The same coordinator can run again once idle
    let summary = coordinator.run(CancellationToken::new()).await.unwrap();
    assert_eq!(summary.succeeded, 5);
}

#[tokio::test]
async fn test_range_and_document_cap() {
    let staging = staging_with(1..=10);
    let store = MemoryStore::new();

    let summary = coordinator(
        &staging,
        &store,
        CoordinatorConfig {
            batch_size: 2,
            range_start: Some(3),
            range_end: Some(9),
            max_documents: Some(5),
            ..config()
        },
    )
    .run(CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(summary.dispatched, 5);
    assert_eq!(summary.final_cursor, Some(7));
    let mut loaded: Vec<i64> = store.ledger().iter().map(|e| e.document_id).collect();
    loaded.sort_unstable();
    assert_eq!(loaded, vec![3, 4, 5, 6, 7]);
}

struct BrokenStaging;

#[async_trait]
impl StagingSource for BrokenStaging {
    async fn list_refs(
        &self,
        _after: i64,
        _range_end: Option<i64>,
        _limit: usize,
    ) -> StoreResult<Vec<DocumentRef>> {
        Err(StoreError::Unavailable("staging offline".to_string()))
    }

    async fn fetch_batch(
        &self,
        _id_start: i64,
        _id_end: i64,
        _limit: usize,
    ) -> StoreResult<Vec<SourceDocument>> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn test_staging_outage_terminates_the_run() {
    let store = MemoryStore::new();
    let mut coordinator = Coordinator::new(
        contract(),
        Arc::new(BrokenStaging),
        Arc::new(store.clone()),
        Arc::new(store),
        config(),
    );

    let err = coordinator.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, IngestError::Store(StoreError::Unavailable(_))));
    assert_eq!(coordinator.state(), RunState::Terminated);
}
