//! PostgreSQL store adapters
//!
//! One [`PgStore`] serves all three store roles from a shared `PgPool`. Each
//! unit of work is a `sqlx` transaction holding its own pooled connection;
//! duplicate reads and ledger lookups run on the pool outside any transaction,
//! so MVCC keeps them from waiting on concurrent writers.
//!
//! Table and column names come from the validated contract and `StoreConfig`
//! and are always quoted when interpolated; values are always bound.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgPool, PgRow};
use sqlx::query::Query;
use sqlx::{Postgres, QueryBuilder, Row, Transaction, TypeInfo, ValueRef};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;
use uuid::Uuid;

use super::{LedgerStore, StagingSource, TableName, TargetStore, UnitOfWork};
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::types::{DocumentRef, LedgerEntry, SourceDocument};
use crate::value::Value;

/// Quote a single identifier
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a possibly schema-qualified name such as `staging.app_xml`
pub fn quote_qualified(name: &str) -> String {
    name.split('.').map(quote_ident).collect::<Vec<_>>().join(".")
}

fn quote_table(table: TableName<'_>) -> String {
    format!("{}.{}", quote_ident(table.schema), quote_ident(table.table))
}

fn clamp_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn push_value(builder: &mut QueryBuilder<'_, Postgres>, value: &Value) {
    match value {
        Value::Text(s) => builder.push_bind(s.clone()),
        Value::Int(i) => builder.push_bind(*i),
        Value::Decimal(d) => builder.push_bind(d.clone()),
        Value::Bool(b) => builder.push_bind(*b),
        Value::Date(d) => builder.push_bind(*d),
        Value::DateTime(dt) => builder.push_bind(*dt),
    };
}

/// Decode the first column of a `RETURNING` row whatever its SQL type
fn decode_key(row: &PgRow) -> StoreResult<Value> {
    let type_name = {
        let raw = row.try_get_raw(0)?;
        if raw.is_null() {
            return Err(StoreError::Unsupported("insert returned a NULL key".to_string()));
        }
        raw.type_info().name().to_string()
    };

    let value = match type_name.as_str() {
        "INT8" => Value::Int(row.try_get::<i64, _>(0)?),
        "INT4" => Value::Int(i64::from(row.try_get::<i32, _>(0)?)),
        "INT2" => Value::Int(i64::from(row.try_get::<i16, _>(0)?)),
        "NUMERIC" => Value::Decimal(row.try_get::<BigDecimal, _>(0)?),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => Value::Text(row.try_get::<String, _>(0)?),
        "UUID" => Value::Text(row.try_get::<Uuid, _>(0)?.to_string()),
        other => {
            return Err(StoreError::Unsupported(format!(
                "key column of type {other}"
            )))
        }
    };
    Ok(value)
}

fn map_write_error(table: TableName<'_>, err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) => StoreError::Constraint {
            table: table.to_string(),
            message: db.message().to_string(),
        },
        _ => StoreError::Database(err),
    }
}

fn ledger_insert_sql(ledger_table: &str) -> String {
    format!(
        "INSERT INTO {} (document_id, status, failure_category, reason, recorded_at, run_id, batch_start, batch_end) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        quote_qualified(ledger_table)
    )
}

fn bind_ledger<'q>(
    query: Query<'q, Postgres, PgArguments>,
    entry: &'q LedgerEntry,
) -> Query<'q, Postgres, PgArguments> {
    query
        .bind(entry.document_id)
        .bind(entry.status.as_str())
        .bind(entry.category.map(|c| c.as_str()))
        .bind(entry.reason.as_deref())
        .bind(entry.recorded_at)
        .bind(entry.run_id)
        .bind(entry.batch_start)
        .bind(entry.batch_end)
}

type LedgerRow = (
    i64,
    String,
    Option<String>,
    Option<String>,
    DateTime<Utc>,
    Uuid,
    i64,
    i64,
);

fn ledger_entry_from_row(row: LedgerRow) -> StoreResult<LedgerEntry> {
    let (document_id, status, category, reason, recorded_at, run_id, batch_start, batch_end) = row;
    Ok(LedgerEntry {
        document_id,
        status: status.parse().map_err(StoreError::Unsupported)?,
        category: category
            .map(|c| c.parse())
            .transpose()
            .map_err(StoreError::Unsupported)?,
        reason,
        recorded_at,
        run_id,
        batch_start,
        batch_end,
    })
}

/// Staging, target and ledger access over one connection pool
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    config: StoreConfig,
    ledger_sql: String,
}

impl PgStore {
    pub fn new(pool: PgPool, config: StoreConfig) -> Self {
        let ledger_sql = ledger_insert_sql(&config.ledger_table);
        Self {
            pool,
            config,
            ledger_sql,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Fail fast when the database is unreachable
    pub async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn staging(&self) -> (String, String, String) {
        (
            quote_qualified(&self.config.staging_table),
            quote_ident(&self.config.staging_id_column),
            quote_ident(&self.config.staging_payload_column),
        )
    }
}

#[async_trait]
impl StagingSource for PgStore {
    async fn list_refs(
        &self,
        after: i64,
        range_end: Option<i64>,
        limit: usize,
    ) -> StoreResult<Vec<DocumentRef>> {
        let (table, id, _) = self.staging();
        let sql = format!(
            "SELECT {id}::BIGINT FROM {table} \
             WHERE {id} > $1 AND ($2::BIGINT IS NULL OR {id} <= $2) \
             ORDER BY {id} LIMIT $3"
        );
        let ids: Vec<i64> = sqlx::query_scalar(&sql)
            .bind(after)
            .bind(range_end)
            .bind(clamp_limit(limit))
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().map(DocumentRef::new).collect())
    }

    async fn fetch_batch(
        &self,
        id_start: i64,
        id_end: i64,
        limit: usize,
    ) -> StoreResult<Vec<SourceDocument>> {
        let (table, id, payload) = self.staging();
        let sql = format!(
            "SELECT {id}::BIGINT, {payload}::TEXT FROM {table} \
             WHERE {id} BETWEEN $1 AND $2 ORDER BY {id} LIMIT $3"
        );
        let rows: Vec<(i64, Option<String>)> = sqlx::query_as(&sql)
            .bind(id_start)
            .bind(id_end)
            .bind(clamp_limit(limit))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(document_id, payload)| SourceDocument {
                document_id,
                payload: payload.unwrap_or_default(),
            })
            .collect())
    }

    async fn fetch_documents(&self, refs: &[DocumentRef]) -> StoreResult<Vec<SourceDocument>> {
        if refs.is_empty() {
            return Ok(Vec::new());
        }
        let (table, id, payload) = self.staging();
        let sql = format!(
            "SELECT {id}::BIGINT, {payload}::TEXT FROM {table} \
             WHERE {id} = ANY($1) ORDER BY {id}"
        );
        let ids: Vec<i64> = refs.iter().map(|r| r.document_id).collect();
        let rows: Vec<(i64, Option<String>)> = sqlx::query_as(&sql)
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(document_id, payload)| SourceDocument {
                document_id,
                payload: payload.unwrap_or_default(),
            })
            .collect())
    }
}

#[async_trait]
impl TargetStore for PgStore {
    async fn begin_unit_of_work(&self) -> StoreResult<Box<dyn UnitOfWork>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgUnitOfWork {
            tx,
            ledger_sql: self.ledger_sql.clone(),
        }))
    }

    async fn exists_row(
        &self,
        table: TableName<'_>,
        key_column: &str,
        key: &Value,
    ) -> StoreResult<bool> {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT EXISTS(SELECT 1 FROM ");
        builder.push(quote_table(table));
        builder.push(" WHERE ");
        builder.push(quote_ident(key_column));
        builder.push(" = ");
        push_value(&mut builder, key);
        builder.push(")");
        let exists: bool = builder
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn append(&self, entry: &LedgerEntry) -> StoreResult<()> {
        bind_ledger(sqlx::query(&self.ledger_sql), entry)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn has_terminal_entry(&self, document_id: i64) -> StoreResult<bool> {
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE document_id = $1 AND status IN ('success', 'failed'))",
            quote_qualified(&self.config.ledger_table)
        );
        let exists: bool = sqlx::query_scalar(&sql)
            .bind(document_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn terminal_ids(&self, ids: &[i64]) -> StoreResult<HashSet<i64>> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let sql = format!(
            "SELECT DISTINCT document_id FROM {} \
             WHERE document_id = ANY($1) AND status IN ('success', 'failed')",
            quote_qualified(&self.config.ledger_table)
        );
        let done: Vec<i64> = sqlx::query_scalar(&sql)
            .bind(ids.to_vec())
            .fetch_all(&self.pool)
            .await?;
        Ok(done.into_iter().collect())
    }

    async fn entries_for(&self, document_id: i64) -> StoreResult<Vec<LedgerEntry>> {
        let sql = format!(
            "SELECT document_id, status, failure_category, reason, recorded_at, run_id, batch_start, batch_end \
             FROM {} WHERE document_id = $1 ORDER BY recorded_at",
            quote_qualified(&self.config.ledger_table)
        );
        let rows: Vec<LedgerRow> = sqlx::query_as(&sql)
            .bind(document_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(ledger_entry_from_row).collect()
    }
}

/// One document's transaction
pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
    ledger_sql: String,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn insert_row(
        &mut self,
        table: TableName<'_>,
        key_column: Option<&str>,
        columns: &BTreeMap<String, Value>,
    ) -> StoreResult<Option<Value>> {
        let mut builder = QueryBuilder::<Postgres>::new("INSERT INTO ");
        builder.push(quote_table(table));

        if columns.is_empty() {
            builder.push(" DEFAULT VALUES");
        } else {
            let names: Vec<String> = columns.keys().map(|c| quote_ident(c)).collect();
            builder.push(" (");
            builder.push(names.join(", "));
            builder.push(") VALUES (");
            for (i, value) in columns.values().enumerate() {
                if i > 0 {
                    builder.push(", ");
                }
                push_value(&mut builder, value);
            }
            builder.push(")");
        }

        match key_column {
            Some(key) => {
                builder.push(" RETURNING ");
                builder.push(quote_ident(key));
                let row = builder
                    .build()
                    .fetch_one(&mut *self.tx)
                    .await
                    .map_err(|e| map_write_error(table, e))?;
                Ok(Some(decode_key(&row)?))
            }
            None => {
                builder
                    .build()
                    .execute(&mut *self.tx)
                    .await
                    .map_err(|e| map_write_error(table, e))?;
                Ok(None)
            }
        }
    }

    async fn append_ledger(&mut self, entry: &LedgerEntry) -> StoreResult<()> {
        bind_ledger(sqlx::query(&self.ledger_sql), entry)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.tx.rollback().await?;
        debug!("Rolled back unit of work");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_quoting() {
        assert_eq!(quote_ident("app_base"), "\"app_base\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_qualified("staging.app_xml"), "\"staging\".\"app_xml\"");
        assert_eq!(
            quote_table(TableName::new("dbo", "contact_base")),
            "\"dbo\".\"contact_base\""
        );
    }

    #[test]
    fn test_ledger_insert_sql_targets_configured_table() {
        let sql = ledger_insert_sql("ops.processing_log");
        assert!(sql.starts_with("INSERT INTO \"ops\".\"processing_log\""));
        assert!(sql.contains("$8"));
    }

    #[test]
    fn test_ledger_row_decoding() {
        let run_id = Uuid::new_v4();
        let entry = ledger_entry_from_row((
            1001,
            "failed".to_string(),
            Some("duplicate".to_string()),
            Some("already loaded".to_string()),
            Utc::now(),
            run_id,
            1000,
            1100,
        ))
        .unwrap();
        assert_eq!(entry.category, Some(crate::error::FailureCategory::Duplicate));
        assert_eq!(entry.run_id, run_id);

        let bad = ledger_entry_from_row((
            1,
            "pending".to_string(),
            None,
            None,
            Utc::now(),
            run_id,
            0,
            0,
        ));
        assert!(matches!(bad, Err(StoreError::Unsupported(_))));
    }

    #[test]
    fn test_limit_clamping() {
        assert_eq!(clamp_limit(10), 10);
        assert_eq!(clamp_limit(usize::MAX), i64::MAX);
    }
}
