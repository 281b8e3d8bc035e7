//! PostgreSQL implementation of the store traits.
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::Postgres;
use sync_common::record::{Record, Value};
use tracing::debug;

use crate::catalog::ColumnKind;
use crate::error::{StoreError, StoreResult};
use crate::lineage::LineageRecord;
use crate::sql::{self, TableRef};
use crate::store::{
    ExecutionRecord, ExecutionStore, ScanRequest, SourceStore, TargetColumn, TargetStore,
    UpsertOutcome,
};

/// Postgres accepts at most this many bind parameters per statement.
const MAX_BIND_PARAMETERS: usize = 65535;

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

fn query_error(command: &str) -> impl FnOnce(sqlx::Error) -> StoreError + '_ {
    move |error| StoreError::QueryError {
        command: command.to_owned(),
        error,
    }
}

/// Bind a value by its own type. Used for raw query parameters.
fn bind_dynamic<'q>(query: PgQuery<'q>, value: &Value) -> PgQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Int(i) => query.bind(*i),
        Value::Float(x) => query.bind(*x),
        Value::String(s) => query.bind(s.clone()),
        Value::Timestamp(ts) => query.bind(*ts),
        Value::List(_) | Value::Map(_) => query.bind(Json(serde_json::Value::from(value.clone()))),
    }
}

/// Bind a value as the declared column type. Nulls are bound as typed NULLs.
fn bind_column<'q>(
    query: PgQuery<'q>,
    column: &TargetColumn,
    value: &Value,
) -> StoreResult<PgQuery<'q>> {
    let rejected = || StoreError::Rejected {
        command: "INSERT".to_owned(),
        reason: format!("cannot bind {} to column {}", value, column.name),
    };
    let null = value.is_null();

    let query = match column.kind {
        ColumnKind::Integer => {
            let v = match null {
                true => None,
                false => Some(
                    value
                        .as_i64()
                        .and_then(|i| i32::try_from(i).ok())
                        .ok_or_else(rejected)?,
                ),
            };
            query.bind(v)
        }
        ColumnKind::BigInt => {
            let v = match null {
                true => None,
                false => Some(value.as_i64().ok_or_else(rejected)?),
            };
            query.bind(v)
        }
        ColumnKind::Float => {
            let v = match null {
                true => None,
                false => Some(value.as_f64().ok_or_else(rejected)?),
            };
            query.bind(v)
        }
        ColumnKind::Bool => {
            let v = match null {
                true => None,
                false => Some(value.as_bool().ok_or_else(rejected)?),
            };
            query.bind(v)
        }
        ColumnKind::Timestamp => {
            let v: Option<DateTime<Utc>> = match null {
                true => None,
                false => Some(value.as_timestamp().ok_or_else(rejected)?),
            };
            query.bind(v)
        }
        ColumnKind::Json => {
            let v = match null {
                true => None,
                false => Some(Json(serde_json::Value::from(value.clone()))),
            };
            query.bind(v)
        }
        ColumnKind::Text | ColumnKind::Other => {
            let v = match null {
                true => None,
                false => Some(value.to_string()),
            };
            query.bind(v)
        }
    };

    Ok(query)
}

/// Store backed by a PostgreSQL connection pool. One pool serves one database; sources,
/// target and bookkeeping may each get their own.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn new(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        Ok(Self::new_from_pool(pool))
    }

    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SourceStore for PgStore {
    async fn fetch_page(&self, scan: &ScanRequest<'_>) -> StoreResult<Vec<Record>> {
        let rendered = match scan.filter {
            Some(filter) => filter.render(1)?,
            None => None,
        };
        let (predicate, params) = match rendered {
            Some((predicate, params)) => (Some(predicate), params),
            None => (None, vec![]),
        };
        let statement = sql::page_statement(
            scan.table,
            predicate.as_deref(),
            scan.order_by,
            params.len() + 1,
        )?;
        debug!(statement, "fetching page");

        let mut query = sqlx::query_scalar::<_, serde_json::Value>(&statement);
        for param in params {
            query = query.bind(param);
        }
        let rows = query
            .bind(scan.limit as i64)
            .bind(scan.offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(query_error("SELECT"))?;

        rows.into_iter()
            .map(|row| Record::from_json(row).map_err(StoreError::from))
            .collect()
    }

    async fn run_query(
        &self,
        sql_query: &str,
        params: &[Value],
        max_rows: usize,
    ) -> StoreResult<Vec<Record>> {
        let statement = sql::json_rows_statement(sql_query);
        let mut query = sqlx::query(&statement);
        for param in params {
            query = bind_dynamic(query, param);
        }

        let mut rows = query.fetch(&self.pool);
        let mut records = Vec::new();
        while let Some(row) = rows.try_next().await.map_err(query_error("SELECT"))? {
            let json: serde_json::Value =
                sqlx::Row::try_get(&row, "row").map_err(query_error("SELECT"))?;
            records.push(Record::from_json(json)?);
            if records.len() >= max_rows {
                break;
            }
        }

        Ok(records)
    }
}

#[async_trait]
impl TargetStore for PgStore {
    async fn upsert(
        &self,
        table: &TableRef,
        columns: &[TargetColumn],
        key_columns: &[String],
        rows: &[Record],
    ) -> StoreResult<UpsertOutcome> {
        let mut outcome = UpsertOutcome::default();
        if rows.is_empty() || columns.is_empty() {
            return Ok(outcome);
        }

        let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
        let rows_per_statement = (MAX_BIND_PARAMETERS / columns.len()).max(1);

        let mut tx = self.pool.begin().await.map_err(query_error("BEGIN"))?;
        for chunk in rows.chunks(rows_per_statement) {
            let statement = sql::upsert_statement(table, &names, key_columns, chunk.len())?;
            let mut query = sqlx::query(&statement);
            for row in chunk {
                for column in columns {
                    query = bind_column(query, column, row.value(&column.name))?;
                }
            }

            let inserted: Vec<bool> = query
                .fetch_all(&mut *tx)
                .await
                .map_err(query_error("INSERT"))?
                .iter()
                .map(|row| sqlx::Row::try_get::<bool, _>(row, "inserted"))
                .collect::<Result<_, _>>()
                .map_err(query_error("INSERT"))?;

            for flag in inserted {
                match flag {
                    true => outcome.inserted += 1,
                    false => outcome.updated += 1,
                }
            }
        }
        tx.commit().await.map_err(query_error("COMMIT"))?;

        Ok(outcome)
    }

    async fn existing_keys(
        &self,
        table: &TableRef,
        key_columns: &[String],
    ) -> StoreResult<Vec<Vec<String>>> {
        let statement = sql::existing_keys_statement(table, key_columns)?;
        let rows = sqlx::query(&statement)
            .fetch_all(&self.pool)
            .await
            .map_err(query_error("SELECT"))?;

        let mut keys = Vec::with_capacity(rows.len());
        for row in rows {
            let mut key = Vec::with_capacity(key_columns.len());
            for index in 0..key_columns.len() {
                let part: Option<String> =
                    sqlx::Row::try_get(&row, index).map_err(query_error("SELECT"))?;
                match part {
                    Some(part) => key.push(part),
                    None => break,
                }
            }
            if key.len() == key_columns.len() {
                keys.push(key);
            }
        }

        Ok(keys)
    }

    async fn delete_keys(
        &self,
        table: &TableRef,
        key_columns: &[String],
        keys: &[Vec<String>],
    ) -> StoreResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        let statement = sql::delete_statement(table, key_columns, keys.len())?;
        let mut query = sqlx::query(&statement);
        for key in keys {
            for part in key {
                query = query.bind(part.clone());
            }
        }

        let result = query
            .execute(&self.pool)
            .await
            .map_err(query_error("DELETE"))?;
        Ok(result.rows_affected())
    }

    async fn max_value(&self, table: &TableRef, column: &str) -> StoreResult<Option<String>> {
        let statement = sql::max_value_statement(table, column)?;
        sqlx::query_scalar::<_, Option<String>>(&statement)
            .fetch_one(&self.pool)
            .await
            .map_err(query_error("SELECT"))
    }
}

#[async_trait]
impl ExecutionStore for PgStore {
    async fn begin_execution(&self, execution: &ExecutionRecord) -> StoreResult<()> {
        let base_query = r#"
INSERT INTO sync_executions
    (id, task_id, execution_type, status, target_library_id, target_interface_id, started_at)
VALUES
    ($1, $2, $3, $4, $5, $6, $7)
        "#;

        sqlx::query(base_query)
            .bind(execution.id)
            .bind(&execution.task_id)
            .bind(&execution.execution_type)
            .bind(execution.status.as_str())
            .bind(&execution.target_library_id)
            .bind(&execution.target_interface_id)
            .bind(execution.started_at)
            .execute(&self.pool)
            .await
            .map_err(query_error("INSERT"))?;

        Ok(())
    }

    async fn finish_execution(&self, execution: &ExecutionRecord) -> StoreResult<()> {
        let base_query = r#"
UPDATE
    sync_executions
SET
    status = $2,
    finished_at = $3,
    duration_ms = $4,
    failed_phase = $5,
    error = $6,
    result = $7
WHERE
    id = $1
        "#;

        let result = sqlx::query(base_query)
            .bind(execution.id)
            .bind(execution.status.as_str())
            .bind(execution.finished_at)
            .bind(execution.duration_ms)
            .bind(&execution.failed_phase)
            .bind(&execution.error)
            .bind(execution.result.clone().map(Json))
            .execute(&self.pool)
            .await
            .map_err(query_error("UPDATE"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Rejected {
                command: "UPDATE".to_owned(),
                reason: format!("execution {} was never started", execution.id),
            });
        }
        Ok(())
    }

    async fn insert_lineage(&self, rows: &[LineageRecord]) -> StoreResult<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let base_query = r#"
INSERT INTO sync_lineage
    (id, execution_id, target_library_id, target_interface_id, target_record_id,
     source_library_id, source_interface_id, source_record_id, transformation_steps,
     quality_score, created_at)
SELECT
    id, execution_id, target_library_id, target_interface_id, target_record_id,
    source_library_id, source_interface_id, source_record_id, transformation_steps::jsonb,
    quality_score, created_at
FROM
    UNNEST($1::uuid[], $2::uuid[], $3::text[], $4::text[], $5::text[], $6::text[], $7::text[],
           $8::text[], $9::text[], $10::float8[], $11::timestamptz[])
    AS t(id, execution_id, target_library_id, target_interface_id, target_record_id,
         source_library_id, source_interface_id, source_record_id, transformation_steps,
         quality_score, created_at)
        "#;

        let mut steps = Vec::with_capacity(rows.len());
        for row in rows {
            steps.push(
                serde_json::to_string(&row.transformation_steps).map_err(|error| {
                    StoreError::Rejected {
                        command: "INSERT".to_owned(),
                        reason: error.to_string(),
                    }
                })?,
            );
        }

        sqlx::query(base_query)
            .bind(rows.iter().map(|r| r.id).collect::<Vec<_>>())
            .bind(rows.iter().map(|r| r.execution_id).collect::<Vec<_>>())
            .bind(rows.iter().map(|r| r.target_library_id.clone()).collect::<Vec<_>>())
            .bind(rows.iter().map(|r| r.target_interface_id.clone()).collect::<Vec<_>>())
            .bind(rows.iter().map(|r| r.target_record_id.clone()).collect::<Vec<_>>())
            .bind(rows.iter().map(|r| r.source.library_id.clone()).collect::<Vec<_>>())
            .bind(rows.iter().map(|r| r.source.interface_id.clone()).collect::<Vec<_>>())
            .bind(rows.iter().map(|r| r.source.record_id.clone()).collect::<Vec<_>>())
            .bind(steps)
            .bind(rows.iter().map(|r| r.quality_score).collect::<Vec<_>>())
            .bind(rows.iter().map(|r| r.created_at).collect::<Vec<_>>())
            .execute(&self.pool)
            .await
            .map_err(query_error("INSERT"))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lineage::{SourceRef, TransformationStep};
    use crate::store::ExecutionStatus;
    use serde_json::json;
    use uuid::Uuid;

    fn record(value: serde_json::Value) -> Record {
        Record::from_json(value).unwrap()
    }

    async fn create_table(pool: &PgPool) {
        sqlx::query("CREATE SCHEMA IF NOT EXISTS dw")
            .execute(pool)
            .await
            .unwrap();
        sqlx::query(
            "CREATE TABLE dw.people (id INT PRIMARY KEY, name TEXT, score DOUBLE PRECISION, seen_at TIMESTAMPTZ)",
        )
        .execute(pool)
        .await
        .unwrap();
    }

    fn people_columns() -> Vec<TargetColumn> {
        vec![
            TargetColumn {
                name: "id".to_owned(),
                kind: ColumnKind::Integer,
            },
            TargetColumn {
                name: "name".to_owned(),
                kind: ColumnKind::Text,
            },
            TargetColumn {
                name: "score".to_owned(),
                kind: ColumnKind::Float,
            },
            TargetColumn {
                name: "seen_at".to_owned(),
                kind: ColumnKind::Timestamp,
            },
        ]
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a running postgres"]
    async fn test_upsert_counts_inserts_and_updates(db: PgPool) {
        create_table(&db).await;
        let store = PgStore::new_from_pool(db);
        let table = TableRef::new("dw", "people").unwrap();
        let keys = vec!["id".to_owned()];

        let first = store
            .upsert(
                &table,
                &people_columns(),
                &keys,
                &[
                    record(json!({"id": 1, "name": "a", "score": 1.5, "seen_at": "2024-01-01 00:00:00"})),
                    record(json!({"id": 2, "name": null})),
                ],
            )
            .await
            .unwrap();
        let second = store
            .upsert(&table, &people_columns(), &keys, &[record(json!({"id": 2, "name": "b"}))])
            .await
            .unwrap();

        assert_eq!(first, UpsertOutcome { inserted: 2, updated: 0 });
        assert_eq!(second, UpsertOutcome { inserted: 0, updated: 1 });

        let mut keys_found = store.existing_keys(&table, &keys).await.unwrap();
        keys_found.sort();
        assert_eq!(keys_found, vec![vec!["1".to_owned()], vec!["2".to_owned()]]);

        assert_eq!(
            store.delete_keys(&table, &keys, &[vec!["1".to_owned()]]).await.unwrap(),
            1
        );
        assert_eq!(store.max_value(&table, "id").await.unwrap(), Some("2".to_owned()));
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a running postgres"]
    async fn test_fetch_page_and_raw_query(db: PgPool) {
        create_table(&db).await;
        let store = PgStore::new_from_pool(db);
        let table = TableRef::new("dw", "people").unwrap();
        let keys = vec!["id".to_owned()];
        let rows: Vec<Record> = (1..=3).map(|i| record(json!({"id": i}))).collect();
        store.upsert(&table, &people_columns(), &keys, &rows).await.unwrap();

        let page = store
            .fetch_page(&ScanRequest {
                table: &table,
                filter: None,
                order_by: &keys,
                limit: 2,
                offset: 1,
            })
            .await
            .unwrap();
        let ids: Vec<i64> = page.iter().map(|r| r.get_i64("id").unwrap()).collect();
        assert_eq!(ids, vec![2, 3]);

        let rows = store
            .run_query("SELECT id FROM dw.people WHERE id > $1 ORDER BY id", &[Value::Int(1)], 1)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_i64("id"), Ok(2));
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a running postgres"]
    async fn test_execution_and_lineage(db: PgPool) {
        let store = PgStore::new_from_pool(db);
        let now = Utc::now();
        let mut execution = ExecutionRecord {
            id: Uuid::now_v7(),
            task_id: "task".to_owned(),
            execution_type: "manual".to_owned(),
            status: ExecutionStatus::Running,
            target_library_id: "thematic".to_owned(),
            target_interface_id: "people".to_owned(),
            started_at: now,
            finished_at: None,
            duration_ms: None,
            failed_phase: None,
            error: None,
            result: None,
        };
        store.begin_execution(&execution).await.unwrap();

        store
            .insert_lineage(&[LineageRecord {
                id: Uuid::now_v7(),
                execution_id: execution.id,
                target_library_id: "thematic".to_owned(),
                target_interface_id: "people".to_owned(),
                target_record_id: "1".to_owned(),
                source: SourceRef {
                    library_id: "lib".to_owned(),
                    interface_id: "src".to_owned(),
                    record_id: "lib_src_1".to_owned(),
                },
                transformation_steps: vec![TransformationStep::new("field_mapping", "id -> id")],
                quality_score: 90.0,
                created_at: now,
            }])
            .await
            .unwrap();

        execution.status = ExecutionStatus::Success;
        execution.finished_at = Some(Utc::now());
        execution.duration_ms = Some(5);
        execution.result = Some(json!({"success": true}));
        store.finish_execution(&execution).await.unwrap();
    }
}
