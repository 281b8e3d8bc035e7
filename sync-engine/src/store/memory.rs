//! In-memory implementation of every store trait, used by tests and dry runs.
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use sync_common::keys::KeyExtractor;
use sync_common::record::{compare_loose, Record, Value};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::lineage::LineageRecord;
use crate::sql::TableRef;
use crate::store::{
    ExecutionRecord, ExecutionStore, ScanRequest, SourceStore, TargetColumn, TargetStore,
    UpsertOutcome,
};

#[derive(Default)]
struct State {
    tables: HashMap<TableRef, Vec<Record>>,
    queries: HashMap<String, Vec<Record>>,
    executions: Vec<ExecutionRecord>,
    lineage: Vec<LineageRecord>,
    page_requests: usize,
    upserts_before_failure: Option<usize>,
    fail_lineage: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_rows(&self, table: &TableRef, rows: Vec<Record>) {
        self.state()
            .tables
            .entry(table.clone())
            .or_default()
            .extend(rows);
    }

    pub fn rows(&self, table: &TableRef) -> Vec<Record> {
        self.state().tables.get(table).cloned().unwrap_or_default()
    }

    /// Answer `sql`, compared verbatim, with `rows`.
    pub fn register_query(&self, sql: &str, rows: Vec<Record>) {
        self.state().queries.insert(sql.to_owned(), rows);
    }

    /// Let `calls` upserts succeed, then fail every following one.
    pub fn fail_upserts_after(&self, calls: usize) {
        self.state().upserts_before_failure = Some(calls);
    }

    pub fn fail_lineage(&self) {
        self.state().fail_lineage = true;
    }

    pub fn page_requests(&self) -> usize {
        self.state().page_requests
    }

    pub fn executions(&self) -> Vec<ExecutionRecord> {
        self.state().executions.clone()
    }

    pub fn execution(&self, id: Uuid) -> Option<ExecutionRecord> {
        self.state().executions.iter().find(|e| e.id == id).cloned()
    }

    pub fn lineage(&self) -> Vec<LineageRecord> {
        self.state().lineage.clone()
    }
}

/// Ascending order over the given fields with nulls last, as Postgres sorts.
fn compare_rows(a: &Record, b: &Record, order_by: &[String]) -> Ordering {
    for field in order_by {
        let (x, y) = (a.value(field), b.value(field));
        let ordering = match (x.is_null(), y.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => compare_loose(x, y),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

#[async_trait]
impl SourceStore for MemoryStore {
    async fn fetch_page(&self, scan: &ScanRequest<'_>) -> StoreResult<Vec<Record>> {
        let mut state = self.state();
        state.page_requests += 1;

        let now = Utc::now();
        let mut rows: Vec<Record> = state
            .tables
            .get(scan.table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| scan.filter.map(|f| f.matches(row, now)).unwrap_or(true))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by(|a, b| compare_rows(a, b, scan.order_by));

        Ok(rows.into_iter().skip(scan.offset).take(scan.limit).collect())
    }

    async fn run_query(
        &self,
        sql: &str,
        _params: &[Value],
        max_rows: usize,
    ) -> StoreResult<Vec<Record>> {
        match self.state().queries.get(sql) {
            Some(rows) => Ok(rows.iter().take(max_rows).cloned().collect()),
            None => Err(StoreError::Rejected {
                command: "SELECT".to_owned(),
                reason: format!("no rows registered for query {}", sql),
            }),
        }
    }
}

#[async_trait]
impl TargetStore for MemoryStore {
    async fn upsert(
        &self,
        table: &TableRef,
        columns: &[TargetColumn],
        key_columns: &[String],
        rows: &[Record],
    ) -> StoreResult<UpsertOutcome> {
        let mut state = self.state();
        if let Some(remaining) = state.upserts_before_failure.as_mut() {
            if *remaining == 0 {
                return Err(StoreError::Rejected {
                    command: "INSERT".to_owned(),
                    reason: "upsert failure injected".to_owned(),
                });
            }
            *remaining -= 1;
        }

        let extractor = KeyExtractor::new(key_columns);
        let stored = state.tables.entry(table.clone()).or_default();
        let mut outcome = UpsertOutcome::default();

        for row in rows {
            let key = extractor.complete_key(row).ok_or_else(|| StoreError::Rejected {
                command: "INSERT".to_owned(),
                reason: "row has a null key column".to_owned(),
            })?;

            let existing = stored
                .iter_mut()
                .find(|candidate| extractor.complete_key(candidate).as_ref() == Some(&key));

            match existing {
                Some(current) => {
                    for column in columns {
                        current.insert(column.name.clone(), row.value(&column.name).clone());
                    }
                    outcome.updated += 1;
                }
                None => {
                    stored.push(
                        columns
                            .iter()
                            .map(|column| (column.name.clone(), row.value(&column.name).clone()))
                            .collect(),
                    );
                    outcome.inserted += 1;
                }
            }
        }

        Ok(outcome)
    }

    async fn existing_keys(
        &self,
        table: &TableRef,
        key_columns: &[String],
    ) -> StoreResult<Vec<Vec<String>>> {
        let extractor = KeyExtractor::new(key_columns);
        Ok(self
            .state()
            .tables
            .get(table)
            .map(|rows| rows.iter().filter_map(|row| extractor.complete_key(row)).collect())
            .unwrap_or_default())
    }

    async fn delete_keys(
        &self,
        table: &TableRef,
        key_columns: &[String],
        keys: &[Vec<String>],
    ) -> StoreResult<u64> {
        let extractor = KeyExtractor::new(key_columns);
        let doomed: HashSet<&Vec<String>> = keys.iter().collect();
        let mut state = self.state();
        let Some(rows) = state.tables.get_mut(table) else {
            return Ok(0);
        };

        let before = rows.len();
        rows.retain(|row| match extractor.complete_key(row) {
            Some(key) => !doomed.contains(&key),
            None => true,
        });
        Ok((before - rows.len()) as u64)
    }

    async fn max_value(&self, table: &TableRef, column: &str) -> StoreResult<Option<String>> {
        Ok(self.state().tables.get(table).and_then(|rows| {
            rows.iter()
                .map(|row| row.value(column))
                .filter(|value| !value.is_null())
                .max_by(|a, b| compare_loose(a, b))
                .map(|value| value.to_string())
        }))
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn begin_execution(&self, execution: &ExecutionRecord) -> StoreResult<()> {
        self.state().executions.push(execution.clone());
        Ok(())
    }

    async fn finish_execution(&self, execution: &ExecutionRecord) -> StoreResult<()> {
        let mut state = self.state();
        match state.executions.iter_mut().find(|e| e.id == execution.id) {
            Some(current) => {
                *current = execution.clone();
                Ok(())
            }
            None => Err(StoreError::Rejected {
                command: "UPDATE".to_owned(),
                reason: format!("execution {} was never started", execution.id),
            }),
        }
    }

    async fn insert_lineage(&self, rows: &[LineageRecord]) -> StoreResult<()> {
        let mut state = self.state();
        if state.fail_lineage {
            return Err(StoreError::Rejected {
                command: "INSERT".to_owned(),
                reason: "lineage failure injected".to_owned(),
            });
        }
        state.lineage.extend_from_slice(rows);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ColumnKind;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        Record::from_json(value).unwrap()
    }

    fn columns(names: &[&str]) -> Vec<TargetColumn> {
        names
            .iter()
            .map(|name| TargetColumn {
                name: name.to_string(),
                kind: ColumnKind::Text,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_upsert_inserts_then_updates() {
        let store = MemoryStore::new();
        let table = TableRef::new("dw", "people").unwrap();
        let keys = vec!["id".to_owned()];

        let first = store
            .upsert(&table, &columns(&["id", "name"]), &keys, &[record(json!({"id": 1, "name": "a"}))])
            .await
            .unwrap();
        let second = store
            .upsert(
                &table,
                &columns(&["id", "name"]),
                &keys,
                &[record(json!({"id": 1, "name": "b"})), record(json!({"id": 2}))],
            )
            .await
            .unwrap();

        assert_eq!(first, UpsertOutcome { inserted: 1, updated: 0 });
        assert_eq!(second, UpsertOutcome { inserted: 1, updated: 1 });
        let rows = store.rows(&table);
        assert_eq!(rows[0].get_str("name"), Ok("b"));
        assert_eq!(rows[1].value("name"), &Value::Null);
    }

    #[tokio::test]
    async fn test_fetch_page_orders_nulls_last() {
        let store = MemoryStore::new();
        let table = TableRef::new("src", "t").unwrap();
        store.insert_rows(
            &table,
            vec![
                record(json!({"id": 3, "v": null})),
                record(json!({"id": 10, "v": 1})),
                record(json!({"id": 2, "v": 1})),
            ],
        );
        let order = vec!["v".to_owned(), "id".to_owned()];

        let page = store
            .fetch_page(&ScanRequest {
                table: &table,
                filter: None,
                order_by: &order,
                limit: 10,
                offset: 0,
            })
            .await
            .unwrap();

        let ids: Vec<i64> = page.iter().map(|r| r.get_i64("id").unwrap()).collect();
        assert_eq!(ids, vec![2, 10, 3]);
    }

    #[tokio::test]
    async fn test_delete_and_max_value() {
        let store = MemoryStore::new();
        let table = TableRef::new("dw", "t").unwrap();
        store.insert_rows(
            &table,
            vec![record(json!({"id": 1, "n": 9})), record(json!({"id": 2, "n": 10}))],
        );
        let keys = vec!["id".to_owned()];

        assert_eq!(store.max_value(&table, "n").await.unwrap(), Some("10".to_owned()));
        assert_eq!(
            store.delete_keys(&table, &keys, &[vec!["1".to_owned()]]).await.unwrap(),
            1
        );
        assert_eq!(
            store.existing_keys(&table, &keys).await.unwrap(),
            vec![vec!["2".to_owned()]]
        );
    }

    #[tokio::test]
    async fn test_injected_upsert_failure() {
        let store = MemoryStore::new();
        let table = TableRef::new("dw", "t").unwrap();
        let keys = vec!["id".to_owned()];
        store.fail_upserts_after(1);

        let rows = [record(json!({"id": 1}))];
        assert!(store.upsert(&table, &columns(&["id"]), &keys, &rows).await.is_ok());
        assert!(store.upsert(&table, &columns(&["id"]), &keys, &rows).await.is_err());
    }
}
