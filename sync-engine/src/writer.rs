//! Batched, idempotent writes into the target table.
use std::collections::{HashMap, HashSet};
use std::time::Instant;

use sync_common::keys::KeyExtractor;
use sync_common::record::Record;
use tracing::{debug, info};

use crate::catalog::InterfaceMeta;
use crate::error::{ConfigError, MappingError, WriteError};
use crate::mapper::{MappedRecord, RejectedRecord};
use crate::metrics_consts::{RECORDS_DELETED, RECORDS_WRITTEN, WRITE_BATCH_MS};
use crate::sql::{validate_identifier, TableRef};
use crate::store::{TargetColumn, TargetStore, UpsertOutcome};

pub const DEFAULT_WRITE_BATCH_SIZE: usize = 500;
pub const MIN_WRITE_BATCH_SIZE: usize = 100;
pub const MAX_WRITE_BATCH_SIZE: usize = 500;
pub const DEFAULT_DELETE_BATCH_SIZE: usize = 100;

/// Rows ready to be written: one per primary key, in first-seen key order.
#[derive(Debug, Default)]
pub struct PreparedRows {
    pub rows: Vec<MappedRecord>,
    /// Primary key of each row, in its text form.
    pub keys: Vec<Vec<String>>,
    pub rejected: Vec<RejectedRecord>,
    /// Keys of rejected records that still exist at the source. Never treated as stale.
    pub protected: Vec<Vec<String>>,
}

impl PreparedRows {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Every key the target must keep after a full sync.
    pub fn retained_keys(&self) -> Vec<Vec<String>> {
        self.keys.iter().chain(&self.protected).cloned().collect()
    }
}

pub struct DataWriter<'a> {
    store: &'a dyn TargetStore,
    interface: &'a InterfaceMeta,
    table: TableRef,
    key_columns: Vec<String>,
    batch_size: usize,
    delete_batch_size: usize,
}

impl<'a> DataWriter<'a> {
    pub fn new(store: &'a dyn TargetStore, interface: &'a InterfaceMeta) -> Result<Self, ConfigError> {
        let table = interface.table_ref()?;
        let key_columns = interface.primary_key();
        for column in &key_columns {
            validate_identifier(column)?;
        }

        Ok(Self {
            store,
            interface,
            table,
            key_columns,
            batch_size: DEFAULT_WRITE_BATCH_SIZE,
            delete_batch_size: DEFAULT_DELETE_BATCH_SIZE,
        })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(MIN_WRITE_BATCH_SIZE, MAX_WRITE_BATCH_SIZE);
        self
    }

    pub fn with_delete_batch_size(mut self, delete_batch_size: usize) -> Self {
        self.delete_batch_size = delete_batch_size.max(1);
        self
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    pub fn key_columns(&self) -> &[String] {
        &self.key_columns
    }

    /// Rows missing a key column are rejected. Later rows replace earlier rows with the same key.
    pub fn prepare(&self, mapped: Vec<MappedRecord>) -> PreparedRows {
        let extractor = KeyExtractor::new(&self.key_columns);
        let mut prepared = PreparedRows::default();
        let mut positions: HashMap<Vec<String>, usize> = HashMap::new();

        for row in mapped {
            let key = match extractor.try_key(&row.record) {
                Ok(key) => key,
                Err(missing) => {
                    prepared.rejected.push(RejectedRecord {
                        index: row.index,
                        error: MappingError::MissingKey(missing.to_owned()),
                    });
                    continue;
                }
            };

            match positions.get(&key) {
                Some(&position) => prepared.rows[position] = row,
                None => {
                    positions.insert(key.clone(), prepared.rows.len());
                    prepared.rows.push(row);
                    prepared.keys.push(key);
                }
            }
        }

        if !prepared.rejected.is_empty() {
            debug!(rejected = prepared.rejected.len(), "rows without a complete primary key");
        }
        prepared
    }

    /// Union of the columns present on any row, in declared field order.
    pub fn columns(&self, rows: &[MappedRecord]) -> Vec<TargetColumn> {
        let present: HashSet<&str> = rows
            .iter()
            .flat_map(|row| row.record.keys().map(String::as_str))
            .collect();

        self.interface
            .fields
            .iter()
            .filter(|field| present.contains(field.name_en.as_str()))
            .map(|field| TargetColumn {
                name: field.name_en.clone(),
                kind: field.kind(),
            })
            .collect()
    }

    /// Upsert every prepared row. The first failing batch aborts the write.
    pub async fn upsert(&self, prepared: &PreparedRows) -> Result<UpsertOutcome, WriteError> {
        let mut outcome = UpsertOutcome::default();
        if prepared.is_empty() {
            return Ok(outcome);
        }

        let columns = self.columns(&prepared.rows);
        for (batch, chunk) in prepared.rows.chunks(self.batch_size).enumerate() {
            let rows: Vec<Record> = chunk.iter().map(|row| row.record.clone()).collect();
            let started = Instant::now();

            let written = self
                .store
                .upsert(&self.table, &columns, &self.key_columns, &rows)
                .await
                .map_err(|error| WriteError::Batch { batch, error })?;

            metrics::histogram!(WRITE_BATCH_MS).record(started.elapsed().as_millis() as f64);
            metrics::counter!(RECORDS_WRITTEN, &[("kind", "inserted")]).increment(written.inserted);
            metrics::counter!(RECORDS_WRITTEN, &[("kind", "updated")]).increment(written.updated);
            debug!(
                batch,
                rows = rows.len(),
                inserted = written.inserted,
                updated = written.updated,
                "wrote batch"
            );

            outcome.inserted += written.inserted;
            outcome.updated += written.updated;
        }

        info!(
            table = %self.table,
            inserted = outcome.inserted,
            updated = outcome.updated,
            "upserted rows"
        );
        Ok(outcome)
    }

    /// Keys present in the target table but not in `incoming`.
    pub async fn stale_keys(&self, incoming: &[Vec<String>]) -> Result<Vec<Vec<String>>, WriteError> {
        let incoming: HashSet<&Vec<String>> = incoming.iter().collect();
        let existing = self
            .store
            .existing_keys(&self.table, &self.key_columns)
            .await
            .map_err(WriteError::ExistingKeys)?;

        Ok(existing
            .into_iter()
            .filter(|key| !incoming.contains(key))
            .collect())
    }

    pub async fn delete(&self, keys: &[Vec<String>]) -> Result<u64, WriteError> {
        let mut deleted = 0;
        for chunk in keys.chunks(self.delete_batch_size) {
            deleted += self
                .store
                .delete_keys(&self.table, &self.key_columns, chunk)
                .await
                .map_err(WriteError::Delete)?;
        }

        if deleted > 0 {
            metrics::counter!(RECORDS_DELETED).increment(deleted);
            info!(table = %self.table, deleted, "deleted stale rows");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use serde_json::json;

    fn interface() -> InterfaceMeta {
        serde_json::from_value(json!({
            "library_id": "lib",
            "interface_id": "people",
            "schema": "thematic",
            "table": "people",
            "fields": [
                {"name_en": "id", "data_type": "bigint", "is_primary_key": true},
                {"name_en": "name"},
                {"name_en": "age", "data_type": "int"}
            ]
        }))
        .unwrap()
    }

    fn mapped(rows: Vec<serde_json::Value>) -> Vec<MappedRecord> {
        rows.into_iter()
            .enumerate()
            .map(|(index, value)| MappedRecord {
                index,
                record: Record::from_json(value).unwrap(),
            })
            .collect()
    }

    #[test]
    fn test_prepare_dedups_and_rejects() {
        let store = MemoryStore::new();
        let interface = interface();
        let writer = DataWriter::new(&store, &interface).unwrap();

        let prepared = writer.prepare(mapped(vec![
            json!({"id": 1, "name": "a"}),
            json!({"name": "no key"}),
            json!({"id": 2, "name": "b"}),
            json!({"id": 1, "name": "a2"}),
        ]));

        assert_eq!(prepared.keys, vec![vec!["1".to_owned()], vec!["2".to_owned()]]);
        assert_eq!(prepared.rows[0].index, 3);
        assert_eq!(prepared.rows[0].record.get_str("name"), Ok("a2"));
        assert_eq!(prepared.rejected.len(), 1);
        assert_eq!(prepared.rejected[0].error, MappingError::MissingKey("id".to_owned()));
    }

    #[test]
    fn test_prepare_names_missing_composite_key_column() {
        let store = MemoryStore::new();
        let interface: InterfaceMeta = serde_json::from_value(json!({
            "library_id": "lib",
            "interface_id": "scores",
            "schema": "thematic",
            "table": "scores",
            "fields": [
                {"name_en": "tenant", "is_primary_key": true},
                {"name_en": "id", "data_type": "bigint", "is_primary_key": true},
                {"name_en": "score", "data_type": "int"}
            ]
        }))
        .unwrap();
        let writer = DataWriter::new(&store, &interface).unwrap();

        let prepared = writer.prepare(mapped(vec![
            json!({"tenant": "a", "id": 1}),
            json!({"tenant": "a", "score": 3}),
        ]));

        assert_eq!(prepared.keys, vec![vec!["a".to_owned(), "1".to_owned()]]);
        assert_eq!(prepared.rejected[0].index, 1);
        assert_eq!(prepared.rejected[0].error, MappingError::MissingKey("id".to_owned()));
    }

    #[test]
    fn test_columns_follow_declared_order() {
        let store = MemoryStore::new();
        let interface = interface();
        let writer = DataWriter::new(&store, &interface).unwrap();

        let columns = writer.columns(&mapped(vec![json!({"age": 3, "id": 1}), json!({"name": "x", "id": 2})]));
        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "name", "age"]);
    }

    #[test]
    fn test_batch_size_is_clamped() {
        let store = MemoryStore::new();
        let interface = interface();
        assert_eq!(DataWriter::new(&store, &interface).unwrap().with_batch_size(1).batch_size, 100);
        assert_eq!(DataWriter::new(&store, &interface).unwrap().with_batch_size(10_000).batch_size, 500);
    }

    #[tokio::test]
    async fn test_upsert_and_delete_stale() {
        let store = MemoryStore::new();
        let interface = interface();
        let writer = DataWriter::new(&store, &interface).unwrap();
        store.insert_rows(
            writer.table(),
            vec![
                Record::from_json(json!({"id": 1, "name": "old"})).unwrap(),
                Record::from_json(json!({"id": 9, "name": "gone"})).unwrap(),
            ],
        );

        let prepared = writer.prepare(mapped(vec![json!({"id": 1, "name": "new"}), json!({"id": 2})]));
        let stale = writer.stale_keys(&prepared.keys).await.unwrap();
        assert_eq!(stale, vec![vec!["9".to_owned()]]);
        assert_eq!(writer.delete(&stale).await.unwrap(), 1);

        let outcome = writer.upsert(&prepared).await.unwrap();
        assert_eq!(outcome, UpsertOutcome { inserted: 1, updated: 1 });

        let rows = store.rows(writer.table());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get_str("name"), Ok("new"));
    }

    #[tokio::test]
    async fn test_failed_batch_aborts() {
        let store = MemoryStore::new();
        store.fail_upserts_after(0);
        let interface = interface();
        let writer = DataWriter::new(&store, &interface).unwrap();

        let prepared = writer.prepare(mapped(vec![json!({"id": 1})]));
        let err = writer.upsert(&prepared).await.unwrap_err();
        assert!(matches!(err, WriteError::Batch { batch: 0, .. }));
    }
}
