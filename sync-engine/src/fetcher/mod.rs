//! Source fetching: paginated interface scans and raw queries.
use std::cmp::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sync_common::keys::fallback_identifier;
use sync_common::record::{compare_loose, Record, SourceRecordInfo, Value};
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, InterfaceMeta};
use crate::config::{
    FieldMappingRules, FilterConfig, FilterOperator, IncrementalConfig, SourceConfig, SourcePlan,
    SqlQueryConfig,
};
use crate::error::{FetchError, StoreError};
use crate::metrics_consts::RECORDS_FETCHED;
use crate::store::{ScanRequest, SourceStore, TargetStore};
use crate::transform::TransformError;

pub mod incremental;
pub mod raw_query;

use incremental::{max_watermark, IncrementalFilter};
use raw_query::RawQueryExecutor;

pub const DEFAULT_PAGE_SIZE: usize = 1000;
const RAW_QUERY_LIBRARY: &str = "sql_query";
const UPDATED_AT_FIELDS: &[&str] = &["updated_at", "updated_time"];

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub page_size: usize,
    pub raw_query_timeout: Duration,
    pub raw_query_max_rows: usize,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            raw_query_timeout: raw_query::DEFAULT_TIMEOUT,
            raw_query_max_rows: raw_query::DEFAULT_MAX_ROWS,
        }
    }
}

/// Highest incremental value seen for one source, the next run's starting point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Watermark {
    pub library_id: String,
    pub interface_id: String,
    pub field: String,
    pub value: String,
}

#[derive(Debug, Default)]
pub struct FetchResult {
    pub records: Vec<SourceRecordInfo>,
    pub total: usize,
    pub watermarks: Vec<Watermark>,
}

pub struct SourceFetcher<'a> {
    catalog: &'a dyn Catalog,
    source: &'a dyn SourceStore,
    target: &'a dyn TargetStore,
    settings: &'a FetchSettings,
}

impl<'a> SourceFetcher<'a> {
    pub fn new(
        catalog: &'a dyn Catalog,
        source: &'a dyn SourceStore,
        target: &'a dyn TargetStore,
        settings: &'a FetchSettings,
    ) -> Self {
        Self {
            catalog,
            source,
            target,
            settings,
        }
    }

    fn raw_executor(&self) -> RawQueryExecutor<'a> {
        RawQueryExecutor::new(
            self.source,
            self.settings.raw_query_timeout,
            self.settings.raw_query_max_rows,
        )
    }

    /// Fetch every configured source in order. Any failure discards everything fetched so far.
    pub async fn fetch(
        &self,
        plan: &SourcePlan,
        target: &InterfaceMeta,
        mapping: &FieldMappingRules,
    ) -> Result<FetchResult, FetchError> {
        let fetched_at = Utc::now();
        let mut result = FetchResult::default();

        match plan {
            SourcePlan::RawQueries(queries) => {
                let rows = self.raw_executor().execute_all(queries).await?;
                for (index, (config, rows)) in queries.iter().zip(rows).enumerate() {
                    let records = raw_query_records(index, config, rows, fetched_at);
                    metrics::counter!(RECORDS_FETCHED, &[("mode", "raw_query")])
                        .increment(records.len() as u64);
                    result.records.extend(records);
                }
            }
            SourcePlan::Interfaces(sources) => {
                for (index, source) in sources.iter().enumerate() {
                    let (records, watermark) = self
                        .fetch_interface(index, source, target, mapping, fetched_at)
                        .await?;
                    info!(
                        library_id = %source.library_id,
                        interface_id = %source.interface_id,
                        records = records.len(),
                        "fetched source"
                    );
                    metrics::counter!(RECORDS_FETCHED, &[("mode", "interface")])
                        .increment(records.len() as u64);
                    result.records.extend(records);
                    result.watermarks.extend(watermark);
                }
            }
        }

        result.total = result.records.len();
        Ok(result)
    }

    async fn fetch_interface(
        &self,
        index: usize,
        source: &SourceConfig,
        target: &InterfaceMeta,
        mapping: &FieldMappingRules,
        fetched_at: DateTime<Utc>,
    ) -> Result<(Vec<SourceRecordInfo>, Option<Watermark>), FetchError> {
        let store_error = |error: StoreError| FetchError::Store {
            library_id: source.library_id.clone(),
            interface_id: source.interface_id.clone(),
            error,
        };
        let incremental = source
            .incremental_config
            .as_ref()
            .filter(|config| config.is_active());

        let rows = match source.sql_query.as_deref().filter(|sql| !sql.trim().is_empty()) {
            Some(sql) => {
                let config = SqlQueryConfig {
                    library_id: Some(source.library_id.clone()),
                    interface_id: Some(source.interface_id.clone()),
                    sql_query: sql.to_owned(),
                    parameters: source.parameters.clone(),
                    timeout: None,
                    max_rows: None,
                };
                self.raw_executor().execute(index, &config).await?
            }
            None => {
                let meta = self
                    .catalog
                    .interface(&source.library_id, &source.interface_id)
                    .ok_or_else(|| FetchError::UnknownSource {
                        library_id: source.library_id.clone(),
                        interface_id: source.interface_id.clone(),
                    })?;
                let filter = match incremental {
                    Some(config) => Some(IncrementalFilter::new(
                        config,
                        self.effective_watermark(config, target, mapping).await,
                    )),
                    None => None,
                };
                self.scan(&meta, incremental, filter.as_ref())
                    .await
                    .map_err(store_error)?
            }
        };

        let watermark = incremental.and_then(|config| {
            max_watermark(&rows, &config.incremental_field, config.field_type).map(|value| {
                Watermark {
                    library_id: source.library_id.clone(),
                    interface_id: source.interface_id.clone(),
                    field: config.incremental_field.clone(),
                    value,
                }
            })
        });

        let mut records = Vec::with_capacity(rows.len());
        for (row_index, mut row) in rows.into_iter().enumerate() {
            if !source.filters.iter().all(|filter| matches_filter(&row, filter)) {
                continue;
            }
            for transform in &source.transforms {
                match transform.apply_to(&mut row) {
                    Ok(()) => {}
                    Err(TransformError::Unknown(name)) => {
                        return Err(FetchError::InvalidTransform(TransformError::Unknown(name)))
                    }
                    Err(error) => warn!(
                        library_id = %source.library_id,
                        field = %transform.source_field,
                        %error,
                        "source transform skipped"
                    ),
                }
            }

            let record_id = match fallback_identifier(&row) {
                Some(id) => format!("{}_{}_{}", source.library_id, source.interface_id, id),
                None => format!("{}_{}_{}", source.library_id, source.interface_id, row_index),
            };
            let last_updated = last_updated(&row).unwrap_or(fetched_at);
            records.push(SourceRecordInfo::new(
                &source.library_id,
                &source.interface_id,
                record_id,
                row,
                last_updated,
            ));
        }

        Ok((records, watermark))
    }

    /// Page through an interface table in a stable order until a short page comes back.
    async fn scan(
        &self,
        meta: &InterfaceMeta,
        incremental: Option<&IncrementalConfig>,
        filter: Option<&IncrementalFilter>,
    ) -> Result<Vec<Record>, StoreError> {
        let table = meta.table_ref()?;

        let mut order_by: Vec<String> = Vec::new();
        if let Some(config) = incremental {
            order_by.push(config.incremental_field.clone());
        }
        for key in meta.primary_key() {
            if !order_by.contains(&key) {
                order_by.push(key);
            }
        }

        let page_size = incremental
            .map(|config| config.batch_size)
            .filter(|size| *size > 0)
            .unwrap_or(self.settings.page_size)
            .max(1);

        let mut rows = Vec::new();
        let mut offset = 0;
        loop {
            let page = self
                .source
                .fetch_page(&ScanRequest {
                    table: &table,
                    filter,
                    order_by: &order_by,
                    limit: page_size,
                    offset,
                })
                .await?;
            let fetched = page.len();
            debug!(table = %table, offset, fetched, "fetched page");
            rows.extend(page);

            if fetched < page_size {
                break;
            }
            offset += page_size;
        }

        Ok(rows)
    }

    /// Starting point of an incremental scan: the configured last value, else the target's
    /// current maximum, else the configured initial value. Failing to read the target only
    /// logs, since it only moves where this run starts.
    async fn effective_watermark(
        &self,
        config: &IncrementalConfig,
        target: &InterfaceMeta,
        mapping: &FieldMappingRules,
    ) -> Option<String> {
        if let Some(value) = config.last_sync_value.as_ref().filter(|v| !v.is_empty()) {
            return Some(value.clone());
        }

        let column = mapping.target_of(&config.incremental_field);
        if target.field(column).is_some() {
            let current = match target.table_ref() {
                Ok(table) => self
                    .target
                    .max_value(&table, column)
                    .await
                    .map_err(|error| error.to_string()),
                Err(error) => Err(error.to_string()),
            };
            match current {
                Ok(Some(value)) => return Some(value),
                Ok(None) => {}
                Err(error) => warn!(column, error, "failed to read target watermark"),
            }
        }

        config.initial_value.clone().filter(|v| !v.is_empty())
    }
}

fn raw_query_records(
    index: usize,
    config: &SqlQueryConfig,
    rows: Vec<Record>,
    fetched_at: DateTime<Utc>,
) -> Vec<SourceRecordInfo> {
    let library_id = config
        .library_id
        .clone()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| RAW_QUERY_LIBRARY.to_owned());
    let interface_id = config
        .interface_id
        .clone()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| format!("{}_{}", RAW_QUERY_LIBRARY, index));

    rows.into_iter()
        .enumerate()
        .map(|(row_index, row)| {
            let record_id = match fallback_identifier(&row) {
                Some(id) => format!("sql_query_{}_{}", index, id),
                None => format!("sql_query_{}_record_{}", index, row_index),
            };
            let last_updated = last_updated(&row).unwrap_or(fetched_at);
            SourceRecordInfo::new(&library_id, &interface_id, record_id, row, last_updated)
        })
        .collect()
}

fn last_updated(record: &Record) -> Option<DateTime<Utc>> {
    UPDATED_AT_FIELDS
        .iter()
        .find_map(|field| record.get(field).and_then(Value::as_timestamp))
}

/// Whether a record passes one filter. Absent fields never pass.
pub fn matches_filter(record: &Record, filter: &FilterConfig) -> bool {
    let Some(value) = record.get(&filter.field) else {
        return false;
    };
    let text = value.to_string();
    let expected = filter.value.to_string();

    match filter.operator {
        FilterOperator::Eq => compare_loose(value, &filter.value) == Ordering::Equal,
        FilterOperator::Ne => compare_loose(value, &filter.value) != Ordering::Equal,
        FilterOperator::Gt => compare_loose(value, &filter.value) == Ordering::Greater,
        FilterOperator::Lt => compare_loose(value, &filter.value) == Ordering::Less,
        FilterOperator::Gte => compare_loose(value, &filter.value) != Ordering::Less,
        FilterOperator::Lte => compare_loose(value, &filter.value) != Ordering::Greater,
        FilterOperator::Contains => text.contains(&expected),
        FilterOperator::NotContains => !text.contains(&expected),
        FilterOperator::StartsWith => text.starts_with(&expected),
        FilterOperator::EndsWith => text.ends_with(&expected),
        FilterOperator::In => in_list(value, &filter.value),
        FilterOperator::NotIn => !in_list(value, &filter.value),
    }
}

fn in_list(value: &Value, list: &Value) -> bool {
    match list {
        Value::List(items) => items
            .iter()
            .any(|item| compare_loose(value, item) == Ordering::Equal),
        other => other
            .to_string()
            .split(',')
            .any(|item| compare_loose(value, &Value::from(item.trim())) == Ordering::Equal),
    }
}
