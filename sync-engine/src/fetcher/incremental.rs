use std::cmp::Ordering;

use chrono::{DateTime, Duration, Utc};
use sync_common::record::{parse_timestamp, Record, Value};

use crate::config::{CompareOperator, IncrementalConfig, IncrementalFieldType};
use crate::sql::{quote_ident, IdentifierError};

/// Soft-delete handling for incremental scans.
#[derive(Debug, Clone, PartialEq)]
pub struct DeletedFilter {
    pub field: String,
    pub value: Option<String>,
    pub include_deleted: bool,
}

/// The predicate of an incremental scan, renderable as SQL or evaluated in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct IncrementalFilter {
    pub field: String,
    pub field_type: IncrementalFieldType,
    pub operator: CompareOperator,
    /// Lower bound. `None` scans everything.
    pub value: Option<String>,
    pub lookback_hours: u32,
    pub timezone: String,
    pub deleted: Option<DeletedFilter>,
}

impl IncrementalFilter {
    /// Build the filter for an active incremental config and its effective watermark.
    pub fn new(config: &IncrementalConfig, value: Option<String>) -> Self {
        let deleted = config
            .check_deleted_field
            .as_ref()
            .filter(|field| !field.is_empty())
            .map(|field| DeletedFilter {
                field: field.clone(),
                value: config.deleted_value.clone().filter(|v| !v.is_empty()),
                include_deleted: config.sync_deleted_records,
            });

        Self {
            field: config.incremental_field.clone(),
            field_type: config.field_type,
            operator: config.compare_operator,
            value: value.filter(|v| !v.is_empty()),
            lookback_hours: config.max_lookback_hours,
            timezone: config.timezone.clone(),
            deleted,
        }
    }

    fn cast(&self) -> &'static str {
        match self.field_type {
            IncrementalFieldType::Timestamp => "::timestamp",
            IncrementalFieldType::Number => "::numeric",
            IncrementalFieldType::String => "",
        }
    }

    fn lookback_applies(&self) -> bool {
        self.lookback_hours > 0 && self.field_type == IncrementalFieldType::Timestamp
    }

    /// Render as a SQL predicate whose placeholders start at `$first_param`.
    /// Returns `None` when nothing needs filtering.
    pub fn render(
        &self,
        first_param: usize,
    ) -> Result<Option<(String, Vec<String>)>, IdentifierError> {
        let mut conditions = Vec::new();
        let mut params = Vec::new();
        let mut next = first_param;
        let mut placeholder = |params: &mut Vec<String>, value: String| {
            params.push(value);
            let p = format!("${}", next);
            next += 1;
            p
        };

        if let Some(value) = &self.value {
            let field = quote_ident(&self.field)?;
            let bound = placeholder(&mut params, value.clone());
            let mut condition = format!("{} {} {}{}", field, self.operator.as_sql(), bound, self.cast());

            if self.lookback_applies() {
                let tz = placeholder(&mut params, self.timezone.clone());
                let hours = placeholder(&mut params, self.lookback_hours.to_string());
                condition = format!(
                    "({} OR {} >= (NOW() AT TIME ZONE {}) - make_interval(hours => {}::int))",
                    condition, field, tz, hours
                );
            }
            conditions.push(condition);
        }

        if let Some(deleted) = &self.deleted {
            let field = quote_ident(&deleted.field)?;
            match (&deleted.value, deleted.include_deleted) {
                (Some(value), true) => {
                    let bound = placeholder(&mut params, value.clone());
                    conditions.push(format!("({0} IS NULL OR {0}::text = {1})", field, bound));
                }
                (Some(value), false) => {
                    let bound = placeholder(&mut params, value.clone());
                    conditions.push(format!("({0} IS NULL OR {0}::text != {1})", field, bound));
                }
                (None, false) => conditions.push(format!("{} IS NULL", field)),
                (None, true) => {}
            }
        }

        if conditions.is_empty() {
            return Ok(None);
        }
        Ok(Some((conditions.join(" AND "), params)))
    }

    /// Evaluate against a record. Naive timestamps are read as UTC.
    pub fn matches(&self, record: &Record, now: DateTime<Utc>) -> bool {
        if let Some(bound) = &self.value {
            let value = record.value(&self.field);
            if value.is_empty_value() {
                return false;
            }

            let in_window = self.lookback_applies()
                && value
                    .as_timestamp()
                    .map(|ts| ts >= now - Duration::hours(i64::from(self.lookback_hours)))
                    .unwrap_or(false);

            let ordering = compare_typed(value, &Value::from(bound.as_str()), self.field_type);
            let passes = match (ordering, self.operator) {
                (None, _) => false,
                (Some(o), CompareOperator::Gt) => o == Ordering::Greater,
                (Some(o), CompareOperator::Gte) => o != Ordering::Less,
                (Some(o), CompareOperator::Lt) => o == Ordering::Less,
                (Some(o), CompareOperator::Lte) => o != Ordering::Greater,
                (Some(o), CompareOperator::Eq) => o == Ordering::Equal,
                (Some(o), CompareOperator::Ne) => o != Ordering::Equal,
            };
            if !(passes || in_window) {
                return false;
            }
        }

        if let Some(deleted) = &self.deleted {
            let value = record.value(&deleted.field);
            let text = value.to_string();
            let keep = match (&deleted.value, deleted.include_deleted) {
                (Some(marker), true) => value.is_null() || &text == marker,
                (Some(marker), false) => value.is_null() || &text != marker,
                (None, false) => value.is_null(),
                (None, true) => true,
            };
            if !keep {
                return false;
            }
        }

        true
    }
}

/// Compare two values as the incremental field type.
pub fn compare_typed(a: &Value, b: &Value, field_type: IncrementalFieldType) -> Option<Ordering> {
    match field_type {
        IncrementalFieldType::Timestamp => Some(a.as_timestamp()?.cmp(&b.as_timestamp()?)),
        IncrementalFieldType::Number => a.as_f64()?.partial_cmp(&b.as_f64()?),
        IncrementalFieldType::String => Some(a.to_string().cmp(&b.to_string())),
    }
}

/// The largest value of the incremental field across `records`, as text.
pub fn max_watermark<'a>(
    records: impl IntoIterator<Item = &'a Record>,
    field: &str,
    field_type: IncrementalFieldType,
) -> Option<String> {
    let mut best: Option<&Value> = None;

    for record in records {
        let Some(value) = record.get(field) else {
            continue;
        };
        if value.is_empty_value() || compare_typed(value, value, field_type).is_none() {
            continue;
        }
        best = match best {
            Some(current)
                if compare_typed(value, current, field_type) != Some(Ordering::Greater) =>
            {
                Some(current)
            }
            _ => Some(value),
        };
    }

    best.map(|value| match (field_type, value) {
        (IncrementalFieldType::Timestamp, Value::String(raw)) => parse_timestamp(raw)
            .map(|ts| Value::Timestamp(ts).to_string())
            .unwrap_or_else(|| raw.clone()),
        _ => value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(value: serde_json::Value) -> IncrementalConfig {
        serde_json::from_value(value).unwrap()
    }

    fn record(value: serde_json::Value) -> Record {
        Record::from_json(value).unwrap()
    }

    #[test]
    fn test_render_plain_predicate() {
        let cfg = config(json!({"enabled": true, "incremental_field": "version", "field_type": "number"}));
        let filter = IncrementalFilter::new(&cfg, Some("41".to_owned()));

        let (sql, params) = filter.render(1).unwrap().unwrap();
        assert_eq!(sql, "\"version\" > $1::numeric");
        assert_eq!(params, vec!["41".to_owned()]);
    }

    #[test]
    fn test_render_lookback_only_for_timestamps() {
        let cfg = config(json!({
            "enabled": true,
            "incremental_field": "updated_at",
            "field_type": "timestamp",
            "compare_operator": ">=",
            "max_lookback_hours": 6
        }));
        let filter = IncrementalFilter::new(&cfg, Some("2024-01-01 00:00:00".to_owned()));

        let (sql, params) = filter.render(1).unwrap().unwrap();
        assert_eq!(
            sql,
            "(\"updated_at\" >= $1::timestamp OR \"updated_at\" >= (NOW() AT TIME ZONE $2) - make_interval(hours => $3::int))"
        );
        assert_eq!(params, vec!["2024-01-01 00:00:00", "Asia/Shanghai", "6"]);

        let cfg = config(json!({
            "enabled": true,
            "incremental_field": "seq",
            "field_type": "number",
            "max_lookback_hours": 6
        }));
        let (sql, _) = IncrementalFilter::new(&cfg, Some("1".to_owned()))
            .render(1)
            .unwrap()
            .unwrap();
        assert_eq!(sql, "\"seq\" > $1::numeric");
    }

    #[test]
    fn test_render_soft_delete_variants() {
        let base = json!({"enabled": true, "incremental_field": "id", "check_deleted_field": "is_deleted"});

        let mut include = base.clone();
        include["deleted_value"] = json!("1");
        include["sync_deleted_records"] = json!(true);
        let (sql, params) = IncrementalFilter::new(&config(include), None)
            .render(3)
            .unwrap()
            .unwrap();
        assert_eq!(sql, "(\"is_deleted\" IS NULL OR \"is_deleted\"::text = $3)");
        assert_eq!(params, vec!["1"]);

        let mut exclude = base.clone();
        exclude["deleted_value"] = json!("1");
        let (sql, _) = IncrementalFilter::new(&config(exclude), None)
            .render(1)
            .unwrap()
            .unwrap();
        assert_eq!(sql, "(\"is_deleted\" IS NULL OR \"is_deleted\"::text != $1)");

        let (sql, params) = IncrementalFilter::new(&config(base), None)
            .render(1)
            .unwrap()
            .unwrap();
        assert_eq!(sql, "\"is_deleted\" IS NULL");
        assert!(params.is_empty());
    }

    #[test]
    fn test_first_run_without_value_scans_everything() {
        let cfg = config(json!({"enabled": true, "incremental_field": "updated_at"}));
        let filter = IncrementalFilter::new(&cfg, Some(String::new()));

        assert_eq!(filter.render(1).unwrap(), None);
        assert!(filter.matches(&record(json!({"updated_at": null})), Utc::now()));
    }

    #[test]
    fn test_matches_in_memory() {
        let cfg = config(json!({
            "enabled": true,
            "incremental_field": "updated_at",
            "field_type": "timestamp",
            "check_deleted_field": "deleted",
            "deleted_value": "true"
        }));
        let filter = IncrementalFilter::new(&cfg, Some("2024-01-01 00:00:00".to_owned()));
        let now = Utc::now();

        assert!(filter.matches(&record(json!({"updated_at": "2024-02-01 00:00:00"})), now));
        assert!(!filter.matches(&record(json!({"updated_at": "2023-12-01 00:00:00"})), now));
        assert!(!filter.matches(
            &record(json!({"updated_at": "2024-02-01 00:00:00", "deleted": true})),
            now
        ));
        assert!(!filter.matches(&record(json!({"name": "no timestamp"})), now));
    }

    #[test]
    fn test_max_watermark_by_type() {
        let records = vec![
            record(json!({"v": "9", "ts": "2024-01-02T00:00:00Z"})),
            record(json!({"v": "10", "ts": "2024-01-01 08:00:00"})),
            record(json!({"v": null})),
        ];

        assert_eq!(
            max_watermark(&records, "v", IncrementalFieldType::Number),
            Some("10".to_owned())
        );
        assert_eq!(
            max_watermark(&records, "v", IncrementalFieldType::String),
            Some("9".to_owned())
        );
        assert_eq!(
            max_watermark(&records, "ts", IncrementalFieldType::Timestamp),
            Some("2024-01-02 00:00:00".to_owned())
        );
        assert_eq!(max_watermark(&records, "missing", IncrementalFieldType::Number), None);
    }
}
