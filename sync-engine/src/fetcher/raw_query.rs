//! Read-only parameterized queries used as sources.
use std::collections::BTreeMap;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use sync_common::record::{Record, Value};
use tracing::debug;

use crate::config::SqlQueryConfig;
use crate::error::{RawQueryError, StoreError};
use crate::store::SourceStore;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_ROWS: usize = 10_000;

pub const FORBIDDEN_KEYWORDS: &[&str] = &[
    "DROP", "DELETE", "UPDATE", "INSERT", "ALTER", "TRUNCATE", "CREATE", "GRANT", "REVOKE",
];

struct QueryPatterns {
    forbidden: Regex,
    placeholder: Regex,
    limit: Regex,
}

impl QueryPatterns {
    fn compile() -> Result<Self, regex::Error> {
        Ok(Self {
            forbidden: Regex::new(&format!(r"(?i)\b({})\b", FORBIDDEN_KEYWORDS.join("|")))?,
            placeholder: Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}")?,
            limit: Regex::new(r"(?i)\bLIMIT\b")?,
        })
    }
}

static PATTERNS: Lazy<Result<QueryPatterns, regex::Error>> = Lazy::new(QueryPatterns::compile);

fn patterns() -> Result<&'static QueryPatterns, RawQueryError> {
    PATTERNS
        .as_ref()
        .map_err(|error| RawQueryError::Pattern(error.clone()))
}

fn strip_line_comments(sql: &str) -> String {
    sql.lines()
        .map(|line| match line.find("--") {
            Some(i) => &line[..i],
            None => line,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Reject anything but a single read-only statement. Keywords are matched as whole words
/// outside of `--` comments.
pub fn validate_read_only(sql: &str) -> Result<(), RawQueryError> {
    let stripped = strip_line_comments(sql);
    let upper = stripped.trim().to_uppercase();

    if !(upper.starts_with("SELECT") || upper.starts_with("WITH")) {
        return Err(RawQueryError::NotReadOnly);
    }

    if let Some(found) = patterns()?.forbidden.find(&stripped) {
        return Err(RawQueryError::ForbiddenKeyword(found.as_str().to_uppercase()));
    }

    Ok(())
}

/// A query with `{{name}}` placeholders rewritten to positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Rewrite placeholders to `$n` in order of first appearance. Repeated names share a position
/// and only names present in the query are bound.
pub fn bind_placeholders(
    sql: &str,
    parameters: &BTreeMap<String, Value>,
) -> Result<BoundQuery, RawQueryError> {
    let placeholder = &patterns()?.placeholder;
    let mut names: Vec<String> = Vec::new();
    let mut params = Vec::new();

    for captures in placeholder.captures_iter(sql) {
        let name = &captures[1];
        if names.iter().any(|n| n == name) {
            continue;
        }
        let value = parameters
            .get(name)
            .ok_or_else(|| RawQueryError::MissingParameter(name.to_owned()))?;
        names.push(name.to_owned());
        params.push(value.clone());
    }

    let rewritten = placeholder.replace_all(sql, |captures: &regex::Captures| {
        let position = names
            .iter()
            .position(|n| n == &captures[1])
            .map(|i| i + 1)
            .unwrap_or_default();
        format!("${}", position)
    });

    Ok(BoundQuery {
        sql: rewritten.into_owned(),
        params,
    })
}

/// Append a row cap unless the query already limits itself.
pub fn apply_row_cap(sql: &str, max_rows: usize) -> Result<String, RawQueryError> {
    let trimmed = strip_line_comments(sql);
    if patterns()?.limit.is_match(&trimmed) {
        return Ok(sql.to_owned());
    }
    Ok(format!("{} LIMIT {}", trimmed.trim().trim_end_matches(';'), max_rows))
}

/// Validates, binds and runs raw queries against a `SourceStore`.
pub struct RawQueryExecutor<'a> {
    store: &'a dyn SourceStore,
    default_timeout: Duration,
    default_max_rows: usize,
}

impl<'a> RawQueryExecutor<'a> {
    pub fn new(store: &'a dyn SourceStore, default_timeout: Duration, default_max_rows: usize) -> Self {
        Self {
            store,
            default_timeout,
            default_max_rows,
        }
    }

    /// Run one query. `index` identifies it in errors.
    pub async fn execute(
        &self,
        index: usize,
        config: &SqlQueryConfig,
    ) -> Result<Vec<Record>, RawQueryError> {
        validate_read_only(&config.sql_query)?;

        let max_rows = config
            .max_rows
            .filter(|rows| *rows > 0)
            .unwrap_or(self.default_max_rows);
        let timeout = config
            .timeout
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let bound = bind_placeholders(&config.sql_query, &config.parameters)?;
        let sql = apply_row_cap(&bound.sql, max_rows)?;

        debug!(index, params = bound.params.len(), max_rows, "running raw query");

        match tokio::time::timeout(timeout, self.store.run_query(&sql, &bound.params, max_rows))
            .await
        {
            Ok(Ok(mut rows)) => {
                rows.truncate(max_rows);
                Ok(rows)
            }
            Ok(Err(error)) => Err(RawQueryError::Store { index, error }),
            Err(_) => Err(RawQueryError::Store {
                index,
                error: StoreError::Timeout(timeout),
            }),
        }
    }

    /// Run queries in order. Any failure aborts the whole set.
    pub async fn execute_all(
        &self,
        configs: &[SqlQueryConfig],
    ) -> Result<Vec<Vec<Record>>, RawQueryError> {
        let mut results = Vec::with_capacity(configs.len());
        for (index, config) in configs.iter().enumerate() {
            results.push(self.execute(index, config).await?);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use serde_json::json;

    fn params(value: serde_json::Value) -> BTreeMap<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_rejects_writes() {
        assert!(matches!(
            validate_read_only("DELETE FROM t"),
            Err(RawQueryError::NotReadOnly)
        ));
        assert!(matches!(
            validate_read_only("SELECT * FROM t; DROP TABLE t"),
            Err(RawQueryError::ForbiddenKeyword(keyword)) if keyword == "DROP"
        ));
        assert!(matches!(
            validate_read_only("with x as (select 1) update t set a = 1"),
            Err(RawQueryError::ForbiddenKeyword(keyword)) if keyword == "UPDATE"
        ));
    }

    #[test]
    fn test_accepts_reads() {
        assert!(validate_read_only("SELECT * FROM t WHERE created<{{d}}").is_ok());
        assert!(validate_read_only("  with recent as (select 1) select * from recent").is_ok());
        // Column names containing keywords are fine.
        assert!(validate_read_only("SELECT is_deleted, updated_at FROM t").is_ok());
        // Keywords inside line comments are ignored.
        assert!(validate_read_only("SELECT a FROM t -- DROP later\nWHERE a > 1").is_ok());
    }

    #[test]
    fn test_bind_placeholders() {
        let bound = bind_placeholders(
            "SELECT * FROM t WHERE created<{{d}}",
            &params(json!({"d": "2024-01-01", "unused": 3})),
        )
        .unwrap();

        assert_eq!(bound.sql, "SELECT * FROM t WHERE created<$1");
        assert_eq!(bound.params.len(), 1);

        let bound = bind_placeholders(
            "SELECT * FROM t WHERE a = {{x}} OR b = {{ y }} OR c = {{x}}",
            &params(json!({"x": 1, "y": "two"})),
        )
        .unwrap();
        assert_eq!(bound.sql, "SELECT * FROM t WHERE a = $1 OR b = $2 OR c = $1");
        assert_eq!(bound.params, vec![Value::Int(1), Value::from("two")]);
    }

    #[test]
    fn test_missing_parameter() {
        assert!(matches!(
            bind_placeholders("SELECT {{a}}", &BTreeMap::new()),
            Err(RawQueryError::MissingParameter(name)) if name == "a"
        ));
    }

    #[test]
    fn test_patterns_compile() {
        assert!(QueryPatterns::compile().is_ok());
        assert!(patterns().is_ok());
    }

    #[test]
    fn test_row_cap() {
        assert_eq!(apply_row_cap("SELECT * FROM t;", 10).unwrap(), "SELECT * FROM t LIMIT 10");
        assert_eq!(
            apply_row_cap("SELECT * FROM t limit 5", 10).unwrap(),
            "SELECT * FROM t limit 5"
        );
    }

    #[tokio::test]
    async fn test_executor_truncates_and_runs_in_order() {
        let store = MemoryStore::new();
        store.register_query(
            "SELECT * FROM people WHERE age > $1 LIMIT 2",
            vec![
                Record::from_json(json!({"id": 1})).unwrap(),
                Record::from_json(json!({"id": 2})).unwrap(),
                Record::from_json(json!({"id": 3})).unwrap(),
            ],
        );
        let executor = RawQueryExecutor::new(&store, DEFAULT_TIMEOUT, DEFAULT_MAX_ROWS);
        let config: SqlQueryConfig = serde_json::from_value(json!({
            "sql_query": "SELECT * FROM people WHERE age > {{age}}",
            "parameters": {"age": 30},
            "max_rows": 2
        }))
        .unwrap();

        let rows = executor.execute(0, &config).await.unwrap();
        assert_eq!(rows.len(), 2);

        let failing: SqlQueryConfig =
            serde_json::from_value(json!({"sql_query": "SELECT * FROM unknown"})).unwrap();
        let err = executor
            .execute_all(&[config, failing])
            .await
            .unwrap_err();
        assert!(matches!(err, RawQueryError::Store { index: 1, .. }));
    }
}
