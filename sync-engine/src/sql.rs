//! Identifier validation and statement text for the relational sink.
//! Identifiers are interpolated only after validation; values are always bound as parameters.
use std::fmt;

use thiserror::Error;

const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Words that are never accepted as identifiers, compared case-insensitively.
const DENIED_IDENTIFIERS: &[&str] = &[
    "ALTER", "CREATE", "DELETE", "DROP", "EXEC", "EXECUTE", "GRANT", "INSERT", "REVOKE",
    "SELECT", "TRUNCATE", "UNION", "UPDATE",
];

const DENIED_MARKERS: &[&str] = &["--", "/*", "*/", ";"];

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum IdentifierError {
    #[error("identifier is empty")]
    Empty,
    #[error("identifier {0} is too long")]
    TooLong(String),
    #[error("identifier {0} contains characters outside [A-Za-z0-9_]")]
    InvalidCharacter(String),
    #[error("identifier {0} is a reserved word")]
    Reserved(String),
}

/// Check an identifier against the allow-list and deny-list.
pub fn validate_identifier(name: &str) -> Result<&str, IdentifierError> {
    if name.is_empty() {
        return Err(IdentifierError::Empty);
    }
    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(IdentifierError::TooLong(name.to_owned()));
    }
    if DENIED_MARKERS.iter().any(|marker| name.contains(marker))
        || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(IdentifierError::InvalidCharacter(name.to_owned()));
    }
    if DENIED_IDENTIFIERS
        .iter()
        .any(|word| word.eq_ignore_ascii_case(name))
    {
        return Err(IdentifierError::Reserved(name.to_owned()));
    }

    Ok(name)
}

pub fn quote_ident(name: &str) -> Result<String, IdentifierError> {
    validate_identifier(name).map(|name| format!("\"{}\"", name))
}

fn quote_all(names: &[String]) -> Result<Vec<String>, IdentifierError> {
    names.iter().map(|name| quote_ident(name)).collect()
}

/// A validated `schema.table` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableRef {
    schema: String,
    table: String,
}

impl TableRef {
    pub fn new(schema: &str, table: &str) -> Result<Self, IdentifierError> {
        validate_identifier(schema)?;
        validate_identifier(table)?;

        Ok(Self {
            schema: schema.to_owned(),
            table: table.to_owned(),
        })
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\".\"{}\"", self.schema, self.table)
    }
}

/// Multi-row upsert: every non-key column is updated from the incoming row on key conflict.
/// The statement returns one `inserted` flag per affected row.
pub fn upsert_statement(
    table: &TableRef,
    columns: &[String],
    key_columns: &[String],
    rows: usize,
) -> Result<String, IdentifierError> {
    let quoted = quote_all(columns)?;
    let quoted_keys = quote_all(key_columns)?;

    let mut values = Vec::with_capacity(rows);
    let mut param = 1;
    for _ in 0..rows {
        let placeholders: Vec<String> = (0..columns.len())
            .map(|_| {
                let placeholder = format!("${}", param);
                param += 1;
                placeholder
            })
            .collect();
        values.push(format!("({})", placeholders.join(", ")));
    }

    let updates: Vec<String> = columns
        .iter()
        .zip(quoted.iter())
        .filter(|(name, _)| !key_columns.contains(name))
        .map(|(_, quoted)| format!("{0} = EXCLUDED.{0}", quoted))
        .collect();

    let on_conflict = if updates.is_empty() {
        "DO NOTHING".to_owned()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    Ok(format!(
        "INSERT INTO {} ({}) VALUES {} ON CONFLICT ({}) {} RETURNING (xmax = 0) AS inserted",
        table,
        quoted.join(", "),
        values.join(", "),
        quoted_keys.join(", "),
        on_conflict
    ))
}

/// Select the text form of the key columns of every row.
pub fn existing_keys_statement(
    table: &TableRef,
    key_columns: &[String],
) -> Result<String, IdentifierError> {
    let selected: Vec<String> = quote_all(key_columns)?
        .into_iter()
        .map(|quoted| format!("{}::text", quoted))
        .collect();

    Ok(format!("SELECT {} FROM {}", selected.join(", "), table))
}

/// Delete a batch of rows by key. Keys are compared in their text form.
/// A single key column uses `IN`, composite keys an `OR` of conjunctions.
pub fn delete_statement(
    table: &TableRef,
    key_columns: &[String],
    keys: usize,
) -> Result<String, IdentifierError> {
    let quoted = quote_all(key_columns)?;

    let predicate = if quoted.len() == 1 {
        let placeholders: Vec<String> = (1..=keys).map(|i| format!("${}", i)).collect();
        format!("{}::text IN ({})", quoted[0], placeholders.join(", "))
    } else {
        let mut param = 1;
        let groups: Vec<String> = (0..keys)
            .map(|_| {
                let parts: Vec<String> = quoted
                    .iter()
                    .map(|column| {
                        let part = format!("{}::text = ${}", column, param);
                        param += 1;
                        part
                    })
                    .collect();
                format!("({})", parts.join(" AND "))
            })
            .collect();
        groups.join(" OR ")
    };

    Ok(format!("DELETE FROM {} WHERE {}", table, predicate))
}

/// One page of rows as JSON objects. `first_param` is the index of the LIMIT placeholder;
/// OFFSET follows it.
pub fn page_statement(
    table: &TableRef,
    predicate: Option<&str>,
    order_by: &[String],
    first_param: usize,
) -> Result<String, IdentifierError> {
    let mut sql = format!("SELECT to_jsonb(t) AS row FROM {} AS t", table);

    if let Some(predicate) = predicate {
        sql.push_str(" WHERE ");
        sql.push_str(predicate);
    }

    if !order_by.is_empty() {
        let ordering: Vec<String> = quote_all(order_by)?
            .into_iter()
            .map(|quoted| format!("t.{} ASC", quoted))
            .collect();
        sql.push_str(" ORDER BY ");
        sql.push_str(&ordering.join(", "));
    }

    sql.push_str(&format!(
        " LIMIT ${} OFFSET ${}",
        first_param,
        first_param + 1
    ));

    Ok(sql)
}

pub fn max_value_statement(table: &TableRef, column: &str) -> Result<String, IdentifierError> {
    Ok(format!(
        "SELECT MAX({})::text FROM {}",
        quote_ident(column)?,
        table
    ))
}

/// Wrap a read-only query so each row is returned as one JSON object.
pub fn json_rows_statement(sql: &str) -> String {
    let inner = sql.trim().trim_end_matches(';');
    format!("SELECT to_jsonb(q) AS row FROM ({}) AS q", inner)
}
