//! Interface metadata consumed from the library catalog.
use std::path::Path;

use serde::{Deserialize, Serialize};
use sync_common::keys::FALLBACK_KEY_FIELDS;
use sync_common::record::Value;

use crate::sql::{IdentifierError, TableRef};

/// Storage class of a declared column, derived from its `data_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Integer,
    BigInt,
    Float,
    Bool,
    Timestamp,
    Json,
    Other,
}

impl ColumnKind {
    pub fn from_data_type(data_type: &str) -> Self {
        let lowered = data_type.trim().to_lowercase();
        let base = lowered.split('(').next().unwrap_or_default().trim();

        match base {
            "varchar" | "text" | "char" | "string" | "character varying" | "character"
            | "uuid" => ColumnKind::Text,
            "int" | "integer" | "int4" | "int2" | "smallint" | "serial" => ColumnKind::Integer,
            "bigint" | "int8" | "bigserial" => ColumnKind::BigInt,
            "float" | "float4" | "float8" | "double" | "double precision" | "real" | "decimal"
            | "numeric" => ColumnKind::Float,
            "bool" | "boolean" => ColumnKind::Bool,
            "timestamp" | "timestamptz" | "datetime" | "date" | "timestamp with time zone"
            | "timestamp without time zone" => ColumnKind::Timestamp,
            "json" | "jsonb" => ColumnKind::Json,
            _ => ColumnKind::Other,
        }
    }
}

/// A field of a target interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetField {
    pub name_en: String,
    #[serde(default)]
    pub name_zh: Option<String>,
    #[serde(default = "default_data_type")]
    pub data_type: String,
    #[serde(default)]
    pub is_primary_key: bool,
    #[serde(default = "default_nullable")]
    pub is_nullable: bool,
    #[serde(default)]
    pub default_value: Option<Value>,
}

fn default_data_type() -> String {
    "varchar".to_owned()
}

fn default_nullable() -> bool {
    true
}

impl TargetField {
    pub fn kind(&self) -> ColumnKind {
        ColumnKind::from_data_type(&self.data_type)
    }

    pub fn is_required(&self) -> bool {
        !self.is_nullable
    }
}

/// Where an interface's rows live and what they look like.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterfaceMeta {
    pub library_id: String,
    pub interface_id: String,
    /// Schema name, the owning library's `name_en`.
    pub schema: String,
    /// Table name, the interface's `name_en`.
    pub table: String,
    #[serde(default)]
    pub fields: Vec<TargetField>,
}

impl InterfaceMeta {
    pub fn table_ref(&self) -> Result<TableRef, IdentifierError> {
        TableRef::new(&self.schema, &self.table)
    }

    pub fn field(&self, name: &str) -> Option<&TargetField> {
        self.fields.iter().find(|f| f.name_en == name)
    }

    /// Primary key columns: flagged fields, else the first conventional id field declared,
    /// else `id`.
    pub fn primary_key(&self) -> Vec<String> {
        let flagged: Vec<String> = self
            .fields
            .iter()
            .filter(|f| f.is_primary_key)
            .map(|f| f.name_en.clone())
            .collect();
        if !flagged.is_empty() {
            return flagged;
        }

        FALLBACK_KEY_FIELDS
            .iter()
            .find(|name| self.field(name).is_some())
            .map(|name| vec![name.to_string()])
            .unwrap_or_else(|| vec!["id".to_owned()])
    }
}

/// Resolves interface metadata by library and interface id.
pub trait Catalog: Send + Sync {
    fn interface(&self, library_id: &str, interface_id: &str) -> Option<InterfaceMeta>;
}

/// A catalog held in memory, usually loaded from a JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticCatalog {
    interfaces: Vec<InterfaceMeta>,
}

#[derive(thiserror::Error, Debug)]
pub enum CatalogError {
    #[error("failed to read catalog: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse catalog: {0}")]
    Parse(#[from] serde_json::Error),
}

impl StaticCatalog {
    pub fn new(interfaces: Vec<InterfaceMeta>) -> Self {
        Self { interfaces }
    }

    pub fn from_json(raw: &str) -> Result<Self, CatalogError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn len(&self) -> usize {
        self.interfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }
}

impl Catalog for StaticCatalog {
    fn interface(&self, library_id: &str, interface_id: &str) -> Option<InterfaceMeta> {
        self.interfaces
            .iter()
            .find(|i| i.library_id == library_id && i.interface_id == interface_id)
            .cloned()
    }
}
