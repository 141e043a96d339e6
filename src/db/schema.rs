//! Catalog types for ch-scope.
//!
//! Represents databases, tables and their column layout as reported by the
//! engine's `system` tables.

use serde::{Deserialize, Serialize};

/// Placeholder shown when a table's definition cannot be fetched.
pub const CREATE_SQL_PLACEHOLDER: &str = "-- Failed to fetch create SQL";

/// A table and its storage engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMeta {
    pub name: String,
    pub engine: String,
}

impl TableMeta {
    pub fn new(name: impl Into<String>, engine: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            engine: engine.into(),
        }
    }
}

/// Column layout of one table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<SchemaColumn>,
}

/// A column and its engine type string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
}

impl SchemaColumn {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// A table's columns together with its `CREATE` statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescription {
    pub schema: TableSchema,

    /// The definition text, or [`CREATE_SQL_PLACEHOLDER`] if it could not be read.
    pub create_sql: String,
}

impl TableDescription {
    /// Returns true if the definition text was actually fetched.
    pub fn has_create_sql(&self) -> bool {
        self.create_sql != CREATE_SQL_PLACEHOLDER
    }

    /// Formats the description for terminal display.
    pub fn format_for_display(&self) -> String {
        let width = self
            .schema
            .columns
            .iter()
            .map(|c| c.name.len())
            .max()
            .unwrap_or(0);
        let columns = self
            .schema
            .columns
            .iter()
            .map(|c| format!("  {:width$}  {}\n", c.name, c.data_type))
            .collect::<String>();
        format!(
            "Table: {}\n{}\n{}\n",
            self.schema.name, columns, self.create_sql
        )
    }
}
