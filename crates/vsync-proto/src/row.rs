//! Composite row identity.
//!
//! A row is identified by `(schema, table, rowKey)` where the row key is a
//! JSON object mapping key columns to values. Map storage never uses
//! structural equality on the raw objects; [`RowId::canonical_key`] produces
//! an order-independent string key instead.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A row's column values, as sent to clients in `put` patches.
pub type RowContents = serde_json::Map<String, Value>;

/// Key column name → value. Backed by a sorted map, so serialization order
/// is independent of insertion order.
pub type RowKey = serde_json::Map<String, Value>;

/// Composite identity of one upstream row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowId {
    /// Upstream schema name.
    pub schema: String,
    /// Upstream table name.
    pub table: String,
    /// Key column values identifying the row within the table.
    pub row_key: RowKey,
}

impl RowId {
    /// Construct a row id from key column/value pairs.
    pub fn new(
        schema: impl Into<String>,
        table: impl Into<String>,
        key: impl IntoIterator<Item = (String, Value)>,
    ) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            row_key: key.into_iter().collect(),
        }
    }

    /// Canonical, order-independent string key for map storage.
    ///
    /// Two `RowId`s with the same schema, table, and key column values
    /// produce the same canonical key regardless of construction order.
    #[must_use]
    pub fn canonical_key(&self) -> String {
        let mut pairs: Vec<(&String, &Value)> = self.row_key.iter().collect();
        pairs.sort_by_key(|(column, _)| *column);
        serde_json::to_string(&(&self.schema, &self.table, pairs))
            .expect("row id serialization")
    }

    /// The key column names, sorted.
    #[must_use]
    pub fn key_columns(&self) -> Vec<&str> {
        let mut columns: Vec<&str> = self.row_key.keys().map(String::as_str).collect();
        columns.sort_unstable();
        columns
    }
}
