//! Integration test common infrastructure.
//!
//! Provides an in-memory database and builders for desired queries, row
//! ids, and row update batches.

// Not every test binary uses every helper.
#![allow(dead_code)]

use serde_json::Value;

use viewsyncd::db::Database;
use vsync_proto::refcount::RefCounts;
use vsync_proto::{Ast, DesiredQuery, QuerySpec, RowContents, RowId, TtlMs};

pub async fn test_db() -> Database {
    Database::new(":memory:").await.expect("in-memory database")
}

pub fn desired_ast(id: &str, table: &str, ttl: TtlMs) -> DesiredQuery {
    DesiredQuery {
        id: id.to_string(),
        spec: QuerySpec::Ast {
            ast: Ast::table(table),
        },
        ttl,
    }
}

pub fn row_id(table: &str, key: &[(&str, Value)]) -> RowId {
    RowId::new(
        "public",
        table,
        key.iter().map(|(k, v)| (k.to_string(), v.clone())),
    )
}

pub fn contents(entries: &[(&str, Value)]) -> RowContents {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

pub fn ref_counts(entries: &[(&str, i64)]) -> RefCounts {
    entries
        .iter()
        .map(|(id, n)| (id.to_string(), *n))
        .collect()
}
