//! Query identity.
//!
//! A query is identified by a stable hash supplied by the upstream query
//! layer. Its definition is either an AST (client queries and the internal
//! bookkeeping queries) or a `name` + `args` pair (custom queries).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ttl::TtlMs;

/// Reserved id of the internal query tracking last-mutation ids for the
/// clients of a group.
pub const LMIDS_QUERY_ID: &str = "lmids";

/// Reserved id of the internal query tracking pending mutation results for
/// the clients of a group.
pub const MUTATION_RESULTS_QUERY_ID: &str = "mutationResults";

/// Minimal query AST as exchanged with the upstream query layer.
///
/// Parsing, planning, and execution live upstream; this crate only carries
/// the shape through the protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ast {
    /// Schema the queried table lives in, when not the default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    /// Queried table.
    pub table: String,
    /// Opaque filter expression, passed through verbatim.
    #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
    pub where_clause: Option<Value>,
}

impl Ast {
    /// An AST selecting all rows of `table`.
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            schema: None,
            table: table.into(),
            where_clause: None,
        }
    }

    /// An AST selecting rows of `table` matching an opaque filter.
    pub fn filtered(table: impl Into<String>, where_clause: Value) -> Self {
        Self {
            schema: None,
            table: table.into(),
            where_clause: Some(where_clause),
        }
    }
}

/// How a query is defined: by AST or by registered name plus arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QuerySpec {
    /// An AST-based (client) query.
    Ast {
        /// The query's AST.
        ast: Ast,
    },
    /// A named (custom) query with opaque arguments.
    Custom {
        /// Registered query name.
        name: String,
        /// Opaque argument values.
        args: Vec<Value>,
    },
}

/// One entry of a client's desired-query request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredQuery {
    /// Stable query hash from the upstream query layer.
    pub id: String,
    /// The query's definition.
    #[serde(flatten)]
    pub spec: QuerySpec,
    /// Requested time-to-live after inactivation, in milliseconds.
    /// Negative means "no effective limit".
    #[serde(default)]
    pub ttl: TtlMs,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ast_query_wire_shape() {
        let q = DesiredQuery {
            id: "h1".to_string(),
            spec: QuerySpec::Ast {
                ast: Ast::table("issues"),
            },
            ttl: 5_000,
        };
        let json = serde_json::to_value(&q).unwrap();
        assert_eq!(
            json,
            json!({"id": "h1", "ast": {"table": "issues"}, "ttl": 5000})
        );
    }

    #[test]
    fn test_custom_query_wire_shape() {
        let q = DesiredQuery {
            id: "h2".to_string(),
            spec: QuerySpec::Custom {
                name: "issuesByOwner".to_string(),
                args: vec![json!("alice")],
            },
            ttl: -1,
        };
        let json = serde_json::to_value(&q).unwrap();
        assert_eq!(
            json,
            json!({"id": "h2", "name": "issuesByOwner", "args": ["alice"], "ttl": -1})
        );

        let back: DesiredQuery = serde_json::from_value(json).unwrap();
        assert_eq!(back, q);
    }

    #[test]
    fn test_untagged_spec_discriminates_on_fields() {
        let ast: DesiredQuery =
            serde_json::from_value(json!({"id": "h", "ast": {"table": "t"}, "ttl": 0})).unwrap();
        assert!(matches!(ast.spec, QuerySpec::Ast { .. }));

        let custom: DesiredQuery =
            serde_json::from_value(json!({"id": "h", "name": "n", "args": [], "ttl": 0})).unwrap();
        assert!(matches!(custom.spec, QuerySpec::Custom { .. }));
    }
}
