//! Versioned patch wire shapes.
//!
//! Patches are the deltas that bring a client up to date. Their serialized
//! forms are part of the sync protocol and must be reproduced exactly:
//!
//! - query patch: `{"type":"query","op":"put"|"del","id":...,"clientID"?:...}`
//! - row patch: `{"type":"row","op":"put"|"del","id":{schema,table,rowKey},"contents"?:...}`
//!
//! Every patch is paired with the version it brings the client *to*; within
//! a sync round `toVersion` never regresses for the same entity.

use serde::{Deserialize, Serialize};

use crate::row::{RowContents, RowId};
use crate::version::CvrVersion;

/// Whether a patch adds/updates or removes its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    /// Add or update.
    Put,
    /// Remove.
    Del,
}

/// One delta to a client's view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Patch {
    /// A query entering or leaving the view.
    Query {
        /// Add or remove.
        op: PatchOp,
        /// Query hash.
        id: String,
        /// Present for desired-query patches scoped to one client; absent
        /// for group-scoped "got" patches.
        #[serde(
            rename = "clientID",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        client_id: Option<String>,
    },
    /// A row entering, changing, or leaving the view.
    Row {
        /// Add/update or remove.
        op: PatchOp,
        /// Composite row identity.
        id: RowId,
        /// Column values for `put` patches.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        contents: Option<RowContents>,
    },
}

impl Patch {
    /// A client-scoped desired-query `put`.
    pub fn put_query(id: impl Into<String>, client_id: Option<String>) -> Self {
        Patch::Query {
            op: PatchOp::Put,
            id: id.into(),
            client_id,
        }
    }

    /// A query `del`, client-scoped or group-scoped.
    pub fn del_query(id: impl Into<String>, client_id: Option<String>) -> Self {
        Patch::Query {
            op: PatchOp::Del,
            id: id.into(),
            client_id,
        }
    }

    /// A row `put` carrying fresh contents.
    pub fn put_row(id: RowId, contents: RowContents) -> Self {
        Patch::Row {
            op: PatchOp::Put,
            id,
            contents: Some(contents),
        }
    }

    /// A row `del`.
    pub fn del_row(id: RowId) -> Self {
        Patch::Row {
            op: PatchOp::Del,
            id,
            contents: None,
        }
    }
}

/// A patch tagged with the version it brings the client to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchToVersion {
    /// The delta.
    pub patch: Patch,
    /// Version the client is at after applying the delta. Never exceeds the
    /// round's declared cookie.
    pub to_version: CvrVersion,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_patch_wire_shape() {
        let patch = Patch::put_query("h1", Some("clientA".to_string()));
        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            json!({"type": "query", "op": "put", "id": "h1", "clientID": "clientA"})
        );

        let group_scoped = Patch::del_query("h1", None);
        assert_eq!(
            serde_json::to_value(&group_scoped).unwrap(),
            json!({"type": "query", "op": "del", "id": "h1"})
        );
    }

    #[test]
    fn test_row_patch_wire_shape() {
        let id = RowId::new(
            "public",
            "issues",
            [("id".to_string(), json!(3))],
        );
        let mut contents = RowContents::new();
        contents.insert("id".to_string(), json!(3));
        contents.insert("title".to_string(), json!("crash"));

        let patch = Patch::put_row(id.clone(), contents);
        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            json!({
                "type": "row",
                "op": "put",
                "id": {"schema": "public", "table": "issues", "rowKey": {"id": 3}},
                "contents": {"id": 3, "title": "crash"}
            })
        );

        let del = Patch::del_row(id);
        let del_json = serde_json::to_value(&del).unwrap();
        assert_eq!(del_json["op"], "del");
        assert!(del_json.get("contents").is_none());
    }

    #[test]
    fn test_patch_to_version_roundtrip() {
        let ptv = PatchToVersion {
            patch: Patch::del_query("h9", None),
            to_version: CvrVersion::new("0a"),
        };
        let json = serde_json::to_value(&ptv).unwrap();
        assert_eq!(json["toVersion"], json!({"stateVersion": "0a"}));
        let back: PatchToVersion = serde_json::from_value(json).unwrap();
        assert_eq!(back, ptv);
    }
}
