//! Row-key-change detection.
//!
//! When a table's primary-key columns change (e.g. a schema migration), a
//! row the CVR already tracks can reappear under a new `RowId`. Clients
//! index rows by key, so the old id must be explicitly cancelled or their
//! local index diverges.
//!
//! [`KeyColumns`] indexes the key column *sets* observed in the existing
//! row records of each `(schema, table)`. For an incoming row that is not
//! already tracked, it projects the new contents onto each historical key
//! set to derive candidate old ids; the first existing match different from
//! the incoming id is the replaced row. At most one row is ever treated as
//! replaced per incoming row.

use std::collections::{BTreeSet, HashMap};

use vsync_proto::{RowContents, RowId, RowKey};

use crate::cvr::records::RowRecord;

/// Historical key column sets per `(schema, table)`.
pub struct KeyColumns {
    sets: HashMap<(String, String), Vec<Vec<String>>>,
}

impl KeyColumns {
    /// Harvest the key column sets present in the existing row index.
    pub fn new<'a>(rows: impl IntoIterator<Item = &'a RowRecord>) -> Self {
        let mut sets: HashMap<(String, String), Vec<Vec<String>>> = HashMap::new();
        let mut seen: BTreeSet<String> = BTreeSet::new();
        for record in rows {
            let columns: Vec<String> = record
                .id
                .key_columns()
                .iter()
                .map(|c| c.to_string())
                .collect();
            let tag = format!(
                "{}|{}|{}",
                record.id.schema,
                record.id.table,
                columns.join(",")
            );
            if seen.insert(tag) {
                sets.entry((record.id.schema.clone(), record.id.table.clone()))
                    .or_default()
                    .push(columns);
            }
        }
        Self { sets }
    }

    /// The canonical key of the row record replaced by `incoming`, if any.
    ///
    /// `existing` is the current row index; `already_replaced` keys are
    /// skipped so repeated notifications of the same replacement are
    /// idempotent.
    pub fn replaced_row(
        &self,
        incoming: &RowId,
        contents: &RowContents,
        existing: &HashMap<String, RowRecord>,
        already_replaced: &BTreeSet<String>,
    ) -> Option<String> {
        let sets = self
            .sets
            .get(&(incoming.schema.clone(), incoming.table.clone()))?;
        let incoming_key = incoming.canonical_key();

        for columns in sets {
            // Project the new contents onto the historical key set; a row
            // can only be replaced if every historical key column is still
            // present in the incoming contents.
            let mut key = RowKey::new();
            let mut complete = true;
            for column in columns {
                match contents.get(column) {
                    Some(value) => {
                        key.insert(column.clone(), value.clone());
                    }
                    None => {
                        complete = false;
                        break;
                    }
                }
            }
            if !complete {
                continue;
            }

            let candidate = RowId {
                schema: incoming.schema.clone(),
                table: incoming.table.clone(),
                row_key: key,
            };
            let candidate_key = candidate.canonical_key();
            if candidate_key != incoming_key
                && !already_replaced.contains(&candidate_key)
                && existing.contains_key(&candidate_key)
            {
                return Some(candidate_key);
            }
        }
        None
    }
}
