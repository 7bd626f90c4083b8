//! Reference-count merging.
//!
//! A row's `refCounts` maps query ids to the number of times that query
//! currently references the row. [`merge_ref_counts`] is the sole authority
//! for "is this row still visible": a row whose merged counts collapse to
//! nothing is unreferenced and pending delete.

use std::collections::{BTreeMap, BTreeSet};

/// Per-query reference counts for one row. Values are strictly positive;
/// a row with no references is represented as `None`, never an empty map.
pub type RefCounts = BTreeMap<String, i64>;

/// Merge reference-count contributions for one row.
///
/// Starts from `existing` with every entry named in `remove_ids` stripped,
/// then additively merges `received`. Entries that end up zero or negative
/// are dropped. Returns `None` iff no strictly-positive entry remains.
///
/// The result is commutative in the multiset of `received` contributions.
#[must_use]
pub fn merge_ref_counts(
    existing: Option<&RefCounts>,
    received: &RefCounts,
    remove_ids: &BTreeSet<String>,
) -> Option<RefCounts> {
    let mut merged: RefCounts = match existing {
        Some(counts) => counts
            .iter()
            .filter(|(id, _)| !remove_ids.contains(*id))
            .map(|(id, n)| (id.clone(), *n))
            .collect(),
        None => RefCounts::new(),
    };

    for (id, delta) in received {
        let count = merged.entry(id.clone()).or_insert(0);
        *count += delta;
        if *count <= 0 {
            merged.remove(id);
        }
    }

    if merged.is_empty() { None } else { Some(merged) }
}
