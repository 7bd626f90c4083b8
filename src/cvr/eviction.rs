//! TTL-based query eviction.
//!
//! A query becomes evictable only when *every* client referencing it has
//! inactivated its desire; any still-desiring client vetoes eligibility.
//! An eligible query stays alive until the last interested client's grace
//! period elapses: its reported expiry is the latest
//! `inactivated_at + clamp_ttl(ttl)` among contributing clients.

use vsync_proto::{effective_expiry, TtlMs};

use crate::cvr::records::Cvr;

/// An inactive query eligible for eviction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InactiveQuery {
    /// Query hash.
    pub id: String,
    /// Inactivation instant (ttl clock) of the contributing client whose
    /// grace period ends last.
    pub inactivated_at: i64,
    /// That client's TTL, in ms.
    pub ttl: TtlMs,
}

impl InactiveQuery {
    /// The ttl-clock instant at which the query expires.
    pub fn expiry(&self) -> i64 {
        effective_expiry(self.inactivated_at, self.ttl)
    }
}

/// The queries eligible for eviction, sorted by effective expiry
/// ascending, ties broken by `inactivated_at` ascending.
///
/// Internal queries and queries with no client state are never reported:
/// the former are server-managed, the latter have no grace period to time
/// out and are torn down by the next query-driven round.
pub fn get_inactive_queries(cvr: &Cvr) -> Vec<InactiveQuery> {
    let mut inactive: Vec<InactiveQuery> = cvr
        .queries
        .values()
        .filter(|query| !query.is_internal())
        .filter_map(|query| {
            let states = query.client_state();
            if states.is_empty() {
                return None;
            }
            let mut latest: Option<InactiveQuery> = None;
            for state in states.values() {
                // A still-desiring client vetoes eligibility outright.
                let inactivated_at = state.inactivated_at?;
                let candidate = InactiveQuery {
                    id: query.id().to_string(),
                    inactivated_at,
                    ttl: state.ttl,
                };
                latest = Some(match latest {
                    Some(current) if current.expiry() >= candidate.expiry() => current,
                    _ => candidate,
                });
            }
            latest
        })
        .collect();

    inactive.sort_by(|a, b| {
        a.expiry()
            .cmp(&b.expiry())
            .then(a.inactivated_at.cmp(&b.inactivated_at))
            .then(a.id.cmp(&b.id))
    });
    inactive
}

/// The earliest effective expiry over all eligible queries, or `None` when
/// nothing is eligible.
pub fn next_eviction_time(cvr: &Cvr) -> Option<i64> {
    get_inactive_queries(cvr)
        .first()
        .map(InactiveQuery::expiry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cvr::records::{ClientQuery, ClientQueryState, QueryRecord};
    use vsync_proto::{Ast, CvrVersion, MAX_TTL_MS};

    fn cvr_with_query(states: &[(&str, TtlMs, Option<i64>)]) -> Cvr {
        let mut cvr = Cvr::new("g");
        let mut query = ClientQuery {
            id: "h1".to_string(),
            ast: Ast::table("issues"),
            client_state: Default::default(),
            patch_version: Some(CvrVersion::new("01")),
            transformation_hash: None,
            transformation_version: None,
        };
        for (client, ttl, inactivated_at) in states {
            query.client_state.insert(
                client.to_string(),
                ClientQueryState {
                    version: CvrVersion::new("01"),
                    ttl: *ttl,
                    inactivated_at: *inactivated_at,
                },
            );
        }
        cvr.queries
            .insert("h1".to_string(), QueryRecord::Client(query));
        cvr
    }

    #[test]
    fn test_still_desiring_client_vetoes() {
        // A inactivated at t=100, B still desires.
        let cvr = cvr_with_query(&[("a", 5_000, Some(100)), ("b", 5_000, None)]);
        assert!(get_inactive_queries(&cvr).is_empty());
        assert_eq!(next_eviction_time(&cvr), None);
    }

    #[test]
    fn test_latest_expiry_wins_once_all_inactivated() {
        let cvr = cvr_with_query(&[("a", 5_000, Some(100)), ("b", 1_000, Some(7_000))]);
        let inactive = get_inactive_queries(&cvr);
        assert_eq!(inactive.len(), 1);
        // a expires at 5100, b at 8000; the query lives until 8000.
        assert_eq!(inactive[0].inactivated_at, 7_000);
        assert_eq!(inactive[0].ttl, 1_000);
        assert_eq!(inactive[0].expiry(), 8_000);
        assert_eq!(next_eviction_time(&cvr), Some(8_000));
    }

    #[test]
    fn test_ttl_clamped_in_expiry() {
        let cvr = cvr_with_query(&[("a", -1, Some(100))]);
        assert_eq!(next_eviction_time(&cvr), Some(100 + MAX_TTL_MS));
    }

    #[test]
    fn test_empty_client_state_not_reported() {
        let cvr = cvr_with_query(&[]);
        assert!(get_inactive_queries(&cvr).is_empty());
    }

    #[test]
    fn test_sorted_by_expiry_then_inactivated_at() {
        let mut cvr = cvr_with_query(&[("a", 1_000, Some(500))]); // expiry 1500
        let mut q2 = ClientQuery {
            id: "h2".to_string(),
            ast: Ast::table("comments"),
            client_state: Default::default(),
            patch_version: Some(CvrVersion::new("01")),
            transformation_hash: None,
            transformation_version: None,
        };
        q2.client_state.insert(
            "a".to_string(),
            ClientQueryState {
                version: CvrVersion::new("01"),
                ttl: 1_300,
                inactivated_at: Some(200), // expiry 1500, earlier inactivation
            },
        );
        cvr.queries
            .insert("h2".to_string(), QueryRecord::Client(q2));

        let inactive = get_inactive_queries(&cvr);
        assert_eq!(inactive.len(), 2);
        assert_eq!(inactive[0].id, "h2");
        assert_eq!(inactive[1].id, "h1");
    }
}
