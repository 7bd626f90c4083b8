//! TTL clamping and comparison for query eviction.
//!
//! A TTL is a millisecond duration a query survives after its last desiring
//! client inactivates it. Negative values mean "no effective limit" and are
//! clamped to [`MAX_TTL_MS`] for eviction math; for comparison purposes a
//! negative TTL sorts above every finite one.

use std::cmp::Ordering;

/// Milliseconds. Negative means "no effective limit".
pub type TtlMs = i64;

/// Upper bound applied to every TTL.
pub const MAX_TTL_MS: TtlMs = 300_000;

/// Clamp a TTL into `[0, MAX_TTL_MS]`. Negative ("no limit") values clamp
/// to the maximum.
#[must_use]
pub fn clamp_ttl(ttl: TtlMs) -> TtlMs {
    if ttl < 0 { MAX_TTL_MS } else { ttl.min(MAX_TTL_MS) }
}

/// Order two TTLs, treating negative values as infinite.
///
/// Used to decide whether a desired-query request extends an existing TTL;
/// TTLs only ever ratchet upward through that path.
#[must_use]
pub fn cmp_ttl(a: TtlMs, b: TtlMs) -> Ordering {
    match (a < 0, b < 0) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.cmp(&b),
    }
}

/// The instant (on the ttl clock) at which an inactivated query expires.
#[must_use]
pub fn effective_expiry(inactivated_at: i64, ttl: TtlMs) -> i64 {
    inactivated_at + clamp_ttl(ttl)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_ttl_bounds() {
        assert_eq!(clamp_ttl(0), 0);
        assert_eq!(clamp_ttl(1_000), 1_000);
        assert_eq!(clamp_ttl(MAX_TTL_MS), MAX_TTL_MS);
        assert_eq!(clamp_ttl(MAX_TTL_MS + 1), MAX_TTL_MS);
        assert_eq!(clamp_ttl(-1), MAX_TTL_MS);
        assert_eq!(clamp_ttl(i64::MIN), MAX_TTL_MS);
    }

    #[test]
    fn test_cmp_ttl_negative_is_infinite() {
        assert_eq!(cmp_ttl(-1, i64::MAX), Ordering::Greater);
        assert_eq!(cmp_ttl(i64::MAX, -1), Ordering::Less);
        assert_eq!(cmp_ttl(-1, -500), Ordering::Equal);
        assert_eq!(cmp_ttl(100, 200), Ordering::Less);
        assert_eq!(cmp_ttl(200, 200), Ordering::Equal);
    }

    #[test]
    fn test_effective_expiry_uses_clamped_ttl() {
        assert_eq!(effective_expiry(100, 5_000), 5_100);
        assert_eq!(effective_expiry(100, -1), 100 + MAX_TTL_MS);
        assert_eq!(effective_expiry(100, MAX_TTL_MS * 2), 100 + MAX_TTL_MS);
    }
}
