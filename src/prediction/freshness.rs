use chrono::{DateTime, Duration, Utc};

/// Whether a cached aggregate must be recomputed.
///
/// Stale when there is no snapshot, when it is older than `max_age`, when a
/// match newer than the snapshot has been stored since, or when the snapshot
/// was computed after `now` (a point-in-time request must not see it).
pub fn is_stale(
    snapshot_computed_at: Option<DateTime<Utc>>,
    newest_available: Option<DateTime<Utc>>,
    max_age: Duration,
    now: DateTime<Utc>,
) -> bool {
    let Some(computed_at) = snapshot_computed_at else {
        return true;
    };
    if computed_at > now {
        return true;
    }
    if now - computed_at > max_age {
        return true;
    }
    matches!(newest_available, Some(newest) if newest > computed_at)
}
