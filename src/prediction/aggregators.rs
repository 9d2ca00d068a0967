//! Pure statistics over match histories. No I/O, no caching.

use chrono::{DateTime, Utc};
use crate::data::types::MatchRecord;
use crate::error::InsufficientDataError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FormStats {
    pub wins: usize,
    pub considered: usize,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct H2hStats {
    pub wins: u32,
    pub total: u32,
}

/// Win rate over the team's `window` most recent resolved matches.
/// `records` must be ordered most recent first. Unresolved matches
/// (no winner) are not counted.
pub fn form_score(
    team: &str,
    records: &[MatchRecord],
    window: usize,
) -> Result<FormStats, InsufficientDataError> {
    let (wins, considered) = records
        .iter()
        .filter(|r| r.involves(team) && r.is_resolved())
        .take(window)
        .fold((0, 0), |(wins, n), r| (wins + usize::from(r.won_by(team)), n + 1));

    if considered == 0 {
        return Err(InsufficientDataError(format!("form of {}", team)));
    }

    Ok(FormStats {
        wins,
        considered,
        score: wins as f64 / considered as f64,
    })
}

/// `team`'s win rate against `opponent` over every resolved meeting
pub fn h2h_score(
    team: &str,
    opponent: &str,
    records: &[MatchRecord],
) -> Result<H2hStats, InsufficientDataError> {
    let mut stats = H2hStats { wins: 0, total: 0 };
    for r in records
        .iter()
        .filter(|r| r.involves(team) && r.involves(opponent) && r.is_resolved())
    {
        stats.total += 1;
        if r.won_by(team) {
            stats.wins += 1;
        }
    }

    if stats.total == 0 {
        return Err(InsufficientDataError(format!("{} vs {}", team, opponent)));
    }
    Ok(stats)
}

/// Readiness in [0, 1]: whole days since the last match, capped at `rest_cap_days`.
/// A team with no matches is fully rested.
pub fn fatigue_score(
    last_match: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    rest_cap_days: f64,
) -> f64 {
    let Some(last_match) = last_match else {
        return 1.0;
    };
    let days = (now - last_match).num_days().max(0) as f64;
    days.min(rest_cap_days) / rest_cap_days
}
