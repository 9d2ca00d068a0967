use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::data::types::GameTitle;

/// Cached form aggregate for one team in one game. Overwritten on recompute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamStatsSnapshot {
    pub team_id: String,
    pub game: GameTitle,
    pub computed_at: DateTime<Utc>,
    pub form_score: f64,
    /// Resolved matches folded into `form_score`; 0 means the neutral fallback was used
    pub sample_size: usize,
    /// Newest match timestamp known when this snapshot was computed
    pub source_watermark: Option<DateTime<Utc>>,
}

/// Head-to-head tally for an ordered pair. (A, B) and (B, A) are stored separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct H2HStatsSnapshot {
    pub team_id: String,
    pub opponent_id: String,
    pub game: GameTitle,
    pub wins: u32,
    pub total: u32,
    pub computed_at: DateTime<Utc>,
}

impl H2HStatsSnapshot {
    pub fn win_rate(&self) -> Option<f64> {
        if self.total == 0 {
            None
        } else {
            Some(f64::from(self.wins) / f64::from(self.total))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentBreakdown {
    pub form_a: f64,
    pub form_b: f64,
    /// Team A's win rate against team B
    pub h2h: f64,
    pub fatigue_a: f64,
    pub fatigue_b: f64,
    /// fatigue_a - fatigue_b; positive means team A is better rested
    pub fatigue_delta: f64,
    pub score_a: f64,
    pub score_b: f64,
}

/// A substituted or degraded input, recorded on the prediction that used it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Fallback {
    /// Team has no resolved matches; form set to the neutral value
    NeutralForm { team: String },
    /// Teams never met; H2H set to the neutral value
    NeutralH2h,
    /// Source unreachable; a stale snapshot was reused
    StaleSnapshot { team: String },
    /// Source unreachable; form recomputed from locally stored matches only
    LocalDataOnly { team: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchPrediction {
    pub match_id: String,
    pub game: GameTitle,
    pub team_a: String,
    pub team_b: String,
    pub predicted_winner: String,
    /// Percentage in [50.0, 100.0], one decimal
    pub confidence: f64,
    pub breakdown: ComponentBreakdown,
    /// True when any input came from stale or local-only data because the source failed
    pub degraded: bool,
    pub fallbacks: Vec<Fallback>,
    pub computed_at: DateTime<Utc>,
}

impl MatchPrediction {
    pub fn is_for(&self, team_a: &str, team_b: &str, game: GameTitle) -> bool {
        self.team_a == team_a && self.team_b == team_b && self.game == game
    }
}
