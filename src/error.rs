use chrono::{DateTime, Utc};
use std::time::Duration;

/// A match record rejected on ingest. The rest of the batch is unaffected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Empty {0}")]
    EmptyField(&'static str),

    #[error("Match {0} has the same team on both sides")]
    SameTeams(String),

    #[error("Match {match_id}: winner {winner} did not play in it")]
    WinnerNotParticipant { match_id: String, winner: String },

    #[error("Match {match_id} is dated {played_at}, after fetch time {fetched_at}")]
    FutureTimestamp {
        match_id: String,
        played_at: DateTime<Utc>,
        fetched_at: DateTime<Utc>,
    },
}

/// No resolved matches to aggregate. The engine converts this into a neutral score.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("No resolved matches available for {0}")]
pub struct InsufficientDataError(pub String);

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Source returned status {0}")]
    Status(u16),

    #[error("Rate limited after {0} attempts")]
    RateLimited(u32),

    #[error("Failed to decode source payload: {0}")]
    Decode(String),

    #[error("Fetch timed out after {0:?}")]
    Timeout(Duration),
}

/// Invalid engine configuration. Raised once at construction, never per request.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("Factor weights sum to {0}, expected 1.0")]
    WeightsDoNotSumToOne(f64),

    #[error("Weight {0} must be finite and non-negative, got {1}")]
    InvalidWeight(&'static str, f64),

    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),

    #[error("{0} must lie in [0, 1], got {1}")]
    OutOfUnitRange(&'static str, f64),
}

#[derive(Debug, thiserror::Error)]
pub enum PredictError {
    #[error("Invalid prediction request: {0}")]
    InvalidRequest(String),

    #[error("No data available for team {team}: {source}")]
    DataUnavailable {
        team: String,
        #[source]
        source: FetchError,
    },

    #[error("Upcoming matches unavailable: {0}")]
    Upcoming(#[from] FetchError),

    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}
