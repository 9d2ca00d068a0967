use chrono::{DateTime, Utc};
use std::future::Future;
use crate::data::types::{GameTitle, MatchRecord, UpcomingMatch};
use crate::error::FetchError;

/// External match-history source. Implementations normalise whatever the
/// remote side returns into strict `MatchRecord`s and own their retry policy.
pub trait MatchSource: Send + Sync {
    /// Finished matches for `team`, newest first. `since` narrows the window
    /// to matches played after that instant.
    fn fetch_history(
        &self,
        team: &str,
        game: GameTitle,
        since: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<Vec<MatchRecord>, FetchError>> + Send;

    /// Scheduled matches that have not been played yet
    fn fetch_upcoming(
        &self,
        game: GameTitle,
    ) -> impl Future<Output = Result<Vec<UpcomingMatch>, FetchError>> + Send;
}
