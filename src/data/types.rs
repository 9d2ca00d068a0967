use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use crate::error::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameTitle {
    Csgo,
    Dota2,
    Valorant,
}

impl GameTitle {
    /// Slug used both by the source API and the database
    pub fn as_str(&self) -> &'static str {
        match self {
            GameTitle::Csgo => "csgo",
            GameTitle::Dota2 => "dota2",
            GameTitle::Valorant => "valorant",
        }
    }
}

impl fmt::Display for GameTitle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown game title: {0}")]
pub struct UnknownGameTitle(pub String);

impl FromStr for GameTitle {
    type Err = UnknownGameTitle;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "csgo" | "cs2" | "cs-go" => Ok(GameTitle::Csgo),
            "dota2" | "dota-2" => Ok(GameTitle::Dota2),
            "valorant" => Ok(GameTitle::Valorant),
            other => Err(UnknownGameTitle(other.to_string())),
        }
    }
}

/// One finished (or forfeited) historical contest. Immutable once ingested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub match_id: String,
    pub game: GameTitle,
    pub team_a: String,
    pub team_b: String,
    pub winner: Option<String>,
    pub played_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl MatchRecord {
    pub fn validate(&self, fetched_at: DateTime<Utc>) -> Result<(), ValidationError> {
        if self.match_id.trim().is_empty() {
            return Err(ValidationError::EmptyField("match identifier"));
        }
        if self.team_a.trim().is_empty() || self.team_b.trim().is_empty() {
            return Err(ValidationError::EmptyField("team identifier"));
        }
        if self.team_a == self.team_b {
            return Err(ValidationError::SameTeams(self.match_id.clone()));
        }
        if let Some(winner) = &self.winner {
            if winner != &self.team_a && winner != &self.team_b {
                return Err(ValidationError::WinnerNotParticipant {
                    match_id: self.match_id.clone(),
                    winner: winner.clone(),
                });
            }
        }
        if self.played_at > fetched_at {
            return Err(ValidationError::FutureTimestamp {
                match_id: self.match_id.clone(),
                played_at: self.played_at,
                fetched_at,
            });
        }
        Ok(())
    }

    pub fn involves(&self, team: &str) -> bool {
        self.team_a == team || self.team_b == team
    }

    pub fn won_by(&self, team: &str) -> bool {
        self.winner.as_deref() == Some(team)
    }

    pub fn is_resolved(&self) -> bool {
        self.winner.is_some()
    }

    /// Catalogue entries for the participants whose display name the record carries
    pub fn participants(&self) -> Vec<TeamInfo> {
        [
            (&self.team_a, TEAM_A_NAME, TEAM_A_SLUG),
            (&self.team_b, TEAM_B_NAME, TEAM_B_SLUG),
        ]
        .into_iter()
        .filter_map(|(team_id, name_key, slug_key)| {
            let name = self.metadata.get(name_key)?;
            Some(TeamInfo {
                team_id: team_id.clone(),
                game: self.game,
                name: name.clone(),
                slug: self.metadata.get(slug_key).cloned(),
            })
        })
        .collect()
    }
}

pub const TEAM_A_NAME: &str = "team_a_name";
pub const TEAM_A_SLUG: &str = "team_a_slug";
pub const TEAM_B_NAME: &str = "team_b_name";
pub const TEAM_B_SLUG: &str = "team_b_slug";

/// Display details for a team id, per game
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamInfo {
    pub team_id: String,
    pub game: GameTitle,
    pub name: String,
    pub slug: Option<String>,
}

/// A scheduled match that has not been played yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpcomingMatch {
    pub match_id: String,
    pub game: GameTitle,
    pub team_a: String,
    pub team_b: String,
    pub scheduled_at: DateTime<Utc>,
}
