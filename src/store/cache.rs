use anyhow::{Context, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;
use crate::data::types::GameTitle;
use crate::prediction::types::{H2HStatsSnapshot, MatchPrediction, TeamStatsSnapshot};
use crate::store::database::{format_ts, parse_game, parse_ts, Database};

/// Derived state: team and H2H snapshots plus predictions. The newest
/// prediction per match is also held in memory so repeat lookups skip SQLite.
pub struct PredictionCache {
    db: Arc<Database>,
    latest: DashMap<String, MatchPrediction>,
}

impl PredictionCache {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            latest: DashMap::new(),
        }
    }

    pub fn team_snapshot(&self, team: &str, game: GameTitle) -> Result<Option<TeamStatsSnapshot>> {
        let conn = self.db.lock()?;
        let snapshot = conn
            .query_row(
                "SELECT team_id, game, computed_at, form_score, sample_size, source_watermark
                 FROM team_snapshots WHERE team_id = ?1 AND game = ?2",
                params![team, game.as_str()],
                |row| {
                    let game: String = row.get(1)?;
                    let computed_at: String = row.get(2)?;
                    let watermark: Option<String> = row.get(5)?;
                    Ok(TeamStatsSnapshot {
                        team_id: row.get(0)?,
                        game: parse_game(1, &game)?,
                        computed_at: parse_ts(2, &computed_at)?,
                        form_score: row.get(3)?,
                        sample_size: row.get(4)?,
                        source_watermark: watermark.map(|s| parse_ts(5, &s)).transpose()?,
                    })
                },
            )
            .optional()?;
        Ok(snapshot)
    }

    /// Supersedes any previous snapshot for the same team and game
    pub fn put_team_snapshot(&self, snapshot: &TeamStatsSnapshot) -> Result<()> {
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO team_snapshots
                (team_id, game, computed_at, form_score, sample_size, source_watermark)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                snapshot.team_id,
                snapshot.game.as_str(),
                format_ts(&snapshot.computed_at),
                snapshot.form_score,
                snapshot.sample_size,
                snapshot.source_watermark.as_ref().map(format_ts),
            ],
        )?;
        Ok(())
    }

    pub fn h2h_snapshot(
        &self,
        team: &str,
        opponent: &str,
        game: GameTitle,
    ) -> Result<Option<H2HStatsSnapshot>> {
        let conn = self.db.lock()?;
        let snapshot = conn
            .query_row(
                "SELECT team_id, opponent_id, game, wins, total, computed_at
                 FROM h2h_snapshots WHERE team_id = ?1 AND opponent_id = ?2 AND game = ?3",
                params![team, opponent, game.as_str()],
                |row| {
                    let game: String = row.get(2)?;
                    let computed_at: String = row.get(5)?;
                    Ok(H2HStatsSnapshot {
                        team_id: row.get(0)?,
                        opponent_id: row.get(1)?,
                        game: parse_game(2, &game)?,
                        wins: row.get(3)?,
                        total: row.get(4)?,
                        computed_at: parse_ts(5, &computed_at)?,
                    })
                },
            )
            .optional()?;
        Ok(snapshot)
    }

    pub fn put_h2h_snapshot(&self, snapshot: &H2HStatsSnapshot) -> Result<()> {
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO h2h_snapshots
                (team_id, opponent_id, game, wins, total, computed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                snapshot.team_id,
                snapshot.opponent_id,
                snapshot.game.as_str(),
                snapshot.wins,
                snapshot.total,
                format_ts(&snapshot.computed_at),
            ],
        )?;
        Ok(())
    }

    /// Newest prediction for a match, from memory when possible
    pub fn latest_prediction(&self, match_id: &str) -> Result<Option<MatchPrediction>> {
        if let Some(hit) = self.latest.get(match_id) {
            return Ok(Some(hit.clone()));
        }

        let payload: Option<String> = {
            let conn = self.db.lock()?;
            conn.query_row(
                "SELECT payload FROM predictions WHERE match_id = ?1
                 ORDER BY computed_at DESC LIMIT 1",
                params![match_id],
                |row| row.get(0),
            )
            .optional()?
        };

        let Some(payload) = payload else {
            return Ok(None);
        };
        let prediction: MatchPrediction = serde_json::from_str(&payload)
            .with_context(|| format!("Corrupt prediction payload for match {}", match_id))?;
        self.remember(prediction.clone());
        Ok(Some(prediction))
    }

    /// Last writer wins. Rows are keyed by (match, computed_at), so an
    /// identical recomputation overwrites itself with the same bytes.
    pub fn put_prediction(&self, prediction: &MatchPrediction) -> Result<()> {
        let payload = serde_json::to_string(prediction).context("Failed to encode prediction")?;
        {
            let conn = self.db.lock()?;
            conn.execute(
                "INSERT OR REPLACE INTO predictions (match_id, computed_at, payload)
                 VALUES (?1, ?2, ?3)",
                params![prediction.match_id, format_ts(&prediction.computed_at), payload],
            )?;
        }
        self.remember(prediction.clone());
        Ok(())
    }

    /// All stored predictions for a match, oldest first
    pub fn prediction_history(&self, match_id: &str) -> Result<Vec<MatchPrediction>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(
            "SELECT payload FROM predictions WHERE match_id = ?1 ORDER BY computed_at ASC",
        )?;
        let payloads = stmt
            .query_map(params![match_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        payloads
            .iter()
            .map(|p| serde_json::from_str(p).context("Corrupt prediction payload"))
            .collect()
    }

    fn remember(&self, prediction: MatchPrediction) {
        match self.latest.entry(prediction.match_id.clone()) {
            Entry::Occupied(mut slot) => {
                if prediction.computed_at >= slot.get().computed_at {
                    slot.insert(prediction);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(prediction);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}
