use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};
use crate::data::types::{GameTitle, MatchRecord, TeamInfo};
use crate::error::ValidationError;
use crate::store::database::{format_ts, parse_game, parse_ts, Database};

const RECORD_COLUMNS: &str = "match_id, game, team_a, team_b, winner, played_at, metadata";

#[derive(Debug, Default, Clone, PartialEq)]
pub struct IngestReport {
    pub inserted: usize,
    pub duplicates: usize,
    pub rejected: Vec<(String, ValidationError)>,
}

/// Normalised historical results. Append-only: records are never updated or deleted.
pub struct MatchRecordStore {
    db: Arc<Database>,
}

impl MatchRecordStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert valid records, skip already-known match ids, report invalid ones
    /// individually. A bad record never aborts the rest of the batch.
    pub fn ingest<I>(&self, records: I, fetched_at: DateTime<Utc>) -> Result<IngestReport>
    where
        I: IntoIterator<Item = MatchRecord>,
    {
        let mut report = IngestReport::default();
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;

        for record in records {
            if let Err(e) = record.validate(fetched_at) {
                warn!("Rejected match record {}: {}", record.match_id, e);
                report.rejected.push((record.match_id, e));
                continue;
            }

            let metadata = serde_json::to_string(&record.metadata)
                .context("Failed to encode match metadata")?;
            let changed = tx.execute(
                "INSERT OR IGNORE INTO match_records
                    (match_id, game, team_a, team_b, winner, played_at, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.match_id,
                    record.game.as_str(),
                    record.team_a,
                    record.team_b,
                    record.winner,
                    format_ts(&record.played_at),
                    metadata,
                ],
            )?;

            for team in record.participants() {
                tx.execute(
                    "INSERT INTO teams (team_id, game, name, slug) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(team_id, game) DO UPDATE SET
                        name = excluded.name,
                        slug = COALESCE(excluded.slug, teams.slug)",
                    params![team.team_id, team.game.as_str(), team.name, team.slug],
                )?;
            }

            if changed == 0 {
                report.duplicates += 1;
            } else {
                report.inserted += 1;
            }
        }

        tx.commit()?;
        debug!(
            "Ingest: {} inserted, {} duplicates, {} rejected",
            report.inserted,
            report.duplicates,
            report.rejected.len()
        );
        Ok(report)
    }

    /// Most recent first, at most `limit`, only matches played at or before `as_of`
    pub fn records_for(
        &self,
        team: &str,
        game: GameTitle,
        as_of: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MatchRecord>> {
        self.recent(team, game, as_of, limit, "")
    }

    /// Same as `records_for`, but only matches with a recorded winner
    pub fn results_for(
        &self,
        team: &str,
        game: GameTitle,
        as_of: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MatchRecord>> {
        self.recent(team, game, as_of, limit, "AND winner IS NOT NULL")
    }

    fn recent(
        &self,
        team: &str,
        game: GameTitle,
        as_of: DateTime<Utc>,
        limit: usize,
        filter: &str,
    ) -> Result<Vec<MatchRecord>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM match_records
             WHERE game = ?1 AND (team_a = ?2 OR team_b = ?2) AND played_at <= ?3 {filter}
             ORDER BY played_at DESC, match_id DESC
             LIMIT ?4"
        ))?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let records = stmt.query_map(
            params![game.as_str(), team, format_ts(&as_of), limit],
            row_to_record,
        )?;
        records.collect::<Result<Vec<_>, _>>().map_err(|e| e.into())
    }

    /// Every meeting between the two teams, either side as A or B, most recent first
    pub fn records_between(
        &self,
        team: &str,
        opponent: &str,
        game: GameTitle,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<MatchRecord>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM match_records
             WHERE game = ?1
               AND ((team_a = ?2 AND team_b = ?3) OR (team_a = ?3 AND team_b = ?2))
               AND played_at <= ?4
             ORDER BY played_at DESC, match_id DESC"
        ))?;

        let records = stmt.query_map(
            params![game.as_str(), team, opponent, format_ts(&as_of)],
            row_to_record,
        )?;
        records.collect::<Result<Vec<_>, _>>().map_err(|e| e.into())
    }

    /// Timestamp of the team's newest known match at or before `as_of`
    pub fn newest_record_at(
        &self,
        team: &str,
        game: GameTitle,
        as_of: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let conn = self.db.lock()?;
        let newest: Option<String> = conn.query_row(
            "SELECT MAX(played_at) FROM match_records
             WHERE game = ?1 AND (team_a = ?2 OR team_b = ?2) AND played_at <= ?3",
            params![game.as_str(), team, format_ts(&as_of)],
            |row| row.get(0),
        )?;

        newest
            .map(|s| parse_ts(0, &s))
            .transpose()
            .map_err(|e| e.into())
    }

    pub fn team(&self, team_id: &str, game: GameTitle) -> Result<Option<TeamInfo>> {
        let conn = self.db.lock()?;
        let team = conn
            .query_row(
                "SELECT team_id, name, slug FROM teams WHERE team_id = ?1 AND game = ?2",
                params![team_id, game.as_str()],
                |row| {
                    Ok(TeamInfo {
                        team_id: row.get(0)?,
                        game,
                        name: row.get(1)?,
                        slug: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(team)
    }

    pub fn count_for(&self, team: &str, game: GameTitle) -> Result<usize> {
        let conn = self.db.lock()?;
        let count: usize = conn.query_row(
            "SELECT COUNT(*) FROM match_records WHERE game = ?1 AND (team_a = ?2 OR team_b = ?2)",
            params![game.as_str(), team],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<MatchRecord> {
    let game: String = row.get(1)?;
    let played_at: String = row.get(5)?;
    let metadata: String = row.get(6)?;
    let metadata: BTreeMap<String, String> = serde_json::from_str(&metadata)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;

    Ok(MatchRecord {
        match_id: row.get(0)?,
        game: parse_game(1, &game)?,
        team_a: row.get(2)?,
        team_b: row.get(3)?,
        winner: row.get(4)?,
        played_at: parse_ts(5, &played_at)?,
        metadata,
    })
}
