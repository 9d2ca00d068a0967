use anyhow::{anyhow, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::Connection;
use std::sync::{Mutex, MutexGuard};
use tracing::info;
use crate::data::types::GameTitle;

/// Shared SQLite handle. Every write is a single statement (or one
/// transaction), so readers never observe a half-written row.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS match_records (
                match_id TEXT PRIMARY KEY,
                game TEXT NOT NULL,
                team_a TEXT NOT NULL,
                team_b TEXT NOT NULL,
                winner TEXT,
                played_at TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}'
            );

            CREATE TABLE IF NOT EXISTS teams (
                team_id TEXT NOT NULL,
                game TEXT NOT NULL,
                name TEXT NOT NULL,
                slug TEXT,
                PRIMARY KEY (team_id, game)
            );

            CREATE TABLE IF NOT EXISTS team_snapshots (
                team_id TEXT NOT NULL,
                game TEXT NOT NULL,
                computed_at TEXT NOT NULL,
                form_score REAL NOT NULL,
                sample_size INTEGER NOT NULL,
                source_watermark TEXT,
                PRIMARY KEY (team_id, game)
            );

            CREATE TABLE IF NOT EXISTS h2h_snapshots (
                team_id TEXT NOT NULL,
                opponent_id TEXT NOT NULL,
                game TEXT NOT NULL,
                wins INTEGER NOT NULL CHECK (wins >= 0),
                total INTEGER NOT NULL CHECK (total >= wins),
                computed_at TEXT NOT NULL,
                PRIMARY KEY (team_id, opponent_id, game)
            );

            CREATE TABLE IF NOT EXISTS predictions (
                match_id TEXT NOT NULL,
                computed_at TEXT NOT NULL,
                payload TEXT NOT NULL,
                PRIMARY KEY (match_id, computed_at)
            );

            CREATE INDEX IF NOT EXISTS idx_match_records_team_a ON match_records(game, team_a, played_at);
            CREATE INDEX IF NOT EXISTS idx_match_records_team_b ON match_records(game, team_b, played_at);
            "#
        )?;

        info!("Database schema ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("Database connection mutex poisoned"))
    }
}

/// Fixed-width RFC 3339 so that text order in SQLite equals time order
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn parse_ts(column: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

pub fn parse_game(column: usize, value: &str) -> rusqlite::Result<GameTitle> {
    value
        .parse::<GameTitle>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_text_order_matches_time_order() {
        let early = Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap();
        let late = early + chrono::Duration::milliseconds(1500);

        assert!(format_ts(&early) < format_ts(&late));
        assert_eq!(format_ts(&early).len(), format_ts(&late).len());
        assert_eq!(parse_ts(0, &format_ts(&late)).unwrap(), late);
    }

    #[test]
    fn test_schema_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.lock().unwrap();
        conn.execute_batch("CREATE TABLE IF NOT EXISTS match_records (match_id TEXT PRIMARY KEY);")
            .unwrap();
        let tables: usize = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 5);
    }
}
