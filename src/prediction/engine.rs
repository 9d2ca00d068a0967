use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use crate::config::{FactorWeights, PredictionConfig};
use crate::data::source::MatchSource;
use crate::data::types::{GameTitle, MatchRecord, UpcomingMatch};
use crate::error::{ConfigurationError, FetchError, PredictError};
use crate::prediction::aggregators::{fatigue_score, form_score, h2h_score, H2hStats};
use crate::prediction::freshness::is_stale;
use crate::prediction::types::{
    ComponentBreakdown, Fallback, H2HStatsSnapshot, MatchPrediction, TeamStatsSnapshot,
};
use crate::store::cache::PredictionCache;
use crate::store::database::Database;
use crate::store::records::MatchRecordStore;

/// Scores closer than this are a tie
const TIE_TOLERANCE: f64 = 1e-9;

/// Orchestrates freshness checks, refetching, aggregation and blending.
/// Holds no state of its own beyond the two stores.
pub struct PredictionEngine<S> {
    config: PredictionConfig,
    source: S,
    records: MatchRecordStore,
    cache: PredictionCache,
}

/// Form for one team as used by a single prediction
#[derive(Debug, Clone)]
struct TeamForm {
    snapshot: TeamStatsSnapshot,
    refreshed: bool,
    degraded: bool,
    fallbacks: Vec<Fallback>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SyncReport {
    pub refreshed: usize,
    pub up_to_date: usize,
    pub degraded: usize,
    pub failed: Vec<(String, String)>,
}

impl<S: MatchSource> PredictionEngine<S> {
    pub fn new(
        config: PredictionConfig,
        source: S,
        db: Arc<Database>,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;

        Ok(Self {
            config,
            source,
            records: MatchRecordStore::new(db.clone()),
            cache: PredictionCache::new(db),
        })
    }

    pub fn records(&self) -> &MatchRecordStore {
        &self.records
    }

    pub fn cache(&self) -> &PredictionCache {
        &self.cache
    }

    /// Predict the winner of `team_a` vs `team_b`, as seen at `as_of` (default now).
    ///
    /// Returns the cached prediction untouched while it is fresh. Otherwise
    /// refreshes both teams' form (fetching when stale), refreshes H2H,
    /// derives fatigue and blends. Only a team with no snapshot, no stored
    /// matches and an unreachable source fails the call.
    pub async fn predict(
        &self,
        match_id: &str,
        team_a: &str,
        team_b: &str,
        game: GameTitle,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<MatchPrediction, PredictError> {
        validate_request(match_id, team_a, team_b)?;
        let as_of = as_of.unwrap_or_else(Utc::now);
        let max_age = self.config.max_age();

        if let Some(cached) = self.cache.latest_prediction(match_id)? {
            if cached.is_for(team_a, team_b, game) {
                let newest = self.pair_watermark(team_a, team_b, game, as_of)?;
                if !is_stale(Some(cached.computed_at), newest, max_age, as_of) {
                    debug!("Prediction cache hit for match {}", match_id);
                    return Ok(cached);
                }
            }
        }

        // Independent per team; run both refreshes concurrently
        let (form_a, form_b) = tokio::join!(
            self.refresh_team(team_a, game, as_of, false),
            self.refresh_team(team_b, game, as_of, false),
        );
        let (form_a, form_b) = (form_a?, form_b?);

        let h2h_snapshot = self.refresh_h2h(team_a, team_b, game, as_of)?;
        let mut fallbacks: Vec<Fallback> = form_a
            .fallbacks
            .iter()
            .chain(form_b.fallbacks.iter())
            .cloned()
            .collect();
        let h2h = match h2h_snapshot.win_rate() {
            Some(rate) => rate,
            None => {
                warn!(
                    "No head-to-head history between {} and {}, using neutral {}",
                    team_a, team_b, self.config.h2h_neutral
                );
                fallbacks.push(Fallback::NeutralH2h);
                self.config.h2h_neutral
            }
        };

        let fatigue_a = fatigue_score(
            self.records.newest_record_at(team_a, game, as_of)?,
            as_of,
            self.config.fatigue_rest_cap_days,
        );
        let fatigue_b = fatigue_score(
            self.records.newest_record_at(team_b, game, as_of)?,
            as_of,
            self.config.fatigue_rest_cap_days,
        );

        let form_a_score = form_a.snapshot.form_score;
        let form_b_score = form_b.snapshot.form_score;
        let (score_a, score_b) = blend(
            &self.config.weights,
            form_a_score,
            form_b_score,
            h2h,
            fatigue_a,
            fatigue_b,
        );

        let prediction = MatchPrediction {
            match_id: match_id.to_string(),
            game,
            team_a: team_a.to_string(),
            team_b: team_b.to_string(),
            predicted_winner: pick_winner(team_a, team_b, score_a, score_b).to_string(),
            confidence: confidence(score_a, score_b),
            breakdown: ComponentBreakdown {
                form_a: form_a_score,
                form_b: form_b_score,
                h2h,
                fatigue_a,
                fatigue_b,
                fatigue_delta: fatigue_a - fatigue_b,
                score_a,
                score_b,
            },
            degraded: form_a.degraded || form_b.degraded,
            fallbacks,
            computed_at: as_of,
        };

        self.cache.put_prediction(&prediction)?;
        info!(
            "Predicted {} vs {} ({}): {} at {:.1}%{}",
            team_a,
            team_b,
            game,
            prediction.predicted_winner,
            prediction.confidence,
            if prediction.degraded { " [degraded]" } else { "" }
        );
        Ok(prediction)
    }

    /// Lazily predict every upcoming match of `game`. The fixture list is
    /// fetched on first poll; each prediction runs when its item is polled.
    pub fn predict_upcoming(
        &self,
        game: GameTitle,
    ) -> impl Stream<Item = Result<MatchPrediction, PredictError>> + '_ {
        stream::once(self.fetch_upcoming(game))
            .map(move |fetched| match fetched {
                Ok(fixtures) => {
                    info!("{} upcoming {} matches", fixtures.len(), game);
                    stream::iter(fixtures.into_iter().map(Ok::<UpcomingMatch, PredictError>))
                        .left_stream()
                }
                Err(e) => {
                    warn!("Failed to fetch upcoming {} matches: {}", game, e);
                    stream::iter(std::iter::once(Err(PredictError::Upcoming(e)))).right_stream()
                }
            })
            .flatten()
            .and_then(move |fixture| async move {
                self.predict(
                    &fixture.match_id,
                    &fixture.team_a,
                    &fixture.team_b,
                    fixture.game,
                    None,
                )
                .await
            })
    }

    /// Refresh form snapshots for a batch of teams. With `force`, fresh
    /// snapshots are recomputed too. One team's failure never stops the rest.
    pub async fn sync_teams(&self, teams: &[String], game: GameTitle, force: bool) -> SyncReport {
        let now = Utc::now();
        let mut report = SyncReport::default();

        for team in teams {
            match self.refresh_team(team, game, now, force).await {
                Ok(form) if form.degraded => report.degraded += 1,
                Ok(form) if form.refreshed => report.refreshed += 1,
                Ok(_) => report.up_to_date += 1,
                Err(e) => {
                    error!("Failed to sync team {}: {}", team, e);
                    report.failed.push((team.clone(), e.to_string()));
                }
            }
        }

        info!(
            "Sync {}: {} refreshed, {} up to date, {} degraded, {} failed",
            game,
            report.refreshed,
            report.up_to_date,
            report.degraded,
            report.failed.len()
        );
        report
    }

    async fn refresh_team(
        &self,
        team: &str,
        game: GameTitle,
        as_of: DateTime<Utc>,
        force: bool,
    ) -> Result<TeamForm, PredictError> {
        let snapshot = self.cache.team_snapshot(team, game)?;
        let newest = self.records.newest_record_at(team, game, as_of)?;
        let computed_at = snapshot.as_ref().map(|s| s.computed_at);

        if !force && !is_stale(computed_at, newest, self.config.max_age(), as_of) {
            if let Some(snapshot) = snapshot {
                debug!("Form snapshot for {} is fresh", team);
                return Ok(self.team_form(snapshot, false, false, Vec::new()));
            }
        }

        // Only matches after this team's own last fold-in; the store may hold
        // newer records that arrived through an opponent's fetch.
        let since = snapshot.as_ref().and_then(|s| s.source_watermark);
        let mut fallbacks = Vec::new();
        let mut degraded = false;
        match self.fetch_history(team, game, since).await {
            Ok(fetched) => {
                let report = self.records.ingest(fetched, Utc::now())?;
                info!(
                    "Ingested history for {}: {} new, {} known, {} rejected",
                    team,
                    report.inserted,
                    report.duplicates,
                    report.rejected.len()
                );
            }
            Err(e) => {
                warn!("History fetch failed for {}: {}", team, e);
                let usable = snapshot
                    .filter(|s| s.computed_at <= as_of && s.source_watermark >= newest);
                if let Some(stale) = usable {
                    warn!("Using stale form snapshot for {} from {}", team, stale.computed_at);
                    let fallbacks = vec![Fallback::StaleSnapshot { team: team.to_string() }];
                    return Ok(self.team_form(stale, false, true, fallbacks));
                }
                if newest.is_none() {
                    return Err(PredictError::DataUnavailable {
                        team: team.to_string(),
                        source: e,
                    });
                }
                warn!("Recomputing form for {} from stored matches only", team);
                degraded = true;
                fallbacks.push(Fallback::LocalDataOnly { team: team.to_string() });
            }
        }

        let snapshot = self.compute_team_snapshot(team, game, as_of)?;
        self.cache.put_team_snapshot(&snapshot)?;
        Ok(self.team_form(snapshot, true, degraded, fallbacks))
    }

    fn team_form(
        &self,
        snapshot: TeamStatsSnapshot,
        refreshed: bool,
        degraded: bool,
        mut fallbacks: Vec<Fallback>,
    ) -> TeamForm {
        if snapshot.sample_size == 0 {
            warn!(
                "No resolved matches for {}, form set to neutral {}",
                snapshot.team_id, snapshot.form_score
            );
            fallbacks.push(Fallback::NeutralForm {
                team: snapshot.team_id.clone(),
            });
        }
        TeamForm {
            snapshot,
            refreshed,
            degraded,
            fallbacks,
        }
    }

    fn compute_team_snapshot(
        &self,
        team: &str,
        game: GameTitle,
        as_of: DateTime<Utc>,
    ) -> anyhow::Result<TeamStatsSnapshot> {
        let results = self.records.results_for(team, game, as_of, self.config.form_window)?;
        let (score, sample_size) = match form_score(team, &results, self.config.form_window) {
            Ok(stats) => (stats.score, stats.considered),
            Err(e) => {
                debug!("{}", e);
                (self.config.form_neutral, 0)
            }
        };

        Ok(TeamStatsSnapshot {
            team_id: team.to_string(),
            game,
            computed_at: as_of,
            form_score: score,
            sample_size,
            source_watermark: self.records.newest_record_at(team, game, as_of)?,
        })
    }

    fn refresh_h2h(
        &self,
        team_a: &str,
        team_b: &str,
        game: GameTitle,
        as_of: DateTime<Utc>,
    ) -> anyhow::Result<H2HStatsSnapshot> {
        let snapshot = self.cache.h2h_snapshot(team_a, team_b, game)?;
        let newest = self.pair_watermark(team_a, team_b, game, as_of)?;
        if let Some(snapshot) = snapshot {
            if !is_stale(Some(snapshot.computed_at), newest, self.config.max_age(), as_of) {
                return Ok(snapshot);
            }
        }

        let meetings = self.records.records_between(team_a, team_b, game, as_of)?;
        let stats = h2h_score(team_a, team_b, &meetings).unwrap_or(H2hStats { wins: 0, total: 0 });
        let snapshot = H2HStatsSnapshot {
            team_id: team_a.to_string(),
            opponent_id: team_b.to_string(),
            game,
            wins: stats.wins,
            total: stats.total,
            computed_at: as_of,
        };
        self.cache.put_h2h_snapshot(&snapshot)?;
        Ok(snapshot)
    }

    fn pair_watermark(
        &self,
        team_a: &str,
        team_b: &str,
        game: GameTitle,
        as_of: DateTime<Utc>,
    ) -> anyhow::Result<Option<DateTime<Utc>>> {
        let a = self.records.newest_record_at(team_a, game, as_of)?;
        let b = self.records.newest_record_at(team_b, game, as_of)?;
        Ok(a.max(b))
    }

    async fn fetch_history(
        &self,
        team: &str,
        game: GameTitle,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<MatchRecord>, FetchError> {
        let limit = self.config.fetch_timeout();
        tokio::time::timeout(limit, self.source.fetch_history(team, game, since))
            .await
            .unwrap_or(Err(FetchError::Timeout(limit)))
    }

    async fn fetch_upcoming(&self, game: GameTitle) -> Result<Vec<UpcomingMatch>, FetchError> {
        let limit = self.config.fetch_timeout();
        tokio::time::timeout(limit, self.source.fetch_upcoming(game))
            .await
            .unwrap_or(Err(FetchError::Timeout(limit)))
    }
}

fn validate_request(match_id: &str, team_a: &str, team_b: &str) -> Result<(), PredictError> {
    if match_id.trim().is_empty() {
        return Err(PredictError::InvalidRequest("empty match identifier".to_string()));
    }
    if team_a.trim().is_empty() || team_b.trim().is_empty() {
        return Err(PredictError::InvalidRequest("empty team identifier".to_string()));
    }
    if team_a == team_b {
        return Err(PredictError::InvalidRequest(format!(
            "team {} cannot play itself",
            team_a
        )));
    }
    Ok(())
}

/// Weighted score per team. H2H is team A's win rate, so team B gets its complement.
pub fn blend(
    weights: &FactorWeights,
    form_a: f64,
    form_b: f64,
    h2h: f64,
    fatigue_a: f64,
    fatigue_b: f64,
) -> (f64, f64) {
    let score_a = weights.form * form_a + weights.h2h * h2h + weights.fatigue * fatigue_a;
    let score_b = weights.form * form_b + weights.h2h * (1.0 - h2h) + weights.fatigue * fatigue_b;
    (score_a, score_b)
}

/// Higher score wins. A tie goes to the lexicographically smaller team id,
/// so the same inputs always name the same winner.
pub fn pick_winner<'a>(team_a: &'a str, team_b: &'a str, score_a: f64, score_b: f64) -> &'a str {
    if (score_a - score_b).abs() <= TIE_TOLERANCE {
        team_a.min(team_b)
    } else if score_a > score_b {
        team_a
    } else {
        team_b
    }
}

/// Winner's share of the combined score, as a percentage rounded to one decimal
pub fn confidence(score_a: f64, score_b: f64) -> f64 {
    let total = score_a + score_b;
    if total <= 0.0 {
        return 50.0;
    }
    let pct = 100.0 * score_a.max(score_b) / total;
    (pct * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-process stand-in for the remote source
    #[derive(Default)]
    struct FakeSource {
        history: Mutex<HashMap<String, Vec<MatchRecord>>>,
        upcoming: Mutex<Vec<UpcomingMatch>>,
        down: AtomicBool,
        delay_ms: AtomicU64,
        history_calls: AtomicUsize,
    }

    impl FakeSource {
        fn with_history(records: Vec<MatchRecord>) -> Self {
            let source = FakeSource::default();
            {
                let mut history = source.history.lock().unwrap();
                for r in records {
                    history.entry(r.team_a.clone()).or_default().push(r.clone());
                    history.entry(r.team_b.clone()).or_default().push(r);
                }
            }
            source
        }

        fn calls(&self) -> usize {
            self.history_calls.load(Ordering::SeqCst)
        }
    }

    impl MatchSource for FakeSource {
        async fn fetch_history(
            &self,
            team: &str,
            _game: GameTitle,
            since: Option<DateTime<Utc>>,
        ) -> Result<Vec<MatchRecord>, FetchError> {
            self.history_calls.fetch_add(1, Ordering::SeqCst);
            let delay = self.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }
            if self.down.load(Ordering::SeqCst) {
                return Err(FetchError::Status(503));
            }
            let history = self.history.lock().unwrap();
            Ok(history
                .get(team)
                .map(|records| {
                    records
                        .iter()
                        .filter(|r| since.map_or(true, |s| r.played_at > s))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        }

        async fn fetch_upcoming(&self, _game: GameTitle) -> Result<Vec<UpcomingMatch>, FetchError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(FetchError::Status(503));
            }
            Ok(self.upcoming.lock().unwrap().clone())
        }
    }

    fn as_of() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 8, 20, 12, 0, 0).unwrap()
    }

    fn played(id: &str, a: &str, b: &str, winner: &str, days_ago: i64) -> MatchRecord {
        MatchRecord {
            match_id: id.to_string(),
            game: GameTitle::Csgo,
            team_a: a.to_string(),
            team_b: b.to_string(),
            winner: Some(winner.to_string()),
            played_at: as_of() - Duration::days(days_ago),
            metadata: BTreeMap::new(),
        }
    }

    fn engine(source: FakeSource) -> PredictionEngine<FakeSource> {
        let db = Arc::new(Database::open_in_memory().unwrap());
        PredictionEngine::new(PredictionConfig::default(), source, db).unwrap()
    }

    /// alpha: 3 wins in 4, last played 2 days ago.
    /// bravo: 1 win in 3, last played 10 days ago. They met twice, 1-1.
    fn scenario() -> Vec<MatchRecord> {
        vec![
            played("1", "alpha", "bravo", "alpha", 12),
            played("2", "bravo", "alpha", "bravo", 10),
            played("3", "alpha", "charlie", "alpha", 6),
            played("4", "alpha", "delta", "alpha", 2),
            played("5", "bravo", "echo", "echo", 15),
        ]
    }

    #[test]
    fn test_blend_follows_weighted_formula() {
        // form 0.6 / 0.8, h2h 0.45 for A, fatigue 0.8 / 1.0
        let (a, b) = blend(&FactorWeights::default(), 0.60, 0.80, 0.45, 0.80, 1.0);
        assert!((a - 0.615).abs() < 1e-9);
        assert!((b - 0.785).abs() < 1e-9);
        assert_eq!(pick_winner("teama", "teamb", a, b), "teamb");
        assert_eq!(confidence(a, b), 56.1);
    }

    #[test]
    fn test_confidence_bounds() {
        assert_eq!(confidence(0.5, 0.5), 50.0);
        assert_eq!(confidence(0.0, 0.0), 50.0);
        assert_eq!(confidence(0.0, 0.7), 100.0);
        for (a, b) in [(0.51, 0.5), (0.9, 0.1), (0.3, 0.31)] {
            let c = confidence(a, b);
            assert!(c > 50.0 && c <= 100.0, "confidence {} for {} / {}", c, a, b);
        }
    }

    #[test]
    fn test_tie_break_is_lexicographic() {
        for _ in 0..10 {
            assert_eq!(pick_winner("zeta", "alpha", 0.5, 0.5), "alpha");
            assert_eq!(pick_winner("alpha", "zeta", 0.5, 0.5 + 1e-12), "alpha");
        }
        assert_eq!(pick_winner("zeta", "alpha", 0.6, 0.5), "zeta");
    }

    #[test]
    fn test_rejects_invalid_configuration() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let mut config = PredictionConfig::default();
        config.weights.form = 0.9;
        assert!(PredictionEngine::new(config, FakeSource::default(), db).is_err());
    }

    #[tokio::test]
    async fn test_predict_end_to_end() {
        let engine = engine(FakeSource::with_history(scenario()));
        let prediction = engine
            .predict("m100", "alpha", "bravo", GameTitle::Csgo, Some(as_of()))
            .await
            .unwrap();

        let b = &prediction.breakdown;
        assert!((b.form_a - 0.75).abs() < 1e-12);
        assert!((b.form_b - 1.0 / 3.0).abs() < 1e-12);
        assert!((b.h2h - 0.5).abs() < 1e-12);
        assert!((b.fatigue_a - 2.0 / 7.0).abs() < 1e-12);
        assert_eq!(b.fatigue_b, 1.0);
        assert!((b.fatigue_delta - (2.0 / 7.0 - 1.0)).abs() < 1e-12);

        let (score_a, score_b) = blend(&FactorWeights::default(), 0.75, 1.0 / 3.0, 0.5, 2.0 / 7.0, 1.0);
        assert_eq!(prediction.predicted_winner, pick_winner("alpha", "bravo", score_a, score_b));
        assert_eq!(prediction.confidence, confidence(score_a, score_b));
        assert!(!prediction.degraded);
        assert!(prediction.fallbacks.is_empty());
        assert_eq!(prediction.computed_at, as_of());

        // Inputs were persisted
        assert_eq!(engine.records().count_for("alpha", GameTitle::Csgo).unwrap(), 4);
        let snapshot = engine.cache().team_snapshot("alpha", GameTitle::Csgo).unwrap().unwrap();
        assert_eq!(snapshot.sample_size, 4);
        assert_eq!(snapshot.source_watermark, Some(as_of() - Duration::days(2)));
        let h2h = engine
            .cache()
            .h2h_snapshot("alpha", "bravo", GameTitle::Csgo)
            .unwrap()
            .unwrap();
        assert_eq!((h2h.wins, h2h.total), (1, 2));
    }

    #[tokio::test]
    async fn test_predict_is_idempotent() {
        let engine = engine(FakeSource::with_history(scenario()));
        let first = engine
            .predict("m100", "alpha", "bravo", GameTitle::Csgo, Some(as_of()))
            .await
            .unwrap();
        let calls = engine.source.calls();

        let second = engine
            .predict("m100", "alpha", "bravo", GameTitle::Csgo, Some(as_of()))
            .await
            .unwrap();

        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
        assert_eq!(engine.source.calls(), calls);
    }

    #[tokio::test]
    async fn test_recompute_is_deterministic() {
        let a = engine(FakeSource::with_history(scenario()));
        let b = engine(FakeSource::with_history(scenario()));
        let first = a.predict("m1", "alpha", "bravo", GameTitle::Csgo, Some(as_of())).await.unwrap();
        let second = b.predict("m1", "alpha", "bravo", GameTitle::Csgo, Some(as_of())).await.unwrap();
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
    }

    #[tokio::test]
    async fn test_cold_start_uses_neutral_values() {
        let engine = engine(FakeSource::default());
        let prediction = engine
            .predict("m7", "rookies", "newcomers", GameTitle::Csgo, Some(as_of()))
            .await
            .unwrap();

        let b = &prediction.breakdown;
        assert_eq!((b.form_a, b.form_b), (0.5, 0.5));
        assert_eq!(b.h2h, 0.5);
        assert_eq!((b.fatigue_a, b.fatigue_b), (1.0, 1.0));
        assert_eq!(prediction.confidence, 50.0);
        assert_eq!(prediction.predicted_winner, "newcomers");
        assert!(!prediction.degraded);
        assert!(prediction.fallbacks.contains(&Fallback::NeutralH2h));
        assert!(prediction
            .fallbacks
            .contains(&Fallback::NeutralForm { team: "rookies".to_string() }));
    }

    #[tokio::test]
    async fn test_cold_start_with_source_down_fails() {
        let source = FakeSource::default();
        source.down.store(true, Ordering::SeqCst);
        let engine = engine(source);

        let err = engine
            .predict("m7", "rookies", "newcomers", GameTitle::Csgo, Some(as_of()))
            .await
            .unwrap_err();
        assert!(matches!(err, PredictError::DataUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_snapshot_staleness_window() {
        let engine = engine(FakeSource::with_history(scenario()));
        engine
            .predict("m1", "alpha", "bravo", GameTitle::Csgo, Some(as_of()))
            .await
            .unwrap();
        let calls = engine.source.calls();

        // T+5h: cached prediction still fresh, nothing refetched
        engine
            .predict("m1", "alpha", "bravo", GameTitle::Csgo, Some(as_of() + Duration::hours(5)))
            .await
            .unwrap();
        assert_eq!(engine.source.calls(), calls);

        // T+7h: both team snapshots expired and get refetched
        let later = engine
            .predict("m1", "alpha", "bravo", GameTitle::Csgo, Some(as_of() + Duration::hours(7)))
            .await
            .unwrap();
        assert_eq!(engine.source.calls(), calls + 2);
        assert_eq!(later.computed_at, as_of() + Duration::hours(7));
        assert_eq!(engine.cache().prediction_history("m1").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_new_local_data_invalidates_cache() {
        let engine = engine(FakeSource::with_history(scenario()));
        let first = engine
            .predict("m1", "alpha", "bravo", GameTitle::Csgo, Some(as_of()))
            .await
            .unwrap();

        // A scheduled ingest lands a fresh bravo win one hour later
        let fresh = MatchRecord {
            played_at: as_of() + Duration::minutes(30),
            ..played("6", "bravo", "foxtrot", "bravo", 0)
        };
        engine.records().ingest(vec![fresh], as_of() + Duration::hours(1)).unwrap();

        let second = engine
            .predict("m1", "alpha", "bravo", GameTitle::Csgo, Some(as_of() + Duration::hours(1)))
            .await
            .unwrap();
        assert!(second.breakdown.form_b > first.breakdown.form_b);
        assert_eq!(second.breakdown.fatigue_b, 0.0);
    }

    #[tokio::test]
    async fn test_source_down_uses_stale_snapshot() {
        let engine = engine(FakeSource::with_history(scenario()));
        let first = engine
            .predict("m1", "alpha", "bravo", GameTitle::Csgo, Some(as_of()))
            .await
            .unwrap();

        engine.source.down.store(true, Ordering::SeqCst);
        let later = engine
            .predict("m1", "alpha", "bravo", GameTitle::Csgo, Some(as_of() + Duration::hours(8)))
            .await
            .unwrap();

        assert!(later.degraded);
        assert_eq!(later.breakdown.form_a, first.breakdown.form_a);
        assert!(later
            .fallbacks
            .contains(&Fallback::StaleSnapshot { team: "alpha".to_string() }));
    }

    #[tokio::test]
    async fn test_source_down_recomputes_from_local_records() {
        let source = FakeSource::default();
        source.down.store(true, Ordering::SeqCst);
        let engine = engine(source);
        engine.records().ingest(scenario(), as_of()).unwrap();

        let prediction = engine
            .predict("m1", "alpha", "bravo", GameTitle::Csgo, Some(as_of()))
            .await
            .unwrap();

        assert!(prediction.degraded);
        assert!((prediction.breakdown.form_a - 0.75).abs() < 1e-12);
        assert!(prediction
            .fallbacks
            .contains(&Fallback::LocalDataOnly { team: "bravo".to_string() }));
    }

    #[tokio::test]
    async fn test_form_window_counts_resolved_matches_only() {
        // Ten recent matches without a result push nothing out of the window
        let mut history: Vec<MatchRecord> = (0..10)
            .map(|i| MatchRecord {
                winner: None,
                ..played(&format!("open{i}"), "alpha", "golf", "alpha", i + 1)
            })
            .collect();
        history.extend((0..5).map(|i| played(&format!("won{i}"), "alpha", "hotel", "alpha", i + 20)));
        let engine = engine(FakeSource::with_history(history));

        let prediction = engine
            .predict("m1", "alpha", "bravo", GameTitle::Csgo, Some(as_of()))
            .await
            .unwrap();

        assert_eq!(prediction.breakdown.form_a, 1.0);
        assert!(!prediction
            .fallbacks
            .contains(&Fallback::NeutralForm { team: "alpha".to_string() }));
        let snapshot = engine.cache().team_snapshot("alpha", GameTitle::Csgo).unwrap().unwrap();
        assert_eq!(snapshot.sample_size, 5);
        // Watermark and fatigue still follow the newest match, resolved or not
        assert_eq!(snapshot.source_watermark, Some(as_of() - Duration::days(1)));
        assert!((prediction.breakdown.fatigue_a - 1.0 / 7.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_slow_source_times_out_to_local_records() {
        let source = FakeSource::with_history(scenario());
        source.delay_ms.store(3_000, Ordering::SeqCst);
        let db = Arc::new(Database::open_in_memory().unwrap());
        let config = PredictionConfig {
            fetch_timeout_secs: 1,
            ..PredictionConfig::default()
        };
        let engine = PredictionEngine::new(config, source, db).unwrap();
        engine.records().ingest(scenario(), as_of()).unwrap();

        let started = std::time::Instant::now();
        let prediction = engine
            .predict("m1", "alpha", "bravo", GameTitle::Csgo, Some(as_of()))
            .await
            .unwrap();

        assert!(started.elapsed() < std::time::Duration::from_millis(2_500));
        assert!(prediction.degraded);
        assert!((prediction.breakdown.form_a - 0.75).abs() < 1e-12);
        for team in ["alpha", "bravo"] {
            assert!(prediction
                .fallbacks
                .contains(&Fallback::LocalDataOnly { team: team.to_string() }));
        }

        // Nothing stored and nothing arriving in time: the team is unavailable
        let err = engine
            .predict("m2", "ghost", "alpha", GameTitle::Csgo, Some(as_of()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PredictError::DataUnavailable { source: FetchError::Timeout(_), .. }
        ));
    }

    #[tokio::test]
    async fn test_rejects_self_match() {
        let engine = engine(FakeSource::default());
        let err = engine
            .predict("m1", "alpha", "alpha", GameTitle::Csgo, Some(as_of()))
            .await
            .unwrap_err();
        assert!(matches!(err, PredictError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_predict_upcoming_streams_each_fixture() {
        let source = FakeSource::with_history(scenario());
        *source.upcoming.lock().unwrap() = vec![
            UpcomingMatch {
                match_id: "u1".to_string(),
                game: GameTitle::Csgo,
                team_a: "alpha".to_string(),
                team_b: "bravo".to_string(),
                scheduled_at: as_of() + Duration::days(1),
            },
            UpcomingMatch {
                match_id: "u2".to_string(),
                game: GameTitle::Csgo,
                team_a: "charlie".to_string(),
                team_b: "delta".to_string(),
                scheduled_at: as_of() + Duration::days(2),
            },
        ];
        let engine = engine(source);

        let predictions: Vec<_> = engine.predict_upcoming(GameTitle::Csgo).collect().await;
        assert_eq!(predictions.len(), 2);
        assert!(predictions.iter().all(|p| p.is_ok()));

        // Nothing is computed until the stream is polled
        let stream = engine.predict_upcoming(GameTitle::Csgo);
        let calls = engine.source.calls();
        drop(stream);
        assert_eq!(engine.source.calls(), calls);
    }

    #[tokio::test]
    async fn test_predict_upcoming_reports_fetch_failure() {
        let source = FakeSource::default();
        source.down.store(true, Ordering::SeqCst);
        let engine = engine(source);

        let items: Vec<_> = engine.predict_upcoming(GameTitle::Dota2).collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(PredictError::Upcoming(_))));
    }

    #[tokio::test]
    async fn test_sync_teams_counts_outcomes() {
        let engine = engine(FakeSource::with_history(scenario()));
        let teams = vec!["alpha".to_string(), "bravo".to_string()];

        let first = engine.sync_teams(&teams, GameTitle::Csgo, false).await;
        assert_eq!(first.refreshed, 2);

        let second = engine.sync_teams(&teams, GameTitle::Csgo, false).await;
        assert_eq!(second.up_to_date, 2);

        let forced = engine.sync_teams(&teams, GameTitle::Csgo, true).await;
        assert_eq!(forced.refreshed, 2);

        engine.source.down.store(true, Ordering::SeqCst);
        let unknown = vec!["ghost".to_string()];
        let failed = engine.sync_teams(&unknown, GameTitle::Csgo, false).await;
        assert_eq!(failed.failed.len(), 1);
    }
}
