use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use reqwest::header::ACCEPT;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};
use crate::config::SourceConfig;
use crate::data::source::MatchSource;
use crate::data::types::{
    GameTitle, MatchRecord, UpcomingMatch, TEAM_A_NAME, TEAM_A_SLUG, TEAM_B_NAME, TEAM_B_SLUG,
};
use crate::error::FetchError;

const RATE_LIMIT_RESET_HEADER: &str = "X-Rate-Limit-Reset";
const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

pub struct PandaScoreClient {
    client: Client,
    api_key: String,
    config: SourceConfig,
}

#[derive(Debug, Deserialize)]
struct PandaScoreMatch {
    id: u64,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    begin_at: Option<String>,
    #[serde(default)]
    scheduled_at: Option<String>,
    #[serde(default)]
    winner_id: Option<u64>,
    #[serde(default)]
    winner: Option<PandaScoreTeam>,
    #[serde(default)]
    forfeit: bool,
    #[serde(default)]
    opponents: Vec<PandaScoreOpponent>,
    #[serde(default)]
    league: Option<PandaScoreNamed>,
    #[serde(default)]
    tournament: Option<PandaScoreNamed>,
}

#[derive(Debug, Deserialize)]
struct PandaScoreOpponent {
    #[serde(default)]
    opponent: Option<PandaScoreTeam>,
}

#[derive(Debug, Deserialize)]
struct PandaScoreTeam {
    id: u64,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    slug: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PandaScoreNamed {
    #[serde(default)]
    name: Option<String>,
}

impl PandaScoreClient {
    pub fn new(api_key: String, config: SourceConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent("EsportsPredictor/1.0")
            .build()?;

        Ok(Self {
            client,
            api_key,
            config,
        })
    }

    /// GET with retry: transport errors, 429 and 5xx are retried with
    /// exponential backoff, anything else fails immediately.
    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<T, FetchError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = self.client
                .get(url)
                .bearer_auth(&self.api_key)
                .header(ACCEPT, "application/json")
                .query(query)
                .send()
                .await;

            let wait = match result {
                Ok(response) if response.status().is_success() => {
                    let body = response.text().await?;
                    return serde_json::from_str(&body)
                        .map_err(|e| FetchError::Decode(e.to_string()));
                }
                Ok(response) if response.status() == StatusCode::TOO_MANY_REQUESTS => {
                    if attempt >= max_attempts {
                        return Err(FetchError::RateLimited(attempt));
                    }
                    response
                        .headers()
                        .get(RATE_LIMIT_RESET_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.trim().parse::<u64>().ok())
                        .map(|secs| Duration::from_secs(secs).min(MAX_RATE_LIMIT_WAIT))
                }
                Ok(response) if response.status().is_server_error() => {
                    if attempt >= max_attempts {
                        return Err(FetchError::Status(response.status().as_u16()));
                    }
                    None
                }
                Ok(response) => return Err(FetchError::Status(response.status().as_u16())),
                Err(e) => {
                    if !is_transient(&e) || attempt >= max_attempts {
                        return Err(e.into());
                    }
                    None
                }
            };

            let delay = wait.unwrap_or_else(|| self.backoff_delay(attempt));
            warn!(
                "Request to {} failed (attempt {}/{}), retrying in {:?}",
                url, attempt, max_attempts, delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// base * multiplier^(attempt-1), plus up to 25% jitter
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let base = self.config.backoff_base_ms as f64 * self.config.backoff_multiplier.powi(exponent);
        let jitter = rand::thread_rng().gen_range(0.0..=0.25) * base;
        Duration::from_millis((base + jitter) as u64)
    }
}

impl MatchSource for PandaScoreClient {
    async fn fetch_history(
        &self,
        team: &str,
        game: GameTitle,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<MatchRecord>, FetchError> {
        let url = format!("{}/{}/matches/past", self.config.base_url, game.as_str());
        let mut query = vec![
            ("filter[opponent_id]".to_string(), team.to_string()),
            ("sort".to_string(), "-begin_at".to_string()),
            ("page[size]".to_string(), self.config.page_size.to_string()),
        ];
        if let Some(since) = since {
            query.push((
                "range[begin_at]".to_string(),
                format!(
                    "{},{}",
                    since.to_rfc3339_opts(SecondsFormat::Secs, true),
                    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
                ),
            ));
        }

        let raw: Vec<PandaScoreMatch> = collect_pages(
            self.config.page_size,
            self.config.max_pages,
            |page| {
                let mut query = query.clone();
                query.push(("page[number]".to_string(), page.to_string()));
                let url = &url;
                async move { self.get_json::<Vec<PandaScoreMatch>>(url, &query).await }
            },
        )
        .await?;
        let total = raw.len();
        let records: Vec<MatchRecord> = raw
            .into_iter()
            .filter_map(|pm| convert_history_match(pm, game))
            .collect();

        debug!(
            "Fetched {} {} matches for team {} ({} usable)",
            total, game, team, records.len()
        );
        Ok(records)
    }

    async fn fetch_upcoming(&self, game: GameTitle) -> Result<Vec<UpcomingMatch>, FetchError> {
        let url = format!("{}/{}/matches/upcoming", self.config.base_url, game.as_str());
        let query = vec![
            ("sort".to_string(), "begin_at".to_string()),
            ("page[size]".to_string(), self.config.page_size.to_string()),
        ];

        let raw: Vec<PandaScoreMatch> = collect_pages(
            self.config.page_size,
            self.config.max_pages,
            |page| {
                let mut query = query.clone();
                query.push(("page[number]".to_string(), page.to_string()));
                let url = &url;
                async move { self.get_json::<Vec<PandaScoreMatch>>(url, &query).await }
            },
        )
        .await?;
        Ok(raw
            .into_iter()
            .filter_map(|pm| convert_upcoming_match(pm, game))
            .collect())
    }
}

/// Only a timed-out or refused connection is worth another attempt
fn is_transient(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect()
}

/// Request pages 1, 2, ... until one comes back shorter than `page_size`,
/// stopping after `max_pages`
async fn collect_pages<T, F, Fut>(
    page_size: u32,
    max_pages: u32,
    mut fetch_page: F,
) -> Result<Vec<T>, FetchError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Vec<T>, FetchError>>,
{
    let mut items = Vec::new();
    for page in 1..=max_pages.max(1) {
        let batch = fetch_page(page).await?;
        let short = batch.len() < page_size as usize;
        items.extend(batch);
        if short {
            return Ok(items);
        }
    }
    warn!("Stopped paging after {} pages of {}", max_pages, page_size);
    Ok(items)
}

fn parse_timestamp(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn opponents(pm: &PandaScoreMatch) -> Option<(&PandaScoreTeam, &PandaScoreTeam)> {
    let mut teams = pm.opponents.iter().filter_map(|o| o.opponent.as_ref());
    match (teams.next(), teams.next()) {
        (Some(a), Some(b)) => Some((a, b)),
        _ => None,
    }
}

/// Normalise a finished match. Drops matches without a start time or two opponents.
fn convert_history_match(pm: PandaScoreMatch, game: GameTitle) -> Option<MatchRecord> {
    let match_id = pm.id.to_string();

    let Some(played_at) = parse_timestamp(pm.begin_at.as_deref()) else {
        warn!("Skipping match {}: missing or invalid begin_at", match_id);
        return None;
    };
    let Some((a, b)) = opponents(&pm) else {
        warn!("Skipping match {}: fewer than two opponents", match_id);
        return None;
    };
    let (team_a, team_b) = (a.id.to_string(), b.id.to_string());

    let mut metadata = BTreeMap::new();
    for (team, name_key, slug_key) in [(a, TEAM_A_NAME, TEAM_A_SLUG), (b, TEAM_B_NAME, TEAM_B_SLUG)] {
        if let Some(name) = &team.name {
            metadata.insert(name_key.to_string(), name.clone());
        }
        if let Some(slug) = &team.slug {
            metadata.insert(slug_key.to_string(), slug.clone());
        }
    }

    let winner = pm
        .winner_id
        .or_else(|| pm.winner.as_ref().map(|w| w.id))
        .map(|id| id.to_string());

    if let Some(name) = pm.name {
        metadata.insert("name".to_string(), name);
    }
    if let Some(status) = pm.status {
        metadata.insert("status".to_string(), status);
    }
    if let Some(league) = pm.league.and_then(|l| l.name) {
        metadata.insert("league".to_string(), league);
    }
    if let Some(tournament) = pm.tournament.and_then(|t| t.name) {
        metadata.insert("tournament".to_string(), tournament);
    }
    if pm.forfeit {
        metadata.insert("forfeit".to_string(), "true".to_string());
    }

    Some(MatchRecord {
        match_id,
        game,
        team_a,
        team_b,
        winner,
        played_at,
        metadata,
    })
}

fn convert_upcoming_match(pm: PandaScoreMatch, game: GameTitle) -> Option<UpcomingMatch> {
    let match_id = pm.id.to_string();

    let scheduled_at = parse_timestamp(pm.scheduled_at.as_deref())
        .or_else(|| parse_timestamp(pm.begin_at.as_deref()));
    let Some(scheduled_at) = scheduled_at else {
        warn!("Skipping upcoming match {}: no schedule", match_id);
        return None;
    };
    // Opponents are often still TBD for bracket matches
    let (team_a, team_b) = opponents(&pm).map(|(a, b)| (a.id.to_string(), b.id.to_string()))?;

    Some(UpcomingMatch {
        match_id,
        game,
        team_a,
        team_b,
        scheduled_at,
    })
}
