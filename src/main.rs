use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use esports_predictor::config::{Config, EnvConfig};
use esports_predictor::data::pandascore::PandaScoreClient;
use esports_predictor::monitoring::logger::CsvLogger;
use esports_predictor::store::database::Database;
use esports_predictor::store::records::MatchRecordStore;
use esports_predictor::{GameTitle, MatchPrediction, PredictionEngine};

#[derive(Debug, Parser)]
#[command(name = "esports-predictor", about = "Predict esports match winners from form, H2H and fatigue")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Predict a single match
    Predict {
        #[arg(long)]
        match_id: String,
        #[arg(long)]
        team_a: String,
        #[arg(long)]
        team_b: String,
        #[arg(long)]
        game: GameTitle,
        /// Point in time to predict as of (RFC 3339), defaults to now
        #[arg(long)]
        as_of: Option<DateTime<Utc>>,
    },
    /// Predict every upcoming match of a game
    Upcoming {
        #[arg(long)]
        game: GameTitle,
    },
    /// Refresh cached team statistics from the source
    Sync {
        #[arg(long)]
        game: GameTitle,
        #[arg(long = "team", required = true)]
        teams: Vec<String>,
        /// Recompute even if the cached statistics are fresh
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    tracing::info!("Loading configuration from {}", cli.config);
    let config = Config::load(&cli.config)?;
    let env_config = EnvConfig::load()?;

    let database_path = env_config
        .database_path
        .clone()
        .unwrap_or_else(|| config.system.database_path.clone());
    tracing::info!("Opening database: {}", database_path);
    let db = Arc::new(Database::open(&database_path)?);

    let mut source_config = config.source.clone();
    if let Some(base_url) = env_config.pandascore_base_url.clone() {
        source_config.base_url = base_url;
    }
    let client = PandaScoreClient::new(env_config.pandascore_api_key.clone(), source_config)
        .context("Failed to build PandaScore client")?;

    let engine = PredictionEngine::new(config.prediction.clone(), client, db)
        .context("Invalid prediction configuration")?;

    let csv_logger = if config.monitoring.csv_logging {
        Some(CsvLogger::new(config.monitoring.csv_log_path.clone())?)
    } else {
        None
    };

    match cli.command {
        Command::Predict { match_id, team_a, team_b, game, as_of } => {
            let prediction = engine.predict(&match_id, &team_a, &team_b, game, as_of).await?;
            report(&prediction, engine.records(), csv_logger.as_ref())?;
        }
        Command::Upcoming { game } => {
            let mut predictions = Box::pin(engine.predict_upcoming(game));
            let mut failures = 0;
            while let Some(result) = predictions.next().await {
                match result {
                    Ok(prediction) => report(&prediction, engine.records(), csv_logger.as_ref())?,
                    Err(e) => {
                        failures += 1;
                        tracing::warn!("Prediction failed: {}", e);
                    }
                }
            }
            if failures > 0 {
                tracing::warn!("{} upcoming matches could not be predicted", failures);
            }
        }
        Command::Sync { game, teams, force } => {
            let sync = engine.sync_teams(&teams, game, force).await;
            println!(
                "{}: {} refreshed, {} up to date, {} degraded, {} failed",
                game,
                sync.refreshed,
                sync.up_to_date,
                sync.degraded,
                sync.failed.len()
            );
            for (team, reason) in &sync.failed {
                println!("  {}: {}", team, reason);
            }
        }
    }

    Ok(())
}

fn report(
    prediction: &MatchPrediction,
    records: &MatchRecordStore,
    csv_logger: Option<&CsvLogger>,
) -> Result<()> {
    let label = |team_id: &str| team_label(records, team_id, prediction.game);
    let b = &prediction.breakdown;
    println!(
        "[{}] {} vs {} -> {} ({:.1}%){}",
        prediction.match_id,
        label(&prediction.team_a),
        label(&prediction.team_b),
        label(&prediction.predicted_winner),
        prediction.confidence,
        if prediction.degraded { " [degraded data]" } else { "" }
    );
    println!(
        "    form {:.2}/{:.2}  h2h {:.2}  fatigue {:.2}/{:.2}  score {:.3}/{:.3}",
        b.form_a, b.form_b, b.h2h, b.fatigue_a, b.fatigue_b, b.score_a, b.score_b
    );
    for fallback in &prediction.fallbacks {
        println!("    fallback: {:?}", fallback);
    }

    if let Some(logger) = csv_logger {
        logger.log_prediction(prediction)?;
    }
    Ok(())
}

/// Catalogue name for a team, or its id when the name is unknown
fn team_label(records: &MatchRecordStore, team_id: &str, game: GameTitle) -> String {
    match records.team(team_id, game) {
        Ok(Some(team)) => team.name,
        Ok(None) => team_id.to_string(),
        Err(e) => {
            tracing::warn!("Team lookup failed for {}: {}", team_id, e);
            team_id.to_string()
        }
    }
}
