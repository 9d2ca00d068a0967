use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use crate::prediction::types::MatchPrediction;

const HEADER: &str = "computed_at,match_id,game,team_a,team_b,predicted_winner,confidence,form_a,form_b,h2h,fatigue_a,fatigue_b,degraded,fallbacks";

/// Append-only CSV log of every prediction handed to a caller
pub struct CsvLogger {
    log_path: String,
}

impl CsvLogger {
    pub fn new(log_path: String) -> Result<Self> {
        // Create CSV file with headers if it doesn't exist
        if !Path::new(&log_path).exists() {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .open(&log_path)
                .with_context(|| format!("Failed to create prediction log: {}", log_path))?;

            writeln!(file, "{}", HEADER)?;
        }

        Ok(Self { log_path })
    }

    pub fn log_prediction(&self, prediction: &MatchPrediction) -> Result<()> {
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.log_path)?;

        let fallbacks = prediction
            .fallbacks
            .iter()
            .map(|f| serde_json::to_string(f).map(|s| s.replace(',', ";").replace('"', "")))
            .collect::<Result<Vec<_>, _>>()?
            .join("|");

        let b = &prediction.breakdown;
        writeln!(
            file,
            "{},{},{},{},{},{},{:.1},{:.3},{:.3},{:.3},{:.3},{:.3},{},{}",
            prediction.computed_at.to_rfc3339(),
            prediction.match_id,
            prediction.game,
            prediction.team_a,
            prediction.team_b,
            prediction.predicted_winner,
            prediction.confidence,
            b.form_a,
            b.form_b,
            b.h2h,
            b.fatigue_a,
            b.fatigue_b,
            prediction.degraded,
            fallbacks
        )?;

        Ok(())
    }
}
