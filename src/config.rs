use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;
use crate::error::ConfigurationError;

const WEIGHT_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub system: SystemConfig,
    #[serde(default)]
    pub prediction: PredictionConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
    pub database_path: String,
}

/// Tunables consumed by the prediction engine. Passed in at construction.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PredictionConfig {
    #[serde(default = "default_form_window")]
    pub form_window: usize,
    #[serde(default = "default_neutral")]
    pub form_neutral: f64,
    #[serde(default = "default_neutral")]
    pub h2h_neutral: f64,
    #[serde(default = "default_rest_cap_days")]
    pub fatigue_rest_cap_days: f64,
    #[serde(default = "default_max_age_hours")]
    pub snapshot_max_age_hours: f64,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default)]
    pub weights: FactorWeights,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct FactorWeights {
    pub form: f64,
    pub h2h: f64,
    pub fatigue: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Upper bound on pages pulled per history fetch
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default)]
    pub csv_logging: bool,
    #[serde(default = "default_csv_log_path")]
    pub csv_log_path: String,
}

fn default_form_window() -> usize { 10 }
fn default_neutral() -> f64 { 0.5 }
fn default_rest_cap_days() -> f64 { 7.0 }
fn default_max_age_hours() -> f64 { 6.0 }
fn default_fetch_timeout_secs() -> u64 { 20 }
fn default_base_url() -> String { "https://api.pandascore.co".to_string() }
fn default_page_size() -> u32 { 100 }
fn default_max_pages() -> u32 { 20 }
fn default_max_attempts() -> u32 { 3 }
fn default_backoff_base_ms() -> u64 { 1000 }
fn default_backoff_multiplier() -> f64 { 1.5 }
fn default_request_timeout_secs() -> u64 { 15 }
fn default_csv_log_path() -> String { "predictions.csv".to_string() }

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            form_window: default_form_window(),
            form_neutral: default_neutral(),
            h2h_neutral: default_neutral(),
            fatigue_rest_cap_days: default_rest_cap_days(),
            snapshot_max_age_hours: default_max_age_hours(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            weights: FactorWeights::default(),
        }
    }
}

impl Default for FactorWeights {
    fn default() -> Self {
        Self {
            form: 0.40,
            h2h: 0.30,
            fatigue: 0.30,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            page_size: default_page_size(),
            max_pages: default_max_pages(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            csv_logging: false,
            csv_log_path: default_csv_log_path(),
        }
    }
}

impl PredictionConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let weights = [
            ("form", self.weights.form),
            ("h2h", self.weights.h2h),
            ("fatigue", self.weights.fatigue),
        ];
        for (name, w) in weights {
            if !w.is_finite() || w < 0.0 {
                return Err(ConfigurationError::InvalidWeight(name, w));
            }
        }
        let sum = self.weights.form + self.weights.h2h + self.weights.fatigue;
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(ConfigurationError::WeightsDoNotSumToOne(sum));
        }

        if self.form_window == 0 {
            return Err(ConfigurationError::NotPositive("form_window"));
        }
        if !(self.fatigue_rest_cap_days > 0.0) {
            return Err(ConfigurationError::NotPositive("fatigue_rest_cap_days"));
        }
        if !(self.snapshot_max_age_hours > 0.0) {
            return Err(ConfigurationError::NotPositive("snapshot_max_age_hours"));
        }
        if self.fetch_timeout_secs == 0 {
            return Err(ConfigurationError::NotPositive("fetch_timeout_secs"));
        }

        for (name, v) in [("form_neutral", self.form_neutral), ("h2h_neutral", self.h2h_neutral)] {
            if !(0.0..=1.0).contains(&v) {
                return Err(ConfigurationError::OutOfUnitRange(name, v));
            }
        }
        Ok(())
    }

    pub fn max_age(&self) -> chrono::Duration {
        chrono::Duration::milliseconds((self.snapshot_max_age_hours * 3_600_000.0) as i64)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub pandascore_api_key: String,
    pub pandascore_base_url: Option<String>,
    pub database_path: Option<String>,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {}", path))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.prediction.validate()?;
        Ok(config)
    }
}

impl EnvConfig {
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        Ok(Self {
            pandascore_api_key: std::env::var("PANDASCORE_API_KEY")
                .context("PANDASCORE_API_KEY not set")?
                .trim()
                .to_string(),
            pandascore_base_url: std::env::var("PANDASCORE_BASE_URL").ok(),
            database_path: std::env::var("DATABASE_PATH").ok(),
        })
    }
}
