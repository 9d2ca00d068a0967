//! Esports match prediction: recent form, head-to-head and fatigue blended
//! into a winner pick with a confidence percentage, backed by a SQLite cache
//! of match history and derived snapshots.

pub mod config;
pub mod data;
pub mod error;
pub mod monitoring;
pub mod prediction;
pub mod store;

pub use data::types::{GameTitle, MatchRecord, TeamInfo, UpcomingMatch};
pub use error::{ConfigurationError, FetchError, InsufficientDataError, PredictError, ValidationError};
pub use prediction::engine::PredictionEngine;
pub use prediction::types::MatchPrediction;
