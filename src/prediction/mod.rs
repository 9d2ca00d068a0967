pub mod aggregators;
pub mod engine;
pub mod freshness;
pub mod types;
