pub mod pandascore;
pub mod source;
pub mod types;
