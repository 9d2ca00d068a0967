pub mod cache;
pub mod database;
pub mod records;
