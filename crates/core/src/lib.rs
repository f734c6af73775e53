pub mod config;
pub mod correlation;
pub mod models;
