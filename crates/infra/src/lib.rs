//! Infrastructure layer: job persistence, workers, configuration, audit.

pub mod audit;
pub mod config;
pub mod jobs;
pub mod uploads;
