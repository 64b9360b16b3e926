pub mod accounting;
pub mod clock;
pub mod config;
pub mod ingest;
pub mod sink;
pub mod telemetry;
