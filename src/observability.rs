//! Shared logging configuration and initialization.

use std::env;

use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::engine::{EngineConfig, RunOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub fn logging_config_from_env() -> LoggingConfig {
    let mut config = LoggingConfig::default();

    if let Ok(level) = env::var("RETAIL_LOG_LEVEL") {
        let trimmed = level.trim();
        if !trimmed.is_empty() {
            config.level = trimmed.to_string();
        }
    }

    if let Ok(format) = env::var("RETAIL_LOG_FORMAT") {
        if let Some(parsed) = parse_log_format(&format) {
            config.format = parsed;
        }
    }

    if let Ok(include_target) = env::var("RETAIL_LOG_TARGET") {
        if let Some(parsed) = parse_bool(&include_target) {
            config.include_target = parsed;
        }
    }

    config
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter =
        EnvFilter::try_new(config.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target)
        .with_ansi(matches!(config.format, LogFormat::Pretty));

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }

    Ok(())
}

pub fn log_run_start(logging: &LoggingConfig, engine: &EngineConfig) {
    info!(
        component = "daily_metrics_run",
        event = "run.start",
        log_level = %logging.level,
        log_format = ?logging.format,
        data_root = %engine.data_root.display(),
        metrics_db = %engine.metrics_db_path.display(),
        export_enabled = engine.export_csv_path.is_some(),
        max_retries = engine.retry.max_retries
    );
}

pub fn log_run_outcome(outcome: &RunOutcome) {
    let report = outcome.report();
    match outcome {
        RunOutcome::NoNewData(_) => info!(
            component = "daily_metrics_run",
            event = "run.outcome",
            outcome = outcome.label(),
            partitions_skipped_processed = report.visits.partitions_skipped_processed
                + report.sales.partitions_skipped_processed
        ),
        RunOutcome::Completed(_) => info!(
            component = "daily_metrics_run",
            event = "run.outcome",
            outcome = outcome.label(),
            new_dates = report.new_dates.len(),
            rows_written = report.metric_rows_written,
            rows_inserted = report.merge.rows_inserted,
            rows_replaced = report.merge.rows_replaced,
            table_rows = report.merge.table_rows,
            rows_rejected = report.visits.rows_rejected
                + report.sales.rows_rejected
                + report.products.rows_rejected,
            rows_skipped_processed = report.rows_skipped_processed,
            visits_corrected = report.correction.rows_corrected
        ),
    }
}

fn parse_log_format(raw: &str) -> Option<LogFormat> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" => Some(LogFormat::Pretty),
        _ => None,
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
