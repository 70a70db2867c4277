//! Incremental daily per-store retail metrics.
//!
//! New visit and sale partitions are read, visitor counts are repaired,
//! everything is aggregated per (date, store), windowed against earlier
//! same-weekday days, turned into KPIs, and merged into a durable table.

mod aggregate;
mod anomaly;
mod engine;
mod kpi;
mod metrics_store;
mod observability;
mod record_store;
mod records;
mod rolling;

pub use aggregate::{
    aggregate_daily, aggregate_sales, aggregate_visits, best_sellers, AggregationReport,
    BestSeller, DailyAggregate, ProductCatalog, SaleTotals, StoreDayKey, VisitTotals,
};
pub use anomaly::{
    correct_visits, store_ratio, CorrectedVisit, CorrectionReport, DEFAULT_VISITOR_THRESHOLD,
};
pub use engine::{
    engine_config_from_env, EngineConfig, EngineError, MetricsEngine, RunOutcome, RunReport,
    RunState,
};
pub use kpi::{derive_kpis, derive_metrics, variation, KpiInputs, Kpis};
pub use metrics_store::{
    dedup_last_write_wins, export_csv, DailyStoreMetric, InMemoryMetricsTable, MergeReport,
    MetricsStoreError, MetricsTable, SqliteMetricsStore, METRICS_TABLE, METRIC_COLUMNS,
};
pub use observability::{
    init_logging, log_run_outcome, log_run_start, logging_config_from_env, LogFormat,
    LoggingConfig, LoggingInitError,
};
pub use record_store::{
    partition_date, read_new_records, DirectoryRecordSource, InMemoryRecordSource,
    PartitionLoad, PartitionRef, ReadReport, RecordSource, RecordStoreError, RetryPolicy,
    SourceBatch, SourceKind,
};
pub use records::{
    CsvRecord, ProductColumns, ProductReference, RecordError, SaleLineColumns, SaleLineRecord,
    VisitColumns, VisitRecord,
};
pub use rolling::{
    compute_rolling_averages, history_window, round2, weekday_name, HistoricalDay, RolledDay,
    RollingAverages, DEFAULT_HISTORY_WEEKS, DEFAULT_WINDOW,
};
