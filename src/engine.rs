//! Run controller: one incremental pass from new partitions to the merged
//! metrics table.
//!
//! The only durable mutation happens in `RunState::Persist`, after every read
//! and compute step has succeeded. A run that fails earlier leaves the table
//! untouched and can simply be retried.

use std::collections::BTreeSet;
use std::env;
use std::fmt;
use std::path::PathBuf;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::aggregate::{aggregate_daily, AggregationReport, ProductCatalog};
use crate::anomaly::{correct_visits, CorrectionReport, DEFAULT_VISITOR_THRESHOLD};
use crate::kpi::derive_metrics;
use crate::metrics_store::{
    export_csv, MergeReport, MetricsStoreError, MetricsTable, SqliteMetricsStore,
};
use crate::record_store::{
    read_new_records, DirectoryRecordSource, ReadReport, RecordSource, RecordStoreError,
    RetryPolicy, SourceKind,
};
use crate::records::{ProductReference, SaleLineRecord, VisitRecord};
use crate::rolling::{
    compute_rolling_averages, history_window, DEFAULT_HISTORY_WEEKS, DEFAULT_WINDOW,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Start,
    ReadProcessedDates,
    ReadNewSources,
    NoNewData,
    Correct,
    Aggregate,
    Roll,
    Derive,
    Persist,
    Done,
    Failed,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::ReadProcessedDates => "read_processed_dates",
            Self::ReadNewSources => "read_new_sources",
            Self::NoNewData => "no_new_data",
            Self::Correct => "correct",
            Self::Aggregate => "aggregate",
            Self::Roll => "roll",
            Self::Derive => "derive",
            Self::Persist => "persist",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub data_root: PathBuf,
    pub metrics_db_path: PathBuf,
    pub export_csv_path: Option<PathBuf>,
    pub history_weeks: u32,
    pub window: usize,
    pub anomaly_visitor_threshold: u32,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data/raw"),
            metrics_db_path: PathBuf::from("data/metrics/daily_store_metrics.sqlite"),
            export_csv_path: None,
            history_weeks: DEFAULT_HISTORY_WEEKS,
            window: DEFAULT_WINDOW,
            anomaly_visitor_threshold: DEFAULT_VISITOR_THRESHOLD,
            retry: RetryPolicy::default(),
        }
    }
}

pub fn engine_config_from_env() -> EngineConfig {
    let mut config = EngineConfig::default();

    if let Some(root) = non_empty_var("RETAIL_DATA_ROOT") {
        config.data_root = PathBuf::from(root);
    }
    if let Some(path) = non_empty_var("RETAIL_METRICS_DB") {
        config.metrics_db_path = PathBuf::from(path);
    }
    if let Some(path) = non_empty_var("RETAIL_METRICS_EXPORT") {
        config.export_csv_path = Some(PathBuf::from(path));
    }
    if let Some(retries) = non_empty_var("RETAIL_MAX_RETRIES").and_then(|v| v.parse().ok()) {
        config.retry.max_retries = retries;
    }
    if let Some(backoff) = non_empty_var("RETAIL_RETRY_BACKOFF_MS").and_then(|v| v.parse().ok()) {
        config.retry.retry_backoff_ms = backoff;
    }

    config
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("reading {kind} partitions failed: {source}")]
    Source {
        kind: &'static str,
        #[source]
        source: RecordStoreError,
    },
    #[error("metrics table failed during {state}: {source}")]
    MetricsTable {
        state: RunState,
        #[source]
        source: MetricsStoreError,
    },
    #[error("metrics export failed: {0}")]
    Export(#[source] MetricsStoreError),
}

impl EngineError {
    fn from_table(state: RunState) -> impl FnOnce(MetricsStoreError) -> Self {
        move |source| Self::MetricsTable { state, source }
    }

    fn from_source(kind: SourceKind) -> impl FnOnce(RecordStoreError) -> Self {
        move |source| Self::Source {
            kind: kind.as_str(),
            source,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub processed_dates_before: u64,
    pub visits: ReadReport,
    pub sales: ReadReport,
    pub products: ReadReport,
    pub rows_skipped_processed: u64,
    pub correction: CorrectionReport,
    pub aggregation: AggregationReport,
    pub new_dates: Vec<NaiveDate>,
    pub history_rows: u64,
    pub metric_rows_written: u64,
    pub merge: MergeReport,
    pub exported_to: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunOutcome {
    NoNewData(RunReport),
    Completed(RunReport),
}

impl RunOutcome {
    pub fn report(&self) -> &RunReport {
        match self {
            Self::NoNewData(report) | Self::Completed(report) => report,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::NoNewData(_) => "no_new_data",
            Self::Completed(_) => "completed",
        }
    }
}

pub struct MetricsEngine<S, T> {
    source: S,
    table: T,
    config: EngineConfig,
}

impl MetricsEngine<DirectoryRecordSource, SqliteMetricsStore> {
    pub fn open(config: EngineConfig) -> Result<Self, EngineError> {
        let source = DirectoryRecordSource::new(config.data_root.clone());
        let table = SqliteMetricsStore::open(&config.metrics_db_path, config.retry)
            .map_err(EngineError::from_table(RunState::Start))?;
        Ok(Self::new(source, table, config))
    }
}

impl<S, T> MetricsEngine<S, T>
where
    S: RecordSource,
    T: MetricsTable,
{
    pub fn new(source: S, table: T, config: EngineConfig) -> Self {
        Self {
            source,
            table,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn table(&self) -> &T {
        &self.table
    }

    pub fn into_table(self) -> T {
        self.table
    }

    pub fn close(self) -> Result<(), MetricsStoreError> {
        self.table.close()
    }

    pub fn run(&mut self) -> Result<RunOutcome, EngineError> {
        let mut tracker = StateTracker::new();
        match self.run_steps(&mut tracker) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                let failed_in = tracker.state;
                tracker.advance(RunState::Failed);
                error!(
                    component = "engine",
                    event = "engine.run.failed",
                    failed_in = %failed_in,
                    error = %err
                );
                Err(err)
            }
        }
    }

    fn run_steps(&mut self, tracker: &mut StateTracker) -> Result<RunOutcome, EngineError> {
        let mut report = RunReport::default();
        let retry = self.config.retry;

        tracker.advance(RunState::ReadProcessedDates);
        let processed = self
            .table
            .processed_dates()
            .map_err(EngineError::from_table(RunState::ReadProcessedDates))?;
        report.processed_dates_before = processed.len() as u64;

        tracker.advance(RunState::ReadNewSources);
        let visits = read_new_records::<VisitRecord, _>(
            &self.source,
            SourceKind::Visits,
            &processed,
            &retry,
        )
        .map_err(EngineError::from_source(SourceKind::Visits))?;
        let sales = read_new_records::<SaleLineRecord, _>(
            &self.source,
            SourceKind::Sales,
            &processed,
            &retry,
        )
        .map_err(EngineError::from_source(SourceKind::Sales))?;
        report.visits = visits.report;
        report.sales = sales.report;

        // Undated partitions may still carry rows for dates already in the table.
        let mut visit_rows = visits.rows;
        let mut sale_rows = sales.rows;
        let rows_before = visit_rows.len() + sale_rows.len();
        visit_rows.retain(|row| !processed.contains(&row.date));
        sale_rows.retain(|row| !processed.contains(&row.sale_date));
        report.rows_skipped_processed = (rows_before - visit_rows.len() - sale_rows.len()) as u64;
        if report.rows_skipped_processed > 0 {
            debug!(
                component = "engine",
                event = "engine.rows.skipped_processed",
                rows = report.rows_skipped_processed
            );
        }

        if visit_rows.is_empty() || sale_rows.is_empty() {
            tracker.advance(RunState::NoNewData);
            info!(
                component = "engine",
                event = "engine.run.no_new_data",
                visit_rows = visit_rows.len(),
                sale_rows = sale_rows.len()
            );
            return Ok(RunOutcome::NoNewData(report));
        }

        // The catalog has no date; it is always read in full.
        let products = read_new_records::<ProductReference, _>(
            &self.source,
            SourceKind::Products,
            &BTreeSet::new(),
            &retry,
        )
        .map_err(EngineError::from_source(SourceKind::Products))?;
        report.products = products.report;
        let catalog = ProductCatalog::new(products.rows);

        tracker.advance(RunState::Correct);
        let (corrected, correction) =
            correct_visits(visit_rows, self.config.anomaly_visitor_threshold);
        report.correction = correction;

        tracker.advance(RunState::Aggregate);
        let (aggregates, aggregation) = aggregate_daily(&corrected, &sale_rows, &catalog);
        report.aggregation = aggregation;

        let new_dates: BTreeSet<NaiveDate> = aggregates.iter().map(|row| row.date).collect();
        let Some(first_new_date) = new_dates.first().copied() else {
            tracker.advance(RunState::NoNewData);
            info!(
                component = "engine",
                event = "engine.run.no_new_data",
                reason = "no_aggregated_rows"
            );
            return Ok(RunOutcome::NoNewData(report));
        };
        report.new_dates = new_dates.into_iter().collect();

        tracker.advance(RunState::Roll);
        let stores: BTreeSet<String> = aggregates.iter().map(|row| row.store_id.clone()).collect();
        let (history_start, history_end) =
            history_window(first_new_date, self.config.history_weeks);
        let history = self
            .table
            .history(history_start, history_end, &stores)
            .map_err(EngineError::from_table(RunState::Roll))?;
        report.history_rows = history.len() as u64;
        debug!(
            component = "engine",
            event = "engine.history.loaded",
            start = %history_start,
            end_exclusive = %history_end,
            stores = stores.len(),
            rows = history.len()
        );
        let rolled = compute_rolling_averages(aggregates, &history, self.config.window);

        tracker.advance(RunState::Derive);
        let metrics = derive_metrics(rolled);
        report.metric_rows_written = metrics.len() as u64;

        tracker.advance(RunState::Persist);
        report.merge = self
            .table
            .merge(&metrics)
            .map_err(EngineError::from_table(RunState::Persist))?;

        if let Some(path) = self.config.export_csv_path.clone() {
            let all_rows = self
                .table
                .load_all()
                .map_err(EngineError::from_table(RunState::Persist))?;
            export_csv(&all_rows, &path).map_err(EngineError::Export)?;
            report.exported_to = Some(path);
        }

        tracker.advance(RunState::Done);
        Ok(RunOutcome::Completed(report))
    }
}

struct StateTracker {
    state: RunState,
}

impl StateTracker {
    fn new() -> Self {
        Self {
            state: RunState::Start,
        }
    }

    fn advance(&mut self, next: RunState) {
        debug!(
            component = "engine",
            event = "engine.state",
            from = %self.state,
            to = %next
        );
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics_store::InMemoryMetricsTable;
    use crate::record_store::InMemoryRecordSource;
    use std::sync::{Mutex, OnceLock};

    const PRODUCTS: &str = "product_id,cost,name\np1,2.0,Soap\np2,5.0,Rice\n";

    fn source_for(day: &str) -> InMemoryRecordSource {
        InMemoryRecordSource::new()
            .with_partition(
                SourceKind::Visits,
                format!("visits_{day}.csv"),
                format!("date,store_id,hour,visitors,sales\n{day},s1,9,100,10\n{day},s1,10,200,20\n"),
            )
            .with_partition(
                SourceKind::Sales,
                format!("sales_{day}.csv"),
                format!(
                    "sale_id,product_id,store_id,quantity,sale_amount,sale_date,sale_time\n\
                     a,p1,s1,3,30.0,{day},09:15:00\n\
                     b,p2,s1,1,12.0,{day},10:05:00\n"
                ),
            )
            .with_partition(SourceKind::Products, "products.csv", PRODUCTS)
    }

    fn config() -> EngineConfig {
        EngineConfig {
            retry: RetryPolicy::no_backoff(0),
            ..EngineConfig::default()
        }
    }

    #[test]
    fn completed_run_merges_one_row_per_store_day() {
        let mut engine = MetricsEngine::new(
            source_for("2023-12-01"),
            InMemoryMetricsTable::new(),
            config(),
        );

        let outcome = engine.run().unwrap();
        let report = outcome.report();

        assert_eq!(outcome.label(), "completed");
        assert_eq!(report.metric_rows_written, 1);
        assert_eq!(report.merge.rows_inserted, 1);
        assert_eq!(
            report.new_dates,
            vec![NaiveDate::from_ymd_opt(2023, 12, 1).unwrap()]
        );

        let rows = engine.table().load_all().unwrap();
        assert_eq!(rows[0].total_visitors, 300.0);
        assert_eq!(rows[0].total_transactions, 30);
        assert_eq!(rows[0].total_revenue, 42.0);
        assert_eq!(rows[0].total_cost, 11.0);
        assert_eq!(rows[0].best_selling_product_id.as_deref(), Some("p1"));
        assert_eq!(rows[0].day_of_week, "Friday");
    }

    #[test]
    fn second_run_over_same_partitions_is_a_no_op() {
        let mut engine = MetricsEngine::new(
            source_for("2023-12-01"),
            InMemoryMetricsTable::new(),
            config(),
        );
        engine.run().unwrap();
        let before = engine.table().clone();

        let outcome = engine.run().unwrap();

        assert!(matches!(outcome, RunOutcome::NoNewData(_)));
        assert_eq!(outcome.report().visits.partitions_skipped_processed, 1);
        assert_eq!(engine.into_table(), before);
    }

    #[test]
    fn missing_sales_means_no_new_data_and_untouched_table() {
        let source = InMemoryRecordSource::new().with_partition(
            SourceKind::Visits,
            "visits_2023-12-01.csv",
            "date,store_id,hour,visitors,sales\n2023-12-01,s1,9,100,10\n",
        );
        let mut engine = MetricsEngine::new(source, InMemoryMetricsTable::new(), config());

        let outcome = engine.run().unwrap();

        assert_eq!(outcome.label(), "no_new_data");
        assert!(engine.table().is_empty());
    }

    #[test]
    fn later_run_uses_persisted_history_for_rolling_average() {
        let mut engine = MetricsEngine::new(
            source_for("2023-12-01"),
            InMemoryMetricsTable::new(),
            config(),
        );
        engine.run().unwrap();
        let table = engine.into_table();

        let mut next = MetricsEngine::new(source_for("2023-12-08"), table, config());
        let outcome = next.run().unwrap();

        assert_eq!(outcome.report().history_rows, 1);
        let rows = next.table().load_all().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].avg_sales_last_4_weeks, Some(30.0));
        assert_eq!(rows[1].transactions_variation_vs_avg_4w_percent, Some(0.0));
    }

    #[test]
    fn table_failure_aborts_with_failing_state() {
        struct BrokenTable;

        impl MetricsTable for BrokenTable {
            fn processed_dates(&self) -> Result<BTreeSet<NaiveDate>, MetricsStoreError> {
                Ok(BTreeSet::new())
            }

            fn history(
                &self,
                _start: NaiveDate,
                _end_exclusive: NaiveDate,
                _stores: &BTreeSet<String>,
            ) -> Result<Vec<crate::rolling::HistoricalDay>, MetricsStoreError> {
                Ok(Vec::new())
            }

            fn merge(
                &mut self,
                _rows: &[crate::metrics_store::DailyStoreMetric],
            ) -> Result<MergeReport, MetricsStoreError> {
                Err(MetricsStoreError::Io(std::io::Error::other("disk full")))
            }

            fn load_all(
                &self,
            ) -> Result<Vec<crate::metrics_store::DailyStoreMetric>, MetricsStoreError> {
                Ok(Vec::new())
            }
        }

        let mut engine = MetricsEngine::new(source_for("2023-12-01"), BrokenTable, config());
        let err = engine.run().unwrap_err();

        assert!(matches!(
            err,
            EngineError::MetricsTable {
                state: RunState::Persist,
                ..
            }
        ));
    }

    #[test]
    fn listing_failure_fails_the_run_before_any_write() {
        struct UnlistableSource;

        impl RecordSource for UnlistableSource {
            fn list_partitions(
                &self,
                kind: SourceKind,
            ) -> Result<Vec<crate::record_store::PartitionRef>, RecordStoreError> {
                Err(RecordStoreError::Io {
                    path: PathBuf::from(kind.as_str()),
                    source: std::io::Error::new(
                        std::io::ErrorKind::PermissionDenied,
                        "permission denied",
                    ),
                })
            }

            fn read_partition(
                &self,
                _partition: &crate::record_store::PartitionRef,
            ) -> Result<crate::record_store::PartitionLoad, RecordStoreError> {
                Ok(crate::record_store::PartitionLoad::Absent)
            }
        }

        let mut engine =
            MetricsEngine::new(UnlistableSource, InMemoryMetricsTable::new(), config());
        let err = engine.run().unwrap_err();

        assert!(matches!(
            err,
            EngineError::Source {
                kind: "visits",
                source: RecordStoreError::Io { .. },
            }
        ));
        assert!(engine.table().is_empty());
    }

    #[test]
    fn rows_for_processed_dates_in_undated_partitions_are_ignored() {
        let first = InMemoryRecordSource::new()
            .with_partition(
                SourceKind::Visits,
                "visits_2023-12-01.csv",
                "date,store_id,hour,visitors,sales\n2023-12-01,s1,9,100,10\n",
            )
            .with_partition(
                SourceKind::Sales,
                "sales_2023-12.csv",
                "sale_id,product_id,store_id,quantity,sale_amount,sale_date,sale_time\n\
                 a,p1,s1,3,30.0,2023-12-01,09:15:00\n",
            )
            .with_partition(SourceKind::Products, "products.csv", PRODUCTS);
        let mut engine = MetricsEngine::new(first, InMemoryMetricsTable::new(), config());
        engine.run().unwrap();
        let before = engine.table().load_all().unwrap();

        let second = InMemoryRecordSource::new()
            .with_partition(
                SourceKind::Visits,
                "visits_2023-12-01.csv",
                "date,store_id,hour,visitors,sales\n2023-12-01,s1,9,100,10\n",
            )
            .with_partition(
                SourceKind::Visits,
                "visits_2023-12-02.csv",
                "date,store_id,hour,visitors,sales\n2023-12-02,s1,9,40,4\n",
            )
            .with_partition(
                SourceKind::Sales,
                "sales_2023-12.csv",
                "sale_id,product_id,store_id,quantity,sale_amount,sale_date,sale_time\n\
                 a,p1,s1,3,30.0,2023-12-01,09:15:00\n\
                 b,p2,s1,1,12.0,2023-12-02,09:40:00\n",
            )
            .with_partition(SourceKind::Products, "products.csv", PRODUCTS);
        let mut engine = MetricsEngine::new(second, engine.into_table(), config());
        let outcome = engine.run().unwrap();

        assert_eq!(outcome.report().rows_skipped_processed, 1);
        assert_eq!(outcome.report().merge.rows_replaced, 0);
        let rows = engine.table().load_all().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], before[0]);
        assert_eq!(rows[1].total_visitors, 40.0);
    }

    fn env_lock() -> &'static Mutex<()> {
        static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    #[test]
    fn config_from_env_overrides_and_falls_back() {
        let _guard = env_lock().lock().expect("env lock should not be poisoned");
        let keys = [
            "RETAIL_DATA_ROOT",
            "RETAIL_METRICS_DB",
            "RETAIL_METRICS_EXPORT",
            "RETAIL_MAX_RETRIES",
            "RETAIL_RETRY_BACKOFF_MS",
        ];
        let previous: Vec<_> = keys.iter().map(|key| (*key, env::var(key).ok())).collect();

        env::set_var("RETAIL_DATA_ROOT", "/srv/raw");
        env::set_var("RETAIL_METRICS_DB", "");
        env::set_var("RETAIL_METRICS_EXPORT", "/srv/out/metrics.csv");
        env::set_var("RETAIL_MAX_RETRIES", "5");
        env::set_var("RETAIL_RETRY_BACKOFF_MS", "soon");

        let cfg = engine_config_from_env();

        for (key, value) in previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }

        let defaults = EngineConfig::default();
        assert_eq!(cfg.data_root, PathBuf::from("/srv/raw"));
        assert_eq!(cfg.metrics_db_path, defaults.metrics_db_path);
        assert_eq!(
            cfg.export_csv_path,
            Some(PathBuf::from("/srv/out/metrics.csv"))
        );
        assert_eq!(cfg.retry.max_retries, 5);
        assert_eq!(cfg.retry.retry_backoff_ms, defaults.retry.retry_backoff_ms);
        assert_eq!(cfg.window, 4);
    }
}
