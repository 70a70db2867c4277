use std::io;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use retail_metrics::{
    correct_visits, log_run_outcome, log_run_start, EngineConfig, InMemoryMetricsTable,
    InMemoryRecordSource, LogFormat, LoggingConfig, MergeReport, MetricsEngine, RetryPolicy,
    RunOutcome, RunReport, SourceKind, VisitRecord, DEFAULT_VISITOR_THRESHOLD,
};
use serde_json::Value;
use tracing::dispatcher::with_default;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriter;

#[derive(Clone, Default)]
struct SharedWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    fn output_string(&self) -> String {
        let bytes = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs(max_level: Level, f: impl FnOnce()) -> String {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_max_level(max_level)
        .with_writer(writer.clone())
        .finish();
    let dispatch = tracing::Dispatch::new(subscriber);

    with_default(&dispatch, f);
    writer.output_string()
}

fn event_fields(logs: &str, event: &str) -> Value {
    logs.lines()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .map(|entry| entry["fields"].clone())
        .find(|fields| fields["event"] == event)
        .unwrap_or_else(|| panic!("no {event} entry in {logs}"))
}

fn quiet_config() -> EngineConfig {
    EngineConfig {
        retry: RetryPolicy::no_backoff(0),
        ..EngineConfig::default()
    }
}

#[test]
fn malformed_rows_and_unknown_products_are_logged_as_warnings() {
    let source = InMemoryRecordSource::new()
        .with_partition(
            SourceKind::Visits,
            "visits_2024-01-05.csv",
            "date,store_id,hour,visitors,sales\n\
             2024-01-05,s1,10,80,8\n\
             2024-01-05,s1,not-an-hour,80,8\n",
        )
        .with_partition(
            SourceKind::Sales,
            "sales_2024-01-05.csv",
            "sale_id,product_id,store_id,quantity,sale_amount,sale_date,sale_time\n\
             x1,ghost,s1,2,9.5,2024-01-05,10:30:00\n",
        );

    let logs = capture_logs(Level::INFO, || {
        let mut engine = MetricsEngine::new(source, InMemoryMetricsTable::new(), quiet_config());
        let outcome = engine.run().expect("run should complete");
        assert_eq!(outcome.report().visits.rows_rejected, 1);
        assert_eq!(outcome.report().aggregation.sale_lines_without_product, 1);
    });

    assert!(logs.contains("\"event\":\"record_store.row.rejected\""));
    assert!(logs.contains("\"event\":\"aggregate.sales.unknown_product\""));
    assert!(logs.contains("\"event\":\"kpi.derive.finish\""));
}

#[test]
fn uncorrectable_outlier_emits_warning() {
    let date = chrono::NaiveDate::from_ymd_opt(2024, 1, 5).expect("valid date");
    let rows = vec![
        VisitRecord::new(date, "s1", 9, Some(100), Some(10)).expect("valid row"),
        VisitRecord::new(date, "s1", 10, Some(9_000), None).expect("valid row"),
    ];

    let logs = capture_logs(Level::INFO, || {
        let (_, report) = correct_visits(rows, DEFAULT_VISITOR_THRESHOLD);
        assert_eq!(report.rows_uncorrectable, 1);
    });

    assert!(logs.contains("\"event\":\"anomaly.row.uncorrectable\""));
    assert!(logs.contains("\"event\":\"anomaly.correct.finish\""));
}

#[test]
fn state_transitions_are_logged_at_debug() {
    let source = InMemoryRecordSource::new();

    let logs = capture_logs(Level::DEBUG, || {
        let mut engine = MetricsEngine::new(source, InMemoryMetricsTable::new(), quiet_config());
        let outcome = engine.run().expect("empty source is not an error");
        assert!(matches!(outcome, RunOutcome::NoNewData(_)));
    });

    assert!(logs.contains("\"event\":\"engine.state\""));
    assert!(logs.contains("\"to\":\"read_new_sources\""));
    assert!(logs.contains("\"to\":\"no_new_data\""));
    assert!(logs.contains("\"event\":\"engine.run.no_new_data\""));
}

#[test]
fn run_lifecycle_helpers_emit_baseline_events() {
    let logs = capture_logs(Level::INFO, || {
        log_run_start(&LoggingConfig::default(), &EngineConfig::default());
        log_run_outcome(&RunOutcome::Completed(RunReport::default()));
        log_run_outcome(&RunOutcome::NoNewData(RunReport::default()));
    });

    assert!(logs.contains("\"event\":\"run.start\""));
    assert!(logs.contains("\"outcome\":\"completed\""));
    assert!(logs.contains("\"outcome\":\"no_new_data\""));
}

#[test]
fn run_lifecycle_fields_carry_config_and_report_values() {
    let logging = LoggingConfig {
        level: "debug".to_string(),
        format: LogFormat::Json,
        include_target: false,
    };
    let engine = EngineConfig {
        data_root: PathBuf::from("/srv/retail/raw"),
        metrics_db_path: PathBuf::from("/srv/retail/metrics.sqlite"),
        export_csv_path: None,
        retry: RetryPolicy::no_backoff(2),
        ..EngineConfig::default()
    };
    let mut report = RunReport {
        metric_rows_written: 3,
        rows_skipped_processed: 4,
        merge: MergeReport {
            rows_inserted: 2,
            rows_replaced: 1,
            table_rows: 9,
        },
        ..RunReport::default()
    };
    report.visits.rows_rejected = 1;
    report.sales.rows_rejected = 2;

    let logs = capture_logs(Level::INFO, || {
        log_run_start(&logging, &engine);
        log_run_outcome(&RunOutcome::Completed(report));
    });

    let start = event_fields(&logs, "run.start");
    assert_eq!(start["component"], "daily_metrics_run");
    assert_eq!(start["log_level"], "debug");
    assert_eq!(start["data_root"], "/srv/retail/raw");
    assert_eq!(start["metrics_db"], "/srv/retail/metrics.sqlite");
    assert_eq!(start["export_enabled"], false);
    assert_eq!(start["max_retries"], 2);

    let outcome = event_fields(&logs, "run.outcome");
    assert_eq!(outcome["outcome"], "completed");
    assert_eq!(outcome["rows_written"], 3);
    assert_eq!(outcome["rows_inserted"], 2);
    assert_eq!(outcome["rows_replaced"], 1);
    assert_eq!(outcome["table_rows"], 9);
    assert_eq!(outcome["rows_rejected"], 3);
    assert_eq!(outcome["rows_skipped_processed"], 4);
}
