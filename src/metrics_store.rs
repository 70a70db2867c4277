//! Durable daily metrics table keyed by (date, store_id).

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::record_store::{retry, RetryPolicy};
use crate::rolling::HistoricalDay;

pub const METRICS_TABLE: &str = "daily_store_metrics";

pub const METRIC_COLUMNS: [&str; 24] = [
    "date",
    "day_of_week",
    "store_id",
    "total_visitors",
    "avg_visitors_last_4_weeks",
    "visitors_variation_vs_avg_4w_percent",
    "total_transactions",
    "avg_sales_last_4_weeks",
    "transactions_variation_vs_avg_4w_percent",
    "total_quantity",
    "best_selling_product_id",
    "best_selling_product_name",
    "total_revenue",
    "avg_revenue_last_4_weeks",
    "revenue_variation_vs_avg_4w_percent",
    "total_cost",
    "total_margin",
    "conversion_rate",
    "avg_transaction_value",
    "transactions_amount_variation_vs_avg_4w_percent",
    "revenue_per_visitor",
    "margin_per_visitor",
    "peak_hour_sales",
    "peak_hour_visitors",
];

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyStoreMetric {
    pub date: NaiveDate,
    pub day_of_week: String,
    pub store_id: String,
    pub total_visitors: f64,
    pub avg_visitors_last_4_weeks: Option<f64>,
    pub visitors_variation_vs_avg_4w_percent: Option<f64>,
    pub total_transactions: u64,
    pub avg_sales_last_4_weeks: Option<f64>,
    pub transactions_variation_vs_avg_4w_percent: Option<f64>,
    pub total_quantity: u64,
    pub best_selling_product_id: Option<String>,
    pub best_selling_product_name: Option<String>,
    pub total_revenue: f64,
    pub avg_revenue_last_4_weeks: Option<f64>,
    pub revenue_variation_vs_avg_4w_percent: Option<f64>,
    pub total_cost: f64,
    pub total_margin: Option<f64>,
    pub conversion_rate: Option<f64>,
    pub avg_transaction_value: Option<f64>,
    pub transactions_amount_variation_vs_avg_4w_percent: Option<f64>,
    pub revenue_per_visitor: Option<f64>,
    pub margin_per_visitor: Option<f64>,
    pub peak_hour_sales: Option<u8>,
    pub peak_hour_visitors: Option<u8>,
}

impl DailyStoreMetric {
    pub fn key(&self) -> (NaiveDate, &str) {
        (self.date, self.store_id.as_str())
    }

    pub fn to_historical_day(&self) -> HistoricalDay {
        HistoricalDay {
            date: self.date,
            store_id: self.store_id.clone(),
            total_visitors: self.total_visitors,
            total_transactions: self.total_transactions,
            total_revenue: self.total_revenue,
        }
    }

    pub fn to_csv_fields(&self) -> Vec<String> {
        vec![
            self.date.format(DATE_FORMAT).to_string(),
            self.day_of_week.clone(),
            self.store_id.clone(),
            self.total_visitors.to_string(),
            opt_to_string(self.avg_visitors_last_4_weeks),
            opt_to_string(self.visitors_variation_vs_avg_4w_percent),
            self.total_transactions.to_string(),
            opt_to_string(self.avg_sales_last_4_weeks),
            opt_to_string(self.transactions_variation_vs_avg_4w_percent),
            self.total_quantity.to_string(),
            self.best_selling_product_id.clone().unwrap_or_default(),
            self.best_selling_product_name.clone().unwrap_or_default(),
            self.total_revenue.to_string(),
            opt_to_string(self.avg_revenue_last_4_weeks),
            opt_to_string(self.revenue_variation_vs_avg_4w_percent),
            self.total_cost.to_string(),
            opt_to_string(self.total_margin),
            opt_to_string(self.conversion_rate),
            opt_to_string(self.avg_transaction_value),
            opt_to_string(self.transactions_amount_variation_vs_avg_4w_percent),
            opt_to_string(self.revenue_per_visitor),
            opt_to_string(self.margin_per_visitor),
            opt_to_string(self.peak_hour_sales),
            opt_to_string(self.peak_hour_visitors),
        ]
    }
}

fn opt_to_string<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

#[derive(Debug, Error)]
pub enum MetricsStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("invalid output path: {0}")]
    InvalidPath(PathBuf),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    pub rows_inserted: u64,
    pub rows_replaced: u64,
    pub table_rows: u64,
}

pub trait MetricsTable {
    fn processed_dates(&self) -> Result<BTreeSet<NaiveDate>, MetricsStoreError>;

    fn history(
        &self,
        start: NaiveDate,
        end_exclusive: NaiveDate,
        stores: &BTreeSet<String>,
    ) -> Result<Vec<HistoricalDay>, MetricsStoreError>;

    fn merge(&mut self, rows: &[DailyStoreMetric]) -> Result<MergeReport, MetricsStoreError>;

    fn load_all(&self) -> Result<Vec<DailyStoreMetric>, MetricsStoreError>;

    fn close(self) -> Result<(), MetricsStoreError>
    where
        Self: Sized,
    {
        Ok(())
    }
}

pub struct SqliteMetricsStore {
    conn: Option<Connection>,
    table_ready: bool,
    path: PathBuf,
    retry_policy: RetryPolicy,
}

impl SqliteMetricsStore {
    // Nothing is created on disk here; the file and table appear on the first merge.
    pub fn open(path: &Path, retry_policy: RetryPolicy) -> Result<Self, MetricsStoreError> {
        let conn = if path.exists() {
            Some(open_connection(path, &retry_policy)?)
        } else {
            None
        };
        let table_ready = match &conn {
            Some(conn) => table_exists(conn, METRICS_TABLE)?,
            None => false,
        };

        if table_ready {
            info!(
                component = "metrics_store",
                event = "metrics_store.open",
                path = %path.display(),
                table_existed = true
            );
        } else {
            warn!(
                component = "metrics_store",
                event = "metrics_store.table.missing",
                path = %path.display(),
                file_exists = conn.is_some()
            );
        }

        Ok(Self {
            conn,
            table_ready,
            path: path.to_path_buf(),
            retry_policy,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn readable(&self) -> Option<&Connection> {
        self.conn.as_ref().filter(|_| self.table_ready)
    }

    fn writable(&mut self) -> Result<&mut Connection, MetricsStoreError> {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => {
                if let Some(parent) = self.path.parent() {
                    if !parent.as_os_str().is_empty() {
                        fs::create_dir_all(parent)?;
                    }
                }
                open_connection(&self.path, &self.retry_policy)?
            }
        };
        let conn = self.conn.insert(conn);
        if !self.table_ready {
            create_table(conn)?;
            self.table_ready = true;
            info!(
                component = "metrics_store",
                event = "metrics_store.table.created",
                path = %self.path.display()
            );
        }
        Ok(conn)
    }
}

fn open_connection(path: &Path, retry_policy: &RetryPolicy) -> Result<Connection, MetricsStoreError> {
    let conn = retry(retry_policy, || Connection::open(path))?;
    conn.execute_batch(
        "
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        ",
    )?;
    Ok(conn)
}

fn merge_rows(
    conn: &mut Connection,
    rows: &[DailyStoreMetric],
) -> Result<MergeReport, MetricsStoreError> {
    let tx = conn.transaction()?;
    let mut report = MergeReport::default();
    {
        let mut exists = tx.prepare(&format!(
            "SELECT 1 FROM {METRICS_TABLE} WHERE date = ?1 AND store_id = ?2"
        ))?;
        let mut insert = tx.prepare(&format!(
            "INSERT OR REPLACE INTO {METRICS_TABLE} ({}) VALUES ({})",
            METRIC_COLUMNS.join(", "),
            (1..=METRIC_COLUMNS.len())
                .map(|idx| format!("?{idx}"))
                .collect::<Vec<_>>()
                .join(", ")
        ))?;

        for row in rows {
            let date = row.date.format(DATE_FORMAT).to_string();
            let existed = exists
                .query_row(params![date, row.store_id], |_| Ok(()))
                .optional()?
                .is_some();
            if existed {
                report.rows_replaced += 1;
            } else {
                report.rows_inserted += 1;
            }

            insert.execute(params![
                date,
                row.day_of_week,
                row.store_id,
                row.total_visitors,
                row.avg_visitors_last_4_weeks,
                row.visitors_variation_vs_avg_4w_percent,
                row.total_transactions,
                row.avg_sales_last_4_weeks,
                row.transactions_variation_vs_avg_4w_percent,
                row.total_quantity,
                row.best_selling_product_id,
                row.best_selling_product_name,
                row.total_revenue,
                row.avg_revenue_last_4_weeks,
                row.revenue_variation_vs_avg_4w_percent,
                row.total_cost,
                row.total_margin,
                row.conversion_rate,
                row.avg_transaction_value,
                row.transactions_amount_variation_vs_avg_4w_percent,
                row.revenue_per_visitor,
                row.margin_per_visitor,
                row.peak_hour_sales,
                row.peak_hour_visitors,
            ])?;
        }
    }

    report.table_rows = tx.query_row(
        &format!("SELECT COUNT(*) FROM {METRICS_TABLE}"),
        [],
        |row| row.get(0),
    )?;
    tx.commit()?;
    Ok(report)
}

impl MetricsTable for SqliteMetricsStore {
    fn processed_dates(&self) -> Result<BTreeSet<NaiveDate>, MetricsStoreError> {
        let Some(conn) = self.readable() else {
            return Ok(BTreeSet::new());
        };
        let mut stmt = conn.prepare(&format!("SELECT DISTINCT date FROM {METRICS_TABLE}"))?;
        let dates = stmt
            .query_map([], |row| date_column(row, 0))?
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(dates)
    }

    fn history(
        &self,
        start: NaiveDate,
        end_exclusive: NaiveDate,
        stores: &BTreeSet<String>,
    ) -> Result<Vec<HistoricalDay>, MetricsStoreError> {
        let Some(conn) = self.readable() else {
            return Ok(Vec::new());
        };
        let mut stmt = conn.prepare(&format!(
            "
            SELECT date, store_id, total_visitors, total_transactions, total_revenue
            FROM {METRICS_TABLE}
            WHERE date >= ?1
              AND date < ?2
            ORDER BY date ASC, store_id ASC
            "
        ))?;
        let rows = stmt
            .query_map(
                params![
                    start.format(DATE_FORMAT).to_string(),
                    end_exclusive.format(DATE_FORMAT).to_string()
                ],
                |row| {
                    Ok(HistoricalDay {
                        date: date_column(row, 0)?,
                        store_id: row.get(1)?,
                        total_visitors: row.get(2)?,
                        total_transactions: row.get(3)?,
                        total_revenue: row.get(4)?,
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .filter(|day| stores.contains(&day.store_id))
            .collect())
    }

    fn merge(&mut self, rows: &[DailyStoreMetric]) -> Result<MergeReport, MetricsStoreError> {
        let rows = dedup_last_write_wins(rows);
        let policy = self.retry_policy;
        let conn = self.writable()?;
        let report = retry(&policy, || merge_rows(&mut *conn, &rows))?;

        info!(
            component = "metrics_store",
            event = "metrics_store.merge.commit",
            path = %self.path.display(),
            rows_inserted = report.rows_inserted,
            rows_replaced = report.rows_replaced,
            table_rows = report.table_rows
        );
        Ok(report)
    }

    fn load_all(&self) -> Result<Vec<DailyStoreMetric>, MetricsStoreError> {
        let Some(conn) = self.readable() else {
            return Ok(Vec::new());
        };
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM {METRICS_TABLE} ORDER BY date ASC, store_id ASC",
            METRIC_COLUMNS.join(", ")
        ))?;
        let rows = stmt
            .query_map([], metric_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn close(self) -> Result<(), MetricsStoreError> {
        let Some(conn) = self.conn else {
            return Ok(());
        };
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        conn.close().map_err(|(_, err)| err)?;
        info!(
            component = "metrics_store",
            event = "metrics_store.close",
            path = %self.path.display()
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InMemoryMetricsTable {
    rows: BTreeMap<(NaiveDate, String), DailyStoreMetric>,
}

impl InMemoryMetricsTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: impl IntoIterator<Item = DailyStoreMetric>) -> Self {
        Self {
            rows: rows
                .into_iter()
                .map(|row| ((row.date, row.store_id.clone()), row))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl MetricsTable for InMemoryMetricsTable {
    fn processed_dates(&self) -> Result<BTreeSet<NaiveDate>, MetricsStoreError> {
        Ok(self.rows.keys().map(|(date, _)| *date).collect())
    }

    fn history(
        &self,
        start: NaiveDate,
        end_exclusive: NaiveDate,
        stores: &BTreeSet<String>,
    ) -> Result<Vec<HistoricalDay>, MetricsStoreError> {
        Ok(self
            .rows
            .values()
            .filter(|row| row.date >= start && row.date < end_exclusive)
            .filter(|row| stores.contains(&row.store_id))
            .map(DailyStoreMetric::to_historical_day)
            .collect())
    }

    fn merge(&mut self, rows: &[DailyStoreMetric]) -> Result<MergeReport, MetricsStoreError> {
        let mut report = MergeReport::default();
        for row in dedup_last_write_wins(rows) {
            match self.rows.insert((row.date, row.store_id.clone()), row) {
                Some(_) => report.rows_replaced += 1,
                None => report.rows_inserted += 1,
            }
        }
        report.table_rows = self.rows.len() as u64;
        Ok(report)
    }

    fn load_all(&self) -> Result<Vec<DailyStoreMetric>, MetricsStoreError> {
        Ok(self.rows.values().cloned().collect())
    }
}

pub fn dedup_last_write_wins(rows: &[DailyStoreMetric]) -> Vec<DailyStoreMetric> {
    let mut by_key: BTreeMap<(NaiveDate, &str), &DailyStoreMetric> = BTreeMap::new();
    for row in rows {
        by_key.insert(row.key(), row);
    }
    by_key.into_values().cloned().collect()
}

// Temp file plus rename; readers never see a partial export.
pub fn export_csv(rows: &[DailyStoreMetric], path: &Path) -> Result<(), MetricsStoreError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(METRIC_COLUMNS)?;
    for row in rows {
        writer.write_record(row.to_csv_fields())?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|err| MetricsStoreError::Io(err.into_error()))?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    write_atomic(path, &bytes)?;

    info!(
        component = "metrics_store",
        event = "metrics_store.export.written",
        path = %path.display(),
        rows = rows.len(),
        bytes = bytes.len()
    );
    Ok(())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), MetricsStoreError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| MetricsStoreError::InvalidPath(path.to_path_buf()))?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool, MetricsStoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn create_table(conn: &Connection) -> Result<(), MetricsStoreError> {
    conn.execute_batch(&format!(
        "
        CREATE TABLE IF NOT EXISTS {METRICS_TABLE} (
            date TEXT NOT NULL,
            day_of_week TEXT NOT NULL,
            store_id TEXT NOT NULL,
            total_visitors REAL NOT NULL,
            avg_visitors_last_4_weeks REAL,
            visitors_variation_vs_avg_4w_percent REAL,
            total_transactions INTEGER NOT NULL,
            avg_sales_last_4_weeks REAL,
            transactions_variation_vs_avg_4w_percent REAL,
            total_quantity INTEGER NOT NULL,
            best_selling_product_id TEXT,
            best_selling_product_name TEXT,
            total_revenue REAL NOT NULL,
            avg_revenue_last_4_weeks REAL,
            revenue_variation_vs_avg_4w_percent REAL,
            total_cost REAL NOT NULL,
            total_margin REAL,
            conversion_rate REAL,
            avg_transaction_value REAL,
            transactions_amount_variation_vs_avg_4w_percent REAL,
            revenue_per_visitor REAL,
            margin_per_visitor REAL,
            peak_hour_sales INTEGER,
            peak_hour_visitors INTEGER,
            PRIMARY KEY(date, store_id)
        ) WITHOUT ROWID;
        "
    ))?;
    Ok(())
}

fn date_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(idx)?;
    NaiveDate::parse_from_str(&raw, DATE_FORMAT)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn metric_from_row(row: &Row<'_>) -> rusqlite::Result<DailyStoreMetric> {
    Ok(DailyStoreMetric {
        date: date_column(row, 0)?,
        day_of_week: row.get(1)?,
        store_id: row.get(2)?,
        total_visitors: row.get(3)?,
        avg_visitors_last_4_weeks: row.get(4)?,
        visitors_variation_vs_avg_4w_percent: row.get(5)?,
        total_transactions: row.get(6)?,
        avg_sales_last_4_weeks: row.get(7)?,
        transactions_variation_vs_avg_4w_percent: row.get(8)?,
        total_quantity: row.get(9)?,
        best_selling_product_id: row.get(10)?,
        best_selling_product_name: row.get(11)?,
        total_revenue: row.get(12)?,
        avg_revenue_last_4_weeks: row.get(13)?,
        revenue_variation_vs_avg_4w_percent: row.get(14)?,
        total_cost: row.get(15)?,
        total_margin: row.get(16)?,
        conversion_rate: row.get(17)?,
        avg_transaction_value: row.get(18)?,
        transactions_amount_variation_vs_avg_4w_percent: row.get(19)?,
        revenue_per_visitor: row.get(20)?,
        margin_per_visitor: row.get(21)?,
        peak_hour_sales: row.get(22)?,
        peak_hour_visitors: row.get(23)?,
    })
}
