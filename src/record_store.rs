//! Partitioned record store reading with processed-date skipping.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::records::{CsvRecord, RecordError};

const PARTITION_EXTENSION: &str = "csv";
const DATE_TOKEN_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    Visits,
    Sales,
    Products,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Visits => "visits",
            Self::Sales => "sales",
            Self::Products => "products",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionRef {
    pub kind: SourceKind,
    pub name: String,
    pub date: Option<NaiveDate>,
}

impl PartitionRef {
    pub fn new(kind: SourceKind, name: impl Into<String>) -> Self {
        let name = name.into();
        let date = partition_date(&name);
        Self { kind, name, date }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionLoad {
    Absent,
    Loaded(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_backoff_ms: 200,
        }
    }
}

impl RetryPolicy {
    pub fn no_backoff(max_retries: u32) -> Self {
        Self {
            max_retries,
            retry_backoff_ms: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum RecordStoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("CSV error in partition {partition}: {source}")]
    Csv {
        partition: String,
        #[source]
        source: csv::Error,
    },
    #[error("partition {partition} has an invalid header: {source}")]
    Header {
        partition: String,
        #[source]
        source: RecordError,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReport {
    pub partitions_listed: u64,
    pub partitions_read: u64,
    pub partitions_skipped_processed: u64,
    pub partitions_missing: u64,
    pub partitions_unreadable: u64,
    pub rows_read: u64,
    pub rows_rejected: u64,
    pub duplicate_rows_removed: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceBatch<T> {
    pub rows: Vec<T>,
    pub report: ReadReport,
}

pub trait RecordSource {
    fn list_partitions(&self, kind: SourceKind) -> Result<Vec<PartitionRef>, RecordStoreError>;

    fn read_partition(&self, partition: &PartitionRef) -> Result<PartitionLoad, RecordStoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryRecordSource {
    root: PathBuf,
}

impl DirectoryRecordSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn kind_dir(&self, kind: SourceKind) -> PathBuf {
        self.root.join(kind.as_str())
    }
}

impl RecordSource for DirectoryRecordSource {
    fn list_partitions(&self, kind: SourceKind) -> Result<Vec<PartitionRef>, RecordStoreError> {
        let dir = self.kind_dir(kind);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(
                    component = "record_store",
                    event = "record_store.source.missing",
                    kind = kind.as_str(),
                    path = %dir.display()
                );
                return Ok(Vec::new());
            }
            Err(source) => return Err(RecordStoreError::Io { path: dir, source }),
        };

        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| RecordStoreError::Io {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_csv = path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case(PARTITION_EXTENSION))
                .unwrap_or(false);
            if !is_csv {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
                out.push(PartitionRef::new(kind, name));
            }
        }

        out.sort();
        Ok(out)
    }

    fn read_partition(&self, partition: &PartitionRef) -> Result<PartitionLoad, RecordStoreError> {
        let path = self.kind_dir(partition.kind).join(&partition.name);
        match fs::read_to_string(&path) {
            Ok(text) => Ok(PartitionLoad::Loaded(text)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(PartitionLoad::Absent),
            Err(source) => Err(RecordStoreError::Io { path, source }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InMemoryRecordSource {
    partitions: BTreeMap<(SourceKind, String), String>,
}

impl InMemoryRecordSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_partition(
        mut self,
        kind: SourceKind,
        name: impl Into<String>,
        csv_body: impl Into<String>,
    ) -> Self {
        self.insert(kind, name, csv_body);
        self
    }

    pub fn insert(&mut self, kind: SourceKind, name: impl Into<String>, csv_body: impl Into<String>) {
        self.partitions.insert((kind, name.into()), csv_body.into());
    }
}

impl RecordSource for InMemoryRecordSource {
    fn list_partitions(&self, kind: SourceKind) -> Result<Vec<PartitionRef>, RecordStoreError> {
        Ok(self
            .partitions
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(k, name)| PartitionRef::new(*k, name.clone()))
            .collect())
    }

    fn read_partition(&self, partition: &PartitionRef) -> Result<PartitionLoad, RecordStoreError> {
        Ok(self
            .partitions
            .get(&(partition.kind, partition.name.clone()))
            .cloned()
            .map(PartitionLoad::Loaded)
            .unwrap_or(PartitionLoad::Absent))
    }
}

pub fn partition_date(name: &str) -> Option<NaiveDate> {
    let bytes = name.as_bytes();
    if bytes.len() < DATE_TOKEN_LEN {
        return None;
    }
    (0..=bytes.len() - DATE_TOKEN_LEN).find_map(|start| {
        let window = &bytes[start..start + DATE_TOKEN_LEN];
        let shaped = window.iter().enumerate().all(|(idx, b)| match idx {
            4 | 7 => *b == b'-',
            _ => b.is_ascii_digit(),
        });
        if !shaped {
            return None;
        }
        let token = std::str::from_utf8(window).ok()?;
        NaiveDate::parse_from_str(token, "%Y-%m-%d").ok()
    })
}

pub fn read_new_records<T, S>(
    source: &S,
    kind: SourceKind,
    processed: &BTreeSet<NaiveDate>,
    retry_policy: &RetryPolicy,
) -> Result<SourceBatch<T>, RecordStoreError>
where
    T: CsvRecord,
    S: RecordSource + ?Sized,
{
    let partitions = retry(retry_policy, || source.list_partitions(kind))?;
    let mut report = ReadReport {
        partitions_listed: partitions.len() as u64,
        ..ReadReport::default()
    };

    info!(
        component = "record_store",
        event = "record_store.read.start",
        kind = kind.as_str(),
        partitions = partitions.len(),
        processed_dates = processed.len()
    );

    let mut rows = Vec::new();
    let mut seen_lines = HashSet::new();

    for partition in &partitions {
        if let Some(date) = partition.date {
            if processed.contains(&date) {
                report.partitions_skipped_processed += 1;
                debug!(
                    component = "record_store",
                    event = "record_store.partition.skipped",
                    kind = kind.as_str(),
                    partition = %partition.name,
                    date = %date
                );
                continue;
            }
        }

        let body = match retry(retry_policy, || source.read_partition(partition)) {
            Ok(PartitionLoad::Loaded(body)) => body,
            Ok(PartitionLoad::Absent) => {
                report.partitions_missing += 1;
                warn!(
                    component = "record_store",
                    event = "record_store.partition.missing",
                    kind = kind.as_str(),
                    partition = %partition.name
                );
                continue;
            }
            Err(err) => {
                report.partitions_unreadable += 1;
                warn!(
                    component = "record_store",
                    event = "record_store.partition.unreadable",
                    kind = kind.as_str(),
                    partition = %partition.name,
                    error = %err
                );
                continue;
            }
        };

        match parse_partition::<T>(&partition.name, &body, &mut seen_lines, &mut report) {
            Ok(mut parsed) => {
                report.partitions_read += 1;
                rows.append(&mut parsed);
            }
            Err(err) => {
                report.partitions_unreadable += 1;
                warn!(
                    component = "record_store",
                    event = "record_store.partition.unreadable",
                    kind = kind.as_str(),
                    partition = %partition.name,
                    error = %err
                );
            }
        }
    }

    info!(
        component = "record_store",
        event = "record_store.read.finish",
        kind = kind.as_str(),
        partitions_read = report.partitions_read,
        partitions_skipped_processed = report.partitions_skipped_processed,
        partitions_missing = report.partitions_missing,
        partitions_unreadable = report.partitions_unreadable,
        rows_read = report.rows_read,
        rows_rejected = report.rows_rejected,
        duplicate_rows_removed = report.duplicate_rows_removed
    );

    Ok(SourceBatch { rows, report })
}

fn parse_partition<T: CsvRecord>(
    partition: &str,
    body: &str,
    seen_lines: &mut HashSet<String>,
    report: &mut ReadReport,
) -> Result<Vec<T>, RecordStoreError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(body.as_bytes());

    let headers = reader
        .headers()
        .map_err(|source| RecordStoreError::Csv {
            partition: partition.to_string(),
            source,
        })?
        .clone();
    let columns = T::columns(&headers).map_err(|source| RecordStoreError::Header {
        partition: partition.to_string(),
        source,
    })?;

    let mut rows = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        // Data lines start after the header, on line 2.
        let line = idx + 2;
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                reject_row(report, partition, line, &err.to_string());
                continue;
            }
        };
        if is_blank(&record) {
            continue;
        }
        if !seen_lines.insert(line_key(&record)) {
            report.duplicate_rows_removed += 1;
            continue;
        }
        match T::parse(&record, &columns) {
            Ok(row) => {
                report.rows_read += 1;
                rows.push(row);
            }
            Err(err) => reject_row(report, partition, line, &err.to_string()),
        }
    }

    Ok(rows)
}

fn reject_row(report: &mut ReadReport, partition: &str, line: usize, reason: &str) {
    report.rows_rejected += 1;
    warn!(
        component = "record_store",
        event = "record_store.row.rejected",
        partition = partition,
        line = line,
        reason = reason
    );
}

fn is_blank(record: &StringRecord) -> bool {
    record.iter().all(|field| field.trim().is_empty())
}

fn line_key(record: &StringRecord) -> String {
    record.iter().collect::<Vec<_>>().join("\u{1f}")
}

pub(crate) fn retry<T, E>(
    policy: &RetryPolicy,
    mut f: impl FnMut() -> Result<T, E>,
) -> Result<T, E> {
    let mut attempt: u32 = 0;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= policy.max_retries => return Err(err),
            Err(_) => {
                attempt = attempt.saturating_add(1);
                let shift = attempt.saturating_sub(1).min(10);
                let factor = 1u64 << shift;
                let sleep_ms = policy.retry_backoff_ms.saturating_mul(factor);
                std::thread::sleep(std::time::Duration::from_millis(sleep_ms));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{ProductReference, VisitRecord};
    use std::cell::Cell;
    use tempfile::tempdir;

    const VISIT_HEADER: &str = "date,store_id,hour,visitors,sales\n";

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn partition_date_finds_embedded_token() {
        assert_eq!(
            partition_date("visits_2023-12-02.csv"),
            Some(date(2023, 12, 2))
        );
        assert_eq!(partition_date("products.csv"), None);
        assert_eq!(partition_date("visits_2023-13-40.csv"), None);
        assert_eq!(partition_date("x2024-02-29y"), Some(date(2024, 2, 29)));
    }

    #[test]
    fn processed_partitions_are_skipped_and_undated_ones_kept() {
        let source = InMemoryRecordSource::new()
            .with_partition(
                SourceKind::Visits,
                "data_2023-12-01.csv",
                format!("{VISIT_HEADER}2023-12-01,store_1,10,100,10\n"),
            )
            .with_partition(
                SourceKind::Visits,
                "data_2023-12-02.csv",
                format!("{VISIT_HEADER}2023-12-02,store_1,10,100,10\n"),
            )
            .with_partition(
                SourceKind::Visits,
                "late_arrivals.csv",
                format!("{VISIT_HEADER}2023-12-03,store_2,11,50,5\n"),
            );
        let processed = BTreeSet::from([date(2023, 12, 1)]);

        let batch: SourceBatch<VisitRecord> = read_new_records(
            &source,
            SourceKind::Visits,
            &processed,
            &RetryPolicy::no_backoff(0),
        )
        .unwrap();

        let dates: Vec<_> = batch.rows.iter().map(|row| row.date).collect();
        assert_eq!(dates, vec![date(2023, 12, 2), date(2023, 12, 3)]);
        assert_eq!(batch.report.partitions_skipped_processed, 1);
        assert_eq!(batch.report.partitions_read, 2);
    }

    #[test]
    fn malformed_rows_are_rejected_without_dropping_partition() {
        let body = format!(
            "{VISIT_HEADER}2023-12-02,store_1,10,100,10\n2023-12-02,store_1,ten,100,10\n2023-12-02,store_1,11,-4,3\n2023-12-02,store_1,10,100,10\n"
        );
        let source =
            InMemoryRecordSource::new().with_partition(SourceKind::Visits, "v_2023-12-02.csv", body);

        let batch: SourceBatch<VisitRecord> = read_new_records(
            &source,
            SourceKind::Visits,
            &BTreeSet::new(),
            &RetryPolicy::no_backoff(0),
        )
        .unwrap();

        assert_eq!(batch.rows.len(), 1);
        assert_eq!(batch.report.rows_rejected, 2);
        assert_eq!(batch.report.duplicate_rows_removed, 1);
    }

    #[test]
    fn partition_with_wrong_header_is_skipped_not_fatal() {
        let source = InMemoryRecordSource::new()
            .with_partition(SourceKind::Visits, "a_2023-12-02.csv", "foo,bar\n1,2\n")
            .with_partition(
                SourceKind::Visits,
                "b_2023-12-03.csv",
                format!("{VISIT_HEADER}2023-12-03,store_1,9,10,1\n"),
            );

        let batch: SourceBatch<VisitRecord> = read_new_records(
            &source,
            SourceKind::Visits,
            &BTreeSet::new(),
            &RetryPolicy::no_backoff(0),
        )
        .unwrap();

        assert_eq!(batch.rows.len(), 1);
        assert_eq!(batch.report.partitions_unreadable, 1);
    }

    #[test]
    fn missing_source_directory_yields_empty_batch() {
        let temp = tempdir().unwrap();
        let source = DirectoryRecordSource::new(temp.path());

        let batch: SourceBatch<ProductReference> = read_new_records(
            &source,
            SourceKind::Products,
            &BTreeSet::new(),
            &RetryPolicy::no_backoff(0),
        )
        .unwrap();

        assert!(batch.rows.is_empty());
        assert_eq!(batch.report, ReadReport::default());
    }

    #[test]
    fn directory_source_lists_only_csv_files_in_name_order() {
        let temp = tempdir().unwrap();
        let dir = temp.path().join("products");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("b.csv"), "product_id,cost,name\np2,2.0,B\n").unwrap();
        fs::write(dir.join("a.csv"), "product_id,cost,name\np1,1.0,A\n").unwrap();
        fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let source = DirectoryRecordSource::new(temp.path());
        let listed = source.list_partitions(SourceKind::Products).unwrap();
        let names: Vec<_> = listed.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["a.csv", "b.csv"]);

        let batch: SourceBatch<ProductReference> = read_new_records(
            &source,
            SourceKind::Products,
            &BTreeSet::new(),
            &RetryPolicy::no_backoff(0),
        )
        .unwrap();
        assert_eq!(batch.rows.len(), 2);
        assert_eq!(batch.rows[0].product_id, "p1");
    }

    #[test]
    fn retry_stops_after_max_retries() {
        let calls = Cell::new(0u32);
        let result: Result<(), &str> = retry(&RetryPolicy::no_backoff(2), || {
            calls.set(calls.get() + 1);
            Err("boom")
        });

        assert_eq!(result, Err("boom"));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn retry_returns_first_success() {
        let calls = Cell::new(0u32);
        let result: Result<u32, &str> = retry(&RetryPolicy::no_backoff(5), || {
            calls.set(calls.get() + 1);
            if calls.get() < 2 {
                Err("transient")
            } else {
                Ok(7)
            }
        });

        assert_eq!(result, Ok(7));
        assert_eq!(calls.get(), 2);
    }
}
