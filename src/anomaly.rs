//! Per-store repair of implausible visitor counts.
//!
//! Sensor faults are assumed to show up as count explosions, never as
//! undercounts. Hours above the threshold get their visitor count rebuilt from
//! their sales using the store's sales/visitor ratio over plausible hours. This
//! is a ratio heuristic and makes no claim of statistical correctness.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::records::VisitRecord;

pub const DEFAULT_VISITOR_THRESHOLD: u32 = 5_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectedVisit {
    pub date: NaiveDate,
    pub store_id: String,
    pub hour: u8,
    pub visitors: Option<f64>,
    pub sales: Option<u32>,
    pub corrected: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorrectionReport {
    pub rows_in: u64,
    pub rows_dropped_all_null: u64,
    pub rows_corrected: u64,
    pub rows_uncorrectable: u64,
    pub stores: u64,
}

pub fn store_ratio<'a>(rows: impl IntoIterator<Item = &'a VisitRecord>, threshold: u32) -> f64 {
    let (visitors, sales) = rows
        .into_iter()
        .filter(|row| matches!(row.visitor_count, Some(v) if v > 0 && v <= threshold))
        .fold((0u64, 0u64), |(visitors, sales), row| {
            (
                visitors + u64::from(row.visitor_count.unwrap_or(0)),
                sales + u64::from(row.sale_count.unwrap_or(0)),
            )
        });

    if visitors == 0 {
        0.0
    } else {
        100.0 * sales as f64 / visitors as f64
    }
}

pub fn correct_visits(
    rows: Vec<VisitRecord>,
    threshold: u32,
) -> (Vec<CorrectedVisit>, CorrectionReport) {
    let mut report = CorrectionReport {
        rows_in: rows.len() as u64,
        ..CorrectionReport::default()
    };

    let mut by_store: BTreeMap<String, Vec<VisitRecord>> = BTreeMap::new();
    for row in rows {
        if row.visitor_count.is_none() && row.sale_count.is_none() {
            report.rows_dropped_all_null += 1;
            continue;
        }
        by_store.entry(row.store_id.clone()).or_default().push(row);
    }
    report.stores = by_store.len() as u64;

    let mut out = Vec::with_capacity(by_store.values().map(Vec::len).sum());
    for (store_id, store_rows) in by_store {
        let ratio = store_ratio(&store_rows, threshold);
        debug!(
            component = "anomaly",
            event = "anomaly.store.ratio",
            store_id = %store_id,
            ratio = ratio,
            rows = store_rows.len()
        );

        for row in store_rows {
            out.push(correct_row(row, ratio, threshold, &mut report));
        }
    }

    info!(
        component = "anomaly",
        event = "anomaly.correct.finish",
        rows_in = report.rows_in,
        rows_dropped_all_null = report.rows_dropped_all_null,
        rows_corrected = report.rows_corrected,
        rows_uncorrectable = report.rows_uncorrectable,
        stores = report.stores
    );

    (out, report)
}

fn correct_row(
    row: VisitRecord,
    ratio: f64,
    threshold: u32,
    report: &mut CorrectionReport,
) -> CorrectedVisit {
    let mut visit = CorrectedVisit {
        date: row.date,
        store_id: row.store_id,
        hour: row.hour,
        visitors: row.visitor_count.map(f64::from),
        sales: row.sale_count,
        corrected: false,
    };

    let Some(observed) = row.visitor_count.filter(|v| *v > threshold) else {
        return visit;
    };

    match row.sale_count {
        Some(sales) => {
            let rebuilt = f64::from(sales) * ratio;
            report.rows_corrected += 1;
            debug!(
                component = "anomaly",
                event = "anomaly.row.corrected",
                store_id = %visit.store_id,
                date = %visit.date,
                hour = visit.hour,
                observed = observed,
                corrected = rebuilt
            );
            visit.visitors = Some(rebuilt);
            visit.corrected = true;
        }
        None => {
            report.rows_uncorrectable += 1;
            warn!(
                component = "anomaly",
                event = "anomaly.row.uncorrectable",
                store_id = %visit.store_id,
                date = %visit.date,
                hour = visit.hour,
                observed = observed
            );
            visit.visitors = None;
        }
    }

    visit
}
