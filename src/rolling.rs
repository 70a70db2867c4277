//! Trailing same-weekday averages per store.

use std::collections::{BTreeMap, VecDeque};

use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::aggregate::DailyAggregate;

pub const DEFAULT_WINDOW: usize = 4;
pub const DEFAULT_HISTORY_WEEKS: u32 = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalDay {
    pub date: NaiveDate,
    pub store_id: String,
    pub total_visitors: f64,
    pub total_transactions: u64,
    pub total_revenue: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RollingAverages {
    pub avg_visitors: Option<f64>,
    pub avg_transactions: Option<f64>,
    pub avg_revenue: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolledDay {
    pub aggregate: DailyAggregate,
    pub day_of_week: Weekday,
    pub rolling: RollingAverages,
}

pub fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn history_window(new_min_date: NaiveDate, weeks: u32) -> (NaiveDate, NaiveDate) {
    let start = new_min_date
        .checked_sub_signed(ChronoDuration::weeks(i64::from(weeks)))
        .unwrap_or(NaiveDate::MIN);
    (start, new_min_date)
}

#[derive(Debug, Clone, Copy)]
struct Point {
    visitors: f64,
    transactions: f64,
    revenue: f64,
}

struct Entry {
    date: NaiveDate,
    point: Point,
    new_index: Option<usize>,
}

pub fn compute_rolling_averages(
    new_rows: Vec<DailyAggregate>,
    history: &[HistoricalDay],
    window: usize,
) -> Vec<RolledDay> {
    let window = window.max(1);
    let mut groups: BTreeMap<(String, u32), Vec<Entry>> = BTreeMap::new();

    for day in history {
        groups
            .entry((day.store_id.clone(), weekday_key(day.date)))
            .or_default()
            .push(Entry {
                date: day.date,
                point: Point {
                    visitors: day.total_visitors,
                    transactions: day.total_transactions as f64,
                    revenue: day.total_revenue,
                },
                new_index: None,
            });
    }
    for (idx, row) in new_rows.iter().enumerate() {
        groups
            .entry((row.store_id.clone(), weekday_key(row.date)))
            .or_default()
            .push(Entry {
                date: row.date,
                point: Point {
                    visitors: row.total_visitors,
                    transactions: row.total_transactions as f64,
                    revenue: row.total_revenue,
                },
                new_index: Some(idx),
            });
    }

    let mut averages = vec![RollingAverages::default(); new_rows.len()];
    for entries in groups.values_mut() {
        entries.sort_by_key(|entry| (entry.date, entry.new_index.is_some()));

        let mut trailing: VecDeque<Point> = VecDeque::with_capacity(window);
        for entry in entries.iter() {
            if let Some(idx) = entry.new_index {
                averages[idx] = if trailing.is_empty() {
                    averages_of(std::iter::once(&entry.point))
                } else {
                    averages_of(trailing.iter())
                };
            }
            trailing.push_back(entry.point);
            while trailing.len() > window {
                trailing.pop_front();
            }
        }
    }

    info!(
        component = "rolling",
        event = "rolling.compute.finish",
        new_rows = new_rows.len(),
        history_rows = history.len(),
        groups = groups.len(),
        window = window
    );

    new_rows
        .into_iter()
        .zip(averages)
        .map(|(aggregate, rolling)| RolledDay {
            day_of_week: aggregate.date.weekday(),
            aggregate,
            rolling,
        })
        .collect()
}

fn weekday_key(date: NaiveDate) -> u32 {
    date.weekday().num_days_from_monday()
}

fn averages_of<'a>(points: impl Iterator<Item = &'a Point> + Clone) -> RollingAverages {
    let count = points.clone().count() as f64;
    let mean = |f: fn(&Point) -> f64| round2(points.clone().map(f).sum::<f64>() / count);
    RollingAverages {
        avg_visitors: Some(mean(|p| p.visitors)),
        avg_transactions: Some(mean(|p| p.transactions)),
        avg_revenue: Some(mean(|p| p.revenue)),
    }
}
