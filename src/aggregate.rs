//! Collapse corrected visits and sale lines into one row per (date, store).

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::anomaly::CorrectedVisit;
use crate::records::{ProductReference, SaleLineRecord};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StoreDayKey {
    pub date: NaiveDate,
    pub store_id: String,
}

impl StoreDayKey {
    pub fn new(date: NaiveDate, store_id: impl Into<String>) -> Self {
        Self {
            date,
            store_id: store_id.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VisitTotals {
    pub total_visitors: f64,
    pub total_transactions: u64,
    pub peak_hour_sales: Option<u8>,
    pub peak_hour_visitors: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SaleTotals {
    pub total_quantity: u64,
    pub total_revenue: f64,
    pub total_cost: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BestSeller {
    pub product_id: String,
    pub product_name: Option<String>,
    pub quantity: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyAggregate {
    pub date: NaiveDate,
    pub store_id: String,
    pub total_visitors: f64,
    pub total_transactions: u64,
    pub peak_hour_sales: Option<u8>,
    pub peak_hour_visitors: Option<u8>,
    pub total_quantity: u64,
    pub total_revenue: f64,
    pub total_cost: f64,
    pub best_selling_product_id: Option<String>,
    pub best_selling_product_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationReport {
    pub visit_groups: u64,
    pub sale_groups: u64,
    pub rows_out: u64,
    pub sale_lines_without_product: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProductCatalog {
    products: HashMap<String, ProductReference>,
}

impl ProductCatalog {
    pub fn new(products: impl IntoIterator<Item = ProductReference>) -> Self {
        let mut map = HashMap::new();
        for product in products {
            if let Some(previous) = map.insert(product.product_id.clone(), product) {
                debug!(
                    component = "aggregate",
                    event = "aggregate.catalog.duplicate_product",
                    product_id = %previous.product_id
                );
            }
        }
        Self { products: map }
    }

    pub fn get(&self, product_id: &str) -> Option<&ProductReference> {
        self.products.get(product_id)
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }
}

pub fn aggregate_visits(visits: &[CorrectedVisit]) -> BTreeMap<StoreDayKey, VisitTotals> {
    let mut groups: BTreeMap<StoreDayKey, Vec<&CorrectedVisit>> = BTreeMap::new();
    for visit in visits {
        groups
            .entry(StoreDayKey::new(visit.date, visit.store_id.clone()))
            .or_default()
            .push(visit);
    }

    groups
        .into_iter()
        .map(|(key, mut rows)| {
            rows.sort_by_key(|row| row.hour);
            let totals = VisitTotals {
                total_visitors: rows.iter().filter_map(|row| row.visitors).sum(),
                total_transactions: rows
                    .iter()
                    .filter_map(|row| row.sales)
                    .map(u64::from)
                    .sum(),
                peak_hour_sales: peak_hour(&rows, |row| row.sales.map(f64::from)),
                peak_hour_visitors: peak_hour(&rows, |row| row.visitors),
            };
            (key, totals)
        })
        .collect()
}

fn peak_hour(
    rows: &[&CorrectedVisit],
    value: impl Fn(&CorrectedVisit) -> Option<f64>,
) -> Option<u8> {
    let mut best: Option<(u8, f64)> = None;
    for row in rows {
        let Some(v) = value(*row) else {
            continue;
        };
        // Rows arrive hour-ascending; ties keep the earliest hour.
        match best {
            Some((_, current)) if v <= current => {}
            _ => best = Some((row.hour, v)),
        }
    }
    best.map(|(hour, _)| hour)
}

pub fn aggregate_sales(
    lines: &[SaleLineRecord],
    catalog: &ProductCatalog,
) -> (BTreeMap<StoreDayKey, SaleTotals>, u64) {
    let mut groups: BTreeMap<StoreDayKey, SaleTotals> = BTreeMap::new();
    let mut missing: BTreeMap<&str, u64> = BTreeMap::new();

    for line in lines {
        let totals = groups
            .entry(StoreDayKey::new(line.sale_date, line.store_id.clone()))
            .or_default();
        totals.total_quantity += u64::from(line.quantity);
        totals.total_revenue += line.sale_amount;
        match catalog.get(&line.product_id) {
            Some(product) => totals.total_cost += f64::from(line.quantity) * product.cost,
            None => *missing.entry(line.product_id.as_str()).or_default() += 1,
        }
    }

    for (product_id, lines) in &missing {
        warn!(
            component = "aggregate",
            event = "aggregate.sales.unknown_product",
            product_id = product_id,
            lines = lines
        );
    }

    (groups, missing.values().sum())
}

pub fn best_sellers(
    lines: &[SaleLineRecord],
    catalog: &ProductCatalog,
) -> BTreeMap<StoreDayKey, BestSeller> {
    let mut quantities: BTreeMap<StoreDayKey, BTreeMap<&str, u64>> = BTreeMap::new();
    for line in lines {
        *quantities
            .entry(StoreDayKey::new(line.sale_date, line.store_id.clone()))
            .or_default()
            .entry(line.product_id.as_str())
            .or_default() += u64::from(line.quantity);
    }

    quantities
        .into_iter()
        .filter_map(|(key, per_product)| {
            let mut best: Option<(&str, u64)> = None;
            // BTreeMap order: ties keep the smallest product id.
            for (product_id, quantity) in per_product {
                match best {
                    Some((_, current)) if quantity <= current => {}
                    _ => best = Some((product_id, quantity)),
                }
            }
            let (product_id, quantity) = best?;
            let product_name = catalog
                .get(product_id)
                .map(|product| product.name.clone());
            Some((
                key,
                BestSeller {
                    product_id: product_id.to_string(),
                    product_name,
                    quantity,
                },
            ))
        })
        .collect()
}

pub fn aggregate_daily(
    visits: &[CorrectedVisit],
    lines: &[SaleLineRecord],
    catalog: &ProductCatalog,
) -> (Vec<DailyAggregate>, AggregationReport) {
    let mut visit_totals = aggregate_visits(visits);
    let (mut sale_totals, sale_lines_without_product) = aggregate_sales(lines, catalog);
    let mut sellers = best_sellers(lines, catalog);

    let mut report = AggregationReport {
        visit_groups: visit_totals.len() as u64,
        sale_groups: sale_totals.len() as u64,
        rows_out: 0,
        sale_lines_without_product,
    };

    let keys: BTreeSet<StoreDayKey> = visit_totals
        .keys()
        .chain(sale_totals.keys())
        .cloned()
        .collect();

    let rows: Vec<DailyAggregate> = keys
        .into_iter()
        .map(|key| {
            let visits = visit_totals.remove(&key).unwrap_or_default();
            let sales = sale_totals.remove(&key).unwrap_or_default();
            let seller = sellers.remove(&key);
            DailyAggregate {
                date: key.date,
                store_id: key.store_id,
                total_visitors: visits.total_visitors,
                total_transactions: visits.total_transactions,
                peak_hour_sales: visits.peak_hour_sales,
                peak_hour_visitors: visits.peak_hour_visitors,
                total_quantity: sales.total_quantity,
                total_revenue: sales.total_revenue,
                total_cost: sales.total_cost,
                best_selling_product_id: seller.as_ref().map(|s| s.product_id.clone()),
                best_selling_product_name: seller.and_then(|s| s.product_name),
            }
        })
        .collect();

    report.rows_out = rows.len() as u64;
    info!(
        component = "aggregate",
        event = "aggregate.daily.finish",
        visit_groups = report.visit_groups,
        sale_groups = report.sale_groups,
        rows_out = report.rows_out,
        sale_lines_without_product = report.sale_lines_without_product
    );

    (rows, report)
}
