//! Ratio metrics over aggregated and rolling fields.
//!
//! Every division checks that both operands are present and the denominator
//! is positive; otherwise the field is `None`. Results are rounded to two
//! decimals.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::metrics_store::DailyStoreMetric;
use crate::rolling::{round2, weekday_name, RolledDay};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct KpiInputs {
    pub total_visitors: Option<f64>,
    pub total_transactions: Option<f64>,
    pub total_revenue: Option<f64>,
    pub total_cost: Option<f64>,
    pub avg_visitors_last_4_weeks: Option<f64>,
    pub avg_sales_last_4_weeks: Option<f64>,
    pub avg_revenue_last_4_weeks: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Kpis {
    pub conversion_rate: Option<f64>,
    pub avg_transaction_value: Option<f64>,
    pub revenue_per_visitor: Option<f64>,
    pub total_margin: Option<f64>,
    pub margin_per_visitor: Option<f64>,
    pub visitors_variation_vs_avg_4w_percent: Option<f64>,
    pub transactions_variation_vs_avg_4w_percent: Option<f64>,
    pub revenue_variation_vs_avg_4w_percent: Option<f64>,
    pub transactions_amount_variation_vs_avg_4w_percent: Option<f64>,
}

pub fn derive_kpis(inputs: &KpiInputs) -> Kpis {
    let margin = match (inputs.total_revenue, inputs.total_cost) {
        (Some(revenue), Some(cost)) => Some(revenue - cost),
        _ => None,
    };
    let avg_transaction_value = divide(inputs.total_revenue, inputs.total_transactions);
    let expected_transaction_value =
        divide(inputs.avg_revenue_last_4_weeks, inputs.avg_sales_last_4_weeks);

    Kpis {
        conversion_rate: divide(inputs.total_transactions, inputs.total_visitors)
            .map(|v| round2(v * 100.0)),
        avg_transaction_value: avg_transaction_value.map(round2),
        revenue_per_visitor: divide(inputs.total_revenue, inputs.total_visitors).map(round2),
        total_margin: margin.map(round2),
        margin_per_visitor: divide(margin, inputs.total_visitors).map(round2),
        visitors_variation_vs_avg_4w_percent: variation(
            inputs.total_visitors,
            inputs.avg_visitors_last_4_weeks,
        ),
        transactions_variation_vs_avg_4w_percent: variation(
            inputs.total_transactions,
            inputs.avg_sales_last_4_weeks,
        ),
        revenue_variation_vs_avg_4w_percent: variation(
            inputs.total_revenue,
            inputs.avg_revenue_last_4_weeks,
        ),
        transactions_amount_variation_vs_avg_4w_percent: variation(
            avg_transaction_value,
            expected_transaction_value,
        ),
    }
}

pub fn variation(current: Option<f64>, average: Option<f64>) -> Option<f64> {
    let average = average.filter(|avg| avg.is_finite() && *avg > 0.0)?;
    let current = current.filter(|value| value.is_finite())?;
    Some(round2((current - average) * 100.0 / average))
}

fn divide(numerator: Option<f64>, denominator: Option<f64>) -> Option<f64> {
    let denominator = denominator.filter(|den| den.is_finite() && *den > 0.0)?;
    let numerator = numerator.filter(|num| num.is_finite())?;
    Some(numerator / denominator)
}

pub fn derive_metrics(rows: Vec<RolledDay>) -> Vec<DailyStoreMetric> {
    let out: Vec<DailyStoreMetric> = rows.into_iter().map(metric_from_rolled).collect();

    let undefined_conversion = out.iter().filter(|m| m.conversion_rate.is_none()).count();
    info!(
        component = "kpi",
        event = "kpi.derive.finish",
        rows = out.len(),
        rows_without_conversion_rate = undefined_conversion
    );

    out
}

fn metric_from_rolled(row: RolledDay) -> DailyStoreMetric {
    let RolledDay {
        aggregate,
        day_of_week,
        rolling,
    } = row;

    let kpis = derive_kpis(&KpiInputs {
        total_visitors: Some(aggregate.total_visitors),
        total_transactions: Some(aggregate.total_transactions as f64),
        total_revenue: Some(aggregate.total_revenue),
        total_cost: Some(aggregate.total_cost),
        avg_visitors_last_4_weeks: rolling.avg_visitors,
        avg_sales_last_4_weeks: rolling.avg_transactions,
        avg_revenue_last_4_weeks: rolling.avg_revenue,
    });

    DailyStoreMetric {
        date: aggregate.date,
        day_of_week: weekday_name(day_of_week).to_string(),
        store_id: aggregate.store_id,
        total_visitors: round2(aggregate.total_visitors),
        avg_visitors_last_4_weeks: rolling.avg_visitors,
        visitors_variation_vs_avg_4w_percent: kpis.visitors_variation_vs_avg_4w_percent,
        total_transactions: aggregate.total_transactions,
        avg_sales_last_4_weeks: rolling.avg_transactions,
        transactions_variation_vs_avg_4w_percent: kpis.transactions_variation_vs_avg_4w_percent,
        total_quantity: aggregate.total_quantity,
        best_selling_product_id: aggregate.best_selling_product_id,
        best_selling_product_name: aggregate.best_selling_product_name,
        total_revenue: round2(aggregate.total_revenue),
        avg_revenue_last_4_weeks: rolling.avg_revenue,
        revenue_variation_vs_avg_4w_percent: kpis.revenue_variation_vs_avg_4w_percent,
        total_cost: round2(aggregate.total_cost),
        total_margin: kpis.total_margin,
        conversion_rate: kpis.conversion_rate,
        avg_transaction_value: kpis.avg_transaction_value,
        transactions_amount_variation_vs_avg_4w_percent: kpis
            .transactions_amount_variation_vs_avg_4w_percent,
        revenue_per_visitor: kpis.revenue_per_visitor,
        margin_per_visitor: kpis.margin_per_visitor,
        peak_hour_sales: aggregate.peak_hour_sales,
        peak_hour_visitors: aggregate.peak_hour_visitors,
    }
}
