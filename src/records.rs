//! Typed input records and their validated construction from CSV rows.

use chrono::{NaiveDate, NaiveTime};
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_HOUR: u8 = 23;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RecordError {
    #[error("required column {column} is missing from the header")]
    MissingColumn { column: &'static str },
    #[error("required field {field} is empty")]
    MissingField { field: &'static str },
    #[error("failed to parse field {field} value '{value}'")]
    ParseField { field: &'static str, value: String },
    #[error("field {field} value '{value}' is out of range")]
    OutOfRange { field: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitRecord {
    pub date: NaiveDate,
    pub store_id: String,
    pub hour: u8,
    pub visitor_count: Option<u32>,
    pub sale_count: Option<u32>,
}

impl VisitRecord {
    pub fn new(
        date: NaiveDate,
        store_id: impl Into<String>,
        hour: u8,
        visitor_count: Option<u32>,
        sale_count: Option<u32>,
    ) -> Result<Self, RecordError> {
        let store_id = store_id.into();
        if store_id.trim().is_empty() {
            return Err(RecordError::MissingField { field: "store_id" });
        }
        if hour > MAX_HOUR {
            return Err(RecordError::OutOfRange {
                field: "hour",
                value: hour.to_string(),
            });
        }
        Ok(Self {
            date,
            store_id,
            hour,
            visitor_count,
            sale_count,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleLineRecord {
    pub sale_id: String,
    pub product_id: String,
    pub store_id: String,
    pub quantity: u32,
    pub sale_amount: f64,
    pub sale_date: NaiveDate,
    pub sale_time: NaiveTime,
}

impl SaleLineRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sale_id: impl Into<String>,
        product_id: impl Into<String>,
        store_id: impl Into<String>,
        quantity: u32,
        sale_amount: f64,
        sale_date: NaiveDate,
        sale_time: NaiveTime,
    ) -> Result<Self, RecordError> {
        let sale_id = non_empty(sale_id.into(), "sale_id")?;
        let product_id = non_empty(product_id.into(), "product_id")?;
        let store_id = non_empty(store_id.into(), "store_id")?;
        if quantity == 0 {
            return Err(RecordError::OutOfRange {
                field: "quantity",
                value: quantity.to_string(),
            });
        }
        if !sale_amount.is_finite() || sale_amount < 0.0 {
            return Err(RecordError::OutOfRange {
                field: "sale_amount",
                value: sale_amount.to_string(),
            });
        }
        Ok(Self {
            sale_id,
            product_id,
            store_id,
            quantity,
            sale_amount,
            sale_date,
            sale_time,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductReference {
    pub product_id: String,
    pub cost: f64,
    pub name: String,
}

impl ProductReference {
    pub fn new(
        product_id: impl Into<String>,
        cost: f64,
        name: impl Into<String>,
    ) -> Result<Self, RecordError> {
        let product_id = non_empty(product_id.into(), "product_id")?;
        if !cost.is_finite() || cost < 0.0 {
            return Err(RecordError::OutOfRange {
                field: "cost",
                value: cost.to_string(),
            });
        }
        Ok(Self {
            product_id,
            cost,
            name: name.into(),
        })
    }
}

pub trait CsvRecord: Sized {
    type Columns;

    fn columns(headers: &StringRecord) -> Result<Self::Columns, RecordError>;

    fn parse(record: &StringRecord, columns: &Self::Columns) -> Result<Self, RecordError>;
}

#[derive(Debug, Clone, Copy)]
pub struct VisitColumns {
    date: usize,
    store_id: usize,
    hour: usize,
    visitors: usize,
    sales: usize,
}

impl CsvRecord for VisitRecord {
    type Columns = VisitColumns;

    fn columns(headers: &StringRecord) -> Result<VisitColumns, RecordError> {
        Ok(VisitColumns {
            date: require_column(headers, "date", &["date"])?,
            store_id: require_column(headers, "store_id", &["store_id"])?,
            hour: require_column(headers, "hour", &["hour"])?,
            visitors: require_column(headers, "visitors", &["visitors", "visitor_count"])?,
            sales: require_column(headers, "sales", &["sales", "sale_count"])?,
        })
    }

    fn parse(record: &StringRecord, cols: &VisitColumns) -> Result<Self, RecordError> {
        let hour = parse_required::<u8>(record, cols.hour, "hour")?;
        VisitRecord::new(
            parse_date(record, cols.date, "date")?,
            required_text(record, cols.store_id, "store_id")?,
            hour,
            parse_count(record, cols.visitors, "visitors")?,
            parse_count(record, cols.sales, "sales")?,
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SaleLineColumns {
    sale_id: usize,
    product_id: usize,
    store_id: usize,
    quantity: usize,
    sale_amount: usize,
    sale_date: usize,
    sale_time: usize,
}

impl CsvRecord for SaleLineRecord {
    type Columns = SaleLineColumns;

    fn columns(headers: &StringRecord) -> Result<SaleLineColumns, RecordError> {
        Ok(SaleLineColumns {
            sale_id: require_column(headers, "sale_id", &["sale_id"])?,
            product_id: require_column(headers, "product_id", &["product_id"])?,
            store_id: require_column(headers, "store_id", &["store_id"])?,
            quantity: require_column(headers, "quantity", &["quantity"])?,
            sale_amount: require_column(headers, "sale_amount", &["sale_amount"])?,
            sale_date: require_column(headers, "sale_date", &["sale_date"])?,
            sale_time: require_column(headers, "sale_time", &["sale_time"])?,
        })
    }

    fn parse(record: &StringRecord, cols: &SaleLineColumns) -> Result<Self, RecordError> {
        SaleLineRecord::new(
            required_text(record, cols.sale_id, "sale_id")?,
            required_text(record, cols.product_id, "product_id")?,
            required_text(record, cols.store_id, "store_id")?,
            parse_quantity(record, cols.quantity)?,
            parse_required::<f64>(record, cols.sale_amount, "sale_amount")?,
            parse_date(record, cols.sale_date, "sale_date")?,
            parse_time(record, cols.sale_time, "sale_time")?,
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProductColumns {
    product_id: usize,
    cost: usize,
    name: Option<usize>,
}

impl CsvRecord for ProductReference {
    type Columns = ProductColumns;

    fn columns(headers: &StringRecord) -> Result<ProductColumns, RecordError> {
        Ok(ProductColumns {
            product_id: require_column(headers, "product_id", &["product_id", "id"])?,
            cost: require_column(headers, "cost", &["cost"])?,
            name: find_column(headers, &["name"]),
        })
    }

    fn parse(record: &StringRecord, cols: &ProductColumns) -> Result<Self, RecordError> {
        let name = cols
            .name
            .and_then(|idx| record.get(idx))
            .map(|raw| raw.trim().to_string())
            .unwrap_or_default();
        ProductReference::new(
            required_text(record, cols.product_id, "product_id")?,
            parse_required::<f64>(record, cols.cost, "cost")?,
            name,
        )
    }
}

fn find_column(headers: &StringRecord, names: &[&str]) -> Option<usize> {
    headers.iter().position(|header| {
        let header = header.trim();
        names.iter().any(|name| header.eq_ignore_ascii_case(name))
    })
}

fn require_column(
    headers: &StringRecord,
    column: &'static str,
    names: &[&str],
) -> Result<usize, RecordError> {
    find_column(headers, names).ok_or(RecordError::MissingColumn { column })
}

fn raw_field(record: &StringRecord, idx: usize) -> Option<&str> {
    record
        .get(idx)
        .map(str::trim)
        .filter(|raw| !raw.is_empty() && !raw.eq_ignore_ascii_case("null"))
}

fn required_text(
    record: &StringRecord,
    idx: usize,
    field: &'static str,
) -> Result<String, RecordError> {
    raw_field(record, idx)
        .map(str::to_string)
        .ok_or(RecordError::MissingField { field })
}

fn parse_required<T: std::str::FromStr>(
    record: &StringRecord,
    idx: usize,
    field: &'static str,
) -> Result<T, RecordError> {
    let raw = raw_field(record, idx).ok_or(RecordError::MissingField { field })?;
    raw.parse::<T>().map_err(|_| RecordError::ParseField {
        field,
        value: raw.to_string(),
    })
}

fn parse_count(
    record: &StringRecord,
    idx: usize,
    field: &'static str,
) -> Result<Option<u32>, RecordError> {
    let Some(raw) = raw_field(record, idx) else {
        return Ok(None);
    };
    if let Ok(value) = raw.parse::<u32>() {
        return Ok(Some(value));
    }
    let value = raw.parse::<f64>().map_err(|_| RecordError::ParseField {
        field,
        value: raw.to_string(),
    })?;
    if value.is_nan() {
        return Ok(None);
    }
    if value < 0.0 || value.fract() != 0.0 || value > u32::MAX as f64 {
        return Err(RecordError::OutOfRange {
            field,
            value: raw.to_string(),
        });
    }
    Ok(Some(value as u32))
}

fn parse_quantity(record: &StringRecord, idx: usize) -> Result<u32, RecordError> {
    let raw = raw_field(record, idx).ok_or(RecordError::MissingField { field: "quantity" })?;
    if raw.starts_with('-') {
        return Err(RecordError::OutOfRange {
            field: "quantity",
            value: raw.to_string(),
        });
    }
    raw.parse::<u32>().map_err(|_| RecordError::ParseField {
        field: "quantity",
        value: raw.to_string(),
    })
}

fn parse_date(
    record: &StringRecord,
    idx: usize,
    field: &'static str,
) -> Result<NaiveDate, RecordError> {
    let raw = raw_field(record, idx).ok_or(RecordError::MissingField { field })?;
    // Timestamps such as "2024-03-01 00:00:00" or "2024-03-01T00:00:00" keep only the date part.
    let date_part = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").map_err(|_| RecordError::ParseField {
        field,
        value: raw.to_string(),
    })
}

fn parse_time(
    record: &StringRecord,
    idx: usize,
    field: &'static str,
) -> Result<NaiveTime, RecordError> {
    let raw = raw_field(record, idx).ok_or(RecordError::MissingField { field })?;
    NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .map_err(|_| RecordError::ParseField {
            field,
            value: raw.to_string(),
        })
}

fn non_empty(value: String, field: &'static str) -> Result<String, RecordError> {
    if value.trim().is_empty() {
        Err(RecordError::MissingField { field })
    } else {
        Ok(value)
    }
}
