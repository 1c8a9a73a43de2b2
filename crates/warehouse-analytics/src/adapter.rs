//! Schema adapter: turns external row sources into engine tables.
//!
//! Two entry points:
//!
//! - [`load`] coerces text rows (CSV readers, JSON lines, database cursors
//!   rendered as text) against a declared schema.
//! - [`from_records`] takes typed entities implementing [`Record`], such as
//!   the warehouse domain types.
//!
//! Blank or null numeric and date fields become [`Value::Missing`], never zero.

use std::collections::HashMap;

use chrono::{NaiveDate, NaiveDateTime};
use tracing::debug;
use warehouse_domain::{CustomerDim, FactRow, ProductDim};

use crate::error::{AnalyticsError, Result};
use crate::table::{DATE_FORMAT, DataType, Row, Schema, Table, Value};

/// One raw input row: column name to optional text.
pub type RawRow = HashMap<String, Option<String>>;

/// Anything that can hand the engine a schema and raw rows.
pub trait RowSource {
    /// Declared schema of the rows this source yields
    fn schema(&self) -> &Schema;

    /// Raw rows in source order
    fn rows(&self) -> Box<dyn Iterator<Item = RawRow> + '_>;
}

/// Raw rows held in memory.
#[derive(Debug, Clone)]
pub struct MemorySource {
    schema: Schema,
    rows: Vec<RawRow>,
}

impl MemorySource {
    /// Rows are validated against `schema` when loaded, not here.
    pub fn new(schema: Schema, rows: Vec<RawRow>) -> Self {
        Self { schema, rows }
    }
}

impl RowSource for MemorySource {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn rows(&self) -> Box<dyn Iterator<Item = RawRow> + '_> {
        Box::new(self.rows.iter().cloned())
    }
}

/// Coerce raw rows into a table with the given schema.
///
/// Fails with `SchemaMismatch` when a row lacks a declared column or a value
/// cannot be coerced to its column type. Extra fields are ignored.
pub fn load<I>(schema: &Schema, rows: I) -> Result<Table>
where
    I: IntoIterator<Item = RawRow>,
{
    let mut out: Vec<Row> = Vec::new();
    for (row_idx, raw) in rows.into_iter().enumerate() {
        let mut row = Vec::with_capacity(schema.len());
        for column in schema.columns() {
            let field = raw.get(&column.name).ok_or_else(|| AnalyticsError::SchemaMismatch {
                row: row_idx,
                column: column.name.clone(),
                reason: "column missing from row".to_string(),
            })?;
            let value = coerce(field.as_deref(), column.data_type).map_err(|reason| {
                AnalyticsError::SchemaMismatch {
                    row: row_idx,
                    column: column.name.clone(),
                    reason,
                }
            })?;
            row.push(value);
        }
        out.push(row);
    }
    debug!(rows = out.len(), columns = schema.len(), "Loaded raw rows");
    Table::new(schema.clone(), out)
}

/// Load every row of a [`RowSource`].
pub fn load_source(source: &dyn RowSource) -> Result<Table> {
    load(source.schema(), source.rows())
}

/// Coerce one raw field to `data_type`.
pub fn coerce(raw: Option<&str>, data_type: DataType) -> std::result::Result<Value, String> {
    let Some(raw) = raw else {
        return Ok(Value::Missing);
    };
    let text = raw.trim();
    match data_type {
        DataType::String => Ok(Value::String(raw.to_string())),
        _ if text.is_empty() => Ok(Value::Missing),
        DataType::Integer => text
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| format!("'{text}' is not an integer")),
        DataType::Float => match text.parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(Value::Float(v)),
            Ok(_) => Err(format!("'{text}' is not a finite number")),
            Err(_) => Err(format!("'{text}' is not a number")),
        },
        DataType::Date => parse_date(text)
            .map(Value::Date)
            .ok_or_else(|| format!("'{text}' is not a date")),
    }
}

fn parse_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text, DATE_FORMAT)
        .or_else(|_| NaiveDate::parse_from_str(text, "%Y/%m/%d"))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
                .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S"))
                .ok()
                .map(|ts| ts.date())
        })
}

// =============================================================================
// TYPED RECORDS
// =============================================================================

/// Typed entity with a fixed schema.
pub trait Record {
    /// Schema every record of this type maps onto
    fn schema() -> Schema;

    /// Values in schema order
    fn into_row(self) -> Row;
}

/// Build a table from typed records.
pub fn from_records<R, I>(records: I) -> Result<Table>
where
    R: Record,
    I: IntoIterator<Item = R>,
{
    let rows: Vec<Row> = records.into_iter().map(Record::into_row).collect();
    Table::new(R::schema(), rows)
}

/// Schema of the sales fact table.
pub fn fact_schema() -> Schema {
    Schema::declared(&[
        ("order_number", DataType::String),
        ("product_key", DataType::Integer),
        ("customer_key", DataType::Integer),
        ("order_date", DataType::Date),
        ("shipping_date", DataType::Date),
        ("due_date", DataType::Date),
        ("sales_amount", DataType::Float),
        ("quantity", DataType::Integer),
        ("price", DataType::Float),
    ])
}

/// Schema of the product dimension.
pub fn product_schema() -> Schema {
    Schema::declared(&[
        ("product_key", DataType::Integer),
        ("product_id", DataType::Integer),
        ("product_number", DataType::String),
        ("product_name", DataType::String),
        ("category", DataType::String),
        ("subcategory", DataType::String),
        ("product_line", DataType::String),
        ("cost", DataType::Float),
        ("start_date", DataType::Date),
    ])
}

/// Schema of the customer dimension.
pub fn customer_schema() -> Schema {
    Schema::declared(&[
        ("customer_key", DataType::Integer),
        ("customer_id", DataType::Integer),
        ("customer_number", DataType::String),
        ("first_name", DataType::String),
        ("last_name", DataType::String),
        ("country", DataType::String),
        ("marital_status", DataType::String),
        ("gender", DataType::String),
        ("birthdate", DataType::Date),
        ("create_date", DataType::Date),
    ])
}

impl Record for FactRow {
    fn schema() -> Schema {
        fact_schema()
    }

    fn into_row(self) -> Row {
        vec![
            self.order_number.into(),
            self.product_key.into(),
            self.customer_key.into(),
            self.order_date.into(),
            self.shipping_date.into(),
            self.due_date.into(),
            self.sales_amount.into(),
            self.quantity.into(),
            self.price.into(),
        ]
    }
}

impl Record for ProductDim {
    fn schema() -> Schema {
        product_schema()
    }

    fn into_row(self) -> Row {
        vec![
            self.product_key.into(),
            self.product_id.into(),
            self.product_number.into(),
            self.product_name.into(),
            self.category.into(),
            self.subcategory.into(),
            self.product_line.into(),
            self.cost.into(),
            self.start_date.into(),
        ]
    }
}

impl Record for CustomerDim {
    fn schema() -> Schema {
        customer_schema()
    }

    fn into_row(self) -> Row {
        vec![
            self.customer_key.into(),
            self.customer_id.into(),
            self.customer_number.into(),
            self.first_name.into(),
            self.last_name.into(),
            self.country.into(),
            self.marital_status.into(),
            self.gender.into(),
            self.birthdate.into(),
            self.create_date.into(),
        ]
    }
}
