//! In-memory tabular representation shared by every engine stage.
//!
//! A [`Table`] is a declared [`Schema`] plus an ordered sequence of rows.
//! Every row carries exactly the declared columns and each cell is either
//! [`Value::Missing`] or a value of the declared [`DataType`]. Tables are
//! immutable: pipeline stages read them by reference and return new tables.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::NaiveDate;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Serialize, Serializer};

use crate::error::{AnalyticsError, Result};

/// Date format used for parsing and serialization.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// 64-bit signed integer
    Integer,
    /// 64-bit float
    Float,
    /// UTF-8 text
    String,
    /// Calendar date without time zone
    Date,
}

impl DataType {
    /// Lowercase type name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Float => "float",
            Self::String => "string",
            Self::Date => "date",
        }
    }

    /// Integer or float.
    #[must_use]
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Integer | Self::Float)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// VALUE
// =============================================================================

/// A single typed cell. `Missing` is the NULL sentinel and is never treated
/// as zero.
#[derive(Debug, Clone, Default)]
pub enum Value {
    /// Absent value
    #[default]
    Missing,
    /// Integer cell
    Integer(i64),
    /// Float cell
    Float(f64),
    /// Text cell
    String(String),
    /// Date cell
    Date(NaiveDate),
}

impl Value {
    /// True for the `Missing` sentinel.
    #[must_use]
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }

    /// Type of a present value; `None` for `Missing`.
    #[must_use]
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Self::Missing => None,
            Self::Integer(_) => Some(DataType::Integer),
            Self::Float(_) => Some(DataType::Float),
            Self::String(_) => Some(DataType::String),
            Self::Date(_) => Some(DataType::Date),
        }
    }

    /// Numeric value as a float; `None` for non-numeric or missing values.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer value; `None` for floats rather than truncating.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Text of a string value.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    /// Date of a date value.
    #[must_use]
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Date(v) => Some(*v),
            _ => None,
        }
    }

    /// Total order used by sorting and window evaluation.
    ///
    /// `Missing` sorts first; integers and floats compare numerically with
    /// each other.
    #[must_use]
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Integer(a), Self::Integer(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b),
            (Self::Integer(a), Self::Float(b)) => (*a as f64).total_cmp(b),
            (Self::Float(a), Self::Integer(b)) => a.total_cmp(&(*b as f64)),
            (Self::String(a), Self::String(b)) => a.cmp(b),
            (Self::Date(a), Self::Date(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Self::Missing => 0,
            Self::Integer(_) | Self::Float(_) => 1,
            Self::String(_) => 2,
            Self::Date(_) => 3,
        }
    }

    /// Bit pattern used for float equality and hashing: `-0.0` folds into
    /// `0.0` and all NaNs are one value.
    fn float_key(v: f64) -> u64 {
        if v == 0.0 {
            0.0_f64.to_bits()
        } else if v.is_nan() {
            f64::NAN.to_bits()
        } else {
            v.to_bits()
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Missing, Self::Missing) => true,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => Self::float_key(*a) == Self::float_key(*b),
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Date(a), Self::Date(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Missing => {}
            Self::Integer(v) => v.hash(state),
            Self::Float(v) => Self::float_key(*v).hash(state),
            Self::String(v) => v.hash(state),
            Self::Date(v) => v.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => f.write_str("NULL"),
            Self::Integer(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(v) => f.write_str(v),
            Self::Date(v) => write!(f, "{}", v.format(DATE_FORMAT)),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Missing => serializer.serialize_none(),
            Self::Integer(v) => serializer.serialize_i64(*v),
            Self::Float(v) => serializer.serialize_f64(*v),
            Self::String(v) => serializer.serialize_str(v),
            Self::Date(v) => serializer.collect_str(&v.format(DATE_FORMAT)),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Self::Date(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Missing, Into::into)
    }
}

// =============================================================================
// SCHEMA
// =============================================================================

/// A named, typed column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Column name, unique within a schema
    pub name: String,
    /// Declared type; cells are this type or `Missing`
    pub data_type: DataType,
}

impl Column {
    /// Column `name` of type `data_type`.
    pub fn new(name: &str, data_type: DataType) -> Self {
        Self {
            name: name.to_string(),
            data_type,
        }
    }
}

/// Ordered column declarations with unique names.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Schema {
    columns: Vec<Column>,
}

impl Schema {
    /// Build a schema, rejecting duplicate column names.
    pub fn new(columns: Vec<Column>) -> Result<Self> {
        for (i, column) in columns.iter().enumerate() {
            if columns[..i].iter().any(|c| c.name == column.name) {
                return Err(AnalyticsError::InvalidParameter(format!(
                    "duplicate column '{}'",
                    column.name
                )));
            }
        }
        Ok(Self { columns })
    }

    /// Schema from `(name, type)` pairs, rejecting duplicate names.
    pub fn from_pairs(pairs: &[(&str, DataType)]) -> Result<Self> {
        Self::new(pairs.iter().map(|(n, t)| Column::new(n, *t)).collect())
    }

    /// Schema for a fixed column list written in source. Names must be unique.
    pub(crate) fn declared(pairs: &[(&str, DataType)]) -> Self {
        let columns: Vec<Column> = pairs.iter().map(|(n, t)| Column::new(n, *t)).collect();
        debug_assert!(Self::new(columns.clone()).is_ok());
        Self { columns }
    }

    /// Columns in declaration order.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// No columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Column names in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Index of `name`, if present. See [`Schema::index_of`] for the erroring form.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Index of `name`, or `UnresolvedGroupKey`.
    pub fn index_of(&self, name: &str) -> Result<usize> {
        self.position(name)
            .ok_or_else(|| AnalyticsError::unresolved(name))
    }

    /// Column named `name`, or `UnresolvedGroupKey`.
    pub fn column(&self, name: &str) -> Result<&Column> {
        self.index_of(name).map(|i| &self.columns[i])
    }

    /// Declared type of `name`.
    pub fn data_type(&self, name: &str) -> Result<DataType> {
        self.column(name).map(|c| c.data_type)
    }

    /// Copy of this schema with `column` appended.
    pub fn with_column(&self, column: Column) -> Result<Self> {
        let mut columns = self.columns.clone();
        columns.push(column);
        Self::new(columns)
    }
}

// =============================================================================
// TABLE
// =============================================================================

/// Positional row; values line up with the table schema.
pub type Row = Vec<Value>;

/// Immutable schema-checked table.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    schema: Arc<Schema>,
    rows: Vec<Row>,
}

impl Table {
    /// Build a table, checking every row against the schema.
    ///
    /// Integer values in float columns are widened; anything else that does
    /// not match the declared type is a `SchemaMismatch`.
    pub fn new(schema: Schema, rows: Vec<Row>) -> Result<Self> {
        let mut checked = Vec::with_capacity(rows.len());
        for (row_idx, mut row) in rows.into_iter().enumerate() {
            if row.len() != schema.len() {
                return Err(AnalyticsError::SchemaMismatch {
                    row: row_idx,
                    column: schema
                        .columns()
                        .get(row.len())
                        .map_or_else(|| "<extra>".to_string(), |c| c.name.clone()),
                    reason: format!("expected {} values, found {}", schema.len(), row.len()),
                });
            }
            for (value, column) in row.iter_mut().zip(schema.columns()) {
                match (value.data_type(), column.data_type) {
                    (None, _) => {}
                    (Some(DataType::Integer), DataType::Float) => {
                        *value = Value::Float(value.as_f64().unwrap_or_default());
                    }
                    (Some(found), expected) if found == expected => {}
                    (Some(found), expected) => {
                        return Err(AnalyticsError::SchemaMismatch {
                            row: row_idx,
                            column: column.name.clone(),
                            reason: format!("expected {expected}, found {found}"),
                        });
                    }
                }
            }
            checked.push(row);
        }
        Ok(Self {
            schema: Arc::new(schema),
            rows: checked,
        })
    }

    /// Table with `schema` and no rows.
    pub fn empty(schema: Schema) -> Self {
        Self {
            schema: Arc::new(schema),
            rows: Vec::new(),
        }
    }

    /// Reuse an existing schema for rows already known to conform.
    pub(crate) fn with_rows(&self, rows: Vec<Row>) -> Self {
        Self {
            schema: Arc::clone(&self.schema),
            rows,
        }
    }

    /// Shared schema of every row.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Rows in table order.
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// No rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Column names in schema order.
    pub fn column_names(&self) -> Vec<&str> {
        self.schema.names().collect()
    }

    /// All values of one column, in row order.
    pub fn column(&self, name: &str) -> Result<Vec<&Value>> {
        let idx = self.schema.index_of(name)?;
        Ok(self.rows.iter().map(|r| &r[idx]).collect())
    }

    /// Cell at `row` in column `name`. Out-of-range rows are an
    /// `InvalidParameter` error.
    pub fn value(&self, row: usize, name: &str) -> Result<&Value> {
        let idx = self.schema.index_of(name)?;
        self.rows
            .get(row)
            .map(|r| &r[idx])
            .ok_or_else(|| AnalyticsError::InvalidParameter(format!("row {row} out of bounds")))
    }

    /// Named views over each row.
    pub fn iter(&self) -> impl Iterator<Item = RowView<'_>> {
        self.rows.iter().map(|values| RowView {
            schema: &self.schema,
            values,
        })
    }
}

impl Serialize for Table {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.rows.len()))?;
        for row in self.iter() {
            seq.serialize_element(&row)?;
        }
        seq.end()
    }
}

/// Borrowed view of one row with by-name access.
#[derive(Debug, Clone, Copy)]
pub struct RowView<'a> {
    schema: &'a Schema,
    values: &'a [Value],
}

impl<'a> RowView<'a> {
    /// Cell in column `name`.
    pub fn get(&self, name: &str) -> Result<&'a Value> {
        self.schema.index_of(name).map(|i| &self.values[i])
    }

    /// Cells in schema order.
    pub fn values(&self) -> &'a [Value] {
        self.values
    }
}

impl Serialize for RowView<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (column, value) in self.schema.columns().iter().zip(self.values) {
            map.serialize_entry(&column.name, value)?;
        }
        map.end()
    }
}
