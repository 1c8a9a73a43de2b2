//! Aggregation pipeline: group-by aggregates, window functions and the
//! relational helpers (filter, sort, derive, project, join) reports are
//! composed from.
//!
//! Every function takes its input table by reference and returns a new one.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AnalyticsError, Result};
use crate::table::{Column, DataType, Row, RowView, Schema, Table, Value};

// =============================================================================
// AGGREGATION
// =============================================================================

/// Aggregate functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    /// Integer for integer sources, float otherwise
    Sum,
    /// Non-missing values, or rows when there is no source
    Count,
    /// Distinct non-missing values
    CountDistinct,
    /// Always float
    Avg,
    /// Smallest non-missing value
    Min,
    /// Largest non-missing value
    Max,
}

/// One aggregate output column.
///
/// `source` may only be omitted for `Count`, which then counts rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregate {
    /// Name of the derived column
    pub output: String,
    /// Function applied per group
    pub function: AggregateFunction,
    /// Input column
    pub source: Option<String>,
}

impl Aggregate {
    /// `function` over `source`, written to `output`.
    pub fn new(output: &str, function: AggregateFunction, source: &str) -> Self {
        Self {
            output: output.to_string(),
            function,
            source: Some(source.to_string()),
        }
    }

    /// Sum of non-missing values; `Missing` when there are none
    pub fn sum(output: &str, source: &str) -> Self {
        Self::new(output, AggregateFunction::Sum, source)
    }

    /// Non-missing values of `source`
    pub fn count(output: &str, source: &str) -> Self {
        Self::new(output, AggregateFunction::Count, source)
    }

    /// All rows of the group
    pub fn count_rows(output: &str) -> Self {
        Self {
            output: output.to_string(),
            function: AggregateFunction::Count,
            source: None,
        }
    }

    /// Distinct non-missing values of `source`
    pub fn count_distinct(output: &str, source: &str) -> Self {
        Self::new(output, AggregateFunction::CountDistinct, source)
    }

    /// Mean of non-missing values
    pub fn avg(output: &str, source: &str) -> Self {
        Self::new(output, AggregateFunction::Avg, source)
    }

    /// Smallest non-missing value
    pub fn min(output: &str, source: &str) -> Self {
        Self::new(output, AggregateFunction::Min, source)
    }

    /// Largest non-missing value
    pub fn max(output: &str, source: &str) -> Self {
        Self::new(output, AggregateFunction::Max, source)
    }
}

/// Group-by columns plus the aggregates computed per group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationSpec {
    /// Key columns; empty for a single whole-table group
    pub group_by: Vec<String>,
    /// Output columns after the keys, in order
    pub aggregates: Vec<Aggregate>,
}

impl AggregationSpec {
    /// Spec grouping by `group_by` with no aggregates yet.
    pub fn new(group_by: &[&str]) -> Self {
        Self {
            group_by: group_by.iter().map(|c| (*c).to_string()).collect(),
            aggregates: Vec::new(),
        }
    }

    /// Append an aggregate column.
    #[must_use]
    pub fn with(mut self, aggregate: Aggregate) -> Self {
        self.aggregates.push(aggregate);
        self
    }
}

struct AggregatePlan {
    function: AggregateFunction,
    source: Option<usize>,
    output_type: DataType,
}

fn numeric_source(schema: &Schema, column: &str) -> Result<DataType> {
    let data_type = schema.data_type(column)?;
    if data_type.is_numeric() {
        Ok(data_type)
    } else {
        Err(AnalyticsError::TypeMismatch {
            column: column.to_string(),
            expected: "numeric".to_string(),
            found: data_type.to_string(),
        })
    }
}

fn plan_aggregate(schema: &Schema, aggregate: &Aggregate) -> Result<AggregatePlan> {
    let source = match (&aggregate.source, aggregate.function) {
        (Some(column), _) => Some(column.as_str()),
        (None, AggregateFunction::Count) => None,
        (None, function) => {
            return Err(AnalyticsError::InvalidParameter(format!(
                "aggregate '{}' ({function:?}) needs a source column",
                aggregate.output
            )));
        }
    };

    let output_type = match (aggregate.function, source) {
        (AggregateFunction::Count | AggregateFunction::CountDistinct, Some(column)) => {
            schema.index_of(column)?;
            DataType::Integer
        }
        (AggregateFunction::Count | AggregateFunction::CountDistinct, None) => DataType::Integer,
        (AggregateFunction::Sum, Some(column)) => numeric_source(schema, column)?,
        (AggregateFunction::Avg, Some(column)) => {
            numeric_source(schema, column)?;
            DataType::Float
        }
        (AggregateFunction::Min | AggregateFunction::Max, Some(column)) => {
            schema.data_type(column)?
        }
        (_, None) => DataType::Integer,
    };

    Ok(AggregatePlan {
        function: aggregate.function,
        source: source.map(|c| schema.index_of(c)).transpose()?,
        output_type,
    })
}

/// Group `table` by the `group_by` columns and compute each aggregate over
/// the non-missing values of its source column.
///
/// Groups come out in first-appearance order; callers that need a specific
/// order sort afterwards.
pub fn aggregate(table: &Table, spec: &AggregationSpec) -> Result<Table> {
    let schema = table.schema();
    let key_idx = spec
        .group_by
        .iter()
        .map(|c| schema.index_of(c))
        .collect::<Result<Vec<_>>>()?;
    let plans = spec
        .aggregates
        .iter()
        .map(|a| plan_aggregate(schema, a))
        .collect::<Result<Vec<_>>>()?;

    let mut columns: Vec<Column> = key_idx
        .iter()
        .map(|&i| schema.columns()[i].clone())
        .collect();
    for (aggregate, plan) in spec.aggregates.iter().zip(&plans) {
        columns.push(Column::new(&aggregate.output, plan.output_type));
    }
    let out_schema = Schema::new(columns)?;

    let mut index: HashMap<Vec<Value>, usize> = HashMap::new();
    let mut groups: Vec<(Vec<Value>, Vec<usize>)> = Vec::new();
    for (row_idx, row) in table.rows().iter().enumerate() {
        let key: Vec<Value> = key_idx.iter().map(|&i| row[i].clone()).collect();
        let slot = *index.entry(key.clone()).or_insert_with(|| {
            groups.push((key, Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push(row_idx);
    }

    let rows: Vec<Row> = groups
        .into_iter()
        .map(|(mut key, members)| {
            for plan in &plans {
                let value = match plan.source {
                    Some(src) => evaluate(
                        plan.function,
                        plan.output_type,
                        &schema.columns()[src].name,
                        members.iter().map(|&r| &table.rows()[r][src]),
                    )?,
                    None => Value::Integer(members.len() as i64),
                };
                key.push(value);
            }
            Ok(key)
        })
        .collect::<Result<_>>()?;

    debug!(
        input_rows = table.len(),
        groups = rows.len(),
        keys = ?spec.group_by,
        "Aggregated table"
    );
    Table::new(out_schema, rows)
}

fn evaluate<'a>(
    function: AggregateFunction,
    output_type: DataType,
    column: &str,
    values: impl Iterator<Item = &'a Value>,
) -> Result<Value> {
    let present: Vec<&Value> = values.filter(|v| !v.is_missing()).collect();
    let value = match function {
        AggregateFunction::Count => Value::Integer(present.len() as i64),
        AggregateFunction::CountDistinct => {
            Value::Integer(present.iter().collect::<HashSet<_>>().len() as i64)
        }
        AggregateFunction::Sum | AggregateFunction::Avg => {
            let mut acc = Accumulator::new(output_type, column);
            for value in present {
                acc.add(value)?;
            }
            if function == AggregateFunction::Sum {
                acc.sum()
            } else {
                acc.avg()
            }
        }
        AggregateFunction::Min => present
            .into_iter()
            .min_by(|a, b| a.total_cmp(b))
            .cloned()
            .unwrap_or_default(),
        AggregateFunction::Max => present
            .into_iter()
            .max_by(|a, b| a.total_cmp(b))
            .cloned()
            .unwrap_or_default(),
    };
    Ok(value)
}

/// Arithmetic mean; callers guarantee a non-empty slice.
fn mean(values: &[f64]) -> f64 {
    use statrs::statistics::Statistics;
    values.iter().mean()
}

/// Sum and mean over a numeric column, skipping missing values.
///
/// Aggregate and window averages both read [`Accumulator::avg`], so a group
/// average and a partition average over the same values are bit-identical.
struct Accumulator<'a> {
    column: &'a str,
    integer: bool,
    int_sum: i64,
    float_sum: f64,
    values: Vec<f64>,
}

impl<'a> Accumulator<'a> {
    fn new(data_type: DataType, column: &'a str) -> Self {
        Self {
            column,
            integer: data_type == DataType::Integer,
            int_sum: 0,
            float_sum: 0.0,
            values: Vec::new(),
        }
    }

    fn add(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::Integer(v) => {
                if self.integer {
                    self.int_sum = self.int_sum.checked_add(*v).ok_or_else(|| {
                        AnalyticsError::IntegerOverflow {
                            column: self.column.to_string(),
                        }
                    })?;
                }
                self.float_sum += *v as f64;
                self.values.push(*v as f64);
            }
            Value::Float(v) => {
                self.float_sum += v;
                self.values.push(*v);
            }
            _ => {}
        }
        Ok(())
    }

    fn sum(&self) -> Value {
        match (self.values.len(), self.integer) {
            (0, _) => Value::Missing,
            (_, true) => Value::Integer(self.int_sum),
            (_, false) => Value::Float(self.float_sum),
        }
    }

    fn avg(&self) -> Value {
        if self.values.is_empty() {
            Value::Missing
        } else {
            Value::Float(mean(&self.values))
        }
    }
}

// =============================================================================
// WINDOWS
// =============================================================================

/// Window functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowFunction {
    /// Competition ranking: ties share a rank, the next rank skips
    Rank,
    /// Ties share a rank, the next distinct value gets rank + 1
    DenseRank,
    /// 1-based position; ties numbered in input order
    RowNumber,
    /// Sum from the partition start through the current row
    RunningSum,
    /// Average from the partition start through the current row
    RunningAvg,
    /// Source value n rows earlier in the partition
    Lag(usize),
    /// Partition total broadcast to every row
    TotalSum,
    /// Partition average broadcast to every row
    PartitionAvg,
}

impl WindowFunction {
    fn needs_source(self) -> bool {
        !matches!(self, Self::Rank | Self::DenseRank | Self::RowNumber)
    }
}

/// Sort key for windows and [`sort`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    /// Column to sort on
    pub column: String,
    /// Descending when set
    pub descending: bool,
}

impl SortKey {
    /// Ascending, missing values first.
    pub fn asc(column: &str) -> Self {
        Self {
            column: column.to_string(),
            descending: false,
        }
    }

    /// Descending, missing values last.
    pub fn desc(column: &str) -> Self {
        Self {
            column: column.to_string(),
            descending: true,
        }
    }
}

/// One derived window column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowExpr {
    /// Name of the derived column
    pub output: String,
    /// Function evaluated per partition
    pub function: WindowFunction,
    /// Input column
    pub source: Option<String>,
}

impl WindowExpr {
    /// `function` over `source`, written to `output`.
    pub fn new(output: &str, function: WindowFunction, source: Option<&str>) -> Self {
        Self {
            output: output.to_string(),
            function,
            source: source.map(str::to_string),
        }
    }

    /// Competition rank over the order keys.
    pub fn rank(output: &str) -> Self {
        Self::new(output, WindowFunction::Rank, None)
    }

    /// Dense rank over the order keys.
    pub fn dense_rank(output: &str) -> Self {
        Self::new(output, WindowFunction::DenseRank, None)
    }

    /// Row number within the partition.
    pub fn row_number(output: &str) -> Self {
        Self::new(output, WindowFunction::RowNumber, None)
    }

    /// Running sum of `source`.
    pub fn running_sum(output: &str, source: &str) -> Self {
        Self::new(output, WindowFunction::RunningSum, Some(source))
    }

    /// Running average of `source`.
    pub fn running_avg(output: &str, source: &str) -> Self {
        Self::new(output, WindowFunction::RunningAvg, Some(source))
    }

    /// Value of `source` `offset` rows earlier, `Missing` before that.
    pub fn lag(output: &str, source: &str, offset: usize) -> Self {
        Self::new(output, WindowFunction::Lag(offset), Some(source))
    }

    /// Partition total of `source`.
    pub fn total_sum(output: &str, source: &str) -> Self {
        Self::new(output, WindowFunction::TotalSum, Some(source))
    }

    /// Partition average of `source`.
    pub fn partition_avg(output: &str, source: &str) -> Self {
        Self::new(output, WindowFunction::PartitionAvg, Some(source))
    }
}

/// Partitioning, ordering and the window columns to derive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSpec {
    /// Empty means one partition over the whole table
    pub partition_by: Vec<String>,
    /// Applied after the partition keys
    pub order_by: Vec<SortKey>,
    /// Derived columns, appended in order
    pub exprs: Vec<WindowExpr>,
}

impl WindowSpec {
    /// Unpartitioned, unordered spec with no columns.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the partition columns.
    #[must_use]
    pub fn partition_by(mut self, columns: &[&str]) -> Self {
        self.partition_by = columns.iter().map(|c| (*c).to_string()).collect();
        self
    }

    /// Append an order key.
    #[must_use]
    pub fn order_by(mut self, key: SortKey) -> Self {
        self.order_by.push(key);
        self
    }

    /// Append a window column.
    #[must_use]
    pub fn with(mut self, expr: WindowExpr) -> Self {
        self.exprs.push(expr);
        self
    }
}

struct WindowPlan {
    function: WindowFunction,
    source: Option<usize>,
    source_name: String,
    output_type: DataType,
}

fn plan_window(schema: &Schema, expr: &WindowExpr) -> Result<WindowPlan> {
    let source = match (&expr.source, expr.function.needs_source()) {
        (Some(column), true) => Some(column.as_str()),
        (None, true) => {
            return Err(AnalyticsError::InvalidParameter(format!(
                "window column '{}' ({:?}) needs a source column",
                expr.output, expr.function
            )));
        }
        (_, false) => None,
    };

    let output_type = match (expr.function, source) {
        (WindowFunction::RunningSum | WindowFunction::TotalSum, Some(column)) => {
            numeric_source(schema, column)?
        }
        (WindowFunction::RunningAvg | WindowFunction::PartitionAvg, Some(column)) => {
            numeric_source(schema, column)?;
            DataType::Float
        }
        (WindowFunction::Lag(_), Some(column)) => schema.data_type(column)?,
        _ => DataType::Integer,
    };

    Ok(WindowPlan {
        function: expr.function,
        source: source.map(|c| schema.index_of(c)).transpose()?,
        source_name: source.unwrap_or_default().to_string(),
        output_type,
    })
}

fn compare_keys(a: &Row, b: &Row, keys: &[(usize, bool)]) -> Ordering {
    for &(idx, descending) in keys {
        let cmp = a[idx].total_cmp(&b[idx]);
        let cmp = if descending { cmp.reverse() } else { cmp };
        if cmp != Ordering::Equal {
            return cmp;
        }
    }
    Ordering::Equal
}

/// Row indices stably sorted by `keys`; equal keys keep input order.
fn sorted_indices(rows: &[Row], keys: &[(usize, bool)]) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..rows.len()).collect();
    indices.sort_by(|&a, &b| compare_keys(&rows[a], &rows[b], keys));
    indices
}

/// Add window columns to `table` without collapsing rows.
///
/// Rows are sorted by partition then order keys (stable, so equal keys fall
/// back to input order), each partition is scanned once per expression, and
/// the output keeps the input row order.
pub fn window(table: &Table, spec: &WindowSpec) -> Result<Table> {
    let schema = table.schema();
    let partition: Vec<(usize, bool)> = spec
        .partition_by
        .iter()
        .map(|c| schema.index_of(c).map(|i| (i, false)))
        .collect::<Result<_>>()?;
    let order: Vec<(usize, bool)> = spec
        .order_by
        .iter()
        .map(|k| schema.index_of(&k.column).map(|i| (i, k.descending)))
        .collect::<Result<_>>()?;
    let plans = spec
        .exprs
        .iter()
        .map(|e| plan_window(schema, e))
        .collect::<Result<Vec<_>>>()?;

    let mut out_schema = schema.clone();
    for (expr, plan) in spec.exprs.iter().zip(&plans) {
        out_schema = out_schema.with_column(Column::new(&expr.output, plan.output_type))?;
    }

    let rows = table.rows();
    let sort_keys: Vec<(usize, bool)> = partition.iter().chain(&order).copied().collect();
    let ordered = sorted_indices(rows, &sort_keys);

    let mut derived: Vec<Vec<Value>> = vec![vec![Value::Missing; rows.len()]; plans.len()];
    let mut start = 0;
    let mut partitions = 0;
    while start < ordered.len() {
        let mut end = start + 1;
        while end < ordered.len()
            && compare_keys(&rows[ordered[start]], &rows[ordered[end]], &partition)
                == Ordering::Equal
        {
            end += 1;
        }
        let members = &ordered[start..end];
        for (plan, out) in plans.iter().zip(derived.iter_mut()) {
            scan_partition(rows, members, &order, plan, out)?;
        }
        partitions += 1;
        start = end;
    }

    let out_rows: Vec<Row> = rows
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let mut row = row.clone();
            row.extend(derived.iter().map(|col| col[i].clone()));
            row
        })
        .collect();

    debug!(
        rows = out_rows.len(),
        partitions,
        columns = spec.exprs.len(),
        "Evaluated window"
    );
    Table::new(out_schema, out_rows)
}

static MISSING: Value = Value::Missing;

fn source_at<'a>(rows: &'a [Row], members: &[usize], source: Option<usize>, pos: usize) -> &'a Value {
    source.map_or(&MISSING, |src| &rows[members[pos]][src])
}

fn scan_partition(
    rows: &[Row],
    members: &[usize],
    order: &[(usize, bool)],
    plan: &WindowPlan,
    out: &mut [Value],
) -> Result<()> {
    let source = |pos: usize| source_at(rows, members, plan.source, pos);
    let is_peer = |pos: usize| {
        pos > 0
            && compare_keys(&rows[members[pos - 1]], &rows[members[pos]], order) == Ordering::Equal
    };

    match plan.function {
        WindowFunction::RowNumber => {
            for (pos, &row) in members.iter().enumerate() {
                out[row] = Value::Integer(pos as i64 + 1);
            }
        }
        WindowFunction::Rank => {
            let mut rank = 0;
            for (pos, &row) in members.iter().enumerate() {
                if !is_peer(pos) {
                    rank = pos as i64 + 1;
                }
                out[row] = Value::Integer(rank);
            }
        }
        WindowFunction::DenseRank => {
            let mut rank = 0;
            for (pos, &row) in members.iter().enumerate() {
                if !is_peer(pos) {
                    rank += 1;
                }
                out[row] = Value::Integer(rank);
            }
        }
        WindowFunction::RunningSum | WindowFunction::RunningAvg => {
            let mut acc = Accumulator::new(plan.output_type, &plan.source_name);
            for (pos, &row) in members.iter().enumerate() {
                acc.add(source(pos))?;
                out[row] = if plan.function == WindowFunction::RunningSum {
                    acc.sum()
                } else {
                    acc.avg()
                };
            }
        }
        WindowFunction::Lag(offset) => {
            for (pos, &row) in members.iter().enumerate() {
                out[row] = if pos >= offset {
                    source(pos - offset).clone()
                } else {
                    Value::Missing
                };
            }
        }
        WindowFunction::TotalSum | WindowFunction::PartitionAvg => {
            let mut acc = Accumulator::new(plan.output_type, &plan.source_name);
            for pos in 0..members.len() {
                acc.add(source(pos))?;
            }
            let total = if plan.function == WindowFunction::TotalSum {
                acc.sum()
            } else {
                acc.avg()
            };
            for &row in members {
                out[row] = total.clone();
            }
        }
    }
    Ok(())
}

// =============================================================================
// RELATIONAL HELPERS
// =============================================================================

/// Keep rows for which `predicate` holds.
pub fn filter<F>(table: &Table, predicate: F) -> Result<Table>
where
    F: Fn(&RowView<'_>) -> Result<bool>,
{
    let mut kept = Vec::new();
    for (row, view) in table.rows().iter().zip(table.iter()) {
        if predicate(&view)? {
            kept.push(row.clone());
        }
    }
    debug!(input_rows = table.len(), kept = kept.len(), "Filtered table");
    Ok(table.with_rows(kept))
}

/// Stable sort by `keys`.
pub fn sort(table: &Table, keys: &[SortKey]) -> Result<Table> {
    let resolved: Vec<(usize, bool)> = keys
        .iter()
        .map(|k| table.schema().index_of(&k.column).map(|i| (i, k.descending)))
        .collect::<Result<_>>()?;
    let rows = table.rows();
    let sorted = sorted_indices(rows, &resolved)
        .into_iter()
        .map(|i| rows[i].clone())
        .collect();
    Ok(table.with_rows(sorted))
}

/// First `n` rows.
pub fn limit(table: &Table, n: usize) -> Table {
    table.with_rows(table.rows().iter().take(n).cloned().collect())
}

/// Append a computed column.
pub fn derive<F>(table: &Table, column: &str, data_type: DataType, f: F) -> Result<Table>
where
    F: Fn(&RowView<'_>) -> Result<Value>,
{
    let schema = table
        .schema()
        .with_column(Column::new(column, data_type))?;
    let rows = table
        .rows()
        .iter()
        .zip(table.iter())
        .map(|(row, view)| {
            let mut row = row.clone();
            row.push(f(&view)?);
            Ok(row)
        })
        .collect::<Result<Vec<_>>>()?;
    Table::new(schema, rows)
}

/// Keep only `columns`, in the given order.
pub fn project(table: &Table, columns: &[&str]) -> Result<Table> {
    let idx = columns
        .iter()
        .map(|c| table.schema().index_of(c))
        .collect::<Result<Vec<_>>>()?;
    let schema = Schema::new(
        idx.iter()
            .map(|&i| table.schema().columns()[i].clone())
            .collect(),
    )?;
    let rows = table
        .rows()
        .iter()
        .map(|row| idx.iter().map(|&i| row[i].clone()).collect())
        .collect();
    Table::new(schema, rows)
}

/// Rename one column.
pub fn rename(table: &Table, from: &str, to: &str) -> Result<Table> {
    let idx = table.schema().index_of(from)?;
    let mut columns = table.schema().columns().to_vec();
    columns[idx].name = to.to_string();
    Table::new(Schema::new(columns)?, table.rows().to_vec())
}

/// Left outer join on a single key column present in both tables.
///
/// Every left row is kept. Unmatched rows (including a missing key, which
/// never matches) get `Missing` for every right-hand column. The right key
/// column is dropped from the output; any other shared column name is an
/// error.
pub fn left_join(left: &Table, right: &Table, key: &str) -> Result<Table> {
    let left_key = left.schema().index_of(key)?;
    let right_key = right.schema().index_of(key)?;

    let right_cols: Vec<usize> = (0..right.schema().len()).filter(|&i| i != right_key).collect();
    let mut columns = left.schema().columns().to_vec();
    for &i in &right_cols {
        let column = &right.schema().columns()[i];
        if left.schema().position(&column.name).is_some() {
            return Err(AnalyticsError::InvalidParameter(format!(
                "join on '{key}' would duplicate column '{}'",
                column.name
            )));
        }
        columns.push(column.clone());
    }
    let schema = Schema::new(columns)?;

    let mut lookup: HashMap<&Value, Vec<usize>> = HashMap::new();
    for (i, row) in right.rows().iter().enumerate() {
        if !row[right_key].is_missing() {
            lookup.entry(&row[right_key]).or_default().push(i);
        }
    }

    let mut rows = Vec::with_capacity(left.len());
    let mut unmatched = 0usize;
    for row in left.rows() {
        match lookup.get(&row[left_key]) {
            Some(matches) => {
                for &m in matches {
                    let mut joined = row.clone();
                    joined.extend(right_cols.iter().map(|&i| right.rows()[m][i].clone()));
                    rows.push(joined);
                }
            }
            None => {
                unmatched += 1;
                let mut joined = row.clone();
                joined.extend(right_cols.iter().map(|_| Value::Missing));
                rows.push(joined);
            }
        }
    }

    debug!(left_rows = left.len(), rows = rows.len(), unmatched, key, "Left-joined tables");
    Table::new(schema, rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fake::Fake;

    fn series(name: &str, values: &[Option<i64>]) -> Table {
        let schema = Schema::from_pairs(&[("seq", DataType::Integer), (name, DataType::Integer)]).unwrap();
        let rows = values
            .iter()
            .enumerate()
            .map(|(i, v)| vec![Value::Integer(i as i64), Value::from(*v)])
            .collect();
        Table::new(schema, rows).unwrap()
    }

    fn ints(table: &Table, column: &str) -> Vec<Option<i64>> {
        table
            .column(column)
            .unwrap()
            .into_iter()
            .map(Value::as_i64)
            .collect()
    }

    #[test]
    fn test_group_counts_sum_to_row_count() {
        for _ in 0..20 {
            let rows: usize = (0..200).fake();
            let keys: Vec<Option<i64>> = (0..rows)
                .map(|_| {
                    let k: i64 = (0..7).fake();
                    (k != 0).then_some(k)
                })
                .collect();
            let table = series("k", &keys);

            let grouped = aggregate(
                &table,
                &AggregationSpec::new(&["k"]).with(Aggregate::count_rows("n")),
            )
            .unwrap();
            let total: i64 = ints(&grouped, "n").into_iter().flatten().sum();
            assert_eq!(total, rows as i64);
        }
    }

    #[test]
    fn test_aggregate_skips_missing() {
        let table = series("v", &[Some(4), None, Some(4), Some(10)]);
        let spec = AggregationSpec::new(&[])
            .with(Aggregate::sum("total", "v"))
            .with(Aggregate::count("present", "v"))
            .with(Aggregate::count_rows("all"))
            .with(Aggregate::count_distinct("distinct", "v"))
            .with(Aggregate::avg("mean", "v"))
            .with(Aggregate::min("lo", "v"))
            .with(Aggregate::max("hi", "v"));
        let out = aggregate(&table, &spec).unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out.value(0, "total").unwrap(), &Value::Integer(18));
        assert_eq!(out.value(0, "present").unwrap(), &Value::Integer(3));
        assert_eq!(out.value(0, "all").unwrap(), &Value::Integer(4));
        assert_eq!(out.value(0, "distinct").unwrap(), &Value::Integer(2));
        assert_eq!(out.value(0, "mean").unwrap(), &Value::Float(6.0));
        assert_eq!(out.value(0, "lo").unwrap(), &Value::Integer(4));
        assert_eq!(out.value(0, "hi").unwrap(), &Value::Integer(10));
    }

    #[test]
    fn test_sum_of_only_missing_is_missing() {
        let table = series("v", &[None, None]);
        let out = aggregate(&table, &AggregationSpec::new(&[]).with(Aggregate::sum("s", "v"))).unwrap();
        assert!(out.value(0, "s").unwrap().is_missing());
    }

    #[test]
    fn test_unresolved_group_key() {
        let table = series("v", &[Some(1)]);
        let err = aggregate(&table, &AggregationSpec::new(&["nope"])).unwrap_err();
        assert_eq!(err, AnalyticsError::UnresolvedGroupKey { column: "nope".into() });

        let err = aggregate(&table, &AggregationSpec::new(&[]).with(Aggregate::sum("s", "gone"))).unwrap_err();
        assert_eq!(err, AnalyticsError::UnresolvedGroupKey { column: "gone".into() });
    }

    #[test]
    fn test_sum_over_string_is_type_mismatch() {
        let schema = Schema::from_pairs(&[("name", DataType::String)]).unwrap();
        let table = Table::new(schema, vec![vec![Value::from("a")]]).unwrap();
        let err = aggregate(&table, &AggregationSpec::new(&[]).with(Aggregate::sum("s", "name"))).unwrap_err();
        assert!(matches!(err, AnalyticsError::TypeMismatch { .. }));
    }

    #[test]
    fn test_rank_and_dense_rank_with_ties() {
        let table = series("score", &[Some(90), Some(70), Some(90)]);
        let out = window(
            &table,
            &WindowSpec::new()
                .order_by(SortKey::desc("score"))
                .with(WindowExpr::rank("rank"))
                .with(WindowExpr::dense_rank("dense"))
                .with(WindowExpr::row_number("rn")),
        )
        .unwrap();

        assert_eq!(ints(&out, "rank"), vec![Some(1), Some(3), Some(1)]);
        assert_eq!(ints(&out, "dense"), vec![Some(1), Some(2), Some(1)]);
        // tied rows numbered in input order
        assert_eq!(ints(&out, "rn"), vec![Some(1), Some(3), Some(2)]);
    }

    #[test]
    fn test_lag_one() {
        let table = series("v", &[Some(10), Some(20), Some(30)]);
        let out = window(
            &table,
            &WindowSpec::new()
                .order_by(SortKey::asc("seq"))
                .with(WindowExpr::lag("prev", "v", 1)),
        )
        .unwrap();
        assert_eq!(ints(&out, "prev"), vec![None, Some(10), Some(20)]);
    }

    #[test]
    fn test_lag_two_within_partitions() {
        let table = series("v", &[Some(10), Some(20), Some(30), Some(40)]);
        let out = window(
            &table,
            &WindowSpec::new()
                .order_by(SortKey::asc("seq"))
                .with(WindowExpr::lag("back2", "v", 2)),
        )
        .unwrap();
        assert_eq!(ints(&out, "back2"), vec![None, None, Some(10), Some(20)]);

        let schema = Schema::from_pairs(&[
            ("entity", DataType::String),
            ("year", DataType::Integer),
            ("sales", DataType::Integer),
        ])
        .unwrap();
        let rows = vec![
            vec!["a".into(), Value::Integer(2011), Value::Integer(1)],
            vec!["b".into(), Value::Integer(2011), Value::Integer(100)],
            vec!["a".into(), Value::Integer(2012), Value::Integer(2)],
            vec!["b".into(), Value::Integer(2012), Value::Integer(200)],
            vec!["a".into(), Value::Integer(2013), Value::Integer(3)],
            vec!["b".into(), Value::Integer(2013), Value::Integer(300)],
        ];
        let out = window(
            &Table::new(schema, rows).unwrap(),
            &WindowSpec::new()
                .partition_by(&["entity"])
                .order_by(SortKey::asc("year"))
                .with(WindowExpr::lag("back2", "sales", 2)),
        )
        .unwrap();
        // lag never crosses a partition boundary
        assert_eq!(
            ints(&out, "back2"),
            vec![None, None, None, None, Some(1), Some(100)]
        );
    }

    #[test]
    fn test_integer_sum_overflow_is_error() {
        let table = series("v", &[Some(i64::MAX), Some(5)]);
        let overflow = AnalyticsError::IntegerOverflow { column: "v".into() };

        let err = aggregate(&table, &AggregationSpec::new(&[]).with(Aggregate::sum("s", "v"))).unwrap_err();
        assert_eq!(err, overflow);

        let err = window(
            &table,
            &WindowSpec::new()
                .order_by(SortKey::asc("seq"))
                .with(WindowExpr::running_sum("run", "v")),
        )
        .unwrap_err();
        assert_eq!(err, overflow);

        let err = window(&table, &WindowSpec::new().with(WindowExpr::total_sum("t", "v"))).unwrap_err();
        assert_eq!(err, overflow);

        // averages promote to float and never overflow
        let out = aggregate(&table, &AggregationSpec::new(&[]).with(Aggregate::avg("m", "v"))).unwrap();
        assert!(out.value(0, "m").unwrap().as_f64().is_some());
    }

    #[test]
    fn test_group_and_window_averages_agree() {
        let schema = Schema::from_pairs(&[
            ("seq", DataType::Integer),
            ("g", DataType::String),
            ("v", DataType::Float),
        ])
        .unwrap();
        let values = [0.1, 0.2, 0.3, 0.7, 1.1, 2.9];
        let rows = values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let g = if i % 2 == 0 { "even" } else { "odd" };
                vec![Value::Integer(i as i64), g.into(), Value::Float(*v)]
            })
            .collect();
        let table = Table::new(schema, rows).unwrap();

        let grouped = aggregate(&table, &AggregationSpec::new(&["g"]).with(Aggregate::avg("m", "v"))).unwrap();
        let windowed = window(
            &table,
            &WindowSpec::new()
                .partition_by(&["g"])
                .order_by(SortKey::asc("seq"))
                .with(WindowExpr::partition_avg("m", "v"))
                .with(WindowExpr::running_avg("run", "v")),
        )
        .unwrap();

        // groups in first-appearance order: even (rows 0, 2, 4), odd (rows 1, 3, 5)
        for (group, last_row) in [(0, 4), (1, 5)] {
            let expected = grouped.value(group, "m").unwrap();
            assert_eq!(windowed.value(last_row, "m").unwrap(), expected);
            assert_eq!(windowed.value(last_row, "run").unwrap(), expected);
        }
    }

    #[test]
    fn test_running_sum_skips_missing() {
        let table = series("v", &[Some(5), None, Some(3)]);
        let out = window(
            &table,
            &WindowSpec::new()
                .order_by(SortKey::asc("seq"))
                .with(WindowExpr::running_sum("run", "v"))
                .with(WindowExpr::running_avg("avg", "v")),
        )
        .unwrap();
        assert_eq!(ints(&out, "run"), vec![Some(5), Some(5), Some(8)]);
        assert_eq!(out.value(2, "avg").unwrap(), &Value::Float(4.0));

        let leading = window(
            &series("v", &[None, Some(2)]),
            &WindowSpec::new().with(WindowExpr::running_sum("run", "v")),
        )
        .unwrap();
        assert_eq!(ints(&leading, "run"), vec![None, Some(2)]);
    }

    #[test]
    fn test_partitioned_window_keeps_input_order() {
        let schema = Schema::from_pairs(&[
            ("entity", DataType::String),
            ("year", DataType::Integer),
            ("sales", DataType::Integer),
        ])
        .unwrap();
        let rows = vec![
            vec!["b".into(), Value::Integer(2013), Value::Integer(7)],
            vec!["a".into(), Value::Integer(2013), Value::Integer(3)],
            vec!["a".into(), Value::Integer(2012), Value::Integer(1)],
            vec!["b".into(), Value::Integer(2012), Value::Integer(5)],
        ];
        let table = Table::new(schema, rows).unwrap();
        let out = window(
            &table,
            &WindowSpec::new()
                .partition_by(&["entity"])
                .order_by(SortKey::asc("year"))
                .with(WindowExpr::lag("py", "sales", 1))
                .with(WindowExpr::total_sum("total", "sales"))
                .with(WindowExpr::partition_avg("avg", "sales")),
        )
        .unwrap();

        assert_eq!(ints(&out, "py"), vec![Some(5), Some(1), None, None]);
        assert_eq!(ints(&out, "total"), vec![Some(12), Some(4), Some(4), Some(12)]);
        assert_eq!(out.value(0, "avg").unwrap(), &Value::Float(6.0));
    }

    #[test]
    fn test_total_sum_unpartitioned() {
        let table = series("v", &[Some(300), Some(700)]);
        let out = window(&table, &WindowSpec::new().with(WindowExpr::total_sum("t", "v"))).unwrap();
        assert_eq!(ints(&out, "t"), vec![Some(1000), Some(1000)]);
    }

    #[test]
    fn test_window_needs_source() {
        let table = series("v", &[Some(1)]);
        let spec = WindowSpec::new().with(WindowExpr::new("x", WindowFunction::RunningSum, None));
        assert!(matches!(window(&table, &spec), Err(AnalyticsError::InvalidParameter(_))));
    }

    #[test]
    fn test_left_join_keeps_unmatched() {
        let facts = Table::new(
            Schema::from_pairs(&[("key", DataType::Integer), ("amount", DataType::Integer)]).unwrap(),
            vec![
                vec![Value::Integer(1), Value::Integer(10)],
                vec![Value::Integer(2), Value::Integer(20)],
                vec![Value::Missing, Value::Integer(30)],
            ],
        )
        .unwrap();
        let dim = Table::new(
            Schema::from_pairs(&[("key", DataType::Integer), ("name", DataType::String)]).unwrap(),
            vec![vec![Value::Integer(1), "one".into()]],
        )
        .unwrap();

        let joined = left_join(&facts, &dim, "key").unwrap();
        assert_eq!(joined.len(), 3);
        assert_eq!(joined.column_names(), vec!["key", "amount", "name"]);
        assert_eq!(joined.value(0, "name").unwrap(), &Value::from("one"));
        assert!(joined.value(1, "name").unwrap().is_missing());
        assert!(joined.value(2, "name").unwrap().is_missing());
    }

    #[test]
    fn test_sort_is_stable_and_missing_first() {
        let table = series("v", &[Some(2), None, Some(1), Some(2)]);
        let sorted = sort(&table, &[SortKey::asc("v")]).unwrap();
        assert_eq!(ints(&sorted, "seq"), vec![Some(1), Some(2), Some(0), Some(3)]);

        let top = limit(&sort(&table, &[SortKey::desc("v")]).unwrap(), 2);
        assert_eq!(ints(&top, "seq"), vec![Some(0), Some(3)]);
    }

    #[test]
    fn test_derive_project_rename_filter() {
        let table = series("v", &[Some(1), Some(2), Some(3)]);
        let doubled = derive(&table, "double", DataType::Integer, |row| {
            Ok(row.get("v")?.as_i64().map(|v| v * 2).into())
        })
        .unwrap();
        let odd = filter(&doubled, |row| Ok(row.get("v")?.as_i64().is_some_and(|v| v % 2 == 1))).unwrap();
        let renamed = rename(&project(&odd, &["double"]).unwrap(), "double", "twice").unwrap();

        assert_eq!(renamed.column_names(), vec!["twice"]);
        assert_eq!(ints(&renamed, "twice"), vec![Some(2), Some(6)]);
        // input untouched
        assert_eq!(table.schema().len(), 2);
    }
}
