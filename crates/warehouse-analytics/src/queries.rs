//! Predefined analytical queries.
//!
//! Composable building blocks (ranking, period bucketing, running totals,
//! year-over-year comparison, part-to-whole) plus the warehouse query
//! catalog built from them. Fact-based queries expect the sales fact schema
//! and join dimensions with left-join semantics.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::kpi::{self, months_between, round_to, safe_divide};
use crate::pipeline::{
    Aggregate, AggregateFunction, AggregationSpec, SortKey, WindowExpr, WindowSpec, aggregate, derive, filter,
    left_join, project, sort, window,
};
use crate::rules;
use crate::table::{DataType, Schema, Table, Value};

/// Ranking direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Highest metric first
    Top,
    /// Lowest metric first
    Bottom,
}

/// Time bucket granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    /// Calendar month
    Month,
    /// Calendar year
    Year,
}

impl Period {
    /// First day of the period containing `date`.
    #[must_use]
    pub fn truncate(self, date: NaiveDate) -> NaiveDate {
        let (year, month) = match self {
            Self::Month => (date.year(), date.month()),
            Self::Year => (date.year(), 1),
        };
        NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(date)
    }

    /// Lowercase name, as accepted by `FromStr`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Month => "month",
            Self::Year => "year",
        }
    }
}

impl std::str::FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "month" => Ok(Self::Month),
            "year" => Ok(Self::Year),
            other => Err(format!("unknown period '{other}'")),
        }
    }
}

fn with_order_date(facts: &Table) -> Result<Table> {
    filter(facts, |row| Ok(!row.get("order_date")?.is_missing()))
}

/// Single value of an ungrouped aggregate; counts over no rows are zero.
fn scalar(table: &Table, aggregate_expr: Aggregate) -> Result<Value> {
    let is_count = matches!(
        aggregate_expr.function,
        AggregateFunction::Count | AggregateFunction::CountDistinct
    );
    let output = aggregate_expr.output.clone();
    let out = aggregate(table, &AggregationSpec::new(&[]).with(aggregate_expr))?;
    if out.is_empty() {
        return Ok(if is_count { Value::Integer(0) } else { Value::Missing });
    }
    out.value(0, &output).cloned()
}

// =============================================================================
// RANKING
// =============================================================================

/// Top or bottom `n` rows by `metric`, adding a `rank` column.
///
/// Uses competition ranking, so every row tied at the cut line is kept and
/// the result may hold more than `n` rows. Rows with a missing metric are
/// not ranked.
pub fn top_n(table: &Table, metric: &str, n: usize, direction: Direction) -> Result<Table> {
    let present = filter(table, |row| Ok(!row.get(metric)?.is_missing()))?;
    let key = match direction {
        Direction::Top => SortKey::desc(metric),
        Direction::Bottom => SortKey::asc(metric),
    };
    let ranked = window(&present, &WindowSpec::new().order_by(key).with(WindowExpr::rank("rank")))?;
    let limit = i64::try_from(n).unwrap_or(i64::MAX);
    let cut = filter(&ranked, |row| Ok(row.get("rank")?.as_i64().is_some_and(|r| r <= limit)))?;
    sort(&cut, &[SortKey::asc("rank")])
}

/// Products ranked by revenue.
pub fn products_by_revenue(facts: &Table, products: &Table, n: usize, direction: Direction) -> Result<Table> {
    let joined = left_join(facts, products, "product_key")?;
    let revenue = aggregate(
        &joined,
        &AggregationSpec::new(&["product_name"]).with(Aggregate::sum("total_revenue", "sales_amount")),
    )?;
    top_n(&revenue, "total_revenue", n, direction)
}

/// Customers ranked by revenue.
pub fn customers_by_revenue(facts: &Table, customers: &Table, n: usize, direction: Direction) -> Result<Table> {
    let joined = left_join(facts, customers, "customer_key")?;
    let revenue = aggregate(
        &joined,
        &AggregationSpec::new(&["customer_key", "first_name", "last_name"])
            .with(Aggregate::sum("total_revenue", "sales_amount")),
    )?;
    top_n(&revenue, "total_revenue", n, direction)
}

/// Customers with the fewest distinct orders.
pub fn customers_with_fewest_orders(facts: &Table, customers: &Table, n: usize) -> Result<Table> {
    let joined = left_join(facts, customers, "customer_key")?;
    let orders = aggregate(
        &joined,
        &AggregationSpec::new(&["customer_key", "first_name", "last_name"])
            .with(Aggregate::count_distinct("total_orders", "order_number")),
    )?;
    top_n(&orders, "total_orders", n, Direction::Bottom)
}

// =============================================================================
// TIME SERIES
// =============================================================================

/// Append `output` holding `date_col` truncated to the start of `period`.
pub fn truncate_period(table: &Table, date_col: &str, period: Period, output: &str) -> Result<Table> {
    derive(table, output, DataType::Date, |row| {
        Ok(row.get(date_col)?.as_date().map(|d| period.truncate(d)).into())
    })
}

/// Sales, distinct customers and quantity per period.
pub fn sales_over_time(facts: &Table, period: Period) -> Result<Table> {
    let dated = with_order_date(facts)?;
    let bucketed = truncate_period(&dated, "order_date", period, "period")?;
    let grouped = aggregate(
        &bucketed,
        &AggregationSpec::new(&["period"])
            .with(Aggregate::sum("total_sales", "sales_amount"))
            .with(Aggregate::count_distinct("total_customers", "customer_key"))
            .with(Aggregate::sum("total_quantity", "quantity")),
    )?;
    sort(&grouped, &[SortKey::asc("period")])
}

/// Per-period sales with a running total and a moving average of the
/// average price.
pub fn cumulative_sales(facts: &Table, period: Period) -> Result<Table> {
    let dated = with_order_date(facts)?;
    let bucketed = truncate_period(&dated, "order_date", period, "period")?;
    let grouped = aggregate(
        &bucketed,
        &AggregationSpec::new(&["period"])
            .with(Aggregate::sum("total_sales", "sales_amount"))
            .with(Aggregate::avg("avg_price", "price")),
    )?;
    let running = window(
        &grouped,
        &WindowSpec::new()
            .order_by(SortKey::asc("period"))
            .with(WindowExpr::running_sum("running_total_sales", "total_sales"))
            .with(WindowExpr::running_avg("moving_average_price", "avg_price")),
    )?;
    sort(&running, &[SortKey::asc("period")])
}

/// Year-over-year analysis of `metric` per `entity`.
///
/// Adds `avg_<metric>` (entity average across years), `diff_avg`,
/// `avg_change`, `py_<metric>` (previous year's value), `diff_py` and
/// `py_change`.
pub fn year_over_year(table: &Table, entity: &str, year: &str, metric: &str) -> Result<Table> {
    let avg_col = format!("avg_{metric}");
    let py_col = format!("py_{metric}");

    let averaged = window(
        table,
        &WindowSpec::new()
            .partition_by(&[entity])
            .with(WindowExpr::partition_avg(&avg_col, metric)),
    )?;
    let lagged = window(
        &averaged,
        &WindowSpec::new()
            .partition_by(&[entity])
            .order_by(SortKey::asc(year))
            .with(WindowExpr::lag(&py_col, metric, 1)),
    )?;

    let t = kpi::derive_difference(&lagged, "diff_avg", metric, &avg_col)?;
    let t = rules::average_change("diff_avg")?.apply(&t, "avg_change")?;
    let t = kpi::derive_difference(&t, "diff_py", metric, &py_col)?;
    let t = rules::prior_period_change("diff_py")?.apply(&t, "py_change")?;

    project(
        &t,
        &[
            year,
            entity,
            metric,
            avg_col.as_str(),
            "diff_avg",
            "avg_change",
            py_col.as_str(),
            "diff_py",
            "py_change",
        ],
    )
}

/// Yearly sales per product compared to the product's average and to the
/// previous year.
pub fn yearly_product_performance(facts: &Table, products: &Table) -> Result<Table> {
    let dated = with_order_date(facts)?;
    let joined = left_join(&dated, products, "product_key")?;
    let with_year = derive(&joined, "order_year", DataType::Integer, |row| {
        Ok(row
            .get("order_date")?
            .as_date()
            .map(|d| i64::from(d.year()))
            .into())
    })?;
    let yearly = aggregate(
        &with_year,
        &AggregationSpec::new(&["order_year", "product_name"])
            .with(Aggregate::sum("current_sales", "sales_amount")),
    )?;
    let compared = year_over_year(&yearly, "product_name", "order_year", "current_sales")?;
    sort(
        &compared,
        &[SortKey::asc("product_name"), SortKey::asc("order_year")],
    )
}

// =============================================================================
// PART TO WHOLE
// =============================================================================

/// Append `overall_<metric>` (grand total) and `output`, the row's share of
/// the total in percent rounded to 2 decimals.
pub fn part_to_whole(table: &Table, metric: &str, output: &str) -> Result<Table> {
    let total_col = format!("overall_{metric}");
    let totals = window(table, &WindowSpec::new().with(WindowExpr::total_sum(&total_col, metric)))?;
    let formula = format!("{output} = {metric} / {total_col} * 100");
    derive(&totals, output, DataType::Float, |row| {
        let share = safe_divide(row.get(metric)?, row.get(&total_col)?);
        kpi::checked(
            &formula,
            share.as_f64().map(|s| round_to(s * 100.0, 2)).into(),
        )
    })
}

/// Each category's share of total sales.
pub fn category_contribution(facts: &Table, products: &Table) -> Result<Table> {
    let joined = left_join(facts, products, "product_key")?;
    let by_category = aggregate(
        &joined,
        &AggregationSpec::new(&["category"]).with(Aggregate::sum("total_sales", "sales_amount")),
    )?;
    let shares = part_to_whole(&by_category, "total_sales", "percentage_of_total")?;
    sort(&shares, &[SortKey::desc("total_sales")])
}

// =============================================================================
// SEGMENTATION
// =============================================================================

/// Row count per label of `segment`, largest first.
pub fn segment_counts(table: &Table, segment: &str, output: &str) -> Result<Table> {
    let counts = aggregate(
        table,
        &AggregationSpec::new(&[segment]).with(Aggregate::count_rows(output)),
    )?;
    sort(&counts, &[SortKey::desc(output), SortKey::asc(segment)])
}

/// Customers per segment of a customer report.
pub fn customer_segments(customer_report: &Table) -> Result<Table> {
    segment_counts(customer_report, "customer_segment", "total_customers")
}

/// Products per cost range.
pub fn product_cost_ranges(products: &Table) -> Result<Table> {
    let bucketed = rules::cost_bucket()?.apply(products, "cost_range")?;
    segment_counts(&bucketed, "cost_range", "total_products")
}

// =============================================================================
// MAGNITUDE
// =============================================================================

/// Group by `by` and sort by the first aggregate, largest first.
pub fn magnitude(table: &Table, by: &[&str], aggregates: Vec<Aggregate>) -> Result<Table> {
    let first = aggregates.first().map(|a| a.output.clone());
    let spec = aggregates
        .into_iter()
        .fold(AggregationSpec::new(by), AggregationSpec::with);
    let grouped = aggregate(table, &spec)?;
    match first {
        Some(column) => sort(&grouped, &[SortKey::desc(&column)]),
        None => Ok(grouped),
    }
}

/// Customers per country.
pub fn customers_by_country(customers: &Table) -> Result<Table> {
    magnitude(
        customers,
        &["country"],
        vec![Aggregate::count_distinct("total_customers", "customer_key")],
    )
}

/// Revenue per product category.
pub fn revenue_by_category(facts: &Table, products: &Table) -> Result<Table> {
    let joined = left_join(facts, products, "product_key")?;
    magnitude(
        &joined,
        &["category"],
        vec![Aggregate::sum("total_revenue", "sales_amount")],
    )
}

/// Average product cost per category.
pub fn average_cost_by_category(products: &Table) -> Result<Table> {
    magnitude(
        products,
        &["category"],
        vec![
            Aggregate::avg("avg_cost", "cost"),
            Aggregate::count_distinct("total_products", "product_key"),
        ],
    )
}

// =============================================================================
// SUMMARIES
// =============================================================================

/// Headline measures as `measure_name` / `measure_value` rows.
pub fn key_metrics(facts: &Table, products: &Table, customers: &Table) -> Result<Table> {
    let measures: Vec<(&str, Value)> = vec![
        ("Total Sales", scalar(facts, Aggregate::sum("v", "sales_amount"))?),
        ("Total Quantity", scalar(facts, Aggregate::sum("v", "quantity"))?),
        ("Average Price", scalar(facts, Aggregate::avg("v", "price"))?),
        ("Total Nr. Orders", scalar(facts, Aggregate::count_distinct("v", "order_number"))?),
        ("Total Nr. Products", scalar(products, Aggregate::count_distinct("v", "product_key"))?),
        ("Total Nr. Customers", scalar(customers, Aggregate::count_distinct("v", "customer_key"))?),
        (
            "Customers With Orders",
            scalar(facts, Aggregate::count_distinct("v", "customer_key"))?,
        ),
    ];

    let schema = Schema::from_pairs(&[
        ("measure_name", DataType::String),
        ("measure_value", DataType::Float),
    ])?;
    let rows = measures
        .into_iter()
        .map(|(name, value)| vec![Value::from(name), value.as_f64().into()])
        .collect();
    Table::new(schema, rows)
}

/// First and last order date and the month span between them.
pub fn date_range_summary(facts: &Table) -> Result<Table> {
    let first = scalar(facts, Aggregate::min("v", "order_date"))?;
    let last = scalar(facts, Aggregate::max("v", "order_date"))?;
    let span: Value = match (first.as_date(), last.as_date()) {
        (Some(f), Some(l)) => Value::Integer(months_between(f, l)),
        _ => Value::Missing,
    };

    let schema = Schema::from_pairs(&[
        ("first_order_date", DataType::Date),
        ("last_order_date", DataType::Date),
        ("order_range_months", DataType::Integer),
    ])?;
    Table::new(schema, vec![vec![first, last, span]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::from_records;
    use warehouse_domain::{CustomerDim, FactRow, ProductDim};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn products() -> Table {
        from_records(vec![
            ProductDim::new(1, "Road-150", "Bikes", "Road Bikes", 1200.0),
            ProductDim::new(2, "Helmet", "Accessories", "Helmets", 500.0),
            ProductDim::new(3, "Jersey", "Clothing", "Jerseys", 40.0),
        ])
        .unwrap()
    }

    fn facts() -> Table {
        from_records(vec![
            FactRow::new("SO1", 1, 10, date(2012, 1, 5), 3000.0, 1),
            FactRow::new("SO2", 2, 11, date(2012, 1, 20), 200.0, 2),
            FactRow::new("SO3", 1, 10, date(2013, 2, 3), 4000.0, 1),
            FactRow::new("SO4", 3, 12, date(2013, 2, 9), 100.0, 4),
            FactRow::new("SO5", 2, 11, date(2013, 7, 1), 200.0, 2),
        ])
        .unwrap()
    }

    fn floats(table: &Table, column: &str) -> Vec<Option<f64>> {
        table.column(column).unwrap().into_iter().map(Value::as_f64).collect()
    }

    fn strings(table: &Table, column: &str) -> Vec<String> {
        table
            .column(column)
            .unwrap()
            .into_iter()
            .map(ToString::to_string)
            .collect()
    }

    #[test]
    fn test_part_to_whole_sums_to_hundred() {
        let schema = Schema::from_pairs(&[("category", DataType::String), ("sales", DataType::Integer)]).unwrap();
        let table = Table::new(
            schema,
            vec![
                vec!["Accessories".into(), Value::Integer(300)],
                vec!["Bikes".into(), Value::Integer(700)],
            ],
        )
        .unwrap();
        let out = part_to_whole(&table, "sales", "pct").unwrap();

        let pct = floats(&out, "pct");
        assert_eq!(pct, vec![Some(30.0), Some(70.0)]);
        assert_eq!(pct.into_iter().flatten().sum::<f64>(), 100.0);
        assert_eq!(out.value(0, "overall_sales").unwrap(), &Value::Integer(1000));
    }

    #[test]
    fn test_part_to_whole_without_total_is_missing() {
        let schema = Schema::from_pairs(&[("category", DataType::String), ("sales", DataType::Integer)]).unwrap();
        let zeros = Table::new(
            schema.clone(),
            vec![
                vec!["Accessories".into(), Value::Integer(0)],
                vec!["Bikes".into(), Value::Integer(0)],
            ],
        )
        .unwrap();
        let out = part_to_whole(&zeros, "sales", "pct").unwrap();
        assert_eq!(floats(&out, "pct"), vec![None, None]);
        assert_eq!(out.value(0, "overall_sales").unwrap(), &Value::Integer(0));

        let blanks = Table::new(
            schema,
            vec![
                vec!["Accessories".into(), Value::Missing],
                vec!["Bikes".into(), Value::Missing],
            ],
        )
        .unwrap();
        let out = part_to_whole(&blanks, "sales", "pct").unwrap();
        assert_eq!(floats(&out, "pct"), vec![None, None]);
        assert!(out.value(1, "overall_sales").unwrap().is_missing());
    }

    #[test]
    fn test_top_n_keeps_ties() {
        let schema = Schema::from_pairs(&[("name", DataType::String), ("revenue", DataType::Integer)]).unwrap();
        let table = Table::new(
            schema,
            vec![
                vec!["a".into(), Value::Integer(50)],
                vec!["b".into(), Value::Integer(90)],
                vec!["c".into(), Value::Integer(50)],
                vec!["d".into(), Value::Integer(10)],
                vec!["e".into(), Value::Missing],
            ],
        )
        .unwrap();

        let top = top_n(&table, "revenue", 2, Direction::Top).unwrap();
        assert_eq!(strings(&top, "name"), vec!["b", "a", "c"]);
        assert_eq!(strings(&top, "rank"), vec!["1", "2", "2"]);

        let bottom = top_n(&table, "revenue", 1, Direction::Bottom).unwrap();
        assert_eq!(strings(&bottom, "name"), vec!["d"]);
    }

    #[test]
    fn test_products_by_revenue() {
        let top = products_by_revenue(&facts(), &products(), 1, Direction::Top).unwrap();
        assert_eq!(strings(&top, "product_name"), vec!["Road-150"]);
        assert_eq!(floats(&top, "total_revenue"), vec![Some(7000.0)]);

        let fewest = customers_with_fewest_orders(
            &facts(),
            &from_records(vec![
                CustomerDim::new(10, "Jon", "Yang", None),
                CustomerDim::new(11, "Eugene", "Huang", None),
                CustomerDim::new(12, "Ruben", "Torres", None),
            ])
            .unwrap(),
            1,
        )
        .unwrap();
        assert_eq!(strings(&fewest, "first_name"), vec!["Ruben"]);
    }

    #[test]
    fn test_sales_over_time_by_month() {
        let out = sales_over_time(&facts(), Period::Month).unwrap();
        assert_eq!(
            strings(&out, "period"),
            vec!["2012-01-01", "2013-02-01", "2013-07-01"]
        );
        assert_eq!(floats(&out, "total_sales"), vec![Some(3200.0), Some(4100.0), Some(200.0)]);
        assert_eq!(strings(&out, "total_customers"), vec!["2", "2", "1"]);
    }

    #[test]
    fn test_cumulative_sales_by_year() {
        let out = cumulative_sales(&facts(), Period::Year).unwrap();
        assert_eq!(strings(&out, "period"), vec!["2012-01-01", "2013-01-01"]);
        assert_eq!(floats(&out, "running_total_sales"), vec![Some(3200.0), Some(7500.0)]);
        // avg_price per year: 2012 -> (3000 + 100) / 2, 2013 -> (4000 + 25 + 100) / 3
        assert_eq!(floats(&out, "avg_price")[0], Some(1550.0));
        assert_eq!(floats(&out, "moving_average_price")[1], Some((1550.0 + 1375.0) / 2.0));
    }

    #[test]
    fn test_yearly_product_performance() {
        let out = yearly_product_performance(&facts(), &products()).unwrap();
        let road: Vec<usize> = (0..out.len())
            .filter(|&i| out.value(i, "product_name").unwrap() == &Value::from("Road-150"))
            .collect();
        assert_eq!(road.len(), 2);

        let first = road[0];
        let second = road[1];
        assert_eq!(out.value(first, "order_year").unwrap(), &Value::Integer(2012));
        assert!(out.value(first, "py_current_sales").unwrap().is_missing());
        assert_eq!(out.value(first, "py_change").unwrap(), &Value::from("No Change"));
        assert_eq!(out.value(first, "avg_change").unwrap(), &Value::from("Below Avg"));
        assert_eq!(out.value(second, "diff_py").unwrap(), &Value::Float(1000.0));
        assert_eq!(out.value(second, "py_change").unwrap(), &Value::from("Increase"));
        assert_eq!(out.value(second, "avg_current_sales").unwrap(), &Value::Float(3500.0));
    }

    #[test]
    fn test_category_contribution() {
        let out = category_contribution(&facts(), &products()).unwrap();
        assert_eq!(strings(&out, "category"), vec!["Bikes", "Accessories", "Clothing"]);
        let pct = floats(&out, "percentage_of_total");
        assert_eq!(pct[0], Some(93.33));
        assert_eq!(pct[1], Some(5.33));
        assert_eq!(pct[2], Some(1.33));
    }

    #[test]
    fn test_product_cost_ranges() {
        let out = product_cost_ranges(&products()).unwrap();
        let labels = strings(&out, "cost_range");
        assert!(labels.contains(&"100-500".to_string()));
        assert!(labels.contains(&"Above 1000".to_string()));
        assert!(labels.contains(&"Below 100".to_string()));
        assert!(!labels.contains(&"500-1000".to_string()));
    }

    #[test]
    fn test_key_metrics_and_date_range() {
        let customers = from_records(vec![CustomerDim::new(10, "Jon", "Yang", None)]).unwrap();
        let metrics = key_metrics(&facts(), &products(), &customers).unwrap();
        assert_eq!(metrics.len(), 7);
        assert_eq!(metrics.value(0, "measure_value").unwrap(), &Value::Float(7500.0));
        assert_eq!(metrics.value(3, "measure_value").unwrap(), &Value::Float(5.0));
        assert_eq!(metrics.value(6, "measure_value").unwrap(), &Value::Float(3.0));

        let range = date_range_summary(&facts()).unwrap();
        assert_eq!(range.value(0, "order_range_months").unwrap(), &Value::Integer(18));

        let empty = Table::empty(crate::adapter::fact_schema());
        let range = date_range_summary(&empty).unwrap();
        assert!(range.value(0, "first_order_date").unwrap().is_missing());
        let metrics = key_metrics(&empty, &products(), &customers).unwrap();
        assert_eq!(metrics.value(3, "measure_value").unwrap(), &Value::Float(0.0));
    }

    #[test]
    fn test_magnitude_sorted_desc() {
        let out = revenue_by_category(&facts(), &products()).unwrap();
        assert_eq!(floats(&out, "total_revenue")[0], Some(7000.0));

        let avg = average_cost_by_category(&products()).unwrap();
        assert_eq!(avg.len(), 3);
    }

    #[test]
    fn test_period_truncate_and_parse() {
        assert_eq!(Period::Month.truncate(date(2013, 7, 19)), date(2013, 7, 1));
        assert_eq!(Period::Year.truncate(date(2013, 7, 19)), date(2013, 1, 1));
        assert_eq!("YEAR".parse::<Period>().unwrap(), Period::Year);
        assert!("week".parse::<Period>().is_err());
    }
}
