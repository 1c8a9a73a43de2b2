//! Customer and product reports, report envelopes and Markdown rendering.

use std::fmt::Write as _;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ReportConfig;
use crate::error::Result;
use crate::kpi::{derive_age, derive_months_between, derive_ratio, derive_recency, derive_rounded};
use crate::pipeline::{
    Aggregate, AggregationSpec, SortKey, aggregate, derive, filter, left_join, project, sort,
};
use crate::rules;
use crate::table::{DataType, Table, Value};

/// Columns of the customer report, in output order.
pub const CUSTOMER_REPORT_COLUMNS: [&str; 15] = [
    "customer_key",
    "customer_number",
    "customer_name",
    "age",
    "age_group",
    "customer_segment",
    "last_order_date",
    "recency",
    "total_orders",
    "total_sales",
    "total_quantity",
    "total_products",
    "lifespan",
    "avg_order_value",
    "avg_monthly_spend",
];

/// Columns of the product report, in output order.
pub const PRODUCT_REPORT_COLUMNS: [&str; 16] = [
    "product_key",
    "product_name",
    "category",
    "subcategory",
    "cost",
    "last_sale_date",
    "recency_in_months",
    "product_segment",
    "lifespan",
    "total_orders",
    "total_sales",
    "total_quantity",
    "total_customers",
    "avg_selling_price",
    "avg_order_revenue",
    "avg_monthly_revenue",
];

fn dated_facts(facts: &Table) -> Result<Table> {
    let dated = filter(facts, |row| Ok(!row.get("order_date")?.is_missing()))?;
    debug!(
        input_rows = facts.len(),
        kept_rows = dated.len(),
        "Dropped fact rows without order date"
    );
    Ok(dated)
}

/// One row per customer with at least one dated order.
///
/// Age and recency are measured against `config.as_of`. Sales lines whose
/// customer key has no dimension row still form a group, with missing
/// name, number and age.
pub fn build_customer_report(facts: &Table, customers: &Table, config: &ReportConfig) -> Result<Table> {
    let base = left_join(&dated_facts(facts)?, customers, "customer_key")?;
    let base = derive(&base, "customer_name", DataType::String, |row| {
        Ok(match (row.get("first_name")?.as_str(), row.get("last_name")?.as_str()) {
            (None, None) => Value::Missing,
            (first, last) => format!("{} {}", first.unwrap_or_default(), last.unwrap_or_default()).into(),
        })
    })?;
    let base = derive_age(&base, "age", "birthdate", config.as_of)?;

    let grouped = aggregate(
        &base,
        &AggregationSpec::new(&["customer_key", "customer_number", "customer_name", "age"])
            .with(Aggregate::count_distinct("total_orders", "order_number"))
            .with(Aggregate::sum("total_sales", "sales_amount"))
            .with(Aggregate::sum("total_quantity", "quantity"))
            .with(Aggregate::count_distinct("total_products", "product_key"))
            .with(Aggregate::min("first_order_date", "order_date"))
            .with(Aggregate::max("last_order_date", "order_date")),
    )?;

    let t = derive_months_between(&grouped, "lifespan", "first_order_date", "last_order_date")?;
    let t = rules::age_group()?.apply(&t, "age_group")?;
    let t = rules::customer_segment(config)?.apply(&t, "customer_segment")?;
    let t = derive_recency(&t, "recency", "last_order_date", config.as_of)?;
    let t = derive_ratio(&t, "avg_order_value", "total_sales", "total_orders")?;
    let t = derive_ratio(&t, "avg_monthly_spend", "total_sales", "lifespan")?;

    let report = sort(
        &project(&t, &CUSTOMER_REPORT_COLUMNS)?,
        &[SortKey::asc("customer_key")],
    )?;
    info!(customers = report.len(), as_of = %config.as_of, "Built customer report");
    Ok(report)
}

/// One row per product with at least one dated sale.
pub fn build_product_report(facts: &Table, products: &Table, config: &ReportConfig) -> Result<Table> {
    let base = left_join(&dated_facts(facts)?, products, "product_key")?;
    let base = derive_ratio(&base, "unit_price", "sales_amount", "quantity")?;

    let grouped = aggregate(
        &base,
        &AggregationSpec::new(&["product_key", "product_name", "category", "subcategory", "cost"])
            .with(Aggregate::min("first_sale_date", "order_date"))
            .with(Aggregate::max("last_sale_date", "order_date"))
            .with(Aggregate::count_distinct("total_orders", "order_number"))
            .with(Aggregate::count_distinct("total_customers", "customer_key"))
            .with(Aggregate::sum("total_sales", "sales_amount"))
            .with(Aggregate::sum("total_quantity", "quantity"))
            .with(Aggregate::avg("unit_price_avg", "unit_price")),
    )?;

    let t = derive_months_between(&grouped, "lifespan", "first_sale_date", "last_sale_date")?;
    let t = derive_recency(&t, "recency_in_months", "last_sale_date", config.as_of)?;
    let t = rules::product_segment(config)?.apply(&t, "product_segment")?;
    let t = derive_rounded(&t, "avg_selling_price", "unit_price_avg", 1)?;
    let t = derive_ratio(&t, "avg_order_revenue", "total_sales", "total_orders")?;
    let t = derive_ratio(&t, "avg_monthly_revenue", "total_sales", "lifespan")?;

    let report = sort(
        &project(&t, &PRODUCT_REPORT_COLUMNS)?,
        &[SortKey::asc("product_key")],
    )?;
    info!(products = report.len(), as_of = %config.as_of, "Built product report");
    Ok(report)
}

// =============================================================================
// ENVELOPES
// =============================================================================

/// A report table tagged with its run metadata.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    /// Fresh per report or summary
    pub run_id: Uuid,
    /// Wall-clock build time
    pub generated_at: DateTime<Utc>,
    /// Reference date used for ages and recency
    pub as_of: NaiveDate,
    /// Report name, such as `customer_report`
    pub name: String,
    /// Report rows
    pub table: Table,
}

impl Report {
    /// Wrap `table` with a new run id and the current time.
    pub fn new(name: &str, as_of: NaiveDate, table: Table) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            generated_at: Utc::now(),
            as_of,
            name: name.to_string(),
            table,
        }
    }

    /// Pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Markdown document with a metadata header and the table.
    pub fn to_markdown(&self) -> String {
        let mut md = String::new();
        let _ = writeln!(md, "# {}\n", title(&self.name));
        let _ = writeln!(md, "**Run:** {}  ", self.run_id);
        let _ = writeln!(md, "**Generated:** {}  ", self.generated_at.to_rfc3339());
        let _ = writeln!(md, "**As of:** {}\n", self.as_of);
        md.push_str(&markdown_table(&self.table));
        md
    }
}

/// Headline views over the whole warehouse.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsSummary {
    /// Fresh per report or summary
    pub run_id: Uuid,
    /// Wall-clock build time
    pub generated_at: DateTime<Utc>,
    /// Reference date used for ages and recency
    pub as_of: NaiveDate,
    /// Warehouse totals
    pub key_metrics: Table,
    /// First and last order date
    pub date_range: Table,
    /// Customer counts per VIP/Regular/New segment
    pub customer_segments: Table,
    /// Highest-revenue products
    pub top_products: Table,
    /// Lowest-revenue products
    pub bottom_products: Table,
    /// Share of sales per category
    pub category_contribution: Table,
    /// Products per cost bucket
    pub product_cost_ranges: Table,
}

impl AnalyticsSummary {
    /// Pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Markdown document with one section per view.
    pub fn to_markdown(&self) -> String {
        let mut md = String::new();
        md.push_str("# Sales Analytics Summary\n\n");
        let _ = writeln!(md, "**Generated:** {}  ", self.generated_at.to_rfc3339());
        let _ = writeln!(md, "**As of:** {}\n", self.as_of);

        let sections = [
            ("Key Metrics", &self.key_metrics),
            ("Order Date Range", &self.date_range),
            ("Customer Segments", &self.customer_segments),
            ("Top Products", &self.top_products),
            ("Bottom Products", &self.bottom_products),
            ("Category Contribution", &self.category_contribution),
            ("Product Cost Ranges", &self.product_cost_ranges),
        ];
        for (heading, table) in sections {
            if table.is_empty() {
                continue;
            }
            let _ = writeln!(md, "## {heading}\n");
            md.push_str(&markdown_table(table));
            md.push('\n');
        }
        md
    }
}

fn title(name: &str) -> String {
    name.split('_')
        .map(|word| {
            let mut chars = word.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_uppercase().chain(chars).collect()
            })
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Render a table as a GitHub-flavoured Markdown table. Missing values are
/// left blank.
pub fn markdown_table(table: &Table) -> String {
    let names = table.column_names();
    let mut md = String::new();
    let _ = writeln!(md, "| {} |", names.join(" | "));
    let _ = writeln!(
        md,
        "|{}|",
        names
            .iter()
            .map(|n| "-".repeat(n.len() + 2))
            .collect::<Vec<_>>()
            .join("|")
    );
    for row in table.iter() {
        let cells: Vec<String> = row
            .values()
            .iter()
            .map(|v| match v {
                Value::Missing => String::new(),
                Value::Float(f) => format!("{f:.2}"),
                other => other.to_string().replace('|', "\\|"),
            })
            .collect();
        let _ = writeln!(md, "| {} |", cells.join(" | "));
    }
    md
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::from_records;
    use crate::queries::customer_segments;
    use warehouse_domain::{CustomerDim, FactRow, ProductDim};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn config() -> ReportConfig {
        ReportConfig::new(date(2014, 1, 15))
    }

    fn customers() -> Table {
        from_records(vec![
            CustomerDim::new(1, "Jon", "Yang", Some(date(1971, 10, 6))),
            CustomerDim::new(2, "Eugene", "Huang", Some(date(1994, 1, 16))),
            CustomerDim::new(3, "Ruben", "Torres", None),
        ])
        .unwrap()
    }

    fn products() -> Table {
        from_records(vec![
            ProductDim::new(10, "Road-150", "Bikes", "Road Bikes", 2171.0),
            ProductDim::new(20, "Helmet", "Accessories", "Helmets", 13.0),
        ])
        .unwrap()
    }

    /// Sales [6000, 4000, 1000] over lifespans [14, 13, 3].
    fn facts() -> Table {
        let mut undated = FactRow::new("SO9", 20, 3, date(2013, 5, 1), 999.0, 1);
        undated.order_date = None;
        from_records(vec![
            FactRow::new("SO1", 10, 1, date(2012, 1, 10), 3000.0, 1),
            FactRow::new("SO2", 10, 1, date(2013, 3, 10), 2950.0, 1),
            FactRow::new("SO2", 20, 1, date(2013, 3, 10), 50.0, 2),
            FactRow::new("SO3", 10, 2, date(2012, 1, 5), 2000.0, 1),
            FactRow::new("SO4", 10, 2, date(2013, 2, 5), 2000.0, 1),
            FactRow::new("SO5", 20, 3, date(2013, 1, 1), 500.0, 0),
            FactRow::new("SO6", 20, 3, date(2013, 4, 1), 500.0, 10),
            undated,
        ])
        .unwrap()
    }

    fn labels(table: &Table, column: &str) -> Vec<String> {
        table
            .column(column)
            .unwrap()
            .into_iter()
            .map(ToString::to_string)
            .collect()
    }

    #[test]
    fn test_customer_report_segments_one_each() {
        let report = build_customer_report(&facts(), &customers(), &config()).unwrap();

        assert_eq!(report.column_names(), CUSTOMER_REPORT_COLUMNS.to_vec());
        assert_eq!(labels(&report, "customer_key"), vec!["1", "2", "3"]);
        assert_eq!(labels(&report, "lifespan"), vec!["14", "13", "3"]);
        assert_eq!(labels(&report, "total_sales"), vec!["6000", "4000", "1000"]);
        assert_eq!(labels(&report, "customer_segment"), vec!["VIP", "Regular", "New"]);

        let counts = customer_segments(&report).unwrap();
        assert_eq!(counts.len(), 3);
        assert!(counts.column("total_customers").unwrap().iter().all(|v| **v == Value::Integer(1)));
    }

    #[test]
    fn test_customer_report_metrics() {
        let report = build_customer_report(&facts(), &customers(), &config()).unwrap();

        assert_eq!(report.value(0, "customer_name").unwrap(), &Value::from("Jon Yang"));
        assert_eq!(report.value(0, "total_orders").unwrap(), &Value::Integer(2));
        assert_eq!(report.value(0, "total_products").unwrap(), &Value::Integer(2));
        assert_eq!(report.value(0, "total_quantity").unwrap(), &Value::Integer(4));
        assert_eq!(report.value(0, "avg_order_value").unwrap(), &Value::Float(3000.0));
        assert_eq!(report.value(0, "recency").unwrap(), &Value::Integer(10));
        assert_eq!(report.value(0, "age").unwrap(), &Value::Integer(42));
        assert_eq!(report.value(0, "age_group").unwrap(), &Value::from("40-49"));

        // Born 1994-01-16, one day short of 20 on 2014-01-15.
        assert_eq!(report.value(1, "age").unwrap(), &Value::Integer(19));
        assert_eq!(report.value(1, "age_group").unwrap(), &Value::from("Under 20"));

        // No birthdate: age missing, falls through to the last band.
        assert!(report.value(2, "age").unwrap().is_missing());
        assert_eq!(report.value(2, "age_group").unwrap(), &Value::from("50 and above"));

        // The undated order is excluded from customer 3.
        assert_eq!(report.value(2, "total_orders").unwrap(), &Value::Integer(2));
    }

    #[test]
    fn test_single_order_customer_has_missing_monthly_spend() {
        let facts = from_records(vec![FactRow::new("SO1", 10, 1, date(2013, 6, 1), 120.0, 1)]).unwrap();
        let report = build_customer_report(&facts, &customers(), &config()).unwrap();

        assert_eq!(report.len(), 1);
        assert_eq!(report.value(0, "lifespan").unwrap(), &Value::Integer(0));
        assert!(report.value(0, "avg_monthly_spend").unwrap().is_missing());
        assert_eq!(report.value(0, "customer_segment").unwrap(), &Value::from("New"));
    }

    #[test]
    fn test_unknown_customer_still_reported() {
        let facts = from_records(vec![FactRow::new("SO1", 10, 99, date(2013, 6, 1), 120.0, 1)]).unwrap();
        let report = build_customer_report(&facts, &customers(), &config()).unwrap();

        assert_eq!(report.value(0, "customer_key").unwrap(), &Value::Integer(99));
        assert!(report.value(0, "customer_name").unwrap().is_missing());
    }

    #[test]
    fn test_product_report() {
        let report = build_product_report(&facts(), &products(), &config()).unwrap();

        assert_eq!(report.column_names(), PRODUCT_REPORT_COLUMNS.to_vec());
        assert_eq!(labels(&report, "product_key"), vec!["10", "20"]);

        // Road-150: 3000 + 2950 + 2000 + 2000
        assert_eq!(report.value(0, "total_sales").unwrap(), &Value::Float(9950.0));
        assert_eq!(report.value(0, "total_customers").unwrap(), &Value::Integer(2));
        assert_eq!(report.value(0, "lifespan").unwrap(), &Value::Integer(14));
        assert_eq!(report.value(0, "product_segment").unwrap(), &Value::from("Low-Performer"));
        assert_eq!(report.value(0, "avg_selling_price").unwrap(), &Value::Float(2487.5));

        // Helmet: quantity 0 line has no unit price; (25 + 50) / 2
        assert_eq!(report.value(1, "avg_selling_price").unwrap(), &Value::Float(37.5));
        assert_eq!(report.value(1, "total_orders").unwrap(), &Value::Integer(3));
        assert_eq!(report.value(1, "recency_in_months").unwrap(), &Value::Integer(9));
    }

    #[test]
    fn test_product_segment_thresholds_follow_config() {
        let mut cfg = config();
        cfg.mid_range_threshold = 5000.0;
        cfg.high_performer_threshold = 9000.0;
        let report = build_product_report(&facts(), &products(), &cfg).unwrap();
        assert_eq!(labels(&report, "product_segment"), vec!["High-Performer", "Low-Performer"]);
    }

    #[test]
    fn test_empty_facts_give_empty_reports() {
        let empty = Table::empty(crate::adapter::fact_schema());
        assert!(build_customer_report(&empty, &customers(), &config()).unwrap().is_empty());
        assert!(build_product_report(&empty, &products(), &config()).unwrap().is_empty());
    }

    #[test]
    fn test_envelope_serialization() {
        let report = build_customer_report(&facts(), &customers(), &config()).unwrap();
        let envelope = Report::new("customer_report", config().as_of, report);

        let json: serde_json::Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(json["name"], "customer_report");
        assert_eq!(json["as_of"], "2014-01-15");
        assert_eq!(json["table"].as_array().unwrap().len(), 3);
        assert_eq!(json["table"][0]["last_order_date"], "2013-03-10");
        assert!(json["table"][2]["age"].is_null());

        let md = envelope.to_markdown();
        assert!(md.starts_with("# Customer Report"));
        assert!(md.contains("| customer_key | customer_number |"));
        assert!(md.contains("| VIP |"));
    }
}
