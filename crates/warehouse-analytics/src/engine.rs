//! Analytics engine over in-memory star-schema tables.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;
use warehouse_domain::{
    CustomerDim, FactRow, ProductDim, ensure_unique_customer_keys, ensure_unique_product_keys,
};

use crate::adapter::{RowSource, customer_schema, fact_schema, from_records, load_source, product_schema};
use crate::config::ReportConfig;
use crate::error::{AnalyticsError, Result};
use crate::queries::{self, Direction, Period};
use crate::reports::{AnalyticsSummary, Report, build_customer_report, build_product_report};
use crate::table::{Schema, Table};

/// Holds the fact table, both dimensions and the run configuration.
///
/// Tables are shared by `Arc` so the engine can be cloned cheaply into
/// worker tasks.
#[derive(Debug, Clone)]
pub struct AnalyticsEngine {
    facts: Arc<Table>,
    products: Arc<Table>,
    customers: Arc<Table>,
    config: ReportConfig,
}

impl AnalyticsEngine {
    /// Create an engine from already-loaded tables.
    ///
    /// Each table must carry the columns of its declared schema and the
    /// dimension keys must be unique.
    pub fn new(facts: Table, products: Table, customers: Table, config: ReportConfig) -> Result<Self> {
        config.validate()?;
        require_columns(&facts, &fact_schema())?;
        require_columns(&products, &product_schema())?;
        require_columns(&customers, &customer_schema())?;
        ensure_unique_column(&products, "product_key")?;
        ensure_unique_column(&customers, "customer_key")?;

        debug!(
            facts = facts.len(),
            products = products.len(),
            customers = customers.len(),
            "Created analytics engine"
        );
        Ok(Self {
            facts: Arc::new(facts),
            products: Arc::new(products),
            customers: Arc::new(customers),
            config,
        })
    }

    /// Create an engine from typed domain records.
    pub fn from_records(
        facts: Vec<FactRow>,
        products: Vec<ProductDim>,
        customers: Vec<CustomerDim>,
        config: ReportConfig,
    ) -> Result<Self> {
        ensure_unique_product_keys(&products)?;
        ensure_unique_customer_keys(&customers)?;
        Self::new(
            from_records(facts)?,
            from_records(products)?,
            from_records(customers)?,
            config,
        )
    }

    /// Create an engine by loading three row sources.
    pub fn from_sources(
        facts: &dyn RowSource,
        products: &dyn RowSource,
        customers: &dyn RowSource,
        config: ReportConfig,
    ) -> Result<Self> {
        Self::new(
            load_source(facts)?,
            load_source(products)?,
            load_source(customers)?,
            config,
        )
    }

    /// Thresholds and reference date the engine was built with.
    pub fn config(&self) -> &ReportConfig {
        &self.config
    }

    /// Loaded sales fact table.
    pub fn facts(&self) -> &Table {
        &self.facts
    }

    /// Loaded product dimension.
    pub fn products(&self) -> &Table {
        &self.products
    }

    /// Loaded customer dimension.
    pub fn customers(&self) -> &Table {
        &self.customers
    }

    // =========================================================================
    // REPORTS
    // =========================================================================

    /// Run the customer report.
    pub fn customer_report(&self) -> Result<Report> {
        let table = build_customer_report(&self.facts, &self.customers, &self.config)?;
        let report = Report::new("customer_report", self.config.as_of, table);
        info!(run_id = %report.run_id, rows = report.table.len(), "Customer report ready");
        Ok(report)
    }

    /// Run the product report.
    pub fn product_report(&self) -> Result<Report> {
        let table = build_product_report(&self.facts, &self.products, &self.config)?;
        let report = Report::new("product_report", self.config.as_of, table);
        info!(run_id = %report.run_id, rows = report.table.len(), "Product report ready");
        Ok(report)
    }

    /// Headline metrics, rankings and distributions in one bundle.
    pub fn summary(&self) -> Result<AnalyticsSummary> {
        let customer_report = build_customer_report(&self.facts, &self.customers, &self.config)?;
        let summary = AnalyticsSummary {
            run_id: Uuid::new_v4(),
            generated_at: Utc::now(),
            as_of: self.config.as_of,
            key_metrics: self.key_metrics()?,
            date_range: self.date_range()?,
            customer_segments: queries::customer_segments(&customer_report)?,
            top_products: self.products_by_revenue(Direction::Top)?,
            bottom_products: self.products_by_revenue(Direction::Bottom)?,
            category_contribution: self.category_contribution()?,
            product_cost_ranges: self.product_cost_ranges()?,
        };
        info!(run_id = %summary.run_id, "Analytics summary ready");
        Ok(summary)
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// Warehouse totals as `measure_name`/`measure_value` rows.
    pub fn key_metrics(&self) -> Result<Table> {
        queries::key_metrics(&self.facts, &self.products, &self.customers)
    }

    /// First and last order date and the span in months.
    pub fn date_range(&self) -> Result<Table> {
        queries::date_range_summary(&self.facts)
    }

    /// Top or bottom `config.top_n` products by revenue.
    pub fn products_by_revenue(&self, direction: Direction) -> Result<Table> {
        queries::products_by_revenue(&self.facts, &self.products, self.config.top_n, direction)
    }

    /// Top or bottom `config.top_n` customers by revenue.
    pub fn customers_by_revenue(&self, direction: Direction) -> Result<Table> {
        queries::customers_by_revenue(&self.facts, &self.customers, self.config.top_n, direction)
    }

    /// The `config.top_n` customers with the fewest distinct orders.
    pub fn customers_with_fewest_orders(&self) -> Result<Table> {
        queries::customers_with_fewest_orders(&self.facts, &self.customers, self.config.top_n)
    }

    /// Sales, customers and quantity per period.
    pub fn sales_over_time(&self, period: Period) -> Result<Table> {
        queries::sales_over_time(&self.facts, period)
    }

    /// Per-period totals with a running total and running average price,
    /// restarting each year.
    pub fn cumulative_sales(&self, period: Period) -> Result<Table> {
        queries::cumulative_sales(&self.facts, period)
    }

    /// Yearly product sales against the product's average and prior year.
    pub fn yearly_product_performance(&self) -> Result<Table> {
        queries::yearly_product_performance(&self.facts, &self.products)
    }

    /// Share of total sales per category.
    pub fn category_contribution(&self) -> Result<Table> {
        queries::category_contribution(&self.facts, &self.products)
    }

    /// Product counts per cost bucket.
    pub fn product_cost_ranges(&self) -> Result<Table> {
        queries::product_cost_ranges(&self.products)
    }

    /// Customer counts per country.
    pub fn customers_by_country(&self) -> Result<Table> {
        queries::customers_by_country(&self.customers)
    }

    /// Total revenue per category.
    pub fn revenue_by_category(&self) -> Result<Table> {
        queries::revenue_by_category(&self.facts, &self.products)
    }
}

fn require_columns(table: &Table, expected: &Schema) -> Result<()> {
    for column in expected.columns() {
        let found = table.schema().data_type(&column.name)?;
        if found != column.data_type {
            return Err(AnalyticsError::TypeMismatch {
                column: column.name.clone(),
                expected: column.data_type.to_string(),
                found: found.to_string(),
            });
        }
    }
    Ok(())
}

fn ensure_unique_column(table: &Table, key: &str) -> Result<()> {
    let mut seen = HashSet::new();
    for value in table.column(key)? {
        if !value.is_missing() && !seen.insert(value) {
            return Err(AnalyticsError::InvalidParameter(format!(
                "duplicate {key} {value}"
            )));
        }
    }
    Ok(())
}
