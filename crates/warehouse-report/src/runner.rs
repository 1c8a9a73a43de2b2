//! Configuration overrides and concurrent report execution.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tokio::task;
use tracing::info;
use warehouse_analytics::{AnalyticsEngine, AnalyticsSummary, Report, ReportConfig};

/// Command-line values that take precedence over the environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub as_of: Option<NaiveDate>,
    pub vip_sales_threshold: Option<f64>,
    pub vip_min_lifespan_months: Option<i64>,
    pub high_performer_threshold: Option<f64>,
    pub mid_range_threshold: Option<f64>,
    pub top_n: Option<usize>,
}

impl Overrides {
    /// Apply overrides on top of `base` and re-validate.
    pub fn apply(self, mut base: ReportConfig) -> Result<ReportConfig> {
        if let Some(v) = self.as_of {
            base.as_of = v;
        }
        if let Some(v) = self.vip_sales_threshold {
            base.vip_sales_threshold = v;
        }
        if let Some(v) = self.vip_min_lifespan_months {
            base.vip_min_lifespan_months = v;
        }
        if let Some(v) = self.high_performer_threshold {
            base.high_performer_threshold = v;
        }
        if let Some(v) = self.mid_range_threshold {
            base.mid_range_threshold = v;
        }
        if let Some(v) = self.top_n {
            base.top_n = v;
        }
        base.validate().context("invalid report configuration")?;
        Ok(base)
    }
}

/// Run the customer and product reports on blocking tasks.
pub async fn run_reports(engine: Arc<AnalyticsEngine>) -> Result<Vec<Report>> {
    let customers = task::spawn_blocking({
        let engine = Arc::clone(&engine);
        move || engine.customer_report()
    });
    let products = task::spawn_blocking({
        let engine = Arc::clone(&engine);
        move || engine.product_report()
    });

    let (customers, products) = tokio::try_join!(customers, products).context("report task panicked")?;
    let reports = vec![
        customers.context("customer report failed")?,
        products.context("product report failed")?,
    ];
    for report in &reports {
        info!(name = %report.name, run_id = %report.run_id, rows = report.table.len(), "Report finished");
    }
    Ok(reports)
}

/// Build the analytics summary on a blocking task.
pub async fn run_summary(engine: Arc<AnalyticsEngine>) -> Result<AnalyticsSummary> {
    let summary = task::spawn_blocking(move || engine.summary())
        .await
        .context("summary task panicked")?
        .context("summary failed")?;
    Ok(summary)
}
