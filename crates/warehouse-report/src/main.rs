//! Warehouse Report CLI
//!
//! Loads sales facts, products and customers from JSON-lines files and runs
//! the customer and product reports.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use warehouse_analytics::adapter::{customer_schema, fact_schema, product_schema};
use warehouse_analytics::{AnalyticsEngine, ReportConfig};
use warehouse_report::{JsonLinesSource, OutputFormat, Overrides, render, run_reports, run_summary};

#[derive(Parser, Debug)]
#[command(name = "warehouse-report")]
#[command(about = "Customer and product reports over sales warehouse extracts")]
struct Args {
    /// Sales fact rows (JSON lines)
    #[arg(long)]
    facts: PathBuf,

    /// Product dimension rows (JSON lines)
    #[arg(long)]
    products: PathBuf,

    /// Customer dimension rows (JSON lines)
    #[arg(long)]
    customers: PathBuf,

    /// Reference date for age and recency (YYYY-MM-DD)
    #[arg(long)]
    as_of: Option<NaiveDate>,

    /// Total sales above which a long-standing customer is VIP
    #[arg(long)]
    vip_sales_threshold: Option<f64>,

    /// Minimum customer lifespan in months for VIP/Regular
    #[arg(long)]
    vip_min_lifespan_months: Option<i64>,

    /// Total sales above which a product is a High-Performer
    #[arg(long)]
    high_performer_threshold: Option<f64>,

    /// Total sales at or above which a product is Mid-Range
    #[arg(long)]
    mid_range_threshold: Option<f64>,

    /// Rows kept by top/bottom rankings in the summary
    #[arg(long)]
    top_n: Option<usize>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,

    /// Also produce the analytics summary
    #[arg(long)]
    summary: bool,

    /// Write output to this file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            as_of: self.as_of,
            vip_sales_threshold: self.vip_sales_threshold,
            vip_min_lifespan_months: self.vip_min_lifespan_months,
            high_performer_threshold: self.high_performer_threshold,
            mid_range_threshold: self.mid_range_threshold,
            top_n: self.top_n,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so stdout carries only report output
    let filter = EnvFilter::from_default_env()
        .add_directive("warehouse_report=info".parse()?)
        .add_directive("warehouse_analytics=info".parse()?);
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let config = args
        .overrides()
        .apply(ReportConfig::from_env().context("reading REPORT_* environment")?)?;
    info!(as_of = %config.as_of, top_n = config.top_n, "Configuration loaded");

    let facts = JsonLinesSource::open(&args.facts, fact_schema())?;
    let products = JsonLinesSource::open(&args.products, product_schema())?;
    let customers = JsonLinesSource::open(&args.customers, customer_schema())?;
    info!(
        facts = facts.len(),
        products = products.len(),
        customers = customers.len(),
        "Input files read"
    );

    let engine = Arc::new(
        AnalyticsEngine::from_sources(&facts, &products, &customers, config)
            .context("loading warehouse tables")?,
    );

    let reports = run_reports(Arc::clone(&engine)).await?;
    let summary = if args.summary {
        Some(run_summary(Arc::clone(&engine)).await?)
    } else {
        None
    };

    let rendered = render(&reports, summary.as_ref(), args.format)?;
    match &args.output {
        Some(path) => {
            std::fs::write(path, rendered).with_context(|| format!("writing {}", path.display()))?;
            info!(path = %path.display(), "Output written");
        }
        None => print!("{rendered}"),
    }

    Ok(())
}
