//! # Sales Warehouse Analytics
//!
//! In-memory analytics engine for a sales star schema (one sales fact
//! table, product and customer dimensions).
//!
//! ## Features
//!
//! - Schema-checked immutable tables with an explicit missing value
//! - Group-by aggregation and window functions with stable ordering
//! - Declarative segmentation rule sets with a mandatory fallback
//! - Guarded KPI derivations (no division by zero, no NaN)
//! - Customer and product reports plus a catalog of analytical queries

#![forbid(unsafe_code)]
#![warn(clippy::all, missing_docs)]

pub mod adapter;
pub mod config;
pub mod engine;
pub mod error;
pub mod kpi;
pub mod pipeline;
pub mod queries;
pub mod reports;
pub mod rules;
pub mod table;

pub use adapter::{MemorySource, RawRow, Record, RowSource, from_records, load, load_source};
pub use config::ReportConfig;
pub use engine::AnalyticsEngine;
pub use error::{AnalyticsError, Result};
pub use queries::{Direction, Period};
pub use reports::{AnalyticsSummary, Report, build_customer_report, build_product_report};
pub use rules::{Condition, RuleSet};
pub use table::{Column, DataType, Schema, Table, Value};
