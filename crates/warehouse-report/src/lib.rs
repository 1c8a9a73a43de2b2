//! # Warehouse Report
//!
//! Command-line host for the sales warehouse analytics engine.
//!
//! ## Features
//!
//! - JSON-lines row sources for the fact table and both dimensions
//! - Environment configuration with command-line overrides
//! - Customer and product reports run concurrently on blocking tasks
//! - JSON or Markdown output

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod input;
pub mod output;
pub mod runner;

pub use input::JsonLinesSource;
pub use output::{OutputFormat, render};
pub use runner::{Overrides, run_reports, run_summary};
