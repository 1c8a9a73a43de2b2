//! # Report Configuration
//!
//! Parameters for segmentation and KPI rules. Nothing here is hardcoded in
//! the rules themselves so reports can be evaluated against any reference
//! date and thresholds.

use std::env;
use std::str::FromStr;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AnalyticsError, Result};
use crate::table::DATE_FORMAT;

/// Report run parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Reference date for age and recency
    pub as_of: NaiveDate,

    /// Customers above this total are VIP (when their lifespan qualifies)
    pub vip_sales_threshold: f64,

    /// Minimum lifespan in months for VIP/Regular
    pub vip_min_lifespan_months: i64,

    /// Products above this total are High-Performers
    pub high_performer_threshold: f64,

    /// Products at or above this total are Mid-Range
    pub mid_range_threshold: f64,

    /// Row count for top/bottom-N queries
    pub top_n: usize,
}

impl ReportConfig {
    /// Default thresholds evaluated as of `as_of`
    pub fn new(as_of: NaiveDate) -> Self {
        Self {
            as_of,
            vip_sales_threshold: 5000.0,
            vip_min_lifespan_months: 12,
            high_performer_threshold: 50_000.0,
            mid_range_threshold: 10_000.0,
            top_n: 5,
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup, falling back to
    /// defaults for absent keys
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let as_of = match lookup("REPORT_AS_OF") {
            Some(raw) => NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT)
                .map_err(|e| AnalyticsError::Config(format!("REPORT_AS_OF '{raw}': {e}")))?,
            None => defaults.as_of,
        };

        let config = Self {
            as_of,
            vip_sales_threshold: parse_or(
                &lookup,
                "REPORT_VIP_SALES_THRESHOLD",
                defaults.vip_sales_threshold,
            )?,
            vip_min_lifespan_months: parse_or(
                &lookup,
                "REPORT_VIP_MIN_LIFESPAN_MONTHS",
                defaults.vip_min_lifespan_months,
            )?,
            high_performer_threshold: parse_or(
                &lookup,
                "REPORT_HIGH_PERFORMER_THRESHOLD",
                defaults.high_performer_threshold,
            )?,
            mid_range_threshold: parse_or(
                &lookup,
                "REPORT_MID_RANGE_THRESHOLD",
                defaults.mid_range_threshold,
            )?,
            top_n: parse_or(&lookup, "REPORT_TOP_N", defaults.top_n)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject threshold combinations the rule sets cannot express
    pub fn validate(&self) -> Result<()> {
        if self.top_n == 0 {
            return Err(AnalyticsError::Config("top_n must be at least 1".to_string()));
        }
        if self.mid_range_threshold > self.high_performer_threshold {
            return Err(AnalyticsError::Config(format!(
                "mid-range threshold {} exceeds high-performer threshold {}",
                self.mid_range_threshold, self.high_performer_threshold
            )));
        }
        if self.vip_min_lifespan_months < 0 {
            return Err(AnalyticsError::Config(
                "VIP minimum lifespan cannot be negative".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self::new(Utc::now().date_naive())
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| AnalyticsError::Config(format!("{key} '{raw}': {e}"))),
        None => Ok(default),
    }
}
