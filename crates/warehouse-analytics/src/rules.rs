//! Segmentation rules.
//!
//! A [`RuleSet`] is an ordered list of (condition, label) pairs evaluated top
//! to bottom against one row of metrics. The first matching condition wins;
//! rows matching nothing get the fallback label. A rule set cannot be built
//! without a fallback, so every row is always classified.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ReportConfig;
use crate::error::{AnalyticsError, Result};
use crate::pipeline::derive;
use crate::table::{DataType, RowView, Schema, Table, Value};

/// Numeric comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    /// Less than
    #[serde(rename = "<")]
    Lt,
    /// Less than or equal
    #[serde(rename = "<=")]
    Le,
    /// Greater than
    #[serde(rename = ">")]
    Gt,
    /// Greater than or equal
    #[serde(rename = ">=")]
    Ge,
    /// Equal
    #[serde(rename = "=")]
    Eq,
}

impl CmpOp {
    fn holds(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Self::Lt => lhs < rhs,
            Self::Le => lhs <= rhs,
            Self::Gt => lhs > rhs,
            Self::Ge => lhs >= rhs,
            Self::Eq => lhs == rhs,
        }
    }
}

/// Declarative row condition. Any comparison against a missing value is
/// false.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    /// `column op value`
    Compare {
        /// Column read from the row
        column: String,
        /// Comparison applied
        op: CmpOp,
        /// Right-hand side
        value: f64,
    },
    /// Inclusive on both ends
    Between {
        /// Column read from the row
        column: String,
        /// Lower bound
        low: f64,
        /// Upper bound
        high: f64,
    },
    /// Holds when every nested condition holds
    All {
        /// Nested conditions, all required
        conditions: Vec<Condition>,
    },
}

impl Condition {
    /// `column op value`.
    pub fn compare(column: &str, op: CmpOp, value: f64) -> Self {
        Self::Compare {
            column: column.to_string(),
            op,
            value,
        }
    }

    /// `column < value`.
    pub fn lt(column: &str, value: f64) -> Self {
        Self::compare(column, CmpOp::Lt, value)
    }

    /// `column <= value`.
    pub fn le(column: &str, value: f64) -> Self {
        Self::compare(column, CmpOp::Le, value)
    }

    /// `column > value`.
    pub fn gt(column: &str, value: f64) -> Self {
        Self::compare(column, CmpOp::Gt, value)
    }

    /// `column >= value`.
    pub fn ge(column: &str, value: f64) -> Self {
        Self::compare(column, CmpOp::Ge, value)
    }

    /// `low <= column <= high`.
    pub fn between(column: &str, low: f64, high: f64) -> Self {
        Self::Between {
            column: column.to_string(),
            low,
            high,
        }
    }

    /// Conjunction; chaining onto an `All` extends it.
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        match self {
            Self::All { mut conditions } => {
                conditions.push(other);
                Self::All { conditions }
            }
            first => Self::All {
                conditions: vec![first, other],
            },
        }
    }

    fn columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Compare { column, .. } | Self::Between { column, .. } => out.push(column),
            Self::All { conditions } => conditions.iter().for_each(|c| c.columns(out)),
        }
    }

    /// Evaluate against one row.
    pub fn evaluate(&self, row: &RowView<'_>) -> Result<bool> {
        match self {
            Self::Compare { column, op, value } => {
                Ok(numeric(row, column)?.is_some_and(|v| op.holds(v, *value)))
            }
            Self::Between { column, low, high } => {
                Ok(numeric(row, column)?.is_some_and(|v| *low <= v && v <= *high))
            }
            Self::All { conditions } => {
                for condition in conditions {
                    if !condition.evaluate(row)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }
}

fn numeric(row: &RowView<'_>, column: &str) -> Result<Option<f64>> {
    let value = row.get(column)?;
    match value {
        Value::Missing => Ok(None),
        Value::Integer(_) | Value::Float(_) => Ok(value.as_f64()),
        other => Err(AnalyticsError::TypeMismatch {
            column: column.to_string(),
            expected: "numeric".to_string(),
            found: other
                .data_type()
                .map_or_else(|| "missing".to_string(), |t| t.to_string()),
        }),
    }
}

/// One classification branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Test applied to the row
    pub condition: Condition,
    /// Label assigned when the condition holds
    pub label: String,
}

/// Ordered rule list with a mandatory fallback label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RuleSetDefinition")]
pub struct RuleSet {
    name: String,
    rules: Vec<Rule>,
    fallback: String,
}

/// Wire form of a rule set; the fallback is checked on conversion.
#[derive(Debug, Deserialize)]
struct RuleSetDefinition {
    name: String,
    #[serde(default)]
    rules: Vec<Rule>,
    fallback: Option<String>,
}

impl TryFrom<RuleSetDefinition> for RuleSet {
    type Error = AnalyticsError;

    fn try_from(def: RuleSetDefinition) -> Result<Self> {
        let mut builder = RuleSet::builder(&def.name);
        builder.rules = def.rules;
        builder.fallback = def.fallback;
        builder.build()
    }
}

/// Builder for [`RuleSet`].
#[derive(Debug, Clone)]
pub struct RuleSetBuilder {
    name: String,
    rules: Vec<Rule>,
    fallback: Option<String>,
}

impl RuleSetBuilder {
    /// Append a rule; earlier rules win.
    #[must_use]
    pub fn when(mut self, condition: Condition, label: &str) -> Self {
        self.rules.push(Rule {
            condition,
            label: label.to_string(),
        });
        self
    }

    /// Label for rows no rule matches.
    #[must_use]
    pub fn otherwise(mut self, label: &str) -> Self {
        self.fallback = Some(label.to_string());
        self
    }

    /// Fails with `AmbiguousRuleSet` if no fallback was given.
    pub fn build(self) -> Result<RuleSet> {
        let fallback = self.fallback.ok_or_else(|| AnalyticsError::AmbiguousRuleSet {
            rule_set: self.name.clone(),
        })?;
        Ok(RuleSet {
            name: self.name,
            rules: self.rules,
            fallback,
        })
    }
}

impl RuleSet {
    /// Start an empty rule set named `name`.
    pub fn builder(name: &str) -> RuleSetBuilder {
        RuleSetBuilder {
            name: name.to_string(),
            rules: Vec::new(),
            fallback: None,
        }
    }

    /// Rule set name, used in error messages.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rules in evaluation order.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Label for rows no rule matches.
    pub fn fallback(&self) -> &str {
        &self.fallback
    }

    /// Label of the first matching rule, or the fallback.
    pub fn classify(&self, row: &RowView<'_>) -> Result<&str> {
        for rule in &self.rules {
            if rule.condition.evaluate(row)? {
                return Ok(&rule.label);
            }
        }
        Ok(&self.fallback)
    }

    /// Check every referenced column exists in `schema`.
    pub fn check_columns(&self, schema: &Schema) -> Result<()> {
        let mut columns = Vec::new();
        for rule in &self.rules {
            rule.condition.columns(&mut columns);
        }
        for column in columns {
            schema.index_of(column)?;
        }
        Ok(())
    }

    /// Append `output` holding each row's label.
    pub fn apply(&self, table: &Table, output: &str) -> Result<Table> {
        self.check_columns(table.schema())?;
        debug!(rule_set = %self.name, rows = table.len(), output, "Applying rule set");
        derive(table, output, DataType::String, |row| {
            self.classify(row).map(Value::from)
        })
    }
}

// =============================================================================
// BUILT-IN RULE SETS
// =============================================================================

/// VIP / Regular / New by lifespan and total sales.
pub fn customer_segment(config: &ReportConfig) -> Result<RuleSet> {
    let lifespan = config.vip_min_lifespan_months as f64;
    RuleSet::builder("customer_segment")
        .when(
            Condition::ge("lifespan", lifespan).and(Condition::gt("total_sales", config.vip_sales_threshold)),
            "VIP",
        )
        .when(
            Condition::ge("lifespan", lifespan).and(Condition::le("total_sales", config.vip_sales_threshold)),
            "Regular",
        )
        .otherwise("New")
        .build()
}

/// High-Performer / Mid-Range / Low-Performer by total sales.
pub fn product_segment(config: &ReportConfig) -> Result<RuleSet> {
    RuleSet::builder("product_segment")
        .when(Condition::gt("total_sales", config.high_performer_threshold), "High-Performer")
        .when(Condition::ge("total_sales", config.mid_range_threshold), "Mid-Range")
        .otherwise("Low-Performer")
        .build()
}

/// Age bands over the `age` column.
pub fn age_group() -> Result<RuleSet> {
    RuleSet::builder("age_group")
        .when(Condition::lt("age", 20.0), "Under 20")
        .when(Condition::between("age", 20.0, 29.0), "20-29")
        .when(Condition::between("age", 30.0, 39.0), "30-39")
        .when(Condition::between("age", 40.0, 49.0), "40-49")
        .otherwise("50 and above")
        .build()
}

/// Product cost buckets over the `cost` column.
///
/// Both middle bands include 500; the first listed wins, so a cost of
/// exactly 500 lands in "100-500".
pub fn cost_bucket() -> Result<RuleSet> {
    RuleSet::builder("cost_range")
        .when(Condition::lt("cost", 100.0), "Below 100")
        .when(Condition::between("cost", 100.0, 500.0), "100-500")
        .when(Condition::between("cost", 500.0, 1000.0), "500-1000")
        .otherwise("Above 1000")
        .build()
}

/// Above Avg / Below Avg / Avg over a difference-to-average column.
pub fn average_change(column: &str) -> Result<RuleSet> {
    RuleSet::builder("avg_change")
        .when(Condition::gt(column, 0.0), "Above Avg")
        .when(Condition::lt(column, 0.0), "Below Avg")
        .otherwise("Avg")
        .build()
}

/// Increase / Decrease / No Change over a difference-to-prior-period column.
pub fn prior_period_change(column: &str) -> Result<RuleSet> {
    RuleSet::builder("py_change")
        .when(Condition::gt(column, 0.0), "Increase")
        .when(Condition::lt(column, 0.0), "Decrease")
        .otherwise("No Change")
        .build()
}
