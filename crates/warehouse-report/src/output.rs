//! Rendering of report runs as JSON or Markdown.

use anyhow::Result;
use clap::ValueEnum;
use serde::Serialize;
use warehouse_analytics::{AnalyticsSummary, Report};

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Markdown,
}

#[derive(Serialize)]
struct RunOutput<'a> {
    reports: &'a [Report],
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<&'a AnalyticsSummary>,
}

/// Render every report, plus the summary when one was produced.
pub fn render(reports: &[Report], summary: Option<&AnalyticsSummary>, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => {
            let mut out = serde_json::to_string_pretty(&RunOutput { reports, summary })?;
            out.push('\n');
            Ok(out)
        }
        OutputFormat::Markdown => {
            let mut sections: Vec<String> = reports.iter().map(Report::to_markdown).collect();
            if let Some(summary) = summary {
                sections.push(summary.to_markdown());
            }
            Ok(sections.join("\n---\n\n"))
        }
    }
}
