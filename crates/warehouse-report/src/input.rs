//! JSON-lines row sources.
//!
//! One JSON object per line. Scalars are handed to the engine as text so the
//! schema adapter does all type coercion; `null` becomes a missing field.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde_json::{Map, Value as Json};
use tracing::debug;
use warehouse_analytics::{RawRow, RowSource, Schema};

/// Rows read from a JSON-lines file.
#[derive(Debug, Clone)]
pub struct JsonLinesSource {
    schema: Schema,
    rows: Vec<RawRow>,
}

impl JsonLinesSource {
    /// Read every row of the file at `path`.
    pub fn open(path: &Path, schema: Schema) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let source = Self::from_reader(file, schema)
            .with_context(|| format!("reading {}", path.display()))?;
        debug!(path = %path.display(), rows = source.rows.len(), "Read JSON-lines file");
        Ok(source)
    }

    /// Read rows from any reader. Blank lines are skipped.
    pub fn from_reader<R: Read>(reader: R, schema: Schema) -> Result<Self> {
        let mut rows = Vec::new();
        for (idx, line) in BufReader::new(reader).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let parsed: Json =
                serde_json::from_str(&line).with_context(|| format!("line {}", idx + 1))?;
            let Json::Object(object) = parsed else {
                bail!("line {}: expected a JSON object", idx + 1);
            };
            rows.push(raw_row(object));
        }
        Ok(Self { schema, rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl RowSource for JsonLinesSource {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn rows(&self) -> Box<dyn Iterator<Item = RawRow> + '_> {
        Box::new(self.rows.iter().cloned())
    }
}

fn raw_row(object: Map<String, Json>) -> RawRow {
    object
        .into_iter()
        .map(|(key, value)| {
            let text = match value {
                Json::Null => None,
                Json::String(s) => Some(s),
                other => Some(other.to_string()),
            };
            (key, text)
        })
        .collect()
}
