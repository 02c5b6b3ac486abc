//! Report assembly and JSON emission
//!
//! Timestamps are rewritten to one canonical form (RFC 3339, UTC, `Z`
//! suffix) before anything is written, so two runs over the same data produce
//! the same bytes.

use crate::config::RunConfig;
use crate::resource::{ProgressSnapshot, RunOutcome, UnitFailure};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use std::io::Write;
use std::path::Path;
use uuid::Uuid;

/// Key the run metadata is stored under in the report
pub const METADATA_KEY: &str = "_metadata";

/// Formats accepted besides RFC 3339
const EXTRA_TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%:z"];

/// Formats without an offset, read as UTC
const NAIVE_TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Canonical form of a timestamp string, `None` if it is not one
pub fn canonical_timestamp(value: &str) -> Option<String> {
    // cheap reject before trying every format
    let bytes = value.as_bytes();
    if bytes.len() < 19 || bytes[4] != b'-' || bytes[7] != b'-' {
        return None;
    }

    let parsed = DateTime::parse_from_rfc3339(value)
        .ok()
        .or_else(|| {
            EXTRA_TIMESTAMP_FORMATS
                .iter()
                .find_map(|fmt| DateTime::parse_from_str(value, fmt).ok())
        })
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|| {
            NAIVE_TIMESTAMP_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
                .map(|naive| naive.and_utc())
        })?;

    Some(parsed.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

/// Rewrite every timestamp string inside `value` in place
pub fn canonicalize_timestamps(value: &mut Value) {
    match value {
        Value::String(s) => {
            if let Some(canonical) = canonical_timestamp(s) {
                *s = canonical;
            }
        }
        Value::Array(items) => items.iter_mut().for_each(canonicalize_timestamps),
        Value::Object(map) => map.values_mut().for_each(canonicalize_timestamps),
        _ => {}
    }
}

/// Run metadata attached with `with_meta`
#[derive(Debug, Clone, Serialize)]
pub struct RunMetadata {
    pub run_id: Uuid,
    pub version: &'static str,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub regions: Vec<String>,
    pub resources: Vec<String>,
    pub progress: ProgressSnapshot,
    pub cancelled: usize,
    pub timed_out: bool,
    pub leaves: usize,
    pub items: usize,
    pub failures: Vec<UnitFailure>,
}

impl RunMetadata {
    pub fn new(outcome: &RunOutcome, config: &RunConfig) -> Self {
        Self {
            run_id: outcome.run_id,
            version: crate::VERSION,
            started_at: outcome.started_at,
            finished_at: outcome.finished_at,
            regions: config.regions.clone(),
            resources: config.resources.clone(),
            progress: outcome.progress,
            cancelled: outcome.cancelled,
            timed_out: outcome.timed_out,
            leaves: outcome.tree.leaf_count(),
            items: outcome.tree.item_count(),
            failures: outcome.failures.clone(),
        }
    }
}

/// The document written at the end of a run: the tree, plus metadata on request
pub fn build_report(outcome: &RunOutcome, config: &RunConfig) -> Result<Value> {
    let mut report = serde_json::to_value(&outcome.tree).context("Failed to serialize result tree")?;
    canonicalize_timestamps(&mut report);

    if config.with_meta {
        let metadata = serde_json::to_value(RunMetadata::new(outcome, config))
            .context("Failed to serialize run metadata")?;
        if let Value::Object(ref mut map) = report {
            map.insert(METADATA_KEY.to_string(), metadata);
        }
    }

    Ok(report)
}

pub fn render(report: &Value, pretty: bool) -> Result<String> {
    let rendered = if pretty {
        serde_json::to_string_pretty(report)
    } else {
        serde_json::to_string(report)
    };
    rendered.context("Failed to render report")
}

/// Write to `path`, or stdout when `None`
pub fn write_report(report: &Value, path: Option<&Path>, pretty: bool) -> Result<()> {
    let rendered = render(report, pretty)?;

    match path {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, rendered)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            tracing::info!("Report written to {}", path.display());
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{}", rendered).context("Failed to write report to stdout")?;
        }
    }

    Ok(())
}
