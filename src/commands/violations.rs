use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{info, warn};

use crate::cli::ViolationsArgs;
use crate::model::AggregateReport;

pub const DEFAULT_METRICS: [&str; 4] = ["Fluency", "Coherence", "Groundedness", "Relevance"];

pub fn resolve_metrics(metrics: &[String]) -> Vec<String> {
    if metrics.is_empty() {
        DEFAULT_METRICS.iter().map(|name| name.to_string()).collect()
    } else {
        metrics.to_vec()
    }
}

pub fn report_path(report_dir: &Path, signal_name: &str) -> PathBuf {
    report_dir.join("signals").join(format!("{signal_name}.json"))
}

/// Metrics whose aggregate pass rate fell below its threshold, in configured
/// metric order. Read and parse failures are downgraded to an empty result,
/// never a fatal error.
pub fn detect(report_dir: &Path, signal_name: &str, metrics: &[String]) -> Vec<String> {
    match try_detect(report_dir, signal_name, metrics) {
        Ok(violated) => violated,
        Err(err) => {
            warn!(
                signal_name = %signal_name,
                error = %err,
                "failed to read aggregate report, treating as no violated metrics"
            );
            Vec::new()
        }
    }
}

fn try_detect(report_dir: &Path, signal_name: &str, metrics: &[String]) -> Result<Vec<String>> {
    let path = report_path(report_dir, signal_name);
    let raw = fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
    let report: AggregateReport = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;

    let mut violated = Vec::new();
    for metric in metrics {
        let key = format!("Aggregated{metric}PassRate");
        let Some(entry) = report.metrics.get(&key) else {
            continue;
        };

        let value = entry.get("value").and_then(Value::as_f64);
        let threshold = entry.get("threshold").and_then(Value::as_f64);
        let (Some(value), Some(threshold)) = (value, threshold) else {
            warn!(metric = %metric, "pass-rate entry missing value or threshold, skipping");
            continue;
        };

        if value < threshold {
            info!(metric = %metric, value, threshold, "aggregate pass rate below threshold");
            violated.push(metric.clone());
        }
    }

    Ok(violated)
}

pub fn run(args: ViolationsArgs) -> Result<()> {
    let report_dir = args
        .report_dir
        .unwrap_or_else(|| args.cache_root.join("reports"));
    let metrics = resolve_metrics(&args.metrics);
    let violated = detect(&report_dir, &args.signal_name, &metrics);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&violated)?);
        return Ok(());
    }

    if violated.is_empty() {
        info!(signal_name = %args.signal_name, "no violated metrics");
    } else {
        for metric in &violated {
            info!(signal_name = %args.signal_name, metric = %metric, "violated metric");
        }
    }

    Ok(())
}
