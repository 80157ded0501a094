use std::fs;

use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::labels::LabelSet;
use crate::model::TriageRunManifest;

pub fn run(args: StatusArgs) -> Result<()> {
    let manifest_dir = args.cache_root.join("manifests");
    let output_db_path = args
        .output_db_path
        .unwrap_or_else(|| args.cache_root.join("problem_traffic.sqlite"));

    info!(cache_root = %args.cache_root.display(), "status requested");

    match latest_manifest_path(&manifest_dir)? {
        Some(path) => {
            let raw = fs::read(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let manifest: TriageRunManifest = serde_json::from_slice(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?;

            info!(
                path = %path.display(),
                run_id = %manifest.run_id,
                status = %manifest.status,
                signal_name = %manifest.signal_name,
                started_at = %manifest.started_at,
                updated_at = %manifest.updated_at,
                violated_metrics = %manifest.violated_metrics.join(","),
                input_rows = manifest.counts.input_rows,
                topic_rows = manifest.counts.topic_rows,
                span_rows_written = manifest.counts.span_rows_written,
                warnings = manifest.warnings.len(),
                "loaded latest triage run manifest"
            );
        }
        None => {
            warn!(path = %manifest_dir.display(), "no triage run manifests found");
        }
    }

    if output_db_path.exists() {
        let connection = Connection::open(&output_db_path)
            .with_context(|| format!("failed to open {}", output_db_path.display()))?;
        let sql = format!("SELECT COUNT(*) FROM {}", args.output_table);
        let rows: i64 = connection
            .query_row(&sql, [], |row| row.get(0))
            .unwrap_or(0);
        let topics = distinct_topics(&connection, &args.output_table).unwrap_or_default();

        info!(
            path = %output_db_path.display(),
            table = %args.output_table,
            rows,
            distinct_topics = topics.len(),
            "output database status"
        );
    } else {
        warn!(path = %output_db_path.display(), "output database missing");
    }

    Ok(())
}

fn distinct_topics(connection: &Connection, table: &str) -> Result<LabelSet> {
    let sql = format!("SELECT topic_list FROM {table}");
    let mut statement = connection.prepare(&sql)?;
    let mut rows = statement.query([])?;

    let mut topics = LabelSet::new();
    while let Some(row) = rows.next()? {
        let encoded: Option<String> = row.get(0)?;
        if let Some(encoded) = encoded {
            for topic in LabelSet::decode(&encoded).iter() {
                topics.insert(topic);
            }
        }
    }

    Ok(topics)
}

fn latest_manifest_path(manifest_dir: &std::path::Path) -> Result<Option<std::path::PathBuf>> {
    if !manifest_dir.exists() {
        return Ok(None);
    }

    let mut candidates = Vec::new();
    for entry in fs::read_dir(manifest_dir)
        .with_context(|| format!("failed to list {}", manifest_dir.display()))?
    {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with("triage_run_") && name.ends_with(".json") {
            candidates.push(entry.path());
        }
    }

    candidates.sort();
    Ok(candidates.pop())
}
