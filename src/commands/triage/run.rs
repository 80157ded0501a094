use std::time::Duration;

use anyhow::{Context, Result};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{info, warn};

use crate::cli::TriageArgs;
use crate::clustering::{LabelerConfig, QueryClusterer};
use crate::commands::violations;
use crate::model::{TriageCounts, TriagePaths, TriageRunManifest};
use crate::util::{ensure_directory, now_utc_string, run_stamp, sha256_file, write_json_pretty};

use super::MANIFEST_VERSION;
use super::debugging::extract_debug_spans;
use super::grouping::{
    apply_metric_defaults, bad_row_indices, collect_questions, good_row_indices,
    merge_bad_clusters, merge_good_clusters, sample_rows,
};
use super::rows::{OutputRow, load_rows, open_database, write_output};

pub fn run(args: TriageArgs) -> Result<()> {
    let started_at = now_utc_string();
    let stamp = run_stamp();
    let run_id = format!("triage-{stamp}");

    let cache_root = args.cache_root.clone();
    let manifest_dir = cache_root.join("manifests");
    ensure_directory(&manifest_dir)?;

    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| cache_root.join("scored_traffic.sqlite"));
    let output_db_path = args
        .output_db_path
        .clone()
        .unwrap_or_else(|| cache_root.join("problem_traffic.sqlite"));
    let report_dir = args
        .report_dir
        .clone()
        .unwrap_or_else(|| cache_root.join("reports"));
    let manifest_path = args
        .manifest_path
        .clone()
        .unwrap_or_else(|| manifest_dir.join(format!("triage_run_{stamp}.json")));
    let metrics = violations::resolve_metrics(&args.metrics);

    info!(
        run_id = %run_id,
        signal_name = %args.signal_name,
        db_path = %db_path.display(),
        "starting triage"
    );

    let paths = TriagePaths {
        cache_root: cache_root.display().to_string(),
        db_path: db_path.display().to_string(),
        report_path: violations::report_path(&report_dir, &args.signal_name)
            .display()
            .to_string(),
        output_db_path: output_db_path.display().to_string(),
        manifest_dir: manifest_dir.display().to_string(),
    };

    let mut warnings = Vec::new();
    let mut counts = TriageCounts::default();

    let violated = violations::detect(&report_dir, &args.signal_name, &metrics);
    counts.violated_metric_count = violated.len();

    if violated.is_empty() {
        info!("no violated metrics, writing empty output");
        let mut output_connection = open_database(&output_db_path)?;
        write_output(&mut output_connection, &args.output_table, &[])?;

        let manifest = TriageRunManifest {
            manifest_version: MANIFEST_VERSION,
            run_id,
            status: "completed-no-violations".to_string(),
            started_at,
            updated_at: now_utc_string(),
            signal_name: args.signal_name.clone(),
            violated_metrics: violated,
            input_db_sha256: None,
            paths,
            counts,
            warnings,
        };
        write_json_pretty(&manifest_path, &manifest)?;
        info!(path = %manifest_path.display(), "wrote triage run manifest");
        return Ok(());
    }

    info!(violated = %violated.join(","), "violated metrics found");

    let input_db_sha256 = sha256_file(&db_path)?;
    let connection = open_database(&db_path)?;
    let mut rows = load_rows(
        &connection,
        &args.input_table,
        &args.prompt_column,
        &args.completion_column,
        &metrics,
        &mut warnings,
    )?;
    counts.input_rows = rows.len();
    info!(rows = counts.input_rows, "loaded scored interaction rows");

    let labeler_config = LabelerConfig {
        endpoint: args.label_endpoint.clone(),
        deployment: args.model_deployment.clone(),
        temperature: args.temperature,
        timeout: Duration::from_millis(args.label_timeout_ms),
        retry_max: args.label_retry_max,
        retry_backoff: Duration::from_millis(args.label_retry_backoff_ms),
    };
    let clusterer = QueryClusterer::from_config(args.min_cluster_size, &labeler_config)?;

    let mut rng = match args.rng_seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    for metric in &violated {
        info!(metric = %metric, "processing violated metric");
        apply_metric_defaults(&mut rows, metric, args.violation_threshold, args.good_score);

        let bad = bad_row_indices(&rows, metric, args.violation_threshold);
        let good = good_row_indices(&rows, metric, args.good_score);
        let bad_sample = sample_rows(&bad, args.sample_size, &mut rng);
        counts.bad_rows_sampled += bad_sample.len();

        if bad_sample.len() > args.min_sample_size {
            let questions = collect_questions(&rows, &bad_sample);
            let clusters = clusterer.topics(&questions).with_context(|| {
                format!("semantic clustering failed for bad partition of {metric}")
            })?;
            info!(
                metric = %metric,
                sampled = bad_sample.len(),
                clusters = clusters.len(),
                "clustered bad partition"
            );
            merge_bad_clusters(&mut rows, metric, &clusters);
            counts.clustered_bad_partitions += 1;
        } else {
            info!(
                metric = %metric,
                sampled = bad_sample.len(),
                min_sample_size = args.min_sample_size,
                "bad partition below minimum sample size, skipping clustering"
            );
            counts.skipped_partitions += 1;
        }

        if good.len() > args.min_sample_size {
            let questions = collect_questions(&rows, &good);
            let clusters = clusterer.topics(&questions).with_context(|| {
                format!("semantic clustering failed for good partition of {metric}")
            })?;
            info!(
                metric = %metric,
                sampled = good.len(),
                clusters = clusters.len(),
                "clustered good partition"
            );
            merge_good_clusters(&mut rows, metric, args.good_score, &clusters);
            counts.clustered_good_partitions += 1;
        } else {
            info!(
                metric = %metric,
                sampled = good.len(),
                min_sample_size = args.min_sample_size,
                "good partition below minimum sample size, skipping clustering"
            );
            counts.skipped_partitions += 1;
        }
    }

    rows.retain(|row| !row.topic_list.is_empty());
    counts.topic_rows = rows.len();
    info!(topic_rows = counts.topic_rows, "rows with assigned topics");

    let mut output_rows = Vec::new();
    for row in &rows {
        let Some(root_span) = row.root_span.as_deref() else {
            counts.rows_without_debug_info += 1;
            warn!(trace_id = %row.trace_id, "row has no trace, dropped from output");
            continue;
        };

        let spans = extract_debug_spans(&row.trace_id, root_span);
        if spans.is_empty() {
            counts.rows_without_debug_info += 1;
            continue;
        }

        for span in spans {
            output_rows.push(OutputRow {
                trace_id: row.trace_id.clone(),
                span_id: span.span_id,
                root_question: row.root_question.clone(),
                prompt: span.prompt,
                completion: row.completion.clone(),
                topic_list: row.topic_list.encode(),
                group_list: row.group_list.encode(),
                violated_metrics: row.violated_metrics.encode(),
                index_content: span.index_content,
                index_id: span.index_id,
                context: span.context,
                index_score: span.index_score,
            });
        }
    }
    counts.span_rows_written = output_rows.len();

    let mut output_connection = open_database(&output_db_path)?;
    write_output(&mut output_connection, &args.output_table, &output_rows)?;

    let manifest = TriageRunManifest {
        manifest_version: MANIFEST_VERSION,
        run_id,
        status: "completed".to_string(),
        started_at,
        updated_at: now_utc_string(),
        signal_name: args.signal_name.clone(),
        violated_metrics: violated,
        input_db_sha256: Some(input_db_sha256),
        paths,
        counts: counts.clone(),
        warnings,
    };
    write_json_pretty(&manifest_path, &manifest)?;

    info!(
        path = %manifest_path.display(),
        span_rows = counts.span_rows_written,
        "triage completed"
    );

    Ok(())
}
