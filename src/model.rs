use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct AggregateReport {
    #[serde(default)]
    pub metrics: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriagePaths {
    pub cache_root: String,
    pub db_path: String,
    pub report_path: String,
    pub output_db_path: String,
    pub manifest_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TriageCounts {
    pub input_rows: usize,
    pub violated_metric_count: usize,
    pub bad_rows_sampled: usize,
    pub clustered_bad_partitions: usize,
    pub clustered_good_partitions: usize,
    pub skipped_partitions: usize,
    pub topic_rows: usize,
    pub rows_without_debug_info: usize,
    pub span_rows_written: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub signal_name: String,
    pub violated_metrics: Vec<String>,
    pub input_db_sha256: Option<String>,
    pub paths: TriagePaths,
    pub counts: TriageCounts,
    pub warnings: Vec<String>,
}
