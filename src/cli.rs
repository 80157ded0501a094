use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "traffic-triage",
    version,
    about = "Problem-traffic triage over scored conversational-AI logs"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Triage(TriageArgs),
    Violations(ViolationsArgs),
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct TriageArgs {
    #[arg(long, default_value = ".cache/traffic-triage")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long, default_value = "scored_traffic")]
    pub input_table: String,

    #[arg(long)]
    pub output_db_path: Option<PathBuf>,

    #[arg(long, default_value = "problem_traffic")]
    pub output_table: String,

    #[arg(long)]
    pub report_dir: Option<PathBuf>,

    #[arg(long)]
    pub signal_name: String,

    #[arg(long = "metric")]
    pub metrics: Vec<String>,

    #[arg(long, default_value_t = 4.0)]
    pub violation_threshold: f64,

    #[arg(long, default_value_t = 5.0)]
    pub good_score: f64,

    #[arg(long, default_value_t = 20)]
    pub sample_size: usize,

    #[arg(long, default_value_t = 10)]
    pub min_sample_size: usize,

    #[arg(long, default_value_t = 3)]
    pub min_cluster_size: usize,

    #[arg(long, default_value = "prompt")]
    pub prompt_column: String,

    #[arg(long, default_value = "completion")]
    pub completion_column: String,

    #[arg(long)]
    pub label_endpoint: Option<String>,

    #[arg(long, default_value = "gpt-4o-mini")]
    pub model_deployment: String,

    #[arg(long, default_value_t = 0.0)]
    pub temperature: f64,

    #[arg(long, default_value_t = 30_000)]
    pub label_timeout_ms: u64,

    #[arg(long, default_value_t = 10)]
    pub label_retry_max: u32,

    #[arg(long, default_value_t = 4_000)]
    pub label_retry_backoff_ms: u64,

    #[arg(long)]
    pub rng_seed: Option<u64>,

    #[arg(long)]
    pub manifest_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ViolationsArgs {
    #[arg(long, default_value = ".cache/traffic-triage")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub report_dir: Option<PathBuf>,

    #[arg(long)]
    pub signal_name: String,

    #[arg(long = "metric")]
    pub metrics: Vec<String>,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".cache/traffic-triage")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub output_db_path: Option<PathBuf>,

    #[arg(long, default_value = "problem_traffic")]
    pub output_table: String,
}
