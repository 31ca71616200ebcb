//! Criteo click-log preprocessing CLI.
//!
//! One binary, three tasks, dispatched by `--task`:
//!
//! ```sh
//! criteo-prep --task convert \
//!     --csv_data_path data/raw --sep '\t' --output_path data/converted
//! criteo-prep --task analyse \
//!     --parquet_data_path data/converted --output_path data/workflow
//! criteo-prep --task transform \
//!     --parquet_data_path data/converted --workflow_path data/workflow \
//!     --output_path data/transformed --shuffle PER_PARTITION
//! ```
//!
//! Flag names keep the snake_case spelling of the original pipeline scripts;
//! they are a documented surface that downstream job configs depend on.

use std::path::PathBuf;
use std::time::Instant;

use clap::{Parser, ValueEnum};
use indicatif::HumanDuration;
use tracing::info;

use criteo_prep::executor::{self, ExecutorConfig};
use criteo_prep::shuffle;
use criteo_prep::tasks::{self, AnalyseOptions, ConvertOptions, TransformOptions};

// ============================================================================
// CLI
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Task {
    /// Parse raw CSV days into the converted parquet layout.
    Convert,
    /// Fit categorical vocabularies and continuous moments, save a workflow.
    Analyse,
    /// Apply a saved workflow and write model-ready shards.
    Transform,
}

#[derive(Parser, Debug)]
#[command(about = "Criteo click-log ETL: csv-to-parquet, analyse, transform")]
struct Args {
    /// Which pipeline stage to run.
    #[arg(long, value_enum)]
    task: Task,

    /// Raw CSV files or directories of them (convert only). Directories are
    /// expanded to their files in sorted order.
    #[arg(long = "csv_data_path", num_args = 1..)]
    csv_data_path: Vec<PathBuf>,

    /// Directory of converted parquet shards (analyse and transform).
    #[arg(long = "parquet_data_path")]
    parquet_data_path: Option<PathBuf>,

    /// Output directory: parquet shards for convert/transform, the workflow
    /// directory for analyse.
    #[arg(long = "output_path")]
    output_path: Option<PathBuf>,

    /// Number of output shards. Defaults to one shard per input partition.
    #[arg(long = "output_files")]
    output_files: Option<usize>,

    /// Saved workflow directory to apply (transform only).
    #[arg(long = "workflow_path")]
    workflow_path: Option<PathBuf>,

    /// CSV field separator. The two-character literal `\t` means TAB.
    #[arg(long, default_value = ",")]
    sep: String,

    /// Shuffle while writing: PER_PARTITION, PER_WORKER or FULL. Unknown
    /// names fall back to no shuffle with a warning.
    #[arg(long)]
    shuffle: Option<String>,

    /// Worker threads. Defaults to the machine's available parallelism.
    #[arg(long = "n_workers")]
    n_workers: Option<usize>,

    /// Partition size as a fraction of the buffer pool.
    #[arg(long = "frac_size", default_value_t = 0.10)]
    frac_size: f64,

    /// Host memory budget in bytes that the sizing fractions apply to.
    #[arg(long = "memory_limit", default_value_t = 100_000_000_000)]
    memory_limit: u64,

    /// Fraction of the memory limit admitted to in-flight partitions.
    #[arg(long = "device_limit_frac", default_value_t = 0.60)]
    device_limit_frac: f64,

    /// Fraction of the memory limit granted to the buffer pool.
    #[arg(long = "device_pool_frac", default_value_t = 0.90)]
    device_pool_frac: f64,
}

fn required<T>(value: Option<T>, flag: &str) -> Result<T, String> {
    value.ok_or_else(|| format!("{flag} is required for this task"))
}

fn required_many<T>(values: Vec<T>, flag: &str) -> Result<Vec<T>, String> {
    if values.is_empty() {
        return Err(format!("{flag} is required for this task"));
    }
    Ok(values)
}

// ============================================================================
// Entrypoint
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let cluster = ExecutorConfig {
        n_workers: args.n_workers.unwrap_or_else(executor::default_n_workers),
        frac_size: args.frac_size,
        memory_limit: args.memory_limit,
        device_limit_frac: args.device_limit_frac,
        device_pool_frac: args.device_pool_frac,
    };
    let shuffle = args.shuffle.as_deref().and_then(shuffle::resolve_shuffle);

    let task_start = Instant::now();
    match args.task {
        Task::Convert => {
            let options = ConvertOptions {
                csv_data_path: required_many(args.csv_data_path, "--csv_data_path")?,
                sep: args.sep,
                output_path: required(args.output_path, "--output_path")?,
                output_files: args.output_files,
                shuffle,
            };
            tasks::run_convert(&options, &cluster)?;
        }
        Task::Analyse => {
            let options = AnalyseOptions {
                parquet_data_path: required(args.parquet_data_path, "--parquet_data_path")?,
                output_path: required(args.output_path, "--output_path")?,
            };
            tasks::run_analyse(&options, &cluster)?;
        }
        Task::Transform => {
            let options = TransformOptions {
                parquet_data_path: required(args.parquet_data_path, "--parquet_data_path")?,
                workflow_path: required(args.workflow_path, "--workflow_path")?,
                output_path: required(args.output_path, "--output_path")?,
                output_files: args.output_files,
                shuffle,
            };
            tasks::run_transform(&options, &cluster)?;
        }
    }
    info!("Task completed in {}!", HumanDuration(task_start.elapsed()));
    Ok(())
}
