//! The three pipeline stages behind `--task`: convert raw CSV to parquet,
//! analyse converted parquet into a fitted workflow, and transform converted
//! parquet into model-ready shards.
//!
//! Each stage builds the same local executor from the shared sizing flags,
//! then differs only in what it streams and where it writes. Log lines
//! follow the stage through its steps so a multi-hour run is legible.

use std::path::PathBuf;

use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;
use tracing::info;

use crate::dataset::{self, Dataset, DatasetError};
use crate::executor::{ExecutorConfig, ExecutorError, LocalExecutor};
use crate::shuffle::ShuffleMode;
use crate::workflow::{Workflow, WorkflowError};
use crate::writer::{self, WriteConfig, WriterError};

#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error(transparent)]
    Writer(#[from] WriterError),
}

#[derive(Debug, Clone)]
pub struct ConvertOptions {
    /// CSV files or directories, in the order supplied.
    pub csv_data_path: Vec<PathBuf>,
    /// Field separator as typed on the command line.
    pub sep: String,
    pub output_path: PathBuf,
    /// Shard count; defaults to one shard per input partition.
    pub output_files: Option<usize>,
    pub shuffle: Option<ShuffleMode>,
}

#[derive(Debug, Clone)]
pub struct AnalyseOptions {
    pub parquet_data_path: PathBuf,
    /// Directory the fitted workflow is saved under.
    pub output_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct TransformOptions {
    pub parquet_data_path: PathBuf,
    pub workflow_path: PathBuf,
    pub output_path: PathBuf,
    pub output_files: Option<usize>,
    pub shuffle: Option<ShuffleMode>,
}

// ============================================================================
// Tasks
// ============================================================================

pub fn run_convert(options: &ConvertOptions, cluster: &ExecutorConfig) -> Result<(), TaskError> {
    info!("creating local executor");
    let executor = LocalExecutor::new(cluster.clone())?;

    info!("creating the csv dataset");
    let sep = dataset::parse_separator(&options.sep)?;
    let dataset = Dataset::from_csv(&options.csv_data_path, sep, cluster.partition_bytes())?;

    info!("converting csv to parquet");
    let progress = partition_progress("convert", dataset.partitions().len());
    let summary = writer::write_shards(
        &executor,
        &dataset,
        &WriteConfig {
            output_dir: options.output_path.clone(),
            output_files: shard_count(options.output_files, &dataset),
            shuffle: options.shuffle,
            rows_per_group: writer::DEFAULT_ROWS_PER_GROUP,
            schema: dataset.schema(),
        },
        Ok,
        Some(progress.clone()),
    )?;
    progress.finish_and_clear();
    info!(
        "conversion complete: {} rows across {} shard(s), {} bytes",
        summary.rows,
        summary.shards.len(),
        summary.bytes
    );
    Ok(())
}

pub fn run_analyse(options: &AnalyseOptions, cluster: &ExecutorConfig) -> Result<(), TaskError> {
    info!("creating local executor");
    let executor = LocalExecutor::new(cluster.clone())?;

    info!("creating the parquet dataset");
    let dataset = Dataset::from_parquet_dir(&options.parquet_data_path, cluster.partition_bytes())?;

    info!("creating the feature workflow");
    let mut workflow = Workflow::criteo();

    info!("analysing the dataset");
    let progress = partition_progress("analyse", dataset.partitions().len());
    workflow.fit(&dataset, &executor, Some(progress.clone()))?;
    progress.finish_and_clear();

    info!("saving the workflow");
    workflow.save(&options.output_path)?;
    Ok(())
}

pub fn run_transform(options: &TransformOptions, cluster: &ExecutorConfig) -> Result<(), TaskError> {
    info!("creating local executor");
    let executor = LocalExecutor::new(cluster.clone())?;

    info!("creating the parquet dataset");
    let dataset = Dataset::from_parquet_dir(&options.parquet_data_path, cluster.partition_bytes())?;

    info!("loading the workflow from {}", options.workflow_path.display());
    let workflow = Workflow::load(&options.workflow_path)?;

    info!("transforming the dataset");
    let progress = partition_progress("transform", dataset.partitions().len());
    let summary = writer::write_shards(
        &executor,
        &dataset,
        &WriteConfig {
            output_dir: options.output_path.clone(),
            output_files: shard_count(options.output_files, &dataset),
            shuffle: options.shuffle,
            rows_per_group: writer::DEFAULT_ROWS_PER_GROUP,
            schema: workflow.output_schema(),
        },
        |batch| Ok(workflow.transform_batch(&batch)?),
        Some(progress.clone()),
    )?;
    progress.finish_and_clear();
    info!(
        "transform complete: {} rows across {} shard(s), {} bytes",
        summary.rows,
        summary.shards.len(),
        summary.bytes
    );
    Ok(())
}

fn shard_count(requested: Option<usize>, dataset: &Dataset) -> usize {
    requested.unwrap_or_else(|| dataset.partitions().len().max(1))
}

fn partition_progress(label: &str, total: usize) -> ProgressBar {
    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "  {msg:>10} {bar:40.cyan/blue} {pos}/{len} partitions [{elapsed_precise}]",
        )
        .unwrap()
        .progress_chars("##-"),
    );
    pb.set_message(label.to_string());
    pb
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;
    use arrow::array::{Array, Float32Array, Int32Array};
    use arrow::record_batch::RecordBatch;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use std::fs::File;
    use std::io::Write as _;
    use std::path::Path;

    fn cluster() -> ExecutorConfig {
        ExecutorConfig {
            n_workers: 2,
            memory_limit: 64 << 20,
            ..ExecutorConfig::default()
        }
    }

    fn raw_row(label: i32, i1: &str, c1: &str) -> String {
        let mut fields = vec![label.to_string(), i1.to_string()];
        fields.extend(std::iter::repeat_n(String::new(), 12));
        fields.push(c1.to_string());
        fields.extend(std::iter::repeat_n(String::new(), 25));
        fields.join("\t")
    }

    fn read_shards(dir: &Path) -> Vec<RecordBatch> {
        let mut batches = Vec::new();
        let mut paths: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        paths.sort();
        for path in paths {
            let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(path).unwrap())
                .unwrap()
                .build()
                .unwrap();
            for batch in reader {
                batches.push(batch.unwrap());
            }
        }
        batches
    }

    #[test]
    fn convert_analyse_transform_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let csv_path = dir.path().join("day_0.csv");
        let mut file = File::create(&csv_path).unwrap();
        for row in [
            raw_row(1, "4", "aa"),
            raw_row(0, "-6", "bb"),
            raw_row(0, "", "aa"),
            raw_row(1, "8", ""),
        ] {
            writeln!(file, "{row}").unwrap();
        }
        drop(file);

        let converted = dir.path().join("converted");
        run_convert(
            &ConvertOptions {
                csv_data_path: vec![csv_path],
                sep: "\\t".to_string(),
                output_path: converted.clone(),
                output_files: Some(2),
                shuffle: None,
            },
            &cluster(),
        )
        .unwrap();
        let batches = read_shards(&converted);
        let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(rows, 4);
        assert_eq!(batches[0].schema(), schema::converted_schema());

        let workflow_dir = dir.path().join("workflow");
        run_analyse(
            &AnalyseOptions {
                parquet_data_path: converted.clone(),
                output_path: workflow_dir.clone(),
            },
            &cluster(),
        )
        .unwrap();
        assert!(workflow_dir.join("workflow.json").is_file());
        assert!(workflow_dir
            .join("categories")
            .join("unique.C26.parquet")
            .is_file());

        let transformed = dir.path().join("transformed");
        run_transform(
            &TransformOptions {
                parquet_data_path: converted,
                workflow_path: workflow_dir,
                output_path: transformed.clone(),
                output_files: Some(1),
                shuffle: None,
            },
            &cluster(),
        )
        .unwrap();

        let batches = read_shards(&transformed);
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.schema(), schema::transformed_schema());
        assert_eq!(batch.num_rows(), 4);

        // C1 codes: aa (2x) -> 1, bb -> 2, null -> 0.
        let c1 = batch
            .column(0)
            .as_any()
            .downcast_ref::<Int32Array>()
            .unwrap();
        assert_eq!(c1.values(), &[1, 2, 1, 0]);

        // I1 z-scores of filled/clipped 4, 0, 0, 8.
        let i1 = batch
            .column(26)
            .as_any()
            .downcast_ref::<Float32Array>()
            .unwrap();
        let std = (44.0f64 / 3.0).sqrt();
        for (i, raw) in [4.0, 0.0, 0.0, 8.0].into_iter().enumerate() {
            let expected = ((raw - 3.0) / std) as f32;
            assert!((i1.value(i) - expected).abs() < 1e-6);
        }

        let label = batch
            .column(39)
            .as_any()
            .downcast_ref::<Int32Array>()
            .unwrap();
        assert_eq!(label.values(), &[1, 0, 0, 1]);
        assert_eq!(label.null_count(), 0);
    }

    #[test]
    fn analyse_of_an_empty_directory_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty");
        std::fs::create_dir(&empty).unwrap();
        let err = run_analyse(
            &AnalyseOptions {
                parquet_data_path: empty,
                output_path: dir.path().join("workflow"),
            },
            &cluster(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("parquet file(s) not found"));
    }

    #[test]
    fn empty_transform_inputs_fail_before_the_workflow_loads() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_transform(
            &TransformOptions {
                parquet_data_path: dir.path().to_path_buf(),
                workflow_path: dir.path().join("missing"),
                output_path: dir.path().join("out"),
                output_files: None,
                shuffle: None,
            },
            &cluster(),
        )
        .unwrap_err();
        // The empty parquet listing trips before the workflow load.
        assert!(matches!(err, TaskError::Dataset(_)));
    }
}
