//! The feature workflow: which operators apply to which column groups, the
//! statistics a fit pass produced, and their on-disk form.
//!
//! A fitted workflow persists as a directory:
//!
//! ```text
//! workflow/
//!   workflow.json                  manifest: ops, column groups, statistics
//!   categories/unique.C1.parquet   vocabulary for C1, ordered by code
//!   categories/unique.C2.parquet   ...
//! ```
//!
//! The manifest carries everything scalar; vocabularies, which can reach
//! millions of rows per column, live in parquet sidecars with a `count`
//! column recording fit-time frequencies.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Int32Array, Int64Array};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use indexmap::IndexMap;
use indicatif::ProgressBar;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::dataset::Dataset;
use crate::executor::LocalExecutor;
use crate::ops::{
    self, CategorifyOp, CategoryTable, ClipOp, ContinuousStats, FillMissingOp, FitAccumulator,
    NormalizeOp,
};
use crate::schema;

pub const WORKFLOW_FORMAT_VERSION: u32 = 1;
pub const WORKFLOW_MANIFEST: &str = "workflow.json";
pub const CATEGORIES_DIR: &str = "categories";

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow has not been fitted; run the analyse task first")]
    NotFitted,
    #[error("workflow format version {found} is not supported (expected {expected})")]
    VersionMismatch { found: u32, expected: u32 },
    #[error("workflow column groups do not match the criteo layout")]
    LayoutMismatch,
    #[error("column {column} is missing fitted statistics")]
    MissingStats { column: String },
    #[error("label column contains {nulls} null value(s)")]
    NullLabel { nulls: usize },
    #[error("vocabulary file {} is malformed: {detail}", path.display())]
    BadVocabulary { path: PathBuf, detail: String },
    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("parquet error in {}: {source}", path.display())]
    Parquet {
        path: PathBuf,
        #[source]
        source: parquet::errors::ParquetError,
    },
    #[error(transparent)]
    Ops(#[from] ops::OpsError),
    #[error(transparent)]
    Arrow(#[from] arrow::error::ArrowError),
    #[error(transparent)]
    Executor(#[from] crate::executor::ExecutorError),
}

// ============================================================================
// Workflow
// ============================================================================

/// Fitted state: row count plus per-column statistics, keyed in column
/// order.
#[derive(Debug)]
pub struct FittedState {
    pub row_count: u64,
    pub continuous: IndexMap<String, ContinuousStats>,
    pub categories: IndexMap<String, CategoryTable>,
}

#[derive(Debug)]
pub struct Workflow {
    label: String,
    continuous: Vec<String>,
    categorical: Vec<String>,
    categorify: CategorifyOp,
    fill_missing: FillMissingOp,
    clip: ClipOp,
    normalize: NormalizeOp,
    fitted: Option<FittedState>,
    output_schema: SchemaRef,
}

impl Workflow {
    /// The criteo feature graph: categorify over `C1..C26`, fill + clip +
    /// normalize over `I1..I13`, label passed through last.
    pub fn criteo() -> Self {
        Self {
            label: schema::LABEL.to_string(),
            continuous: schema::continuous_columns(),
            categorical: schema::categorical_columns(),
            categorify: CategorifyOp::default(),
            fill_missing: FillMissingOp::default(),
            clip: ClipOp::default(),
            normalize: NormalizeOp::default(),
            fitted: None,
            output_schema: schema::transformed_schema(),
        }
    }

    pub fn is_fitted(&self) -> bool {
        self.fitted.is_some()
    }

    pub fn output_schema(&self) -> SchemaRef {
        self.output_schema.clone()
    }

    pub fn fitted(&self) -> Result<&FittedState, WorkflowError> {
        self.fitted.as_ref().ok_or(WorkflowError::NotFitted)
    }

    /// Fit the workflow statistics over a converted dataset. One accumulator
    /// per partition, merged as partitions finish.
    pub fn fit(
        &mut self,
        dataset: &Dataset,
        executor: &LocalExecutor,
        progress: Option<ProgressBar>,
    ) -> Result<(), WorkflowError> {
        let partitions = dataset.partitions().to_vec();
        let fill = self.fill_missing.fill;
        let clip_min = self.clip.min;
        let num_continuous = self.continuous.len();
        let num_categorical = self.categorical.len();
        let progress = &progress;

        let merged = executor.run_fold(
            partitions,
            |_, partition| {
                let mut acc = FitAccumulator::new(num_continuous, num_categorical, fill, clip_min);
                for batch in dataset.open_partition(&partition)? {
                    acc.update_batch(&batch?)?;
                }
                if let Some(pb) = progress {
                    pb.inc(1);
                }
                Ok(acc)
            },
            FitAccumulator::new(num_continuous, num_categorical, fill, clip_min),
            |mut acc, _, partial| {
                acc.merge(partial);
                acc
            },
        )?;

        let row_count = merged.rows;
        let mut continuous = IndexMap::with_capacity(num_continuous);
        for (name, moments) in self.continuous.iter().zip(&merged.moments) {
            continuous.insert(name.clone(), moments.finalize());
        }
        let max_size = self.categorify.max_size;
        // Ranking up to 26 multi-million-entry maps is the expensive part.
        let tables: Vec<CategoryTable> = merged
            .categories
            .into_par_iter()
            .map(|acc| acc.build(max_size))
            .collect();
        let mut categories = IndexMap::with_capacity(num_categorical);
        for (name, table) in self.categorical.iter().zip(tables) {
            categories.insert(name.clone(), table);
        }
        info!(
            "fit complete: {} rows, {} distinct categorical values, {} continuous / {} categorical null(s)",
            row_count,
            categories.values().map(|t| t.cardinality() as u64).sum::<u64>(),
            continuous.values().map(|s| s.nulls).sum::<u64>(),
            categories.values().map(|t| t.nulls()).sum::<u64>()
        );
        self.fitted = Some(FittedState {
            row_count,
            continuous,
            categories,
        });
        Ok(())
    }

    /// Apply the fitted operators to one converted-layout batch, producing
    /// the transformed layout: `C1..C26` codes, `I1..I13` z-scores, label.
    pub fn transform_batch(&self, batch: &RecordBatch) -> Result<RecordBatch, WorkflowError> {
        let state = self.fitted()?;
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema::NUM_COLUMNS);
        for (j, name) in self.categorical.iter().enumerate() {
            let table = state
                .categories
                .get(name)
                .ok_or_else(|| WorkflowError::MissingStats {
                    column: name.clone(),
                })?;
            let column = ops::int32_column(batch, schema::CATEGORICAL_START + j)?;
            columns.push(Arc::new(table.encode(column)));
        }
        for (j, name) in self.continuous.iter().enumerate() {
            let stats = state
                .continuous
                .get(name)
                .ok_or_else(|| WorkflowError::MissingStats {
                    column: name.clone(),
                })?;
            let column = ops::int32_column(batch, schema::CONTINUOUS_START + j)?;
            columns.push(Arc::new(ops::normalize_array(
                column,
                stats,
                self.fill_missing.fill,
                self.clip.min,
            )));
        }
        let label = ops::int32_column(batch, schema::LABEL_INDEX)?;
        if label.null_count() > 0 {
            return Err(WorkflowError::NullLabel {
                nulls: label.null_count(),
            });
        }
        columns.push(batch.column(schema::LABEL_INDEX).clone());
        RecordBatch::try_new(self.output_schema.clone(), columns).map_err(WorkflowError::Arrow)
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Write the fitted workflow under `dir`.
    pub fn save(&self, dir: &Path) -> Result<(), WorkflowError> {
        let state = self.fitted()?;
        let categories_dir = dir.join(CATEGORIES_DIR);
        fs::create_dir_all(&categories_dir).map_err(|source| WorkflowError::Io {
            path: categories_dir.clone(),
            source,
        })?;

        let manifest = Manifest {
            format_version: WORKFLOW_FORMAT_VERSION,
            label: self.label.clone(),
            continuous: self.continuous.clone(),
            categorical: self.categorical.clone(),
            ops: OpsManifest {
                categorify: self.categorify.clone(),
                fill_missing: self.fill_missing.clone(),
                clip: self.clip.clone(),
                normalize: self.normalize.clone(),
            },
            row_count: state.row_count,
            continuous_stats: state.continuous.clone(),
            categorical_stats: state
                .categories
                .iter()
                .map(|(name, table)| {
                    (
                        name.clone(),
                        CategoricalSummary {
                            cardinality: table.cardinality() as u64,
                            nulls: table.nulls(),
                        },
                    )
                })
                .collect(),
        };
        let manifest_path = dir.join(WORKFLOW_MANIFEST);
        let file = File::create(&manifest_path).map_err(|source| WorkflowError::Io {
            path: manifest_path.clone(),
            source,
        })?;
        serde_json::to_writer_pretty(BufWriter::new(file), &manifest).map_err(|source| {
            WorkflowError::Json {
                path: manifest_path,
                source,
            }
        })?;

        for (name, table) in &state.categories {
            write_vocabulary(&categories_dir, name, table)?;
        }
        info!("workflow saved under {}", dir.display());
        Ok(())
    }

    /// Load a fitted workflow from `dir`.
    pub fn load(dir: &Path) -> Result<Self, WorkflowError> {
        let manifest_path = dir.join(WORKFLOW_MANIFEST);
        let file = File::open(&manifest_path).map_err(|source| WorkflowError::Io {
            path: manifest_path.clone(),
            source,
        })?;
        let manifest: Manifest =
            serde_json::from_reader(BufReader::new(file)).map_err(|source| WorkflowError::Json {
                path: manifest_path,
                source,
            })?;
        if manifest.format_version != WORKFLOW_FORMAT_VERSION {
            return Err(WorkflowError::VersionMismatch {
                found: manifest.format_version,
                expected: WORKFLOW_FORMAT_VERSION,
            });
        }
        // The pipeline is criteo-specific; a manifest with different column
        // groups would silently mis-encode, so reject it outright.
        if manifest.label != schema::LABEL
            || manifest.continuous != schema::continuous_columns()
            || manifest.categorical != schema::categorical_columns()
        {
            return Err(WorkflowError::LayoutMismatch);
        }

        let mut continuous = IndexMap::with_capacity(manifest.continuous.len());
        for name in &manifest.continuous {
            let stats = manifest
                .continuous_stats
                .get(name)
                .ok_or_else(|| WorkflowError::MissingStats {
                    column: name.clone(),
                })?;
            continuous.insert(name.clone(), stats.clone());
        }

        let categories_dir = dir.join(CATEGORIES_DIR);
        let mut categories = IndexMap::with_capacity(manifest.categorical.len());
        for name in &manifest.categorical {
            let summary = manifest
                .categorical_stats
                .get(name)
                .ok_or_else(|| WorkflowError::MissingStats {
                    column: name.clone(),
                })?;
            let table = read_vocabulary(&categories_dir, name, summary.nulls)?;
            categories.insert(name.clone(), table);
        }

        Ok(Self {
            label: manifest.label,
            continuous: manifest.continuous,
            categorical: manifest.categorical,
            categorify: manifest.ops.categorify,
            fill_missing: manifest.ops.fill_missing,
            clip: manifest.ops.clip,
            normalize: manifest.ops.normalize,
            fitted: Some(FittedState {
                row_count: manifest.row_count,
                continuous,
                categories,
            }),
            output_schema: schema::transformed_schema(),
        })
    }
}

// ============================================================================
// Manifest
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    format_version: u32,
    label: String,
    continuous: Vec<String>,
    categorical: Vec<String>,
    ops: OpsManifest,
    row_count: u64,
    continuous_stats: IndexMap<String, ContinuousStats>,
    categorical_stats: IndexMap<String, CategoricalSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpsManifest {
    categorify: CategorifyOp,
    fill_missing: FillMissingOp,
    clip: ClipOp,
    normalize: NormalizeOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CategoricalSummary {
    cardinality: u64,
    nulls: u64,
}

// ============================================================================
// Vocabulary sidecars
// ============================================================================

fn vocabulary_path(categories_dir: &Path, column: &str) -> PathBuf {
    categories_dir.join(format!("unique.{column}.parquet"))
}

/// One row per vocabulary entry, ordered by code: the value under the
/// column's own name and its fit-time frequency under `count`.
fn write_vocabulary(
    categories_dir: &Path,
    column: &str,
    table: &CategoryTable,
) -> Result<(), WorkflowError> {
    let path = vocabulary_path(categories_dir, column);
    let schema = Arc::new(Schema::new(vec![
        Field::new(column, DataType::Int32, false),
        Field::new("count", DataType::Int64, false),
    ]));
    let values = Int32Array::from(table.values().to_vec());
    let counts = Int64Array::from(
        table
            .counts()
            .iter()
            .map(|&c| i64::try_from(c).unwrap_or(i64::MAX))
            .collect::<Vec<_>>(),
    );
    let batch = RecordBatch::try_new(schema.clone(), vec![
        Arc::new(values) as ArrayRef,
        Arc::new(counts) as ArrayRef,
    ])?;
    let file = File::create(&path).map_err(|source| WorkflowError::Io {
        path: path.clone(),
        source,
    })?;
    let mut writer = ArrowWriter::try_new(file, schema, None).map_err(|source| {
        WorkflowError::Parquet {
            path: path.clone(),
            source,
        }
    })?;
    writer.write(&batch).map_err(|source| WorkflowError::Parquet {
        path: path.clone(),
        source,
    })?;
    writer.close().map_err(|source| WorkflowError::Parquet {
        path: path.clone(),
        source,
    })?;
    Ok(())
}

fn read_vocabulary(
    categories_dir: &Path,
    column: &str,
    nulls: u64,
) -> Result<CategoryTable, WorkflowError> {
    let path = vocabulary_path(categories_dir, column);
    let file = File::open(&path).map_err(|source| WorkflowError::Io {
        path: path.clone(),
        source,
    })?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .and_then(|builder| builder.build())
        .map_err(|source| WorkflowError::Parquet {
            path: path.clone(),
            source,
        })?;
    let malformed = |detail: &str| WorkflowError::BadVocabulary {
        path: path.clone(),
        detail: detail.to_string(),
    };
    let mut values = Vec::new();
    let mut counts = Vec::new();
    for batch in reader {
        let batch = batch.map_err(WorkflowError::Arrow)?;
        if batch.num_columns() != 2 {
            return Err(malformed("expected exactly two columns"));
        }
        let value_col = batch
            .column(0)
            .as_any()
            .downcast_ref::<Int32Array>()
            .ok_or_else(|| malformed("value column is not int32"))?;
        let count_col = batch
            .column(1)
            .as_any()
            .downcast_ref::<Int64Array>()
            .ok_or_else(|| malformed("count column is not int64"))?;
        if value_col.null_count() > 0 || count_col.null_count() > 0 {
            return Err(malformed("vocabulary rows must not be null"));
        }
        for i in 0..value_col.len() {
            values.push(value_col.value(i));
            counts.push(count_col.value(i).max(0) as u64);
        }
    }
    Ok(CategoryTable::from_parts(values, counts, nulls))
}

// ============================================================================
// Tests
// ============================================================================
