//! Parquet shard output.
//!
//! A run writes `part_00000.parquet .. part_NNNNN.parquet` under one output
//! directory, ZSTD-compressed, buffering rows into row groups before they
//! hit the writer. Without a shuffle each shard owns a contiguous slice of
//! the input partitions, so global row order is preserved. The shuffle modes
//! trade that order away at increasing radius: inside a row group, across
//! the shards one worker owns, or across every shard of the run.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use arrow::compute::concat_batches;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use crossbeam::channel;
use indicatif::ProgressBar;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use thiserror::Error;
use tracing::debug;

use crate::dataset::{Dataset, Partition};
use crate::executor::{ExecutorError, LocalExecutor, Weighted, WorkError};
use crate::shuffle::{self, ShuffleMode};

/// Row-group size for written shards.
pub const DEFAULT_ROWS_PER_GROUP: usize = 1_000_000;
/// Lower bound on the buffered rows per shard when one worker feeds many.
const MIN_FLUSH_ROWS: usize = 16_384;
/// Depth of each writer inbox in the full-shuffle topology.
const CHANNEL_DEPTH: usize = 4;

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("failed to create {}: {source}", path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parquet write to {} failed: {source}", path.display())]
    Parquet {
        path: PathBuf,
        #[source]
        source: parquet::errors::ParquetError,
    },
    #[error(transparent)]
    Arrow(#[from] arrow::error::ArrowError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

#[derive(Debug, Clone)]
pub struct WriteConfig {
    pub output_dir: PathBuf,
    /// Number of shards to produce.
    pub output_files: usize,
    pub shuffle: Option<ShuffleMode>,
    pub rows_per_group: usize,
    /// Schema every written batch must carry.
    pub schema: SchemaRef,
}

#[derive(Debug, Clone)]
pub struct ShardReport {
    pub path: PathBuf,
    pub rows: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct WriteSummary {
    pub shards: Vec<ShardReport>,
    pub rows: u64,
    pub bytes: u64,
}

pub fn shard_path(dir: &Path, shard: usize) -> PathBuf {
    dir.join(format!("part_{shard:05}.parquet"))
}

/// Stream every dataset partition through `map` and write the results as
/// `config.output_files` parquet shards. `map` runs on worker threads and
/// must emit batches carrying `config.schema`.
pub fn write_shards<F>(
    executor: &LocalExecutor,
    dataset: &Dataset,
    config: &WriteConfig,
    map: F,
    progress: Option<ProgressBar>,
) -> Result<WriteSummary, WriterError>
where
    F: Fn(RecordBatch) -> Result<RecordBatch, WorkError> + Sync,
{
    fs::create_dir_all(&config.output_dir).map_err(|source| WriterError::Create {
        path: config.output_dir.clone(),
        source,
    })?;
    let reports = match config.shuffle {
        None => run_contiguous(executor, dataset, config, &map, false, &progress)?,
        Some(ShuffleMode::PerPartition) => {
            run_contiguous(executor, dataset, config, &map, true, &progress)?
        }
        Some(ShuffleMode::PerWorker) => run_grouped(executor, dataset, config, &map, &progress)?,
        Some(ShuffleMode::Full) => run_full(executor, dataset, config, &map, &progress)?,
    };
    let rows = reports.iter().map(|r| r.rows).sum();
    let bytes = reports.iter().map(|r| r.bytes).sum();
    Ok(WriteSummary {
        shards: reports,
        rows,
        bytes,
    })
}

// ============================================================================
// Shard writer
// ============================================================================

/// One open parquet shard with a row-group buffer in front of it.
struct ShardWriter {
    path: PathBuf,
    writer: ArrowWriter<File>,
    schema: SchemaRef,
    pending: Vec<RecordBatch>,
    pending_rows: usize,
    flush_rows: usize,
    /// Permute each flushed slice before it is written.
    shuffle_buffer: bool,
    rng: SmallRng,
    rows: u64,
}

impl ShardWriter {
    fn create(
        dir: &Path,
        shard: usize,
        schema: SchemaRef,
        flush_rows: usize,
        shuffle_buffer: bool,
    ) -> Result<Self, WriterError> {
        let path = shard_path(dir, shard);
        let file = File::create(&path).map_err(|source| WriterError::Create {
            path: path.clone(),
            source,
        })?;
        let props = WriterProperties::builder()
            .set_compression(Compression::ZSTD(ZstdLevel::try_new(3).unwrap_or_default()))
            .set_max_row_group_size(flush_rows.max(1))
            .build();
        let writer = ArrowWriter::try_new(file, schema.clone(), Some(props)).map_err(|source| {
            WriterError::Parquet {
                path: path.clone(),
                source,
            }
        })?;
        Ok(Self {
            path,
            writer,
            schema,
            pending: Vec::new(),
            pending_rows: 0,
            flush_rows: flush_rows.max(1),
            shuffle_buffer,
            rng: SmallRng::from_rng(&mut rand::rng()),
            rows: 0,
        })
    }

    fn append(&mut self, batch: RecordBatch) -> Result<(), WriterError> {
        if batch.num_rows() == 0 {
            return Ok(());
        }
        self.pending_rows += batch.num_rows();
        self.pending.push(batch);
        if self.pending_rows >= self.flush_rows {
            self.flush()?;
        }
        Ok(())
    }

    /// Drain the buffer in row-group-sized slices so a permutation never
    /// spans more than one row group.
    fn flush(&mut self) -> Result<(), WriterError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let buffered = concat_batches(&self.schema, &self.pending)?;
        self.pending.clear();
        self.pending_rows = 0;
        let mut offset = 0;
        while offset < buffered.num_rows() {
            let len = self.flush_rows.min(buffered.num_rows() - offset);
            let mut slice = buffered.slice(offset, len);
            if self.shuffle_buffer {
                slice = shuffle::permute_batch(&slice, &mut self.rng)?;
            }
            self.rows += slice.num_rows() as u64;
            self.writer
                .write(&slice)
                .map_err(|source| WriterError::Parquet {
                    path: self.path.clone(),
                    source,
                })?;
            offset += len;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<ShardReport, WriterError> {
        self.flush()?;
        self.writer
            .close()
            .map_err(|source| WriterError::Parquet {
                path: self.path.clone(),
                source,
            })?;
        let bytes = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        debug!("closed shard {}: {} rows", self.path.display(), self.rows);
        Ok(ShardReport {
            path: self.path,
            rows: self.rows,
            bytes,
        })
    }
}

/// `parts` contiguous ranges covering `0..total`, sizes differing by at
/// most one.
fn split_even(total: usize, parts: usize) -> Vec<std::ops::Range<usize>> {
    (0..parts)
        .map(|i| (i * total / parts)..((i + 1) * total / parts))
        .collect()
}

// ============================================================================
// No shuffle / per-partition shuffle
// ============================================================================

struct ShardTask {
    shard: usize,
    partitions: Vec<Partition>,
}

impl Weighted for ShardTask {
    fn weight_bytes(&self) -> u64 {
        self.partitions
            .iter()
            .map(Weighted::weight_bytes)
            .max()
            .unwrap_or(0)
    }
}

/// Each shard consumes its contiguous slice of the partitions, one task per
/// shard. Without `shuffle_buffer` this preserves global row order.
fn run_contiguous<F>(
    executor: &LocalExecutor,
    dataset: &Dataset,
    config: &WriteConfig,
    map: &F,
    shuffle_buffer: bool,
    progress: &Option<ProgressBar>,
) -> Result<Vec<ShardReport>, WriterError>
where
    F: Fn(RecordBatch) -> Result<RecordBatch, WorkError> + Sync,
{
    let partitions = dataset.partitions();
    let output_files = config.output_files.max(1);
    let tasks: Vec<ShardTask> = split_even(partitions.len(), output_files)
        .into_iter()
        .enumerate()
        .map(|(shard, range)| ShardTask {
            shard,
            partitions: partitions[range].to_vec(),
        })
        .collect();
    let reports = executor.run(tasks, |_, task| {
        let mut writer = ShardWriter::create(
            &config.output_dir,
            task.shard,
            config.schema.clone(),
            config.rows_per_group,
            shuffle_buffer,
        )?;
        for partition in &task.partitions {
            for batch in dataset.open_partition(partition)? {
                writer.append(map(batch?)?)?;
            }
            if let Some(pb) = progress {
                pb.inc(1);
            }
        }
        Ok(writer.finish()?)
    })?;
    Ok(reports)
}

// ============================================================================
// Per-worker shuffle
// ============================================================================

struct GroupTask {
    shards: std::ops::Range<usize>,
    partitions: Vec<Partition>,
}

impl Weighted for GroupTask {
    fn weight_bytes(&self) -> u64 {
        self.partitions
            .iter()
            .map(Weighted::weight_bytes)
            .max()
            .unwrap_or(0)
    }
}

/// Workers own disjoint shard groups; every batch a worker reads scatters
/// randomly across its own group, and flushed slices are permuted.
fn run_grouped<F>(
    executor: &LocalExecutor,
    dataset: &Dataset,
    config: &WriteConfig,
    map: &F,
    progress: &Option<ProgressBar>,
) -> Result<Vec<ShardReport>, WriterError>
where
    F: Fn(RecordBatch) -> Result<RecordBatch, WorkError> + Sync,
{
    let partitions = dataset.partitions();
    let output_files = config.output_files.max(1);
    let groups = executor.n_workers().min(output_files).max(1);
    let part_ranges = split_even(partitions.len(), groups);
    let tasks: Vec<GroupTask> = split_even(output_files, groups)
        .into_iter()
        .zip(part_ranges)
        .map(|(shards, parts)| GroupTask {
            shards,
            partitions: partitions[parts].to_vec(),
        })
        .collect();

    let grouped = executor.run(tasks, |_, task| {
        let fan_out = task.shards.len().max(1);
        let flush_rows = (config.rows_per_group / fan_out).max(MIN_FLUSH_ROWS);
        let mut writers = task
            .shards
            .clone()
            .map(|shard| {
                ShardWriter::create(
                    &config.output_dir,
                    shard,
                    config.schema.clone(),
                    flush_rows,
                    true,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        let mut rng = SmallRng::from_rng(&mut rand::rng());
        for partition in &task.partitions {
            for batch in dataset.open_partition(partition)? {
                let batch = map(batch?)?;
                for (writer, piece) in writers
                    .iter_mut()
                    .zip(shuffle::scatter_batch(&batch, fan_out, &mut rng)?)
                {
                    writer.append(piece)?;
                }
            }
            if let Some(pb) = progress {
                pb.inc(1);
            }
        }
        let reports = writers
            .into_iter()
            .map(ShardWriter::finish)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(reports)
    })?;
    Ok(grouped.into_iter().flatten().collect())
}

// ============================================================================
// Full shuffle
// ============================================================================

/// Readers scatter every batch across all shards and route the pieces over
/// channels to writer threads, so any input row can land in any shard.
fn run_full<F>(
    executor: &LocalExecutor,
    dataset: &Dataset,
    config: &WriteConfig,
    map: &F,
    progress: &Option<ProgressBar>,
) -> Result<Vec<ShardReport>, WriterError>
where
    F: Fn(RecordBatch) -> Result<RecordBatch, WorkError> + Sync,
{
    let partitions = dataset.partitions().to_vec();
    let output_files = config.output_files.max(1);
    let writer_threads = executor.n_workers().min(output_files).max(1);
    let reader_threads = executor.n_workers().max(1);
    let shard_ranges = split_even(output_files, writer_threads);
    let mut owner_of = vec![0usize; output_files];
    for (group, range) in shard_ranges.iter().enumerate() {
        for shard in range.clone() {
            owner_of[shard] = group;
        }
    }
    let owner_of = &owner_of;

    let cancel = AtomicBool::new(false);
    let cancel = &cancel;
    let (part_tx, part_rx) = channel::bounded::<Partition>(reader_threads * 2);
    let mut batch_txs = Vec::with_capacity(writer_threads);
    let mut batch_rxs = Vec::with_capacity(writer_threads);
    for _ in 0..writer_threads {
        let (tx, rx) = channel::bounded::<(usize, RecordBatch)>(CHANNEL_DEPTH);
        batch_txs.push(tx);
        batch_rxs.push(rx);
    }
    let (report_tx, report_rx) = channel::unbounded::<Result<Vec<ShardReport>, WriterError>>();
    let (err_tx, err_rx) = channel::unbounded::<(usize, WorkError)>();

    let mut reports = std::thread::scope(|scope| {
        for (range, rx) in shard_ranges.iter().zip(batch_rxs) {
            let report_tx = report_tx.clone();
            scope.spawn(move || {
                let outcome = (|| -> Result<Vec<ShardReport>, WriterError> {
                    let fan_out = range.len().max(1);
                    let flush_rows = (config.rows_per_group / fan_out).max(MIN_FLUSH_ROWS);
                    let mut writers = range
                        .clone()
                        .map(|shard| {
                            ShardWriter::create(
                                &config.output_dir,
                                shard,
                                config.schema.clone(),
                                flush_rows,
                                true,
                            )
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    for (shard, batch) in rx.iter() {
                        // Keep draining after a failure so senders unblock.
                        if cancel.load(Ordering::Relaxed) {
                            continue;
                        }
                        writers[shard - range.start].append(batch)?;
                    }
                    writers.into_iter().map(ShardWriter::finish).collect()
                })();
                if outcome.is_err() {
                    cancel.store(true, Ordering::Relaxed);
                }
                let _ = report_tx.send(outcome);
            });
        }
        drop(report_tx);

        for _ in 0..reader_threads {
            let part_rx = part_rx.clone();
            let batch_txs = batch_txs.clone();
            let err_tx = err_tx.clone();
            scope.spawn(move || {
                let mut rng = SmallRng::from_rng(&mut rand::rng());
                for partition in part_rx.iter() {
                    if cancel.load(Ordering::Relaxed) {
                        continue;
                    }
                    let index = partition.index;
                    let _permit = executor.admit(partition.weight_bytes());
                    let outcome = (|| -> Result<(), WorkError> {
                        for batch in dataset.open_partition(&partition)? {
                            let batch = map(batch?)?;
                            let pieces = shuffle::scatter_batch(&batch, output_files, &mut rng)?;
                            for (shard, piece) in pieces.into_iter().enumerate() {
                                if piece.num_rows() == 0 {
                                    continue;
                                }
                                if batch_txs[owner_of[shard]].send((shard, piece)).is_err() {
                                    return Err(WorkError::from(
                                        "shard writer thread terminated early",
                                    ));
                                }
                            }
                        }
                        Ok(())
                    })();
                    if let Some(pb) = progress {
                        pb.inc(1);
                    }
                    if let Err(source) = outcome {
                        cancel.store(true, Ordering::Relaxed);
                        let _ = err_tx.send((index, source));
                    }
                }
            });
        }
        drop(part_rx);
        drop(batch_txs);
        drop(err_tx);

        for partition in partitions {
            if cancel.load(Ordering::Relaxed) {
                break;
            }
            if part_tx.send(partition).is_err() {
                break;
            }
        }
        drop(part_tx);

        let mut reports = Vec::with_capacity(output_files);
        let mut first_error: Option<WriterError> = None;
        for outcome in report_rx.iter() {
            match outcome {
                Ok(mut shard_reports) => reports.append(&mut shard_reports),
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        if first_error.is_none() {
            if let Ok((index, source)) = err_rx.try_recv() {
                first_error = Some(WriterError::Executor(ExecutorError::TaskFailed {
                    index,
                    source,
                }));
            }
        }
        match first_error {
            None => Ok(reports),
            Some(err) => Err(err),
        }
    })?;
    reports.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(reports)
}

// ============================================================================
// Tests
// ============================================================================
