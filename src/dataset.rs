//! Lazy datasets over partitioned criteo data.
//!
//! A [`Dataset`] only records which files back it and how they split into
//! partitions; no bytes are read until a partition is opened. CSV files
//! split into fixed-size byte ranges aligned to record boundaries, so a
//! 200 GB day file becomes hundreds of independently readable partitions.
//! Parquet files split into runs of whole row groups packed up to the same
//! target size.
//!
//! Ownership rule for CSV chunks: a record belongs to the chunk containing
//! its first byte. A reader seeks one byte before its range, discards
//! through the first newline, then reads past its end until the record that
//! started inside the range is complete. No record is lost or read twice.
//! Splitting treats every `\n` as a record terminator, which assumes fields
//! never hold quoted newlines; criteo dumps are unquoted tab- or
//! comma-separated text.

use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{ArrayRef, Int32Array};
use arrow::datatypes::{DataType, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::executor::Weighted;
use crate::paths::{self, PathError};
use crate::schema::{self, FieldError};

/// Rough in-memory bytes per decoded row, used to derive batch sizes.
const APPROX_ROW_BYTES: u64 = 192;
const MIN_BATCH_ROWS: usize = 4_096;
const MAX_BATCH_ROWS: usize = 1_048_576;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("no input files resolved from {supplied} supplied path(s)")]
    NoInputFiles { supplied: usize },
    #[error(transparent)]
    Paths(#[from] PathError),
    #[error("failed to open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error in {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error(
        "{}: record {record} after byte {offset}: expected {expected} fields, found {found}",
        path.display()
    )]
    FieldCount {
        path: PathBuf,
        record: u64,
        offset: u64,
        expected: usize,
        found: usize,
    },
    #[error(
        "{}: record {record} after byte {offset}, column {column}: {source}",
        path.display()
    )]
    Field {
        path: PathBuf,
        record: u64,
        offset: u64,
        column: String,
        #[source]
        source: FieldError,
    },
    #[error("{}: record {record} after byte {offset}: label must not be empty", path.display())]
    NullLabel {
        path: PathBuf,
        record: u64,
        offset: u64,
    },
    #[error("parquet error in {}: {source}", path.display())]
    Parquet {
        path: PathBuf,
        #[source]
        source: parquet::errors::ParquetError,
    },
    #[error("failed to decode a batch from {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: arrow::error::ArrowError,
    },
    #[error("{}: schema mismatch: {detail}", path.display())]
    SchemaMismatch { path: PathBuf, detail: String },
    #[error("invalid separator `{0}`: expected a single ascii byte")]
    BadSeparator(String),
    #[error(transparent)]
    Arrow(#[from] arrow::error::ArrowError),
}

/// Turn the `--sep` argument into a delimiter byte. The two-character
/// literal `\t` is accepted as a tab so shells need no quoting tricks.
pub fn parse_separator(sep: &str) -> Result<u8, DatasetError> {
    if sep == "\\t" {
        return Ok(b'\t');
    }
    match sep.as_bytes() {
        [b] if sep.is_ascii() => Ok(*b),
        _ => Err(DatasetError::BadSeparator(sep.to_string())),
    }
}

// ============================================================================
// Partitions
// ============================================================================

#[derive(Debug, Clone)]
pub enum PartitionSpec {
    /// Records whose first byte lies in `[start, end)` of a CSV file.
    CsvChunk { path: PathBuf, start: u64, end: u64 },
    /// A run of consecutive parquet row groups.
    RowGroups { path: PathBuf, groups: Range<usize> },
}

#[derive(Debug, Clone)]
pub struct Partition {
    pub index: usize,
    pub bytes: u64,
    pub spec: PartitionSpec,
}

impl Weighted for Partition {
    fn weight_bytes(&self) -> u64 {
        self.bytes
    }
}

// ============================================================================
// Dataset
// ============================================================================

#[derive(Debug)]
pub struct Dataset {
    schema: SchemaRef,
    partitions: Vec<Partition>,
    num_files: usize,
    batch_rows: usize,
    sep: u8,
}

impl Dataset {
    /// Plan a dataset over raw CSV inputs (files or directories). Files are
    /// split into `partition_bytes`-sized chunks; empty files are skipped.
    pub fn from_csv(
        data_paths: &[PathBuf],
        sep: u8,
        partition_bytes: u64,
    ) -> Result<Self, DatasetError> {
        let files = paths::resolve_data_paths(data_paths, false);
        if files.is_empty() {
            return Err(DatasetError::NoInputFiles {
                supplied: data_paths.len(),
            });
        }
        let chunk_bytes = partition_bytes.max(1);
        let mut partitions = Vec::new();
        for path in &files {
            let len = fs::metadata(path)
                .map_err(|source| DatasetError::Open {
                    path: path.clone(),
                    source,
                })?
                .len();
            if len == 0 {
                debug!("skipping empty file {}", path.display());
                continue;
            }
            let chunks = len.div_ceil(chunk_bytes);
            for c in 0..chunks {
                let start = c * chunk_bytes;
                let end = ((c + 1) * chunk_bytes).min(len);
                partitions.push(Partition {
                    index: partitions.len(),
                    bytes: end - start,
                    spec: PartitionSpec::CsvChunk {
                        path: path.clone(),
                        start,
                        end,
                    },
                });
            }
        }
        info!(
            "csv dataset ready: {} file(s), {} partition(s)",
            files.len(),
            partitions.len()
        );
        Ok(Self {
            schema: schema::converted_schema(),
            partitions,
            num_files: files.len(),
            batch_rows: batch_rows_for(chunk_bytes),
            sep,
        })
    }

    /// Plan a dataset over a directory of converted parquet shards. Every
    /// shard must carry the converted layout; an empty directory is fatal.
    pub fn from_parquet_dir(dir: &Path, partition_bytes: u64) -> Result<Self, DatasetError> {
        let files = paths::list_parquet_files(dir)?;
        let target = partition_bytes.max(1);
        let mut partitions = Vec::new();
        for path in &files {
            let file = File::open(path).map_err(|source| DatasetError::Open {
                path: path.clone(),
                source,
            })?;
            let builder =
                ParquetRecordBatchReaderBuilder::try_new(file).map_err(|source| {
                    DatasetError::Parquet {
                        path: path.clone(),
                        source,
                    }
                })?;
            validate_converted_schema(builder.schema(), path)?;
            let sizes: Vec<u64> = builder
                .metadata()
                .row_groups()
                .iter()
                .map(|rg| rg.total_byte_size().max(0) as u64)
                .collect();
            for (groups, bytes) in pack_row_groups(&sizes, target) {
                partitions.push(Partition {
                    index: partitions.len(),
                    bytes,
                    spec: PartitionSpec::RowGroups {
                        path: path.clone(),
                        groups,
                    },
                });
            }
        }
        if partitions.is_empty() {
            warn!("parquet dataset under {} contains no row groups", dir.display());
        }
        info!(
            "parquet dataset ready: {} file(s), {} partition(s)",
            files.len(),
            partitions.len()
        );
        Ok(Self {
            schema: schema::converted_schema(),
            partitions,
            num_files: files.len(),
            batch_rows: batch_rows_for(target),
            sep: b',',
        })
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn num_files(&self) -> usize {
        self.num_files
    }

    pub fn batch_rows(&self) -> usize {
        self.batch_rows
    }

    /// Open one partition for reading. Cheap to call from any worker thread.
    pub fn open_partition(&self, partition: &Partition) -> Result<PartitionReader, DatasetError> {
        match &partition.spec {
            PartitionSpec::CsvChunk { path, start, end } => {
                Ok(PartitionReader::Csv(CsvPartitionReader::open(
                    path.clone(),
                    *start,
                    *end,
                    self.sep,
                    self.batch_rows,
                    self.schema.clone(),
                )?))
            }
            PartitionSpec::RowGroups { path, groups } => {
                let file = File::open(path).map_err(|source| DatasetError::Open {
                    path: path.clone(),
                    source,
                })?;
                let reader = ParquetRecordBatchReaderBuilder::try_new(file)
                    .and_then(|builder| {
                        builder
                            .with_row_groups(groups.clone().collect())
                            .with_batch_size(self.batch_rows)
                            .build()
                    })
                    .map_err(|source| DatasetError::Parquet {
                        path: path.clone(),
                        source,
                    })?;
                Ok(PartitionReader::Parquet {
                    reader,
                    path: path.clone(),
                })
            }
        }
    }
}

fn batch_rows_for(partition_bytes: u64) -> usize {
    let rows = partition_bytes / APPROX_ROW_BYTES;
    usize::try_from(rows)
        .unwrap_or(MAX_BATCH_ROWS)
        .clamp(MIN_BATCH_ROWS, MAX_BATCH_ROWS)
}

/// Greedy left-to-right packing of row groups into runs of at most `target`
/// bytes; a single oversized group still forms its own run.
fn pack_row_groups(sizes: &[u64], target: u64) -> Vec<(Range<usize>, u64)> {
    let mut runs = Vec::new();
    let mut start = 0usize;
    let mut acc = 0u64;
    for (g, &size) in sizes.iter().enumerate() {
        if acc > 0 && acc + size > target {
            runs.push((start..g, acc));
            start = g;
            acc = 0;
        }
        acc += size;
    }
    if start < sizes.len() {
        runs.push((start..sizes.len(), acc));
    }
    runs
}

fn validate_converted_schema(actual: &Schema, path: &Path) -> Result<(), DatasetError> {
    let expected = schema::converted_schema();
    let mismatch = |detail: String| DatasetError::SchemaMismatch {
        path: path.to_path_buf(),
        detail,
    };
    if actual.fields().len() != expected.fields().len() {
        return Err(mismatch(format!(
            "expected {} columns, found {}",
            expected.fields().len(),
            actual.fields().len()
        )));
    }
    for (want, have) in expected.fields().iter().zip(actual.fields().iter()) {
        if want.name() != have.name() {
            return Err(mismatch(format!(
                "column `{}` where `{}` was expected",
                have.name(),
                want.name()
            )));
        }
        if have.data_type() != &DataType::Int32 {
            return Err(mismatch(format!(
                "column `{}` has type {}, expected Int32",
                have.name(),
                have.data_type()
            )));
        }
    }
    Ok(())
}

// ============================================================================
// Partition readers
// ============================================================================

pub enum PartitionReader {
    Csv(CsvPartitionReader),
    Parquet {
        reader: ParquetRecordBatchReader,
        path: PathBuf,
    },
}

impl Iterator for PartitionReader {
    type Item = Result<RecordBatch, DatasetError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            PartitionReader::Csv(reader) => reader.next_batch().transpose(),
            PartitionReader::Parquet { reader, path } => reader.next().map(|result| {
                result.map_err(|source| DatasetError::Decode {
                    path: path.clone(),
                    source,
                })
            }),
        }
    }
}

/// Streams one CSV chunk as converted-layout batches.
///
/// Record-level errors report the index within this chunk together with the
/// chunk's starting byte; a mid-file chunk cannot know its absolute line
/// number without rescanning from byte zero.
pub struct CsvPartitionReader {
    reader: csv::Reader<CsvChunkReader>,
    record: csv::ByteRecord,
    path: PathBuf,
    schema: SchemaRef,
    batch_rows: usize,
    chunk_start: u64,
    records_seen: u64,
    done: bool,
    labels: Vec<i32>,
    continuous: Vec<Vec<Option<i32>>>,
    categorical: Vec<Vec<Option<i32>>>,
}

impl CsvPartitionReader {
    fn open(
        path: PathBuf,
        start: u64,
        end: u64,
        sep: u8,
        batch_rows: usize,
        schema: SchemaRef,
    ) -> Result<Self, DatasetError> {
        let chunk = CsvChunkReader::open(&path, start, end).map_err(|source| {
            DatasetError::Open {
                path: path.clone(),
                source,
            }
        })?;
        // Field counts are checked per record for an error message that
        // names the offending record, so the csv reader itself is lenient.
        let reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .delimiter(sep)
            .flexible(true)
            .from_reader(chunk);
        Ok(Self {
            reader,
            record: csv::ByteRecord::new(),
            path,
            schema,
            batch_rows,
            chunk_start: start,
            records_seen: 0,
            done: false,
            labels: Vec::new(),
            continuous: vec![Vec::new(); schema::NUM_CONTINUOUS],
            categorical: vec![Vec::new(); schema::NUM_CATEGORICAL],
        })
    }

    fn next_batch(&mut self) -> Result<Option<RecordBatch>, DatasetError> {
        if self.done {
            return Ok(None);
        }
        let mut rows = 0usize;
        while rows < self.batch_rows {
            let more = self
                .reader
                .read_byte_record(&mut self.record)
                .map_err(|source| DatasetError::Csv {
                    path: self.path.clone(),
                    source,
                })?;
            if !more {
                self.done = true;
                break;
            }
            self.records_seen += 1;
            self.push_record()?;
            rows += 1;
        }
        if rows == 0 {
            return Ok(None);
        }
        Ok(Some(self.build_batch()?))
    }

    fn push_record(&mut self) -> Result<(), DatasetError> {
        let record = &self.record;
        if record.len() != schema::NUM_COLUMNS {
            return Err(DatasetError::FieldCount {
                path: self.path.clone(),
                record: self.records_seen,
                offset: self.chunk_start,
                expected: schema::NUM_COLUMNS,
                found: record.len(),
            });
        }
        let label = schema::parse_i32_field(&record[schema::LABEL_INDEX]).map_err(|source| {
            DatasetError::Field {
                path: self.path.clone(),
                record: self.records_seen,
                offset: self.chunk_start,
                column: schema::LABEL.to_string(),
                source,
            }
        })?;
        let Some(label) = label else {
            return Err(DatasetError::NullLabel {
                path: self.path.clone(),
                record: self.records_seen,
                offset: self.chunk_start,
            });
        };
        self.labels.push(label);
        for j in 0..schema::NUM_CONTINUOUS {
            let value = schema::parse_i32_field(&record[schema::CONTINUOUS_START + j]).map_err(
                |source| DatasetError::Field {
                    path: self.path.clone(),
                    record: self.records_seen,
                    offset: self.chunk_start,
                    column: format!("I{}", j + 1),
                    source,
                },
            )?;
            self.continuous[j].push(value);
        }
        for j in 0..schema::NUM_CATEGORICAL {
            let value = schema::parse_hex32(&record[schema::CATEGORICAL_START + j]).map_err(
                |source| DatasetError::Field {
                    path: self.path.clone(),
                    record: self.records_seen,
                    offset: self.chunk_start,
                    column: format!("C{}", j + 1),
                    source,
                },
            )?;
            self.categorical[j].push(value);
        }
        Ok(())
    }

    fn build_batch(&mut self) -> Result<RecordBatch, DatasetError> {
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema::NUM_COLUMNS);
        columns.push(Arc::new(Int32Array::from(std::mem::take(&mut self.labels))));
        for column in &mut self.continuous {
            columns.push(Arc::new(Int32Array::from(std::mem::take(column))));
        }
        for column in &mut self.categorical {
            columns.push(Arc::new(Int32Array::from(std::mem::take(column))));
        }
        RecordBatch::try_new(self.schema.clone(), columns).map_err(DatasetError::Arrow)
    }
}

// ============================================================================
// CSV chunk reader
// ============================================================================

/// `Read` adapter exposing one byte range of a CSV file, aligned so each
/// record is seen by exactly one chunk.
struct CsvChunkReader {
    inner: BufReader<File>,
    remaining: u64,
    tail: bool,
    done: bool,
}

impl CsvChunkReader {
    fn open(path: &Path, start: u64, end: u64) -> std::io::Result<Self> {
        let file = File::open(path)?;
        let mut inner = BufReader::with_capacity(1 << 20, file);
        let mut remaining = end.saturating_sub(start);
        if start > 0 {
            // Seek one byte back and discard through the newline terminating
            // the record that owns byte start-1.
            inner.seek(SeekFrom::Start(start - 1))?;
            let mut pos = start - 1;
            let mut byte = [0u8; 1];
            loop {
                if inner.read(&mut byte)? == 0 {
                    return Ok(Self {
                        inner,
                        remaining: 0,
                        tail: false,
                        done: true,
                    });
                }
                pos += 1;
                if byte[0] == b'\n' {
                    break;
                }
            }
            if pos >= end {
                // The skipped record ran past this whole range.
                return Ok(Self {
                    inner,
                    remaining: 0,
                    tail: false,
                    done: true,
                });
            }
            remaining = end - pos;
        }
        Ok(Self {
            inner,
            remaining,
            tail: false,
            done: false,
        })
    }
}

impl Read for CsvChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.done || buf.is_empty() {
            return Ok(0);
        }
        if !self.tail {
            let want = (buf.len() as u64).min(self.remaining) as usize;
            if want > 0 {
                let n = self.inner.read(&mut buf[..want])?;
                if n == 0 {
                    self.done = true;
                    return Ok(0);
                }
                self.remaining -= n as u64;
                if self.remaining == 0 && buf[n - 1] == b'\n' {
                    self.done = true;
                }
                return Ok(n);
            }
            // Range exhausted mid-record; finish it byte by byte.
            self.tail = true;
        }
        let mut written = 0;
        let mut byte = [0u8; 1];
        while written < buf.len() {
            if self.inner.read(&mut byte)? == 0 {
                self.done = true;
                break;
            }
            buf[written] = byte[0];
            written += 1;
            if byte[0] == b'\n' {
                self.done = true;
                break;
            }
        }
        Ok(written)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Array;
    use std::io::Write as _;

    const PARTITION_BYTES: u64 = 1 << 20;

    /// One raw row: label, two populated counts, one negative count, the
    /// rest of I empty, one known hex value, the rest of C empty.
    fn raw_row(label: i32, i1: i32, c1: &str) -> String {
        let mut fields = vec![label.to_string(), i1.to_string(), "-2".to_string()];
        fields.extend(std::iter::repeat_n(String::new(), 11));
        fields.push(c1.to_string());
        fields.extend(std::iter::repeat_n(String::new(), 25));
        fields.join("\t")
    }

    fn write_csv(path: &Path, rows: &[String]) {
        let mut file = File::create(path).unwrap();
        for row in rows {
            writeln!(file, "{row}").unwrap();
        }
    }

    fn read_all(dataset: &Dataset) -> Vec<RecordBatch> {
        let mut batches = Vec::new();
        for partition in dataset.partitions() {
            for batch in dataset.open_partition(partition).unwrap() {
                batches.push(batch.unwrap());
            }
        }
        batches
    }

    fn column(batch: &RecordBatch, index: usize) -> &Int32Array {
        batch
            .column(index)
            .as_any()
            .downcast_ref::<Int32Array>()
            .unwrap()
    }

    #[test]
    fn separator_parsing() {
        assert_eq!(parse_separator(",").unwrap(), b',');
        assert_eq!(parse_separator("\t").unwrap(), b'\t');
        assert_eq!(parse_separator("\\t").unwrap(), b'\t');
        assert!(parse_separator("").is_err());
        assert!(parse_separator("ab").is_err());
        assert!(parse_separator("é").is_err());
    }

    #[test]
    fn decodes_the_forty_column_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("day_0.csv");
        write_csv(
            &path,
            &[raw_row(1, 5, "ffffffff"), raw_row(0, -9, "68fd1e64")],
        );

        let dataset = Dataset::from_csv(&[path], b'\t', PARTITION_BYTES).unwrap();
        assert_eq!(dataset.partitions().len(), 1);
        let batches = read_all(&dataset);
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.schema(), schema::converted_schema());

        assert_eq!(column(batch, 0).values(), &[1, 0]);
        // I1 keeps raw values, including negatives; fills happen later.
        assert_eq!(column(batch, 1).value(0), 5);
        assert_eq!(column(batch, 1).value(1), -9);
        // I3 was empty in both rows.
        assert_eq!(column(batch, 3).null_count(), 2);
        // C1 hex decodes with wraparound.
        assert_eq!(column(batch, 14).value(0), -1);
        assert_eq!(column(batch, 14).value(1), 0x68fd_1e64_u32 as i32);
        // C2 was empty.
        assert_eq!(column(batch, 15).null_count(), 2);
    }

    #[test]
    fn chunked_reads_lose_and_duplicate_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("day_0.csv");
        let rows: Vec<String> = (0..403).map(|i| raw_row(i % 2, i, "0a0b0c0d")).collect();
        write_csv(&path, &rows);
        let file_len = fs::metadata(&path).unwrap().len();

        // Cut the file at several awkward chunk sizes, including ones that
        // land mid-record and one larger than the file.
        for chunk in [37u64, 100, 256, 1021, file_len, file_len + 5] {
            let dataset = Dataset::from_csv(&[path.clone()], b'\t', chunk).unwrap();
            let expected_parts = file_len.div_ceil(chunk) as usize;
            assert_eq!(dataset.partitions().len(), expected_parts);
            let mut seen: Vec<i32> = read_all(&dataset)
                .iter()
                .flat_map(|b| {
                    let i1 = column(b, 1);
                    (0..i1.len()).map(|i| i1.value(i)).collect::<Vec<_>>()
                })
                .collect();
            seen.sort_unstable();
            assert_eq!(seen, (0..403).collect::<Vec<_>>(), "chunk={chunk}");
        }
    }

    #[test]
    fn file_without_trailing_newline_still_reads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("day_0.csv");
        let body = format!("{}\n{}", raw_row(0, 1, "aa"), raw_row(1, 2, "bb"));
        fs::write(&path, body).unwrap();
        let dataset = Dataset::from_csv(&[path], b'\t', 24).unwrap();
        let rows: usize = read_all(&dataset).iter().map(|b| b.num_rows()).sum();
        assert_eq!(rows, 2);
    }

    #[test]
    fn ragged_record_is_a_field_count_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        write_csv(&path, &[raw_row(0, 1, "aa"), "1\t2\t3".to_string()]);
        let dataset = Dataset::from_csv(&[path], b'\t', PARTITION_BYTES).unwrap();
        let err = dataset
            .open_partition(&dataset.partitions()[0])
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap_err();
        match err {
            DatasetError::FieldCount {
                record,
                offset,
                expected,
                found,
                ..
            } => {
                assert_eq!(record, 2);
                assert_eq!(offset, 0);
                assert_eq!(expected, 40);
                assert_eq!(found, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn errors_name_the_owning_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("day_0.csv");
        let mut rows: Vec<String> = (0..6).map(|i| raw_row(0, i, "aa")).collect();
        rows[4] = "1\t2\t3".to_string();
        write_csv(&path, &rows);
        let bad_start: u64 = rows[..4].iter().map(|r| r.len() as u64 + 1).sum();

        let dataset = Dataset::from_csv(&[path], b'\t', 50).unwrap();
        assert!(dataset.partitions().len() > 1);
        let mut failures = Vec::new();
        for partition in dataset.partitions() {
            if let Err(err) = dataset
                .open_partition(partition)
                .unwrap()
                .collect::<Result<Vec<_>, _>>()
            {
                failures.push(err);
            }
        }

        // Only the chunk owning the ragged record fails, and the error names
        // that chunk's starting byte rather than a partition-local index that
        // cannot be located in the file.
        assert_eq!(failures.len(), 1);
        let owner_start = dataset
            .partitions()
            .iter()
            .find_map(|p| match &p.spec {
                PartitionSpec::CsvChunk { start, end, .. }
                    if (*start..*end).contains(&bad_start) =>
                {
                    Some(*start)
                }
                _ => None,
            })
            .unwrap();
        match &failures[0] {
            DatasetError::FieldCount { record, offset, .. } => {
                assert_eq!(*offset, owner_start);
                assert!(*offset > 0);
                assert_eq!(*record, 1);
                let message = failures[0].to_string();
                assert!(message.contains(&format!("after byte {owner_start}")), "{message}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn bad_hex_names_the_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        write_csv(&path, &[raw_row(0, 1, "not-hex")]);
        let dataset = Dataset::from_csv(&[path], b'\t', PARTITION_BYTES).unwrap();
        let err = dataset
            .open_partition(&dataset.partitions()[0])
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap_err();
        match err {
            DatasetError::Field { column, record, .. } => {
                assert_eq!(column, "C1");
                assert_eq!(record, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_label_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        let mut row = raw_row(0, 1, "aa");
        row.replace_range(0..1, "");
        write_csv(&path, &[row]);
        let dataset = Dataset::from_csv(&[path], b'\t', PARTITION_BYTES).unwrap();
        let err = dataset
            .open_partition(&dataset.partitions()[0])
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap_err();
        assert!(matches!(err, DatasetError::NullLabel { record: 1, .. }));
    }

    #[test]
    fn missing_inputs_resolve_to_an_error_only_when_nothing_is_left() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("day_0.csv");
        write_csv(&present, &[raw_row(0, 1, "aa")]);
        let missing = dir.path().join("day_1.csv");

        let dataset =
            Dataset::from_csv(&[present, missing.clone()], b'\t', PARTITION_BYTES).unwrap();
        assert_eq!(dataset.num_files(), 1);

        let err = Dataset::from_csv(&[missing], b'\t', PARTITION_BYTES).unwrap_err();
        assert!(matches!(err, DatasetError::NoInputFiles { supplied: 1 }));
    }

    #[test]
    fn row_group_packing_respects_the_target() {
        let runs = pack_row_groups(&[10, 10, 10, 10], 25);
        assert_eq!(runs, vec![(0..2, 20), (2..4, 20)]);
        // An oversized group forms a run on its own.
        let runs = pack_row_groups(&[40, 5, 5], 25);
        assert_eq!(runs, vec![(0..1, 40), (1..3, 10)]);
        assert!(pack_row_groups(&[], 25).is_empty());
        let runs = pack_row_groups(&[1, 1, 1], 100);
        assert_eq!(runs, vec![(0..3, 3)]);
    }

    #[test]
    fn batch_rows_stay_clamped() {
        assert_eq!(batch_rows_for(0), MIN_BATCH_ROWS);
        assert_eq!(batch_rows_for(192 * 100), MIN_BATCH_ROWS);
        assert_eq!(batch_rows_for(100 << 20), (100 << 20) / 192);
        assert_eq!(batch_rows_for(u64::MAX), MAX_BATCH_ROWS);
    }

    #[test]
    fn parquet_dataset_rejects_foreign_schemas() {
        use arrow::datatypes::Field;
        use parquet::arrow::ArrowWriter;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("part_00000.parquet");
        let schema = Arc::new(Schema::new(vec![Field::new(
            "not_criteo",
            DataType::Int32,
            false,
        )]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(Int32Array::from(vec![1, 2, 3]))],
        )
        .unwrap();
        let file = File::create(&path).unwrap();
        let mut writer = ArrowWriter::try_new(file, schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();

        let err = Dataset::from_parquet_dir(dir.path(), PARTITION_BYTES).unwrap_err();
        assert!(matches!(err, DatasetError::SchemaMismatch { .. }));
    }

    #[test]
    fn parquet_roundtrip_through_the_converted_layout() {
        use parquet::arrow::ArrowWriter;
        use parquet::file::properties::WriterProperties;

        let dir = tempfile::tempdir().unwrap();
        let csv_path = dir.path().join("day_0.csv");
        write_csv(&csv_path, &[raw_row(1, 7, "0000002a"), raw_row(0, 8, "")]);
        let source = Dataset::from_csv(&[csv_path], b'\t', PARTITION_BYTES).unwrap();
        let batches = read_all(&source);

        let out_dir = dir.path().join("converted");
        fs::create_dir(&out_dir).unwrap();
        let out = File::create(out_dir.join("part_00000.parquet")).unwrap();
        let props = WriterProperties::builder()
            .set_max_row_group_size(1)
            .build();
        let mut writer =
            ArrowWriter::try_new(out, schema::converted_schema(), Some(props)).unwrap();
        for batch in &batches {
            writer.write(batch).unwrap();
        }
        writer.close().unwrap();

        // Two row groups of one row each, packed into one partition apiece.
        let dataset = Dataset::from_parquet_dir(&out_dir, 1).unwrap();
        assert_eq!(dataset.partitions().len(), 2);
        let round: Vec<RecordBatch> = read_all(&dataset);
        let rows: usize = round.iter().map(|b| b.num_rows()).sum();
        assert_eq!(rows, 2);
        assert_eq!(column(&round[0], 14).value(0), 42);
        assert_eq!(column(&round[1], 14).null_count(), 1);
    }
}
