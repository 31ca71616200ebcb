//! Output shuffle strategies for written parquet shards.
//!
//! With no shuffle, rows land in their input order. `PER_PARTITION` permutes
//! rows inside each buffered row group, `PER_WORKER` additionally scatters
//! each batch across the shards one worker owns, and `FULL` scatters every
//! batch across all shards of the run. All three only reorder rows; no row
//! is dropped or duplicated.

use arrow::array::UInt32Array;
use arrow::compute::take;
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use rand::Rng;
use rand::seq::SliceRandom;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShuffleMode {
    PerPartition,
    PerWorker,
    Full,
}

impl ShuffleMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ShuffleMode::PerPartition => "PER_PARTITION",
            ShuffleMode::PerWorker => "PER_WORKER",
            ShuffleMode::Full => "FULL",
        }
    }
}

impl std::fmt::Display for ShuffleMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolve a user-supplied shuffle name.
///
/// `"None"` and the empty string quietly select no shuffle. Anything else
/// that is not a known mode logs a warning and falls back to no shuffle
/// rather than failing the job.
pub fn resolve_shuffle(name: &str) -> Option<ShuffleMode> {
    match name {
        "" | "None" => None,
        "PER_PARTITION" => Some(ShuffleMode::PerPartition),
        "PER_WORKER" => Some(ShuffleMode::PerWorker),
        "FULL" => Some(ShuffleMode::Full),
        other => {
            warn!("shuffle method `{other}` not available, using default");
            None
        }
    }
}

/// Reorder a batch under a uniform random permutation.
pub fn permute_batch(batch: &RecordBatch, rng: &mut impl Rng) -> Result<RecordBatch, ArrowError> {
    if batch.num_rows() < 2 {
        return Ok(batch.clone());
    }
    let mut rows: Vec<u32> = (0..batch.num_rows() as u32).collect();
    rows.shuffle(rng);
    take_rows(batch, &rows)
}

/// Split a batch into `buckets` pieces, assigning each row to a uniformly
/// random bucket. Pieces come back in bucket order and may be empty.
pub fn scatter_batch(
    batch: &RecordBatch,
    buckets: usize,
    rng: &mut impl Rng,
) -> Result<Vec<RecordBatch>, ArrowError> {
    if buckets <= 1 {
        return Ok(vec![batch.clone()]);
    }
    let mut assignments: Vec<Vec<u32>> = vec![Vec::new(); buckets];
    for row in 0..batch.num_rows() as u32 {
        assignments[rng.random_range(0..buckets)].push(row);
    }
    assignments
        .iter()
        .map(|rows| take_rows(batch, rows))
        .collect()
}

fn take_rows(batch: &RecordBatch, rows: &[u32]) -> Result<RecordBatch, ArrowError> {
    let indices = UInt32Array::from(rows.to_vec());
    let columns = batch
        .columns()
        .iter()
        .map(|column| take(column.as_ref(), &indices, None))
        .collect::<Result<Vec<_>, _>>()?;
    RecordBatch::try_new(batch.schema(), columns)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int32Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use rand::SeedableRng;
    use rand::rngs::SmallRng;
    use std::sync::Arc;

    fn sample_batch(n: i32) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int32, false),
            Field::new("tag", DataType::Utf8, false),
        ]));
        let ids: Vec<i32> = (0..n).collect();
        let tags: Vec<String> = (0..n).map(|i| format!("t{i}")).collect();
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(ids)),
                Arc::new(StringArray::from(tags)),
            ],
        )
        .unwrap()
    }

    fn ids_of(batch: &RecordBatch) -> Vec<i32> {
        let col = batch
            .column(0)
            .as_any()
            .downcast_ref::<Int32Array>()
            .unwrap();
        (0..col.len()).map(|i| col.value(i)).collect()
    }

    #[test]
    fn resolves_known_modes() {
        assert_eq!(resolve_shuffle("PER_PARTITION"), Some(ShuffleMode::PerPartition));
        assert_eq!(resolve_shuffle("PER_WORKER"), Some(ShuffleMode::PerWorker));
        assert_eq!(resolve_shuffle("FULL"), Some(ShuffleMode::Full));
    }

    #[test]
    fn unknown_mode_falls_back_to_none() {
        assert_eq!(resolve_shuffle("None"), None);
        assert_eq!(resolve_shuffle(""), None);
        assert_eq!(resolve_shuffle("per_partition"), None);
        assert_eq!(resolve_shuffle("ZIGZAG"), None);
    }

    #[test]
    fn permutation_preserves_the_row_multiset() {
        let batch = sample_batch(257);
        let mut rng = SmallRng::seed_from_u64(7);
        let permuted = permute_batch(&batch, &mut rng).unwrap();
        assert_eq!(permuted.num_rows(), 257);
        let mut ids = ids_of(&permuted);
        ids.sort_unstable();
        assert_eq!(ids, (0..257).collect::<Vec<_>>());
        // Rows keep their column alignment under the permutation.
        let tags = permuted
            .column(1)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        let ids = ids_of(&permuted);
        for i in 0..permuted.num_rows() {
            assert_eq!(tags.value(i), format!("t{}", ids[i]));
        }
    }

    #[test]
    fn scatter_partitions_every_row_exactly_once() {
        let batch = sample_batch(500);
        let mut rng = SmallRng::seed_from_u64(11);
        let pieces = scatter_batch(&batch, 4, &mut rng).unwrap();
        assert_eq!(pieces.len(), 4);
        let mut all: Vec<i32> = pieces.iter().flat_map(|p| ids_of(p)).collect();
        assert_eq!(all.len(), 500);
        all.sort_unstable();
        assert_eq!(all, (0..500).collect::<Vec<_>>());
    }

    #[test]
    fn scatter_into_one_bucket_is_identity() {
        let batch = sample_batch(16);
        let mut rng = SmallRng::seed_from_u64(3);
        let pieces = scatter_batch(&batch, 1, &mut rng).unwrap();
        assert_eq!(pieces.len(), 1);
        assert_eq!(ids_of(&pieces[0]), (0..16).collect::<Vec<_>>());
    }
}
