//! Column operators and their fitted statistics.
//!
//! Continuous columns are filled (null -> 0), clipped at zero, and z-score
//! normalized with statistics gathered over the filled, clipped values.
//! Categorical columns are frequency-encoded: codes start at 1 for the most
//! frequent value and 0 is reserved for nulls and anything outside the
//! fitted vocabulary.
//!
//! Fitting streams one partition at a time: each worker folds its batches
//! into a [`FitAccumulator`], and accumulators merge associatively so the
//! result is independent of partition order.

use std::collections::HashMap;

use arrow::array::{Array, Float32Array, Int32Array};
use arrow::record_batch::RecordBatch;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schema;

/// Code reserved for null and out-of-vocabulary categorical values.
pub const OOV_CODE: i32 = 0;
/// Default cap on a fitted vocabulary, including the reserved code.
pub const DEFAULT_MAX_SIZE: usize = 10_000_000;

/// Standard deviations at or below this are treated as constant columns.
const STD_EPSILON: f64 = 1e-12;

#[derive(Debug, Error)]
pub enum OpsError {
    #[error("column {column} is not int32")]
    NotInt32 { column: String },
}

/// Fetch a batch column as `Int32Array` or fail with its name.
pub fn int32_column(batch: &RecordBatch, index: usize) -> Result<&Int32Array, OpsError> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<Int32Array>()
        .ok_or_else(|| OpsError::NotInt32 {
            column: batch.schema().field(index).name().clone(),
        })
}

// ============================================================================
// Operator parameters
// ============================================================================

/// Frequency encoding with a bounded vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategorifyOp {
    pub max_size: usize,
}

impl Default for CategorifyOp {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
        }
    }
}

/// Replace nulls with a constant before any other continuous op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillMissingOp {
    pub fill: i32,
}

impl Default for FillMissingOp {
    fn default() -> Self {
        Self { fill: 0 }
    }
}

/// Clamp values from below; criteo count features occasionally go negative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipOp {
    pub min: i32,
}

impl Default for ClipOp {
    fn default() -> Self {
        Self { min: 0 }
    }
}

/// Z-score normalization using the fitted mean and sample std.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NormalizeOp {}

// ============================================================================
// Continuous statistics
// ============================================================================

/// Single-pass mean and variance accumulator with a numerically stable merge,
/// observed over the filled and clipped values of one column.
#[derive(Debug, Clone)]
pub struct ContinuousMoments {
    count: u64,
    nulls: u64,
    mean: f64,
    m2: f64,
    min: i32,
    max: i32,
}

impl ContinuousMoments {
    pub fn new() -> Self {
        Self {
            count: 0,
            nulls: 0,
            mean: 0.0,
            m2: 0.0,
            min: i32::MAX,
            max: i32::MIN,
        }
    }

    /// Observe one raw value; `fill` and `clip_min` are applied first so the
    /// statistics describe exactly what normalization will see.
    pub fn observe(&mut self, value: Option<i32>, fill: i32, clip_min: i32) {
        if value.is_none() {
            self.nulls += 1;
        }
        let v = value.unwrap_or(fill).max(clip_min);
        self.count += 1;
        if v < self.min {
            self.min = v;
        }
        if v > self.max {
            self.max = v;
        }
        let delta = f64::from(v) - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (f64::from(v) - self.mean);
    }

    /// Fold another accumulator in. Commutative up to floating-point
    /// rounding, which is what makes parallel fitting deterministic enough.
    pub fn merge(&mut self, other: &Self) {
        if other.count == 0 {
            self.nulls += other.nulls;
            return;
        }
        if self.count == 0 {
            let nulls = self.nulls + other.nulls;
            *self = other.clone();
            self.nulls = nulls;
            return;
        }
        let n1 = self.count as f64;
        let n2 = other.count as f64;
        let total = n1 + n2;
        let delta = other.mean - self.mean;
        self.m2 += other.m2 + delta * delta * n1 * n2 / total;
        self.mean += delta * n2 / total;
        self.count += other.count;
        self.nulls += other.nulls;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    /// Final statistics; sample std (ddof = 1). Fewer than two values leave
    /// std at 0.0, so normalization treats the column as constant.
    pub fn finalize(&self) -> ContinuousStats {
        let std = if self.count > 1 {
            (self.m2 / (self.count - 1) as f64).sqrt()
        } else {
            0.0
        };
        ContinuousStats {
            count: self.count,
            nulls: self.nulls,
            min: if self.count == 0 { 0 } else { self.min },
            max: if self.count == 0 { 0 } else { self.max },
            mean: self.mean,
            std,
        }
    }
}

impl Default for ContinuousMoments {
    fn default() -> Self {
        Self::new()
    }
}

/// Fitted per-column statistics as persisted in the workflow manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuousStats {
    pub count: u64,
    pub nulls: u64,
    pub min: i32,
    pub max: i32,
    pub mean: f64,
    pub std: f64,
}

/// Fill, clip, and normalize one column into float32.
///
/// A constant column (std below epsilon) maps every row to 0.0 instead of
/// amplifying rounding noise.
pub fn normalize_array(
    values: &Int32Array,
    stats: &ContinuousStats,
    fill: i32,
    clip_min: i32,
) -> Float32Array {
    let mut out = Vec::with_capacity(values.len());
    let scale = stats.std > STD_EPSILON;
    for i in 0..values.len() {
        let raw = if values.is_null(i) {
            fill
        } else {
            values.value(i)
        };
        let v = f64::from(raw.max(clip_min));
        out.push(if scale {
            ((v - stats.mean) / stats.std) as f32
        } else {
            0.0
        });
    }
    Float32Array::from(out)
}

// ============================================================================
// Categorical vocabularies
// ============================================================================

/// Streaming value counts for one categorical column.
#[derive(Debug, Default)]
pub struct CategoryAccumulator {
    counts: HashMap<i32, u64>,
    nulls: u64,
}

impl CategoryAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, value: Option<i32>) {
        match value {
            Some(v) => *self.counts.entry(v).or_insert(0) += 1,
            None => self.nulls += 1,
        }
    }

    pub fn observe_array(&mut self, values: &Int32Array) {
        for i in 0..values.len() {
            if values.is_null(i) {
                self.nulls += 1;
            } else {
                *self.counts.entry(values.value(i)).or_insert(0) += 1;
            }
        }
    }

    pub fn merge(&mut self, other: Self) {
        self.nulls += other.nulls;
        for (value, count) in other.counts {
            *self.counts.entry(value).or_insert(0) += count;
        }
    }

    pub fn distinct(&self) -> usize {
        self.counts.len()
    }

    /// Rank values by descending frequency (ties by ascending value, so the
    /// encoding is deterministic) and keep the `max_size - 1` most frequent;
    /// the remaining slot is the reserved null/OOV code.
    pub fn build(self, max_size: usize) -> CategoryTable {
        let mut entries: Vec<(i32, u64)> = self.counts.into_iter().collect();
        entries.sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        entries.truncate(max_size.saturating_sub(1));
        let values: Vec<i32> = entries.iter().map(|&(v, _)| v).collect();
        let counts: Vec<u64> = entries.iter().map(|&(_, c)| c).collect();
        CategoryTable::from_parts(values, counts, self.nulls)
    }
}

/// A fitted vocabulary: values ordered by code (code = position + 1).
#[derive(Debug, Clone)]
pub struct CategoryTable {
    values: Vec<i32>,
    counts: Vec<u64>,
    nulls: u64,
    index: HashMap<i32, i32>,
}

impl CategoryTable {
    pub fn from_parts(values: Vec<i32>, counts: Vec<u64>, nulls: u64) -> Self {
        let index = values
            .iter()
            .enumerate()
            .map(|(i, &v)| (v, i as i32 + 1))
            .collect();
        Self {
            values,
            counts,
            nulls,
            index,
        }
    }

    /// Distinct values in the vocabulary, excluding the reserved code.
    pub fn cardinality(&self) -> usize {
        self.values.len()
    }

    pub fn nulls(&self) -> u64 {
        self.nulls
    }

    /// Vocabulary values in code order (code 1 first).
    pub fn values(&self) -> &[i32] {
        &self.values
    }

    /// Fit-time frequencies aligned with [`Self::values`].
    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn code(&self, value: Option<i32>) -> i32 {
        value
            .and_then(|v| self.index.get(&v).copied())
            .unwrap_or(OOV_CODE)
    }

    /// Encode a column; nulls and unseen values map to the reserved code.
    pub fn encode(&self, values: &Int32Array) -> Int32Array {
        let mut out = Vec::with_capacity(values.len());
        for i in 0..values.len() {
            if values.is_null(i) {
                out.push(OOV_CODE);
            } else {
                out.push(self.index.get(&values.value(i)).copied().unwrap_or(OOV_CODE));
            }
        }
        Int32Array::from(out)
    }
}

// ============================================================================
// Fit accumulator
// ============================================================================

/// Everything one fit pass gathers: row count, continuous moments for
/// `I1..I13`, and value counts for `C1..C26`, in column order.
#[derive(Debug)]
pub struct FitAccumulator {
    pub rows: u64,
    pub moments: Vec<ContinuousMoments>,
    pub categories: Vec<CategoryAccumulator>,
    fill: i32,
    clip_min: i32,
}

impl FitAccumulator {
    pub fn new(num_continuous: usize, num_categorical: usize, fill: i32, clip_min: i32) -> Self {
        Self {
            rows: 0,
            moments: (0..num_continuous).map(|_| ContinuousMoments::new()).collect(),
            categories: (0..num_categorical)
                .map(|_| CategoryAccumulator::new())
                .collect(),
            fill,
            clip_min,
        }
    }

    /// Fold one converted-layout batch into the running statistics.
    pub fn update_batch(&mut self, batch: &RecordBatch) -> Result<(), OpsError> {
        self.rows += batch.num_rows() as u64;
        for (j, moments) in self.moments.iter_mut().enumerate() {
            let column = int32_column(batch, schema::CONTINUOUS_START + j)?;
            for i in 0..column.len() {
                let value = if column.is_null(i) {
                    None
                } else {
                    Some(column.value(i))
                };
                moments.observe(value, self.fill, self.clip_min);
            }
        }
        for (j, accumulator) in self.categories.iter_mut().enumerate() {
            accumulator.observe_array(int32_column(batch, schema::CATEGORICAL_START + j)?);
        }
        Ok(())
    }

    /// Merge a sibling accumulator; categorical maps merge in parallel since
    /// they dominate the cost once vocabularies grow.
    pub fn merge(&mut self, other: Self) {
        self.rows += other.rows;
        for (mine, theirs) in self.moments.iter_mut().zip(&other.moments) {
            mine.merge(theirs);
        }
        self.categories
            .par_iter_mut()
            .zip(other.categories.into_par_iter())
            .for_each(|(mine, theirs)| mine.merge(theirs));
    }
}

// ============================================================================
// Tests
// ============================================================================
