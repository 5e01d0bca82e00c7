//! Deterministic stride sampling of rows for representative embeddings.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use super::columnar::Row;

/// Errors raised before sampling.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SamplingError {
    /// Stride must be a positive integer.
    #[error("sample stride must be greater than zero (got {0})")]
    InvalidStride(i64),
}

/// One sampled row and its position in the source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampledRow {
    /// Zero-based index in the flattened rows.
    pub index: usize,
    /// Row payload.
    pub payload: Value,
}

/// Rows chosen at indices `0, stride, 2 * stride, ...`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbeddingSample {
    /// Sampled rows in source order.
    pub rows: Vec<SampledRow>,
    /// Stride used.
    pub stride: usize,
    /// Rows available before sampling.
    pub total_rows: usize,
}

impl EmbeddingSample {
    /// Number of sampled rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether no rows were sampled.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Indices of the sampled rows.
    pub fn indices(&self) -> Vec<usize> {
        self.rows.iter().map(|row| row.index).collect()
    }
}

/// Stride sampler with a validated stride.
#[derive(Debug, Clone, Copy)]
pub struct EmbeddingSampler {
    stride: usize,
}

impl EmbeddingSampler {
    /// Create a sampler. A zero stride is rejected.
    pub fn new(stride: usize) -> Result<Self, SamplingError> {
        if stride == 0 {
            return Err(SamplingError::InvalidStride(0));
        }
        Ok(Self { stride })
    }

    /// Create a sampler from a signed stride, rejecting zero and negatives.
    pub fn from_signed(stride: i64) -> Result<Self, SamplingError> {
        usize::try_from(stride)
            .ok()
            .filter(|value| *value > 0)
            .map(|stride| Self { stride })
            .ok_or(SamplingError::InvalidStride(stride))
    }

    /// Configured stride.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Sample `rows`. Output length is `ceil(rows.len() / stride)`.
    pub fn sample(&self, rows: &[Row]) -> EmbeddingSample {
        let sampled = sample_indices(rows.len(), self.stride)
            .map(|index| SampledRow {
                index,
                payload: Value::Object(rows[index].clone()),
            })
            .collect();
        EmbeddingSample {
            rows: sampled,
            stride: self.stride,
            total_rows: rows.len(),
        }
    }
}

/// Sample `rows` with `stride`, validating the stride first.
pub fn sample(rows: &[Row], stride: i64) -> Result<EmbeddingSample, SamplingError> {
    Ok(EmbeddingSampler::from_signed(stride)?.sample(rows))
}

/// Indices `0, stride, 2 * stride, ...` below `len`. `stride` must be non-zero.
pub fn sample_indices(len: usize, stride: usize) -> impl Iterator<Item = usize> {
    (0..len).step_by(stride.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(count: usize) -> Vec<Row> {
        (0..count)
            .map(|index| {
                let Value::Object(row) = json!({ "n": index }) else {
                    unreachable!()
                };
                row
            })
            .collect()
    }

    #[test]
    fn every_tenth_of_twenty_five() {
        let sample = sample(&rows(25), 10).unwrap();
        assert_eq!(sample.indices(), vec![0, 10, 20]);
        assert_eq!(sample.rows[1].payload, json!({ "n": 10 }));
        assert_eq!(sample.stride, 10);
        assert_eq!(sample.total_rows, 25);
    }

    #[test]
    fn non_positive_stride_is_rejected() {
        assert_eq!(sample(&rows(3), 0), Err(SamplingError::InvalidStride(0)));
        assert_eq!(sample(&rows(3), -2), Err(SamplingError::InvalidStride(-2)));
        assert!(EmbeddingSampler::new(0).is_err());
    }

    #[test]
    fn edge_lengths() {
        let sampler = EmbeddingSampler::new(10).unwrap();
        assert!(sampler.sample(&[]).is_empty());
        assert_eq!(sampler.sample(&rows(10)).indices(), vec![0]);
        assert_eq!(sampler.sample(&rows(11)).indices(), vec![0, 10]);
        assert_eq!(EmbeddingSampler::new(1).unwrap().sample(&rows(4)).len(), 4);
    }

    #[test]
    fn sampling_is_deterministic() {
        let source = rows(57);
        let sampler = EmbeddingSampler::new(7).unwrap();
        assert_eq!(sampler.sample(&source), sampler.sample(&source));
    }
}
