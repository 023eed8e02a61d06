use std::ops::Range;

use crate::constants::{selection_len, RECORD_SIZE_BYTES, SELECTION_GRANULARITY};
use crate::selection::{SelectionError, SelectionVector};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    NoUnits,
    RecordsNotGroupAligned { records: usize },
    SelectionMismatch(SelectionError),
}

impl std::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LayoutError::NoUnits => write!(f, "shard layout needs at least one unit"),
            LayoutError::RecordsNotGroupAligned { records } => {
                write!(
                    f,
                    "record count {} is not a multiple of {}",
                    records, SELECTION_GRANULARITY
                )
            }
            LayoutError::SelectionMismatch(err) => write!(f, "cannot partition selection: {}", err),
        }
    }
}

impl std::error::Error for LayoutError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LayoutError::SelectionMismatch(err) => Some(err),
            _ => None,
        }
    }
}

impl From<SelectionError> for LayoutError {
    fn from(err: SelectionError) -> Self {
        LayoutError::SelectionMismatch(err)
    }
}

/// Contiguous partition of a record store across `unit_count` compute units.
///
/// Every unit is assigned `ceil(total_records / unit_count)` records except the
/// trailing ones, which may be short or empty. Units are sized uniformly in
/// bulk memory, so short shards are padded with zero records that never change
/// a reduction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShardLayout {
    total_records: usize,
    unit_count: usize,
    records_per_shard: usize,
}

impl ShardLayout {
    pub fn new(total_records: usize, unit_count: usize) -> Result<Self, LayoutError> {
        if unit_count == 0 {
            return Err(LayoutError::NoUnits);
        }
        if !total_records.is_multiple_of(SELECTION_GRANULARITY) {
            return Err(LayoutError::RecordsNotGroupAligned {
                records: total_records,
            });
        }
        Ok(Self {
            total_records,
            unit_count,
            records_per_shard: total_records.div_ceil(unit_count),
        })
    }

    pub fn total_records(&self) -> usize {
        self.total_records
    }

    pub fn unit_count(&self) -> usize {
        self.unit_count
    }

    /// Uniform shard capacity in records.
    pub fn records_per_shard(&self) -> usize {
        self.records_per_shard
    }

    /// Uniform shard capacity in bytes, the `shard_size_bytes` every unit sees.
    pub fn shard_size_bytes(&self) -> usize {
        self.records_per_shard * RECORD_SIZE_BYTES
    }

    /// Selection bytes one batch item needs per shard.
    pub fn selection_stride(&self) -> usize {
        selection_len(self.records_per_shard)
    }

    /// Global record range held by `unit`.
    pub fn shard_range(&self, unit: usize) -> Range<usize> {
        let start = (unit * self.records_per_shard).min(self.total_records);
        let end = (start + self.records_per_shard).min(self.total_records);
        start..end
    }

    pub fn shard_len(&self, unit: usize) -> usize {
        self.shard_range(unit).len()
    }

    /// Unit holding global record `index`.
    pub fn unit_of(&self, index: usize) -> Option<usize> {
        if index >= self.total_records || self.records_per_shard == 0 {
            return None;
        }
        Some(index / self.records_per_shard)
    }

    /// Splits a global selection into one per-unit selection, each padded to
    /// the uniform shard capacity.
    pub fn partition(&self, selection: &SelectionVector) -> Result<Vec<SelectionVector>, LayoutError> {
        if selection.record_count() != self.total_records {
            return Err(SelectionError::LengthMismatch {
                expected: selection_len(self.total_records),
                actual: selection.byte_len(),
            }
            .into());
        }
        (0..self.unit_count)
            .map(|unit| {
                let range = self.shard_range(unit);
                let part = selection.extract(range.start, range.len())?;
                Ok(part.padded_to(self.records_per_shard))
            })
            .collect()
    }
}
