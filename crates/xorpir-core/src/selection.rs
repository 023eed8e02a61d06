use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

use crate::constants::{selection_len, SELECTION_GRANULARITY};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionError {
    LengthMismatch { expected: usize, actual: usize },
    RecordCountMismatch { left: usize, right: usize },
    RangeOutOfBounds { start: usize, count: usize, record_count: usize },
}

impl std::fmt::Display for SelectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectionError::LengthMismatch { expected, actual } => {
                write!(
                    f,
                    "selection vector length mismatch: expected {} bytes, got {}",
                    expected, actual
                )
            }
            SelectionError::RecordCountMismatch { left, right } => {
                write!(
                    f,
                    "selection vectors cover different record counts ({} vs {})",
                    left, right
                )
            }
            SelectionError::RangeOutOfBounds {
                start,
                count,
                record_count,
            } => {
                write!(
                    f,
                    "selection range {}..{} exceeds {} records",
                    start,
                    start + count,
                    record_count
                )
            }
        }
    }
}

impl std::error::Error for SelectionError {}

/// Dense bit-selection over a run of records, packed LSB-first, 8 records per byte.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectionVector {
    bytes: Vec<u8>,
    record_count: usize,
}

impl SelectionVector {
    pub fn zeroed(record_count: usize) -> Self {
        Self {
            bytes: vec![0u8; selection_len(record_count)],
            record_count,
        }
    }

    /// Wraps already-expanded selection bytes.
    ///
    /// Bits past `record_count` in the final byte are cleared.
    pub fn from_bytes(bytes: Vec<u8>, record_count: usize) -> Result<Self, SelectionError> {
        let expected = selection_len(record_count);
        if bytes.len() != expected {
            return Err(SelectionError::LengthMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        let mut selection = Self {
            bytes,
            record_count,
        };
        selection.clear_tail();
        Ok(selection)
    }

    /// Selection with only `index` set.
    pub fn point(record_count: usize, index: usize) -> Self {
        let mut selection = Self::zeroed(record_count);
        selection.set(index, true);
        selection
    }

    pub fn random<R: Rng + ?Sized>(rng: &mut R, record_count: usize) -> Self {
        let mut bytes = vec![0u8; selection_len(record_count)];
        rng.fill_bytes(&mut bytes);
        let mut selection = Self {
            bytes,
            record_count,
        };
        selection.clear_tail();
        selection
    }

    pub fn record_count(&self) -> usize {
        self.record_count
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn get(&self, index: usize) -> bool {
        if index >= self.record_count {
            return false;
        }
        (self.bytes[index / SELECTION_GRANULARITY] >> (index % SELECTION_GRANULARITY)) & 1 == 1
    }

    /// Sets or clears bit `index`. Indices past the record count are ignored.
    pub fn set(&mut self, index: usize, selected: bool) {
        if index >= self.record_count {
            return;
        }
        let bit = 1u8 << (index % SELECTION_GRANULARITY);
        let byte = &mut self.bytes[index / SELECTION_GRANULARITY];
        if selected {
            *byte |= bit;
        } else {
            *byte &= !bit;
        }
    }

    pub fn toggle(&mut self, index: usize) {
        let current = self.get(index);
        self.set(index, !current);
    }

    /// Indices of all selected records, ascending.
    pub fn selected(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.record_count).filter(move |&i| self.get(i))
    }

    pub fn count_selected(&self) -> usize {
        self.bytes.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Bitwise XOR of two selections over the same record count.
    pub fn xor(&self, other: &SelectionVector) -> Result<SelectionVector, SelectionError> {
        if self.record_count != other.record_count {
            return Err(SelectionError::RecordCountMismatch {
                left: self.record_count,
                right: other.record_count,
            });
        }
        let bytes = self
            .bytes
            .iter()
            .zip(other.bytes.iter())
            .map(|(a, b)| a ^ b)
            .collect();
        Ok(SelectionVector {
            bytes,
            record_count: self.record_count,
        })
    }

    /// Copies bits `start..start + count` into a new selection starting at bit 0.
    pub fn extract(&self, start: usize, count: usize) -> Result<SelectionVector, SelectionError> {
        if start + count > self.record_count {
            return Err(SelectionError::RangeOutOfBounds {
                start,
                count,
                record_count: self.record_count,
            });
        }

        if start.is_multiple_of(SELECTION_GRANULARITY) {
            let first = start / SELECTION_GRANULARITY;
            let bytes = self.bytes[first..first + selection_len(count)].to_vec();
            let mut out = SelectionVector {
                bytes,
                record_count: count,
            };
            out.clear_tail();
            return Ok(out);
        }

        let mut out = SelectionVector::zeroed(count);
        for i in 0..count {
            if self.get(start + i) {
                out.set(i, true);
            }
        }
        Ok(out)
    }

    /// Same selection, extended with unselected records up to `record_count`.
    pub fn padded_to(&self, record_count: usize) -> SelectionVector {
        let mut bytes = self.bytes.clone();
        bytes.resize(selection_len(record_count.max(self.record_count)), 0);
        SelectionVector {
            bytes,
            record_count: record_count.max(self.record_count),
        }
    }

    fn clear_tail(&mut self) {
        let used = self.record_count % SELECTION_GRANULARITY;
        if used != 0 {
            if let Some(last) = self.bytes.last_mut() {
                *last &= (1u8 << used) - 1;
            }
        }
    }
}

/// A compact key that expands into a full selection vector.
///
/// Expansion is the caller's concern; the reduction engine only ever sees the
/// expanded bytes.
pub trait SelectionKey: Send + Sync {
    fn expand(&self, record_count: usize) -> SelectionVector;
}

/// Selects exactly one record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PointKey {
    pub target: usize,
}

impl SelectionKey for PointKey {
    fn expand(&self, record_count: usize) -> SelectionVector {
        SelectionVector::point(record_count, self.target)
    }
}

/// One share of a two-party XOR split of a point selection.
///
/// Both shares expand the same pseudorandom bits from a shared seed; one of
/// them additionally flips the target bit, so the XOR of the two expansions
/// selects only the target. This is a functional stand-in for a DPF key and
/// provides no privacy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct XorShareKey {
    seed: u64,
    target: usize,
    flip_target: bool,
}

impl XorShareKey {
    pub fn generate_pair<R: Rng + ?Sized>(rng: &mut R, target: usize) -> (Self, Self) {
        let seed = rng.gen();
        (
            Self {
                seed,
                target,
                flip_target: false,
            },
            Self {
                seed,
                target,
                flip_target: true,
            },
        )
    }

    pub fn target(&self) -> usize {
        self.target
    }
}

impl SelectionKey for XorShareKey {
    fn expand(&self, record_count: usize) -> SelectionVector {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut selection = SelectionVector::random(&mut rng, record_count);
        if self.flip_target {
            selection.toggle(self.target);
        }
        selection
    }
}

impl<K: SelectionKey + ?Sized> SelectionKey for Box<K> {
    fn expand(&self, record_count: usize) -> SelectionVector {
        (**self).expand(record_count)
    }
}
