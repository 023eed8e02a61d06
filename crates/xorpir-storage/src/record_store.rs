use xorpir_core::{Record, ShardLayout, RECORD_SIZE_BYTES, SELECTION_GRANULARITY};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotGroupAligned { records: usize },
    IndexOutOfBounds { index: usize, len: usize },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotGroupAligned { records } => {
                write!(
                    f,
                    "record count {} must be a multiple of {}",
                    records, SELECTION_GRANULARITY
                )
            }
            StoreError::IndexOutOfBounds { index, len } => {
                write!(f, "record index {} out of bounds for store of {}", index, len)
            }
        }
    }
}

impl std::error::Error for StoreError {}

/// Ordered, vector-aligned sequence of fixed-size records.
///
/// The record count is always a multiple of the selection granularity, so
/// every selection byte covers exactly eight records.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordStore {
    records: Vec<Record>,
}

impl RecordStore {
    /// A store of `len` zero records.
    pub fn new(len: usize) -> Result<Self, StoreError> {
        Self::from_records(vec![Record::ZERO; len])
    }

    pub fn from_records(records: Vec<Record>) -> Result<Self, StoreError> {
        if !records.len().is_multiple_of(SELECTION_GRANULARITY) {
            return Err(StoreError::NotGroupAligned {
                records: records.len(),
            });
        }
        Ok(Self { records })
    }

    /// `record[i] = (i, i, i, i)`, the benchmark database.
    pub fn with_index_pattern(len: usize) -> Result<Self, StoreError> {
        Self::from_records((0..len as u64).map(Record::splat).collect())
    }

    /// Overwrites every record with a deterministic pseudorandom pattern.
    pub fn fill_with_pattern(&mut self, seed: u64) {
        let mut state = seed;
        for record in &mut self.records {
            for word in record.words.iter_mut() {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
                *word = state;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.records.len() * RECORD_SIZE_BYTES
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn record(&self, index: usize) -> Option<&Record> {
        self.records.get(index)
    }

    pub fn write_record(&mut self, index: usize, record: Record) -> Result<(), StoreError> {
        let len = self.records.len();
        let slot = self
            .records
            .get_mut(index)
            .ok_or(StoreError::IndexOutOfBounds { index, len })?;
        *slot = record;
        Ok(())
    }

    /// Records held by `unit` under `layout`. Short or empty for trailing units.
    pub fn shard(&self, layout: &ShardLayout, unit: usize) -> &[Record] {
        let range = layout.shard_range(unit);
        let end = range.end.min(self.records.len());
        let start = range.start.min(end);
        &self.records[start..end]
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unaligned_record_count() {
        assert_eq!(
            RecordStore::new(12),
            Err(StoreError::NotGroupAligned { records: 12 })
        );
        assert!(RecordStore::new(16).is_ok());
        assert!(RecordStore::new(0).is_ok());
    }

    #[test]
    fn index_pattern_repeats_index_in_every_word() {
        let store = RecordStore::with_index_pattern(16).unwrap();
        assert_eq!(store.record(9), Some(&Record::splat(9)));
        assert_eq!(store.size_bytes(), 16 * RECORD_SIZE_BYTES);
    }

    #[test]
    fn records_are_vector_aligned() {
        let store = RecordStore::with_index_pattern(64).unwrap();
        assert_eq!(store.records().as_ptr() as usize % 32, 0);
    }

    #[test]
    fn fill_with_pattern_is_deterministic() {
        let mut a = RecordStore::new(32).unwrap();
        let mut b = RecordStore::new(32).unwrap();
        a.fill_with_pattern(11);
        b.fill_with_pattern(11);
        assert_eq!(a, b);
        assert!(a.records().iter().any(|r| !r.is_zero()));
    }

    #[test]
    fn write_record_checks_bounds() {
        let mut store = RecordStore::new(8).unwrap();
        store.write_record(3, Record::splat(5)).unwrap();
        assert_eq!(store.record(3), Some(&Record::splat(5)));
        assert_eq!(
            store.write_record(8, Record::ZERO),
            Err(StoreError::IndexOutOfBounds { index: 8, len: 8 })
        );
    }

    #[test]
    fn shards_concatenate_back_to_store() {
        let store = RecordStore::with_index_pattern(40).unwrap();
        let layout = ShardLayout::new(40, 6).unwrap();
        let joined: Vec<Record> = (0..layout.unit_count())
            .flat_map(|unit| store.shard(&layout, unit).iter().copied())
            .collect();
        assert_eq!(joined, store.records());
    }
}
