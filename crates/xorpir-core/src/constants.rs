/// Number of 64-bit words in one record.
pub const RECORD_WORDS: usize = 4;

pub const RECORD_SIZE_BYTES: usize = RECORD_WORDS * 8;

/// Records covered by one selection byte.
pub const SELECTION_GRANULARITY: usize = 8;

/// Bytes of records covered by one selection byte.
pub const GROUP_SIZE_BYTES: usize = SELECTION_GRANULARITY * RECORD_SIZE_BYTES;

/// Selection bytes needed to cover `record_count` records.
pub const fn selection_len(record_count: usize) -> usize {
    record_count.div_ceil(SELECTION_GRANULARITY)
}
