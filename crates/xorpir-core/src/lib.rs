mod constants;
mod record;
mod selection;
mod shard;

pub use constants::{
    selection_len, GROUP_SIZE_BYTES, RECORD_SIZE_BYTES, RECORD_WORDS, SELECTION_GRANULARITY,
};
pub use record::{bit_mask, xor_all, Record};
pub use selection::{PointKey, SelectionError, SelectionKey, SelectionVector, XorShareKey};
pub use shard::{LayoutError, ShardLayout};
