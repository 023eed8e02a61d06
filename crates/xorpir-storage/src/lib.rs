mod aligned_buffer;
mod record_store;

pub use aligned_buffer::{AlignedBuffer, BufferError, BUFFER_ALIGN};
pub use record_store::{RecordStore, StoreError};
