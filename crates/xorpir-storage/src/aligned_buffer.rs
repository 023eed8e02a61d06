use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::slice;

use xorpir_core::Record;

pub const BUFFER_ALIGN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    OutOfBounds { offset: usize, len: usize, capacity: usize },
    Misaligned { offset: usize, align: usize },
}

impl std::fmt::Display for BufferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BufferError::OutOfBounds {
                offset,
                len,
                capacity,
            } => {
                write!(
                    f,
                    "access of {} bytes at offset {} exceeds buffer of {} bytes",
                    len, offset, capacity
                )
            }
            BufferError::Misaligned { offset, align } => {
                write!(f, "offset {} is not aligned to {} bytes", offset, align)
            }
        }
    }
}

impl std::error::Error for BufferError {}

/// Zero-initialized, 64-byte aligned byte region.
///
/// Backs a compute unit's bulk memory: records at the front, selection bytes
/// behind them, all addressed by byte offset.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

impl AlignedBuffer {
    pub fn new(size_bytes: usize) -> Self {
        let layout =
            Layout::from_size_align(size_bytes.max(1), BUFFER_ALIGN).expect("invalid layout");

        let ptr = if size_bytes == 0 {
            NonNull::dangling()
        } else {
            let raw = unsafe { alloc_zeroed(layout) };
            NonNull::new(raw).unwrap_or_else(|| std::alloc::handle_alloc_error(layout))
        };

        Self {
            ptr,
            len: size_bytes,
            layout,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        if self.len == 0 {
            &[]
        } else {
            unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        if self.len == 0 {
            &mut []
        } else {
            unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
        }
    }

    /// Bounds-checked view of `len` bytes at `offset`.
    pub fn region(&self, offset: usize, len: usize) -> Result<&[u8], BufferError> {
        self.check(offset, len)?;
        Ok(&self.as_slice()[offset..offset + len])
    }

    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<(), BufferError> {
        self.check(offset, data.len())?;
        self.as_mut_slice()[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Copies up to `out.len()` bytes starting at `offset`, returning how many
    /// were available.
    pub fn read_into(&self, offset: usize, out: &mut [u8]) -> usize {
        if offset >= self.len {
            return 0;
        }
        let n = out.len().min(self.len - offset);
        out[..n].copy_from_slice(&self.as_slice()[offset..offset + n]);
        n
    }

    /// The first `count` records, viewed in place.
    pub fn records(&self, offset: usize, count: usize) -> Result<&[Record], BufferError> {
        let align = std::mem::align_of::<Record>();
        if !offset.is_multiple_of(align) {
            return Err(BufferError::Misaligned { offset, align });
        }
        let bytes = self.region(offset, count * std::mem::size_of::<Record>())?;
        Ok(bytemuck::cast_slice(bytes))
    }

    pub fn zero(&mut self) {
        self.as_mut_slice().fill(0);
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), BufferError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(BufferError::OutOfBounds {
                offset,
                len,
                capacity: self.len,
            }),
        }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        if self.len != 0 {
            unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
        }
    }
}

// SAFETY: AlignedBuffer owns its allocation exclusively; shared access only
// hands out immutable slices.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}
