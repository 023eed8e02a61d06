//! Sequential streaming from bulk memory through a fixed local buffer.

use xorpir_core::{Record, RECORD_SIZE_BYTES};
use xorpir_storage::AlignedBuffer;

/// Forward-only reader over a unit's bulk memory.
///
/// The local buffer is sized once when the reader is created and reused for
/// every [`seek`](SeqReader::seek); bulk memory is only touched on refill.
pub struct SeqReader<'a> {
    bulk: &'a AlignedBuffer,
    buffer: Vec<u8>,
    /// Bulk offset of `buffer[0]`.
    base: usize,
    filled: usize,
    pos: usize,
}

impl<'a> SeqReader<'a> {
    pub fn new(bulk: &'a AlignedBuffer, buffer_bytes: usize) -> Self {
        Self {
            bulk,
            buffer: vec![0u8; buffer_bytes.max(RECORD_SIZE_BYTES)],
            base: 0,
            filled: 0,
            pos: 0,
        }
    }

    pub fn buffer_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Repositions the stream at bulk `offset`. Nothing is read until the next
    /// access.
    pub fn seek(&mut self, offset: usize) {
        self.base = offset;
        self.filled = 0;
        self.pos = 0;
    }

    /// Bulk offset of the next byte the stream yields.
    pub fn offset(&self) -> usize {
        self.base + self.pos
    }

    pub fn next_byte(&mut self) -> Option<u8> {
        self.take(1).map(|bytes| bytes[0])
    }

    pub fn next_record(&mut self) -> Option<Record> {
        self.take(RECORD_SIZE_BYTES).and_then(Record::from_bytes)
    }

    fn take(&mut self, n: usize) -> Option<&[u8]> {
        if self.pos + n > self.filled {
            self.refill();
            if n > self.filled {
                return None;
            }
        }
        let start = self.pos;
        self.pos += n;
        Some(&self.buffer[start..start + n])
    }

    fn refill(&mut self) {
        self.base += self.pos;
        self.pos = 0;
        self.filled = self.bulk.read_into(self.base, &mut self.buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk_with(bytes: &[u8]) -> AlignedBuffer {
        let mut bulk = AlignedBuffer::new(bytes.len());
        bulk.write_at(0, bytes).unwrap();
        bulk
    }

    #[test]
    fn streams_bytes_across_refills() {
        let data: Vec<u8> = (0..100u8).collect();
        let bulk = bulk_with(&data);
        let mut reader = SeqReader::new(&bulk, 32);
        reader.seek(10);
        let read: Vec<u8> = std::iter::from_fn(|| reader.next_byte()).collect();
        assert_eq!(read, data[10..]);
    }

    #[test]
    fn records_straddling_a_refill_are_reassembled() {
        let records: Vec<Record> = (0..6u64).map(Record::splat).collect();
        let bulk = bulk_with(bytemuck::cast_slice(&records));
        let mut reader = SeqReader::new(&bulk, 48);
        reader.seek(RECORD_SIZE_BYTES);
        for expected in &records[1..] {
            assert_eq!(reader.next_record().as_ref(), Some(expected));
        }
        assert_eq!(reader.next_record(), None);
    }

    #[test]
    fn partial_record_at_end_is_not_returned() {
        let bulk = bulk_with(&[7u8; 40]);
        let mut reader = SeqReader::new(&bulk, 256);
        reader.seek(0);
        assert!(reader.next_record().is_some());
        assert_eq!(reader.offset(), RECORD_SIZE_BYTES);
        assert_eq!(reader.next_record(), None);
    }

    #[test]
    fn buffer_holds_at_least_one_record() {
        let bulk = AlignedBuffer::new(64);
        assert_eq!(SeqReader::new(&bulk, 4).buffer_bytes(), RECORD_SIZE_BYTES);
    }
}
