use std::ops::{BitXor, BitXorAssign};

use bytemuck::{Pod, Zeroable};

use crate::constants::{RECORD_SIZE_BYTES, RECORD_WORDS};

/// One fixed-size database record.
///
/// Aligned to 32 bytes so a contiguous `[Record]` can be loaded with aligned
/// 256-bit vector loads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
#[repr(C, align(32))]
pub struct Record {
    pub words: [u64; RECORD_WORDS],
}

impl Record {
    pub const ZERO: Self = Self {
        words: [0; RECORD_WORDS],
    };

    pub const fn new(words: [u64; RECORD_WORDS]) -> Self {
        Self { words }
    }

    /// Record with every word set to `value`.
    pub const fn splat(value: u64) -> Self {
        Self {
            words: [value; RECORD_WORDS],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != RECORD_SIZE_BYTES {
            return None;
        }
        let mut record = Self::ZERO;
        bytemuck::bytes_of_mut(&mut record).copy_from_slice(bytes);
        Some(record)
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    pub fn is_zero(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// `self & mask` where the mask is all-ones when `selected`, else zero.
    #[inline(always)]
    pub fn masked(&self, selected: bool) -> Self {
        self.masked_by(0u64.wrapping_sub(selected as u64))
    }

    #[inline(always)]
    pub fn masked_by(&self, mask: u64) -> Self {
        let mut out = *self;
        for w in out.words.iter_mut() {
            *w &= mask;
        }
        out
    }

    /// `self ^= record & mask`, the select-XOR step.
    #[inline(always)]
    pub fn xor_masked(&mut self, record: &Record, mask: u64) {
        for (acc, w) in self.words.iter_mut().zip(record.words.iter()) {
            *acc ^= w & mask;
        }
    }
}

impl BitXor for Record {
    type Output = Record;

    #[inline(always)]
    fn bitxor(mut self, rhs: Record) -> Record {
        self ^= rhs;
        self
    }
}

impl BitXorAssign for Record {
    #[inline(always)]
    fn bitxor_assign(&mut self, rhs: Record) {
        for (a, b) in self.words.iter_mut().zip(rhs.words.iter()) {
            *a ^= b;
        }
    }
}

/// XOR of all records in `records`.
pub fn xor_all<'a, I>(records: I) -> Record
where
    I: IntoIterator<Item = &'a Record>,
{
    records.into_iter().fold(Record::ZERO, |acc, r| acc ^ *r)
}

/// Full-width mask for bit `bit` of `byte`.
#[inline(always)]
pub fn bit_mask(byte: u8, bit: usize) -> u64 {
    0u64.wrapping_sub(((byte >> bit) & 1) as u64)
}
