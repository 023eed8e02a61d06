//! Tiled streaming select-XOR kernel run by every compute unit.
//!
//! A unit's bulk memory holds its shard of records at offset 0 followed by
//! one selection region per batch item:
//!
//! ```text
//! [ records: shard_size_bytes ][ item 0: stride ][ item 1: stride ] ...
//! ```
//!
//! The kernel is executed by `lane_count` lanes. Lane `t` streams the blocks
//! starting at `t * block`, `t * block + lanes * block`, ... and, for a tile of
//! up to `tile_size` items at a time, XOR-accumulates the records whose
//! selection bit is set. Per-lane partials are published to a shared array
//! and folded into lane 0 by a barrier-separated tree reduction.

use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Barrier;
use std::thread;

use bytemuck::{Pod, Zeroable};
use xorpir_core::{
    bit_mask, selection_len, Record, GROUP_SIZE_BYTES, RECORD_SIZE_BYTES, RECORD_WORDS,
    SELECTION_GRANULARITY,
};
use xorpir_storage::AlignedBuffer;

use crate::config::KernelConfig;
use crate::seqread::SeqReader;

/// Argument record pushed to every unit before a dispatch.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct UnitArgs {
    /// Bytes of records in the shard; selection regions start here.
    pub shard_size_bytes: u32,
    /// Bytes between consecutive batch items' selection regions.
    pub selection_region_size_bytes: u32,
    pub batch_item_count: u32,
}

impl UnitArgs {
    pub fn new(
        shard_size_bytes: usize,
        selection_region_size_bytes: usize,
        batch_item_count: usize,
    ) -> Result<Self, KernelError> {
        let narrow = |value: usize| {
            u32::try_from(value).map_err(|_| KernelError::ArgumentOverflow { value })
        };
        Ok(Self {
            shard_size_bytes: narrow(shard_size_bytes)?,
            selection_region_size_bytes: narrow(selection_region_size_bytes)?,
            batch_item_count: narrow(batch_item_count)?,
        })
    }

    pub fn shard_records(&self) -> usize {
        self.shard_size_bytes as usize / RECORD_SIZE_BYTES
    }

    /// Bulk offset of `item`'s selection region.
    pub fn selection_offset(&self, item: usize) -> usize {
        self.shard_size_bytes as usize + item * self.selection_region_size_bytes as usize
    }

    /// Bulk bytes the dispatch touches: shard plus every selection region.
    pub fn bulk_extent(&self) -> usize {
        self.selection_offset(self.batch_item_count as usize)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    ArgumentOverflow {
        value: usize,
    },
    ShardNotRecordAligned {
        shard_size_bytes: usize,
    },
    SelectionStrideTooShort {
        stride: usize,
        required: usize,
    },
    TooManyItems {
        items: usize,
        max_batch: usize,
    },
    BulkOutOfBounds {
        required: usize,
        capacity: usize,
    },
    LanePanicked {
        lane: usize,
    },
}

impl std::fmt::Display for KernelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelError::ArgumentOverflow { value } => {
                write!(f, "argument {} does not fit the 32-bit argument record", value)
            }
            KernelError::ShardNotRecordAligned { shard_size_bytes } => {
                write!(
                    f,
                    "shard size {} is not a multiple of the {}-byte record",
                    shard_size_bytes, RECORD_SIZE_BYTES
                )
            }
            KernelError::SelectionStrideTooShort { stride, required } => {
                write!(
                    f,
                    "selection stride {} is shorter than the {} bytes the shard needs",
                    stride, required
                )
            }
            KernelError::TooManyItems { items, max_batch } => {
                write!(f, "{} batch items exceed the kernel limit of {}", items, max_batch)
            }
            KernelError::BulkOutOfBounds { required, capacity } => {
                write!(
                    f,
                    "dispatch needs {} bytes of bulk memory, unit has {}",
                    required, capacity
                )
            }
            KernelError::LanePanicked { lane } => write!(f, "kernel lane {} panicked", lane),
        }
    }
}

impl std::error::Error for KernelError {}

/// Item ranges processed together, each at most `tile_size` long.
pub fn tile_ranges(items: usize, tile_size: usize) -> Vec<Range<usize>> {
    let tile = tile_size.max(1);
    (0..items)
        .step_by(tile)
        .map(|start| start..(start + tile).min(items))
        .collect()
}

/// Per-(item, lane) partials shared by all lanes of one kernel run.
///
/// Writes and reads are separated by barrier waits, which order them, so
/// relaxed atomics suffice.
struct SharedPartials {
    lanes: usize,
    slots: Vec<[AtomicU64; RECORD_WORDS]>,
}

impl SharedPartials {
    fn new(items: usize, lanes: usize) -> Self {
        Self {
            lanes,
            slots: (0..items * lanes)
                .map(|_| std::array::from_fn(|_| AtomicU64::new(0)))
                .collect(),
        }
    }

    fn store(&self, item: usize, lane: usize, record: Record) {
        let slot = &self.slots[item * self.lanes + lane];
        for (cell, word) in slot.iter().zip(record.words) {
            cell.store(word, Ordering::Relaxed);
        }
    }

    fn load(&self, item: usize, lane: usize) -> Record {
        let slot = &self.slots[item * self.lanes + lane];
        Record::new(std::array::from_fn(|w| slot[w].load(Ordering::Relaxed)))
    }
}

/// Everything a lane reads; shared by reference across lanes.
struct LaneContext<'a> {
    bulk: &'a AlignedBuffer,
    args: UnitArgs,
    config: &'a KernelConfig,
    tiles: Vec<Range<usize>>,
    partials: SharedPartials,
    barrier: Barrier,
}

/// Checks `args` against the bulk memory and kernel limits.
pub fn validate_args(
    bulk: &AlignedBuffer,
    args: &UnitArgs,
    config: &KernelConfig,
) -> Result<(), KernelError> {
    let shard_size_bytes = args.shard_size_bytes as usize;
    if !shard_size_bytes.is_multiple_of(RECORD_SIZE_BYTES) {
        return Err(KernelError::ShardNotRecordAligned { shard_size_bytes });
    }
    let items = args.batch_item_count as usize;
    if items > config.max_batch {
        return Err(KernelError::TooManyItems {
            items,
            max_batch: config.max_batch,
        });
    }
    let required = selection_len(args.shard_records());
    let stride = args.selection_region_size_bytes as usize;
    if items > 0 && stride < required {
        return Err(KernelError::SelectionStrideTooShort { stride, required });
    }
    let extent = args.bulk_extent();
    if extent > bulk.len() {
        return Err(KernelError::BulkOutOfBounds {
            required: extent,
            capacity: bulk.len(),
        });
    }
    Ok(())
}

/// Runs the kernel over one unit's bulk memory, returning one record per batch
/// item.
pub fn run_kernel(
    bulk: &AlignedBuffer,
    args: &UnitArgs,
    config: &KernelConfig,
) -> Result<Vec<Record>, KernelError> {
    validate_args(bulk, args, config)?;
    let items = args.batch_item_count as usize;
    if items == 0 {
        return Ok(Vec::new());
    }

    let lanes = config.lane_count;
    let ctx = LaneContext {
        bulk,
        args: *args,
        config,
        tiles: tile_ranges(items, config.tile_size),
        partials: SharedPartials::new(items, lanes),
        barrier: Barrier::new(lanes),
    };

    thread::scope(|s| {
        let handles: Vec<_> = (0..lanes)
            .map(|lane| {
                let ctx = &ctx;
                s.spawn(move || run_lane(lane, ctx))
            })
            .collect();
        handles
            .into_iter()
            .enumerate()
            .try_for_each(|(lane, handle)| {
                handle.join().map_err(|_| KernelError::LanePanicked { lane })
            })
    })?;

    Ok((0..items).map(|item| ctx.partials.load(item, 0)).collect())
}

fn run_lane(lane: usize, ctx: &LaneContext<'_>) {
    let config = ctx.config;
    let lanes = config.lane_count;
    let block = config.block_bytes();
    let shard_size_bytes = ctx.args.shard_size_bytes as usize;

    // Local memory: one record stream, one selection stream and one accumulator
    // per tile slot, allocated once and reused for every tile.
    let mut records = SeqReader::new(ctx.bulk, config.stream_buffer_bytes);
    let mut selections: Vec<SeqReader<'_>> = (0..config.tile_size)
        .map(|_| SeqReader::new(ctx.bulk, config.selection_buffer_bytes))
        .collect();
    let mut accumulators = vec![Record::ZERO; config.tile_size];
    let mut selection_bytes = vec![0u8; config.tile_size];

    for tile in &ctx.tiles {
        let tile_len = tile.len();
        accumulators[..tile_len].fill(Record::ZERO);

        let mut offset = lane * block;
        while offset < shard_size_bytes {
            let block_records = block.min(shard_size_bytes - offset) / RECORD_SIZE_BYTES;
            records.seek(offset);
            for (slot, item) in tile.clone().enumerate() {
                selections[slot].seek(ctx.args.selection_offset(item) + offset / GROUP_SIZE_BYTES);
            }

            let mut done = 0;
            while done < block_records {
                for slot in 0..tile_len {
                    selection_bytes[slot] = selections[slot].next_byte().unwrap_or(0);
                }
                let group = SELECTION_GRANULARITY.min(block_records - done);
                for bit in 0..group {
                    let Some(record) = records.next_record() else {
                        break;
                    };
                    for slot in 0..tile_len {
                        accumulators[slot]
                            .xor_masked(&record, bit_mask(selection_bytes[slot], bit));
                    }
                }
                done += group;
            }
            offset += block * lanes;
        }

        for (slot, item) in tile.clone().enumerate() {
            ctx.partials.store(item, lane, accumulators[slot]);
        }
        ctx.barrier.wait();

        let mut step = lanes.next_power_of_two() / 2;
        while step > 0 {
            if lane < step && lane + step < lanes {
                for item in tile.clone() {
                    let folded = ctx.partials.load(item, lane) ^ ctx.partials.load(item, lane + step);
                    ctx.partials.store(item, lane, folded);
                }
            }
            ctx.barrier.wait();
            step /= 2;
        }
    }
}
