use xorpir_core::{Record, RECORD_SIZE_BYTES};
use xorpir_storage::{AlignedBuffer, BufferError};

use crate::config::KernelConfig;
use crate::kernel::{run_kernel, KernelError, UnitArgs};

/// One simulated near-memory compute unit: private bulk memory, the argument
/// record of the pending dispatch, and the outputs of the last run.
pub struct ComputeUnit {
    id: usize,
    bulk: AlignedBuffer,
    args: UnitArgs,
    output: Vec<Record>,
}

impl ComputeUnit {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            bulk: AlignedBuffer::new(0),
            args: UnitArgs::default(),
            output: Vec::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn bulk_capacity(&self) -> usize {
        self.bulk.len()
    }

    pub fn bulk(&self) -> &AlignedBuffer {
        &self.bulk
    }

    /// Replaces bulk memory with a fresh region of `capacity` bytes holding
    /// `records` at offset 0; the rest of the shard reads as zero records.
    pub fn load_records(&mut self, records: &[Record], capacity: usize) -> Result<(), BufferError> {
        let mut bulk = AlignedBuffer::new(capacity);
        bulk.write_at(0, bytemuck::cast_slice(records))?;
        self.bulk = bulk;
        self.output.clear();
        Ok(())
    }

    pub fn write_bulk(&mut self, offset: usize, bytes: &[u8]) -> Result<(), BufferError> {
        self.bulk.write_at(offset, bytes)
    }

    pub fn set_args(&mut self, args: UnitArgs) {
        self.args = args;
    }

    pub fn args(&self) -> &UnitArgs {
        &self.args
    }

    pub fn execute(&mut self, config: &KernelConfig) -> Result<(), KernelError> {
        self.output = run_kernel(&self.bulk, &self.args, config)?;
        Ok(())
    }

    pub fn output(&self) -> &[Record] {
        &self.output
    }

    /// Records currently resident in the shard region.
    pub fn resident_records(&self) -> usize {
        (self.args.shard_size_bytes as usize).min(self.bulk.len()) / RECORD_SIZE_BYTES
    }
}
