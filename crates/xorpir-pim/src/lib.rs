//! Near-memory accelerator path for select-XOR reduction.
//!
//! A fleet of compute units each holds one shard of the record store in its
//! bulk memory. Every unit runs the same tiled streaming kernel:
//!
//! # Architecture
//!
//! 1. Worker lanes stream interleaved blocks of the shard through small local
//!    buffers, together with the selection bytes of up to `tile_size` batch
//!    items
//! 2. Each lane XOR-accumulates selected records into per-item partials
//! 3. Partials are folded across lanes by a barrier-synchronized tree reduction
//!
//! The host talks to units through the [`UnitSet`] dispatch protocol;
//! [`SimulatedUnitSet`] runs the kernel in-process on real threads.

pub mod config;
pub mod fleet;
pub mod kernel;
pub mod seqread;
pub mod unit;

pub use config::{KernelConfig, KernelConfigError, MAX_BLOCK_LOG2, MAX_LANES};
pub use fleet::{
    aggregate_outputs, dispatch_batch, push_batch, DispatchError, Fleet, FleetConfig,
    FleetConfigError, FleetError, SimulatedUnitSet, UnitSet, DEFAULT_BULK_LIMIT_BYTES,
};
pub use kernel::{run_kernel, tile_ranges, validate_args, KernelError, UnitArgs};
pub use seqread::SeqReader;
pub use unit::ComputeUnit;
