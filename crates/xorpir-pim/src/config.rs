use xorpir_core::{GROUP_SIZE_BYTES, RECORD_SIZE_BYTES};

/// Upper bound on worker lanes per compute unit.
pub const MAX_LANES: usize = 24;

/// Largest block the kernel streams per lane step.
pub const MAX_BLOCK_LOG2: u32 = 20;

/// Tiling and streaming parameters of the accelerator kernel.
///
/// None of these change a reduction result; they trade local-memory footprint
/// against streaming overhead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelConfig {
    /// Worker lanes cooperating on one shard.
    pub lane_count: usize,
    /// log2 of the bytes of records a lane streams per block.
    pub block_log2: u32,
    /// Batch items whose selection streams are read in lockstep.
    pub tile_size: usize,
    /// Most batch items one dispatch may carry.
    pub max_batch: usize,
    /// Fast local working memory of one unit.
    pub local_memory_bytes: usize,
    /// Local buffer each lane streams records through.
    pub stream_buffer_bytes: usize,
    /// Local buffer each lane streams one item's selection bytes through.
    pub selection_buffer_bytes: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            lane_count: 16,
            block_log2: 12,
            tile_size: 4,
            max_batch: 32,
            local_memory_bytes: 64 * 1024,
            stream_buffer_bytes: 256,
            selection_buffer_bytes: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelConfigError {
    InvalidLaneCount { lanes: usize },
    InvalidBlockSize { block_log2: u32 },
    InvalidTileSize { tile_size: usize, max_batch: usize },
    StreamBufferTooSmall { bytes: usize },
    SelectionBufferTooSmall { bytes: usize },
    LocalMemoryExceeded { required: usize, available: usize },
}

impl std::fmt::Display for KernelConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelConfigError::InvalidLaneCount { lanes } => {
                write!(f, "lane count must be in 1..={}, got {}", MAX_LANES, lanes)
            }
            KernelConfigError::InvalidBlockSize { block_log2 } => {
                write!(
                    f,
                    "block size 2^{} must cover at least {} bytes and at most 2^{}",
                    block_log2, GROUP_SIZE_BYTES, MAX_BLOCK_LOG2
                )
            }
            KernelConfigError::InvalidTileSize {
                tile_size,
                max_batch,
            } => {
                write!(
                    f,
                    "tile size {} must be in 1..={} (max batch)",
                    tile_size, max_batch
                )
            }
            KernelConfigError::StreamBufferTooSmall { bytes } => {
                write!(
                    f,
                    "record stream buffer of {} bytes must be a non-zero multiple of {}",
                    bytes, RECORD_SIZE_BYTES
                )
            }
            KernelConfigError::SelectionBufferTooSmall { bytes } => {
                write!(f, "selection stream buffer of {} bytes is empty", bytes)
            }
            KernelConfigError::LocalMemoryExceeded {
                required,
                available,
            } => {
                write!(
                    f,
                    "kernel needs {} bytes of local memory, unit has {}",
                    required, available
                )
            }
        }
    }
}

impl std::error::Error for KernelConfigError {}

impl KernelConfig {
    pub fn block_bytes(&self) -> usize {
        1usize << self.block_log2
    }

    /// Local memory one lane holds: its record stream, one selection stream
    /// and one accumulator per tile item.
    pub fn lane_footprint_bytes(&self) -> usize {
        self.stream_buffer_bytes
            + self.tile_size * (self.selection_buffer_bytes + RECORD_SIZE_BYTES)
    }

    /// Partials every lane publishes for the cross-lane reduction.
    pub fn shared_footprint_bytes(&self) -> usize {
        self.max_batch * self.lane_count * RECORD_SIZE_BYTES
    }

    pub fn local_footprint_bytes(&self) -> usize {
        self.lane_count * self.lane_footprint_bytes() + self.shared_footprint_bytes()
    }

    pub fn validate(&self) -> Result<(), KernelConfigError> {
        if self.lane_count == 0 || self.lane_count > MAX_LANES {
            return Err(KernelConfigError::InvalidLaneCount {
                lanes: self.lane_count,
            });
        }
        if self.block_log2 > MAX_BLOCK_LOG2 || self.block_bytes() < GROUP_SIZE_BYTES {
            return Err(KernelConfigError::InvalidBlockSize {
                block_log2: self.block_log2,
            });
        }
        if self.max_batch == 0 || self.tile_size == 0 || self.tile_size > self.max_batch {
            return Err(KernelConfigError::InvalidTileSize {
                tile_size: self.tile_size,
                max_batch: self.max_batch,
            });
        }
        if self.stream_buffer_bytes == 0
            || !self.stream_buffer_bytes.is_multiple_of(RECORD_SIZE_BYTES)
        {
            return Err(KernelConfigError::StreamBufferTooSmall {
                bytes: self.stream_buffer_bytes,
            });
        }
        if self.selection_buffer_bytes == 0 {
            return Err(KernelConfigError::SelectionBufferTooSmall {
                bytes: self.selection_buffer_bytes,
            });
        }

        let tile_bytes = self.tile_size * (RECORD_SIZE_BYTES + 1);
        let required = self.local_footprint_bytes().max(tile_bytes);
        if required > self.local_memory_bytes {
            return Err(KernelConfigError::LocalMemoryExceeded {
                required,
                available: self.local_memory_bytes,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(KernelConfig::default().validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_and_excess_lanes() {
        for lanes in [0, MAX_LANES + 1] {
            let config = KernelConfig {
                lane_count: lanes,
                ..KernelConfig::default()
            };
            assert_eq!(
                config.validate(),
                Err(KernelConfigError::InvalidLaneCount { lanes })
            );
        }
    }

    #[test]
    fn validate_rejects_block_smaller_than_group() {
        let config = KernelConfig {
            block_log2: 7,
            ..KernelConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(KernelConfigError::InvalidBlockSize { block_log2: 7 })
        ));
    }

    #[test]
    fn validate_rejects_tile_larger_than_batch() {
        let config = KernelConfig {
            tile_size: 8,
            max_batch: 4,
            ..KernelConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(KernelConfigError::InvalidTileSize { .. })
        ));
    }

    #[test]
    fn validate_rejects_unaligned_stream_buffer() {
        let config = KernelConfig {
            stream_buffer_bytes: 48,
            ..KernelConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(KernelConfigError::StreamBufferTooSmall { bytes: 48 })
        );
    }

    #[test]
    fn validate_rejects_footprint_over_local_memory() {
        let config = KernelConfig {
            local_memory_bytes: 4 * 1024,
            ..KernelConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(KernelConfigError::LocalMemoryExceeded {
                available: 4096,
                ..
            })
        ));
    }

    #[test]
    fn footprint_accounts_for_every_lane() {
        let config = KernelConfig::default();
        assert_eq!(config.lane_footprint_bytes(), 256 + 4 * (64 + 32));
        assert_eq!(
            config.local_footprint_bytes(),
            16 * config.lane_footprint_bytes() + 32 * 16 * 32
        );
    }
}
