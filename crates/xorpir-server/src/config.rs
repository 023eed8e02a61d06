use xorpir_pim::{FleetConfig, FleetConfigError, KernelConfig, DEFAULT_BULK_LIMIT_BYTES};

/// Largest store the engine will build, as log2 of the record count.
pub const MAX_LOG_RECORDS: u32 = 32;

/// Most producer threads a batch pass spawns.
pub const MAX_PRODUCERS: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Test,
    Prod,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    pub environment: Environment,
    /// Store holds `2^log_records` records.
    pub log_records: u32,
    pub num_units: usize,
    pub clusters: usize,
    /// Most work items a submitter drains per dispatch, capped by the kernel's
    /// `max_batch`.
    pub bulk_dequeue_max: usize,
    pub max_producers: usize,
    pub queue_capacity: usize,
    pub bulk_limit_bytes: usize,
    pub kernel: KernelConfig,
    /// Fill the store with a pseudorandom pattern instead of the index pattern.
    pub fill_seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidLogRecords { log_records: u32 },
    InvalidBulkDequeue { bulk_dequeue_max: usize },
    InvalidProducerCount { max_producers: usize },
    InvalidQueueCapacity { queue_capacity: usize },
    Fleet(FleetConfigError),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidLogRecords { log_records } => {
                write!(
                    f,
                    "log_records must be in 3..={}, got {}",
                    MAX_LOG_RECORDS, log_records
                )
            }
            ConfigError::InvalidBulkDequeue { bulk_dequeue_max } => {
                write!(f, "bulk_dequeue_max must be > 0, got {}", bulk_dequeue_max)
            }
            ConfigError::InvalidProducerCount { max_producers } => {
                write!(
                    f,
                    "max_producers must be in 1..={}, got {}",
                    MAX_PRODUCERS, max_producers
                )
            }
            ConfigError::InvalidQueueCapacity { queue_capacity } => {
                write!(f, "queue_capacity must be > 0, got {}", queue_capacity)
            }
            ConfigError::Fleet(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Fleet(err) => Some(err),
            _ => None,
        }
    }
}

impl From<FleetConfigError> for ConfigError {
    fn from(err: FleetConfigError) -> Self {
        ConfigError::Fleet(err)
    }
}

impl EngineConfig {
    pub fn for_env(environment: Environment) -> Self {
        match environment {
            Environment::Dev => Self {
                environment,
                log_records: 20,
                num_units: 64,
                clusters: 1,
                bulk_dequeue_max: 32,
                max_producers: MAX_PRODUCERS,
                queue_capacity: 1024,
                bulk_limit_bytes: DEFAULT_BULK_LIMIT_BYTES,
                kernel: KernelConfig::default(),
                fill_seed: None,
            },
            Environment::Test => Self {
                environment,
                log_records: 12,
                num_units: 8,
                clusters: 2,
                bulk_dequeue_max: 8,
                max_producers: 4,
                queue_capacity: 64,
                bulk_limit_bytes: DEFAULT_BULK_LIMIT_BYTES,
                kernel: KernelConfig {
                    lane_count: 4,
                    block_log2: 9,
                    ..KernelConfig::default()
                },
                fill_seed: None,
            },
            Environment::Prod => Self {
                environment,
                log_records: 25,
                num_units: 2048,
                clusters: 4,
                bulk_dequeue_max: 32,
                max_producers: MAX_PRODUCERS,
                queue_capacity: 4096,
                bulk_limit_bytes: DEFAULT_BULK_LIMIT_BYTES,
                kernel: KernelConfig::default(),
                fill_seed: None,
            },
        }
    }

    pub fn num_records(&self) -> usize {
        1usize << self.log_records
    }

    /// Items one dispatch carries at most.
    pub fn dispatch_limit(&self) -> usize {
        self.bulk_dequeue_max.min(self.kernel.max_batch)
    }

    pub fn fleet_config(&self) -> FleetConfig {
        FleetConfig {
            num_units: self.num_units,
            clusters: self.clusters,
            bulk_limit_bytes: self.bulk_limit_bytes,
            kernel: self.kernel,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.log_records < 3 || self.log_records > MAX_LOG_RECORDS {
            return Err(ConfigError::InvalidLogRecords {
                log_records: self.log_records,
            });
        }
        if self.bulk_dequeue_max == 0 {
            return Err(ConfigError::InvalidBulkDequeue {
                bulk_dequeue_max: self.bulk_dequeue_max,
            });
        }
        if self.max_producers == 0 || self.max_producers > MAX_PRODUCERS {
            return Err(ConfigError::InvalidProducerCount {
                max_producers: self.max_producers,
            });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidQueueCapacity {
                queue_capacity: self.queue_capacity,
            });
        }
        self.fleet_config().validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xorpir_pim::KernelConfigError;

    #[test]
    fn validate_rejects_store_smaller_than_a_group() {
        let config = EngineConfig {
            log_records: 2,
            ..EngineConfig::for_env(Environment::Test)
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidLogRecords { log_records: 2 })
        ));
    }

    #[test]
    fn validate_rejects_zero_dequeue_and_queue() {
        let config = EngineConfig {
            bulk_dequeue_max: 0,
            ..EngineConfig::for_env(Environment::Test)
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBulkDequeue { .. })
        ));

        let config = EngineConfig {
            queue_capacity: 0,
            ..EngineConfig::for_env(Environment::Test)
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidQueueCapacity { .. })
        ));
    }

    #[test]
    fn validate_rejects_too_many_producers() {
        let config = EngineConfig {
            max_producers: MAX_PRODUCERS + 1,
            ..EngineConfig::for_env(Environment::Test)
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidProducerCount { .. })
        ));
    }

    #[test]
    fn validate_surfaces_fleet_and_kernel_errors() {
        let config = EngineConfig {
            num_units: 9,
            clusters: 2,
            ..EngineConfig::for_env(Environment::Test)
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Fleet(FleetConfigError::UnevenClusters { .. }))
        ));

        let mut config = EngineConfig::for_env(Environment::Test);
        config.kernel.tile_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Fleet(FleetConfigError::Kernel(
                KernelConfigError::InvalidTileSize { .. }
            )))
        ));
    }

    #[test]
    fn dispatch_limit_is_capped_by_kernel_batch() {
        let mut config = EngineConfig::for_env(Environment::Dev);
        config.bulk_dequeue_max = 64;
        assert_eq!(config.dispatch_limit(), config.kernel.max_batch);
        config.bulk_dequeue_max = 5;
        assert_eq!(config.dispatch_limit(), 5);
    }

    #[test]
    fn for_env_configs_are_valid() {
        for env in [Environment::Dev, Environment::Test, Environment::Prod] {
            let config = EngineConfig::for_env(env);
            assert!(
                config.validate().is_ok(),
                "{:?} config should be valid",
                env
            );
        }
    }
}
