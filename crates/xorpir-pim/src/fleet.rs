//! Compute-unit sets, the dispatch protocol they speak, and the fleet that
//! owns them.

use rayon::prelude::*;
use tracing::{debug, info, trace};
use xorpir_core::{LayoutError, Record, ShardLayout, RECORD_SIZE_BYTES};
use xorpir_storage::{BufferError, RecordStore};

use crate::config::{KernelConfig, KernelConfigError};
use crate::kernel::{KernelError, UnitArgs};
use crate::unit::ComputeUnit;

/// Bulk memory of one simulated unit.
pub const DEFAULT_BULK_LIMIT_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    Allocation { units: usize, reason: String },
    UnitCountMismatch { expected: usize, actual: usize },
    BulkCapacityExceeded { required: usize, limit: usize },
    InvalidArgs(KernelError),
    Transfer { unit: usize, source: BufferError },
    Execution { unit: usize, source: KernelError },
    OutputTooShort { unit: usize, expected: usize, actual: usize },
    /// Arguments describe a shard size other than the one loaded.
    ShardSizeMismatch { loaded: usize, requested: usize },
    /// A selection write would land inside the resident records.
    SelectionOverlapsShard { offset: usize, shard_size_bytes: usize },
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::Allocation { units, reason } => {
                write!(f, "failed to allocate {} compute units: {}", units, reason)
            }
            DispatchError::UnitCountMismatch { expected, actual } => {
                write!(f, "expected data for {} units, got {}", expected, actual)
            }
            DispatchError::BulkCapacityExceeded { required, limit } => {
                write!(
                    f,
                    "unit needs {} bytes of bulk memory, limit is {}",
                    required, limit
                )
            }
            DispatchError::InvalidArgs(err) => write!(f, "invalid dispatch arguments: {}", err),
            DispatchError::Transfer { unit, source } => {
                write!(f, "transfer to unit {} failed: {}", unit, source)
            }
            DispatchError::Execution { unit, source } => {
                write!(f, "unit {} fault: {}", unit, source)
            }
            DispatchError::OutputTooShort {
                unit,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "unit {} produced {} outputs, expected {}",
                    unit, actual, expected
                )
            }
            DispatchError::ShardSizeMismatch { loaded, requested } => {
                write!(
                    f,
                    "dispatch expects {} shard bytes, units hold {}",
                    requested, loaded
                )
            }
            DispatchError::SelectionOverlapsShard {
                offset,
                shard_size_bytes,
            } => {
                write!(
                    f,
                    "selection write at offset {} overlaps the {} shard bytes",
                    offset, shard_size_bytes
                )
            }
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DispatchError::InvalidArgs(err) => Some(err),
            DispatchError::Transfer { source, .. } => Some(source),
            DispatchError::Execution { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Host side of the compute-unit dispatch protocol.
///
/// One dispatch is `push_args`, `push_selection`, `execute`, `pull_output`,
/// applied to every unit of the set at once.
pub trait UnitSet: Send {
    fn unit_count(&self) -> usize;

    fn kernel_config(&self) -> &KernelConfig;

    /// One-off upload: unit `u` receives `shards[u]` at bulk offset 0, padded
    /// with zero records to `shard_size_bytes`, and reserves
    /// `selection_capacity_bytes` behind it.
    fn load_shards(
        &mut self,
        shards: &[&[Record]],
        shard_size_bytes: usize,
        selection_capacity_bytes: usize,
    ) -> Result<(), DispatchError>;

    /// Rejects arguments whose shard size differs from the loaded one.
    fn push_args(&mut self, args: UnitArgs) -> Result<(), DispatchError>;

    /// Writes `per_unit[u]` into unit `u`'s bulk memory at `offset`, which
    /// must lie past the loaded shard.
    fn push_selection(&mut self, offset: usize, per_unit: &[Vec<u8>]) -> Result<(), DispatchError>;

    fn execute(&mut self) -> Result<(), DispatchError>;

    /// First `item_count` outputs of every unit, indexed `[unit][item]`.
    fn pull_output(&mut self, item_count: usize) -> Result<Vec<Vec<Record>>, DispatchError>;
}

/// In-process unit set; every unit runs the kernel on its own lane threads.
pub struct SimulatedUnitSet {
    units: Vec<ComputeUnit>,
    config: KernelConfig,
    bulk_limit_bytes: usize,
    /// Shard size of the last upload; selections live behind it.
    shard_size_bytes: usize,
}

impl SimulatedUnitSet {
    pub fn allocate(
        first_id: usize,
        unit_count: usize,
        config: KernelConfig,
        bulk_limit_bytes: usize,
    ) -> Result<Self, DispatchError> {
        if unit_count == 0 {
            return Err(DispatchError::Allocation {
                units: 0,
                reason: "empty unit set".to_string(),
            });
        }
        config
            .validate()
            .map_err(|err| DispatchError::Allocation {
                units: unit_count,
                reason: err.to_string(),
            })?;
        Ok(Self {
            units: (first_id..first_id + unit_count)
                .map(ComputeUnit::new)
                .collect(),
            config,
            bulk_limit_bytes,
            shard_size_bytes: 0,
        })
    }

    pub fn units(&self) -> &[ComputeUnit] {
        &self.units
    }

    fn check_unit_count(&self, actual: usize) -> Result<(), DispatchError> {
        if actual != self.units.len() {
            return Err(DispatchError::UnitCountMismatch {
                expected: self.units.len(),
                actual,
            });
        }
        Ok(())
    }
}

impl UnitSet for SimulatedUnitSet {
    fn unit_count(&self) -> usize {
        self.units.len()
    }

    fn kernel_config(&self) -> &KernelConfig {
        &self.config
    }

    fn load_shards(
        &mut self,
        shards: &[&[Record]],
        shard_size_bytes: usize,
        selection_capacity_bytes: usize,
    ) -> Result<(), DispatchError> {
        self.check_unit_count(shards.len())?;
        let required = shard_size_bytes + selection_capacity_bytes;
        if required > self.bulk_limit_bytes {
            return Err(DispatchError::BulkCapacityExceeded {
                required,
                limit: self.bulk_limit_bytes,
            });
        }

        for (unit, shard) in self.units.iter_mut().zip(shards) {
            let len = shard.len() * RECORD_SIZE_BYTES;
            if len > shard_size_bytes {
                return Err(DispatchError::Transfer {
                    unit: unit.id(),
                    source: BufferError::OutOfBounds {
                        offset: 0,
                        len,
                        capacity: shard_size_bytes,
                    },
                });
            }
            unit.load_records(shard, required)
                .map_err(|source| DispatchError::Transfer {
                    unit: unit.id(),
                    source,
                })?;
        }
        self.shard_size_bytes = shard_size_bytes;
        debug!(
            units = self.units.len(),
            shard_size_bytes, "loaded shards into compute units"
        );
        Ok(())
    }

    fn push_args(&mut self, args: UnitArgs) -> Result<(), DispatchError> {
        let requested = args.shard_size_bytes as usize;
        if requested != self.shard_size_bytes {
            return Err(DispatchError::ShardSizeMismatch {
                loaded: self.shard_size_bytes,
                requested,
            });
        }
        for unit in &mut self.units {
            unit.set_args(args);
        }
        Ok(())
    }

    fn push_selection(&mut self, offset: usize, per_unit: &[Vec<u8>]) -> Result<(), DispatchError> {
        self.check_unit_count(per_unit.len())?;
        if offset < self.shard_size_bytes {
            return Err(DispatchError::SelectionOverlapsShard {
                offset,
                shard_size_bytes: self.shard_size_bytes,
            });
        }
        for (unit, bytes) in self.units.iter_mut().zip(per_unit) {
            unit.write_bulk(offset, bytes)
                .map_err(|source| DispatchError::Transfer {
                    unit: unit.id(),
                    source,
                })?;
        }
        Ok(())
    }

    fn execute(&mut self) -> Result<(), DispatchError> {
        let config = self.config;
        self.units.par_iter_mut().try_for_each(|unit| {
            unit.execute(&config)
                .map_err(|source| DispatchError::Execution {
                    unit: unit.id(),
                    source,
                })
        })
    }

    fn pull_output(&mut self, item_count: usize) -> Result<Vec<Vec<Record>>, DispatchError> {
        self.units
            .iter()
            .map(|unit| {
                let output = unit.output();
                if output.len() < item_count {
                    return Err(DispatchError::OutputTooShort {
                        unit: unit.id(),
                        expected: item_count,
                        actual: output.len(),
                    });
                }
                Ok(output[..item_count].to_vec())
            })
            .collect()
    }
}

/// Runs one dispatch of `item_count` batch items on `set` and XORs the
/// per-unit partials into one result per item.
///
/// `per_unit[u]` holds the items' shard selections for unit `u`, concatenated
/// at `layout.selection_stride()`.
pub fn dispatch_batch(
    set: &mut dyn UnitSet,
    layout: &ShardLayout,
    per_unit: &[Vec<u8>],
    item_count: usize,
) -> Result<Vec<Record>, DispatchError> {
    push_batch(set, layout, per_unit, item_count)?;
    set.execute()?;
    let outputs = set.pull_output(item_count)?;
    Ok(aggregate_outputs(outputs, item_count))
}

/// Host-to-unit half of a dispatch: the argument record, then every unit's
/// selection region behind its shard.
pub fn push_batch(
    set: &mut dyn UnitSet,
    layout: &ShardLayout,
    per_unit: &[Vec<u8>],
    item_count: usize,
) -> Result<(), DispatchError> {
    let args = UnitArgs::new(
        layout.shard_size_bytes(),
        layout.selection_stride(),
        item_count,
    )
    .map_err(DispatchError::InvalidArgs)?;
    trace!(items = item_count, units = set.unit_count(), "dispatching batch");

    set.push_args(args)?;
    set.push_selection(layout.shard_size_bytes(), per_unit)
}

/// XORs pulled outputs, indexed `[unit][item]`, into one result per item.
pub fn aggregate_outputs(outputs: Vec<Vec<Record>>, item_count: usize) -> Vec<Record> {
    let mut results = vec![Record::ZERO; item_count];
    for unit_outputs in outputs {
        for (result, partial) in results.iter_mut().zip(unit_outputs) {
            *result ^= partial;
        }
    }
    results
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetConfigError {
    NoUnits,
    NoClusters,
    UnevenClusters { units: usize, clusters: usize },
    Kernel(KernelConfigError),
}

impl std::fmt::Display for FleetConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FleetConfigError::NoUnits => write!(f, "fleet needs at least one compute unit"),
            FleetConfigError::NoClusters => write!(f, "fleet needs at least one cluster"),
            FleetConfigError::UnevenClusters { units, clusters } => {
                write!(
                    f,
                    "{} units cannot be split evenly into {} clusters",
                    units, clusters
                )
            }
            FleetConfigError::Kernel(err) => write!(f, "invalid kernel config: {}", err),
        }
    }
}

impl std::error::Error for FleetConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FleetConfigError::Kernel(err) => Some(err),
            _ => None,
        }
    }
}

impl From<KernelConfigError> for FleetConfigError {
    fn from(err: KernelConfigError) -> Self {
        FleetConfigError::Kernel(err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetError {
    Config(FleetConfigError),
    Layout(LayoutError),
    Dispatch(DispatchError),
}

impl std::fmt::Display for FleetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FleetError::Config(err) => write!(f, "fleet config: {}", err),
            FleetError::Layout(err) => write!(f, "shard layout: {}", err),
            FleetError::Dispatch(err) => write!(f, "dispatch: {}", err),
        }
    }
}

impl std::error::Error for FleetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FleetError::Config(err) => Some(err),
            FleetError::Layout(err) => Some(err),
            FleetError::Dispatch(err) => Some(err),
        }
    }
}

impl From<FleetConfigError> for FleetError {
    fn from(err: FleetConfigError) -> Self {
        FleetError::Config(err)
    }
}

impl From<LayoutError> for FleetError {
    fn from(err: LayoutError) -> Self {
        FleetError::Layout(err)
    }
}

impl From<DispatchError> for FleetError {
    fn from(err: DispatchError) -> Self {
        FleetError::Dispatch(err)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FleetConfig {
    pub num_units: usize,
    /// Unit sets each holding a full replica of the store.
    pub clusters: usize,
    pub bulk_limit_bytes: usize,
    pub kernel: KernelConfig,
}

impl FleetConfig {
    pub fn new(num_units: usize, clusters: usize) -> Self {
        Self {
            num_units,
            clusters,
            bulk_limit_bytes: DEFAULT_BULK_LIMIT_BYTES,
            kernel: KernelConfig::default(),
        }
    }

    pub fn units_per_cluster(&self) -> usize {
        self.num_units / self.clusters.max(1)
    }

    pub fn validate(&self) -> Result<(), FleetConfigError> {
        if self.num_units == 0 {
            return Err(FleetConfigError::NoUnits);
        }
        if self.clusters == 0 {
            return Err(FleetConfigError::NoClusters);
        }
        if self.clusters > self.num_units || !self.num_units.is_multiple_of(self.clusters) {
            return Err(FleetConfigError::UnevenClusters {
                units: self.num_units,
                clusters: self.clusters,
            });
        }
        self.kernel.validate()?;
        Ok(())
    }
}

/// Every compute unit the host owns, grouped into clusters.
///
/// Units are released when the fleet is dropped.
pub struct Fleet {
    config: FleetConfig,
    clusters: Vec<Box<dyn UnitSet>>,
    layout: Option<ShardLayout>,
}

impl Fleet {
    /// Allocates `config.num_units` simulated units split evenly into clusters.
    pub fn allocate(config: FleetConfig) -> Result<Self, FleetError> {
        config.validate()?;
        let per_cluster = config.units_per_cluster();
        let clusters = (0..config.clusters)
            .map(|cluster| {
                SimulatedUnitSet::allocate(
                    cluster * per_cluster,
                    per_cluster,
                    config.kernel,
                    config.bulk_limit_bytes,
                )
                .map(|set| Box::new(set) as Box<dyn UnitSet>)
            })
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            units = config.num_units,
            clusters = config.clusters,
            lanes = config.kernel.lane_count,
            "allocated compute-unit fleet"
        );
        Ok(Self {
            config,
            clusters,
            layout: None,
        })
    }

    /// Wraps externally provided unit sets, one per cluster.
    pub fn from_unit_sets(
        config: FleetConfig,
        clusters: Vec<Box<dyn UnitSet>>,
    ) -> Result<Self, FleetError> {
        config.validate()?;
        if clusters.len() != config.clusters {
            return Err(DispatchError::UnitCountMismatch {
                expected: config.clusters,
                actual: clusters.len(),
            }
            .into());
        }
        for set in &clusters {
            if set.unit_count() != config.units_per_cluster() {
                return Err(DispatchError::UnitCountMismatch {
                    expected: config.units_per_cluster(),
                    actual: set.unit_count(),
                }
                .into());
            }
        }
        Ok(Self {
            config,
            clusters,
            layout: None,
        })
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn num_units(&self) -> usize {
        self.config.num_units
    }

    pub fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    pub fn units_per_cluster(&self) -> usize {
        self.config.units_per_cluster()
    }

    /// Layout of the loaded store, if any.
    pub fn layout(&self) -> Option<&ShardLayout> {
        self.layout.as_ref()
    }

    /// Shards `store` over the units of each cluster and uploads every replica.
    pub fn load_store(&mut self, store: &RecordStore) -> Result<ShardLayout, FleetError> {
        let layout = ShardLayout::new(store.len(), self.units_per_cluster())?;
        let selection_capacity = self.config.kernel.max_batch * layout.selection_stride();
        let shards: Vec<&[Record]> = (0..layout.unit_count())
            .map(|unit| store.shard(&layout, unit))
            .collect();

        self.clusters.par_iter_mut().try_for_each(|set| {
            set.load_shards(&shards, layout.shard_size_bytes(), selection_capacity)
        })?;

        info!(
            records = store.len(),
            records_per_shard = layout.records_per_shard(),
            clusters = self.clusters.len(),
            "loaded record store into fleet"
        );
        self.layout = Some(layout);
        Ok(layout)
    }

    pub fn clusters_mut(&mut self) -> &mut [Box<dyn UnitSet>] {
        &mut self.clusters
    }

    pub fn cluster_mut(&mut self, index: usize) -> Option<&mut (dyn UnitSet + 'static)> {
        self.clusters.get_mut(index).map(|set| set.as_mut())
    }
}

impl Drop for Fleet {
    fn drop(&mut self) {
        debug!(units = self.config.num_units, "releasing compute-unit fleet");
    }
}
