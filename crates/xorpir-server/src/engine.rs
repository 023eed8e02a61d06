use tracing::info;
use xorpir_core::{LayoutError, Record, SelectionKey, SelectionVector, ShardLayout};
use xorpir_pim::{
    aggregate_outputs, dispatch_batch, push_batch, DispatchError, Fleet, FleetError, UnitSet,
};
use xorpir_storage::{RecordStore, StoreError};

use crate::config::{ConfigError, EngineConfig};
use crate::orchestrator::{run_batch_pass, OrchestratorError, PassConfig, PassReport};
use crate::profiling::Profiler;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    Config(ConfigError),
    Store(StoreError),
    Fleet(FleetError),
    Layout(LayoutError),
    Dispatch(DispatchError),
    Orchestrator(OrchestratorError),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Config(err) => write!(f, "invalid engine config: {}", err),
            EngineError::Store(err) => write!(f, "record store: {}", err),
            EngineError::Fleet(err) => write!(f, "{}", err),
            EngineError::Layout(err) => write!(f, "{}", err),
            EngineError::Dispatch(err) => write!(f, "{}", err),
            EngineError::Orchestrator(err) => write!(f, "batch pass failed: {}", err),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Config(err) => Some(err),
            EngineError::Store(err) => Some(err),
            EngineError::Fleet(err) => Some(err),
            EngineError::Layout(err) => Some(err),
            EngineError::Dispatch(err) => Some(err),
            EngineError::Orchestrator(err) => Some(err),
        }
    }
}

impl From<ConfigError> for EngineError {
    fn from(err: ConfigError) -> Self {
        EngineError::Config(err)
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        EngineError::Store(err)
    }
}

impl From<FleetError> for EngineError {
    fn from(err: FleetError) -> Self {
        EngineError::Fleet(err)
    }
}

impl From<LayoutError> for EngineError {
    fn from(err: LayoutError) -> Self {
        EngineError::Layout(err)
    }
}

impl From<DispatchError> for EngineError {
    fn from(err: DispatchError) -> Self {
        EngineError::Dispatch(err)
    }
}

impl From<OrchestratorError> for EngineError {
    fn from(err: OrchestratorError) -> Self {
        EngineError::Orchestrator(err)
    }
}

/// Builds the store `config` describes: the index pattern, or a seeded
/// pseudorandom fill.
pub fn build_store(config: &EngineConfig) -> Result<RecordStore, StoreError> {
    match config.fill_seed {
        None => RecordStore::with_index_pattern(config.num_records()),
        Some(seed) => {
            let mut store = RecordStore::new(config.num_records())?;
            store.fill_with_pattern(seed);
            Ok(store)
        }
    }
}

/// A record store replicated onto a compute-unit fleet.
pub struct PimEngine {
    config: EngineConfig,
    store: RecordStore,
    fleet: Fleet,
    layout: ShardLayout,
}

impl PimEngine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let store = build_store(&config)?;
        Self::with_store(config, store)
    }

    /// Allocates the fleet and uploads `store` to every cluster.
    pub fn with_store(config: EngineConfig, store: RecordStore) -> Result<Self, EngineError> {
        config.validate()?;
        let mut fleet = Fleet::allocate(config.fleet_config())?;
        let layout = fleet.load_store(&store)?;
        info!(
            records = store.len(),
            units = config.num_units,
            clusters = config.clusters,
            "engine ready"
        );
        Ok(Self {
            config,
            store,
            fleet,
            layout,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn layout(&self) -> &ShardLayout {
        &self.layout
    }

    pub fn fleet(&self) -> &Fleet {
        &self.fleet
    }

    /// Single-query path: one dispatch on the first cluster.
    pub fn answer(&mut self, selection: &SelectionVector) -> Result<Record, EngineError> {
        let per_unit = self.partition_single(selection)?;
        let layout = self.layout;
        let results = dispatch_batch(self.first_cluster()?, &layout, &per_unit, 1)?;
        Ok(results[0])
    }

    /// Same as [`answer`](Self::answer), timing each dispatch stage into
    /// `profiler`: `COPY.CPU->PIM`, `PIR.PIMexec`, `COPY.PIM->CPU`,
    /// `PIR.Aggregate` and `PIR.PIM_Total`.
    pub fn answer_profiled(
        &mut self,
        selection: &SelectionVector,
        profiler: &mut Profiler,
    ) -> Result<Record, EngineError> {
        profiler.start("PIR.PIM_Total");
        let per_unit = self.partition_single(selection)?;
        let layout = self.layout;
        let set = self.first_cluster()?;

        profiler.start("COPY.CPU->PIM");
        push_batch(set, &layout, &per_unit, 1)?;
        profiler.accumulate("COPY.CPU->PIM");

        profiler.start("PIR.PIMexec");
        set.execute()?;
        profiler.accumulate("PIR.PIMexec");

        profiler.start("COPY.PIM->CPU");
        let outputs = set.pull_output(1)?;
        profiler.accumulate("COPY.PIM->CPU");

        profiler.start("PIR.Aggregate");
        let results = aggregate_outputs(outputs, 1);
        profiler.accumulate("PIR.Aggregate");

        profiler.accumulate("PIR.PIM_Total");
        Ok(results[0])
    }

    fn partition_single(&self, selection: &SelectionVector) -> Result<Vec<Vec<u8>>, EngineError> {
        Ok(self
            .layout
            .partition(selection)?
            .into_iter()
            .map(|part| part.into_bytes())
            .collect())
    }

    fn first_cluster(&mut self) -> Result<&mut (dyn UnitSet + 'static), EngineError> {
        Ok(self
            .fleet
            .cluster_mut(0)
            .ok_or(DispatchError::UnitCountMismatch {
                expected: 1,
                actual: 0,
            })?)
    }

    pub fn answer_key<K: SelectionKey>(&mut self, key: &K) -> Result<Record, EngineError> {
        let selection = key.expand(self.store.len());
        self.answer(&selection)
    }

    pub fn answer_batch<K: SelectionKey>(&mut self, keys: &[K]) -> Result<Vec<Record>, EngineError> {
        Ok(self.run_pass(keys)?.results)
    }

    /// Batch pass with per-dispatch sizes, for benchmarking.
    pub fn run_pass<K: SelectionKey>(&mut self, keys: &[K]) -> Result<PassReport, EngineError> {
        let pass = PassConfig {
            dispatch_limit: self.config.dispatch_limit(),
            max_producers: self.config.max_producers,
            queue_capacity: self.config.queue_capacity,
        };
        Ok(run_batch_pass(&mut self.fleet, &self.layout, keys, &pass)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;
    use crate::scan::reduce;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use xorpir_core::{PointKey, XorShareKey};

    fn test_engine() -> PimEngine {
        PimEngine::new(EngineConfig::for_env(Environment::Test)).unwrap()
    }

    #[test]
    fn new_builds_index_pattern_store() {
        let engine = test_engine();
        assert_eq!(engine.store().len(), 1 << 12);
        assert_eq!(engine.store().record(77), Some(&Record::splat(77)));
        assert_eq!(engine.layout().unit_count(), 4);
        assert_eq!(engine.fleet().cluster_count(), 2);
    }

    #[test]
    fn new_rejects_invalid_config() {
        let config = EngineConfig {
            clusters: 3,
            ..EngineConfig::for_env(Environment::Test)
        };
        assert!(matches!(
            PimEngine::new(config),
            Err(EngineError::Config(ConfigError::Fleet(_)))
        ));
    }

    #[test]
    fn single_answer_matches_cpu_reduction() {
        let mut engine = test_engine();
        let mut rng = StdRng::seed_from_u64(21);
        let selection = SelectionVector::random(&mut rng, engine.store().len());
        let expected = reduce(engine.store(), &selection).unwrap();
        assert_eq!(engine.answer(&selection).unwrap(), expected);
    }

    #[test]
    fn profiled_answer_times_every_stage() {
        let mut engine = test_engine();
        let mut profiler = Profiler::new();
        let selection = SelectionVector::point(engine.store().len(), 1500);
        for _ in 0..2 {
            assert_eq!(
                engine.answer_profiled(&selection, &mut profiler).unwrap(),
                Record::splat(1500)
            );
        }
        for stage in [
            "COPY.CPU->PIM",
            "PIR.PIMexec",
            "COPY.PIM->CPU",
            "PIR.Aggregate",
            "PIR.PIM_Total",
        ] {
            assert_eq!(profiler.count(stage), 2, "{}", stage);
        }
    }

    #[test]
    fn answer_rejects_selection_for_other_store() {
        let mut engine = test_engine();
        assert!(matches!(
            engine.answer(&SelectionVector::zeroed(64)),
            Err(EngineError::Layout(_))
        ));
    }

    #[test]
    fn batch_answers_match_single_answers() {
        let mut engine = test_engine();
        let keys: Vec<PointKey> = [0, 1, 1023, 1024, 4095, 2000, 7]
            .into_iter()
            .map(|target| PointKey { target })
            .collect();
        let batch = engine.answer_batch(&keys).unwrap();
        for (key, result) in keys.iter().zip(&batch) {
            assert_eq!(*result, engine.answer_key(key).unwrap());
            assert_eq!(*result, Record::splat(key.target as u64));
        }
    }

    #[test]
    fn two_shares_reconstruct_the_target() {
        let mut engine = test_engine();
        let mut rng = StdRng::seed_from_u64(8);
        let (a, b) = XorShareKey::generate_pair(&mut rng, 3210);
        let share_a = engine.answer_key(&a).unwrap();
        let share_b = engine.answer_key(&b).unwrap();
        assert_eq!(share_a ^ share_b, Record::splat(3210));
    }

    #[test]
    fn seeded_fill_differs_from_index_pattern() {
        let config = EngineConfig {
            fill_seed: Some(99),
            ..EngineConfig::for_env(Environment::Test)
        };
        let store = build_store(&config).unwrap();
        assert_ne!(store.record(5), Some(&Record::splat(5)));
    }
}
