//! Producer/submitter pipeline that feeds batches of selections to the fleet.
//!
//! Producers expand selection keys and partition each vector per shard;
//! one submitter per cluster drains the shared queue in bulk and runs one
//! dispatch per drained group.

use std::thread;

use tracing::debug;
use xorpir_core::{LayoutError, Record, SelectionKey, ShardLayout};
use xorpir_pim::{dispatch_batch, DispatchError, Fleet, UnitSet};

use crate::queue::{work_queue, QueueError, WorkReceiver, WorkSender};

/// Items per producer below which another producer is not worth spawning.
const ITEMS_PER_PRODUCER: usize = 4;

/// One query's selection, already split into per-unit shard selections of
/// `layout.selection_stride()` bytes each.
pub struct BatchWorkItem {
    pub query_index: usize,
    pub per_unit: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    Layout(LayoutError),
    Queue(QueueError),
    Dispatch(DispatchError),
    LayoutMismatch {
        layout_units: usize,
        cluster_units: usize,
    },
    /// The layout is not the one the fleet's store was loaded with.
    LayoutNotLoaded {
        requested: ShardLayout,
        loaded: Option<ShardLayout>,
    },
    WorkerPanicked,
}

impl std::fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrchestratorError::Layout(err) => write!(f, "partitioning failed: {}", err),
            OrchestratorError::Queue(err) => write!(f, "work queue: {}", err),
            OrchestratorError::Dispatch(err) => write!(f, "{}", err),
            OrchestratorError::LayoutMismatch {
                layout_units,
                cluster_units,
            } => {
                write!(
                    f,
                    "layout spans {} units but clusters hold {}",
                    layout_units, cluster_units
                )
            }
            OrchestratorError::LayoutNotLoaded { requested, loaded } => match loaded {
                Some(loaded) => write!(
                    f,
                    "layout of {} records per shard does not match the loaded {}",
                    requested.records_per_shard(),
                    loaded.records_per_shard()
                ),
                None => write!(f, "no record store is loaded into the fleet"),
            },
            OrchestratorError::WorkerPanicked => write!(f, "batch worker thread panicked"),
        }
    }
}

impl std::error::Error for OrchestratorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OrchestratorError::Layout(err) => Some(err),
            OrchestratorError::Queue(err) => Some(err),
            OrchestratorError::Dispatch(err) => Some(err),
            _ => None,
        }
    }
}

impl From<LayoutError> for OrchestratorError {
    fn from(err: LayoutError) -> Self {
        OrchestratorError::Layout(err)
    }
}

impl From<QueueError> for OrchestratorError {
    fn from(err: QueueError) -> Self {
        OrchestratorError::Queue(err)
    }
}

impl From<DispatchError> for OrchestratorError {
    fn from(err: DispatchError) -> Self {
        OrchestratorError::Dispatch(err)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PassConfig {
    /// Most items drained per dispatch.
    pub dispatch_limit: usize,
    pub max_producers: usize,
    pub queue_capacity: usize,
}

/// Results of one pass, in query order, plus the size of every dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub results: Vec<Record>,
    pub dispatch_sizes: Vec<usize>,
}

/// `min(max_producers, max(1, items / 4))`.
pub fn producer_count(items: usize, max_producers: usize) -> usize {
    max_producers
        .max(1)
        .min((items / ITEMS_PER_PRODUCER).max(1))
}

/// Runs `abort` if the owning worker thread unwinds.
struct AbortOnUnwind<F: Fn()>(F);

impl<F: Fn()> Drop for AbortOnUnwind<F> {
    fn drop(&mut self) {
        if thread::panicking() {
            (self.0)();
        }
    }
}

/// Runs every key through the fleet once. `layout` must be the layout the
/// fleet's store was loaded with. The queue lives for this pass only.
pub fn run_batch_pass<K: SelectionKey>(
    fleet: &mut Fleet,
    layout: &ShardLayout,
    keys: &[K],
    config: &PassConfig,
) -> Result<PassReport, OrchestratorError> {
    if layout.unit_count() != fleet.units_per_cluster() {
        return Err(OrchestratorError::LayoutMismatch {
            layout_units: layout.unit_count(),
            cluster_units: fleet.units_per_cluster(),
        });
    }
    if fleet.layout() != Some(layout) {
        return Err(OrchestratorError::LayoutNotLoaded {
            requested: *layout,
            loaded: fleet.layout().copied(),
        });
    }
    if keys.is_empty() {
        return Ok(PassReport {
            results: Vec::new(),
            dispatch_sizes: Vec::new(),
        });
    }

    let producers = producer_count(keys.len(), config.max_producers);
    let chunk = keys.len().div_ceil(producers);
    let dispatch_limit = config.dispatch_limit.max(1);
    debug!(
        items = keys.len(),
        producers,
        submitters = fleet.cluster_count(),
        "starting batch pass"
    );

    let (sender, receiver) = work_queue(config.queue_capacity);
    let (producer_results, submitter_results) = thread::scope(|s| {
        let submitters: Vec<_> = fleet
            .clusters_mut()
            .iter_mut()
            .map(|set| {
                let receiver = receiver.clone();
                s.spawn(move || {
                    let _abort = AbortOnUnwind(|| receiver.abort());
                    let outcome = submit_loop(set.as_mut(), layout, &receiver, dispatch_limit);
                    if outcome.is_err() {
                        receiver.abort();
                    }
                    outcome
                })
            })
            .collect();

        let producer_handles: Vec<_> = keys
            .chunks(chunk)
            .enumerate()
            .map(|(p, keys)| {
                let sender = sender.clone();
                s.spawn(move || {
                    let _abort = AbortOnUnwind(|| sender.abort());
                    let outcome = produce(p * chunk, keys, layout, &sender);
                    if outcome.is_err() {
                        sender.abort();
                    }
                    outcome
                })
            })
            .collect();

        // Workers hold the only endpoints from here on: the channel closes
        // when the last producer finishes or the last submitter exits.
        drop(sender);
        drop(receiver);

        let producer_results: Vec<_> = producer_handles.into_iter().map(join).collect();
        let submitter_results: Vec<_> = submitters.into_iter().map(join).collect();
        (producer_results, submitter_results)
    });

    // Submitter failures are the root cause when producers were aborted.
    let mut answered = Vec::new();
    for outcome in submitter_results {
        answered.push(outcome?);
    }
    for outcome in producer_results {
        outcome?;
    }

    let mut results = vec![Record::ZERO; keys.len()];
    let mut dispatch_sizes = Vec::new();
    for (pairs, sizes) in answered {
        for (query_index, result) in pairs {
            results[query_index] = result;
        }
        dispatch_sizes.extend(sizes);
    }
    debug!(
        items = keys.len(),
        dispatches = dispatch_sizes.len(),
        "batch pass complete"
    );
    Ok(PassReport {
        results,
        dispatch_sizes,
    })
}

fn join<T>(
    handle: thread::ScopedJoinHandle<'_, Result<T, OrchestratorError>>,
) -> Result<T, OrchestratorError> {
    handle
        .join()
        .map_err(|_| OrchestratorError::WorkerPanicked)?
}

fn produce<K: SelectionKey>(
    first_index: usize,
    keys: &[K],
    layout: &ShardLayout,
    sender: &WorkSender<BatchWorkItem>,
) -> Result<(), OrchestratorError> {
    for (offset, key) in keys.iter().enumerate() {
        let selection = key.expand(layout.total_records());
        let per_unit = layout
            .partition(&selection)?
            .into_iter()
            .map(|part| part.into_bytes())
            .collect();
        sender.push(BatchWorkItem {
            query_index: first_index + offset,
            per_unit,
        })?;
    }
    Ok(())
}

type Answered = (Vec<(usize, Record)>, Vec<usize>);

fn submit_loop(
    set: &mut dyn UnitSet,
    layout: &ShardLayout,
    receiver: &WorkReceiver<BatchWorkItem>,
    dispatch_limit: usize,
) -> Result<Answered, OrchestratorError> {
    let dispatch_limit = dispatch_limit.min(set.kernel_config().max_batch);
    let stride = layout.selection_stride();
    let mut transfer: Vec<Vec<u8>> =
        vec![Vec::with_capacity(dispatch_limit * stride); set.unit_count()];
    let mut answered = Vec::new();
    let mut dispatch_sizes = Vec::new();

    loop {
        // Empty once producers are done and the queue is drained, or on abort.
        let items = receiver.dequeue_bulk(dispatch_limit);
        if items.is_empty() {
            break;
        }

        for buffer in &mut transfer {
            buffer.clear();
        }
        for item in &items {
            for (buffer, part) in transfer.iter_mut().zip(&item.per_unit) {
                buffer.extend_from_slice(part);
            }
        }

        let results = dispatch_batch(set, layout, &transfer, items.len())?;
        dispatch_sizes.push(items.len());
        answered.extend(items.iter().map(|item| item.query_index).zip(results));
    }
    Ok((answered, dispatch_sizes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use xorpir_core::{PointKey, SelectionVector};
    use xorpir_pim::{FleetConfig, KernelConfig, UnitArgs};
    use xorpir_storage::RecordStore;

    fn small_fleet(num_units: usize, clusters: usize) -> Fleet {
        Fleet::allocate(FleetConfig {
            kernel: KernelConfig {
                lane_count: 2,
                block_log2: 8,
                max_batch: 8,
                ..KernelConfig::default()
            },
            ..FleetConfig::new(num_units, clusters)
        })
        .unwrap()
    }

    fn pass_config(dispatch_limit: usize) -> PassConfig {
        PassConfig {
            dispatch_limit,
            max_producers: 16,
            queue_capacity: 4,
        }
    }

    #[test]
    fn producer_count_scales_with_batch() {
        assert_eq!(producer_count(1, 16), 1);
        assert_eq!(producer_count(7, 16), 1);
        assert_eq!(producer_count(8, 16), 2);
        assert_eq!(producer_count(64, 16), 16);
        assert_eq!(producer_count(1000, 16), 16);
        assert_eq!(producer_count(1000, 3), 3);
    }

    #[test]
    fn pass_answers_every_query_in_order() {
        let store = RecordStore::with_index_pattern(256).unwrap();
        let mut fleet = small_fleet(6, 2);
        let layout = fleet.load_store(&store).unwrap();
        let keys: Vec<PointKey> = (0..37).map(|i| PointKey { target: i * 7 }).collect();

        let report = run_batch_pass(&mut fleet, &layout, &keys, &pass_config(8)).unwrap();
        let expected: Vec<Record> = keys.iter().map(|k| Record::splat(k.target as u64)).collect();
        assert_eq!(report.results, expected);
        assert_eq!(report.dispatch_sizes.iter().sum::<usize>(), keys.len());
        assert!(report.dispatch_sizes.iter().all(|size| (1..=8).contains(size)));
    }

    #[test]
    fn dispatch_limit_caps_each_group() {
        let store = RecordStore::with_index_pattern(64).unwrap();
        let mut fleet = small_fleet(4, 1);
        let layout = fleet.load_store(&store).unwrap();
        let keys: Vec<PointKey> = (0..20).map(|target| PointKey { target }).collect();

        let report = run_batch_pass(&mut fleet, &layout, &keys, &pass_config(3)).unwrap();
        assert!(report.dispatch_sizes.iter().all(|size| *size <= 3));
        assert_eq!(report.results[19], Record::splat(19));
    }

    #[test]
    fn repeated_passes_rebuild_the_queue() {
        let store = RecordStore::with_index_pattern(64).unwrap();
        let mut fleet = small_fleet(2, 1);
        let layout = fleet.load_store(&store).unwrap();
        let keys = [PointKey { target: 5 }, PointKey { target: 63 }];

        for _ in 0..3 {
            let report = run_batch_pass(&mut fleet, &layout, &keys, &pass_config(8)).unwrap();
            assert_eq!(report.results, vec![Record::splat(5), Record::splat(63)]);
        }
    }

    #[test]
    fn empty_batch_dispatches_nothing() {
        let store = RecordStore::with_index_pattern(64).unwrap();
        let mut fleet = small_fleet(2, 1);
        let layout = fleet.load_store(&store).unwrap();
        let keys: [PointKey; 0] = [];
        let report = run_batch_pass(&mut fleet, &layout, &keys, &pass_config(8)).unwrap();
        assert!(report.results.is_empty());
        assert!(report.dispatch_sizes.is_empty());
    }

    #[test]
    fn rejects_layout_for_other_unit_count() {
        let mut fleet = small_fleet(4, 1);
        let layout = ShardLayout::new(64, 3).unwrap();
        let keys = [PointKey { target: 0 }];
        assert_eq!(
            run_batch_pass(&mut fleet, &layout, &keys, &pass_config(8)),
            Err(OrchestratorError::LayoutMismatch {
                layout_units: 3,
                cluster_units: 4
            })
        );
    }

    #[test]
    fn rejects_layout_other_than_the_loaded_one() {
        let store = RecordStore::with_index_pattern(256).unwrap();
        let mut fleet = small_fleet(2, 1);
        let layout = fleet.load_store(&store).unwrap();
        let smaller = ShardLayout::new(128, 2).unwrap();
        let keys = [PointKey { target: 3 }];

        assert_eq!(
            run_batch_pass(&mut fleet, &smaller, &keys, &pass_config(8)),
            Err(OrchestratorError::LayoutNotLoaded {
                requested: smaller,
                loaded: Some(layout),
            })
        );

        let keys = [PointKey { target: 64 }];
        let report = run_batch_pass(&mut fleet, &layout, &keys, &pass_config(8)).unwrap();
        assert_eq!(report.results, vec![Record::splat(64)]);
    }

    #[test]
    fn rejects_fleet_without_a_store() {
        let mut fleet = small_fleet(2, 1);
        let layout = ShardLayout::new(64, 2).unwrap();
        let keys = [PointKey { target: 0 }];
        assert_eq!(
            run_batch_pass(&mut fleet, &layout, &keys, &pass_config(8)),
            Err(OrchestratorError::LayoutNotLoaded {
                requested: layout,
                loaded: None,
            })
        );
    }

    /// Accepts uploads and transfers, then panics on execute.
    struct PanickingUnitSet {
        config: KernelConfig,
    }

    impl UnitSet for PanickingUnitSet {
        fn unit_count(&self) -> usize {
            2
        }

        fn kernel_config(&self) -> &KernelConfig {
            &self.config
        }

        fn load_shards(
            &mut self,
            _shards: &[&[Record]],
            _shard_size_bytes: usize,
            _selection_capacity_bytes: usize,
        ) -> Result<(), DispatchError> {
            Ok(())
        }

        fn push_args(&mut self, _args: UnitArgs) -> Result<(), DispatchError> {
            Ok(())
        }

        fn push_selection(
            &mut self,
            _offset: usize,
            _per_unit: &[Vec<u8>],
        ) -> Result<(), DispatchError> {
            Ok(())
        }

        fn execute(&mut self) -> Result<(), DispatchError> {
            panic!("unit fault");
        }

        fn pull_output(&mut self, item_count: usize) -> Result<Vec<Vec<Record>>, DispatchError> {
            Ok(vec![vec![Record::ZERO; item_count]; 2])
        }
    }

    #[test]
    fn submitter_panic_ends_the_pass() {
        let config = FleetConfig {
            kernel: KernelConfig {
                max_batch: 8,
                ..KernelConfig::default()
            },
            ..FleetConfig::new(2, 1)
        };
        let set = PanickingUnitSet {
            config: config.kernel,
        };
        let mut fleet = Fleet::from_unit_sets(config, vec![Box::new(set)]).unwrap();
        let store = RecordStore::with_index_pattern(64).unwrap();
        let layout = fleet.load_store(&store).unwrap();
        let keys: Vec<PointKey> = (0..40).map(|target| PointKey { target }).collect();
        let pass = PassConfig {
            dispatch_limit: 1,
            max_producers: 16,
            queue_capacity: 2,
        };

        assert_eq!(
            run_batch_pass(&mut fleet, &layout, &keys, &pass),
            Err(OrchestratorError::WorkerPanicked)
        );
    }

    /// Expands to a selection over the wrong record count.
    struct MisfitKey;

    impl SelectionKey for MisfitKey {
        fn expand(&self, record_count: usize) -> SelectionVector {
            SelectionVector::zeroed(record_count + 8)
        }
    }

    #[test]
    fn producer_failure_aborts_the_pass() {
        let store = RecordStore::with_index_pattern(64).unwrap();
        let mut fleet = small_fleet(2, 1);
        let layout = fleet.load_store(&store).unwrap();
        let keys: Vec<MisfitKey> = (0..12).map(|_| MisfitKey).collect();
        assert!(matches!(
            run_batch_pass(&mut fleet, &layout, &keys, &pass_config(8)),
            Err(OrchestratorError::Layout(_))
        ));
    }
}
