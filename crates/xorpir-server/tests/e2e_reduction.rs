use rand::rngs::StdRng;
use rand::SeedableRng;
use xorpir_core::{PointKey, Record, SelectionKey, SelectionVector, ShardLayout, XorShareKey};
use xorpir_server::{
    reduce, reduce_batch, reduce_scalar, reduce_sharded, EngineConfig, Environment, PimEngine,
};
use xorpir_storage::RecordStore;

const TARGET: usize = 123_456;

fn engine(log_records: u32, num_units: usize, clusters: usize) -> PimEngine {
    let config = EngineConfig {
        log_records,
        num_units,
        clusters,
        ..EngineConfig::for_env(Environment::Test)
    };
    PimEngine::new(config).unwrap()
}

#[test]
fn point_selection_returns_target_on_cpu_and_fleet() {
    let store = RecordStore::with_index_pattern(1 << 20).unwrap();
    let selection = SelectionVector::point(store.len(), TARGET);
    assert_eq!(reduce(&store, &selection).unwrap(), Record::splat(TARGET as u64));

    let mut engine = PimEngine::with_store(
        EngineConfig {
            log_records: 20,
            num_units: 16,
            clusters: 1,
            ..EngineConfig::for_env(Environment::Test)
        },
        store,
    )
    .unwrap();
    assert_eq!(
        engine.answer(&selection).unwrap(),
        Record::splat(TARGET as u64)
    );
}

#[test]
fn two_servers_reconstruct_target() {
    let mut server_a = engine(16, 8, 1);
    let mut server_b = engine(16, 4, 2);
    let mut rng = StdRng::seed_from_u64(0xC0FFEE);
    let (key_a, key_b) = XorShareKey::generate_pair(&mut rng, 40_000);

    let share_a = server_a.answer_key(&key_a).unwrap();
    let share_b = server_b.answer_key(&key_b).unwrap();
    assert_eq!(share_a ^ share_b, Record::splat(40_000));
}

#[test]
fn result_is_independent_of_unit_count() {
    let store = RecordStore::with_index_pattern(1 << 14).unwrap();
    let mut rng = StdRng::seed_from_u64(5);
    let selection = SelectionVector::random(&mut rng, store.len());
    let expected = reduce_scalar(&store, &selection).unwrap();

    for units in [1, 3, 7, 8, 13, 64] {
        let layout = ShardLayout::new(store.len(), units).unwrap();
        assert_eq!(
            reduce_sharded(&store, &layout, &selection).unwrap(),
            expected,
            "cpu sharding over {} units",
            units
        );
    }

    for units in [1, 2, 8, 16] {
        let mut engine = engine(14, units, 1);
        assert_eq!(
            engine.answer(&selection).unwrap(),
            expected,
            "fleet of {} units",
            units
        );
    }
}

#[test]
fn batch_items_do_not_interfere() {
    let mut engine = engine(14, 8, 2);
    let mut rng = StdRng::seed_from_u64(17);
    let selections: Vec<SelectionVector> = (0..21)
        .map(|_| SelectionVector::random(&mut rng, engine.store().len()))
        .collect();
    let expected = reduce_batch(engine.store(), &selections).unwrap();

    let keys: Vec<Fixed> = selections.into_iter().map(Fixed).collect();
    let report = engine.run_pass(&keys).unwrap();
    assert_eq!(report.results, expected);
    assert_eq!(report.dispatch_sizes.iter().sum::<usize>(), keys.len());
    assert!(report
        .dispatch_sizes
        .iter()
        .all(|&size| size <= engine.config().dispatch_limit()));
}

#[test]
fn selection_xored_with_itself_yields_zero() {
    let mut engine = engine(12, 8, 1);
    let mut rng = StdRng::seed_from_u64(3);
    let selection = SelectionVector::random(&mut rng, engine.store().len());
    let doubled = selection.xor(&selection).unwrap();

    assert_eq!(engine.answer(&doubled).unwrap(), Record::ZERO);
    let share = engine.answer(&selection).unwrap();
    assert_eq!(share ^ share, Record::ZERO);
}

#[test]
fn alternating_selection_over_eight_records() {
    let store = RecordStore::with_index_pattern(8).unwrap();
    let selection = SelectionVector::from_bytes(vec![0b0000_0101], 8).unwrap();
    assert_eq!(
        reduce(&store, &selection).unwrap(),
        Record::splat(0) ^ Record::splat(2)
    );
    assert_eq!(reduce_scalar(&store, &selection).unwrap(), Record::splat(2));
}

#[test]
fn point_batch_reads_back_every_target() {
    let mut engine = engine(16, 16, 2);
    let keys: Vec<PointKey> = (0..40)
        .map(|i| PointKey {
            target: (i * 1637) % (1 << 16),
        })
        .collect();
    let answers = engine.answer_batch(&keys).unwrap();
    for (key, answer) in keys.iter().zip(&answers) {
        assert_eq!(*answer, Record::splat(key.target as u64));
    }
}

/// Hands out a precomputed selection.
struct Fixed(SelectionVector);

impl SelectionKey for Fixed {
    fn expand(&self, record_count: usize) -> SelectionVector {
        assert_eq!(record_count, self.0.record_count());
        self.0.clone()
    }
}
