//! Select-XOR benchmark on the simulated compute-unit fleet.
//!
//! ```text
//! bench_pim num_dpus=256 mode=single logN=20 reps=10
//! bench_pim num_dpus=256 mode=batch logN=20 batch=64 cluster=1 reps=10
//! ```

use anyhow::{ensure, Context, Result};
use clap::{Parser, ValueEnum};
use rand::Rng;
use xorpir_core::{PointKey, Record, SelectionKey, XorShareKey};
use xorpir_server::{init_tracing, EngineConfig, Environment, PimEngine, Profiler};

const GIB: f64 = (1u64 << 30) as f64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// One selection per dispatch on the first cluster.
    Single,
    /// Producer/submitter pipeline over every cluster.
    Batch,
}

#[derive(Parser, Debug)]
#[command(about = "Compute-unit fleet select-XOR benchmark")]
struct Args {
    #[arg(long, value_enum)]
    mode: Mode,

    /// Store holds 2^logN records.
    #[arg(long = "logN")]
    log_n: u32,

    #[arg(long, default_value_t = 10)]
    reps: usize,

    #[arg(long, default_value_t = 1)]
    batch: usize,

    /// Clusters, each holding a full replica of the store.
    #[arg(long, default_value_t = 1)]
    cluster: usize,

    #[arg(long = "num_dpus", default_value_t = 128)]
    num_dpus: usize,
}

fn main() -> Result<()> {
    init_tracing()?;
    let args = Args::parse_from(normalized_args());

    let mut config = EngineConfig::for_env(Environment::Dev);
    config.log_records = args.log_n;
    config.num_units = args.num_dpus;
    config.clusters = args.cluster;
    config.validate().context("invalid benchmark configuration")?;
    println!(
        "Database Size: {:.3} GB",
        (config.num_records() * xorpir_core::RECORD_SIZE_BYTES) as f64 / GIB
    );

    let mut profiler = Profiler::new();
    profiler.start("DB.Setup");
    let mut engine = PimEngine::new(config).context("setting up compute-unit fleet")?;
    profiler.accumulate("DB.Setup");
    println!("Clusters: {}", engine.fleet().cluster_count());
    println!("Units per cluster: {}", engine.fleet().units_per_cluster());
    print!("{}", profiler.report(false, false));
    profiler.reset();

    match args.mode {
        Mode::Single => run_single(&mut engine, &mut profiler, args.reps)?,
        Mode::Batch => run_batch(&mut engine, &mut profiler, args.batch, args.reps)?,
    }
    verify(&mut engine)
}

fn run_single(engine: &mut PimEngine, profiler: &mut Profiler, reps: usize) -> Result<()> {
    let mut rng = rand::thread_rng();
    let num_records = engine.store().len();

    for _ in 0..reps {
        profiler.start("DPF.KeyGen");
        let target = rng.gen_range(0..num_records);
        let (key, _) = XorShareKey::generate_pair(&mut rng, target);
        profiler.accumulate("DPF.KeyGen");

        profiler.start("DPF.Eval");
        let selection = key.expand(num_records);
        profiler.accumulate("DPF.Eval");

        engine.answer_profiled(&selection, profiler)?;
    }

    print!("{}", profiler.report(true, false));
    Ok(())
}

fn run_batch(
    engine: &mut PimEngine,
    profiler: &mut Profiler,
    batch: usize,
    reps: usize,
) -> Result<()> {
    ensure!(batch > 0, "batch must be > 0");
    let mut rng = rand::thread_rng();
    let num_records = engine.store().len();
    let keys: Vec<XorShareKey> = (0..batch)
        .map(|_| {
            let target = rng.gen_range(0..num_records);
            XorShareKey::generate_pair(&mut rng, target).0
        })
        .collect();
    println!("Batch size: {}", batch);

    let event = format!("Batch = {}", batch);
    let mut dispatches = 0;
    for _ in 0..reps {
        profiler.start(&event);
        let report = engine.run_pass(&keys)?;
        profiler.accumulate(&event);
        dispatches += report.dispatch_sizes.len();
    }

    let avg_ms = profiler.average_ms(&event);
    let throughput = batch as f64 * 1000.0 / avg_ms.max(1e-9);
    println!("Throughput : {:.1} q/s", throughput);
    println!(
        "Dispatches per pass: {:.1}",
        dispatches as f64 / reps.max(1) as f64
    );
    print!("{}", profiler.report(true, true));
    Ok(())
}

/// Answers a few point selections and compares them with the index pattern.
fn verify(engine: &mut PimEngine) -> Result<()> {
    let last = engine.store().len() - 1;
    let keys: Vec<PointKey> = [0, last / 2, last]
        .into_iter()
        .map(|target| PointKey { target })
        .collect();
    let answers = engine.answer_batch(&keys)?;
    for (key, answer) in keys.iter().zip(&answers) {
        ensure!(
            *answer == Record::splat(key.target as u64),
            "record {} came back wrong",
            key.target
        );
    }
    println!("Check: OK");
    Ok(())
}

/// Accepts `key=value` as well as `--key value`.
fn normalized_args() -> Vec<String> {
    std::env::args()
        .enumerate()
        .map(|(i, arg)| {
            if i > 0 && !arg.starts_with('-') && arg.contains('=') {
                format!("--{}", arg)
            } else {
                arg
            }
        })
        .collect()
}
