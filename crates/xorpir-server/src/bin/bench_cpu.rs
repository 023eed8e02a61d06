//! CPU select-XOR benchmark.
//!
//! ```text
//! bench_cpu mode=single8 logN=20 reps=10
//! bench_cpu mode=batch8 logN=20 batch=64 reps=10
//! ```

use anyhow::{ensure, Context, Result};
use clap::{Parser, ValueEnum};
use rand::Rng;
use xorpir_core::{Record, SelectionKey, XorShareKey};
use xorpir_server::{
    init_tracing, reduce, reduce_batch, reduce_batch_scalar, reduce_scalar, Profiler,
    MAX_LOG_RECORDS,
};
use xorpir_storage::RecordStore;

const GIB: f64 = (1u64 << 30) as f64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// One query, 8-accumulator vectorized kernel.
    Single8,
    /// One query, bit-at-a-time reference kernel.
    Single,
    /// Batch of queries reduced in parallel with the vectorized kernel.
    Batch8,
    /// Batch of queries reduced in parallel with the reference kernel.
    Batch,
}

#[derive(Parser, Debug)]
#[command(about = "CPU select-XOR reduction benchmark")]
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
}

fn main() -> Result<()> {
    init_tracing()?;
    let args = Args::parse_from(normalized_args());
    ensure!(
        (3..=MAX_LOG_RECORDS).contains(&args.log_n),
        "logN must be in 3..={}",
        MAX_LOG_RECORDS
    );

    let num_records = 1usize << args.log_n;
    let store = RecordStore::with_index_pattern(num_records).context("building record store")?;
    println!("Database Size: {:.3} GB", store.size_bytes() as f64 / GIB);

    match args.mode {
        Mode::Single8 | Mode::Single => run_single(&store, args.mode, args.reps),
        Mode::Batch8 | Mode::Batch => run_batch(&store, args.mode, args.batch, args.reps),
    }
}

fn run_single(store: &RecordStore, mode: Mode, reps: usize) -> Result<()> {
    let mut rng = rand::thread_rng();
    let mut profiler = Profiler::new();
    let mut last = None;

    for _ in 0..reps {
        profiler.start("DPF.KeyGen");
        let target = rng.gen_range(0..store.len());
        let (key, other) = XorShareKey::generate_pair(&mut rng, target);
        profiler.accumulate("DPF.KeyGen");

        profiler.start("DPF.Eval");
        let selection = key.expand(store.len());
        profiler.accumulate("DPF.Eval");

        profiler.start("PIR.CPU");
        let share = if mode == Mode::Single8 {
            reduce(store, &selection)?
        } else {
            reduce_scalar(store, &selection)?
        };
        profiler.accumulate("PIR.CPU");
        last = Some((share, other));
    }

    print!("{}", profiler.report(mode == Mode::Single, false));
    if let Some((share, other)) = last {
        let answer = share ^ reduce(store, &other.expand(store.len()))?;
        ensure!(
            answer == Record::splat(other.target() as u64),
            "reconstructed record does not match target {}",
            other.target()
        );
        println!("Check: OK (target {})", other.target());
    }
    Ok(())
}

fn run_batch(store: &RecordStore, mode: Mode, batch: usize, reps: usize) -> Result<()> {
    ensure!(batch > 0, "batch must be > 0");
    let mut rng = rand::thread_rng();
    let keys: Vec<XorShareKey> = (0..batch)
        .map(|_| {
            let target = rng.gen_range(0..store.len());
            XorShareKey::generate_pair(&mut rng, target).0
        })
        .collect();
    println!("Batch size: {}", batch);

    let mut profiler = Profiler::new();
    let event = format!("Batch = {}", batch);
    profiler.start(&event);
    let mut answers: Vec<Record> = Vec::with_capacity(batch);
    for _ in 0..reps {
        let selections: Vec<_> = keys.iter().map(|key| key.expand(store.len())).collect();
        answers = if mode == Mode::Batch8 {
            reduce_batch(store, &selections)?
        } else {
            reduce_batch_scalar(store, &selections)?
        };
        profiler.accumulate(&event);
    }

    let avg_ms = profiler.average_ms(&event);
    let throughput = batch as f64 * 1000.0 / avg_ms.max(1e-9);
    println!("Throughput : {:.1} q/s", throughput);
    print!("{}", profiler.report(true, true));
    println!("Answers: {}", answers.len());
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
