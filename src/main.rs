//! Reference driver: builds a trie and a mirror skiplist, freezes the
//! skiplist, and checks the parallel merge against the sequential one.

use std::time::Instant;

use clap::Parser;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use canopy_map::{merge_left, parallel_generate, parallel_merge_right, PersistentIntMap, SkipMap};
use canopy_rt::{arena, RuntimeError, Scheduler};

#[derive(Parser, Debug)]
#[command(name = "canopy")]
#[command(about = "Fork/join runtime demo over a persistent integer map", long_about = None)]
struct Args {
    /// Worker threads in the pool (including the main thread)
    #[arg(long, default_value_t = Scheduler::default_worker_count())]
    threads: usize,

    /// Size of the key universe
    #[arg(long, default_value_t = 100_000)]
    universe: u64,

    /// Random entries inserted per map
    #[arg(long, default_value_t = 20_000)]
    entries: u64,

    /// PRNG seed
    #[arg(long, default_value_t = 0x5eed)]
    seed: u64,
}

fn main() -> Result<(), RuntimeError> {
    env_logger::init();
    let args = Args::parse();
    log::info!("driver starting: {:?}", args);
    arena::initialize();

    // Populate two tries with random entries, and mirror the first into a
    // skiplist from four threads.
    let build_start = Instant::now();
    let mut rng = SmallRng::seed_from_u64(args.seed);
    let mut left = PersistentIntMap::new();
    let mut right = PersistentIntMap::new();
    for _ in 0..args.entries {
        let key = rng.gen_range(0..args.universe);
        let value = rng.gen_range(0..args.universe);
        left.insert_or_replace(key, value);
        right.insert_or_replace(value, key);
    }
    left.assert_invariant();
    right.assert_invariant();

    let mirror = SkipMap::new();
    std::thread::scope(|scope| {
        for lane in 0..4u64 {
            let mirror = &mirror;
            let left = &left;
            let universe = args.universe;
            scope.spawn(move || {
                for key in (lane..universe).step_by(4) {
                    if let Some(&value) = left.get(key) {
                        mirror.emplace(key, value);
                    }
                }
            });
        }
    });
    let frozen = mirror.freeze();
    log::info!(
        "built {} + {} entries in {:?}",
        left.len(),
        right.len(),
        build_start.elapsed()
    );

    // Sequential reference: left-biased merge.
    let sequential_start = Instant::now();
    let sequential = merge_left(&left, &right);
    log::info!(
        "sequential merge_left: {} entries in {:?}",
        sequential.len(),
        sequential_start.elapsed()
    );

    // Parallel: merge the right trie with the frozen mirror of the left
    // one; mirror entries win, so the result must agree with the
    // sequential left-biased merge.
    let pool = Scheduler::start(args.threads)?;
    let parallel_start = Instant::now();
    let merged = parallel_merge_right(pool, &right, &frozen);
    log::info!(
        "parallel merge_right: {} entries in {:?}",
        merged.len(),
        parallel_start.elapsed()
    );
    arena::advance();

    let mut present = 0u64;
    for key in 0..args.universe {
        let expected = sequential.get(key);
        let observed = merged.get(key);
        assert_eq!(expected, observed, "divergence at key {key}");
        if expected.is_some() {
            present += 1;
        }
    }
    log::info!("parallel merge agrees with sequential on {present} present keys");

    // Second phase: synthesize a dense map and spot-check it.
    let pool = Scheduler::start(args.threads)?;
    let generate_start = Instant::now();
    let dense = parallel_generate(pool, 0, args.universe - 1, &|key| key + 1);
    log::info!(
        "parallel generate: {} entries in {:?}",
        dense.len(),
        generate_start.elapsed()
    );
    arena::advance();

    assert_eq!(dense.len() as u64, args.universe);
    for key in (0..args.universe).step_by(997) {
        assert_eq!(dense.get(key), Some(&(key + 1)));
    }
    assert_eq!(dense.get(args.universe), None);

    log::info!("driver finished");
    arena::finalize();
    Ok(())
}
