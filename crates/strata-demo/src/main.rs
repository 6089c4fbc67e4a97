//! Demo binary that hammers one block store from many threads and reports
//! dirty-log, palette, and snapshot statistics per simulated tick.
//!
//! Run with `cargo run -p strata-demo` for a default storm, or override:
//! `cargo run -p strata-demo -- --threads 8 --writes 100000 --distinct 4000`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;
use tracing::info;

use strata_store::{BlockStore, StoreOptions};

#[derive(Parser, Debug)]
#[command(about = "Concurrent block store write storm")]
struct Args {
    /// Volume bit-shift; the store covers (1 << shift)^3 cells.
    #[arg(long, default_value_t = 4)]
    shift: u32,

    /// Writer threads (0 = one per CPU).
    #[arg(long, default_value_t = 0)]
    threads: usize,

    /// Writes per thread per tick.
    #[arg(long, default_value_t = 10_000)]
    writes: usize,

    /// Distinct (id, data) combinations the writers draw from.
    #[arg(long, default_value_t = 64)]
    distinct: u32,

    /// Ticks to simulate; each ends with a dirty flush and a compress pass.
    #[arg(long, default_value_t = 4)]
    ticks: usize,

    /// Dirty-log slots per store.
    #[arg(long, default_value_t = 1024)]
    dirty_capacity: usize,

    /// RNG seed, fixed for reproducible storms.
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Directory for JSON log output (console only when omitted).
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();
    strata_log::init_logging(args.log_dir.as_deref(), Some("info"));

    let threads = if args.threads == 0 {
        num_cpus::get()
    } else {
        args.threads
    };
    let options = StoreOptions {
        shift: args.shift,
        record_states: true,
        compress: true,
        dirty_capacity: args.dirty_capacity,
    };
    let store = match BlockStore::new(options) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            eprintln!("bad store options: {err}");
            std::process::exit(1);
        }
    };
    info!(
        side = store.side(),
        volume = store.volume(),
        threads,
        writes = args.writes,
        distinct = args.distinct,
        "starting write storm"
    );

    for tick in 0..args.ticks {
        let started = Instant::now();
        let mut handles = Vec::with_capacity(threads);
        for thread in 0..threads {
            let store = Arc::clone(&store);
            let side = store.side();
            let distinct = args.distinct.max(1);
            let writes = args.writes;
            let seed = args.seed ^ ((tick as u64) << 32) ^ thread as u64;
            handles.push(
                std::thread::Builder::new()
                    .name(format!("writer-{thread}"))
                    .spawn(move || {
                        let mut rng = Xoshiro256StarStar::seed_from_u64(seed);
                        let mut cas_hits = 0usize;
                        for _ in 0..writes {
                            let x = rng.gen_range(0..side);
                            let y = rng.gen_range(0..side);
                            let z = rng.gen_range(0..side);
                            let pick = rng.gen_range(0..distinct);
                            let id = (pick >> 4) as u16;
                            let data = (pick & 0xF) as u16;
                            if rng.gen_bool(0.25) {
                                let current = store.get_full_state(x, y, z);
                                if store.compare_and_set_block(
                                    x,
                                    y,
                                    z,
                                    current.id(),
                                    current.data(),
                                    id,
                                    data,
                                ) {
                                    cas_hits += 1;
                                }
                            } else {
                                store.set_block(x, y, z, id, data);
                            }
                        }
                        cas_hits
                    })
                    .expect("spawn writer thread"),
            );
        }
        let cas_hits: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        // End-of-tick flush: drain what the dirty log captured, then rearm.
        let dirty = store.dirty_count();
        let overflow = store.is_dirty_overflow();
        let (min, max) = (store.min_dirty(), store.max_dirty());
        let mut sampled = 0usize;
        let mut i = 0;
        while let Some(_coord) = store.dirty_coordinate(i) {
            sampled += 1;
            i += 1;
        }
        store.reset_dirty();

        store.compress();
        info!(
            tick,
            elapsed_ms = started.elapsed().as_millis() as u64,
            cas_hits,
            dirty,
            overflow,
            sampled,
            bbox_min = ?min,
            bbox_max = ?max,
            width = store.packed_width(),
            palette_len = store.palette().len(),
            uniform = store.is_uniform(),
            "tick complete"
        );
    }

    let snapshot = store.snapshot();
    let bytes = serde_json::to_vec(&snapshot).map_or(0, |v| v.len());
    info!(
        width = snapshot.width,
        palette_len = snapshot.palette.len(),
        packed_words = snapshot.packed.len(),
        json_bytes = bytes,
        "final snapshot"
    );
}
