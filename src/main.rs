use std::path::PathBuf;
use std::thread;

use bytesize::ByteSize;
use clap::{value_parser, Arg, ArgAction, Command};
use env_logger::Env;
use log::{debug, info};

use nestprof::analysis::NestAnalysis;
use nestprof::config::{DataSpace, Workload};
use nestprof::mapping::{LoopLevel, Nest};
use nestprof::util::{ceil_div_usize, SIZE_W};

struct Candidate {
    tile_m: usize,
    tile_n: usize,
    nest: Nest,
}

fn divisors(x: usize) -> Vec<usize> {
    (1..=x).filter(|d| x % d == 0).collect()
}

/// Tiled matmul mappings: an outer temporal sweep per storage level with a
/// spatial fanout over M between the two levels.
fn build_candidates(m: usize, n: usize, k: usize, pe: usize, linked: bool) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    for &tile_m in divisors(m).iter() {
        if m % (tile_m * pe) != 0 {
            continue;
        }
        for &tile_n in divisors(n).iter() {
            let levels = vec![
                LoopLevel::temporal(0, m / (tile_m * pe)),
                LoopLevel::temporal(1, n / tile_n),
                LoopLevel::temporal(2, k),
                LoopLevel::spatial_x(0, pe),
                LoopLevel::temporal(0, tile_m),
                LoopLevel::temporal(1, tile_n),
            ];
            candidates.push(Candidate {
                tile_m,
                tile_n,
                nest: Nest::new(levels, vec![2, 5], vec![linked, false]),
            });
        }
    }
    candidates
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Command::new("nestprof")
        .version("0.1.0")
        .about("Working-set analysis sweep over tiled matmul mappings")
        .arg(
            Arg::new("m")
                .short('m')
                .default_value("64")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("n")
                .short('n')
                .default_value("64")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("k")
                .short('k')
                .default_value("16")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("pe")
                .long("pe")
                .default_value("4")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("workers")
                .short('w')
                .long("workers")
                .default_value("0")
                .value_parser(value_parser!(usize)),
        )
        .arg(Arg::new("linked").long("linked").action(ArgAction::SetTrue))
        .arg(Arg::new("approx").long("approx").action(ArgAction::SetTrue))
        .arg(Arg::new("dump").long("dump").action(ArgAction::SetTrue))
        .arg(
            Arg::new("checkpoint")
                .long("checkpoint")
                .value_parser(value_parser!(PathBuf)),
        )
        .get_matches();

    let m: usize = *args.get_one::<usize>("m").unwrap();
    let n: usize = *args.get_one::<usize>("n").unwrap();
    let k: usize = *args.get_one::<usize>("k").unwrap();
    let pe: usize = *args.get_one::<usize>("pe").unwrap();
    let linked = args.get_flag("linked");
    let approx = args.get_flag("approx");
    let dump = args.get_flag("dump");
    let mut workers: usize = *args.get_one::<usize>("workers").unwrap();
    if workers == 0 {
        workers = num_cpus::get();
    }

    let workload = Workload::new(
        &[("M", m), ("N", n), ("K", k)],
        vec![
            DataSpace::new("A", vec![vec![(0, 1)], vec![(2, 1)]]),
            DataSpace::new("B", vec![vec![(2, 1)], vec![(1, 1)]]),
            DataSpace::new("C", vec![vec![(0, 1)], vec![(1, 1)]]),
        ],
    );
    let candidates = build_candidates(m, n, k, pe, linked);
    if candidates.is_empty() {
        panic!("no candidate mappings for m={} pe={}", m, pe);
    }
    info!(
        "sweeping {} candidate mappings on {} workers",
        candidates.len(),
        workers
    );

    let chunk = ceil_div_usize(candidates.len(), workers);
    let best = thread::scope(|scope| {
        let mut handles = Vec::new();
        for slice in candidates.chunks(chunk) {
            let workload = &workload;
            handles.push(scope.spawn(move || {
                // one engine per worker, reset between candidates
                let mut engine = NestAnalysis::new();
                engine.approx_multicast = approx;
                let mut best: Option<(u64, usize)> = None;
                for (idx, candidate) in slice.iter().enumerate() {
                    engine.reset();
                    if let Err(e) = engine.init(workload, &candidate.nest) {
                        panic!("rejected candidate mapping: {}", e);
                    }
                    let tiles = match engine.working_sets() {
                        Ok(t) => t,
                        Err(e) => panic!("analysis failed: {}", e),
                    };
                    let score: u64 = tiles
                        .iter()
                        .filter_map(|per_ds| per_ds.last())
                        .map(|tile| tile.total_accesses())
                        .sum();
                    debug!(
                        "tile_m={} tile_n={}: {} outermost accesses",
                        candidate.tile_m, candidate.tile_n, score
                    );
                    match best {
                        Some((s, _)) if s <= score => {}
                        _ => best = Some((score, idx)),
                    }
                }
                best.map(|(score, idx)| (score, &slice[idx]))
            }));
        }
        let mut best: Option<(u64, &Candidate)> = None;
        for handle in handles {
            if let Ok(Some((score, candidate))) = handle.join().map_err(|_| ()) {
                match best {
                    Some((s, _)) if s <= score => {}
                    _ => best = Some((score, candidate)),
                }
            }
        }
        best
    });

    let (score, winner) = match best {
        Some(b) => b,
        None => panic!("sweep produced no results"),
    };
    info!(
        "best mapping: tile_m={} tile_n={} ({} outermost accesses)",
        winner.tile_m, winner.tile_n, score
    );

    let mut engine = NestAnalysis::new();
    engine.approx_multicast = approx;
    if let Err(e) = engine.init(&workload, &winner.nest) {
        panic!("re-analyzing winner failed: {}", e);
    }
    match engine.working_sets() {
        Ok(tiles) => {
            for (ds, per_ds) in tiles.iter().enumerate() {
                for (s, tile) in per_ds.iter().enumerate() {
                    info!(
                        "{} storage {}: working set {} ({}), {} accesses, multicast {:.2}, \
                         {} link transfers",
                        workload.data_spaces[ds].name,
                        s,
                        tile.size,
                        ByteSize::b(tile.size * SIZE_W as u64),
                        tile.total_accesses(),
                        tile.multicast_factor(),
                        tile.link_transfers
                    );
                }
            }
        }
        Err(e) => panic!("analysis failed: {}", e),
    }
    if dump {
        println!("{}", engine);
    }

    if let Some(path) = args.get_one::<PathBuf>("checkpoint") {
        let checkpoint = match engine.checkpoint() {
            Ok(ck) => ck,
            Err(e) => panic!("checkpoint failed: {}", e),
        };
        if let Err(e) = checkpoint.save(path) {
            panic!("saving checkpoint failed: {}", e);
        }
        info!("checkpoint written to {}", path.display());
    }
}
