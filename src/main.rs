use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use clap::Parser;
use colored::Colorize;
use rand::SeedableRng;
use rand::rngs::StdRng;

mod cli;
mod config;
mod errors;
mod flows;
mod ga;
mod individuals;
mod logger;
mod lru;
mod penalty;
mod solutions;
mod tsp;
mod utils;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("{}", error.to_string().red());
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), errors::SolverError> {
    let arguments = cli::Arguments::parse();
    println!("Received {arguments:?}");

    let mut problem = config::ProblemConfig::load(&arguments.problem, &arguments.problems_dir)?;
    problem.mutation_rate = arguments.mutation_rate;
    problem.reset_after = arguments.reset_after;
    problem.stuck_penalty_increase_rate = arguments.stuck_penalty_increase_rate;
    problem.local_search_batch = arguments.local_search_batch;
    problem.cache_limit = arguments.cache_limit;
    problem.fake_tsp_solver = arguments.fake_tsp_solver;
    let ctx = config::Context::new(problem);

    let seed = arguments.seed.unwrap_or_else(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos() as u64
    });
    let mut rng = StdRng::seed_from_u64(seed);

    let cancelled = Arc::new(AtomicBool::new(false));
    {
        let flag = cancelled.clone();
        if let Err(error) = ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed)) {
            eprintln!(
                "{}",
                format!("Interrupt handling unavailable: {error}").yellow(),
            );
        }
    }

    let mut logger = logger::Logger::new(arguments.log.as_deref())?;

    let start = Instant::now();
    let parameters = ga::Parameters::new(
        arguments.generations,
        arguments.population_size,
        arguments.verbose,
    );
    let mut algorithm = ga::GeneticAlgorithm::new(&ctx, parameters, cancelled);
    let best = algorithm.run(&mut rng, &mut logger)?;
    let elapsed = start.elapsed().as_secs_f64();

    let solution = best.decode(&ctx);
    let profit = -solution.cost(&ctx);
    let feasible = solution.feasible(&ctx);
    println!(
        "{} {profit:.2} ({}) in {elapsed:.2}s, last improved at generation {}",
        "Profit".bold(),
        if feasible {
            "feasible".green()
        } else {
            "infeasible".yellow()
        },
        algorithm.last_improved,
    );

    let result = logger::ResultJson {
        problem: ctx.config.problem.clone(),
        generations: arguments.generations,
        population_size: arguments.population_size,
        mutation_rate: ctx.config.mutation_rate,
        reset_after: ctx.config.reset_after,
        stuck_penalty_increase_rate: ctx.config.stuck_penalty_increase_rate,
        local_search_batch: ctx.config.local_search_batch,
        solution: logger::SolutionJson {
            profit,
            feasible,
            truck_paths: solution.truck_paths.clone(),
            drone_paths: solution.drone_paths.clone(),
        },
        time: elapsed,
        fake_tsp_solver: ctx.config.fake_tsp_solver,
        last_improved: algorithm.last_improved,
        extra: arguments.extra.clone(),
        cache_info: logger::CacheInfoJson {
            limit: ctx.config.cache_limit,
            individual: ctx.individual_counters(),
            tsp: ctx.tsp.counters(),
        },
    };
    logger::dump_results(&result, &arguments.dump);
    logger.flush();

    Ok(())
}
