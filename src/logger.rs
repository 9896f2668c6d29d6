use std::fs::File;
use std::rc::Rc;

use colored::Colorize;
use serde::Serialize;

use crate::config::Context;
use crate::errors::SolverError;
use crate::individuals::Individual;
use crate::lru::CacheCounters;
use crate::penalty::{TIME, WEIGHT};
use crate::solutions::Delivery;

/// Per-generation CSV sink. A missing path turns every call into a no-op;
/// write failures are reported and swallowed so a full disk cannot kill a
/// run.
pub struct Logger {
    writer: Option<csv::Writer<File>>,
}

const HEADER: [&str; 10] = [
    "generation",
    "current_best",
    "population_best",
    "population_worst",
    "population_avg",
    "feasible_count",
    "time_fine_coeff",
    "weight_fine_coeff",
    "avg_time_violation",
    "avg_weight_violation",
];

impl Logger {
    pub fn new(path: Option<&str>) -> Result<Self, SolverError> {
        let writer = match path {
            None => None,
            Some(path) => {
                let mut writer = csv::WriterBuilder::new()
                    .flexible(true)
                    .from_path(path)
                    .map_err(|error| SolverError::Config {
                        path: path.to_string(),
                        source: Box::new(error),
                    })?;
                writer
                    .write_record(HEADER)
                    .map_err(|error| SolverError::Config {
                        path: path.to_string(),
                        source: Box::new(error),
                    })?;

                Some(writer)
            }
        };

        Ok(Self { writer })
    }

    pub fn log_generation(
        &mut self,
        ctx: &Context,
        generation: usize,
        current_best: Option<f64>,
        population: &[Rc<Individual>],
    ) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };

        let mut best = f64::INFINITY;
        let mut worst = f64::NEG_INFINITY;
        let mut total = 0.0;
        let mut feasible_count = 0usize;
        let mut violations = [0.0; 2];
        for individual in population {
            let cost = individual.penalized_cost(ctx);
            best = best.min(cost);
            worst = worst.max(cost);
            total += cost;

            if individual.feasible(ctx) {
                feasible_count += 1;
            }

            let violation = individual.decode(ctx).violation(ctx);
            violations[TIME] += violation[TIME];
            violations[WEIGHT] += violation[WEIGHT];
        }

        let count = population.len().max(1) as f64;
        let fines = ctx.penalty.fines();
        let record = [
            generation.to_string(),
            current_best.map_or_else(String::new, |cost| cost.to_string()),
            best.to_string(),
            worst.to_string(),
            (total / count).to_string(),
            feasible_count.to_string(),
            fines[TIME].to_string(),
            fines[WEIGHT].to_string(),
            (violations[TIME] / count).to_string(),
            (violations[WEIGHT] / count).to_string(),
        ];

        if let Err(error) = writer.write_record(&record) {
            eprintln!("{}", format!("Failed to write log row: {error}").yellow());
        }
    }

    /// Free-form event row; the CSV writer wraps the message in quotes as
    /// needed.
    pub fn log_message(&mut self, generation: usize, message: &str) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };

        if let Err(error) = writer.write_record([generation.to_string(), message.to_string()]) {
            eprintln!("{}", format!("Failed to write log row: {error}").yellow());
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            if let Err(error) = writer.flush() {
                eprintln!("{}", format!("Failed to flush log: {error}").yellow());
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SolutionJson {
    pub profit: f64,
    pub feasible: bool,
    pub truck_paths: Vec<Vec<Delivery>>,
    pub drone_paths: Vec<Vec<Vec<Delivery>>>,
}

#[derive(Debug, Serialize)]
pub struct CacheInfoJson {
    pub limit: usize,
    pub individual: CacheCounters,
    pub tsp: CacheCounters,
}

#[derive(Debug, Serialize)]
pub struct ResultJson {
    pub problem: String,
    pub generations: usize,
    pub population_size: usize,
    pub mutation_rate: f64,
    pub reset_after: usize,
    pub stuck_penalty_increase_rate: f64,
    pub local_search_batch: usize,
    pub solution: SolutionJson,
    pub time: f64,
    pub fake_tsp_solver: bool,
    pub last_improved: usize,
    pub extra: String,
    pub cache_info: CacheInfoJson,
}

/// Write the result to every `.json` dump target; other formats are
/// reported and skipped so the remaining sinks still run.
pub fn dump_results(result: &ResultJson, targets: &[String]) {
    for target in targets {
        if target.ends_with(".json") {
            let written = serde_json::to_string(result)
                .map_err(|error| error.to_string())
                .and_then(|data| std::fs::write(target, data).map_err(|error| error.to_string()));
            match written {
                Ok(()) => println!("{}", format!("Wrote results to {target}").green()),
                Err(error) => {
                    eprintln!("{}", format!("Failed to dump to {target}: {error}").yellow());
                }
            }
        } else {
            eprintln!(
                "{}",
                format!("Skipping dump target {target}: unsupported format").yellow(),
            );
        }
    }
}
