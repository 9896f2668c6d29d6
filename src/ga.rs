use std::collections::HashSet;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use indicatif::{ProgressBar, ProgressStyle};
use rand::Rng;

use crate::config::Context;
use crate::errors::SolverError;
use crate::individuals::{Genetic, Individual};
use crate::logger::Logger;
use crate::utils::weighted_random;

#[derive(Clone, Copy, Debug)]
pub struct Parameters {
    pub generations: usize,
    pub population_size: usize,
    /// Offspring are produced until the population reaches this size; at
    /// least twice the population size.
    pub expansion_limit: usize,
    pub verbose: bool,
}

impl Parameters {
    pub fn new(generations: usize, population_size: usize, verbose: bool) -> Self {
        Self {
            generations,
            population_size,
            expansion_limit: 2 * population_size,
            verbose,
        }
    }
}

/// Keeper of the running best. Feasible candidates always beat infeasible
/// ones and are only ever replaced by cheaper feasible candidates, so the
/// running best improves monotonically once feasibility is reached.
pub struct BestTracker {
    best: Option<Rc<Individual>>,
}

impl BestTracker {
    fn new() -> Self {
        Self { best: None }
    }

    pub fn best(&self) -> Option<&Rc<Individual>> {
        self.best.as_ref()
    }

    pub fn offer(&mut self, ctx: &Context, candidate: &Rc<Individual>) {
        let replace = match &self.best {
            None => true,
            Some(current) => {
                let current_feasible = current.feasible(ctx);
                if candidate.feasible(ctx) == current_feasible {
                    candidate.cost(ctx) < current.cost(ctx)
                } else {
                    !current_feasible
                }
            }
        };

        if replace {
            self.best = Some(candidate.clone());
        }
    }
}

/// Hook slots invoked around each generation. The tracker doubles as the
/// best-so-far updater: offering a candidate can only improve the running
/// best.
pub struct HookArgs<'h> {
    pub generation: usize,
    pub last_improved: usize,
    pub population: &'h [Rc<Individual>],
}

pub type Hook<'a> = Box<dyn FnMut(&Context, &HookArgs<'_>, &mut Logger, &mut BestTracker) + 'a>;

/// The population: insertion-ordered, de-duplicated by object identity
/// (structural duplicates already collapse in the intern table).
struct Population {
    items: Vec<Rc<Individual>>,
    seen: HashSet<*const Individual>,
}

impl Population {
    fn new() -> Self {
        Self {
            items: vec![],
            seen: HashSet::new(),
        }
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn items(&self) -> &[Rc<Individual>] {
        &self.items
    }

    fn insert(&mut self, individual: Rc<Individual>) -> bool {
        if self.seen.insert(Rc::as_ptr(&individual)) {
            self.items.push(individual);
            true
        } else {
            false
        }
    }

    /// Ranked view by penalized cost; stable, so equal ranks keep insertion
    /// order.
    fn ranked(&self, ctx: &Context) -> Vec<Rc<Individual>> {
        let mut items = self.items.clone();
        items.sort_by(|first, second| {
            first
                .penalized_cost(ctx)
                .total_cmp(&second.penalized_cost(ctx))
        });
        items
    }

    /// Keep the best feasible half, then fill from the infeasible queue in
    /// rank order, then any remaining feasible individuals.
    fn select(&mut self, ctx: &Context, size: usize) {
        let (feasible, infeasible): (Vec<_>, Vec<_>) = self
            .ranked(ctx)
            .into_iter()
            .partition(|individual| individual.feasible(ctx));

        let mut kept = Vec::with_capacity(size);
        let mut feasible = feasible.into_iter();
        kept.extend(feasible.by_ref().take(size.div_ceil(2)));
        kept.extend(infeasible.into_iter().take(size - kept.len()));
        if kept.len() < size {
            kept.extend(feasible.take(size - kept.len()));
        }

        self.replace(kept);
    }

    fn truncate(&mut self, ctx: &Context, size: usize) {
        let mut ranked = self.ranked(ctx);
        ranked.truncate(size);
        self.replace(ranked);
    }

    fn replace(&mut self, items: Vec<Rc<Individual>>) {
        self.seen = items.iter().map(Rc::as_ptr).collect();
        self.items = items;
    }
}

pub struct GeneticAlgorithm<'a> {
    ctx: &'a Context,
    parameters: Parameters,
    cancelled: Arc<AtomicBool>,
    pub before_generation: Option<Hook<'a>>,
    pub after_generation: Option<Hook<'a>>,
    /// Generation index of the last improvement, readable after the run.
    pub last_improved: usize,
}

impl<'a> GeneticAlgorithm<'a> {
    pub fn new(ctx: &'a Context, parameters: Parameters, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            ctx,
            parameters,
            cancelled,
            before_generation: None,
            after_generation: None,
            last_improved: 0,
        }
    }

    /// Run the configured number of generations and return the best
    /// individual found. An interrupt observed at the top of a generation
    /// ends the run early with the running best intact.
    pub fn run<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        logger: &mut Logger,
    ) -> Result<Rc<Individual>, SolverError> {
        let ctx = self.ctx;
        let parameters = self.parameters;

        let seeds = Individual::initial(ctx, rng, parameters.population_size)?;
        let mut population = Population::new();
        let mut tracker = BestTracker::new();
        for seed in seeds {
            tracker.offer(ctx, &seed);
            population.insert(seed);
        }

        let bar = if parameters.verbose {
            ProgressBar::new(parameters.generations as u64)
        } else {
            ProgressBar::hidden()
        };
        bar.set_style(
            ProgressStyle::with_template("{msg} {wide_bar} {pos}/{len} [{elapsed_precise}]")
                .unwrap(),
        );

        let mut last_improved = 0;
        for generation in 0..parameters.generations {
            if self.cancelled.load(Ordering::Relaxed) {
                logger.log_message(generation, "interrupted");
                break;
            }

            let cost_before = tracker.best().map(|best| best.cost(ctx));

            if let Some(hook) = self.before_generation.as_mut() {
                let args = HookArgs {
                    generation,
                    last_improved,
                    population: population.items(),
                };
                hook(ctx, &args, logger, &mut tracker);
            }

            ctx.penalty.tune(ctx, population.items());

            // Expansion samples parents from one shared ranked snapshot.
            let ranked = population.ranked(ctx);
            let weights: Vec<f64> = (0..ranked.len())
                .map(|rank| 1.0 + 1.0 / (2.0 * rank as f64 + 1.0))
                .collect();
            let mut stalled = 0;
            while ranked.len() >= 2 && population.len() < parameters.expansion_limit {
                let parents = weighted_random(rng, &weights, 2);
                let offspring =
                    ranked[parents[0]].crossover(ctx, &ranked[parents[1]], rng);

                let mut inserted = false;
                for child in offspring {
                    tracker.offer(ctx, &child);
                    let child = child.mutate(ctx, rng).educate(ctx);
                    inserted |= population.insert(child);
                }

                // Tiny problems can run out of fresh structures.
                stalled = if inserted { 0 } else { stalled + 1 };
                if stalled > 16 * parameters.expansion_limit {
                    break;
                }
            }

            for individual in population.items() {
                if individual.feasible(ctx) {
                    tracker.offer(ctx, individual);
                }
            }

            population.select(ctx, parameters.population_size);

            let cost_after = tracker.best().map(|best| best.cost(ctx));
            let improved = match (cost_before, cost_after) {
                (None, Some(_)) => true,
                (Some(before), Some(after)) => after < before,
                _ => false,
            };

            if improved {
                last_improved = generation;
            } else if generation > last_improved
                && (generation - last_improved) % ctx.config.reset_after.max(1) == 0
            {
                reset_protocol(ctx, rng, &mut population, &mut tracker, generation, logger);
            }

            logger.log_generation(
                ctx,
                generation,
                tracker.best().map(|best| best.cost(ctx)),
                population.items(),
            );

            if let Some(hook) = self.after_generation.as_mut() {
                let args = HookArgs {
                    generation,
                    last_improved,
                    population: population.items(),
                };
                hook(ctx, &args, logger, &mut tracker);
            }

            if let Some(best) = tracker.best() {
                bar.set_message(format!("GA ({:.2})", best.cost(ctx)));
            }
            bar.inc(1);
        }

        bar.finish_and_clear();
        self.last_improved = last_improved;

        Ok(tracker
            .best()
            .cloned()
            .expect("the population is never empty"))
    }
}

/// Stagnation remedy: inflate every stuck penalty, reinsert the running
/// best, then spend the local-search budget on individuals never searched
/// before, drawn tail-heavy by rank.
fn reset_protocol<R: Rng + ?Sized>(
    ctx: &Context,
    rng: &mut R,
    population: &mut Population,
    tracker: &mut BestTracker,
    generation: usize,
    logger: &mut Logger,
) {
    let config = &ctx.config;
    for individual in population.items() {
        individual.inflate_stuck_penalty(config.stuck_penalty_increase_rate);
    }

    if let Some(best) = tracker.best() {
        population.insert(best.clone());
    }

    let size_before = population.len();

    let mut candidates = vec![];
    let mut weights = vec![];
    for (rank, individual) in population.ranked(ctx).into_iter().enumerate() {
        if !individual.was_local_searched() {
            weights.push(rank as f64 + 1.0);
            candidates.push(individual);
        }
    }

    let batch = config.local_search_batch.min(candidates.len());
    for index in weighted_random(rng, &weights, batch) {
        let mut current = candidates[index].clone();
        for _ in 0..2 {
            for prioritize_feasible in [false, true] {
                current = current.local_search(ctx, prioritize_feasible);
            }
        }

        tracker.offer(ctx, &current);
        population.insert(current);
    }

    population.truncate(ctx, size_before);
    logger.log_message(
        generation,
        "reset: stuck penalties inflated, local search batch applied",
    );
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use crate::config::Context;
    use crate::config::fixtures::small_config;
    use crate::logger::Logger;

    use super::{GeneticAlgorithm, Parameters};

    fn quick_context() -> Context {
        let mut config = small_config(1, 1);
        config.reset_after = 3;
        config.local_search_batch = 2;
        Context::new(config)
    }

    #[test]
    fn test_run_returns_feasible_best() {
        let ctx = quick_context();
        let mut rng = StdRng::seed_from_u64(42);
        let mut logger = Logger::new(None).unwrap();

        let cancelled = Arc::new(AtomicBool::new(false));
        let mut algorithm =
            GeneticAlgorithm::new(&ctx, Parameters::new(12, 8, false), cancelled);
        let best = algorithm.run(&mut rng, &mut logger).unwrap();

        // The small instance is easily feasible: a single truck can cover
        // every lower bound on its own.
        assert!(best.feasible(&ctx));
        assert!(best.decode(&ctx).assert_feasible(&ctx).is_ok());
    }

    #[test]
    fn test_running_best_is_monotone() {
        let ctx = quick_context();
        let mut rng = StdRng::seed_from_u64(7);
        let mut logger = Logger::new(None).unwrap();

        let history = Rc::new(RefCell::new(vec![]));
        let recorded = history.clone();

        let cancelled = Arc::new(AtomicBool::new(false));
        let mut algorithm =
            GeneticAlgorithm::new(&ctx, Parameters::new(10, 8, false), cancelled);
        algorithm.after_generation = Some(Box::new(move |ctx, _, _, tracker| {
            if let Some(best) = tracker.best() {
                if best.feasible(ctx) {
                    recorded.borrow_mut().push(best.cost(ctx));
                }
            }
        }));

        algorithm.run(&mut rng, &mut logger).unwrap();

        let history = history.borrow();
        for window in history.windows(2) {
            assert!(window[1] <= window[0] + 1e-9);
        }
    }

    #[test]
    fn test_interrupt_returns_best_so_far() {
        let ctx = quick_context();
        let mut rng = StdRng::seed_from_u64(3);
        let mut logger = Logger::new(None).unwrap();

        let cancelled = Arc::new(AtomicBool::new(false));
        cancelled.store(true, Ordering::Relaxed);

        let mut algorithm =
            GeneticAlgorithm::new(&ctx, Parameters::new(1000, 8, false), cancelled);
        let best = algorithm.run(&mut rng, &mut logger).unwrap();

        // Cancellation before the first generation still yields a decodable
        // individual from the seeds.
        best.decode(&ctx);
    }

    #[test]
    fn test_hooks_observe_population() {
        let ctx = quick_context();
        let mut rng = StdRng::seed_from_u64(11);
        let mut logger = Logger::new(None).unwrap();

        let calls = Rc::new(RefCell::new(0usize));
        let before_calls = calls.clone();

        let cancelled = Arc::new(AtomicBool::new(false));
        let mut algorithm =
            GeneticAlgorithm::new(&ctx, Parameters::new(4, 8, false), cancelled);
        algorithm.before_generation = Some(Box::new(move |_, args, _, _| {
            assert!(!args.population.is_empty());
            *before_calls.borrow_mut() += 1;
        }));

        algorithm.run(&mut rng, &mut logger).unwrap();
        assert_eq!(*calls.borrow(), 4);
    }
}
