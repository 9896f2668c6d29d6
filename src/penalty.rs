use std::rc::Rc;
use std::sync::atomic::Ordering;

use atomic_float::AtomicF64;

use crate::config::Context;
use crate::individuals::Individual;
use crate::utils::{isclose, positive_max};

/// Fine coefficients before the first per-generation tuning.
pub const INITIAL_FINE_COEFFICIENT: f64 = 1e3;

/// Upper bound for the per-individual stuck penalty.
pub const STUCK_PENALTY_CAP: f64 = 1e9;

/// Index of the time component in the violation vector.
pub const TIME: usize = 0;
/// Index of the weight component in the violation vector.
pub const WEIGHT: usize = 1;

/// The population-wide fine coefficients, retuned once per generation so the
/// penalties stay commensurate with the current cost spread.
pub struct PenaltyState {
    fine: [AtomicF64; 2],
}

impl PenaltyState {
    pub fn new() -> Self {
        Self {
            fine: [
                AtomicF64::new(INITIAL_FINE_COEFFICIENT),
                AtomicF64::new(INITIAL_FINE_COEFFICIENT),
            ],
        }
    }

    pub fn fine(&self, component: usize) -> f64 {
        self.fine[component].load(Ordering::Relaxed)
    }

    pub fn fines(&self) -> [f64; 2] {
        [self.fine(TIME), self.fine(WEIGHT)]
    }

    /// Retune both coefficients from the decoded population.
    ///
    /// With `base = max(worst - best, |worst + best|)` over the population's
    /// base costs and `v` the mean violation vector, a violation-free
    /// population gets `base` on both components; otherwise component `k`
    /// gets `base * v[k] / (v[0]^2 + v[1]^2)`, emphasizing whichever
    /// violation dominates.
    pub fn tune(&self, ctx: &Context, population: &[Rc<Individual>]) {
        if population.is_empty() {
            return;
        }

        let mut best = f64::INFINITY;
        let mut worst = f64::NEG_INFINITY;
        let mut sums = [0.0; 2];
        for individual in population {
            let solution = individual.decode(ctx);
            let cost = solution.base_cost(ctx);
            best = best.min(cost);
            worst = worst.max(cost);

            let violation = solution.violation(ctx);
            sums[TIME] += violation[TIME];
            sums[WEIGHT] += violation[WEIGHT];
        }

        let base = (worst - best).max((worst + best).abs());
        let count = population.len() as f64;
        let mean = [sums[TIME] / count, sums[WEIGHT] / count];
        if isclose(positive_max(mean), 0.0) {
            self.fine[TIME].store(base, Ordering::Relaxed);
            self.fine[WEIGHT].store(base, Ordering::Relaxed);
        } else {
            let norm = mean[TIME] * mean[TIME] + mean[WEIGHT] * mean[WEIGHT];
            self.fine[TIME].store(base * mean[TIME] / norm, Ordering::Relaxed);
            self.fine[WEIGHT].store(base * mean[WEIGHT] / norm, Ordering::Relaxed);
        }
    }
}

impl Default for PenaltyState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use crate::config::fixtures::small_context;
    use crate::individuals::Individual;
    use crate::utils::isclose;

    use super::{INITIAL_FINE_COEFFICIENT, TIME, WEIGHT};

    #[test]
    fn test_initial_fines() {
        let ctx = small_context(1, 1);
        assert_eq!(ctx.penalty.fine(TIME), INITIAL_FINE_COEFFICIENT);
        assert_eq!(ctx.penalty.fine(WEIGHT), INITIAL_FINE_COEFFICIENT);
    }

    #[test]
    fn test_tune_without_violations() {
        let ctx = small_context(1, 1);

        // Both individuals cover every customer comfortably, so violations
        // stay at zero and the coefficients collapse to the cost spread.
        let first = Individual::from_cache(
            &ctx,
            vec![BTreeSet::from([0, 1, 2, 3, 4])],
            vec![vec![]],
        );
        let second = Individual::from_cache(
            &ctx,
            vec![BTreeSet::from([0, 1, 2, 4])],
            vec![vec![BTreeSet::from([0, 3])]],
        );

        let population = vec![first.clone(), second.clone()];
        ctx.penalty.tune(&ctx, &population);

        let costs = [
            first.decode(&ctx).base_cost(&ctx),
            second.decode(&ctx).base_cost(&ctx),
        ];
        let best = costs[0].min(costs[1]);
        let worst = costs[0].max(costs[1]);
        let base = (worst - best).max((worst + best).abs());

        assert!(isclose(ctx.penalty.fine(TIME), base));
        assert!(isclose(ctx.penalty.fine(WEIGHT), base));
    }

    #[test]
    fn test_tune_with_violations() {
        let ctx = small_context(1, 0);

        // Customer 4 has a positive lower bound but is visited by nobody, so
        // the weight component dominates the retuned fines.
        let individual = Individual::from_cache(
            &ctx,
            vec![BTreeSet::from([0, 1, 2, 3])],
            vec![],
        );

        let population = vec![individual.clone()];
        ctx.penalty.tune(&ctx, &population);

        let solution = individual.decode(&ctx);
        let violation = solution.violation(&ctx);
        assert_eq!(violation[TIME], 0.0);
        assert!(violation[WEIGHT] > 0.0);

        let cost = solution.base_cost(&ctx);
        let base = (cost + cost).abs().max(0.0);
        let expected = base * violation[WEIGHT] / (violation[WEIGHT] * violation[WEIGHT]);
        assert!(isclose(ctx.penalty.fine(TIME), 0.0));
        assert!(isclose(ctx.penalty.fine(WEIGHT), expected));
    }
}
