use std::cell::OnceCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use crate::config::Context;
use crate::errors::InfeasibleSolution;
use crate::individuals::Individual;
use crate::penalty::{TIME, WEIGHT};
use crate::utils::isclose;

/// One stop on a trip: customer index and delivered quantity.
pub type Delivery = (usize, u64);

/// A decoded individual: ordered trips with delivered quantities.
///
/// Every trip begins and ends with `(0, 0)`. Distances, revenue and the
/// violation vector are computed on demand and memoized; the penalized cost
/// is recomputed on every call because the fine coefficients move between
/// generations.
#[derive(Debug)]
pub struct Solution {
    pub truck_paths: Vec<Vec<Delivery>>,
    pub drone_paths: Vec<Vec<Vec<Delivery>>>,

    truck_distances: OnceCell<Vec<f64>>,
    drone_distances: OnceCell<Vec<Vec<f64>>>,
    revenue: OnceCell<f64>,
    violation: OnceCell<[f64; 2]>,
}

impl PartialEq for Solution {
    fn eq(&self, other: &Self) -> bool {
        self.truck_paths == other.truck_paths && self.drone_paths == other.drone_paths
    }
}

impl Eq for Solution {}

impl Solution {
    pub fn new(truck_paths: Vec<Vec<Delivery>>, drone_paths: Vec<Vec<Vec<Delivery>>>) -> Self {
        debug_assert!(
            truck_paths
                .iter()
                .chain(drone_paths.iter().flatten())
                .all(|path| path.first() == Some(&(0, 0)) && path.last() == Some(&(0, 0))),
            "every trip must begin and end at the depot",
        );

        Self {
            truck_paths,
            drone_paths,
            truck_distances: OnceCell::new(),
            drone_distances: OnceCell::new(),
            revenue: OnceCell::new(),
            violation: OnceCell::new(),
        }
    }

    fn path_distance(ctx: &Context, path: &[Delivery]) -> f64 {
        let distances = &ctx.config.distances;
        let mut result = 0.0;
        for index in 0..path.len() - 1 {
            result += distances[path[index].0][path[index + 1].0];
        }

        result
    }

    fn path_weight(path: &[Delivery]) -> u64 {
        path.iter().map(|&(_, quantity)| quantity).sum()
    }

    pub fn truck_distances(&self, ctx: &Context) -> &[f64] {
        self.truck_distances.get_or_init(|| {
            self.truck_paths
                .iter()
                .map(|path| Self::path_distance(ctx, path))
                .collect()
        })
    }

    pub fn truck_distance(&self, ctx: &Context) -> f64 {
        self.truck_distances(ctx).iter().sum()
    }

    pub fn drone_distances(&self, ctx: &Context) -> &[Vec<f64>] {
        self.drone_distances.get_or_init(|| {
            self.drone_paths
                .iter()
                .map(|paths| {
                    paths
                        .iter()
                        .map(|path| Self::path_distance(ctx, path))
                        .collect()
                })
                .collect()
        })
    }

    pub fn drone_distance(&self, ctx: &Context) -> f64 {
        self.drone_distances(ctx)
            .iter()
            .map(|distances| distances.iter().sum::<f64>())
            .sum()
    }

    pub fn revenue(&self, ctx: &Context) -> f64 {
        *self.revenue.get_or_init(|| {
            let customers = &ctx.config.customers;
            self.truck_paths
                .iter()
                .chain(self.drone_paths.iter().flatten())
                .flatten()
                .map(|&(customer, quantity)| (customers[customer].w * quantity) as f64)
                .sum()
        })
    }

    /// Total delivered to each customer across every trip.
    pub fn delivered(&self, ctx: &Context) -> Vec<u64> {
        let mut totals = vec![0; ctx.config.customers.len()];
        for path in self.truck_paths.iter().chain(self.drone_paths.iter().flatten()) {
            for &(customer, quantity) in path {
                totals[customer] += quantity;
            }
        }

        totals
    }

    /// Vehicle cost minus revenue. Minimizing this maximizes profit.
    pub fn base_cost(&self, ctx: &Context) -> f64 {
        let config = &ctx.config;
        config.truck.cost_per_distance * self.truck_distance(ctx)
            + config.drone.cost_per_distance * self.drone_distance(ctx)
            - self.revenue(ctx)
    }

    /// `(time, weight)` violation vector, in natural units.
    pub fn violation(&self, ctx: &Context) -> [f64; 2] {
        *self.violation.get_or_init(|| {
            let config = &ctx.config;

            let mut time = 0.0;
            for &distance in self.truck_distances(ctx) {
                time += (distance / config.truck.speed - config.working_time_limit).max(0.0);
            }
            for distances in self.drone_distances(ctx) {
                for &distance in distances {
                    time += (distance / config.drone.speed - config.drone.trip_time_limit).max(0.0);
                }

                let total = distances.iter().sum::<f64>();
                time += (total / config.drone.speed - config.working_time_limit).max(0.0);
            }

            let mut weight = 0.0;
            for path in &self.truck_paths {
                weight += Self::path_weight(path).saturating_sub(config.truck.capacity) as f64;
            }
            for path in self.drone_paths.iter().flatten() {
                weight += Self::path_weight(path).saturating_sub(config.drone.capacity) as f64;
            }
            for (customer, &total) in self.delivered(ctx).iter().enumerate() {
                let profile = &config.customers[customer];
                weight += profile.low.saturating_sub(total) as f64;
                weight += total.saturating_sub(profile.high) as f64;
            }

            [time, weight]
        })
    }

    /// Penalized cost: base cost plus the fined violation vector.
    pub fn cost(&self, ctx: &Context) -> f64 {
        let violation = self.violation(ctx);
        self.base_cost(ctx)
            + ctx.penalty.fine(TIME) * violation[TIME]
            + ctx.penalty.fine(WEIGHT) * violation[WEIGHT]
    }

    pub fn feasible(&self, ctx: &Context) -> bool {
        let violation = self.violation(ctx);
        isclose(violation[TIME], 0.0) && isclose(violation[WEIGHT], 0.0)
    }

    /// List every violated constraint. Used by tests and post-run checks.
    pub fn assert_feasible(&self, ctx: &Context) -> Result<(), InfeasibleSolution> {
        let config = &ctx.config;
        let mut violations = vec![];

        for (truck, path) in self.truck_paths.iter().enumerate() {
            let load = Self::path_weight(path);
            if load > config.truck.capacity {
                violations.push(format!(
                    "truck {truck} carries {load} over its capacity {}",
                    config.truck.capacity,
                ));
            }
        }

        for (truck, &distance) in self.truck_distances(ctx).iter().enumerate() {
            let time = distance / config.truck.speed;
            if time > config.working_time_limit + crate::utils::TOLERANCE {
                violations.push(format!(
                    "truck {truck} works {time:.4} over the limit {}",
                    config.working_time_limit,
                ));
            }
        }

        for (drone, paths) in self.drone_paths.iter().enumerate() {
            let mut total = 0.0;
            for (sortie, path) in paths.iter().enumerate() {
                let load = Self::path_weight(path);
                if load > config.drone.capacity {
                    violations.push(format!(
                        "drone {drone} sortie {sortie} carries {load} over its capacity {}",
                        config.drone.capacity,
                    ));
                }

                let distance = Self::path_distance(ctx, path);
                total += distance;
                let time = distance / config.drone.speed;
                if time > config.drone.trip_time_limit + crate::utils::TOLERANCE {
                    violations.push(format!(
                        "drone {drone} sortie {sortie} flies {time:.4} over the limit {}",
                        config.drone.trip_time_limit,
                    ));
                }
            }

            let time = total / config.drone.speed;
            if time > config.working_time_limit + crate::utils::TOLERANCE {
                violations.push(format!(
                    "drone {drone} works {time:.4} over the limit {}",
                    config.working_time_limit,
                ));
            }
        }

        for (customer, &total) in self.delivered(ctx).iter().enumerate() {
            let profile = &config.customers[customer];
            if total < profile.low || total > profile.high {
                violations.push(format!(
                    "customer {customer} receives {total} outside [{}, {}]",
                    profile.low, profile.high,
                ));
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(InfeasibleSolution { violations })
        }
    }

}

/// Re-encoding a solution into the individual that owns it, implemented on
/// `Rc<Solution>` so the solution can ride along unchanged.
pub trait Encode {
    fn encode(&self, ctx: &Context, create_new: bool) -> Rc<Individual>;
}

impl Encode for Rc<Solution> {
    /// The individual owning this solution's route structure. `create_new`
    /// bypasses the intern table and attaches this very solution to the
    /// returned individual.
    fn encode(&self, ctx: &Context, create_new: bool) -> Rc<Individual> {
        let truck_paths: Vec<BTreeSet<usize>> = self
            .truck_paths
            .iter()
            .map(|path| path.iter().map(|&(customer, _)| customer).collect())
            .collect();
        let drone_paths: Vec<Vec<BTreeSet<usize>>> = self
            .drone_paths
            .iter()
            .map(|paths| {
                paths
                    .iter()
                    .map(|path| path.iter().map(|&(customer, _)| customer).collect())
                    .collect()
            })
            .collect();

        if create_new {
            Individual::preloaded(truck_paths, drone_paths, self.clone())
        } else {
            Individual::from_cache(ctx, truck_paths, drone_paths)
        }
    }
}
