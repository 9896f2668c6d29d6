use std::cell::{Cell, OnceCell, RefCell};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use rand::Rng;
use rand::seq::SliceRandom;

use crate::config::{Context, ProblemConfig};
use crate::errors::SolverError;
use crate::flows::{maximum_weighted_flow, weighted_flows_with_demands};
use crate::penalty::STUCK_PENALTY_CAP;
use crate::solutions::{Delivery, Encode, Solution};
use crate::utils::{weighted_random, weighted_random_choice};

/// A trip's customer subset. The depot is always a member.
pub type CustomerSet = BTreeSet<usize>;

/// Capacity stand-in for a trip -> customer arc in the decoding network.
const UNBOUNDED_ARC: f64 = 1e6;

/// A cached derivation of an individual: either the individual itself or
/// another one. Keeping the identity case out of the `Rc` avoids a
/// self-referential cycle.
#[derive(Clone)]
enum Variant {
    Identity,
    Other(Rc<Individual>),
}

/// A route structure: which customers each truck trip and each drone sortie
/// visits, without quantities. Decoding, education and local search results
/// are computed once and cached on the individual.
pub struct Individual {
    /// One customer set per truck; the position encodes the vehicle.
    pub truck_paths: Vec<CustomerSet>,
    /// Sorties per drone, canonically sorted; empty sorties are dropped.
    pub drone_paths: Vec<Vec<CustomerSet>>,

    decoded: RefCell<Option<Rc<Solution>>>,
    educated: RefCell<Option<Variant>>,
    searched: RefCell<[Option<Variant>; 2]>,
    truck_distances: OnceCell<Vec<f64>>,
    drone_distances: OnceCell<Vec<Vec<f64>>>,
    stuck_penalty: Cell<f64>,
    searched_once: Cell<bool>,
}

impl PartialEq for Individual {
    fn eq(&self, other: &Self) -> bool {
        self.truck_paths == other.truck_paths && self.drone_paths == other.drone_paths
    }
}

impl Eq for Individual {}

impl Hash for Individual {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.truck_paths.hash(state);
        self.drone_paths.hash(state);
    }
}

impl fmt::Debug for Individual {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Individual")
            .field("truck_paths", &self.truck_paths)
            .field("drone_paths", &self.drone_paths)
            .finish()
    }
}

fn with_depot(mut customers: CustomerSet) -> CustomerSet {
    customers.insert(0);
    customers
}

fn path_length(ctx: &Context, customers: &CustomerSet) -> f64 {
    if customers.len() <= 1 {
        0.0
    } else {
        ctx.path_order(customers).length
    }
}

impl Individual {
    fn raw(truck_paths: Vec<CustomerSet>, drone_paths: Vec<Vec<CustomerSet>>) -> Self {
        let truck_paths = truck_paths.into_iter().map(with_depot).collect();
        let drone_paths = drone_paths
            .into_iter()
            .map(|sorties| {
                let mut sorties: Vec<CustomerSet> = sorties
                    .into_iter()
                    .map(with_depot)
                    .filter(|sortie| sortie.len() > 1)
                    .collect();
                sorties.sort();
                sorties
            })
            .collect();

        Self {
            truck_paths,
            drone_paths,
            decoded: RefCell::new(None),
            educated: RefCell::new(None),
            searched: RefCell::new([None, None]),
            truck_distances: OnceCell::new(),
            drone_distances: OnceCell::new(),
            stuck_penalty: Cell::new(1.0),
            searched_once: Cell::new(false),
        }
    }

    /// Canonicalize and intern. Structurally equal inputs come back as the
    /// same object.
    pub fn from_cache(
        ctx: &Context,
        truck_paths: Vec<CustomerSet>,
        drone_paths: Vec<Vec<CustomerSet>>,
    ) -> Rc<Self> {
        ctx.intern(Rc::new(Self::raw(truck_paths, drone_paths)))
    }

    /// A fresh, non-interned individual owning `solution` as its decoded
    /// form.
    pub(crate) fn preloaded(
        truck_paths: Vec<CustomerSet>,
        drone_paths: Vec<Vec<CustomerSet>>,
        solution: Rc<Solution>,
    ) -> Rc<Self> {
        let individual = Self::raw(truck_paths, drone_paths);
        *individual.decoded.borrow_mut() = Some(solution);
        Rc::new(individual)
    }

    pub fn stuck_penalty(&self) -> f64 {
        self.stuck_penalty.get()
    }

    pub fn inflate_stuck_penalty(&self, rate: f64) {
        self.stuck_penalty
            .set((self.stuck_penalty.get() * rate).min(STUCK_PENALTY_CAP));
    }

    /// Whether local search has ever been applied to this individual. The
    /// flag survives selection and resets.
    pub fn was_local_searched(&self) -> bool {
        self.searched_once.get()
    }

    /// Trips in a fixed order: trucks, then each drone's sorties.
    fn flatten(&self) -> Vec<&CustomerSet> {
        self.truck_paths
            .iter()
            .chain(self.drone_paths.iter().flatten())
            .collect()
    }

    fn flatten_cloned(&self) -> Vec<CustomerSet> {
        self.flatten().into_iter().cloned().collect()
    }

    /// Rebuild an individual from a flattened trip list shaped like this one.
    fn reconstruct(&self, ctx: &Context, flattened: Vec<CustomerSet>) -> Rc<Self> {
        let mut trips = flattened.into_iter();
        let truck_paths: Vec<CustomerSet> = trips.by_ref().take(self.truck_paths.len()).collect();
        let drone_paths: Vec<Vec<CustomerSet>> = self
            .drone_paths
            .iter()
            .map(|sorties| trips.by_ref().take(sorties.len()).collect())
            .collect();

        Self::from_cache(ctx, truck_paths, drone_paths)
    }

    fn append_drone_path(&self, ctx: &Context, drone: usize, sortie: CustomerSet) -> Rc<Self> {
        let mut drone_paths = self.drone_paths.clone();
        drone_paths[drone].push(sortie);
        Self::from_cache(ctx, self.truck_paths.clone(), drone_paths)
    }

    pub fn truck_distances(&self, ctx: &Context) -> &[f64] {
        self.truck_distances.get_or_init(|| {
            self.truck_paths
                .iter()
                .map(|path| path_length(ctx, path))
                .collect()
        })
    }

    pub fn drone_distances(&self, ctx: &Context) -> &[Vec<f64>] {
        self.drone_distances.get_or_init(|| {
            self.drone_paths
                .iter()
                .map(|sorties| sorties.iter().map(|path| path_length(ctx, path)).collect())
                .collect()
        })
    }

    /// Tour length of every trip in flattened order, from the memoized
    /// per-vehicle distances.
    fn trip_lengths(&self, ctx: &Context) -> Vec<f64> {
        self.truck_distances(ctx)
            .iter()
            .copied()
            .chain(self.drone_distances(ctx).iter().flatten().copied())
            .collect()
    }

    pub fn cost(&self, ctx: &Context) -> f64 {
        self.decode(ctx).cost(ctx)
    }

    pub fn penalized_cost(&self, ctx: &Context) -> f64 {
        self.cost(ctx) + self.stuck_penalty.get()
    }

    pub fn feasible(&self, ctx: &Context) -> bool {
        self.decode(ctx).feasible(ctx)
    }

    /// Assign delivery quantities by a maximum-weight flow over a four-layer
    /// network (source, trips, customers, sink) and order each trip with the
    /// memoized solver. At most once per individual.
    ///
    /// Lower bounds enter the flow as sink-arc demands; when they admit no
    /// feasible flow the decoder falls back to the unconstrained
    /// maximum-weight flow and the shortfall surfaces as a weight violation.
    pub fn decode(&self, ctx: &Context) -> Rc<Solution> {
        if let Some(solution) = self.decoded.borrow().as_ref() {
            return solution.clone();
        }

        let config = &ctx.config;
        let customers_count = config.customers.len() - 1;
        let sorties: Vec<&CustomerSet> = self.drone_paths.iter().flatten().collect();
        let trips = config.trucks_count + sorties.len();

        let size = trips + customers_count + 2;
        let source = 0;
        let sink = size - 1;
        let offset = trips + 1;

        let mut capacities = vec![vec![0.0; size]; size];
        let mut demands = vec![vec![0.0; size]; size];
        let mut flow_weights = vec![vec![0.0; size]; size];
        let mut neighbors = vec![BTreeSet::new(); size];

        for (trip, set) in self
            .truck_paths
            .iter()
            .chain(sorties.iter().copied())
            .enumerate()
        {
            let node = 1 + trip;
            let capacity = if trip < config.trucks_count {
                config.truck.capacity
            } else {
                config.drone.capacity
            };

            capacities[source][node] = capacity as f64;
            neighbors[source].insert(node);
            for &customer in set {
                if customer != 0 {
                    capacities[node][offset + customer - 1] = UNBOUNDED_ARC;
                    neighbors[node].insert(offset + customer - 1);
                }
            }
        }

        for customer in 1..=customers_count {
            let node = offset + customer - 1;
            let profile = &config.customers[customer];
            capacities[node][sink] = profile.high as f64;
            demands[node][sink] = profile.low as f64;
            flow_weights[node][sink] = profile.w as f64;
            neighbors[node].insert(sink);
        }

        let flows = match weighted_flows_with_demands(
            size,
            &demands,
            &capacities,
            &neighbors,
            &flow_weights,
            source,
            sink,
        ) {
            Some((_, flows)) => flows,
            None => {
                maximum_weighted_flow(size, &capacities, &neighbors, &flow_weights, source, sink).1
            }
        };

        let mut totals = vec![0u64; config.customers.len()];
        let mut complete_paths: Vec<Vec<Delivery>> = Vec::with_capacity(trips);
        for (trip, set) in self
            .truck_paths
            .iter()
            .chain(sorties.iter().copied())
            .enumerate()
        {
            let node = 1 + trip;
            let order = ctx.path_order(set);
            let mut path = Vec::with_capacity(order.order.len());
            for &customer in &order.order {
                if customer == 0 {
                    path.push((0, 0));
                } else {
                    let quantity = flows[node][offset + customer - 1].round() as u64;
                    totals[customer] += quantity;
                    path.push((customer, quantity));
                }
            }

            complete_paths.push(path);
        }

        redistribute_lower_bounds(config, &mut complete_paths, &mut totals);

        let mut remaining = complete_paths.into_iter();
        let truck_paths: Vec<Vec<Delivery>> =
            remaining.by_ref().take(config.trucks_count).collect();
        let drone_paths: Vec<Vec<Vec<Delivery>>> = self
            .drone_paths
            .iter()
            .map(|sorties| remaining.by_ref().take(sorties.len()).collect())
            .collect();

        let solution = Rc::new(Solution::new(truck_paths, drone_paths));
        *self.decoded.borrow_mut() = Some(solution.clone());
        solution
    }

    /// Seed a population of `size` route structures.
    ///
    /// The first third saturates every vehicle with the full customer set and
    /// a growing sortie count, the second splits far customers onto trucks
    /// and near ones onto single-customer sorties, the rest derives variants
    /// by merging sorties and mutating random bases. Every seed passes
    /// through the canonicalizing cache.
    pub fn initial<R: Rng + ?Sized>(
        ctx: &Context,
        rng: &mut R,
        size: usize,
    ) -> Result<Vec<Rc<Self>>, SolverError> {
        let config = &ctx.config;
        let customers_count = config.customers.len() - 1;
        let full: CustomerSet = (0..=customers_count).collect();
        let third = size / 3;

        let mut results: Vec<Rc<Self>> = vec![];

        let mut copies = 0;
        while results.len() < third.max(1) {
            let truck_paths = vec![full.clone(); config.trucks_count];
            let drone_paths = vec![vec![full.clone(); copies]; config.drones_count];
            push_unique(&mut results, Self::from_cache(ctx, truck_paths, drone_paths));

            copies += 1;
            if copies > size {
                break;
            }
        }

        if config.drones_count > 0 && customers_count >= 2 {
            let mut by_distance = Vec::from_iter(1..=customers_count);
            by_distance
                .sort_by(|&f, &s| config.distances[0][s].total_cmp(&config.distances[0][f]));
            let half = customers_count / 2;
            let far: CustomerSet = std::iter::once(0)
                .chain(by_distance[..half].iter().copied())
                .collect();
            let near = &by_distance[half..];

            let mut attempts = 0;
            while results.len() < 2 * third && attempts < size.max(8) {
                attempts += 1;

                let truck_paths = vec![far.clone(); config.trucks_count];
                let mut drone_paths = vec![vec![]; config.drones_count];
                for &customer in near {
                    let sorties =
                        config.customers[customer].low.div_ceil(config.drone.capacity) as usize + 1;
                    for _ in 0..sorties {
                        drone_paths[rng.random_range(0..config.drones_count)]
                            .push(CustomerSet::from([0, customer]));
                    }
                }

                push_unique(&mut results, Self::from_cache(ctx, truck_paths, drone_paths));
            }
        }

        let mut attempts = 0;
        while results.len() < size && attempts < 4 * size {
            attempts += 1;

            let base = results[rng.random_range(0..results.len())].clone();
            let mut references = vec![];
            let mut weights = vec![];
            for (drone, sorties) in base.drone_paths.iter().enumerate() {
                for (index, sortie) in sorties.iter().enumerate() {
                    references.push((drone, index));
                    weights.push(
                        sortie
                            .iter()
                            .map(|&customer| config.distances[0][customer])
                            .fold(0.0, f64::max),
                    );
                }
            }

            if references.len() < 2 {
                continue;
            }

            let picked = weighted_random(rng, &weights, 2);
            let (first_drone, first_index) = references[picked[0]];
            let (second_drone, second_index) = references[picked[1]];

            let mut drone_paths = base.drone_paths.clone();
            let merged: CustomerSet = drone_paths[first_drone][first_index]
                .union(&drone_paths[second_drone][second_index])
                .copied()
                .collect();
            drone_paths[first_drone][first_index] = merged;
            drone_paths[second_drone][second_index] = CustomerSet::from([0]);

            push_unique(
                &mut results,
                Self::from_cache(ctx, base.truck_paths.clone(), drone_paths),
            );
        }

        let mut attempts = 0;
        while results.len() < size && attempts < 256 * size {
            attempts += 1;
            let base = results[rng.random_range(0..results.len())].clone();
            push_unique(&mut results, base.mutate(ctx, rng));
        }

        if results.len() < size {
            return Err(SolverError::Initialization {
                message: format!(
                    "seeded only {} of {} individuals after {attempts} mutation attempts",
                    results.len(),
                    size,
                ),
            });
        }

        Ok(results)
    }
}

fn push_unique(results: &mut Vec<Rc<Individual>>, candidate: Rc<Individual>) {
    if !results
        .iter()
        .any(|existing| Rc::ptr_eq(existing, &candidate))
    {
        results.push(candidate);
    }
}

/// Shift surplus quantity toward customers short of their lower bound.
///
/// Customers are visited in index order; donors from the least profitable up;
/// only entries sharing a trip with the recipient may donate, so trip loads
/// never change. The first donor chain that fully patches a customer wins,
/// and a customer that cannot be patched ends the pass.
pub(crate) fn redistribute_lower_bounds(
    config: &ProblemConfig,
    complete_paths: &mut [Vec<Delivery>],
    totals: &mut [u64],
) {
    for customer in 1..config.customers.len() {
        let low = config.customers[customer].low;
        if totals[customer] >= low {
            continue;
        }

        let mut patched = false;
        'donors: for &donor in config.customers_by_profit.iter().rev() {
            if donor == customer {
                continue;
            }

            for path in complete_paths.iter_mut() {
                let Some(recipient) = path.iter().position(|&(c, _)| c == customer) else {
                    continue;
                };

                for index in 0..path.len() {
                    if path[index].0 != donor {
                        continue;
                    }

                    let shift = path[index]
                        .1
                        .min(low - totals[customer])
                        .min(totals[donor].saturating_sub(config.customers[donor].low));
                    if shift > 0 {
                        path[recipient].1 += shift;
                        path[index].1 -= shift;
                        totals[customer] += shift;
                        totals[donor] -= shift;
                    }

                    if totals[customer] == low {
                        patched = true;
                        break 'donors;
                    }
                }
            }
        }

        if !patched {
            break;
        }
    }
}

/// The genetic operators, implemented on `Rc<Individual>` so unchanged
/// results can be returned without copying.
pub trait Genetic {
    fn crossover<R: Rng + ?Sized>(
        &self,
        ctx: &Context,
        other: &Self,
        rng: &mut R,
    ) -> [Rc<Individual>; 2];

    fn mutate<R: Rng + ?Sized>(&self, ctx: &Context, rng: &mut R) -> Rc<Individual>;

    fn educate(&self, ctx: &Context) -> Rc<Individual>;

    fn local_search(&self, ctx: &Context, prioritize_feasible: bool) -> Rc<Individual>;
}

impl Genetic for Rc<Individual> {
    /// Single-point exchange over the flattened trip lists: one trip of each
    /// parent is replaced by a random two-way partition of their union.
    fn crossover<R: Rng + ?Sized>(
        &self,
        ctx: &Context,
        other: &Self,
        rng: &mut R,
    ) -> [Rc<Individual>; 2] {
        let mut self_paths = self.flatten_cloned();
        let mut other_paths = other.flatten_cloned();
        if self_paths.is_empty() || other_paths.is_empty() {
            return [self.clone(), other.clone()];
        }

        let first_index = rng.random_range(0..self_paths.len());
        let second_index = rng.random_range(0..other_paths.len());

        let mut first = CustomerSet::from([0]);
        let mut second = CustomerSet::from([0]);
        let union: Vec<usize> = self_paths[first_index]
            .union(&other_paths[second_index])
            .copied()
            .collect();
        for customer in union {
            if customer == 0 {
                continue;
            }

            if rng.random_bool(0.5) {
                first.insert(customer);
            } else {
                second.insert(customer);
            }
        }

        self_paths[first_index] = first;
        other_paths[second_index] = second;

        [
            self.reconstruct(ctx, self_paths),
            other.reconstruct(ctx, other_paths),
        ]
    }

    /// With probability `mutation_rate`, apply one of three structural moves;
    /// otherwise return self unchanged.
    fn mutate<R: Rng + ?Sized>(&self, ctx: &Context, rng: &mut R) -> Rc<Individual> {
        let config = &ctx.config;
        if rng.random::<f64>() >= config.mutation_rate {
            return self.clone();
        }

        let mut random_customers = Vec::from_iter(1..config.customers.len());
        random_customers.shuffle(rng);

        match rng.random_range(0..3) {
            0 => {
                // Drop a customer, preferring long trips.
                let mut paths = self.flatten_cloned();
                if paths.is_empty() {
                    return self.clone();
                }

                let lengths = self.trip_lengths(ctx);
                let index = weighted_random_choice(rng, &lengths);
                for &customer in &random_customers {
                    if paths[index].contains(&customer) {
                        paths[index].remove(&customer);
                        break;
                    }
                }

                self.reconstruct(ctx, paths)
            }
            1 => {
                // Add a customer, preferring short trips.
                let mut paths = self.flatten_cloned();
                if paths.is_empty() {
                    return self.clone();
                }

                let weights: Vec<f64> = self
                    .trip_lengths(ctx)
                    .into_iter()
                    .map(|length| if length > 0.0 { 1.0 / length } else { 1e9 })
                    .collect();
                let index = weighted_random_choice(rng, &weights);
                for &customer in &random_customers {
                    if !paths[index].contains(&customer) {
                        paths[index].insert(customer);
                        break;
                    }
                }

                self.reconstruct(ctx, paths)
            }
            _ => {
                // Open a sortie for the first customer a drone can reach
                // within its flight-time limit.
                if config.drones_count == 0 {
                    return self.clone();
                }

                for &customer in &random_customers {
                    if 2.0 * config.distances[0][customer]
                        <= config.drone.speed * config.drone.trip_time_limit
                    {
                        let drone = rng.random_range(0..config.drones_count);
                        return self.append_drone_path(ctx, drone, CustomerSet::from([0, customer]));
                    }
                }

                self.clone()
            }
        }
    }

    /// Deterministic improvement: refine any trip ordering the cache still
    /// marks improvable, then patch unmet lower bounds by redistribution.
    /// Returns an individual equivalent to self or better; idempotent.
    fn educate(&self, ctx: &Context) -> Rc<Individual> {
        if let Some(variant) = self.educated.borrow().as_ref() {
            return match variant {
                Variant::Identity => self.clone(),
                Variant::Other(educated) => educated.clone(),
            };
        }

        let config = &ctx.config;
        let solution = self.decode(ctx);

        let trip_sets = self.flatten();
        let solution_paths: Vec<&Vec<Delivery>> = solution
            .truck_paths
            .iter()
            .chain(solution.drone_paths.iter().flatten())
            .collect();

        let mut complete_paths: Vec<Vec<Delivery>> = Vec::with_capacity(trip_sets.len());
        for (&set, &path) in trip_sets.iter().zip(&solution_paths) {
            if set.len() > 1 && ctx.path_order(set).improvable {
                let refined = ctx.refine_path_order(set);
                let quantities: HashMap<usize, u64> = path
                    .iter()
                    .filter(|&&(customer, _)| customer != 0)
                    .copied()
                    .collect();
                complete_paths.push(
                    refined
                        .order
                        .iter()
                        .map(|&customer| {
                            if customer == 0 {
                                (0, 0)
                            } else {
                                (customer, quantities[&customer])
                            }
                        })
                        .collect(),
                );
            } else {
                complete_paths.push(path.clone());
            }
        }

        let mut totals = vec![0u64; config.customers.len()];
        for path in &complete_paths {
            for &(customer, quantity) in path {
                totals[customer] += quantity;
            }
        }

        redistribute_lower_bounds(config, &mut complete_paths, &mut totals);

        let mut remaining = complete_paths.into_iter();
        let truck_paths: Vec<Vec<Delivery>> =
            remaining.by_ref().take(config.trucks_count).collect();
        let drone_paths: Vec<Vec<Vec<Delivery>>> = self
            .drone_paths
            .iter()
            .map(|sorties| remaining.by_ref().take(sorties.len()).collect())
            .collect();
        let improved = Rc::new(Solution::new(truck_paths, drone_paths));

        if improved.cost(ctx) < solution.cost(ctx) {
            let educated = improved.encode(ctx, true);
            educated.stuck_penalty.set(self.stuck_penalty());
            *educated.educated.borrow_mut() = Some(Variant::Identity);
            *self.educated.borrow_mut() = Some(Variant::Other(educated.clone()));
            educated
        } else {
            *self.educated.borrow_mut() = Some(Variant::Identity);
            self.clone()
        }
    }

    /// Pick the penalized-cost minimum over the structural neighborhood:
    /// 3-way splits, extractions into fresh sorties, and pairwise swaps, in
    /// that enumeration order with first-encountered ties winning. Both the
    /// best-overall and the best-feasible neighbor are cached; an individual
    /// with no neighbors returns itself.
    fn local_search(&self, ctx: &Context, prioritize_feasible: bool) -> Rc<Individual> {
        let slot = usize::from(prioritize_feasible);
        self.searched_once.set(true);

        if let Some(variant) = self.searched.borrow()[slot].as_ref() {
            return match variant {
                Variant::Identity => self.clone(),
                Variant::Other(searched) => searched.clone(),
            };
        }

        let flattened = self.flatten_cloned();
        let path_count = flattened.len();

        let mut best: Option<(f64, Rc<Individual>)> = None;
        let mut best_feasible: Option<(f64, Rc<Individual>)> = None;
        let mut consider = |candidate: Rc<Individual>| {
            // A move can cancel itself out through canonicalization.
            if Rc::ptr_eq(&candidate, self) {
                return;
            }

            let cost = candidate.penalized_cost(ctx);
            if candidate.feasible(ctx)
                && best_feasible
                    .as_ref()
                    .is_none_or(|(feasible_cost, _)| cost < *feasible_cost)
            {
                best_feasible = Some((cost, candidate.clone()));
            }

            if best.as_ref().is_none_or(|(best_cost, _)| cost < *best_cost) {
                best = Some((cost, candidate));
            }
        };

        // Move one customer out of a trip and into two receivers at once.
        for source in 0..path_count {
            for first in 0..path_count {
                if first == source {
                    continue;
                }

                for second in 0..path_count {
                    if second == source || second == first {
                        continue;
                    }

                    for &customer in &flattened[source] {
                        if customer == 0
                            || flattened[first].contains(&customer)
                            || flattened[second].contains(&customer)
                        {
                            continue;
                        }

                        let mut neighbor = flattened.clone();
                        neighbor[source].remove(&customer);
                        neighbor[first].insert(customer);
                        neighbor[second].insert(customer);
                        consider(self.reconstruct(ctx, neighbor));
                    }
                }
            }
        }

        // Extract a customer from a pair of trips into a fresh sortie.
        if ctx.config.drones_count > 0 {
            for first in 0..path_count {
                for second in first + 1..path_count {
                    let union: Vec<usize> = flattened[first]
                        .union(&flattened[second])
                        .copied()
                        .filter(|&customer| customer != 0)
                        .collect();
                    for customer in union {
                        let mut neighbor = flattened.clone();
                        neighbor[first].remove(&customer);
                        neighbor[second].remove(&customer);
                        let stripped = self.reconstruct(ctx, neighbor);
                        for drone in 0..ctx.config.drones_count {
                            consider(stripped.append_drone_path(
                                ctx,
                                drone,
                                CustomerSet::from([0, customer]),
                            ));
                        }
                    }
                }
            }
        }

        // Swap a customer pair across two trips.
        for first in 0..path_count {
            for second in first + 1..path_count {
                for &f in flattened[first].difference(&flattened[second]) {
                    for &s in flattened[second].difference(&flattened[first]) {
                        let mut neighbor = flattened.clone();
                        neighbor[first].remove(&f);
                        neighbor[first].insert(s);
                        neighbor[second].remove(&s);
                        neighbor[second].insert(f);
                        consider(self.reconstruct(ctx, neighbor));
                    }
                }
            }
        }

        match best {
            None => {
                *self.searched.borrow_mut() = [Some(Variant::Identity), Some(Variant::Identity)];
                self.clone()
            }
            Some((_, overall)) => {
                let preferred = best_feasible
                    .map(|(_, feasible)| feasible)
                    .unwrap_or_else(|| overall.clone());

                overall.searched_once.set(true);
                preferred.searched_once.set(true);
                overall.searched.borrow_mut()[0] = Some(Variant::Identity);
                preferred.searched.borrow_mut()[1] = Some(Variant::Identity);

                {
                    let mut slots = self.searched.borrow_mut();
                    slots[0] = Some(Variant::Other(overall.clone()));
                    slots[1] = Some(Variant::Other(preferred.clone()));
                }

                if prioritize_feasible { preferred } else { overall }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::rc::Rc;

    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use crate::config::fixtures::{small_config, small_context};
    use crate::config::{Context, Customer, ProblemConfig, Vehicle};
    use crate::solutions::Encode;

    use super::{CustomerSet, Genetic, Individual};

    fn set(customers: &[usize]) -> CustomerSet {
        customers.iter().copied().collect()
    }

    #[test]
    fn test_canonicalization() {
        let ctx = small_context(1, 2);

        let first = Individual::from_cache(
            &ctx,
            vec![set(&[0, 1])],
            vec![vec![set(&[0, 2]), set(&[0, 3])], vec![set(&[0, 4])]],
        );
        // Permuted sorties, an empty sortie, and implicit depot membership.
        let second = Individual::from_cache(
            &ctx,
            vec![set(&[1])],
            vec![vec![set(&[0, 3]), set(&[0]), set(&[2])], vec![set(&[4])]],
        );

        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(first.drone_paths[0].len(), 2);
    }

    #[test]
    fn test_decode_shape() {
        let ctx = small_context(1, 1);
        let individual = Individual::from_cache(
            &ctx,
            vec![set(&[0, 1, 2])],
            vec![vec![set(&[0, 3]), set(&[0, 4])]],
        );

        let solution = individual.decode(&ctx);
        assert_eq!(solution.truck_paths.len(), 1);
        assert_eq!(solution.drone_paths.len(), 1);
        assert_eq!(solution.drone_paths[0].len(), 2);

        for path in solution
            .truck_paths
            .iter()
            .chain(solution.drone_paths.iter().flatten())
        {
            assert_eq!(path.first(), Some(&(0, 0)));
            assert_eq!(path.last(), Some(&(0, 0)));
        }

        // Deliveries respect capacities and the demand windows.
        let config = &ctx.config;
        for path in &solution.truck_paths {
            let load: u64 = path.iter().map(|&(_, q)| q).sum();
            assert!(load <= config.truck.capacity);
        }
        for path in solution.drone_paths.iter().flatten() {
            let load: u64 = path.iter().map(|&(_, q)| q).sum();
            assert!(load <= config.drone.capacity);
        }

        let totals = solution.delivered(&ctx);
        for (customer, profile) in config.customers.iter().enumerate() {
            assert!(totals[customer] >= profile.low);
            assert!(totals[customer] <= profile.high);
        }
    }

    #[test]
    fn test_decode_determinism() {
        let first_ctx = small_context(1, 1);
        let second_ctx = small_context(1, 1);

        let build = |ctx: &Context| {
            Individual::from_cache(
                ctx,
                vec![set(&[0, 1, 2])],
                vec![vec![set(&[0, 3]), set(&[0, 4])]],
            )
            .decode(ctx)
        };

        assert_eq!(*build(&first_ctx), *build(&second_ctx));
    }

    #[test]
    fn test_decode_prefers_profitable_customers() {
        // One truck with capacity 15 for customers asking 8 + 6 + 5 = 19 at
        // their upper bounds: the flow should saturate the profitable ones.
        let ctx = small_context(1, 0);
        let individual = Individual::from_cache(&ctx, vec![set(&[0, 1, 2, 3])], vec![]);

        let solution = individual.decode(&ctx);
        let totals = solution.delivered(&ctx);
        // w: customer 3 = 8, customer 1 = 5, customer 2 = 3.
        assert_eq!(totals[3], 5);
        assert_eq!(totals[1], 8);
        assert_eq!(totals[2], 2);
    }

    #[test]
    fn test_decode_shortfall_is_violation_not_error() {
        // Customer 4 wants at least 1 but nobody visits it.
        let ctx = small_context(1, 0);
        let individual = Individual::from_cache(&ctx, vec![set(&[0, 1, 2])], vec![]);

        let solution = individual.decode(&ctx);
        assert!(!solution.feasible(&ctx));
        assert!(solution.violation(&ctx)[crate::penalty::WEIGHT] >= 1.0);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let ctx = small_context(1, 1);
        let individual = Individual::from_cache(
            &ctx,
            vec![set(&[0, 1, 2])],
            vec![vec![set(&[0, 3]), set(&[0, 4])]],
        );

        let reencoded = individual.decode(&ctx).encode(&ctx, false);
        assert!(Rc::ptr_eq(&individual, &reencoded));
        assert_eq!(*reencoded.decode(&ctx), *individual.decode(&ctx));
    }

    #[test]
    fn test_crossover_shape() {
        let ctx = small_context(2, 1);
        let mut rng = StdRng::seed_from_u64(7);

        let first = Individual::from_cache(
            &ctx,
            vec![set(&[0, 1, 2]), set(&[0, 3])],
            vec![vec![set(&[0, 4])]],
        );
        let second = Individual::from_cache(
            &ctx,
            vec![set(&[0, 2]), set(&[0, 1, 4])],
            vec![vec![set(&[0, 3]), set(&[0, 1])]],
        );

        for _ in 0..20 {
            let offspring = first.crossover(&ctx, &second, &mut rng);
            assert_eq!(offspring.len(), 2);

            assert_eq!(offspring[0].truck_paths.len(), 2);
            assert_eq!(offspring[1].truck_paths.len(), 2);

            // Sortie counts can only shrink when a partition empties a trip.
            for (child, parent) in [(&offspring[0], &first), (&offspring[1], &second)] {
                assert_eq!(child.drone_paths.len(), parent.drone_paths.len());
                for (drone, sorties) in child.drone_paths.iter().enumerate() {
                    assert!(sorties.len() <= parent.drone_paths[drone].len());
                }
            }
        }
    }

    #[test]
    fn test_mutate_zero_rate_returns_self() {
        let mut config = small_config(1, 1);
        config.mutation_rate = 0.0;
        let ctx = Context::new(config);
        let mut rng = StdRng::seed_from_u64(0);

        let individual =
            Individual::from_cache(&ctx, vec![set(&[0, 1])], vec![vec![set(&[0, 2])]]);
        for _ in 0..10 {
            assert!(Rc::ptr_eq(&individual, &individual.mutate(&ctx, &mut rng)));
        }
    }

    #[test]
    fn test_mutate_always_returns_valid_structure() {
        let mut config = small_config(2, 2);
        config.mutation_rate = 1.0;
        let ctx = Context::new(config);
        let mut rng = StdRng::seed_from_u64(99);

        let mut current =
            Individual::from_cache(&ctx, vec![set(&[0, 1, 2]), set(&[0, 3])], vec![
                vec![set(&[0, 4])],
                vec![],
            ]);
        for _ in 0..100 {
            current = current.mutate(&ctx, &mut rng);
            assert_eq!(current.truck_paths.len(), 2);
            assert_eq!(current.drone_paths.len(), 2);
            for path in current.flatten() {
                assert!(path.contains(&0));
            }
        }
    }

    #[test]
    fn test_sortie_mutation_respects_flight_range() {
        // Flight range only reaches customers within distance 2 of the depot;
        // with every customer farther out, the sortie operator must no-op.
        let customers = vec![
            Customer {
                x: 50.0,
                y: 0.0,
                low: 0,
                high: 5,
                w: 1,
            },
            Customer {
                x: 0.0,
                y: 80.0,
                low: 0,
                high: 5,
                w: 1,
            },
        ];
        let mut config = ProblemConfig::from_parts(
            "range".to_string(),
            1,
            1,
            1000.0,
            Vehicle {
                speed: 1.0,
                capacity: 100,
                cost_per_distance: 1.0,
                trip_time_limit: f64::INFINITY,
            },
            Vehicle {
                speed: 1.0,
                capacity: 10,
                cost_per_distance: 0.1,
                trip_time_limit: 4.0,
            },
            customers,
        );
        config.mutation_rate = 1.0;
        let ctx = Context::new(config);
        let mut rng = StdRng::seed_from_u64(3);

        let individual = Individual::from_cache(&ctx, vec![set(&[0, 1, 2])], vec![vec![]]);
        for _ in 0..100 {
            let mutated = individual.mutate(&ctx, &mut rng);
            assert!(mutated.drone_paths[0].is_empty());
        }
    }

    #[test]
    fn test_educate_idempotent() {
        let ctx = small_context(1, 1);
        let individual = Individual::from_cache(
            &ctx,
            vec![set(&[0, 1, 2, 3])],
            vec![vec![set(&[0, 4])]],
        );

        let educated = individual.educate(&ctx);
        assert!(educated.cost(&ctx) <= individual.cost(&ctx));
        assert!(Rc::ptr_eq(&educated, &educated.educate(&ctx)));
        assert!(Rc::ptr_eq(&educated, &individual.educate(&ctx)));
    }

    #[test]
    fn test_educate_patches_lower_bounds() {
        // Customer 1's decode shortfall (low = 2) must be patched from a
        // donor on the same trip when the flow fallback leaves it short.
        let ctx = small_context(1, 0);
        let individual = Individual::from_cache(&ctx, vec![set(&[0, 1, 2, 3, 4])], vec![]);

        let solution = individual.educate(&ctx).decode(&ctx);
        let totals = solution.delivered(&ctx);
        assert!(totals[1] >= ctx.config.customers[1].low);
    }

    #[test]
    fn test_local_search_idempotent() {
        let ctx = small_context(1, 1);
        let individual =
            Individual::from_cache(&ctx, vec![set(&[0, 1, 2])], vec![vec![set(&[0, 3])]]);

        for prioritize_feasible in [false, true] {
            let searched = individual.local_search(&ctx, prioritize_feasible);
            assert!(Rc::ptr_eq(
                &searched,
                &searched.local_search(&ctx, prioritize_feasible),
            ));
            assert!(Rc::ptr_eq(
                &searched,
                &individual.local_search(&ctx, prioritize_feasible),
            ));
        }

        assert!(individual.was_local_searched());
    }

    #[test]
    fn test_local_search_without_neighbors_returns_self() {
        let ctx = small_context(1, 0);
        // A single trip has no receivers, no extraction pair, no swap pair.
        let individual = Individual::from_cache(&ctx, vec![set(&[0, 1])], vec![]);

        for prioritize_feasible in [false, true] {
            assert!(Rc::ptr_eq(
                &individual,
                &individual.local_search(&ctx, prioritize_feasible),
            ));
        }
    }

    #[test]
    fn test_local_search_feasible_preference() {
        let ctx = small_context(2, 1);
        let individual = Individual::from_cache(
            &ctx,
            vec![set(&[0, 1, 2, 4]), set(&[0, 3])],
            vec![vec![set(&[0, 2])]],
        );

        let preferred = individual.local_search(&ctx, true);
        let overall = individual.local_search(&ctx, false);

        // The overall variant is the neighborhood minimum; the preferred one
        // only differs when some neighbor is feasible.
        assert!(overall.penalized_cost(&ctx) <= preferred.penalized_cost(&ctx) + 1e-9);
        if !preferred.feasible(&ctx) {
            assert!(Rc::ptr_eq(&preferred, &overall));
        }
    }

    #[test]
    fn test_initial_population() {
        let ctx = small_context(1, 2);
        let mut rng = StdRng::seed_from_u64(1);

        let population = Individual::initial(&ctx, &mut rng, 12).unwrap();
        assert_eq!(population.len(), 12);

        for individual in &population {
            assert_eq!(individual.truck_paths.len(), 1);
            assert_eq!(individual.drone_paths.len(), 2);
        }

        // Seeds are distinct objects out of the canonicalizing cache.
        for (index, first) in population.iter().enumerate() {
            for second in &population[index + 1..] {
                assert!(!Rc::ptr_eq(first, second));
            }
        }
    }

    #[test]
    fn test_stuck_penalty_inflation() {
        let ctx = small_context(1, 0);
        let individual = Individual::from_cache(&ctx, vec![set(&[0, 1])], vec![]);

        assert_eq!(individual.stuck_penalty(), 1.0);
        individual.inflate_stuck_penalty(10.0);
        assert_eq!(individual.stuck_penalty(), 10.0);

        for _ in 0..20 {
            individual.inflate_stuck_penalty(10.0);
        }
        assert_eq!(individual.stuck_penalty(), 1e9);

        assert!(crate::utils::isclose(
            individual.penalized_cost(&ctx),
            individual.cost(&ctx) + 1e9,
        ));
    }
}
