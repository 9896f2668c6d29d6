use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use crate::lru::{CacheCounters, LruCache};

/// Subsets up to this size (depot included) are ordered exactly.
const EXACT_LIMIT: usize = 12;

/// A memoized tour for one customer subset.
#[derive(Debug)]
pub struct PathOrder {
    /// Closed-tour length under the problem distance matrix.
    pub length: f64,
    /// Visit order starting at the depot, with a trailing depot appended.
    pub order: Vec<usize>,
    /// Whether a stronger ordering pass may still shorten the tour.
    pub improvable: bool,
}

/// LRU-memoized tour ordering keyed by the customer subset.
pub struct PathOrderCache {
    cache: RefCell<LruCache<Vec<usize>, Rc<PathOrder>>>,
    fake: bool,
}

impl PathOrderCache {
    pub fn new(limit: usize, fake: bool) -> Self {
        Self {
            cache: RefCell::new(LruCache::new(limit)),
            fake,
        }
    }

    /// `(length, tour)` for a subset containing the depot. Identical queries
    /// return the cached value verbatim.
    pub fn path_order(&self, distances: &[Vec<f64>], customers: &BTreeSet<usize>) -> Rc<PathOrder> {
        let key = Vec::from_iter(customers.iter().copied());
        assert_eq!(key.first(), Some(&0), "subset must contain the depot");

        if let Some(cached) = self.cache.borrow_mut().get(&key) {
            return cached;
        }

        let (mut order, improvable) = if self.fake {
            (key.clone(), false)
        } else if key.len() <= EXACT_LIMIT {
            (solve_exact(distances, &key), false)
        } else {
            let mut path = solve_nearest_neighbor(distances, &key);
            two_opt(distances, &mut path, false);
            (path, true)
        };

        let length = closed_tour_length(distances, &order);
        order.push(0);

        let entry = Rc::new(PathOrder {
            length,
            order,
            improvable,
        });
        self.cache.borrow_mut().put(key, entry.clone());
        entry
    }

    /// Re-solve an improvable entry with an exhaustive 2-opt pass and replace
    /// it in the cache. Exact and already-refined entries are returned as-is.
    pub fn refine(&self, distances: &[Vec<f64>], customers: &BTreeSet<usize>) -> Rc<PathOrder> {
        let entry = self.path_order(distances, customers);
        if !entry.improvable {
            return entry;
        }

        let mut path = entry.order[..entry.order.len() - 1].to_vec();
        two_opt(distances, &mut path, true);

        let length = closed_tour_length(distances, &path);
        path.push(0);

        let refined = Rc::new(PathOrder {
            length,
            order: path,
            improvable: false,
        });
        let key = Vec::from_iter(customers.iter().copied());
        self.cache.borrow_mut().put(key, refined.clone());
        refined
    }

    pub fn counters(&self) -> CacheCounters {
        self.cache.borrow().counters()
    }
}

fn closed_tour_length(distances: &[Vec<f64>], path: &[usize]) -> f64 {
    let mut length = 0.0;
    for index in 0..path.len() - 1 {
        length += distances[path[index]][path[index + 1]];
    }

    length + distances[*path.last().unwrap()][path[0]]
}

/// Held-Karp over the subset, fixed at the depot. `nodes` is sorted, so the
/// depot sits at index 0.
fn solve_exact(distances: &[Vec<f64>], nodes: &[usize]) -> Vec<usize> {
    let others = &nodes[1..];
    let m = others.len();
    if m < 2 {
        return nodes.to_vec();
    }

    let full = (1usize << m) - 1;
    let mut best = vec![vec![f64::INFINITY; m]; full + 1];
    let mut parent = vec![vec![usize::MAX; m]; full + 1];
    for (j, &node) in others.iter().enumerate() {
        best[1 << j][j] = distances[0][node];
    }

    for mask in 1..=full {
        for j in 0..m {
            if mask & (1 << j) == 0 || best[mask][j] == f64::INFINITY {
                continue;
            }

            for k in 0..m {
                if mask & (1 << k) != 0 {
                    continue;
                }

                let next = mask | (1 << k);
                let candidate = best[mask][j] + distances[others[j]][others[k]];
                if candidate < best[next][k] {
                    best[next][k] = candidate;
                    parent[next][k] = j;
                }
            }
        }
    }

    let mut last = 0;
    let mut optimum = f64::INFINITY;
    for j in 0..m {
        let candidate = best[full][j] + distances[others[j]][0];
        if candidate < optimum {
            optimum = candidate;
            last = j;
        }
    }

    let mut tour = Vec::with_capacity(m + 1);
    let mut mask = full;
    let mut current = last;
    loop {
        tour.push(others[current]);
        let before = parent[mask][current];
        mask &= !(1 << current);
        if before == usize::MAX {
            break;
        }

        current = before;
    }

    tour.push(0);
    tour.reverse();
    tour
}

fn solve_nearest_neighbor(distances: &[Vec<f64>], nodes: &[usize]) -> Vec<usize> {
    let mut remaining = nodes[1..].to_vec();
    let mut path = Vec::with_capacity(nodes.len());
    path.push(0);

    let mut current = 0;
    while !remaining.is_empty() {
        let mut nearest = 0;
        for (index, &node) in remaining.iter().enumerate() {
            if distances[current][node] < distances[current][remaining[nearest]] {
                nearest = index;
            }
        }

        current = remaining.swap_remove(nearest);
        path.push(current);
    }

    path
}

/// Greedy 2-opt over the closed tour `path` (depot at index 0, closure back to
/// the depot implied). A single sweep unless `exhaustive`.
fn two_opt(distances: &[Vec<f64>], path: &mut [usize], exhaustive: bool) {
    let n = path.len();
    if n < 4 {
        return;
    }

    loop {
        let mut improved = false;
        for i in 1..n - 1 {
            for j in i + 1..n {
                let before = path[i - 1];
                let after = if j == n - 1 { 0 } else { path[j + 1] };
                let delta = distances[before][path[j]] + distances[path[i]][after]
                    - distances[before][path[i]]
                    - distances[path[j]][after];
                if delta < -1e-9 {
                    path[i..=j].reverse();
                    improved = true;
                }
            }
        }

        if !exhaustive || !improved {
            break;
        }
    }
}
