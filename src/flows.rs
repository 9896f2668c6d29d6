use std::collections::{BTreeSet, VecDeque};

const EPSILON: f64 = 1e-9;
const CIRCULATION: f64 = 1e15;

#[derive(Clone, Copy)]
struct Arc {
    to: usize,
    forward: bool,
}

/// Residual arcs leaving each node, built in a fixed construction order so
/// that every augmentation scan is deterministic.
fn residual_arcs(size: usize, neighbors: &[BTreeSet<usize>]) -> Vec<Vec<Arc>> {
    let mut arcs = vec![vec![]; size];
    for (node, targets) in neighbors.iter().enumerate() {
        for &target in targets {
            arcs[node].push(Arc {
                to: target,
                forward: true,
            });
            arcs[target].push(Arc {
                to: node,
                forward: false,
            });
        }
    }

    arcs
}

fn flow_value(flows: &[Vec<f64>], source: usize) -> f64 {
    flows[source].iter().sum::<f64>() - flows.iter().map(|row| row[source]).sum::<f64>()
}

/// Maximum flow from `source` to `sink` via shortest augmenting paths.
///
/// `capacities[u][v]` is meaningful for every `v` in `neighbors[u]`; the flow
/// matrix returned is non-negative on those arcs and zero elsewhere.
pub fn maximum_flow(
    size: usize,
    capacities: &[Vec<f64>],
    neighbors: &[BTreeSet<usize>],
    source: usize,
    sink: usize,
) -> (f64, Vec<Vec<f64>>) {
    let arcs = residual_arcs(size, neighbors);
    let mut flows = vec![vec![0.0; size]; size];

    loop {
        let mut previous: Vec<Option<(usize, bool)>> = vec![None; size];
        previous[source] = Some((source, true));

        let mut queue = VecDeque::from([source]);
        'bfs: while let Some(node) = queue.pop_front() {
            for arc in &arcs[node] {
                let residual = if arc.forward {
                    capacities[node][arc.to] - flows[node][arc.to]
                } else {
                    flows[arc.to][node]
                };

                if residual > EPSILON && previous[arc.to].is_none() {
                    previous[arc.to] = Some((node, arc.forward));
                    if arc.to == sink {
                        break 'bfs;
                    }

                    queue.push_back(arc.to);
                }
            }
        }

        if previous[sink].is_none() {
            break;
        }

        let mut bottleneck = f64::INFINITY;
        let mut node = sink;
        while node != source {
            let (before, forward) = previous[node].unwrap();
            let residual = if forward {
                capacities[before][node] - flows[before][node]
            } else {
                flows[node][before]
            };

            bottleneck = bottleneck.min(residual);
            node = before;
        }

        let mut node = sink;
        while node != source {
            let (before, forward) = previous[node].unwrap();
            if forward {
                flows[before][node] += bottleneck;
            } else {
                flows[node][before] -= bottleneck;
            }

            node = before;
        }
    }

    (flow_value(&flows, source), flows)
}

/// Repeatedly push flow along the maximum-weight augmenting path (Bellman-Ford
/// over the residual graph, reverse arcs carrying negated weights) until no
/// augmenting path remains. Ties on path weight prefer the larger bottleneck.
///
/// `demands[u][v]` is the lower bound of the forward arc; `flows` must already
/// satisfy it and is never reduced below it.
fn augment_maximum_weight(
    size: usize,
    capacities: &[Vec<f64>],
    demands: &[Vec<f64>],
    flow_weights: &[Vec<f64>],
    neighbors: &[BTreeSet<usize>],
    flows: &mut [Vec<f64>],
    source: usize,
    sink: usize,
) {
    let arcs = residual_arcs(size, neighbors);

    loop {
        let mut distance = vec![f64::NEG_INFINITY; size];
        let mut bottleneck = vec![0.0; size];
        let mut previous: Vec<Option<(usize, bool)>> = vec![None; size];
        distance[source] = 0.0;
        bottleneck[source] = f64::INFINITY;

        for _ in 0..2 * size {
            let mut changed = false;
            for node in 0..size {
                if distance[node] == f64::NEG_INFINITY {
                    continue;
                }

                for arc in &arcs[node] {
                    let (residual, weight) = if arc.forward {
                        (
                            capacities[node][arc.to] - flows[node][arc.to],
                            flow_weights[node][arc.to],
                        )
                    } else {
                        (
                            flows[arc.to][node] - demands[arc.to][node],
                            -flow_weights[arc.to][node],
                        )
                    };

                    if residual <= EPSILON {
                        continue;
                    }

                    let candidate = distance[node] + weight;
                    let through = bottleneck[node].min(residual);
                    if candidate > distance[arc.to] + EPSILON
                        || ((candidate - distance[arc.to]).abs() <= EPSILON
                            && through > bottleneck[arc.to] + EPSILON)
                    {
                        distance[arc.to] = candidate;
                        bottleneck[arc.to] = through;
                        previous[arc.to] = Some((node, arc.forward));
                        changed = true;
                    }
                }
            }

            if !changed {
                break;
            }
        }

        if previous[sink].is_none() {
            break;
        }

        let amount = bottleneck[sink];
        let mut node = sink;
        while node != source {
            let (before, forward) = previous[node].unwrap();
            if forward {
                flows[before][node] += amount;
            } else {
                flows[node][before] -= amount;
            }

            node = before;
        }
    }
}

fn total_weight(
    size: usize,
    flow_weights: &[Vec<f64>],
    neighbors: &[BTreeSet<usize>],
    flows: &[Vec<f64>],
) -> f64 {
    let mut result = 0.0;
    for node in 0..size {
        for &target in &neighbors[node] {
            result += flow_weights[node][target] * flows[node][target];
        }
    }

    result
}

/// Maximum flow from `source` to `sink` maximizing the total arc-weighted
/// flow. Returns the weighted total together with the flow matrix.
pub fn maximum_weighted_flow(
    size: usize,
    capacities: &[Vec<f64>],
    neighbors: &[BTreeSet<usize>],
    flow_weights: &[Vec<f64>],
    source: usize,
    sink: usize,
) -> (f64, Vec<Vec<f64>>) {
    let demands = vec![vec![0.0; size]; size];
    let mut flows = vec![vec![0.0; size]; size];
    augment_maximum_weight(
        size,
        capacities,
        &demands,
        flow_weights,
        neighbors,
        &mut flows,
        source,
        sink,
    );

    (total_weight(size, flow_weights, neighbors, &flows), flows)
}

/// Two-phase maximum-weight flow with arc lower bounds.
///
/// Phase one reduces the lower bounds to a plain maximum-flow instance with a
/// super source/sink; `None` when the bounds admit no feasible flow. Phase two
/// grows the feasible flow along maximum-weight augmenting paths.
pub fn weighted_flows_with_demands(
    size: usize,
    demands: &[Vec<f64>],
    capacities: &[Vec<f64>],
    neighbors: &[BTreeSet<usize>],
    flow_weights: &[Vec<f64>],
    source: usize,
    sink: usize,
) -> Option<(f64, Vec<Vec<f64>>)> {
    let mut flows = vec![vec![0.0; size]; size];

    let mut excess = vec![0.0; size];
    let mut bounded = false;
    for node in 0..size {
        for &target in &neighbors[node] {
            let demand = demands[node][target];
            if demand > 0.0 {
                bounded = true;
                excess[target] += demand;
                excess[node] -= demand;
            }
        }
    }

    if bounded {
        let super_source = size;
        let super_sink = size + 1;
        let mut reduced = vec![vec![0.0; size + 2]; size + 2];
        let mut reduced_neighbors = vec![BTreeSet::new(); size + 2];
        for node in 0..size {
            for &target in &neighbors[node] {
                reduced[node][target] = capacities[node][target] - demands[node][target];
                reduced_neighbors[node].insert(target);
            }
        }

        let mut required = 0.0;
        for (node, &value) in excess.iter().enumerate() {
            if value > 0.0 {
                reduced[super_source][node] = value;
                reduced_neighbors[super_source].insert(node);
                required += value;
            } else if value < 0.0 {
                reduced[node][super_sink] = -value;
                reduced_neighbors[node].insert(super_sink);
            }
        }

        reduced[sink][source] = CIRCULATION;
        reduced_neighbors[sink].insert(source);

        let (feasible, reduced_flows) = maximum_flow(
            size + 2,
            &reduced,
            &reduced_neighbors,
            super_source,
            super_sink,
        );
        if feasible + EPSILON < required {
            return None;
        }

        for node in 0..size {
            for &target in &neighbors[node] {
                flows[node][target] = reduced_flows[node][target] + demands[node][target];
            }
        }
    }

    augment_maximum_weight(
        size,
        capacities,
        demands,
        flow_weights,
        neighbors,
        &mut flows,
        source,
        sink,
    );

    Some((total_weight(size, flow_weights, neighbors, &flows), flows))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use crate::utils::isclose;

    use super::{maximum_flow, maximum_weighted_flow, weighted_flows_with_demands};

    fn canonical_capacities() -> Vec<Vec<f64>> {
        vec![
            vec![0.0, 7.0, 0.0, 0.0, 4.0, 0.0],
            vec![0.0, 0.0, 5.0, 3.0, 0.0, 0.0],
            vec![0.0, 0.0, 0.0, 0.0, 0.0, 8.0],
            vec![0.0, 0.0, 3.0, 0.0, 0.0, 5.0],
            vec![0.0, 3.0, 0.0, 2.0, 0.0, 0.0],
            vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        ]
    }

    fn canonical_neighbors() -> Vec<BTreeSet<usize>> {
        vec![
            BTreeSet::from([1, 4]),
            BTreeSet::from([2, 3]),
            BTreeSet::from([5]),
            BTreeSet::from([2, 5]),
            BTreeSet::from([1, 3]),
            BTreeSet::new(),
        ]
    }

    fn check_valid_flow(flows: &[Vec<f64>]) {
        let size = flows.len();
        let mut total_out = vec![0.0; size];
        let mut total_in = vec![0.0; size];
        for first in 0..size {
            for second in 0..size {
                assert!(flows[first][second] >= 0.0);
                total_out[first] += flows[first][second];
                total_in[second] += flows[first][second];
            }
        }

        for index in 1..size - 1 {
            assert!(
                isclose(total_out[index], total_in[index]),
                "conservation violated at node {index}",
            );
        }
    }

    #[test]
    fn test_maximum_flow() {
        let (result, flows) = maximum_flow(6, &canonical_capacities(), &canonical_neighbors(), 0, 5);

        assert!(isclose(result, 10.0));
        check_valid_flow(&flows);
    }

    #[test]
    fn test_maximum_weighted_flow() {
        let flow_weights = vec![
            vec![0.0, 2.0, 0.0, 0.0, 1.0, 0.0],
            vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0],
            vec![0.0, 0.0, 0.0, 0.0, 0.0, 1.0],
            vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0],
            vec![0.0, 1.0, 0.0, 1.0, 0.0, 0.0],
            vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        ];

        let (result, flows) = maximum_weighted_flow(
            6,
            &canonical_capacities(),
            &canonical_neighbors(),
            &flow_weights,
            0,
            5,
        );

        assert!(isclose(result, 41.0));
        assert!(isclose(flows[0].iter().sum::<f64>(), 10.0));
        check_valid_flow(&flows);
    }

    #[test]
    fn test_weighted_flows_with_demands() {
        let demands = vec![vec![0.0; 6]; 6];
        let flow_weights = vec![
            vec![0.0, 1.0, 0.0, 0.0, 1.0, 0.0],
            vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0],
            vec![0.0, 0.0, 0.0, 0.0, 0.0, 1.0],
            vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0],
            vec![0.0, 1.0, 0.0, 1.0, 0.0, 0.0],
            vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        ];

        let packed = weighted_flows_with_demands(
            6,
            &demands,
            &canonical_capacities(),
            &canonical_neighbors(),
            &flow_weights,
            0,
            5,
        );

        let (result, flows) = packed.unwrap();
        assert!(isclose(result, 35.0));
        assert!(isclose(flows[0].iter().sum::<f64>(), 10.0));
        check_valid_flow(&flows);
    }

    #[test]
    fn test_flows_with_answers_as_demands() {
        let demands = vec![
            vec![0.0, 6.0, 0.0, 0.0, 4.0, 0.0],
            vec![0.0, 0.0, 5.0, 3.0, 0.0, 0.0],
            vec![0.0, 0.0, 0.0, 0.0, 0.0, 8.0],
            vec![0.0, 0.0, 3.0, 0.0, 0.0, 2.0],
            vec![0.0, 2.0, 0.0, 2.0, 0.0, 0.0],
            vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        ];
        let flow_weights = vec![
            vec![0.0, 1.0, 0.0, 0.0, 1.0, 0.0],
            vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0],
            vec![0.0, 0.0, 0.0, 0.0, 0.0, 1.0],
            vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0],
            vec![0.0, 1.0, 0.0, 1.0, 0.0, 0.0],
            vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        ];

        let packed = weighted_flows_with_demands(
            6,
            &demands,
            &canonical_capacities(),
            &canonical_neighbors(),
            &flow_weights,
            0,
            5,
        );

        let (result, flows) = packed.unwrap();
        assert!(isclose(result, 35.0));
        assert!(isclose(flows[0].iter().sum::<f64>(), 10.0));
        check_valid_flow(&flows);

        for first in 0..6 {
            for second in 0..6 {
                assert!(flows[first][second] >= demands[first][second] - 1e-9);
            }
        }
    }

    #[test]
    fn test_infeasible_demands() {
        // The arc 1 -> 2 cannot carry the 2 units that 0 -> 1 must deliver.
        let capacities = vec![
            vec![0.0, 2.0, 0.0],
            vec![0.0, 0.0, 1.0],
            vec![0.0, 0.0, 0.0],
        ];
        let demands = vec![
            vec![0.0, 2.0, 0.0],
            vec![0.0, 0.0, 0.0],
            vec![0.0, 0.0, 0.0],
        ];
        let neighbors = vec![
            BTreeSet::from([1]),
            BTreeSet::from([2]),
            BTreeSet::new(),
        ];
        let flow_weights = vec![vec![0.0; 3]; 3];

        let packed = weighted_flows_with_demands(
            3,
            &demands,
            &capacities,
            &neighbors,
            &flow_weights,
            0,
            2,
        );
        assert!(packed.is_none());
    }
}
