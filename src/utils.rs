use rand::Rng;

/// Absolute tolerance shared by every approximate comparison in the solver.
pub const TOLERANCE: f64 = 1e-4;

pub fn isclose(first: f64, second: f64) -> bool {
    (first - second).abs() < TOLERANCE
}

pub fn isclose_seq(first: &[f64], second: &[f64]) -> bool {
    first.len() == second.len()
        && first
            .iter()
            .zip(second.iter())
            .all(|(&f, &s)| isclose(f, s))
}

/// Equivalent to `max(0.0, ...values)`.
pub fn positive_max<I>(values: I) -> f64
where
    I: IntoIterator<Item = f64>,
{
    values.into_iter().fold(0.0, f64::max)
}

/// Round `number` up to `precision` decimal digits.
pub fn weird_round(number: f64, precision: i32) -> f64 {
    let factor = 10.0f64.powi(precision);
    (number * factor).ceil() / factor
}

/// Sample `count` distinct indices with probability proportional to `weights`.
///
/// Zero-weight indices are never drawn unless every remaining weight is zero,
/// in which case the draw falls back to a uniform choice.
pub fn weighted_random<R>(rng: &mut R, weights: &[f64], count: usize) -> Vec<usize>
where
    R: Rng + ?Sized,
{
    assert!(count <= weights.len());

    let mut remaining = Vec::from_iter(0..weights.len());
    let mut total = weights.iter().sum::<f64>();
    let mut results = Vec::with_capacity(count);
    for _ in 0..count {
        let picked = if total > 0.0 {
            let mut roll = rng.random::<f64>() * total;
            let mut picked = remaining.len() - 1;
            for (position, &index) in remaining.iter().enumerate() {
                roll -= weights[index];
                if roll <= 0.0 && weights[index] > 0.0 {
                    picked = position;
                    break;
                }
            }

            // Guard against floating-point drift selecting a zero weight.
            if weights[remaining[picked]] == 0.0 {
                picked = remaining
                    .iter()
                    .position(|&index| weights[index] > 0.0)
                    .unwrap_or(picked);
            }

            picked
        } else {
            rng.random_range(0..remaining.len())
        };

        let index = remaining.swap_remove(picked);
        total -= weights[index];
        results.push(index);
    }

    results
}

pub fn weighted_random_choice<R>(rng: &mut R, weights: &[f64]) -> usize
where
    R: Rng + ?Sized,
{
    weighted_random(rng, weights, 1)[0]
}
