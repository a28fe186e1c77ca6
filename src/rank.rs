//! Key rank evaluation of attack results.
//!
//! Scores are log-likelihoods of shape `(traces, hypotheses)`. They are summed over growing
//! prefixes of the traces, and the true hypothesis is ranked at each prefix length.
use itertools::{Itertools, MinMaxResult};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

/// Returns the rank of `true_key` in `scores`, 1 being the best.
///
/// Hypotheses scoring the same as the true key are not counted against it.
pub fn rank(scores: ArrayView1<f64>, true_key: usize) -> usize {
    let true_score = scores[true_key];
    1 + scores.iter().filter(|&&score| score > true_score).count()
}

/// Returns the rank of `true_key` after each trace, accumulating the log-likelihoods of the
/// previous traces.
///
/// # Panics
/// Panics if `true_key` is not lower than `loglik.ncols()`.
pub fn rank_curve(loglik: ArrayView2<f64>, true_key: usize) -> Array1<usize> {
    assert!(true_key < loglik.ncols());

    let mut scores = Array1::zeros(loglik.ncols());
    loglik
        .rows()
        .into_iter()
        .map(|row| {
            scores += &row;
            rank(scores.view(), true_key)
        })
        .collect()
}

/// Returns the margin of the true key score over the best other hypothesis, normalized by the
/// spread of all the scores.
///
/// A positive value means the true key is ranked first. Returns 0 when all the scores are equal.
pub fn guessing_distance(scores: ArrayView1<f64>, true_key: usize) -> f64 {
    let best_other = scores
        .iter()
        .enumerate()
        .filter(|&(k, _)| k != true_key)
        .map(|(_, &score)| score)
        .fold(f64::NEG_INFINITY, f64::max);

    match scores.iter().minmax() {
        MinMaxResult::MinMax(&min, &max) if max > min => {
            (scores[true_key] - best_other) / (max - min)
        }
        _ => 0.,
    }
}

/// Evaluates the log-likelihoods of one attack, returning its rank curve and the guessing
/// distance of the final cumulative scores.
pub fn evaluate(loglik: ArrayView2<f64>, true_key: usize) -> (Array1<usize>, f64) {
    let ranks = rank_curve(loglik, true_key);
    let distance = guessing_distance(loglik.sum_axis(Axis(0)).view(), true_key);

    (ranks, distance)
}

/// Stacks rank curves as rows, truncating them to the shortest one.
pub fn stack_curves(curves: &[Array1<usize>]) -> Array2<usize> {
    let len = curves.iter().map(|curve| curve.len()).min().unwrap_or(0);

    Array2::from_shape_fn((curves.len(), len), |(i, j)| curves[i][j])
}

/// Returns the mean rank at each prefix length over the rank curves stacked in `ranks`.
///
/// Returns an empty curve when `ranks` has no row.
pub fn guessing_entropy(ranks: ArrayView2<usize>) -> Array1<f64> {
    ranks
        .mapv(|rank| rank as f64)
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(0))
}

/// Returns the fraction of attacks ranking the true key first at each prefix length.
pub fn success_rate(ranks: ArrayView2<usize>) -> Array1<f64> {
    ranks
        .mapv(|rank| if rank == 1 { 1. } else { 0. })
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(0))
}

/// Returns the number of traces from which the guessing entropy stays at 1, or `None` if it
/// never settles.
pub fn guessing_entropy_to_one(guessing_entropy: ArrayView1<f64>) -> Option<usize> {
    let unsettled = guessing_entropy.iter().rposition(|&ge| ge > 1.);
    match unsettled {
        None if guessing_entropy.is_empty() => None,
        None => Some(1),
        Some(i) if i + 1 < guessing_entropy.len() => Some(i + 2),
        Some(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{
        evaluate, guessing_distance, guessing_entropy, guessing_entropy_to_one, rank_curve,
        stack_curves, success_rate,
    };
    use ndarray::{Array1, Array2, array};

    #[test]
    fn test_rank_curve() {
        let loglik = array![
            [0., -1., -3., -5.],
            [0., -2., -1., -4.],
            [-1., 0., -2., -3.],
        ];

        assert_eq!(rank_curve(loglik.view(), 0), array![1, 1, 1]);
        assert_eq!(rank_curve(loglik.view(), 3), array![4, 4, 4]);
        // [-3, -4] after two traces, then [-4, -6]
        assert_eq!(rank_curve(loglik.view(), 2), array![3, 3, 3]);
    }

    #[test]
    fn test_guessing_distance() {
        assert_eq!(guessing_distance(array![-1., -3., -6., -12.].view(), 0), 2. / 11.);
        assert_eq!(guessing_distance(array![-1., -3., -6., -12.].view(), 1), -2. / 11.);
        assert_eq!(guessing_distance(array![2., 2., 2.].view(), 1), 0.);

        let (ranks, distance) = evaluate(array![[0., -1.], [0., -1.]].view(), 1);
        assert_eq!(ranks, array![2, 2]);
        assert_eq!(distance, -1.);
    }

    #[test]
    fn test_guessing_entropy() {
        let ranks = stack_curves(&[array![1, 2, 3], array![3, 2, 1, 1]]);

        assert_eq!(ranks, array![[1, 2, 3], [3, 2, 1]]);
        assert_eq!(guessing_entropy(ranks.view()), array![2., 2., 2.]);
        assert_eq!(success_rate(ranks.view()), array![0.5, 0., 0.5]);
        assert_eq!(guessing_entropy(Array2::zeros((0, 3)).view()).len(), 0);
    }

    #[test]
    fn test_guessing_entropy_to_one() {
        assert_eq!(guessing_entropy_to_one(array![3., 1.5, 1., 1.].view()), Some(3));
        assert_eq!(guessing_entropy_to_one(array![1., 2., 1.].view()), Some(3));
        assert_eq!(guessing_entropy_to_one(array![1., 1.].view()), Some(1));
        assert_eq!(guessing_entropy_to_one(array![1., 2.].view()), None);
        assert_eq!(guessing_entropy_to_one(Array1::zeros(0).view()), None);
    }
}
