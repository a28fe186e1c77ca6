use nalgebra::{DMatrix, SVD};
use ndarray::{Array2, ArrayView2, Axis, s};

use crate::{Error, template::artifacts::PcaArtifacts};

/// Fits a PCA basis over the rows of `x`, keeping `n_components` components at most.
///
/// Components are sorted by decreasing explained variance. The sign of each component is fixed
/// so that the largest coefficient of its projection of `x` is positive.
pub fn fit(x: ArrayView2<f64>, n_components: usize) -> Result<PcaArtifacts, Error> {
    let (n_rows, n_features) = x.dim();
    let mean = x
        .mean_axis(Axis(0))
        .ok_or_else(|| Error::ShapeMismatch("PCA requires at least one row".to_string()))?;
    let centered = &x - &mean;

    let matrix = DMatrix::from_fn(n_rows, n_features, |i, j| centered[[i, j]]);
    let svd = SVD::try_new(matrix, true, true, f64::EPSILON, 0)
        .ok_or_else(|| Error::NumericalError("PCA decomposition did not converge".to_string()))?;
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Err(Error::NumericalError(
            "PCA decomposition is missing singular vectors".to_string(),
        ));
    };

    let mut order: Vec<usize> = (0..svd.singular_values.len()).collect();
    order.sort_by(|&a, &b| svd.singular_values[b].total_cmp(&svd.singular_values[a]));
    order.truncate(n_components);

    let mut components = Array2::zeros((order.len(), n_features));
    for (row, &k) in order.iter().enumerate() {
        let u_k = u.column(k);
        let pivot = u_k.iter().copied().fold(0f64, |best, value| {
            if value.abs() > best.abs() { value } else { best }
        });
        let sign = if pivot < 0. { -1. } else { 1. };
        for j in 0..n_features {
            components[[row, j]] = sign * v_t[(k, j)];
        }
    }

    Ok(PcaArtifacts { components, mean })
}

/// Projects traces, one per row, on the first `n_components` components.
pub fn transform(x: ArrayView2<f64>, pca: &PcaArtifacts, n_components: usize) -> Array2<f64> {
    let n = n_components.min(pca.components.nrows());
    let components = pca.components.slice(s![..n, ..]);

    (&x - &pca.mean).dot(&components.t())
}
