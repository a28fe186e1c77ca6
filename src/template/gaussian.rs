use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use std::f64::consts::PI;

use crate::Error;

/// Relative threshold under which eigenvalues of a covariance matrix are considered null.
const EIGENVALUE_CUTOFF: f64 = 1e6 * f64::EPSILON;

/// Multivariate normal distribution tolerating singular covariance matrices.
///
/// The density is evaluated with the pseudo-inverse and the pseudo-determinant of the
/// covariance. Points outside the support, i.e. away from the mean along a null direction of
/// the covariance, have a zero density.
#[derive(Debug, Clone)]
pub struct Gaussian {
    mean: Array1<f64>,
    /// Eigenvectors of the support scaled by the inverse square root of their eigenvalue, one
    /// per row
    whitening: Array2<f64>,
    /// Eigenvectors of the null space, one per row
    null_space: Array2<f64>,
    /// Logarithm of the normalization constant
    log_norm: f64,
    eps: f64,
}

impl Gaussian {
    /// # Panics
    /// Panics in debug if `cov` is not a square matrix of the size of `mean`.
    pub fn new(mean: ArrayView1<f64>, cov: ArrayView2<f64>) -> Result<Self, Error> {
        let dim = mean.len();
        debug_assert_eq!(cov.dim(), (dim, dim));

        let matrix = DMatrix::from_fn(dim, dim, |i, j| 0.5 * (cov[[i, j]] + cov[[j, i]]));
        let eigen = SymmetricEigen::try_new(matrix, f64::EPSILON, 0).ok_or_else(|| {
            Error::NumericalError("covariance decomposition did not converge".to_string())
        })?;

        let max_abs = eigen
            .eigenvalues
            .iter()
            .fold(0f64, |max, value| max.max(value.abs()));
        let eps = EIGENVALUE_CUTOFF * max_abs;

        let (support, null): (Vec<usize>, Vec<usize>) =
            (0..dim).partition(|&k| eigen.eigenvalues[k] > eps);

        let whitening = Array2::from_shape_fn((support.len(), dim), |(row, j)| {
            let k = support[row];
            eigen.eigenvectors[(j, k)] / eigen.eigenvalues[k].sqrt()
        });
        let null_space =
            Array2::from_shape_fn((null.len(), dim), |(row, j)| eigen.eigenvectors[(j, null[row])]);
        let log_pdet: f64 = support.iter().map(|&k| eigen.eigenvalues[k].ln()).sum();
        let log_norm = -0.5 * (support.len() as f64 * (2. * PI).ln() + log_pdet);

        Ok(Self {
            mean: mean.to_owned(),
            whitening,
            null_space,
            log_norm,
            eps,
        })
    }

    /// Returns the natural logarithm of the density at `x`.
    pub fn log_pdf(&self, x: ArrayView1<f64>) -> f64 {
        let delta = &x - &self.mean;

        if !self.null_space.is_empty() {
            let residual = self.null_space.dot(&delta);
            if residual.dot(&residual).sqrt() >= self.eps {
                return f64::NEG_INFINITY;
            }
        }

        let whitened = self.whitening.dot(&delta);
        self.log_norm - 0.5 * whitened.dot(&whitened)
    }

    /// Returns the rank of the covariance matrix.
    pub fn rank(&self) -> usize {
        self.whitening.nrows()
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }
}

#[cfg(test)]
mod tests {
    use super::Gaussian;
    use ndarray::{Array2, array};
    use std::f64::consts::PI;

    #[test]
    fn test_standard_normal() {
        let gaussian = Gaussian::new(array![0., 0.].view(), Array2::eye(2).view()).unwrap();

        assert_eq!(gaussian.rank(), 2);
        assert!((gaussian.log_pdf(array![0., 0.].view()) + (2. * PI).ln()).abs() < 1e-12);
        assert!(
            (gaussian.log_pdf(array![1., 2.].view()) + (2. * PI).ln() + 2.5).abs() < 1e-12
        );
    }

    #[test]
    fn test_correlated() {
        // Variances 4 and 9, correlation 0.5
        let cov = array![[4., 3.], [3., 9.]];
        let gaussian = Gaussian::new(array![1., -1.].view(), cov.view()).unwrap();

        // det = 27, inverse = [[9, -3], [-3, 4]] / 27
        let x = array![2., 1.];
        let maha = (9. * 1. - 2. * 3. * 1. * 2. + 4. * 4.) / 27.;
        let expected = -0.5 * (2. * (2. * PI).ln() + 27f64.ln() + maha);
        assert!((gaussian.log_pdf(x.view()) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_singular() {
        // Degenerate along the second axis
        let cov = array![[2., 0.], [0., 0.]];
        let gaussian = Gaussian::new(array![0., 1.].view(), cov.view()).unwrap();
        assert_eq!(gaussian.rank(), 1);

        let expected = -0.5 * ((2. * PI).ln() + 2f64.ln() + 1. / 2.);
        assert!((gaussian.log_pdf(array![1., 1.].view()) - expected).abs() < 1e-12);
        assert_eq!(gaussian.log_pdf(array![1., 1.5].view()), f64::NEG_INFINITY);
    }

    #[test]
    fn test_zero_covariance() {
        let gaussian = Gaussian::new(array![0., 0.].view(), Array2::zeros((2, 2)).view()).unwrap();

        assert_eq!(gaussian.rank(), 0);
        assert_eq!(gaussian.log_pdf(array![0., 0.].view()), f64::NEG_INFINITY);
    }
}
