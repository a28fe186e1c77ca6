//! Parallel scoring of traces against the class templates.
use log::debug;
use ndarray::{Array2, ArrayView2, Axis, concatenate, s};
use rayon::{
    ThreadPoolBuilder,
    iter::{IntoParallelIterator, ParallelIterator},
};

use crate::{
    Error,
    leakage_model::{Cipher, LeakageTarget},
    template::{artifacts::TemplateArtifacts, gaussian::Gaussian},
    util::worker_threads,
};

/// Number of key byte hypotheses.
pub const NUM_KEYS: usize = 256;

/// One Gaussian template per leakage class.
#[derive(Debug, Clone)]
pub struct TemplateSet {
    templates: Vec<Gaussian>,
}

impl TemplateSet {
    /// Builds the templates from the first `n_components` dimensions of the fitted class means
    /// and covariances.
    pub fn new(artifacts: &TemplateArtifacts, n_components: usize) -> Result<Self, Error> {
        let n = n_components.min(artifacts.means.ncols());
        let templates = artifacts
            .means
            .rows()
            .into_iter()
            .zip(artifacts.covariances.outer_iter())
            .map(|(mean, cov)| Gaussian::new(mean.slice(s![..n]), cov.slice(s![..n, ..n])))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { templates })
    }

    pub fn num_classes(&self) -> usize {
        self.templates.len()
    }

    /// Returns the dimension of the templates.
    pub fn dim(&self) -> usize {
        self.templates.first().map_or(0, Gaussian::dim)
    }

    /// Scores projected traces, one per row, against every key byte hypothesis.
    ///
    /// Entries whose density is zero are set to `floor`.
    pub fn score<C: Cipher>(
        &self,
        traces: ArrayView2<f64>,
        plaintexts: ArrayView2<u8>,
        target: &LeakageTarget<C>,
        floor: f64,
    ) -> Array2<f64> {
        debug_assert_eq!(traces.nrows(), plaintexts.nrows());
        debug_assert_eq!(self.num_classes(), target.num_classes());

        let mut scores = Array2::zeros((traces.nrows(), NUM_KEYS));
        let mut class_scores = vec![None; self.num_classes()];
        for ((trace, plaintext), mut row) in traces
            .rows()
            .into_iter()
            .zip(plaintexts.rows())
            .zip(scores.rows_mut())
        {
            class_scores.fill(None);
            for k in 0..NUM_KEYS {
                let class = target.classify(plaintext, k as u8);
                row[k] = *class_scores[class].get_or_insert_with(|| {
                    let log_density = self.templates[class].log_pdf(trace);
                    if log_density.exp() != 0. {
                        log_density
                    } else {
                        floor
                    }
                });
            }
        }
        scores
    }

    /// Scores projected traces against every key byte hypothesis, splitting the traces in
    /// contiguous batches over a pool of [`worker_threads`] threads.
    ///
    /// The returned rows follow the order of `traces`.
    pub fn par_score<C: Cipher>(
        &self,
        traces: ArrayView2<f64>,
        plaintexts: ArrayView2<u8>,
        target: &LeakageTarget<C>,
        floor: f64,
    ) -> Result<Array2<f64>, Error> {
        let num_threads = worker_threads();
        let batch_size = traces.nrows() / num_threads + 1;
        debug!("Scoring {} traces on {num_threads} threads", traces.nrows());

        let pool = ThreadPoolBuilder::new().num_threads(num_threads).build()?;
        let batches: Vec<Array2<f64>> = pool.install(|| {
            (0..num_threads)
                .into_par_iter()
                .map(|i| {
                    let start = (i * batch_size).min(traces.nrows());
                    let end = ((i + 1) * batch_size).min(traces.nrows());
                    self.score(
                        traces.slice(s![start..end, ..]),
                        plaintexts.slice(s![start..end, ..]),
                        target,
                        floor,
                    )
                })
                .collect()
        });

        let views: Vec<_> = batches.iter().map(|batch| batch.view()).collect();
        concatenate(Axis(0), &views).map_err(|e| Error::ShapeMismatch(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::{NUM_KEYS, TemplateSet};
    use crate::{
        leakage_model::{Aes, LeakageModel, LeakageTarget},
        template::artifacts::TemplateArtifacts,
    };
    use ndarray::{Array2, Array3, array};

    fn xor_bit_templates() -> TemplateSet {
        // Class 0 centered on -1, class 1 centered on 1, unit variance
        let artifacts = TemplateArtifacts {
            means: array![[-1., 0.], [1., 0.]],
            covariances: Array3::from_shape_fn((2, 2, 2), |(_, i, j)| if i == j { 1. } else { 0. }),
        };
        TemplateSet::new(&artifacts, 1).unwrap()
    }

    #[test]
    fn test_score() {
        let templates = xor_bit_templates();
        assert_eq!(templates.dim(), 1);

        let target = LeakageTarget::new(Aes, LeakageModel::XorBit, 0).unwrap();
        let traces = array![[1.], [-1.]];
        let plaintexts = array![[0x00u8], [0x80]];
        let scores = templates.score(traces.view(), plaintexts.view(), &target, 0.);

        let log_norm = -0.5 * (2. * std::f64::consts::PI).ln();
        // Trace 0 is in class 1 for keys 0x80.., trace 1 in class 1 for keys ..0x80
        assert!((scores[[0, 0x80]] - log_norm).abs() < 1e-12);
        assert!((scores[[0, 0x00]] - (log_norm - 2.)).abs() < 1e-12);
        assert!((scores[[1, 0x00]] - (log_norm - 2.)).abs() < 1e-12);
        assert!((scores[[1, 0xff]] - log_norm).abs() < 1e-12);
    }

    #[test]
    fn test_zero_density_floor() {
        let templates = xor_bit_templates();
        let target = LeakageTarget::new(Aes, LeakageModel::XorBit, 0).unwrap();
        let traces = array![[1e3]];
        let plaintexts = array![[0u8]];

        let clamped = templates.score(traces.view(), plaintexts.view(), &target, 0.);
        assert!(clamped.iter().all(|&s| s == 0.));
        let floored = templates.score(traces.view(), plaintexts.view(), &target, -1e3);
        assert!(floored.iter().all(|&s| s == -1e3));
    }

    #[test]
    fn test_par_score_keeps_order() {
        let templates = xor_bit_templates();
        let target = LeakageTarget::new(Aes, LeakageModel::XorBit, 0).unwrap();
        let traces = Array2::from_shape_fn((101, 1), |(i, _)| (i as f64 - 50.) / 25.);
        let plaintexts = Array2::from_shape_fn((101, 16), |(i, _)| (i * 37) as u8);

        let sequential = templates.score(traces.view(), plaintexts.view(), &target, 0.);
        let parallel = templates
            .par_score(traces.view(), plaintexts.view(), &target, 0.)
            .unwrap();
        assert_eq!(parallel.dim(), (101, NUM_KEYS));
        assert_eq!(parallel, sequential);
    }
}
