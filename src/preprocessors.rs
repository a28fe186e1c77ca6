//! Numeric transforms applied to traces before classification.
use nalgebra::{Matrix3, Vector3};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};

use crate::processors::MeanVarOnline;

/// Default cutoff of [`highpass`], relative to the Nyquist frequency.
pub const DEFAULT_CUTOFF: f64 = 0.002;

/// Preprocessing shared by profiling and attack: optional aggregation of consecutive samples
/// followed by an optional high-pass filter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Preprocessor {
    /// Number of consecutive samples averaged together, 1 disables aggregation
    aggregate_n_samples: usize,
    /// High-pass filter cutoff
    cutoff: Option<f64>,
}

impl Preprocessor {
    /// # Arguments
    ///
    /// * `aggregate_n_samples` - Number of consecutive samples to average together
    /// * `filter` - Apply a high-pass filter with the [`DEFAULT_CUTOFF`]
    pub fn new(aggregate_n_samples: usize, filter: bool) -> Self {
        Self {
            aggregate_n_samples: aggregate_n_samples.max(1),
            cutoff: filter.then_some(DEFAULT_CUTOFF),
        }
    }

    /// Returns the number of samples of a preprocessed trace.
    pub fn output_size(&self, num_samples: usize) -> usize {
        if self.aggregate_n_samples > 1 {
            aggregated_size(num_samples, self.aggregate_n_samples)
        } else {
            num_samples
        }
    }

    /// Applies the preprocessing to traces, one per row.
    pub fn apply(&self, traces: ArrayView2<f64>) -> Array2<f64> {
        let traces = if self.aggregate_n_samples > 1 {
            aggregate(traces, self.aggregate_n_samples)
        } else {
            traces.to_owned()
        };

        match self.cutoff {
            Some(cutoff) => highpass(traces.view(), cutoff),
            None => traces,
        }
    }
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new(1, false)
    }
}

fn aggregated_size(num_samples: usize, n: usize) -> usize {
    if num_samples == 0 {
        0
    } else {
        (num_samples / n).max(1)
    }
}

/// Averages blocks of `n` consecutive samples.
///
/// Traces are split in `⌊S/n⌋` chunks, the first `S mod ⌊S/n⌋` chunks holding one more sample
/// than the others. A trace shorter than `n` is averaged into a single sample.
///
/// # Panics
/// Panics if `n` is 0.
pub fn aggregate(traces: ArrayView2<f64>, n: usize) -> Array2<f64> {
    assert!(n > 0);

    let num_samples = traces.ncols();
    let num_chunks = aggregated_size(num_samples, n);
    let mut aggregated = Array2::zeros((traces.nrows(), num_chunks));
    if num_chunks == 0 {
        return aggregated;
    }

    let (base, extra) = (num_samples / num_chunks, num_samples % num_chunks);
    let mut start = 0;
    for chunk in 0..num_chunks {
        let len = base + usize::from(chunk < extra);
        let mean = traces
            .slice(s![.., start..start + len])
            .sum_axis(Axis(1))
            / len as f64;
        aggregated.column_mut(chunk).assign(&mean);
        start += len;
    }

    aggregated
}

/// Removes the low frequency trend of traces: `x − filtfilt(butter₃(cutoff), x)`.
///
/// `cutoff` is relative to the Nyquist frequency and must be in `(0, 1)`.
pub fn highpass(traces: ArrayView2<f64>, cutoff: f64) -> Array2<f64> {
    let (b, a) = butter3_lowpass(cutoff);
    let mut filtered = traces.to_owned();
    for mut row in filtered.rows_mut() {
        let trend = filtfilt(&b, &a, row.view());
        row -= &trend;
    }
    filtered
}

/// Designs a 3rd order Butterworth low-pass filter with the bilinear transform.
///
/// Returns the `(b, a)` coefficients, `a[0]` being 1.
pub fn butter3_lowpass(cutoff: f64) -> ([f64; 4], [f64; 4]) {
    let k = (std::f64::consts::FRAC_PI_2 * cutoff).tan();
    let k2 = k * k;

    // 1 / (s + 1)
    let b1 = [k, k];
    let a1 = [1. + k, k - 1.];
    // 1 / (s² + s + 1)
    let b2 = [k2, 2. * k2, k2];
    let a2 = [1. + k + k2, 2. * k2 - 2., 1. - k + k2];

    let mut b = [0.; 4];
    let mut a = [0.; 4];
    for i in 0..2 {
        for j in 0..3 {
            b[i + j] += b1[i] * b2[j];
            a[i + j] += a1[i] * a2[j];
        }
    }

    let a0 = a[0];
    (b.map(|x| x / a0), a.map(|x| x / a0))
}

/// Returns the initial state of [`lfilter`] matching the steady state of a unit step.
pub fn lfilter_zi(b: &[f64; 4], a: &[f64; 4]) -> [f64; 3] {
    #[rustfmt::skip]
    let i_minus_a = Matrix3::new(
        1. + a[1], -1., 0.,
        a[2], 1., -1.,
        a[3], 0., 1.,
    );
    let rhs = Vector3::new(b[1] - a[1] * b[0], b[2] - a[2] * b[0], b[3] - a[3] * b[0]);

    match i_minus_a.lu().solve(&rhs) {
        Some(zi) => [zi[0], zi[1], zi[2]],
        None => [0.; 3],
    }
}

/// Filters `x` with a transposed direct form II filter starting from state `zi`.
pub fn lfilter(b: &[f64; 4], a: &[f64; 4], x: &[f64], zi: [f64; 3]) -> Vec<f64> {
    let mut z = zi;
    x.iter()
        .map(|&xn| {
            let y = b[0] * xn + z[0];
            z[0] = b[1] * xn - a[1] * y + z[1];
            z[1] = b[2] * xn - a[2] * y + z[2];
            z[2] = b[3] * xn - a[3] * y;
            y
        })
        .collect()
}

/// Applies a filter forward then backward, giving a zero-phase response.
///
/// The signal is extended with its odd reflection at both ends to limit edge transients.
pub fn filtfilt(b: &[f64; 4], a: &[f64; 4], x: ArrayView1<f64>) -> Array1<f64> {
    let len = x.len();
    if len < 2 {
        return x.to_owned();
    }

    let padlen = (3 * b.len().max(a.len())).min(len - 1);
    let (first, last) = (x[0], x[len - 1]);
    let mut ext = Vec::with_capacity(len + 2 * padlen);
    ext.extend((1..=padlen).rev().map(|i| 2. * first - x[i]));
    ext.extend(x.iter());
    ext.extend((1..=padlen).map(|i| 2. * last - x[len - 1 - i]));

    let zi = lfilter_zi(b, a);
    let forward = lfilter(b, a, &ext, zi.map(|z| z * ext[0]));

    let mut reversed = forward;
    reversed.reverse();
    let mut backward = lfilter(b, a, &reversed, zi.map(|z| z * reversed[0]));
    backward.reverse();

    Array1::from_iter(backward[padlen..padlen + len].iter().copied())
}

/// Standardization of the traces by removing the mean and scaling to unit variance.
#[derive(Debug)]
pub struct StandardScaler {
    /// meanVar processor
    meanvar: MeanVarOnline,
    /// mean
    mean: Array1<f64>,
    /// std
    std: Array1<f64>,
}

impl StandardScaler {
    pub fn new(size: usize) -> Self {
        Self {
            meanvar: MeanVarOnline::new(size),
            mean: Array1::zeros(size),
            std: Array1::ones(size),
        }
    }

    /// Processes input traces to update internal accumulators.
    pub fn process(&mut self, traces: ArrayView2<f64>) {
        self.meanvar.update(traces);
    }

    /// Compute mean and var. Samples with a zero variance are only centered.
    pub fn finalize(&mut self) {
        if let Some(moments) = self.meanvar.finalize() {
            self.mean = moments.mean;
            self.std = moments
                .var
                .mapv(|var| if var > 0. { var.sqrt() } else { 1. });
        }
    }

    /// Apply the processing to input traces
    pub fn apply(&self, traces: ArrayView2<f64>) -> Array2<f64> {
        (&traces - &self.mean) / &self.std
    }
}

/// Standardizes traces with their own mean and variance, sample-wise.
pub fn standardize(traces: ArrayView2<f64>) -> Array2<f64> {
    let mut scaler = StandardScaler::new(traces.ncols());
    scaler.process(traces);
    scaler.finalize();
    scaler.apply(traces)
}
