//! Streaming statistics over traces.
//!
//! Accumulators in this module use compensated (Kahan) summation so that folding millions of
//! traces in small batches does not lose precision to rounding.
use ndarray::{
    Array1, Array2, Array3, ArrayView, ArrayView1, ArrayView2, ArrayViewMut, Axis, Dimension, Zip,
};

/// Adds `value` to `sum` using Kahan summation. `c` holds the rounding error of the previous
/// additions and must start at 0.
#[inline]
pub fn kahan_add(sum: &mut f64, c: &mut f64, value: f64) {
    let y = value - *c;
    let t = *sum + y;
    *c = (t - *sum) - y;
    *sum = t;
}

/// Element-wise [`kahan_add`] over arrays of the same shape.
///
/// # Panics
/// Panics if the shapes of `sum`, `c` and `values` differ.
pub fn kahan_sum<D: Dimension>(
    sum: ArrayViewMut<f64, D>,
    c: ArrayViewMut<f64, D>,
    values: ArrayView<f64, D>,
) {
    Zip::from(sum)
        .and(c)
        .and(values)
        .for_each(|s, c, &v| kahan_add(s, c, v));
}

/// Finalized statistics of a [`MeanVarOnline`].
#[derive(Debug, Clone, PartialEq)]
pub struct Moments {
    /// Number of traces processed
    pub count: usize,
    pub mean: Array1<f64>,
    /// Population variance (`M2 / count`)
    pub var: Array1<f64>,
}

/// Processes traces to calculate mean and variance online, sample-wise.
///
/// This is Welford's algorithm with every accumulation compensated.
#[derive(Debug, Clone)]
pub struct MeanVarOnline {
    /// Running mean of traces
    mean: Array1<f64>,
    c_mean: Array1<f64>,
    /// Running sum of squared deviations from the mean
    m2: Array1<f64>,
    c_m2: Array1<f64>,
    /// Number of traces processed
    count: usize,
}

impl MeanVarOnline {
    /// Creates a new mean and variance processor.
    ///
    /// # Arguments
    ///
    /// * `size` - Number of samples per trace
    pub fn new(size: usize) -> Self {
        Self {
            mean: Array1::zeros(size),
            c_mean: Array1::zeros(size),
            m2: Array1::zeros(size),
            c_m2: Array1::zeros(size),
            count: 0,
        }
    }

    /// Processes an input trace to update internal accumulators.
    ///
    /// # Panics
    /// Panics in debug if the length of the trace is different from the size of
    /// [`MeanVarOnline`].
    pub fn process(&mut self, trace: ArrayView1<f64>) {
        debug_assert_eq!(trace.len(), self.size());

        self.count += 1;
        let n = self.count as f64;
        for i in 0..self.size() {
            let x = trace[i];
            let delta = x - self.mean[i];
            kahan_add(&mut self.mean[i], &mut self.c_mean[i], delta / n);
            let delta2 = x - self.mean[i];
            kahan_add(&mut self.m2[i], &mut self.c_m2[i], delta * delta2);
        }
    }

    /// Processes a batch of traces, one per row.
    pub fn update(&mut self, traces: ArrayView2<f64>) {
        for trace in traces.rows() {
            self.process(trace);
        }
    }

    /// Returns the statistics of the processed traces, or `None` if fewer than 2 traces were
    /// processed.
    pub fn finalize(&self) -> Option<Moments> {
        if self.count < 2 {
            return None;
        }

        let count = self.count as f64;
        Some(Moments {
            count: self.count,
            mean: self.mean.clone(),
            var: self.m2.mapv(|m2| m2 / count),
        })
    }

    /// Returns the trace size handled.
    pub fn size(&self) -> usize {
        self.mean.len()
    }

    /// Returns the number of traces processed.
    pub fn count(&self) -> usize {
        self.count
    }
}

/// Accumulates per class sums of traces, and optionally sums of their outer products, to
/// estimate class means and covariances.
#[derive(Debug, Clone)]
pub struct ClassSums {
    /// Number of traces per class
    counts: Array1<usize>,
    /// Sum of traces per class
    sum: Array2<f64>,
    c_sum: Array2<f64>,
    /// Sum of `x xᵗ` per class
    outer: Option<OuterSums>,
}

#[derive(Debug, Clone)]
struct OuterSums {
    sum: Array3<f64>,
    c: Array3<f64>,
}

impl ClassSums {
    /// Creates an accumulator of class sums only.
    ///
    /// # Arguments
    ///
    /// * `num_classes` - Number of classes
    /// * `size` - Number of samples per trace
    pub fn new(num_classes: usize, size: usize) -> Self {
        Self {
            counts: Array1::zeros(num_classes),
            sum: Array2::zeros((num_classes, size)),
            c_sum: Array2::zeros((num_classes, size)),
            outer: None,
        }
    }

    /// Creates an accumulator of class sums and class sums of outer products.
    pub fn with_outer_products(num_classes: usize, size: usize) -> Self {
        Self {
            outer: Some(OuterSums {
                sum: Array3::zeros((num_classes, size, size)),
                c: Array3::zeros((num_classes, size, size)),
            }),
            ..Self::new(num_classes, size)
        }
    }

    /// Folds a batch of traces, `classes[i]` being the class of row `i`.
    ///
    /// Each class contributes one compensated addition per batch.
    ///
    /// # Panics
    /// - Panics in debug if `traces.nrows() != classes.len()`.
    /// - Panics if a class is not lower than [`ClassSums::num_classes`].
    pub fn update(&mut self, traces: ArrayView2<f64>, classes: &[usize]) {
        debug_assert_eq!(traces.nrows(), classes.len());
        debug_assert_eq!(traces.ncols(), self.size());

        let mut members: Vec<Vec<usize>> = vec![Vec::new(); self.num_classes()];
        for (row, &class) in classes.iter().enumerate() {
            members[class].push(row);
        }

        for (class, rows) in members.iter().enumerate() {
            if rows.is_empty() {
                continue;
            }

            let class_traces = traces.select(Axis(0), rows);
            kahan_sum(
                self.sum.row_mut(class),
                self.c_sum.row_mut(class),
                class_traces.sum_axis(Axis(0)).view(),
            );
            if let Some(outer) = self.outer.as_mut() {
                kahan_sum(
                    outer.sum.index_axis_mut(Axis(0), class),
                    outer.c.index_axis_mut(Axis(0), class),
                    class_traces.t().dot(&class_traces).view(),
                );
            }
            self.counts[class] += rows.len();
        }
    }

    /// Returns the mean trace of each class. Classes without any trace get a zero mean.
    pub fn means(&self) -> Array2<f64> {
        let mut means = self.sum.clone();
        for (mut mean, &count) in means.rows_mut().into_iter().zip(&self.counts) {
            if count == 0 {
                mean.fill(0.);
            } else {
                mean.mapv_inplace(|x| nan_to_zero(x / count as f64));
            }
        }
        means
    }

    /// Returns the unbiased covariance matrix of each class,
    /// `(n·Σxxᵗ − (Σx)(Σx)ᵗ) / (n·(n − 1))`, or `None` if outer products are not accumulated.
    ///
    /// Classes with fewer than 2 traces get a zero covariance.
    pub fn covariances(&self) -> Option<Array3<f64>> {
        let outer = self.outer.as_ref()?;
        let size = self.size();

        let mut cov = Array3::zeros((self.num_classes(), size, size));
        for (class, &count) in self.counts.iter().enumerate() {
            if count < 2 {
                continue;
            }

            let n = count as f64;
            let sum = self.sum.row(class);
            let sum_outer = outer.sum.index_axis(Axis(0), class);
            let denominator = n * (n - 1.);
            let mut class_cov = cov.index_axis_mut(Axis(0), class);
            for i in 0..size {
                for j in 0..size {
                    let numerator = n * sum_outer[[i, j]] - sum[i] * sum[j];
                    class_cov[[i, j]] = nan_to_zero(numerator / denominator);
                }
            }
        }
        Some(cov)
    }

    /// Returns the number of traces accumulated per class.
    pub fn counts(&self) -> ArrayView1<usize> {
        self.counts.view()
    }

    pub fn num_classes(&self) -> usize {
        self.counts.len()
    }

    /// Returns the trace size handled.
    pub fn size(&self) -> usize {
        self.sum.ncols()
    }
}

fn nan_to_zero(x: f64) -> f64 {
    if x.is_nan() { 0. } else { x }
}
