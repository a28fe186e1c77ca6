use ndarray::Array2;

/// A batch of side channel traces associated to their plaintexts and to the key used during
/// acquisition.
///
/// Leakage is stored as an `Array2<f64>` with one trace per row. Row `i` of `plaintexts` is the
/// plaintext encrypted while capturing row `i` of `traces`.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceBatch {
    /// Leakage waveforms
    pub traces: Array2<f64>,
    /// Plaintexts, one per trace
    pub plaintexts: Array2<u8>,
    /// Key shared by every trace of the batch
    pub key: [u8; 16],
}

impl TraceBatch {
    /// # Panics
    /// Panics in debug if `traces` and `plaintexts` do not have the same number of rows.
    pub fn new(traces: Array2<f64>, plaintexts: Array2<u8>, key: [u8; 16]) -> Self {
        debug_assert_eq!(traces.nrows(), plaintexts.nrows());

        Self {
            traces,
            plaintexts,
            key,
        }
    }

    /// Returns the number of traces in the batch.
    pub fn len(&self) -> usize {
        self.traces.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of points in each leakage waveform.
    pub fn num_samples(&self) -> usize {
        self.traces.ncols()
    }
}
