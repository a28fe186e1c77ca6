//! Leakage detection methods
use log::{debug, info};
use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};
use std::path::Path;

use crate::{
    Error,
    leakage_model::{Aes, Cipher, LeakageTarget},
    loader::StreamingLoader,
    preprocessors::Preprocessor,
    processors::MeanVarOnline,
};

/// Processes traces to calculate the Signal-to-Noise Ratio of a leakage target.
///
/// Traces are classified with the true key byte, and the mean and variance of each class are
/// accumulated online.
#[derive(Debug, Clone)]
pub struct Snr<C: Cipher = Aes> {
    target: LeakageTarget<C>,
    preprocessor: Preprocessor,
    classes: Vec<MeanVarOnline>,
}

impl<C: Cipher> Snr<C> {
    /// Create a new SNR processor.
    ///
    /// # Arguments
    ///
    /// * `num_samples` - Number of samples of the raw traces
    /// * `target` - Leakage target defining the classes
    /// * `preprocessor` - Transform applied to the traces before accumulation
    pub fn new(num_samples: usize, target: LeakageTarget<C>, preprocessor: Preprocessor) -> Self {
        let size = preprocessor.output_size(num_samples);
        let classes = (0..target.num_classes())
            .map(|_| MeanVarOnline::new(size))
            .collect();

        Self {
            target,
            preprocessor,
            classes,
        }
    }

    /// Processes a batch of raw traces recorded with `key`.
    ///
    /// Fails with [`Error::ShapeMismatch`] if the batch does not fit the processor.
    pub fn update(
        &mut self,
        traces: ArrayView2<f64>,
        plaintexts: ArrayView2<u8>,
        key: &[u8],
    ) -> Result<(), Error> {
        if traces.nrows() != plaintexts.nrows() {
            return Err(Error::ShapeMismatch(format!(
                "{} traces for {} plaintexts",
                traces.nrows(),
                plaintexts.nrows()
            )));
        }
        self.target.check_plaintext_len(plaintexts.ncols())?;

        let traces = self.preprocessor.apply(traces);
        if traces.ncols() != self.size() {
            return Err(Error::ShapeMismatch(format!(
                "preprocessed traces have {} samples, expected {}",
                traces.ncols(),
                self.size()
            )));
        }

        let key_byte = self.target.key_byte(key);
        for (trace, plaintext) in traces.rows().into_iter().zip(plaintexts.rows()) {
            let class = self.target.classify(plaintext, key_byte);
            self.classes[class].process(trace);
        }

        Ok(())
    }

    /// Returns the Signal-to-Noise Ratio of the traces.
    /// SNR = V[E[L|X]] / E[V[L|X]]
    ///
    /// Classes with fewer than 2 traces are ignored. Returns `None` if no class has enough
    /// traces.
    pub fn snr(&self) -> Option<Array1<f64>> {
        let moments: Vec<_> = self.classes.iter().filter_map(|c| c.finalize()).collect();
        if moments.is_empty() {
            return None;
        }

        let mut means = Array2::zeros((moments.len(), self.size()));
        let mut vars = Array2::zeros((moments.len(), self.size()));
        for (i, m) in moments.iter().enumerate() {
            means.row_mut(i).assign(&m.mean);
            vars.row_mut(i).assign(&m.var);
        }

        let signal = means.var_axis(Axis(0), 0.);
        let noise = vars.mean_axis(Axis(0))?;
        Some(Zip::from(&signal).and(&noise).map_collect(|&s, &n| s / n))
    }

    /// Computes the SNR of the first `n_traces` traces (all when `None`) of a file, loading
    /// `chunk_size` traces at a time.
    pub fn from_file<P: AsRef<Path>>(
        path: P,
        target: LeakageTarget<C>,
        preprocessor: Preprocessor,
        n_traces: Option<usize>,
        chunk_size: usize,
    ) -> Result<Option<Array1<f64>>, Error> {
        let path = path.as_ref();
        info!("Computing SNR of {}", path.display());

        let mut loader = StreamingLoader::file_chunks(path.to_path_buf(), n_traces, chunk_size);
        let Some(first) = loader.receive()? else {
            return Ok(None);
        };

        let mut snr = Self::new(first.num_samples(), target, preprocessor);
        snr.update(first.traces.view(), first.plaintexts.view(), &first.key)?;
        while let Some(batch) = loader.receive()? {
            snr.update(batch.traces.view(), batch.plaintexts.view(), &batch.key)?;
            debug!("SNR processed {} traces", snr.num_traces());
        }

        Ok(snr.snr())
    }

    /// Return the trace size handled, after preprocessing.
    pub fn size(&self) -> usize {
        self.classes.first().map_or(0, MeanVarOnline::size)
    }

    /// Return the number of classes handled.
    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// Return the number of traces processed.
    pub fn num_traces(&self) -> usize {
        self.classes.iter().map(MeanVarOnline::count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::Snr;
    use crate::{
        Error,
        leakage_model::{Aes, LeakageModel, LeakageTarget},
        preprocessors::Preprocessor,
        trace_store::{SampleType, TraceWriter},
    };
    use ndarray::{Array2, ArrayView1, s};
    use tempfile::TempDir;

    fn dataset() -> (Array2<f64>, Array2<u8>) {
        // Sample 0 depends on the class, sample 1 is noise only
        let traces = Array2::from_shape_fn((12, 2), |(i, j)| {
            let noise = ((i / 2) % 3) as f64;
            if j == 0 { 10. * (i % 2) as f64 + noise } else { noise }
        });
        let plaintexts = Array2::from_shape_fn((12, 16), |(i, j)| {
            if j == 0 { 0x80 * (i % 2) as u8 } else { 0x11 }
        });
        (traces, plaintexts)
    }

    fn assert_snr(snr: ArrayView1<f64>) {
        assert!((snr[0] - 37.5).abs() < 1e-9);
        assert_eq!(snr[1], 0.);
    }

    fn target() -> LeakageTarget {
        LeakageTarget::new(Aes, LeakageModel::XorBit, 0).unwrap()
    }

    #[test]
    fn test_snr() {
        let (traces, plaintexts) = dataset();
        let mut processor = Snr::new(2, target(), Preprocessor::default());
        assert!(processor.snr().is_none());

        processor
            .update(traces.view(), plaintexts.view(), &[0; 16])
            .unwrap();
        assert_eq!(processor.num_traces(), 12);
        assert_eq!(processor.num_classes(), 2);

        let snr = processor.snr().unwrap();
        assert_snr(snr.view());
    }

    #[test]
    fn test_snr_from_file() {
        let (traces, plaintexts) = dataset();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("snr.dat");
        let mut writer = TraceWriter::create(&path, 2, SampleType::Float32, 16, [0; 16]).unwrap();
        writer.append(traces.view(), plaintexts.view()).unwrap();

        let snr = Snr::from_file(&path, target(), Preprocessor::default(), None, 5)
            .unwrap()
            .unwrap();
        assert_snr(snr.view());
    }

    #[test]
    fn test_snr_invalid_batch() {
        let (traces, plaintexts) = dataset();
        let mut processor = Snr::new(2, target(), Preprocessor::default());

        let short = Array2::<f64>::zeros((12, 3));
        assert!(matches!(
            processor.update(short.view(), plaintexts.view(), &[0; 16]),
            Err(Error::ShapeMismatch(_))
        ));

        let target = LeakageTarget::new(Aes, LeakageModel::XorBit, 4).unwrap();
        let mut processor = Snr::new(2, target, Preprocessor::default());
        let narrow = Array2::<u8>::zeros((12, 4));
        assert!(matches!(
            processor.update(traces.view(), narrow.view(), &[0; 16]),
            Err(Error::ShapeMismatch(_))
        ));

        assert!(matches!(
            processor.update(traces.view(), plaintexts.slice(s![..5, ..]), &[0; 16]),
            Err(Error::ShapeMismatch(_))
        ));
        assert_eq!(processor.num_traces(), 0);
    }
}
