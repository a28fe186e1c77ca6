//! Access to binary trace files.
//!
//! A trace file holds a [`TraceHeader`] followed by fixed length rows, each made of one
//! leakage waveform and the plaintext encrypted during its acquisition. [`TraceStore`] reads
//! rows by seeking to their offset, so files larger than memory can be processed by batches.
//! The file is opened and closed on every read, so independent readers can share a file.
use ndarray::{Array2, ArrayViewMut1};
use std::{
    fs::File,
    io::{BufReader, Read, Seek, SeekFrom},
    ops::Range,
    path::{Path, PathBuf},
};

use crate::{Error, trace::TraceBatch};

pub mod header;
pub mod writer;

pub use header::{SampleType, TraceHeader, adc_to_mv};
pub use writer::TraceWriter;

/// Unit of the samples returned by [`TraceStore`] reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Units {
    /// Samples as stored in the file
    #[default]
    Raw,
    /// Samples converted to millivolts, only available for files storing `i16` ADC codes
    Millivolts,
}

/// Read-only view over a binary trace file.
#[derive(Debug, Clone)]
pub struct TraceStore {
    path: PathBuf,
    header: TraceHeader,
}

impl TraceStore {
    /// Opens a trace file and parses its header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let mut reader = BufReader::new(File::open(&path)?);
        let header = TraceHeader::read(&mut reader)?;

        Ok(Self { path, header })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &TraceHeader {
        &self.header
    }

    /// Returns the number of traces stored in the file.
    pub fn num_traces(&self) -> usize {
        self.header.num_traces as usize
    }

    /// Returns the number of samples in each trace.
    pub fn num_samples(&self) -> usize {
        self.header.num_samples as usize
    }

    pub fn sample_type(&self) -> SampleType {
        self.header.sample_type
    }

    pub fn plaintext_len(&self) -> usize {
        self.header.plaintext_len as usize
    }

    /// Returns the key used during the acquisition of the whole file.
    pub fn key(&self) -> [u8; 16] {
        self.header.key
    }

    /// Reads every trace of the file in order.
    pub fn read_all(&self, units: Units) -> Result<(Array2<f64>, Array2<u8>), Error> {
        self.read_range(0..self.num_traces(), units)
    }

    /// Reads the contiguous traces in `range`, seeking only once.
    pub fn read_range(
        &self,
        range: Range<usize>,
        units: Units,
    ) -> Result<(Array2<f64>, Array2<u8>), Error> {
        let scale = self.scale(units)?;
        if range.end > self.num_traces() {
            return Err(Error::IndexOutOfRange {
                index: range.end - 1,
                len: self.num_traces(),
            });
        }

        let n = range.len();
        let mut traces = Array2::zeros((n, self.num_samples()));
        let mut plaintexts = Array2::zeros((n, self.plaintext_len()));
        if n == 0 {
            return Ok((traces, plaintexts));
        }

        let mut reader = BufReader::new(File::open(&self.path)?);
        reader.seek(SeekFrom::Start(self.header.row_offset(range.start)))?;
        let mut row = vec![0u8; self.header.row_len()];
        for i in 0..n {
            reader.read_exact(&mut row)?;
            self.decode_row(&row, traces.row_mut(i), plaintexts.row_mut(i));
        }

        apply_scale(&mut traces, scale);
        Ok((traces, plaintexts))
    }

    /// Reads the traces at the given indices, in the order of `indices`.
    ///
    /// Fails with [`Error::IndexOutOfRange`] if any index is not lower than
    /// [`TraceStore::num_traces`].
    pub fn read_batch(
        &self,
        indices: &[usize],
        units: Units,
    ) -> Result<(Array2<f64>, Array2<u8>), Error> {
        let scale = self.scale(units)?;
        self.check_trace_indices(indices)?;

        let mut traces = Array2::zeros((indices.len(), self.num_samples()));
        let mut plaintexts = Array2::zeros((indices.len(), self.plaintext_len()));
        if indices.is_empty() {
            return Ok((traces, plaintexts));
        }

        let mut file = File::open(&self.path)?;
        let mut row = vec![0u8; self.header.row_len()];
        for (i, &index) in indices.iter().enumerate() {
            file.seek(SeekFrom::Start(self.header.row_offset(index)))?;
            file.read_exact(&mut row)?;
            self.decode_row(&row, traces.row_mut(i), plaintexts.row_mut(i));
        }

        apply_scale(&mut traces, scale);
        Ok((traces, plaintexts))
    }

    /// Reads only the samples at `sample_indices` of the traces at `trace_indices`.
    ///
    /// The returned leakage has one row per trace index and one column per sample index.
    pub fn read_samples(
        &self,
        trace_indices: &[usize],
        sample_indices: &[usize],
        units: Units,
    ) -> Result<(Array2<f64>, Array2<u8>), Error> {
        let scale = self.scale(units)?;
        self.check_trace_indices(trace_indices)?;
        if let Some(&index) = sample_indices.iter().find(|&&i| i >= self.num_samples()) {
            return Err(Error::IndexOutOfRange {
                index,
                len: self.num_samples(),
            });
        }

        let mut samples = Array2::zeros((trace_indices.len(), sample_indices.len()));
        let mut plaintexts = Array2::zeros((trace_indices.len(), self.plaintext_len()));
        if trace_indices.is_empty() {
            return Ok((samples, plaintexts));
        }

        let sample_type = self.sample_type();
        let width = sample_type.width();
        let mut file = File::open(&self.path)?;
        let mut sample = vec![0u8; width];
        let mut plaintext = vec![0u8; self.plaintext_len()];
        for (i, &trace_index) in trace_indices.iter().enumerate() {
            let row_offset = self.header.row_offset(trace_index);
            for (j, &sample_index) in sample_indices.iter().enumerate() {
                file.seek(SeekFrom::Start(row_offset + (sample_index * width) as u64))?;
                file.read_exact(&mut sample)?;
                sample_type.decode(&sample, std::slice::from_mut(&mut samples[[i, j]]));
            }

            file.seek(SeekFrom::Start(
                row_offset + self.header.leakage_len() as u64,
            ))?;
            file.read_exact(&mut plaintext)?;
            plaintexts
                .row_mut(i)
                .iter_mut()
                .zip(&plaintext)
                .for_each(|(p, &b)| *p = b);
        }

        apply_scale(&mut samples, scale);
        Ok((samples, plaintexts))
    }

    /// Reads the traces in `range` together with the file key.
    pub fn batch(&self, range: Range<usize>, units: Units) -> Result<TraceBatch, Error> {
        let (traces, plaintexts) = self.read_range(range, units)?;

        Ok(TraceBatch::new(traces, plaintexts, self.key()))
    }

    fn check_trace_indices(&self, indices: &[usize]) -> Result<(), Error> {
        match indices.iter().find(|&&i| i >= self.num_traces()) {
            Some(&index) => Err(Error::IndexOutOfRange {
                index,
                len: self.num_traces(),
            }),
            None => Ok(()),
        }
    }

    fn scale(&self, units: Units) -> Result<Option<f64>, Error> {
        match units {
            Units::Raw => Ok(None),
            Units::Millivolts => self.header.mv_factor().map(Some),
        }
    }

    fn decode_row(
        &self,
        row: &[u8],
        mut trace: ArrayViewMut1<f64>,
        mut plaintext: ArrayViewMut1<u8>,
    ) {
        let (leakage, text) = row.split_at(self.header.leakage_len());
        match trace.as_slice_mut() {
            Some(out) => self.sample_type().decode(leakage, out),
            None => {
                let mut out = vec![0f64; trace.len()];
                self.sample_type().decode(leakage, &mut out);
                trace.iter_mut().zip(out).for_each(|(x, y)| *x = y);
            }
        }
        plaintext.iter_mut().zip(text).for_each(|(p, &b)| *p = b);
    }
}

fn apply_scale(traces: &mut Array2<f64>, scale: Option<f64>) {
    if let Some(factor) = scale {
        traces.mapv_inplace(|x| x * factor);
    }
}

#[cfg(test)]
mod tests {
    use super::{SampleType, TraceStore, TraceWriter, Units};
    use crate::Error;
    use ndarray::{Array2, Axis, array};
    use ndarray_rand::rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
    use tempfile::TempDir;

    const KEY: [u8; 16] = [
        0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f,
        0x3c,
    ];

    fn sample_traces() -> (Array2<f64>, Array2<u8>) {
        let traces = Array2::from_shape_fn((7, 5), |(i, j)| (i * 10 + j) as f64 - 20.);
        let plaintexts = Array2::from_shape_fn((7, 16), |(i, j)| (i * 16 + j) as u8);
        (traces, plaintexts)
    }

    fn write_file(dir: &TempDir, sample_type: SampleType) -> TraceStore {
        let path = dir.path().join("traces.dat");
        let (traces, plaintexts) = sample_traces();
        let mut writer = TraceWriter::create(&path, 5, sample_type, 16, KEY).unwrap();
        writer
            .append(traces.slice(ndarray::s![..4, ..]), plaintexts.slice(ndarray::s![..4, ..]))
            .unwrap();
        writer
            .append(traces.slice(ndarray::s![4.., ..]), plaintexts.slice(ndarray::s![4.., ..]))
            .unwrap();

        TraceStore::open(path).unwrap()
    }

    #[test]
    fn test_read_all() {
        let dir = TempDir::new().unwrap();
        for sample_type in [
            SampleType::Float32,
            SampleType::Float64,
            SampleType::Int16 {
                channel_range: 6,
                max_adc: 32512,
            },
        ] {
            let store = write_file(&dir, sample_type);
            let (traces, plaintexts) = sample_traces();

            assert_eq!(store.num_traces(), 7);
            assert_eq!(store.num_samples(), 5);
            assert_eq!(store.key(), KEY);
            assert_eq!(store.read_all(Units::Raw).unwrap(), (traces, plaintexts));
        }
    }

    #[test]
    fn test_read_batch_any_order() {
        let dir = TempDir::new().unwrap();
        let store = write_file(&dir, SampleType::Float64);
        let (traces, plaintexts) = sample_traces();

        let indices = [6, 0, 3, 3, 1, 5, 2, 4];
        let (batch_traces, batch_plaintexts) = store.read_batch(&indices, Units::Raw).unwrap();

        assert_eq!(batch_traces, traces.select(Axis(0), &indices));
        assert_eq!(batch_plaintexts, plaintexts.select(Axis(0), &indices));

        let batch = store.batch(2..5, Units::Raw).unwrap();
        assert_eq!(batch.traces, traces.select(Axis(0), &[2, 3, 4]));
        assert_eq!(batch.key, KEY);
    }

    #[test]
    fn test_read_batch_shuffled() {
        let dir = TempDir::new().unwrap();
        let store = write_file(&dir, SampleType::Float32);
        let (traces, plaintexts) = sample_traces();
        let mut rng = StdRng::seed_from_u64(0);

        let mut indices: Vec<usize> = (0..7).collect();
        for _ in 0..20 {
            indices.shuffle(&mut rng);
            let (batch_traces, batch_plaintexts) = store.read_batch(&indices, Units::Raw).unwrap();
            assert_eq!(batch_traces, traces.select(Axis(0), &indices));
            assert_eq!(batch_plaintexts, plaintexts.select(Axis(0), &indices));
        }
    }

    #[test]
    fn test_read_samples() {
        let dir = TempDir::new().unwrap();
        let store = write_file(&dir, SampleType::Float32);
        let (_, plaintexts) = sample_traces();

        let (samples, texts) = store.read_samples(&[1, 5], &[4, 0], Units::Raw).unwrap();
        assert_eq!(samples, array![[-6., -10.], [34., 30.]]);
        assert_eq!(texts, plaintexts.select(Axis(0), &[1, 5]));

        assert!(matches!(
            store.read_samples(&[1], &[5], Units::Raw),
            Err(Error::IndexOutOfRange { index: 5, len: 5 })
        ));
    }

    #[test]
    fn test_index_out_of_range() {
        let dir = TempDir::new().unwrap();
        let store = write_file(&dir, SampleType::Float64);

        assert!(matches!(
            store.read_batch(&[0, 7], Units::Raw),
            Err(Error::IndexOutOfRange { index: 7, len: 7 })
        ));
        assert!(matches!(
            store.read_range(5..8, Units::Raw),
            Err(Error::IndexOutOfRange { .. })
        ));
    }

    #[test]
    fn test_millivolts() {
        let dir = TempDir::new().unwrap();
        let store = write_file(&dir, SampleType::Float64);
        assert!(matches!(
            store.read_all(Units::Millivolts),
            Err(Error::InsufficientHeaderInfo)
        ));

        let store = write_file(
            &dir,
            SampleType::Int16 {
                channel_range: 6,
                max_adc: 1000,
            },
        );
        let (traces, _) = sample_traces();
        let (mv, _) = store.read_batch(&[0, 6], Units::Millivolts).unwrap();
        assert_eq!(mv, traces.select(Axis(0), &[0, 6]));

        // 2000 mV range over 1000 codes
        let store = write_file(
            &dir,
            SampleType::Int16 {
                channel_range: 7,
                max_adc: 1000,
            },
        );
        let (mv, _) = store.read_batch(&[3, 1], Units::Millivolts).unwrap();
        assert_eq!(mv, traces.select(Axis(0), &[3, 1]) * 2.);
        let (mv, _) = store.read_samples(&[2], &[0, 4], Units::Millivolts).unwrap();
        assert_eq!(mv, array![[0., 8.]]);
        let (raw, _) = store.read_samples(&[2], &[0, 4], Units::Raw).unwrap();
        assert_eq!(raw, array![[0., 4.]]);
    }
}
