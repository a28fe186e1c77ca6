use ndarray::ArrayView2;
use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use crate::{
    Error,
    trace_store::header::{KEY_LEN, SampleType, TraceHeader},
};

/// Creates binary trace files and appends traces to them.
///
/// The trace count stored at the start of the header is updated after every append, so a
/// file can be read while acquisition goes on.
#[derive(Debug)]
pub struct TraceWriter {
    path: PathBuf,
    header: TraceHeader,
}

impl TraceWriter {
    /// Creates a new trace file holding no trace, overwriting any existing file at `path`.
    pub fn create<P: AsRef<Path>>(
        path: P,
        num_samples: usize,
        sample_type: SampleType,
        plaintext_len: usize,
        key: [u8; KEY_LEN],
    ) -> Result<Self, Error> {
        let num_samples = u32::try_from(num_samples)
            .map_err(|_| Error::InvalidConfig(format!("{num_samples} samples per trace")))?;
        let plaintext_len = u8::try_from(plaintext_len)
            .map_err(|_| Error::InvalidConfig(format!("plaintext length {plaintext_len}")))?;

        let header = TraceHeader {
            num_traces: 0,
            num_samples,
            sample_type,
            plaintext_len,
            key,
        };

        let path = path.as_ref().to_path_buf();
        let mut file = BufWriter::new(File::create(&path)?);
        header.write(&mut file)?;
        file.flush()?;

        Ok(Self { path, header })
    }

    /// Opens an existing trace file to append traces to it.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let header = TraceHeader::read(&mut File::open(&path)?)?;

        Ok(Self { path, header })
    }

    pub fn header(&self) -> &TraceHeader {
        &self.header
    }

    /// Returns the number of traces in the file.
    pub fn num_traces(&self) -> usize {
        self.header.num_traces as usize
    }

    /// Appends traces and their plaintexts at the end of the file.
    ///
    /// Samples are converted to the sample type of the file.
    pub fn append(
        &mut self,
        traces: ArrayView2<f64>,
        plaintexts: ArrayView2<u8>,
    ) -> Result<(), Error> {
        if traces.nrows() != plaintexts.nrows() {
            return Err(Error::ShapeMismatch(format!(
                "{} traces but {} plaintexts",
                traces.nrows(),
                plaintexts.nrows()
            )));
        }
        if traces.ncols() != self.header.num_samples as usize {
            return Err(Error::ShapeMismatch(format!(
                "traces have {} samples, file expects {}",
                traces.ncols(),
                self.header.num_samples
            )));
        }
        if plaintexts.ncols() != self.header.plaintext_len as usize {
            return Err(Error::ShapeMismatch(format!(
                "plaintexts have {} bytes, file expects {}",
                plaintexts.ncols(),
                self.header.plaintext_len
            )));
        }

        let mut rows = Vec::with_capacity(traces.nrows() * self.header.row_len());
        for (trace, plaintext) in traces.rows().into_iter().zip(plaintexts.rows()) {
            self.header.sample_type.encode(trace.iter().copied(), &mut rows);
            rows.extend(plaintext.iter());
        }

        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(&rows)?;
        file.flush()?;

        self.update_num_traces(traces.nrows())
    }

    /// Adds `count` to the trace count stored in the file header.
    fn update_num_traces(&mut self, count: usize) -> Result<(), Error> {
        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        let mut stored = [0u8; 4];
        file.read_exact(&mut stored)?;

        let total = u32::from_le_bytes(stored) as usize + count;
        let total = u32::try_from(total)
            .map_err(|_| Error::InvalidConfig(format!("{total} traces do not fit in a file")))?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&total.to_le_bytes())?;

        self.header.num_traces = total;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::TraceWriter;
    use crate::{
        Error,
        trace_store::{SampleType, TraceStore, Units},
    };
    use ndarray::{Array2, array};
    use tempfile::TempDir;

    #[test]
    fn test_append_updates_count() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("acq.dat");

        let mut writer = TraceWriter::create(&path, 3, SampleType::Float32, 2, [7; 16]).unwrap();
        assert_eq!(TraceStore::open(&path).unwrap().num_traces(), 0);

        writer
            .append(array![[0.5, 1.5, -2.]].view(), array![[1u8, 2]].view())
            .unwrap();
        let mut writer = TraceWriter::open(&path).unwrap();
        assert_eq!(writer.num_traces(), 1);
        writer
            .append(
                array![[3., 4., 5.], [6., 7., 8.]].view(),
                array![[3u8, 4], [5, 6]].view(),
            )
            .unwrap();

        let store = TraceStore::open(&path).unwrap();
        assert_eq!(store.num_traces(), 3);
        let (traces, plaintexts) = store.read_all(Units::Raw).unwrap();
        assert_eq!(traces, array![[0.5, 1.5, -2.], [3., 4., 5.], [6., 7., 8.]]);
        assert_eq!(plaintexts, array![[1u8, 2], [3, 4], [5, 6]]);
    }

    #[test]
    fn test_int16_rounding() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("acq.dat");
        let sample_type = SampleType::Int16 {
            channel_range: 8,
            max_adc: 32512,
        };

        let mut writer = TraceWriter::create(&path, 2, sample_type, 1, [0; 16]).unwrap();
        writer
            .append(array![[1.4, -2.6], [1e6, -1e6]].view(), array![[0u8], [1]].view())
            .unwrap();

        let (traces, _) = TraceStore::open(&path).unwrap().read_all(Units::Raw).unwrap();
        assert_eq!(traces, array![[1., -3.], [32767., -32768.]]);
    }

    #[test]
    fn test_shape_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("acq.dat");
        let mut writer = TraceWriter::create(&path, 3, SampleType::Float64, 16, [0; 16]).unwrap();

        assert!(matches!(
            writer.append(Array2::zeros((2, 4)).view(), Array2::zeros((2, 16)).view()),
            Err(Error::ShapeMismatch(_))
        ));
        assert!(matches!(
            writer.append(Array2::zeros((2, 3)).view(), Array2::zeros((1, 16)).view()),
            Err(Error::ShapeMismatch(_))
        ));
        assert_eq!(writer.num_traces(), 0);
    }
}
