//! Background loading of trace batches.
//!
//! A [`StreamingLoader`] runs a producer on a dedicated thread and hands its items over a
//! bounded channel, so reading and preprocessing the next file overlaps with the consumer work
//! on the previous one. The producer blocks while the channel is full. Once the producer is
//! exhausted the channel closes and [`StreamingLoader::receive`] returns `Ok(None)`.
use crossbeam_channel::{Receiver, bounded};
use log::debug;
use std::{
    path::PathBuf,
    thread::{self, JoinHandle},
};

use crate::{
    Error,
    preprocessors::Preprocessor,
    trace::TraceBatch,
    trace_store::{TraceStore, Units},
};

/// Number of batches buffered ahead of the consumer.
pub const DEFAULT_CAPACITY: usize = 1;

pub struct StreamingLoader<T> {
    receiver: Option<Receiver<Result<T, Error>>>,
    handle: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> StreamingLoader<T> {
    /// Starts `producer` on a background thread.
    ///
    /// # Panics
    /// Panics if `capacity` is 0.
    pub fn spawn<F, I>(capacity: usize, producer: F) -> Self
    where
        F: FnOnce() -> I + Send + 'static,
        I: Iterator<Item = Result<T, Error>>,
    {
        assert!(capacity > 0);

        let (sender, receiver) = bounded(capacity);
        let handle = thread::spawn(move || {
            for item in producer() {
                if sender.send(item).is_err() {
                    // Consumer is gone
                    break;
                }
            }
        });

        Self {
            receiver: Some(receiver),
            handle: Some(handle),
        }
    }

    /// Blocks until the next item is available.
    ///
    /// Returns `Ok(None)` once the producer is exhausted, or the error the producer sent.
    pub fn receive(&mut self) -> Result<Option<T>, Error> {
        let Some(receiver) = self.receiver.as_ref() else {
            return Ok(None);
        };

        match receiver.recv() {
            Ok(item) => item.map(Some),
            Err(_) => {
                self.close()?;
                Ok(None)
            }
        }
    }

    /// Drops the receiving end and waits for the producer thread.
    fn close(&mut self) -> Result<(), Error> {
        self.receiver.take();
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| Error::LoaderPanicked),
            None => Ok(()),
        }
    }
}

impl StreamingLoader<TraceBatch> {
    /// Loads the first `n_traces` traces (all when `None`) of each file in order, applying
    /// `preprocessor` in the background.
    pub fn trace_files(
        files: Vec<PathBuf>,
        n_traces: Option<usize>,
        preprocessor: Preprocessor,
    ) -> Self {
        Self::spawn(DEFAULT_CAPACITY, move || {
            files.into_iter().map(move |path| {
                debug!("Loading {}", path.display());
                let store = TraceStore::open(&path)?;
                let n = n_traces.unwrap_or(store.num_traces());
                let mut batch = store.batch(0..n, Units::Raw)?;
                batch.traces = preprocessor.apply(batch.traces.view());
                Ok(batch)
            })
        })
    }

    /// Loads the first `n_traces` traces (all when `None`) of a single file by chunks of
    /// `chunk_size` traces.
    ///
    /// # Panics
    /// Panics if `chunk_size` is 0.
    pub fn file_chunks(path: PathBuf, n_traces: Option<usize>, chunk_size: usize) -> Self {
        assert!(chunk_size > 0);

        Self::spawn(DEFAULT_CAPACITY, move || {
            let chunks: Box<dyn Iterator<Item = Result<TraceBatch, Error>>> =
                match TraceStore::open(&path) {
                    Ok(store) => {
                        let n = n_traces.unwrap_or(store.num_traces());
                        Box::new((0..n).step_by(chunk_size).map(move |start| {
                            store.batch(start..(start + chunk_size).min(n), Units::Raw)
                        }))
                    }
                    Err(e) => Box::new(std::iter::once(Err(e))),
                };
            chunks
        })
    }
}

impl<T: Send + 'static> Iterator for StreamingLoader<T> {
    type Item = Result<T, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.receive().transpose()
    }
}

impl<T> Drop for StreamingLoader<T> {
    fn drop(&mut self) {
        // Unblocks a producer waiting on a full channel before joining it
        self.receiver.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::StreamingLoader;
    use crate::{
        Error,
        preprocessors::Preprocessor,
        trace_store::{SampleType, TraceWriter},
    };
    use ndarray::{Array2, s};
    use tempfile::TempDir;

    #[test]
    fn test_order_and_end_of_stream() {
        let mut loader = StreamingLoader::spawn(1, || (0..100).map(Ok));

        for expected in 0..100 {
            assert_eq!(loader.receive().unwrap(), Some(expected));
        }
        assert_eq!(loader.receive().unwrap(), None);
        assert_eq!(loader.receive().unwrap(), None);
    }

    #[test]
    fn test_producer_error() {
        let mut loader = StreamingLoader::spawn(2, || {
            vec![Ok(1), Err(Error::NoInputFiles), Ok(2)].into_iter()
        });

        assert_eq!(loader.receive().unwrap(), Some(1));
        assert!(matches!(loader.receive(), Err(Error::NoInputFiles)));
        assert_eq!(loader.receive().unwrap(), Some(2));
        assert_eq!(loader.receive().unwrap(), None);
    }

    #[test]
    fn test_producer_panic() {
        let mut loader =
            StreamingLoader::<u8>::spawn(1, || -> std::vec::IntoIter<Result<u8, Error>> {
                panic!("producer failure")
            });

        assert!(matches!(loader.receive(), Err(Error::LoaderPanicked)));
    }

    #[test]
    fn test_early_drop() {
        let loader = StreamingLoader::spawn(1, || (0..).map(Ok::<u64, Error>));
        assert_eq!(loader.take(3).map(|x| x.unwrap()).collect::<Vec<_>>(), [0, 1, 2]);
    }

    #[test]
    fn test_trace_files() {
        let dir = TempDir::new().unwrap();
        let traces = Array2::from_shape_fn((10, 4), |(i, j)| (i * 4 + j) as f64);
        let plaintexts = Array2::from_shape_fn((10, 16), |(i, _)| i as u8);

        let mut files = Vec::new();
        for key in 0..3u8 {
            let path = dir.path().join(format!("{key}.dat"));
            let mut writer =
                TraceWriter::create(&path, 4, SampleType::Float64, 16, [key; 16]).unwrap();
            writer.append(traces.view(), plaintexts.view()).unwrap();
            files.push(path);
        }

        let loader = StreamingLoader::trace_files(files, Some(6), Preprocessor::new(2, false));
        let batches: Vec<_> = loader.map(|batch| batch.unwrap()).collect();

        assert_eq!(batches.len(), 3);
        for (key, batch) in batches.iter().enumerate() {
            assert_eq!(batch.key, [key as u8; 16]);
            assert_eq!(batch.len(), 6);
            assert_eq!(batch.traces[[1, 0]], 4.5);
            assert_eq!(batch.plaintexts, plaintexts.slice(s![..6, ..]));
        }
    }

    #[test]
    fn test_file_chunks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chunks.dat");
        let traces = Array2::from_shape_fn((10, 2), |(i, j)| (i * 2 + j) as f64);
        let mut writer = TraceWriter::create(&path, 2, SampleType::Float32, 1, [0; 16]).unwrap();
        writer
            .append(traces.view(), Array2::<u8>::zeros((10, 1)).view())
            .unwrap();

        let lens: Vec<_> = StreamingLoader::file_chunks(path.clone(), None, 4)
            .map(|batch| batch.unwrap().len())
            .collect();
        assert_eq!(lens, [4, 4, 2]);

        let mut loader = StreamingLoader::file_chunks(path, Some(11), 4);
        assert_eq!(loader.receive().unwrap().unwrap().len(), 4);
        assert_eq!(loader.receive().unwrap().unwrap().len(), 4);
        assert!(matches!(loader.receive(), Err(Error::IndexOutOfRange { .. })));
    }
}
