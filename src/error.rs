use std::io;
use thiserror::Error;

use crate::template::Phase;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Malformed trace file header: {0}")]
    MalformedHeader(String),
    #[error("Index {index} out of range (length is {len})")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("Cannot convert to millivolts, the file header lacks channel range and max ADC")]
    InsufficientHeaderInfo,
    #[error("Unknown leakage mode {0:?}, expected one of: hw(sbox), xor_bit, sbox, xor_byte")]
    UnknownLeakageMode(String),
    #[error("Target byte {0} is not between 0 and 15")]
    InvalidTargetByte(usize),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Cannot run {0}: previous phase has not been computed")]
    PhaseNotReady(Phase),
    #[error("Artifacts of {0} already exist, set `force` to override them")]
    ArtifactsExist(Phase),
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("No input file given")]
    NoInputFiles,
    #[error("Background loader panicked")]
    LoaderPanicked,
    #[error("Numerical error: {0}")]
    NumericalError(String),
    #[error(transparent)]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Failed to save/load tascat data")]
    SaveLoadError(#[from] serde_json::Error),
    #[error(transparent)]
    NpyRead(#[from] ndarray_npy::ReadNpyError),
    #[error(transparent)]
    NpyWrite(#[from] ndarray_npy::WriteNpyError),
    #[error(transparent)]
    IoError(#[from] io::Error),
}
