pub mod error;
pub mod leakage_detection;
pub mod leakage_model;
pub mod loader;
pub mod preprocessors;
pub mod processors;
pub mod rank;
pub mod template;
pub mod trace;
pub mod trace_store;
pub mod util;

pub use crate::error::Error;
