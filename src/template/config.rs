use serde::{Deserialize, Serialize};
use std::{
    fmt,
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};

use crate::{Error, leakage_model::LeakageModel, preprocessors::Preprocessor};

/// Number of traces used from each file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceCount {
    #[default]
    All,
    Limit(usize),
}

impl TraceCount {
    /// Returns the limit, `None` meaning every trace of the file.
    pub fn limit(&self) -> Option<usize> {
        match self {
            TraceCount::All => None,
            TraceCount::Limit(n) => Some(*n),
        }
    }
}

impl From<Option<usize>> for TraceCount {
    fn from(n: Option<usize>) -> Self {
        n.map_or(TraceCount::All, TraceCount::Limit)
    }
}

impl fmt::Display for TraceCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceCount::All => f.write_str("all"),
            TraceCount::Limit(n) => write!(f, "{n}"),
        }
    }
}

/// Parameters of a template attack session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateConfig {
    /// Leakage point of the attack
    pub mode: LeakageModel,
    /// Attacked byte of the key
    pub target_byte: usize,
    /// Apply a high-pass filter to the traces
    pub filter: bool,
    /// Number of consecutive samples averaged together
    pub aggregate_n_samples: usize,
    /// Number of principal components kept in the templates
    pub n_principal_comp: usize,
    /// Number of profiling traces used per file
    pub n_traces: TraceCount,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            mode: LeakageModel::SboxOutput,
            target_byte: 0,
            filter: false,
            aggregate_n_samples: 1,
            n_principal_comp: 10,
            n_traces: TraceCount::All,
        }
    }
}

impl fmt::Display for TemplateConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "N. profiling traces: {}", self.n_traces)?;
        writeln!(f, "Filter: {}", self.filter)?;
        writeln!(f, "Aggregation: {}", self.aggregate_n_samples)?;
        writeln!(f, "N. PCA component: {}", self.n_principal_comp)?;
        writeln!(f, "Mode: {}", self.mode)?;
        writeln!(f, "Target byte: {}", self.target_byte)
    }
}

impl TemplateConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.target_byte >= 16 {
            return Err(Error::InvalidTargetByte(self.target_byte));
        }
        if self.aggregate_n_samples == 0 {
            return Err(Error::InvalidConfig(
                "aggregate_n_samples must be at least 1".to_string(),
            ));
        }
        if self.n_principal_comp == 0 {
            return Err(Error::InvalidConfig(
                "n_principal_comp must be at least 1".to_string(),
            ));
        }
        if self.n_traces == TraceCount::Limit(0) {
            return Err(Error::InvalidConfig(
                "n_traces must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Returns the preprocessing applied to every trace of the session.
    pub fn preprocessor(&self) -> Preprocessor {
        Preprocessor::new(self.aggregate_n_samples, self.filter)
    }

    /// Returns the human readable summary of the configuration.
    pub fn summary(&self) -> String {
        self.to_string()
    }

    /// Save the configuration to a JSON file.
    ///
    /// # Warning
    /// The file format is not stable as tascat is active development. Thus, the format might
    /// change between versions.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let mut file = BufWriter::new(File::create(path)?);
        serde_json::to_writer(&mut file, self)?;
        file.flush()?;
        Ok(())
    }

    /// Load a configuration from a JSON file.
    ///
    /// # Warning
    /// The file format is not stable as tascat is active development. Thus, the format might
    /// change between versions.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file = BufReader::new(File::open(path)?);
        let config: Self = serde_json::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }
}
