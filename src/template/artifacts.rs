//! On-disk layout of a template attack session.
use log::debug;
use ndarray::{Array1, Array2, Array3};
use ndarray_npy::{read_npy, write_npy};
use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use crate::{Error, template::Phase};

/// Paths of the files of a session folder.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    root: PathBuf,
    model: PathBuf,
}

impl SessionPaths {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref().to_path_buf();
        let model = root.join("model");
        Self { root, model }
    }

    /// Creates the session and model folders if missing.
    pub fn create_dirs(&self) -> Result<(), Error> {
        fs::create_dir_all(&self.model)?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pca_components(&self) -> PathBuf {
        self.model.join("pca_components.npy")
    }

    pub fn pca_mean(&self) -> PathBuf {
        self.model.join("pca_mean.npy")
    }

    pub fn mean_matrix(&self) -> PathBuf {
        self.model.join("mean_matrix.npy")
    }

    pub fn cov_matrix(&self) -> PathBuf {
        self.model.join("cov_matrix.npy")
    }

    pub fn ranks(&self) -> PathBuf {
        self.root.join("ranks.npy")
    }

    pub fn results(&self) -> PathBuf {
        self.root.join("attack_metrics.txt")
    }

    pub fn config(&self) -> PathBuf {
        self.root.join("config.txt")
    }

    /// Returns the files written by `phase`.
    pub fn phase_files(&self, phase: Phase) -> [PathBuf; 2] {
        match phase {
            Phase::Pca => [self.pca_components(), self.pca_mean()],
            Phase::Fit => [self.mean_matrix(), self.cov_matrix()],
            Phase::Metrics => [self.ranks(), self.results()],
        }
    }

    /// Returns `true` if every file of `phase` exists.
    pub fn is_complete(&self, phase: Phase) -> bool {
        self.phase_files(phase).iter().all(|path| path.is_file())
    }

    /// Removes the files of `phase` and of every later phase.
    pub fn remove_from(&self, phase: Phase) -> Result<(), Error> {
        for later in Phase::ALL.into_iter().filter(|p| *p >= phase) {
            for path in self.phase_files(later) {
                if path.is_file() {
                    debug!("Removing {}", path.display());
                    fs::remove_file(path)?;
                }
            }
        }
        Ok(())
    }
}

/// PCA basis and centering mean.
#[derive(Debug, Clone, PartialEq)]
pub struct PcaArtifacts {
    /// Components, one per row
    pub components: Array2<f64>,
    pub mean: Array1<f64>,
}

impl PcaArtifacts {
    pub fn save(&self, paths: &SessionPaths) -> Result<(), Error> {
        write_npy(paths.pca_components(), &self.components)?;
        write_npy(paths.pca_mean(), &self.mean)?;
        Ok(())
    }

    pub fn load(paths: &SessionPaths) -> Result<Self, Error> {
        Ok(Self {
            components: read_npy(paths.pca_components())?,
            mean: read_npy(paths.pca_mean())?,
        })
    }
}

/// Class means and covariances in the PCA subspace.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateArtifacts {
    /// Mean of each class, one per row
    pub means: Array2<f64>,
    /// Covariance matrix of each class
    pub covariances: Array3<f64>,
}

impl TemplateArtifacts {
    pub fn save(&self, paths: &SessionPaths) -> Result<(), Error> {
        write_npy(paths.mean_matrix(), &self.means)?;
        write_npy(paths.cov_matrix(), &self.covariances)?;
        Ok(())
    }

    pub fn load(paths: &SessionPaths) -> Result<Self, Error> {
        Ok(Self {
            means: read_npy(paths.mean_matrix())?,
            covariances: read_npy(paths.cov_matrix())?,
        })
    }
}

const GUESSING_DISTANCE_LABEL: &str = "Guessing distance: ";

/// Saves the rank curves and the summary of an attack.
pub fn save_metrics(
    paths: &SessionPaths,
    ranks: &Array2<usize>,
    guessing_entropy: f64,
    guessing_distance: f64,
    traces_to_one: Option<usize>,
    config_summary: &str,
) -> Result<(), Error> {
    write_npy(paths.ranks(), &ranks.mapv(|rank| rank as u64))?;

    let mut file = BufWriter::new(File::create(paths.results())?);
    writeln!(file, "{GUESSING_DISTANCE_LABEL}{guessing_distance}")?;
    writeln!(file, "Guessing entropy: {guessing_entropy}")?;
    match traces_to_one {
        Some(n) => writeln!(file, "Traces to guessing entropy 1: {n}")?,
        None => writeln!(file, "Traces to guessing entropy 1: never")?,
    }
    writeln!(file, "N. attacked files: {}", ranks.nrows())?;
    write!(file, "{config_summary}")?;
    file.flush()?;
    Ok(())
}

/// Loads the rank curves saved by [`save_metrics`].
pub fn load_ranks(paths: &SessionPaths) -> Result<Array2<usize>, Error> {
    let ranks: Array2<u64> = read_npy(paths.ranks())?;
    Ok(ranks.mapv(|rank| rank as usize))
}

/// Reads back the guessing distance from the attack summary, NaN if it cannot be parsed.
pub fn load_guessing_distance(paths: &SessionPaths) -> Result<f64, Error> {
    let summary = fs::read_to_string(paths.results())?;
    Ok(summary
        .lines()
        .find_map(|line| line.strip_prefix(GUESSING_DISTANCE_LABEL))
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(f64::NAN))
}
