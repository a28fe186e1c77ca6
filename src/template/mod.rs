//! Profiled template attack with on-disk checkpoints.
//!
//! A [`TemplateAttack`] session lives in a folder and goes through three phases:
//! 1. [`TemplateAttack::compute_pca`] fits a PCA basis over the mean trace of each class,
//! 2. [`TemplateAttack::fit`] estimates one Gaussian per class in the PCA subspace,
//! 3. [`TemplateAttack::guessing_metrics`] attacks traces and evaluates the rank of the key.
//!
//! Each phase saves its results in the session folder. Opening a session on an existing folder
//! resumes from the last completed phase.
use log::{debug, info, warn};
use ndarray::{Array1, Array2, Array3, ArrayView2, Axis};
use std::{
    fs,
    path::{Path, PathBuf},
};

#[cfg(feature = "progress_bar")]
use crate::util::progress_bar;
#[cfg(feature = "progress_bar")]
use indicatif::ProgressIterator;

use crate::{
    Error,
    leakage_model::{Aes, Cipher, LeakageTarget},
    loader::StreamingLoader,
    processors::ClassSums,
    rank,
    trace::TraceBatch,
    util::{argmax_by, key_to_hex},
};

pub mod artifacts;
pub mod config;
pub mod gaussian;
pub mod pca;
pub mod predictor;
pub mod status;

pub use artifacts::{PcaArtifacts, SessionPaths, TemplateArtifacts};
pub use config::{TemplateConfig, TraceCount};
pub use predictor::{NUM_KEYS, TemplateSet};
pub use status::{Phase, Status};

/// Result of a phase request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOutcome {
    Completed,
    /// The phase was already computed and `force` was not set
    Skipped,
}

/// Attack results averaged over the attacked files.
#[derive(Debug, Clone)]
pub struct GuessingMetrics {
    /// Mean rank of the key with every trace of the shortest attack
    pub guessing_entropy: f64,
    /// Mean guessing distance over the attacked files
    pub guessing_distance: f64,
    /// Rank of the key after each trace, one row per attacked file
    pub ranks: Array2<usize>,
}

impl GuessingMetrics {
    fn from_ranks(ranks: Array2<usize>, guessing_distance: f64) -> Self {
        let guessing_entropy = rank::guessing_entropy(ranks.view())
            .last()
            .copied()
            .unwrap_or(f64::NAN);

        Self {
            guessing_entropy,
            guessing_distance,
            ranks,
        }
    }

    /// Returns the mean rank of the key after each trace.
    pub fn guessing_entropy_curve(&self) -> Array1<f64> {
        rank::guessing_entropy(self.ranks.view())
    }

    /// Returns the fraction of attacked files ranking the key first after each trace.
    pub fn success_rate(&self) -> Array1<f64> {
        rank::success_rate(self.ranks.view())
    }

    /// Returns the number of traces from which the guessing entropy stays at 1.
    pub fn traces_to_one(&self) -> Option<usize> {
        rank::guessing_entropy_to_one(self.guessing_entropy_curve().view())
    }
}

/// Template attack session.
pub struct TemplateAttack<C: Cipher = Aes> {
    config: TemplateConfig,
    target: LeakageTarget<C>,
    paths: SessionPaths,
    status: Status,
    pca: Option<PcaArtifacts>,
    templates: Option<(TemplateArtifacts, TemplateSet)>,
    log_floor: Option<f64>,
}

impl TemplateAttack<Aes> {
    /// Opens an AES template attack session in `folder`, creating it if needed.
    pub fn open<P: AsRef<Path>>(folder: P, config: TemplateConfig) -> Result<Self, Error> {
        Self::with_cipher(folder, config, Aes)
    }
}

impl<C: Cipher> TemplateAttack<C> {
    /// Opens a template attack session in `folder`, creating it if needed.
    ///
    /// The session status is derived from the files present in the folder, and the artifacts
    /// of completed phases are loaded.
    pub fn with_cipher<P: AsRef<Path>>(
        folder: P,
        config: TemplateConfig,
        cipher: C,
    ) -> Result<Self, Error> {
        config.validate()?;
        let target = LeakageTarget::new(cipher, config.mode, config.target_byte)?;
        let paths = SessionPaths::new(folder);
        paths.create_dirs()?;

        let status = Status::from_completed(|phase| paths.is_complete(phase));
        let mut session = Self {
            config,
            target,
            paths,
            status,
            pca: None,
            templates: None,
            log_floor: None,
        };

        if status >= Status::PcaReady {
            session.pca = Some(PcaArtifacts::load(&session.paths)?);
        }
        if status >= Status::TemplatesReady {
            session.load_templates(TemplateArtifacts::load(&session.paths)?)?;
        }

        if status == Status::Empty {
            session.write_config()?;
        } else if fs::read_to_string(session.paths.config()).ok() != Some(session.config.summary())
        {
            warn!(
                "Configuration differs from the one saved in {}",
                session.paths.config().display()
            );
        }

        info!(
            "Opened template session {} ({status})",
            session.paths.root().display()
        );
        Ok(session)
    }

    /// Replaces the log-likelihood of zero density entries by `ln(floor)`.
    ///
    /// By default, these entries are set to 0.
    pub fn with_log_floor(self, floor: Option<f64>) -> Self {
        Self {
            log_floor: floor,
            ..self
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn config(&self) -> &TemplateConfig {
        &self.config
    }

    pub fn target(&self) -> &LeakageTarget<C> {
        &self.target
    }

    pub fn paths(&self) -> &SessionPaths {
        &self.paths
    }

    pub fn pca(&self) -> Option<&PcaArtifacts> {
        self.pca.as_ref()
    }

    pub fn templates(&self) -> Option<&TemplateArtifacts> {
        self.templates.as_ref().map(|(artifacts, _)| artifacts)
    }

    /// Returns the dimension of the templates.
    pub fn template_dim(&self) -> usize {
        self.target.num_classes().min(self.config.n_principal_comp)
    }

    /// Computes the PCA basis from the class means of the profiling traces of `files`.
    ///
    /// Every file holds traces recorded with a single key.
    pub fn compute_pca<P: AsRef<Path>>(
        &mut self,
        files: &[P],
        force: bool,
    ) -> Result<PhaseOutcome, Error> {
        let files = to_paths(files)?;
        if !self.begin(Phase::Pca, force)? {
            return Ok(PhaseOutcome::Skipped);
        }
        self.write_config()?;

        info!("Computing PCA over {} files", files.len());
        let num_classes = self.target.num_classes();
        let mut sums: Option<ClassSums> = None;
        self.accumulate(files, self.config.n_traces.limit(), |batch, classes| {
            let sums =
                sums.get_or_insert_with(|| ClassSums::new(num_classes, batch.num_samples()));
            check_num_samples(sums.size(), batch)?;
            sums.update(batch.traces.view(), classes);
            Ok(())
        })?;
        let sums = sums.ok_or(Error::NoInputFiles)?;

        let pca = pca::fit(sums.means().view(), num_classes)?;
        pca.save(&self.paths)?;
        self.pca = Some(pca);
        self.status = Status::PcaReady;
        info!("PCA saved in {}", self.paths.root().display());

        Ok(PhaseOutcome::Completed)
    }

    /// Estimates the mean and covariance of each class in the PCA subspace from the profiling
    /// traces of `files`.
    pub fn fit<P: AsRef<Path>>(&mut self, files: &[P], force: bool) -> Result<PhaseOutcome, Error> {
        let files = to_paths(files)?;
        if !self.begin(Phase::Fit, force)? {
            return Ok(PhaseOutcome::Skipped);
        }

        let pca = self.pca.as_ref().ok_or(Error::PhaseNotReady(Phase::Fit))?;
        let num_classes = self.target.num_classes();
        let dim = self.template_dim().min(pca.components.nrows());
        info!("Fitting {num_classes} templates of dimension {dim}");

        let mut sums = ClassSums::with_outer_products(num_classes, dim);
        self.accumulate(files, self.config.n_traces.limit(), |batch, classes| {
            check_num_samples(pca.mean.len(), batch)?;
            let projected = pca::transform(batch.traces.view(), pca, dim);
            sums.update(projected.view(), classes);
            Ok(())
        })?;

        let artifacts = TemplateArtifacts {
            means: sums.means(),
            covariances: sums
                .covariances()
                .unwrap_or_else(|| Array3::zeros((num_classes, dim, dim))),
        };
        for (class, &count) in sums.counts().iter().enumerate() {
            if count < 2 {
                debug!("Class {class} has {count} traces, its template is degenerate");
            }
        }
        artifacts.save(&self.paths)?;
        self.load_templates(artifacts)?;
        self.status = Status::TemplatesReady;
        info!("Templates saved in {}", self.paths.root().display());

        Ok(PhaseOutcome::Completed)
    }

    /// Returns the log-likelihood of every key byte hypothesis for each trace, of shape
    /// `(traces, 256)`.
    ///
    /// Traces are raw, they get preprocessed and projected as during profiling.
    pub fn predict(
        &self,
        traces: ArrayView2<f64>,
        plaintexts: ArrayView2<u8>,
    ) -> Result<Array2<f64>, Error> {
        if traces.nrows() != plaintexts.nrows() {
            return Err(Error::ShapeMismatch(format!(
                "{} traces for {} plaintexts",
                traces.nrows(),
                plaintexts.nrows()
            )));
        }

        let traces = self.config.preprocessor().apply(traces);
        self.score(traces.view(), plaintexts)
    }

    /// Attacks the traces of `files`, using the first `n_traces` of each file (all when `None`),
    /// and evaluates the rank of the key.
    ///
    /// If the metrics were already computed and `force` is not set, the saved ranks are
    /// returned.
    pub fn guessing_metrics<P: AsRef<Path>>(
        &mut self,
        files: &[P],
        n_traces: Option<usize>,
        force: bool,
    ) -> Result<GuessingMetrics, Error> {
        let files = to_paths(files)?;
        if !self.begin(Phase::Metrics, force)? {
            let ranks = artifacts::load_ranks(&self.paths)?;
            let guessing_distance = artifacts::load_guessing_distance(&self.paths)?;
            return Ok(GuessingMetrics::from_ranks(ranks, guessing_distance));
        }

        info!("Attacking {} files", files.len());
        let num_files = files.len();
        let mut curves = Vec::with_capacity(num_files);
        let mut distance_sum = 0.;
        let batches = StreamingLoader::trace_files(files, n_traces, self.config.preprocessor());
        #[cfg(feature = "progress_bar")]
        let batches = batches.progress_with(progress_bar(num_files));
        for batch in batches {
            let batch = batch?;
            let scores = self.score(batch.traces.view(), batch.plaintexts.view())?;
            let key_byte = self.target.key_byte(&batch.key) as usize;
            let (curve, distance) = rank::evaluate(scores.view(), key_byte);

            let best = argmax_by(scores.sum_axis(Axis(0)).view(), |a, b| a.total_cmp(b));
            info!(
                "Key {}: best guess {best:#04x}, key byte {key_byte:#04x}, final rank {}",
                key_to_hex(&batch.key),
                curve.last().copied().unwrap_or(0)
            );
            distance_sum += distance;
            curves.push(curve);
        }

        let ranks = rank::stack_curves(&curves);
        let metrics = GuessingMetrics::from_ranks(ranks, distance_sum / num_files as f64);
        artifacts::save_metrics(
            &self.paths,
            &metrics.ranks,
            metrics.guessing_entropy,
            metrics.guessing_distance,
            metrics.traces_to_one(),
            &self.config.summary(),
        )?;
        self.status = Status::MetricsReady;
        info!(
            "Guessing entropy {}, guessing distance {}",
            metrics.guessing_entropy, metrics.guessing_distance
        );

        Ok(metrics)
    }

    /// Checks whether `phase` can run. Returns `false` if it is already computed and `force`
    /// is not set.
    ///
    /// Files of `phase` and of the later phases are removed before running, as they would not
    /// match the new results.
    fn begin(&mut self, phase: Phase, force: bool) -> Result<bool, Error> {
        match self.status.begin(phase, force) {
            Ok(status) => {
                if status < self.status {
                    warn!("Files of {phase} already exist, overriding files...");
                }
                self.paths.remove_from(phase)?;
                if status < Status::TemplatesReady {
                    self.templates = None;
                }
                if status < Status::PcaReady {
                    self.pca = None;
                }
                self.status = status;
                debug!("Starting {phase} from status {status}");
                Ok(true)
            }
            Err(Error::ArtifactsExist(phase)) => {
                warn!(
                    "Files of {phase} already exist, aborting operation. If you want to override \
                     them, set `force`."
                );
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Streams the traces of `files` with their classes under the true key.
    fn accumulate<F>(
        &self,
        files: Vec<PathBuf>,
        n_traces: Option<usize>,
        mut fold: F,
    ) -> Result<(), Error>
    where
        F: FnMut(&TraceBatch, &[usize]) -> Result<(), Error>,
    {
        let num_files = files.len();
        let batches = StreamingLoader::trace_files(files, n_traces, self.config.preprocessor());
        #[cfg(feature = "progress_bar")]
        let batches = batches.progress_with(progress_bar(num_files));
        for (i, batch) in batches.enumerate() {
            let batch = batch?;
            self.target.check_plaintext_len(batch.plaintexts.ncols())?;
            let key_byte = self.target.key_byte(&batch.key);
            let classes = self.target.classify_batch(batch.plaintexts.view(), key_byte);
            fold(&batch, &classes)?;
            debug!("Processed file {}/{num_files} ({} traces)", i + 1, batch.len());
        }
        Ok(())
    }

    /// Scores preprocessed traces against the templates.
    fn score(
        &self,
        traces: ArrayView2<f64>,
        plaintexts: ArrayView2<u8>,
    ) -> Result<Array2<f64>, Error> {
        let (Some(pca), Some((_, templates))) = (self.pca.as_ref(), self.templates.as_ref())
        else {
            return Err(Error::PhaseNotReady(Phase::Metrics));
        };
        self.target.check_plaintext_len(plaintexts.ncols())?;
        if traces.ncols() != pca.mean.len() {
            return Err(Error::ShapeMismatch(format!(
                "traces have {} samples after preprocessing, templates expect {}",
                traces.ncols(),
                pca.mean.len()
            )));
        }

        let projected = pca::transform(traces, pca, templates.dim());
        let floor = self.log_floor.map_or(0., f64::ln);
        templates.par_score(projected.view(), plaintexts, &self.target, floor)
    }

    fn load_templates(&mut self, artifacts: TemplateArtifacts) -> Result<(), Error> {
        let set = TemplateSet::new(&artifacts, self.config.n_principal_comp)?;
        if set.num_classes() != self.target.num_classes() {
            return Err(Error::ShapeMismatch(format!(
                "{} templates saved for {} classes of {}",
                set.num_classes(),
                self.target.num_classes(),
                self.config.mode
            )));
        }
        self.templates = Some((artifacts, set));
        Ok(())
    }

    fn write_config(&self) -> Result<(), Error> {
        fs::write(self.paths.config(), self.config.summary())?;
        Ok(())
    }
}

fn to_paths<P: AsRef<Path>>(files: &[P]) -> Result<Vec<PathBuf>, Error> {
    if files.is_empty() {
        return Err(Error::NoInputFiles);
    }
    Ok(files.iter().map(|file| file.as_ref().to_path_buf()).collect())
}

fn check_num_samples(expected: usize, batch: &TraceBatch) -> Result<(), Error> {
    if batch.num_samples() != expected {
        return Err(Error::ShapeMismatch(format!(
            "traces have {} samples after preprocessing, expected {expected}",
            batch.num_samples()
        )));
    }
    Ok(())
}
