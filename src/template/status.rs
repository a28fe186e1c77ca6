use std::fmt;

use crate::Error;

/// Computation phase of a template attack session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Pca,
    Fit,
    Metrics,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Pca, Phase::Fit, Phase::Metrics];

    /// Returns the status reached once the phase completes.
    pub fn target(&self) -> Status {
        match self {
            Phase::Pca => Status::PcaReady,
            Phase::Fit => Status::TemplatesReady,
            Phase::Metrics => Status::MetricsReady,
        }
    }

    /// Returns the status required to run the phase.
    pub fn prerequisite(&self) -> Status {
        match self {
            Phase::Pca => Status::Empty,
            Phase::Fit => Status::PcaReady,
            Phase::Metrics => Status::TemplatesReady,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Pca => "PCA",
            Phase::Fit => "template fit",
            Phase::Metrics => "guessing metrics",
        })
    }
}

/// Progress of a template attack session, ordered from nothing computed to metrics computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Status {
    #[default]
    Empty = 0,
    PcaReady = 1,
    TemplatesReady = 2,
    MetricsReady = 3,
}

impl Status {
    /// Derives the status from the phases whose artifacts are present, `completed` being
    /// queried in phase order. A phase only counts if all the previous ones also completed.
    pub fn from_completed<F>(mut completed: F) -> Self
    where
        F: FnMut(Phase) -> bool,
    {
        let mut status = Status::Empty;
        for phase in Phase::ALL {
            if !completed(phase) {
                break;
            }
            status = phase.target();
        }
        status
    }

    /// Checks whether `phase` can run from this status, returning the status to start from.
    ///
    /// With `force`, a phase already completed restarts from its prerequisite. Without it,
    /// [`Error::ArtifactsExist`] is returned. [`Error::PhaseNotReady`] is returned if the
    /// prerequisite is not met, whatever `force`.
    pub fn begin(self, phase: Phase, force: bool) -> Result<Status, Error> {
        if self >= phase.target() {
            if force {
                Ok(phase.prerequisite())
            } else {
                Err(Error::ArtifactsExist(phase))
            }
        } else if self < phase.prerequisite() {
            Err(Error::PhaseNotReady(phase))
        } else {
            Ok(self)
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::Empty => "empty",
            Status::PcaReady => "PCA ready",
            Status::TemplatesReady => "templates ready",
            Status::MetricsReady => "metrics computed",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Phase, Status};
    use crate::Error;

    #[test]
    fn test_from_completed() {
        assert_eq!(Status::from_completed(|_| false), Status::Empty);
        assert_eq!(Status::from_completed(|_| true), Status::MetricsReady);
        assert_eq!(Status::from_completed(|phase| phase == Phase::Pca), Status::PcaReady);
        // Templates without PCA are not usable
        assert_eq!(Status::from_completed(|phase| phase != Phase::Pca), Status::Empty);
        assert_eq!(
            Status::from_completed(|phase| phase != Phase::Metrics),
            Status::TemplatesReady
        );
    }

    #[test]
    fn test_begin() {
        assert_eq!(Status::Empty.begin(Phase::Pca, false).unwrap(), Status::Empty);
        assert_eq!(
            Status::PcaReady.begin(Phase::Fit, false).unwrap(),
            Status::PcaReady
        );
        assert!(matches!(
            Status::Empty.begin(Phase::Fit, true),
            Err(Error::PhaseNotReady(Phase::Fit))
        ));
        assert!(matches!(
            Status::PcaReady.begin(Phase::Metrics, false),
            Err(Error::PhaseNotReady(Phase::Metrics))
        ));
        assert!(matches!(
            Status::TemplatesReady.begin(Phase::Pca, false),
            Err(Error::ArtifactsExist(Phase::Pca))
        ));
    }

    #[test]
    fn test_force_regresses() {
        for phase in Phase::ALL {
            assert_eq!(
                Status::MetricsReady.begin(phase, true).unwrap(),
                phase.prerequisite()
            );
        }
        assert_eq!(
            Status::PcaReady.begin(Phase::Pca, true).unwrap(),
            Status::Empty
        );
    }
}
