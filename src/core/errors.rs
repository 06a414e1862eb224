use std::path::PathBuf;

use thiserror::Error;

use crate::core::domain::Termination;
use crate::core::traits::process::SpawnError;

/// Errors in how the harness was set up. These halt the affected task and are
/// never turned into a score.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("invalid resource limits: {reason}")]
    InvalidLimits { reason: String },

    #[error("safety multiplier must be greater than 1.0, got {0}")]
    InvalidSafetyMultiplier(f64),

    #[error("no sample inputs given for calibration")]
    NoSamples,

    #[error("invalid task configuration: {msg}")]
    InvalidConfig { msg: String },

    #[error("{context} ({path}): {source}")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl HarnessError {
    pub fn io(
        context: &'static str,
        path: impl Into<PathBuf>,
    ) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| HarnessError::Io {
            context,
            path,
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum CheckerError {
    /// The checker reported that checking itself failed.
    #[error("checker failed{}: {message}", .exit_code.map(|c| format!(" with exit code {c}")).unwrap_or_default())]
    InternalError {
        exit_code: Option<i32>,
        message: String,
    },

    /// The checker exited successfully but its output breaks the protocol.
    #[error("checker protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    #[error(transparent)]
    Harness(#[from] HarnessError),
}

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error(transparent)]
    Configuration(#[from] HarnessError),

    #[error("reference program failed on sample #{sample}: {termination}")]
    ReferenceCrashed {
        sample: usize,
        termination: Termination,
    },

    #[error("reference program did not finish sample #{sample} within the provisional ceiling")]
    ReferenceTimedOut { sample: usize },

    #[error("reference program exceeded the provisional memory ceiling on sample #{sample}")]
    ReferenceOutOfMemory { sample: usize },
}

impl CalibrationError {
    pub fn from_failed_sample(sample: usize, termination: Termination) -> Self {
        match termination {
            Termination::TimedOut => CalibrationError::ReferenceTimedOut { sample },
            Termination::OutOfMemory => CalibrationError::ReferenceOutOfMemory { sample },
            termination => CalibrationError::ReferenceCrashed {
                sample,
                termination,
            },
        }
    }
}
