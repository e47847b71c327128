use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::core::cancel::Cancelled;

/// Which half of the tracker already holds a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    Active,
    Settled,
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Partition::Active => f.write_str("active"),
            Partition::Settled => f.write_str("settled"),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to launch '{executable}': {source}")]
    LaunchFailure {
        executable: String,
        #[source]
        source: std::io::Error,
    },

    #[error("result file {path} is already {partition}")]
    DuplicateFile { path: PathBuf, partition: Partition },

    #[error("{path} is not a result file of this simulation")]
    InvalidResultFile { path: PathBuf },

    #[error("optimization could not be prepared: {0}")]
    Preparation(String),

    #[error("spectrum reconstruction failed: {0}")]
    Reconstruction(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("operation was cancelled")]
    Cancelled,
}

impl From<Cancelled> for EngineError {
    fn from(_: Cancelled) -> Self {
        EngineError::Cancelled
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Why the supervisor refused to start a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StartRejection {
    #[error("a simulation or optimization is already running")]
    AlreadyRunning,
    #[error("the simulation has no recoil distribution")]
    NoRecoil,
    #[error("the supervisor thread could not be spawned")]
    SpawnFailed,
}
