use std::path::PathBuf;

use thiserror::Error;

/// Errors that can be returned by the sampler.
///
/// Violated preconditions (dimension mismatches, step sizes outside the
/// leapfrog stability range, ...) are not represented here, they panic.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum HmcError {
    #[error("I/O error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Could not encode the runtime log")]
    Json(#[from] serde_json::Error),
    #[error("Invalid random generator state: {0}")]
    InvalidRandomState(String),
    #[error("Invalid chain state: {0}")]
    InvalidChainState(String),
    #[error("Rank {0} stopped responding")]
    RankDisconnected(usize),
    #[error("Rank {rank} sent {got} while {expected} was expected")]
    UnexpectedMessage {
        rank: usize,
        expected: &'static str,
        got: &'static str,
    },
    #[error("Only some ranks found a log to resume from: {0:?}")]
    InconsistentResume(Vec<bool>),
    #[error("Ranks resumed from different packets: burn-in {burn:?}, samples {samples:?}")]
    MismatchedResume { burn: Vec<u64>, samples: Vec<u64> },
    #[error("Rank {0} resumed from a different position than rank 0")]
    DivergedPosition(usize),
}

impl HmcError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        HmcError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, HmcError>;
