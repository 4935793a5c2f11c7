use std::io;
use std::path::PathBuf;

use rdmx_verbs::{ErrorKind, RdmaError, WireError};
use thiserror::Error;

pub type Result<T, E = LambdaError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum LambdaError {
    #[error(transparent)]
    Rdma(#[from] RdmaError),

    #[error("malformed lambda record: {0}")]
    Wire(#[from] WireError),

    #[error("code is empty")]
    EmptyCode,

    #[error("code is {size} bytes, the limit is {max}")]
    CodeTooLarge { size: usize, max: usize },

    #[error("entry offset {entry_offset} is outside the {code_size}-byte code")]
    EntryOutOfRange { entry_offset: u64, code_size: usize },

    #[error("input is {size} bytes, the input region holds {max}")]
    InputTooLarge { size: usize, max: usize },

    #[error("failed to read code from {}: {source}", path.display())]
    CodeLoad {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("code region {op} failed: {source}")]
    CodeRegion {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("buffer of {capacity} bytes is too small for the lambda protocol (need {need})")]
    BufferTooSmall { capacity: usize, need: usize },
}

impl LambdaError {
    /// Maps onto the engine's device/resource/communication split.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LambdaError::Rdma(e) => e.kind(),
            LambdaError::Wire(_) => ErrorKind::Communication,
            LambdaError::EmptyCode
            | LambdaError::CodeTooLarge { .. }
            | LambdaError::EntryOutOfRange { .. }
            | LambdaError::InputTooLarge { .. }
            | LambdaError::CodeLoad { .. }
            | LambdaError::CodeRegion { .. }
            | LambdaError::BufferTooSmall { .. } => ErrorKind::Resource,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, LambdaError::Rdma(e) if e.is_cancelled())
    }
}
