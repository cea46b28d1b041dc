//! Error types for regpack

use regpack_oci::OciError;
use thiserror::Error;

use crate::pipeline::PipelineState;

/// Result type alias using regpack Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in regpack operations
#[derive(Error, Debug)]
pub enum Error {
    /// Registry, manifest, layer or archive errors from the core
    #[error(transparent)]
    Oci(#[from] OciError),

    /// A download aborted; `state` is where the pipeline stopped
    #[error("download failed while {state}: {source}")]
    Pipeline {
        state: PipelineState,
        #[source]
        source: Box<Error>,
    },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// YAML config errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Requested archive does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// File name rejected before touching the filesystem
    #[error("invalid file name: {0}")]
    InvalidName(String),
}

impl Error {
    /// The core error at the bottom of a pipeline failure, if any.
    pub fn oci(&self) -> Option<&OciError> {
        match self {
            Error::Oci(e) => Some(e),
            Error::Pipeline { source, .. } => source.oci(),
            _ => None,
        }
    }

    /// State the pipeline failed in, for pipeline failures.
    pub fn failed_state(&self) -> Option<PipelineState> {
        match self {
            Error::Pipeline { state, .. } => Some(*state),
            _ => None,
        }
    }

    /// Short text for end users.  The detail lives in the log.
    pub fn user_message(&self) -> String {
        match self {
            Error::NotFound(name) => format!("File not found: {}", name),
            Error::InvalidName(name) => format!("Invalid file name: {}", name),
            Error::Config(msg) => format!("Configuration error: {}", msg),
            Error::Oci(OciError::InvalidReference(msg)) => format!("Invalid image: {}", msg),
            _ => "Download failed. Check the log for details.".to_string(),
        }
    }
}
