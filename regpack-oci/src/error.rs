/// Errors produced by the registry-to-archive core.
#[derive(Debug, thiserror::Error)]
pub enum OciError {
    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("no matching platform: {0}")]
    NoMatchingPlatform(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("download of {digest} failed: {reason}")]
    Download { digest: String, reason: String },

    #[error("image config has no rootfs.diff_ids")]
    MissingDiffIds,

    #[error("no layers could be decompressed")]
    NoLayersProduced,

    #[error("packaging error: {0}")]
    Packaging(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OciError>;
