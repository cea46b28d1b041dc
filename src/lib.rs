//! regpack: pull container images from a Docker registry and repackage
//! them as `docker load` archives.
//!
//! # Key Features
//!
//! - **Multi-arch aware**: manifest lists are resolved to one platform
//! - **Loadable output**: normalized config, `manifest.json`, one
//!   `<diffID>/layer.tar` per layer
//! - **Observable**: checkpointed progress per session plus a structured log
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use regpack::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::load(None)?;
//!     let downloader = Downloader::new(&settings)?;
//!
//!     let store = Arc::new(MemoryProgressStore::new());
//!     let reporter = ProgressReporter::new(store, "cli");
//!
//!     let request = DownloadRequest::new("alpine").tag("3.20");
//!     let report = downloader.download(&request, &reporter).await?;
//!     println!("{} ({} bytes)", report.archive_path.display(), report.archive_size);
//!     Ok(())
//! }
//! ```

pub mod artifacts;
pub mod config;
pub mod daemon;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod progress;

// Re-exports for convenience
pub use error::{Error, Result};
pub use regpack_oci as oci;

// Prelude for common imports
pub mod prelude {
    pub use crate::config::Settings;
    pub use crate::error::{Error, Result};
    pub use crate::pipeline::{DownloadReport, DownloadRequest, Downloader, PipelineState};
    pub use crate::progress::{
        MemoryProgressStore, ProgressReporter, ProgressStage, ProgressState, ProgressStore,
    };
    pub use regpack_oci::Architecture;
}
