//! Pipeline: pull one image from the registry and turn it into a
//! `docker load` archive.
//!
//! Every stage runs one after another and the first failure aborts the
//! download.  Nothing is retried.
//!
//! # Example
//!
//! ```no_run
//! use regpack::config::Settings;
//! use regpack::pipeline::{DownloadRequest, Downloader};
//! use regpack::progress::ProgressReporter;
//!
//! # async fn demo() -> regpack::Result<()> {
//! let settings = Settings::default();
//! let downloader = Downloader::new(&settings)?;
//! let report = downloader
//!     .download(&DownloadRequest::new("alpine"), &ProgressReporter::disabled())
//!     .await?;
//! println!("wrote {}", report.archive_path.display());
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use regpack_oci::layer::{blob_file_name, diff_id_hex};
use regpack_oci::normalize;
use regpack_oci::{
    Architecture, ArchiveBuilder, BuiltLayer, ImageReference, LayerBlob, ManifestEnvelope,
    OciError, Platform, RegistryClient,
};

use crate::config::Settings;
use crate::progress::ProgressReporter;
use crate::{Error, Result};

/// Where a download is.  `Failed` is expressed by the `Error::Pipeline`
/// carrying the state the failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Init,
    Authenticating,
    ResolvingManifest,
    ResolvingPlatform,
    FetchingConfig,
    DownloadingLayers,
    BuildingArchive,
    Done,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::Init => "initializing",
            PipelineState::Authenticating => "authenticating",
            PipelineState::ResolvingManifest => "resolving manifest",
            PipelineState::ResolvingPlatform => "resolving platform",
            PipelineState::FetchingConfig => "fetching config",
            PipelineState::DownloadingLayers => "downloading layers",
            PipelineState::BuildingArchive => "building archive",
            PipelineState::Done => "done",
        };
        f.write_str(s)
    }
}

/// What to download.  Missing tag and architecture fall back to the
/// configured defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub name: String,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub architecture: Option<Architecture>,
}

impl DownloadRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: None,
            architecture: None,
        }
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn architecture(mut self, architecture: Architecture) -> Self {
        self.architecture = Some(architecture);
        self
    }

    pub fn reference(&self, default_tag: &str, default_arch: Architecture) -> Result<ImageReference> {
        let tag = self.tag.as_deref().unwrap_or(default_tag);
        let architecture = self.architecture.unwrap_or(default_arch);
        Ok(ImageReference::new(&self.name, tag, architecture)?)
    }
}

/// Result of a successful download.
#[derive(Debug, Clone)]
pub struct DownloadReport {
    pub reference: ImageReference,
    pub archive_path: PathBuf,
    pub archive_size: u64,
    pub config_file: String,
    pub layers: Vec<BuiltLayer>,
    /// Working directory used (and removed) by this download.
    pub work_dir: PathBuf,
}

impl DownloadReport {
    pub fn mismatched_layers(&self) -> usize {
        self.layers
            .iter()
            .filter(|l| !l.verification.is_verified())
            .count()
    }
}

/// Runs downloads against one registry into one download directory.
pub struct Downloader {
    client: RegistryClient,
    download_dir: PathBuf,
    default_tag: String,
    default_architecture: Architecture,
}

impl Downloader {
    pub fn new(settings: &Settings) -> Result<Self> {
        let client = RegistryClient::new(settings.registry_config()?)?;
        Ok(Self::with_client(client, settings))
    }

    pub fn with_client(client: RegistryClient, settings: &Settings) -> Self {
        Self {
            client,
            download_dir: settings.download_dir.clone(),
            default_tag: settings.default_tag.clone(),
            default_architecture: settings.default_architecture,
        }
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub fn client(&self) -> &RegistryClient {
        &self.client
    }

    /// Download `request` and build its archive.  The progress slot is
    /// cleared whether the download succeeds or fails.
    pub async fn download(
        &self,
        request: &DownloadRequest,
        reporter: &ProgressReporter,
    ) -> Result<DownloadReport> {
        reporter.preparing();
        let result = self.run(request, reporter).await;
        reporter.finish();

        if let Err(ref e) = result {
            error!(image = %request.name, error = %e, "=== download failed ===");
        }
        result
    }

    async fn run(
        &self,
        request: &DownloadRequest,
        reporter: &ProgressReporter,
    ) -> Result<DownloadReport> {
        let reference = request.reference(&self.default_tag, self.default_architecture)?;
        let repository = reference.repository();

        // A pull token lives for one download session only.
        let result = self.run_session(reference, &repository, reporter).await;
        self.client.forget_token(&repository);
        result
    }

    async fn run_session(
        &self,
        reference: ImageReference,
        repository: &str,
        reporter: &ProgressReporter,
    ) -> Result<DownloadReport> {
        info!(image = %reference, "=== download started ===");

        let mut progress = Progression::new(repository);

        progress.enter(PipelineState::Authenticating);
        self.client
            .authenticate(repository)
            .await
            .map_err(|e| progress.fail(e))?;

        progress.enter(PipelineState::ResolvingManifest);
        let envelope = self
            .client
            .get_manifest(repository, &reference.tag)
            .await
            .map_err(|e| progress.fail(e))?;
        if matches!(envelope, ManifestEnvelope::List(_)) {
            progress.enter(PipelineState::ResolvingPlatform);
        }
        let platform = Platform::new(&reference.os, reference.architecture.as_str());
        let manifest = self
            .client
            .resolve_manifest(repository, envelope, &platform)
            .await
            .map_err(|e| progress.fail(e))?;

        progress.enter(PipelineState::FetchingConfig);
        let config_digest = manifest
            .config_digest()
            .ok_or_else(|| progress.fail(OciError::Manifest("manifest has no config digest".into())))?
            .to_string();
        let config = self
            .client
            .get_config(repository, &config_digest)
            .await
            .map_err(|e| progress.fail(e))?;

        let diff_ids = normalize::diff_ids(&config);
        if diff_ids.is_empty() {
            return Err(progress.fail(OciError::MissingDiffIds));
        }
        if diff_ids.len() != manifest.layers.len() {
            return Err(progress.fail(OciError::Config(format!(
                "config lists {} diffIDs but the manifest has {} layers",
                diff_ids.len(),
                manifest.layers.len()
            ))));
        }
        for diff_id in &diff_ids {
            diff_id_hex(diff_id).map_err(|e| progress.fail(e))?;
        }

        progress.enter(PipelineState::DownloadingLayers);
        let work_dir = create_work_dir(&self.download_dir, &reference)
            .await
            .map_err(|e| progress.fail(e))?;
        info!(work_dir = %work_dir.display(), "working directory created");

        let total = manifest.layers.len();
        info!(layers = total, "starting layer downloads");
        reporter.downloading(total as u64);

        let mut blobs = Vec::with_capacity(total);
        for (index, desc) in manifest.layers.iter().enumerate() {
            let current = index + 1;
            reporter.layer(current as u64, total as u64);
            info!(layer = current, total, digest = %desc.digest, "downloading layer");

            let dest = work_dir.join(blob_file_name(index, total, &desc.digest, &desc.media_type));
            let blob = self
                .client
                .download_blob(repository, &desc.digest, &dest)
                .await
                .map_err(|e| progress.fail(e))?;
            info!(
                layer = current,
                size_mb = %format!("{:.2}", mib(blob.size)),
                "layer downloaded",
            );

            blobs.push(LayerBlob {
                index,
                digest: desc.digest.clone(),
                media_type: desc.media_type.clone(),
                size: blob.size,
                path: blob.path,
            });
        }

        progress.enter(PipelineState::BuildingArchive);
        reporter.packing(total as u64);

        let output = self.download_dir.join(reference.archive_file_name());
        let repo_tag = reference.repo_tag();
        let builder = ArchiveBuilder::new(&work_dir, &output);
        let build = tokio::task::spawn_blocking(move || builder.build(&repo_tag, &blobs, config))
            .await
            .map_err(|e| progress.fail(OciError::Packaging(format!("archive task panicked: {}", e))))?
            .map_err(|e| progress.fail(e))?;

        let mismatched = build.mismatched_layers();
        if mismatched > 0 {
            warn!(mismatched, "archive built with layers that failed diffID verification");
        }

        progress.enter(PipelineState::Done);
        info!(
            archive = %build.archive_path.display(),
            size_mb = %format!("{:.2}", mib(build.archive_size)),
            "=== download complete ===",
        );

        Ok(DownloadReport {
            reference,
            archive_path: build.archive_path,
            archive_size: build.archive_size,
            config_file: build.config_file,
            layers: build.layers,
            work_dir,
        })
    }
}

/// Tracks the current state and tags errors with it.
struct Progression<'a> {
    repository: &'a str,
    state: PipelineState,
}

impl<'a> Progression<'a> {
    fn new(repository: &'a str) -> Self {
        Self {
            repository,
            state: PipelineState::Init,
        }
    }

    fn enter(&mut self, next: PipelineState) {
        info!(repository = self.repository, from = %self.state, to = %next, "pipeline state");
        self.state = next;
    }

    fn fail(&self, err: impl Into<Error>) -> Error {
        Error::Pipeline {
            state: self.state,
            source: Box::new(err.into()),
        }
    }
}

/// Create a fresh `<safe>_tmp_<ms>` directory under `download_dir`, bumping
/// the suffix until the name is unused.
async fn create_work_dir(download_dir: &Path, reference: &ImageReference) -> Result<PathBuf> {
    tokio::fs::create_dir_all(download_dir).await?;

    let mut ts = now_ms();
    loop {
        let dir = download_dir.join(reference.work_dir_name(ts));
        match tokio::fs::create_dir(&dir).await {
            Ok(()) => return Ok(dir),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => ts += 1,
            Err(e) => return Err(e.into()),
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn mib(bytes: u64) -> f64 {
    bytes as f64 / 1024.0 / 1024.0
}
