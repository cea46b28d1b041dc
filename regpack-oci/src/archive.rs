use crate::error::{OciError, Result};
use crate::layer::{extract_layer, hex_digest, BuiltLayer, LayerBlob};
use crate::normalize;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// File name of the archive manifest inside the tar.
pub const ARCHIVE_MANIFEST: &str = "manifest.json";

/// One entry of `manifest.json` in a `docker load` archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveManifestEntry {
    #[serde(rename = "Config")]
    pub config: String,
    #[serde(rename = "RepoTags")]
    pub repo_tags: Vec<String>,
    #[serde(rename = "Layers")]
    pub layers: Vec<String>,
}

/// What [`ArchiveBuilder::build`] produced.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub archive_path: PathBuf,
    pub archive_size: u64,
    /// `<configHash>.json`
    pub config_file: String,
    /// Layers in manifest order, each with its verification outcome.
    pub layers: Vec<BuiltLayer>,
}

impl BuildReport {
    pub fn mismatched_layers(&self) -> usize {
        self.layers
            .iter()
            .filter(|l| !l.verification.is_verified())
            .count()
    }
}

/// Assembles a `docker load` tar from a working directory of downloaded
/// layer blobs and an image config.
pub struct ArchiveBuilder {
    work_dir: PathBuf,
    output: PathBuf,
}

impl ArchiveBuilder {
    pub fn new(work_dir: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            output: output.into(),
        }
    }

    /// Build the archive for `repo_tag` (e.g. "alpine:latest").
    ///
    /// `layers` is the ordered list of downloaded blobs; `layers[i].index`
    /// selects `rootfs.diff_ids[index]` of the normalized config.  The output
    /// path is only written once packing has fully succeeded.  On success the
    /// working directory is removed; on failure it is left for inspection.
    pub fn build(
        &self,
        repo_tag: &str,
        layers: &[LayerBlob],
        config: serde_json::Value,
    ) -> Result<BuildReport> {
        info!(work_dir = %self.work_dir.display(), "building archive");

        let config = normalize::normalize(config);
        let config_bytes = normalize::to_archive_bytes(&config)?;
        let config_file = format!("{}.json", hex_digest(&config_bytes));
        fs::write(self.work_dir.join(&config_file), &config_bytes)?;
        info!(config_file = %config_file, "config written");

        let diff_ids = normalize::diff_ids(&config);
        info!(count = diff_ids.len(), "config diffIDs");
        if diff_ids.is_empty() {
            return Err(OciError::MissingDiffIds);
        }

        let mut ordered: Vec<&LayerBlob> = layers.iter().collect();
        ordered.sort_by_key(|l| l.index);

        let mut built = Vec::with_capacity(ordered.len());
        for blob in ordered {
            let Some(diff_id) = diff_ids.get(blob.index) else {
                warn!(
                    layer = blob.index,
                    digest = %blob.digest,
                    "no diffID for layer; skipping",
                );
                continue;
            };
            info!(layer = blob.index, diff_id = %diff_id, "decompressing layer");
            built.push(extract_layer(blob, diff_id, &self.work_dir)?);
        }

        if built.is_empty() {
            return Err(OciError::NoLayersProduced);
        }

        let entry = ArchiveManifestEntry {
            config: config_file.clone(),
            repo_tags: vec![repo_tag.to_string()],
            layers: built.iter().map(|l| l.archive_path.clone()).collect(),
        };
        fs::write(
            self.work_dir.join(ARCHIVE_MANIFEST),
            serde_json::to_vec(&[&entry])?,
        )?;
        info!(layers = built.len(), "archive manifest written");

        let mut members = vec![config_file.clone(), ARCHIVE_MANIFEST.to_string()];
        members.extend(entry.layers.iter().cloned());
        let archive_size = self.pack(&members)?;
        info!(
            path = %self.output.display(),
            size = archive_size,
            "archive created",
        );

        if let Err(e) = fs::remove_dir_all(&self.work_dir) {
            warn!(work_dir = %self.work_dir.display(), error = %e, "could not remove working directory");
        }

        Ok(BuildReport {
            archive_path: self.output.clone(),
            archive_size,
            config_file,
            layers: built,
        })
    }

    /// Tar `members` (paths relative to the working directory) into a
    /// staging file next to the output, then rename it onto the output path.
    /// Each build gets its own staging file, so concurrent builds of the same
    /// output never write into each other's archive.
    fn pack(&self, members: &[String]) -> Result<u64> {
        let parent = match self.output.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;

        let prefix = format!(
            ".{}.",
            self.output
                .file_name()
                .map(|n| n.to_string_lossy())
                .unwrap_or_default()
        );
        // Removed on drop if anything below fails.
        let staging = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".partial")
            .tempfile_in(parent)
            .map_err(|e| OciError::Packaging(format!("create archive: {}", e)))?;
        debug!(staging = %staging.path().display(), "packing archive");

        self.write_tar(staging.as_file(), members)?;
        staging.persist(&self.output).map_err(|e| {
            OciError::Packaging(format!("rename {}: {}", e.file.path().display(), e.error))
        })?;

        Ok(fs::metadata(&self.output)?.len())
    }

    fn write_tar(&self, dest: &File, members: &[String]) -> Result<()> {
        let packaging =
            |what: &str, e: std::io::Error| OciError::Packaging(format!("{}: {}", what, e));

        let mut builder = tar::Builder::new(BufWriter::new(dest));
        builder.mode(tar::HeaderMode::Deterministic);

        for member in members {
            let src = self.work_dir.join(member);
            if !src.is_file() {
                return Err(OciError::Packaging(format!("missing archive member {}", member)));
            }
            debug!(member = %member, "packing");
            builder
                .append_path_with_name(&src, member)
                .map_err(|e| packaging(member.as_str(), e))?;
        }

        let mut out = builder
            .into_inner()
            .map_err(|e| packaging("finish archive", e))?;
        out.flush().map_err(|e| packaging("flush archive", e))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
