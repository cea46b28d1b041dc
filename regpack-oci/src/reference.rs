use crate::error::{OciError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Organization that single-component names are namespaced under.
pub const DEFAULT_NAMESPACE: &str = "library";

/// Default tag used when none (or a blank one) is supplied.
pub const DEFAULT_TAG: &str = "latest";

// ---------------------------------------------------------------------------
// Architecture
// ---------------------------------------------------------------------------

/// CPU architectures a download can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    #[default]
    Amd64,
    Arm64,
    Arm,
}

impl Architecture {
    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::Amd64 => "amd64",
            Architecture::Arm64 => "arm64",
            Architecture::Arm => "arm",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = OciError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "amd64" | "x86_64" => Ok(Architecture::Amd64),
            "arm64" | "aarch64" => Ok(Architecture::Arm64),
            "arm" => Ok(Architecture::Arm),
            other => Err(OciError::InvalidReference(format!(
                "unsupported architecture '{}'",
                other
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// ImageReference
// ---------------------------------------------------------------------------

/// What the caller asked for: an image name, a tag and a target platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Name as entered (e.g. "alpine" or "grafana/grafana").
    pub name: String,
    pub tag: String,
    pub architecture: Architecture,
    pub os: String,
}

impl ImageReference {
    /// Build a reference from raw user input.
    ///
    /// Both fields are trimmed.  A blank tag becomes `latest`; a blank name is
    /// rejected.
    pub fn new(name: &str, tag: &str, architecture: Architecture) -> Result<Self> {
        let name = name.trim();
        if name.is_empty() {
            return Err(OciError::InvalidReference("empty image name".to_string()));
        }

        let tag = match tag.trim() {
            "" => DEFAULT_TAG,
            t => t,
        };

        Ok(Self {
            name: name.to_string(),
            tag: tag.to_string(),
            architecture,
            os: "linux".to_string(),
        })
    }

    /// Registry repository path.  Names without a slash live under
    /// `library/`.
    pub fn repository(&self) -> String {
        if self.name.contains('/') {
            self.name.clone()
        } else {
            format!("{}/{}", DEFAULT_NAMESPACE, self.name)
        }
    }

    /// The `RepoTags` entry written into the archive manifest.
    pub fn repo_tag(&self) -> String {
        format!("{}:{}", self.name, self.tag)
    }

    /// Filesystem-safe stem shared by the archive and its working directory.
    pub fn safe_name(&self) -> String {
        sanitize(&format!("{}_{}_{}", self.name, self.tag, self.architecture))
    }

    /// File name of the finished archive.
    pub fn archive_file_name(&self) -> String {
        format!("{}.tar", self.safe_name())
    }

    /// Working directory name for a download started at `timestamp_ms`.
    pub fn work_dir_name(&self, timestamp_ms: u64) -> String {
        format!("{}_tmp_{}", self.safe_name(), timestamp_ms)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} ({}/{})",
            self.repository(),
            self.tag,
            self.os,
            self.architecture
        )
    }
}

/// Replace every character outside `[A-Za-z0-9_-]` with `_`.
pub fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
