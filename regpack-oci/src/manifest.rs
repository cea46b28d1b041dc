use serde::{Deserialize, Serialize};

use crate::{OciError, Result};

// ---------------------------------------------------------------------------
// Single-platform manifest
// ---------------------------------------------------------------------------

/// A single-platform image manifest (Docker v2 schema 2 or OCI).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SingleManifest {
    #[serde(rename = "schemaVersion", default = "default_schema_version")]
    pub schema_version: u32,

    #[serde(rename = "mediaType", default)]
    pub media_type: String,

    /// Optional at parse time so a config-less manifest can be reported as
    /// unusable instead of failing deserialization.
    #[serde(default)]
    pub config: Option<Descriptor>,

    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

impl SingleManifest {
    /// Digest of the image config blob, if the manifest carries one.
    pub fn config_digest(&self) -> Option<&str> {
        self.config
            .as_ref()
            .map(|c| c.digest.as_str())
            .filter(|d| !d.is_empty())
    }
}

fn default_schema_version() -> u32 {
    2
}

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// A content-addressable descriptor used in both manifests and manifest lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType", default)]
    pub media_type: String,

    pub digest: String,

    #[serde(default)]
    pub size: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

/// Target platform for a manifest inside a manifest list.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Platform {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    pub fn new(os: &str, architecture: &str) -> Self {
        Self {
            architecture: architecture.to_string(),
            os: os.to_string(),
            variant: None,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(ref v) = self.variant {
            write!(f, "/{}", v)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Manifest list (image index)
// ---------------------------------------------------------------------------

/// A Docker manifest list or OCI image index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestList {
    #[serde(rename = "schemaVersion", default = "default_schema_version")]
    pub schema_version: u32,

    #[serde(rename = "mediaType", default)]
    pub media_type: String,

    #[serde(default)]
    pub manifests: Vec<Descriptor>,
}

/// How a manifest list entry was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformMatch {
    /// The entry's os and architecture equal the requested ones.
    Exact,
    /// Nothing matched; the first entry of the list was taken instead.
    Fallback,
}

impl ManifestList {
    /// Select the entry for `target` (os + architecture; the variant is not
    /// considered).  When no entry matches, the first entry in list order is
    /// returned with [`PlatformMatch::Fallback`].  Only an empty list fails.
    pub fn select_platform(&self, target: &Platform) -> Result<(&Descriptor, PlatformMatch)> {
        let exact = self.manifests.iter().find(|d| {
            d.platform
                .as_ref()
                .map(|p| p.os == target.os && p.architecture == target.architecture)
                .unwrap_or(false)
        });

        if let Some(desc) = exact {
            return Ok((desc, PlatformMatch::Exact));
        }

        self.manifests
            .first()
            .map(|desc| (desc, PlatformMatch::Fallback))
            .ok_or_else(|| {
                OciError::NoMatchingPlatform(format!(
                    "manifest list is empty; cannot resolve {}",
                    target
                ))
            })
    }

    /// Platforms advertised by the list, in list order.
    pub fn platforms(&self) -> Vec<Platform> {
        self.manifests
            .iter()
            .map(|d| d.platform.clone().unwrap_or_default())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// What a tag's manifest endpoint returned: a list still to be resolved, or
/// a single manifest.
#[derive(Debug, Clone)]
pub enum ManifestEnvelope {
    List(ManifestList),
    Single(SingleManifest),
}

impl ManifestEnvelope {
    /// Classify a parsed manifest document by its `mediaType`.  Indexes that
    /// omit `mediaType` are recognized by their `manifests` array.
    pub fn classify(raw: serde_json::Value) -> Result<Self> {
        let media_type = raw.get("mediaType").and_then(|v| v.as_str()).unwrap_or("");

        if is_list_media_type(media_type) || (media_type.is_empty() && raw.get("manifests").is_some())
        {
            let list: ManifestList = serde_json::from_value(raw)
                .map_err(|e| OciError::Manifest(format!("malformed manifest list: {}", e)))?;
            Ok(ManifestEnvelope::List(list))
        } else {
            let single: SingleManifest = serde_json::from_value(raw)
                .map_err(|e| OciError::Manifest(format!("malformed manifest: {}", e)))?;
            Ok(ManifestEnvelope::Single(single))
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ManifestEnvelope::List(_) => "list",
            ManifestEnvelope::Single(_) => "single",
        }
    }
}

// ---------------------------------------------------------------------------
// Media type constants
// ---------------------------------------------------------------------------

pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Accept list for a tag lookup: single manifests and lists.
pub const ACCEPT_ANY_MANIFEST: [&str; 4] = [
    MEDIA_TYPE_DOCKER_MANIFEST,
    MEDIA_TYPE_DOCKER_MANIFEST_LIST,
    MEDIA_TYPE_OCI_MANIFEST,
    MEDIA_TYPE_OCI_INDEX,
];

/// Accept list for a by-digest lookup after list resolution.  Nested lists
/// are not supported.
pub const ACCEPT_SINGLE_MANIFEST: [&str; 2] = [MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_OCI_MANIFEST];

/// Returns `true` when `media_type` is a manifest list / image index.
pub fn is_list_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_INDEX || media_type == MEDIA_TYPE_DOCKER_MANIFEST_LIST
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
