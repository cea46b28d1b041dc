use crate::error::{OciError, Result};
use crate::layer::hex_encode;
use crate::manifest::{
    ManifestEnvelope, Platform, PlatformMatch, SingleManifest, ACCEPT_ANY_MANIFEST,
    ACCEPT_SINGLE_MANIFEST,
};
use crate::normalize;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// RegistryConfig
// ---------------------------------------------------------------------------

/// Endpoints and timeouts for talking to a Docker-compatible registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Registry base URL (e.g. "https://registry-1.docker.io").
    pub registry_url: String,
    /// Token service base URL; tokens come from `<auth_url>/token`.
    pub auth_url: String,
    /// `service` parameter sent to the token service.
    pub service: String,
    /// Timeout for token, manifest and config requests.
    pub metadata_timeout: Duration,
    /// Timeout for layer blob downloads.
    pub blob_timeout: Duration,
    pub user_agent: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            registry_url: "https://registry-1.docker.io".to_string(),
            auth_url: "https://auth.docker.io".to_string(),
            service: "registry.docker.io".to_string(),
            metadata_timeout: Duration::from_secs(30),
            blob_timeout: Duration::from_secs(600),
            user_agent: concat!("regpack/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// RegistryClient
// ---------------------------------------------------------------------------

/// Registry HTTP client: token auth, manifests and blobs.  No request is
/// retried; every failure is returned to the caller.
pub struct RegistryClient {
    config: RegistryConfig,
    metadata: reqwest::Client,
    blobs: reqwest::Client,
    /// Pull tokens, one per repository.
    tokens: Mutex<HashMap<String, SecretString>>,
}

/// A blob written to disk by [`RegistryClient::download_blob`].
#[derive(Debug, Clone)]
pub struct DownloadedBlob {
    pub path: PathBuf,
    pub size: u64,
    /// Whether the SHA-256 of the received bytes equals the requested digest.
    pub digest_matches: bool,
}

impl RegistryClient {
    pub fn new(config: RegistryConfig) -> Result<Self> {
        let metadata = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.metadata_timeout)
            .build()?;
        let blobs = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.blob_timeout)
            .build()?;
        Ok(Self {
            config,
            metadata,
            blobs,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    // -- auth ---------------------------------------------------------------

    /// Request a pull-scoped token for `repository` and cache it.
    pub async fn authenticate(&self, repository: &str) -> Result<()> {
        let url = format!("{}/token", self.config.auth_url.trim_end_matches('/'));
        let scope = format!("repository:{}:pull", repository);
        info!(repository, "authenticating");

        let resp = self
            .metadata
            .get(&url)
            .query(&[
                ("service", self.config.service.as_str()),
                ("scope", scope.as_str()),
            ])
            .send()
            .await
            .map_err(|e| OciError::Auth(format!("token service unreachable: {}", e)))?;

        let status = resp.status();
        if status != StatusCode::OK {
            warn!(repository, %status, "token request rejected");
            return Err(OciError::Auth(format!(
                "token service returned {} for {}",
                status, repository
            )));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| OciError::Auth(format!("unreadable token response: {}", e)))?;
        let token = body
            .get("token")
            .or_else(|| body.get("access_token"))
            .and_then(|v| v.as_str())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| OciError::Auth("token response missing token field".to_string()))?;

        self.lock_tokens()
            .insert(repository.to_string(), SecretString::from(token.to_string()));
        info!(repository, "authenticated");
        Ok(())
    }

    /// Whether a token is cached for `repository`.
    pub fn has_token(&self, repository: &str) -> bool {
        self.lock_tokens().contains_key(repository)
    }

    /// Drop the cached token for `repository`.  The next request for it
    /// authenticates again.
    pub fn forget_token(&self, repository: &str) {
        if self.lock_tokens().remove(repository).is_some() {
            debug!(repository, "token dropped");
        }
    }

    /// `Authorization` header value for `repository`, authenticating first
    /// when no token is held.
    async fn bearer(&self, repository: &str) -> Result<String> {
        if let Some(header) = self.cached_bearer(repository) {
            return Ok(header);
        }
        self.authenticate(repository).await?;
        self.cached_bearer(repository)
            .ok_or_else(|| OciError::Auth(format!("no token held for {}", repository)))
    }

    fn cached_bearer(&self, repository: &str) -> Option<String> {
        self.lock_tokens()
            .get(repository)
            .map(|t| format!("Bearer {}", t.expose_secret()))
    }

    fn lock_tokens(&self) -> std::sync::MutexGuard<'_, HashMap<String, SecretString>> {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -- manifests ----------------------------------------------------------

    /// Fetch the manifest for `tag`, which may be a single manifest or a
    /// manifest list.
    pub async fn get_manifest(&self, repository: &str, tag: &str) -> Result<ManifestEnvelope> {
        let raw = self
            .fetch_manifest_json(repository, tag, &ACCEPT_ANY_MANIFEST)
            .await?;
        let envelope = ManifestEnvelope::classify(raw)?;
        info!(repository, tag, kind = envelope.kind(), "manifest loaded");
        Ok(envelope)
    }

    /// Fetch a single-platform manifest by digest.
    pub async fn get_manifest_by_digest(
        &self,
        repository: &str,
        digest: &str,
    ) -> Result<SingleManifest> {
        let raw = self
            .fetch_manifest_json(repository, digest, &ACCEPT_SINGLE_MANIFEST)
            .await?;
        match ManifestEnvelope::classify(raw)? {
            ManifestEnvelope::Single(m) => Ok(m),
            ManifestEnvelope::List(_) => Err(OciError::Manifest(format!(
                "{} in {} is itself a manifest list; nested lists are not supported",
                digest, repository
            ))),
        }
    }

    /// Turn a fetched envelope into a usable single manifest.  Lists are
    /// resolved for `platform` (falling back to the first entry) and the
    /// chosen manifest is fetched by digest.  A manifest without a config
    /// digest is rejected.
    pub async fn resolve_manifest(
        &self,
        repository: &str,
        envelope: ManifestEnvelope,
        platform: &Platform,
    ) -> Result<SingleManifest> {
        let manifest = match envelope {
            ManifestEnvelope::Single(m) => m,
            ManifestEnvelope::List(list) => {
                for p in list.platforms() {
                    debug!(platform = %p, "available platform");
                }
                let (desc, how) = list.select_platform(platform)?;
                let chosen = desc.platform.clone().unwrap_or_default();
                match how {
                    PlatformMatch::Exact => {
                        info!(platform = %chosen, digest = %desc.digest, "selected platform")
                    }
                    PlatformMatch::Fallback => warn!(
                        requested = %platform,
                        chosen = %chosen,
                        digest = %desc.digest,
                        "requested platform not in manifest list; falling back to first entry",
                    ),
                }
                let digest = desc.digest.clone();
                self.get_manifest_by_digest(repository, &digest).await?
            }
        };

        match manifest.config_digest() {
            Some(config) => {
                info!(layers = manifest.layers.len(), config, "manifest resolved");
                Ok(manifest)
            }
            None => Err(OciError::Manifest(format!(
                "manifest for {} has no config digest",
                repository
            ))),
        }
    }

    async fn fetch_manifest_json(
        &self,
        repository: &str,
        reference: &str,
        accept: &[&str],
    ) -> Result<serde_json::Value> {
        let bearer = self.bearer(repository).await?;
        let url = self.url(repository, "manifests", reference);
        info!(%url, "fetching manifest");

        let resp = self
            .metadata
            .get(&url)
            .header(AUTHORIZATION, bearer)
            .header(ACCEPT, accept.join(", "))
            .send()
            .await
            .map_err(|e| OciError::Manifest(format!("GET {} failed: {}", url, e)))?;

        let status = resp.status();
        if status != StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            return Err(OciError::Manifest(format!(
                "GET {} returned {}: {}",
                url, status, body
            )));
        }

        resp.json()
            .await
            .map_err(|e| OciError::Manifest(format!("unparseable manifest from {}: {}", url, e)))
    }

    // -- blobs --------------------------------------------------------------

    /// Fetch and parse the image config blob.  Redirects (e.g. to a CDN) are
    /// followed.
    pub async fn get_config(&self, repository: &str, digest: &str) -> Result<serde_json::Value> {
        let bearer = self.bearer(repository).await?;
        let url = self.url(repository, "blobs", digest);
        info!(%url, "fetching config blob");

        let resp = self
            .metadata
            .get(&url)
            .header(AUTHORIZATION, bearer)
            .send()
            .await
            .map_err(|e| OciError::Config(format!("GET {} failed: {}", url, e)))?;

        let status = resp.status();
        debug!(%status, digest, "config blob response");
        if status != StatusCode::OK {
            return Err(OciError::Config(format!(
                "config blob {} returned {}",
                digest, status
            )));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| OciError::Config(format!("reading config blob {}: {}", digest, e)))?;
        let config: serde_json::Value = serde_json::from_slice(&bytes).map_err(|e| {
            let preview: String = String::from_utf8_lossy(&bytes).chars().take(200).collect();
            OciError::Config(format!(
                "config blob {} is not valid JSON ({}): {}",
                digest, e, preview
            ))
        })?;
        if !config.is_object() {
            return Err(OciError::Config(format!(
                "config blob {} is not a JSON object",
                digest
            )));
        }

        info!(
            digest,
            diff_ids = normalize::diff_ids(&config).len(),
            "config loaded"
        );
        Ok(config)
    }

    /// Stream a blob to `dest` without buffering it in memory.  The partial
    /// file is removed on any failure.
    pub async fn download_blob(
        &self,
        repository: &str,
        digest: &str,
        dest: &Path,
    ) -> Result<DownloadedBlob> {
        match self.stream_blob(repository, digest, dest).await {
            Ok(blob) => Ok(blob),
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(dest).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %dest.display(), error = %rm, "could not remove partial blob");
                    }
                }
                Err(e)
            }
        }
    }

    async fn stream_blob(
        &self,
        repository: &str,
        digest: &str,
        dest: &Path,
    ) -> Result<DownloadedBlob> {
        let download_err = |reason: String| OciError::Download {
            digest: digest.to_string(),
            reason,
        };

        let bearer = self.bearer(repository).await?;
        let url = self.url(repository, "blobs", digest);
        debug!(%url, "downloading blob");

        let resp = self
            .blobs
            .get(&url)
            .header(AUTHORIZATION, bearer)
            .send()
            .await
            .map_err(|e| download_err(format!("GET {} failed: {}", url, e)))?;

        let status = resp.status();
        if status != StatusCode::OK {
            return Err(download_err(format!("GET {} returned {}", url, status)));
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| download_err(format!("create {}: {}", dest.display(), e)))?;
        let mut hasher = Sha256::new();
        let mut size: u64 = 0;

        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| download_err(format!("reading body: {}", e)))?;
            hasher.update(&chunk);
            file.write_all(&chunk)
                .await
                .map_err(|e| download_err(format!("write {}: {}", dest.display(), e)))?;
            size += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| download_err(format!("flush {}: {}", dest.display(), e)))?;

        let actual = hex_encode(&hasher.finalize());
        let expected = digest.strip_prefix("sha256:").unwrap_or(digest);
        let digest_matches = actual == expected;
        if !digest_matches {
            warn!(digest, actual = %actual, "blob digest mismatch");
        }

        Ok(DownloadedBlob {
            path: dest.to_path_buf(),
            size,
            digest_matches,
        })
    }

    fn url(&self, repository: &str, kind: &str, reference: &str) -> String {
        format!(
            "{}/v2/{}/{}/{}",
            self.config.registry_url.trim_end_matches('/'),
            repository,
            kind,
            reference
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
