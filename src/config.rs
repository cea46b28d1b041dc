use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regpack_oci::{Architecture, RegistryConfig};

use crate::{Error, Result};

pub const ENV_DOWNLOAD_DIR: &str = "REGPACK_DOWNLOAD_DIR";
pub const ENV_LOG_FILE: &str = "REGPACK_LOG_FILE";
pub const ENV_REGISTRY_URL: &str = "REGPACK_REGISTRY_URL";
pub const ENV_AUTH_URL: &str = "REGPACK_AUTH_URL";

/// Process settings.  Every field has a default, so an empty file (or no
/// file at all) is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Where finished archives and per-download working directories live.
    pub download_dir: PathBuf,
    /// Append-only pipeline log.
    pub log_file: PathBuf,
    /// Daemon bind address.
    pub listen: String,
    pub default_tag: String,
    pub default_architecture: Architecture,
    pub registry: RegistrySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("./downloads"),
            log_file: PathBuf::from("./download.log"),
            listen: "127.0.0.1:43100".to_string(),
            default_tag: regpack_oci::reference::DEFAULT_TAG.to_string(),
            default_architecture: Architecture::Amd64,
            registry: RegistrySettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    pub url: String,
    pub auth_url: String,
    pub service: String,
    /// Token, manifest and config requests, e.g. "30s".
    pub metadata_timeout: String,
    /// Layer downloads, e.g. "10m".
    pub blob_timeout: String,
    pub user_agent: Option<String>,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        let defaults = RegistryConfig::default();
        Self {
            url: defaults.registry_url,
            auth_url: defaults.auth_url,
            service: defaults.service,
            metadata_timeout: humantime::format_duration(defaults.metadata_timeout).to_string(),
            blob_timeout: humantime::format_duration(defaults.blob_timeout).to_string(),
            user_agent: None,
        }
    }
}

impl Settings {
    /// Load settings from an optional YAML or JSON file, then apply
    /// `REGPACK_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.apply_overrides(|key| std::env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;

        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
            .unwrap_or(false);

        if is_yaml {
            serde_yaml::from_str(&raw)
                .map_err(|e| Error::Config(format!("invalid YAML config {}: {}", path.display(), e)))
        } else {
            serde_json::from_str(&raw)
                .map_err(|e| Error::Config(format!("invalid JSON config {}: {}", path.display(), e)))
        }
    }

    /// Apply overrides looked up through `lookup` (the environment in
    /// production).  Blank values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get(ENV_DOWNLOAD_DIR) {
            self.download_dir = PathBuf::from(v);
        }
        if let Some(v) = get(ENV_LOG_FILE) {
            self.log_file = PathBuf::from(v);
        }
        if let Some(v) = get(ENV_REGISTRY_URL) {
            self.registry.url = v;
        }
        if let Some(v) = get(ENV_AUTH_URL) {
            self.registry.auth_url = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_tag.trim().is_empty() {
            return Err(Error::Config("default_tag cannot be empty".into()));
        }
        self.listen_addr()?;
        self.registry.to_config()?;
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen
            .parse()
            .map_err(|e| Error::Config(format!("invalid listen address '{}': {}", self.listen, e)))
    }

    pub fn registry_config(&self) -> Result<RegistryConfig> {
        self.registry.to_config()
    }
}

impl RegistrySettings {
    pub fn to_config(&self) -> Result<RegistryConfig> {
        let defaults = RegistryConfig::default();
        for (name, url) in [("registry.url", &self.url), ("registry.auth_url", &self.auth_url)] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(Error::Config(format!(
                    "{} must be an http(s) URL, got '{}'",
                    name, url
                )));
            }
        }
        Ok(RegistryConfig {
            registry_url: self.url.trim_end_matches('/').to_string(),
            auth_url: self.auth_url.trim_end_matches('/').to_string(),
            service: self.service.clone(),
            metadata_timeout: parse_timeout("registry.metadata_timeout", &self.metadata_timeout)?,
            blob_timeout: parse_timeout("registry.blob_timeout", &self.blob_timeout)?,
            user_agent: self.user_agent.clone().unwrap_or(defaults.user_agent),
        })
    }
}

fn parse_timeout(field: &str, raw: &str) -> Result<Duration> {
    humantime::parse_duration(raw.trim())
        .map_err(|e| Error::Config(format!("invalid {} '{}': {}", field, raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_docker_hub() {
        let s = Settings::default();
        assert_eq!(s.download_dir, PathBuf::from("./downloads"));
        assert_eq!(s.default_tag, "latest");
        assert_eq!(s.default_architecture, Architecture::Amd64);

        let reg = s.registry_config().unwrap();
        assert_eq!(reg.registry_url, "https://registry-1.docker.io");
        assert_eq!(reg.auth_url, "https://auth.docker.io");
        assert_eq!(reg.metadata_timeout, Duration::from_secs(30));
        assert_eq!(reg.blob_timeout, Duration::from_secs(600));
    }

    #[test]
    fn yaml_file_with_partial_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("regpack.yaml");
        fs::write(
            &path,
            "download_dir: /srv/images\ndefault_architecture: arm64\nregistry:\n  blob_timeout: 2m\n",
        )
        .unwrap();

        let s = Settings::from_file(&path).unwrap();
        assert_eq!(s.download_dir, PathBuf::from("/srv/images"));
        assert_eq!(s.default_architecture, Architecture::Arm64);
        assert_eq!(s.listen, "127.0.0.1:43100");

        let reg = s.registry_config().unwrap();
        assert_eq!(reg.blob_timeout, Duration::from_secs(120));
        assert_eq!(reg.metadata_timeout, Duration::from_secs(30));
    }

    #[test]
    fn json_file_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("regpack.json");
        fs::write(&path, r#"{"registry":{"url":"http://localhost:5000/"}}"#).unwrap();

        let s = Settings::from_file(&path).unwrap();
        assert_eq!(s.registry_config().unwrap().registry_url, "http://localhost:5000");
    }

    #[test]
    fn invalid_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.yml");
        fs::write(&path, "download_dir: [unclosed").unwrap();

        let err = Settings::from_file(&path).unwrap_err();
        assert!(matches!(err, Error::Config(ref m) if m.contains("broken.yml")));
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = Settings::load(Some(Path::new("/nonexistent/regpack.yaml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn overrides_replace_file_values() {
        let env: HashMap<&str, &str> = [
            (ENV_DOWNLOAD_DIR, "/tmp/out"),
            (ENV_REGISTRY_URL, "http://127.0.0.1:9999"),
            (ENV_LOG_FILE, "  "),
        ]
        .into_iter()
        .collect();

        let mut s = Settings::default();
        s.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(s.download_dir, PathBuf::from("/tmp/out"));
        assert_eq!(s.registry.url, "http://127.0.0.1:9999");
        // Blank values do not clobber.
        assert_eq!(s.log_file, PathBuf::from("./download.log"));
    }

    #[test]
    fn bad_timeout_and_url_are_rejected() {
        let mut s = Settings::default();
        s.registry.metadata_timeout = "soon".into();
        assert!(matches!(s.validate(), Err(Error::Config(_))));

        let mut s = Settings::default();
        s.registry.auth_url = "auth.docker.io".into();
        assert!(matches!(s.validate(), Err(Error::Config(_))));

        let mut s = Settings::default();
        s.listen = "not-an-addr".into();
        assert!(matches!(s.validate(), Err(Error::Config(_))));
    }
}
