//! Fake Docker registry on top of `httpmock`, plus helpers to build layer
//! blobs in-test.

#![allow(dead_code)]

use std::io::Write;
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use httpmock::prelude::*;
use httpmock::Mock;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use regpack::config::Settings;

pub const SERVICE: &str = "registry.test";
pub const GZIP_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

pub fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

pub fn layer_tar(file: &str, data: &[u8]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_path(file).unwrap();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append(&header, data).unwrap();
    builder.into_inner().unwrap()
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Settings pointing at `server`, writing under `dir`.
pub fn settings_for(server: &MockServer, dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.download_dir = dir.join("downloads");
    settings.log_file = dir.join("download.log");
    settings.registry.url = server.base_url();
    settings.registry.auth_url = server.base_url();
    settings.registry.service = SERVICE.to_string();
    settings.registry.metadata_timeout = "5s".to_string();
    settings.registry.blob_timeout = "5s".to_string();
    settings
}

/// One layer: compressed blob plus the diffID of its tar.
pub struct Layer {
    pub blob: Vec<u8>,
    pub digest: String,
    pub diff_id: String,
}

impl Layer {
    pub fn gzip(file: &str, data: &[u8]) -> Self {
        let tar = layer_tar(file, data);
        let blob = gzip(&tar);
        Self {
            digest: format!("sha256:{}", sha256_hex(&blob)),
            diff_id: format!("sha256:{}", sha256_hex(&tar)),
            blob,
        }
    }
}

/// A single-platform image as served by the fake registry.
pub struct Image {
    pub layers: Vec<Layer>,
    pub config: Value,
    pub config_bytes: Vec<u8>,
    pub config_digest: String,
}

impl Image {
    pub fn new(architecture: &str, layers: Vec<Layer>) -> Self {
        let diff_ids: Vec<&str> = layers.iter().map(|l| l.diff_id.as_str()).collect();
        let config = json!({
            "architecture": architecture,
            "os": "linux",
            "config": {
                "Env": ["PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"],
                "Cmd": ["/bin/sh"],
                "Labels": []
            },
            "rootfs": { "type": "layers", "diff_ids": diff_ids }
        });
        Self::with_config(layers, config)
    }

    pub fn with_config(layers: Vec<Layer>, config: Value) -> Self {
        let config_bytes = serde_json::to_vec(&config).unwrap();
        Self {
            config_digest: format!("sha256:{}", sha256_hex(&config_bytes)),
            layers,
            config,
            config_bytes,
        }
    }

    pub fn manifest(&self) -> Value {
        let layers: Vec<Value> = self
            .layers
            .iter()
            .map(|l| {
                json!({
                    "mediaType": GZIP_LAYER,
                    "digest": l.digest,
                    "size": l.blob.len()
                })
            })
            .collect();
        json!({
            "schemaVersion": 2,
            "mediaType": DOCKER_MANIFEST,
            "config": {
                "mediaType": "application/vnd.docker.container.image.v1+json",
                "digest": self.config_digest,
                "size": self.config_bytes.len()
            },
            "layers": layers
        })
    }
}

pub async fn mock_token<'a>(server: &'a MockServer, repo: &str) -> Mock<'a> {
    let scope = format!("repository:{}:pull", repo);
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/token")
                .query_param("service", SERVICE)
                .query_param("scope", scope.as_str());
            then.status(200).json_body(json!({ "token": "t0ken" }));
        })
        .await
}

pub async fn mock_manifest<'a>(
    server: &'a MockServer,
    repo: &str,
    reference: &str,
    body: Value,
) -> Mock<'a> {
    let path = format!("/v2/{}/manifests/{}", repo, reference);
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path(path.as_str())
                .header("authorization", "Bearer t0ken");
            then.status(200).json_body(body);
        })
        .await
}

pub async fn mock_blob<'a>(server: &'a MockServer, repo: &str, digest: &str, body: &[u8]) -> Mock<'a> {
    let path = format!("/v2/{}/blobs/{}", repo, digest);
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path(path.as_str())
                .header("authorization", "Bearer t0ken");
            then.status(200).body(body);
        })
        .await
}

/// Serve `image` (config and every layer) for `repo`.  The manifest itself
/// is mocked separately so tests can choose tag or digest routes.
pub async fn mock_image_blobs<'a>(server: &'a MockServer, repo: &str, image: &Image) -> Vec<Mock<'a>> {
    let mut mocks = vec![mock_blob(server, repo, &image.config_digest, &image.config_bytes).await];
    for layer in &image.layers {
        mocks.push(mock_blob(server, repo, &layer.digest, &layer.blob).await);
    }
    mocks
}

/// Entries of a tar file as `(path, bytes)`.
pub fn read_archive(path: &Path) -> Vec<(String, Vec<u8>)> {
    use std::io::Read;

    let mut archive = tar::Archive::new(std::fs::File::open(path).unwrap());
    archive
        .entries()
        .unwrap()
        .map(|e| {
            let mut e = e.unwrap();
            let name = e.path().unwrap().to_string_lossy().to_string();
            let mut data = Vec::new();
            e.read_to_end(&mut data).unwrap();
            (name, data)
        })
        .collect()
}
