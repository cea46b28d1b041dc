//! End-to-end downloads against a fake registry.
//!
//! ```bash
//! cargo test --test pipeline
//! ```

#[path = "common/registry_fixture.rs"]
mod registry_fixture;

use std::sync::Arc;

use httpmock::prelude::*;
use serde_json::{json, Value};

use regpack::oci::{Architecture, OciError};
use regpack::pipeline::{DownloadRequest, Downloader, PipelineState};
use regpack::progress::{MemoryProgressStore, ProgressReporter, ProgressStore};
use registry_fixture::*;

const REPO: &str = "library/alpine";

fn reporter() -> (Arc<MemoryProgressStore>, ProgressReporter) {
    let store = Arc::new(MemoryProgressStore::new());
    let reporter = ProgressReporter::new(store.clone(), "session-1");
    (store, reporter)
}

fn archive_manifest(entries: &[(String, Vec<u8>)]) -> Value {
    let (_, bytes) = entries
        .iter()
        .find(|(name, _)| name == "manifest.json")
        .expect("manifest.json in archive");
    serde_json::from_slice(bytes).unwrap()
}

#[tokio::test]
async fn alpine_latest_single_manifest_builds_loadable_archive() {
    let server = MockServer::start_async().await;
    let tmp = tempfile::tempdir().unwrap();
    let settings = settings_for(&server, tmp.path());

    let image = Image::new("amd64", vec![Layer::gzip("etc/alpine-release", b"3.20.0\n")]);
    mock_token(&server, REPO).await;
    mock_manifest(&server, REPO, "latest", image.manifest()).await;
    mock_image_blobs(&server, REPO, &image).await;

    let downloader = Downloader::new(&settings).unwrap();
    let (store, reporter) = reporter();
    let report = downloader
        .download(
            &DownloadRequest::new("alpine").architecture(Architecture::Amd64),
            &reporter,
        )
        .await
        .unwrap();

    assert_eq!(
        report.archive_path,
        settings.download_dir.join("alpine_latest_amd64.tar")
    );
    assert_eq!(report.layers.len(), 1);
    assert_eq!(report.mismatched_layers(), 0);
    assert!(!report.work_dir.exists(), "working directory removed on success");
    assert!(store.get("session-1").is_none(), "progress cleared on success");

    let entries = read_archive(&report.archive_path);
    assert_eq!(entries.len(), 3);
    assert!(entries.iter().any(|(n, _)| n == &report.config_file));
    assert!(report.config_file.ends_with(".json"));

    let manifest = archive_manifest(&entries);
    assert_eq!(manifest[0]["RepoTags"], json!(["alpine:latest"]));
    assert_eq!(manifest[0]["Config"], json!(report.config_file));
    let layer_path = format!(
        "{}/layer.tar",
        image.layers[0].diff_id.trim_start_matches("sha256:")
    );
    assert_eq!(manifest[0]["Layers"], json!([layer_path]));

    // The stored config is the normalized one.
    let (_, config_bytes) = entries.iter().find(|(n, _)| n == &report.config_file).unwrap();
    let stored: Value = serde_json::from_slice(config_bytes).unwrap();
    assert_eq!(stored["config"]["Labels"], json!({}));
    assert_eq!(stored["config"]["OnBuild"], json!([]));
    assert_eq!(
        report.config_file,
        format!("{}.json", sha256_hex(config_bytes))
    );
}

#[tokio::test]
async fn manifest_list_resolves_requested_architecture() {
    let server = MockServer::start_async().await;
    let tmp = tempfile::tempdir().unwrap();
    let settings = settings_for(&server, tmp.path());

    let amd64 = Image::new("amd64", vec![Layer::gzip("arch", b"amd64")]);
    let arm64 = Image::new(
        "arm64",
        vec![Layer::gzip("arch", b"arm64"), Layer::gzip("etc/motd", b"hello")],
    );

    mock_token(&server, REPO).await;
    mock_manifest(
        &server,
        REPO,
        "latest",
        json!({
            "schemaVersion": 2,
            "mediaType": DOCKER_LIST,
            "manifests": [
                { "mediaType": DOCKER_MANIFEST, "digest": "sha256:amd64m", "size": 1,
                  "platform": { "architecture": "amd64", "os": "linux" } },
                { "mediaType": DOCKER_MANIFEST, "digest": "sha256:arm64m", "size": 1,
                  "platform": { "architecture": "arm64", "os": "linux", "variant": "v8" } }
            ]
        }),
    )
    .await;
    let amd64_manifest = mock_manifest(&server, REPO, "sha256:amd64m", amd64.manifest()).await;
    let arm64_manifest = mock_manifest(&server, REPO, "sha256:arm64m", arm64.manifest()).await;
    mock_image_blobs(&server, REPO, &arm64).await;

    let downloader = Downloader::new(&settings).unwrap();
    let report = downloader
        .download(
            &DownloadRequest::new("alpine").architecture(Architecture::Arm64),
            &ProgressReporter::disabled(),
        )
        .await
        .unwrap();

    arm64_manifest.assert_async().await;
    amd64_manifest.assert_calls_async(0).await;

    assert_eq!(
        report.archive_path.file_name().unwrap(),
        "alpine_latest_arm64.tar"
    );
    let manifest = archive_manifest(&read_archive(&report.archive_path));
    let layers: Vec<String> = arm64
        .layers
        .iter()
        .map(|l| format!("{}/layer.tar", l.diff_id.trim_start_matches("sha256:")))
        .collect();
    assert_eq!(manifest[0]["Layers"], json!(layers));
}

#[tokio::test]
async fn failed_layer_aborts_without_archive() {
    let server = MockServer::start_async().await;
    let tmp = tempfile::tempdir().unwrap();
    let settings = settings_for(&server, tmp.path());

    let image = Image::new(
        "amd64",
        vec![
            Layer::gzip("a", b"a"),
            Layer::gzip("b", b"b"),
            Layer::gzip("c", b"c"),
        ],
    );
    mock_token(&server, REPO).await;
    mock_manifest(&server, REPO, "latest", image.manifest()).await;
    mock_blob(&server, REPO, &image.config_digest, &image.config_bytes).await;
    mock_blob(&server, REPO, &image.layers[0].digest, &image.layers[0].blob).await;
    let broken_path = format!("/v2/{}/blobs/{}", REPO, image.layers[1].digest);
    server
        .mock_async(|when, then| {
            when.method(GET).path(broken_path.as_str());
            then.status(500).body("boom");
        })
        .await;
    let third = mock_blob(&server, REPO, &image.layers[2].digest, &image.layers[2].blob).await;

    let downloader = Downloader::new(&settings).unwrap();
    let (store, reporter) = reporter();
    let err = downloader
        .download(&DownloadRequest::new("alpine"), &reporter)
        .await
        .unwrap_err();

    assert_eq!(err.failed_state(), Some(PipelineState::DownloadingLayers));
    match err.oci() {
        Some(OciError::Download { digest, .. }) => assert_eq!(digest, &image.layers[1].digest),
        other => panic!("unexpected error: {other:?}"),
    }
    third.assert_calls_async(0).await;

    assert!(!settings.download_dir.join("alpine_latest_amd64.tar").exists());
    assert!(store.get("session-1").is_none(), "progress cleared on failure");
}

#[tokio::test]
async fn diff_id_count_mismatch_fails_before_downloading() {
    let server = MockServer::start_async().await;
    let tmp = tempfile::tempdir().unwrap();
    let settings = settings_for(&server, tmp.path());

    let layer = Layer::gzip("a", b"a");
    let config = json!({
        "architecture": "amd64",
        "os": "linux",
        "config": {},
        "rootfs": { "type": "layers", "diff_ids": [layer.diff_id, "sha256:extra"] }
    });
    let image = Image::with_config(vec![layer], config);

    mock_token(&server, REPO).await;
    mock_manifest(&server, REPO, "latest", image.manifest()).await;
    mock_blob(&server, REPO, &image.config_digest, &image.config_bytes).await;
    let layer_blob = mock_blob(&server, REPO, &image.layers[0].digest, &image.layers[0].blob).await;

    let err = Downloader::new(&settings)
        .unwrap()
        .download(&DownloadRequest::new("alpine"), &ProgressReporter::disabled())
        .await
        .unwrap_err();

    assert_eq!(err.failed_state(), Some(PipelineState::FetchingConfig));
    assert!(matches!(err.oci(), Some(OciError::Config(_))));
    layer_blob.assert_calls_async(0).await;
}

#[tokio::test]
async fn config_without_diff_ids_is_missing_diff_ids() {
    let server = MockServer::start_async().await;
    let tmp = tempfile::tempdir().unwrap();
    let settings = settings_for(&server, tmp.path());

    let image = Image::with_config(
        vec![Layer::gzip("a", b"a")],
        json!({ "architecture": "amd64", "os": "linux", "config": {} }),
    );
    mock_token(&server, REPO).await;
    mock_manifest(&server, REPO, "latest", image.manifest()).await;
    mock_image_blobs(&server, REPO, &image).await;

    let err = Downloader::new(&settings)
        .unwrap()
        .download(&DownloadRequest::new("alpine"), &ProgressReporter::disabled())
        .await
        .unwrap_err();

    assert!(matches!(err.oci(), Some(OciError::MissingDiffIds)));
    assert!(!settings.download_dir.join("alpine_latest_amd64.tar").exists());
}

#[tokio::test]
async fn diff_id_mismatch_is_reported_not_fatal() {
    let server = MockServer::start_async().await;
    let tmp = tempfile::tempdir().unwrap();
    let settings = settings_for(&server, tmp.path());

    let mut layer = Layer::gzip("a", b"a");
    layer.diff_id = format!("sha256:{}", "e".repeat(64));
    let image = Image::new("amd64", vec![layer]);

    mock_token(&server, REPO).await;
    mock_manifest(&server, REPO, "latest", image.manifest()).await;
    mock_image_blobs(&server, REPO, &image).await;

    let report = Downloader::new(&settings)
        .unwrap()
        .download(&DownloadRequest::new("alpine"), &ProgressReporter::disabled())
        .await
        .unwrap();

    assert_eq!(report.mismatched_layers(), 1);
    let manifest = archive_manifest(&read_archive(&report.archive_path));
    assert_eq!(
        manifest[0]["Layers"],
        json!([format!("{}/layer.tar", "e".repeat(64))])
    );
}

#[tokio::test]
async fn auth_failure_stops_at_authenticating() {
    let server = MockServer::start_async().await;
    let tmp = tempfile::tempdir().unwrap();
    let settings = settings_for(&server, tmp.path());

    server
        .mock_async(|when, then| {
            when.method(GET).path("/token");
            then.status(401).body("unauthorized");
        })
        .await;

    let err = Downloader::new(&settings)
        .unwrap()
        .download(&DownloadRequest::new("alpine"), &ProgressReporter::disabled())
        .await
        .unwrap_err();

    assert_eq!(err.failed_state(), Some(PipelineState::Authenticating));
    assert!(matches!(err.oci(), Some(OciError::Auth(_))));
    assert_eq!(err.user_message(), "Download failed. Check the log for details.");
}

#[tokio::test]
async fn back_to_back_downloads_use_distinct_work_dirs() {
    let server = MockServer::start_async().await;
    let tmp = tempfile::tempdir().unwrap();
    let settings = settings_for(&server, tmp.path());

    let image = Image::new("amd64", vec![Layer::gzip("a", b"a")]);
    let token = mock_token(&server, REPO).await;
    mock_manifest(&server, REPO, "latest", image.manifest()).await;
    mock_image_blobs(&server, REPO, &image).await;

    let downloader = Downloader::new(&settings).unwrap();
    let request = DownloadRequest::new("alpine");

    let first = downloader
        .download(&request, &ProgressReporter::disabled())
        .await
        .unwrap();
    let second = downloader
        .download(&request, &ProgressReporter::disabled())
        .await
        .unwrap();

    assert_ne!(first.work_dir, second.work_dir);
    assert!(first
        .work_dir
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("alpine_latest_amd64_tmp_"));
    assert_eq!(first.archive_path, second.archive_path);
    assert_eq!(first.config_file, second.config_file);

    // Each download authenticates for itself and drops its token at the end.
    token.assert_calls_async(2).await;
    assert!(!downloader.client().has_token(REPO));
}

#[tokio::test]
async fn token_is_dropped_after_failed_download() {
    let server = MockServer::start_async().await;
    let tmp = tempfile::tempdir().unwrap();
    let settings = settings_for(&server, tmp.path());

    mock_token(&server, REPO).await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/v2/library/alpine/manifests/latest");
            then.status(404).body("unknown");
        })
        .await;

    let downloader = Downloader::new(&settings).unwrap();
    let err = downloader
        .download(&DownloadRequest::new("alpine"), &ProgressReporter::disabled())
        .await
        .unwrap_err();

    assert_eq!(err.failed_state(), Some(PipelineState::ResolvingManifest));
    assert!(!downloader.client().has_token(REPO));
}

#[tokio::test]
async fn diff_ids_that_are_not_sha256_hex_are_rejected() {
    let server = MockServer::start_async().await;
    let tmp = tempfile::tempdir().unwrap();
    let settings = settings_for(&server, tmp.path());
    let escaped = tmp.path().join("escaped");

    for bad in [
        format!("sha256:{}", escaped.display()),
        "sha256:../../escaped".to_string(),
    ] {
        server.reset_async().await;
        let layer = Layer::gzip("a", b"a");
        let config = json!({
            "architecture": "amd64",
            "os": "linux",
            "config": {},
            "rootfs": { "type": "layers", "diff_ids": [bad] }
        });
        let image = Image::with_config(vec![layer], config);

        mock_token(&server, REPO).await;
        mock_manifest(&server, REPO, "latest", image.manifest()).await;
        mock_blob(&server, REPO, &image.config_digest, &image.config_bytes).await;
        let layer_blob =
            mock_blob(&server, REPO, &image.layers[0].digest, &image.layers[0].blob).await;

        let err = Downloader::new(&settings)
            .unwrap()
            .download(&DownloadRequest::new("alpine"), &ProgressReporter::disabled())
            .await
            .unwrap_err();

        assert_eq!(err.failed_state(), Some(PipelineState::FetchingConfig));
        assert!(matches!(err.oci(), Some(OciError::Config(_))));
        layer_blob.assert_calls_async(0).await;
        assert!(!escaped.exists());
    }
    assert!(!settings.download_dir.join("alpine_latest_amd64.tar").exists());
}
