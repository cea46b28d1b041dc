//! Minimal HTTP/1.1 daemon for the web front end: start downloads, poll
//! progress, list/fetch/delete archives and read the log.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::artifacts;
use crate::config::Settings;
use crate::logging;
use crate::pipeline::{DownloadRequest, Downloader};
use crate::progress::{idle_state, MemoryProgressStore, ProgressReporter, ProgressStore};
use crate::{Error, Result};

const MAX_REQUEST_BYTES: usize = 64 * 1024;

/// Completed and failed download records kept for polling.  Older ones are
/// evicted first; running downloads are never evicted.
pub const DEFAULT_FINISHED_RECORDS: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Running,
    Completed,
    Failed,
}

/// Outcome of a download started through `POST /v1/downloads`.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadRecord {
    pub session: String,
    pub image: String,
    pub status: DownloadStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct DaemonState {
    downloader: Arc<Downloader>,
    progress: Arc<dyn ProgressStore>,
    downloads: Arc<Mutex<HashMap<String, DownloadRecord>>>,
    finished_records: usize,
    download_dir: PathBuf,
    log_file: PathBuf,
}

impl DaemonState {
    pub fn new(settings: &Settings) -> Result<Self> {
        Ok(Self::with_downloader(Downloader::new(settings)?, settings))
    }

    pub fn with_downloader(downloader: Downloader, settings: &Settings) -> Self {
        Self {
            downloader: Arc::new(downloader),
            progress: Arc::new(MemoryProgressStore::new()),
            downloads: Arc::new(Mutex::new(HashMap::new())),
            finished_records: DEFAULT_FINISHED_RECORDS,
            download_dir: settings.download_dir.clone(),
            log_file: settings.log_file.clone(),
        }
    }

    /// Keep at most `limit` finished download records.
    pub fn with_finished_records(mut self, limit: usize) -> Self {
        self.finished_records = limit;
        self
    }
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    progress_store: &'static str,
}

#[derive(Debug, Serialize)]
struct CreateDownloadResponse {
    session: String,
}

enum Response {
    Json(&'static str, String),
    Text(&'static str, String),
    File { path: PathBuf, name: String, size: u64 },
}

pub async fn serve(addr: SocketAddr, state: DaemonState) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("daemon listening on http://{}", listener.local_addr()?);
    serve_listener(listener, state).await
}

/// Accept loop on an already-bound listener.
pub async fn serve_listener(listener: TcpListener, state: DaemonState) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_stream(stream, state).await {
                warn!(%peer, error = %e, "daemon connection error");
            }
        });
    }
}

async fn handle_stream(mut stream: TcpStream, state: DaemonState) -> Result<()> {
    let Some(raw) = read_request(&mut stream).await? else {
        return Ok(());
    };

    let req = String::from_utf8_lossy(&raw).to_string();
    let request_line = req.lines().next().unwrap_or("");
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("");
    let path = path.split('?').next().unwrap_or("");

    let body = match req.find("\r\n\r\n") {
        Some(idx) => &req[idx + 4..],
        None => "",
    };

    let response = route_request(method, path, body, state).await;
    write_response(&mut stream, response).await
}

/// Read headers plus a `Content-Length` body.  `None` on an empty
/// connection.
async fn read_request(stream: &mut TcpStream) -> Result<Option<Vec<u8>>> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = find_header_end(&buf) {
            let wanted = end + content_length(&buf[..end]);
            if buf.len() >= wanted {
                break;
            }
        }
        if buf.len() >= MAX_REQUEST_BYTES {
            break;
        }
    }

    if buf.is_empty() {
        return Ok(None);
    }
    Ok(Some(buf))
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn content_length(headers: &[u8]) -> usize {
    String::from_utf8_lossy(headers)
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.trim().eq_ignore_ascii_case("content-length") {
                value.trim().parse().ok()
            } else {
                None
            }
        })
        .unwrap_or(0)
}

async fn write_response(stream: &mut TcpStream, response: Response) -> Result<()> {
    match response {
        Response::Json(status, payload) => {
            write_body(stream, status, "application/json", &payload).await
        }
        Response::Text(status, payload) => {
            write_body(stream, status, "text/plain; charset=utf-8", &payload).await
        }
        Response::File { path, name, size } => {
            let mut file = tokio::fs::File::open(&path).await?;
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/x-tar\r\nContent-Disposition: attachment; filename=\"{}\"\r\nContent-Length: {}\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n",
                name, size
            );
            stream.write_all(head.as_bytes()).await?;
            tokio::io::copy(&mut file, stream).await?;
            stream.flush().await?;
            Ok(())
        }
    }
}

async fn write_body(
    stream: &mut TcpStream,
    status: &str,
    content_type: &str,
    payload: &str,
) -> Result<()> {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        payload.len(),
        payload
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

async fn route_request(method: &str, path: &str, body: &str, state: DaemonState) -> Response {
    match (method, path) {
        ("GET", "/v1/health") => Response::Json(
            "200 OK",
            serde_json::to_string(&Health {
                status: "ok",
                progress_store: state.progress.name(),
            })
            .unwrap_or_else(|_| "{}".into()),
        ),
        ("POST", "/v1/downloads") => create_download(body, state).await,
        ("GET", "/v1/images") => list_images(state),
        ("GET", "/v1/log") => read_log(state),
        _ => {
            if let Some(session) = path.strip_prefix("/v1/progress/") {
                if method == "GET" {
                    return get_progress(session, state);
                }
            }

            if let Some(session) = path.strip_prefix("/v1/downloads/") {
                if method == "GET" {
                    return get_download(session, state).await;
                }
            }

            if let Some(name) = path.strip_prefix("/v1/images/") {
                if method == "GET" {
                    return get_image(name, state).await;
                }
                if method == "DELETE" {
                    return delete_image(name, state);
                }
            }

            Response::Json("404 Not Found", json_error("route not found".to_string()))
        }
    }
}

async fn create_download(body: &str, state: DaemonState) -> Response {
    let req: DownloadRequest = match serde_json::from_str(body) {
        Ok(r) => r,
        Err(e) => return Response::Json("400 Bad Request", json_error(format!("invalid JSON: {e}"))),
    };
    if req.name.trim().is_empty() {
        return Response::Json("400 Bad Request", json_error("image name is required".to_string()));
    }

    let session = Uuid::now_v7().to_string();
    let reporter = ProgressReporter::new(state.progress.clone(), session.clone());
    reporter.preparing();

    state.downloads.lock().await.insert(
        session.clone(),
        DownloadRecord {
            session: session.clone(),
            image: req.name.clone(),
            status: DownloadStatus::Running,
            archive: None,
            size: None,
            error: None,
        },
    );
    info!(session = %session, image = %req.name, "download requested");

    let state_bg = state.clone();
    let session_bg = session.clone();
    tokio::spawn(async move {
        let result = state_bg.downloader.download(&req, &reporter).await;

        let mut downloads = state_bg.downloads.lock().await;
        if let Some(record) = downloads.get_mut(&session_bg) {
            match result {
                Ok(report) => {
                    record.status = DownloadStatus::Completed;
                    record.archive = report
                        .archive_path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string());
                    record.size = Some(report.archive_size);
                }
                Err(e) => {
                    record.status = DownloadStatus::Failed;
                    record.error = Some(e.user_message());
                }
            }
        }
        prune_finished(&mut downloads, state_bg.finished_records);
    });

    Response::Json(
        "202 Accepted",
        serde_json::to_string(&CreateDownloadResponse { session }).unwrap_or_else(|_| "{}".into()),
    )
}

async fn get_download(session: &str, state: DaemonState) -> Response {
    let downloads = state.downloads.lock().await;
    match downloads.get(session) {
        Some(record) => Response::Json(
            "200 OK",
            serde_json::to_string(record).unwrap_or_else(|_| "{}".into()),
        ),
        None => Response::Json(
            "404 Not Found",
            json_error(format!("download '{session}' not found")),
        ),
    }
}

/// Drop the oldest finished records beyond `limit`.  Session ids are UUIDv7,
/// so their string order is creation order.
fn prune_finished(downloads: &mut HashMap<String, DownloadRecord>, limit: usize) {
    let mut finished: Vec<String> = downloads
        .values()
        .filter(|r| r.status != DownloadStatus::Running)
        .map(|r| r.session.clone())
        .collect();
    if finished.len() <= limit {
        return;
    }
    finished.sort_unstable();
    let excess = finished.len() - limit;
    for session in &finished[..excess] {
        downloads.remove(session);
    }
    debug!(evicted = excess, "pruned finished download records");
}

fn get_progress(session: &str, state: DaemonState) -> Response {
    let progress = state.progress.get(session).unwrap_or_else(idle_state);
    Response::Json(
        "200 OK",
        serde_json::to_string(&progress).unwrap_or_else(|_| "{}".into()),
    )
}

fn list_images(state: DaemonState) -> Response {
    match artifacts::list_archives(&state.download_dir) {
        Ok(list) => Response::Json(
            "200 OK",
            serde_json::to_string(&list).unwrap_or_else(|_| "[]".into()),
        ),
        Err(e) => error_response(e),
    }
}

async fn get_image(name: &str, state: DaemonState) -> Response {
    let path = match artifacts::archive_path(&state.download_dir, name) {
        Ok(p) => p,
        Err(e) => return error_response(e),
    };
    match tokio::fs::metadata(&path).await {
        Ok(meta) => Response::File {
            path,
            name: name.to_string(),
            size: meta.len(),
        },
        Err(e) => error_response(e.into()),
    }
}

fn delete_image(name: &str, state: DaemonState) -> Response {
    match artifacts::delete_archive(&state.download_dir, name) {
        Ok(()) => Response::Json("200 OK", json!({ "deleted": name }).to_string()),
        Err(e) => error_response(e),
    }
}

fn read_log(state: DaemonState) -> Response {
    match logging::read_log(&state.log_file) {
        Ok(text) => Response::Text("200 OK", text),
        Err(e) => error_response(e),
    }
}

fn error_response(err: Error) -> Response {
    let (status, message) = match err {
        Error::InvalidName(_) => ("400 Bad Request", err.user_message()),
        Error::NotFound(_) => ("404 Not Found", err.user_message()),
        _ => ("500 Internal Server Error", err.to_string()),
    };
    Response::Json(status, json_error(message))
}

fn json_error(message: String) -> String {
    json!({ "error": message }).to_string()
}
