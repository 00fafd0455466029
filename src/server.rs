use crate::browser::{new_browser_handle, BrowserSession};
use crate::config::AppConfig;
use crate::crawler::{download_single_post, BrowserGallery, Crawler};
use crate::job::{CancellationToken, JobController, ProgressSink, StopOutcome};
use crate::models::{CrawlTarget, JobResult, OutcomeStatus, PageRange};
use crate::ratelimit::RateLimiter;
use anyhow::Context as _;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures::stream::{self, Stream};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::io::{Cursor, Read as _, Write as _};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};

/// Per-client progress log channels. Each client identity gets a broadcast
/// channel; publishing to a client with no subscribers is a silent no-op.
#[derive(Clone, Default)]
pub struct LogHub {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
}

impl LogHub {
    pub fn subscribe(&self, client: &str) -> broadcast::Receiver<String> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(client.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .subscribe()
    }

    pub fn publish(&self, client: &str, line: &str) {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = channels.get(client) {
            // Reap the channel once its last stream disconnected; a later
            // subscribe recreates it.
            if tx.receiver_count() == 0 {
                channels.remove(client);
                return;
            }
            let stamped = format!("[{}] {}", Utc::now().format("%H:%M:%S"), line);
            let _ = tx.send(stamped);
        }
    }
}

/// Progress sink that feeds one client's log stream and mirrors to the
/// server log.
struct ClientSink {
    hub: LogHub,
    client: String,
}

impl ProgressSink for ClientSink {
    fn log(&self, line: &str) {
        info!("[{}] {}", self.client, line);
        self.hub.publish(&self.client, line);
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub jobs: Arc<JobController>,
    pub limiter: Arc<RateLimiter>,
    pub logs: LogHub,
}

/// Stable per-client identity: forwarded-for when behind a proxy, else the
/// socket address, with `:` and `.` flattened so it doubles as a directory
/// name.
fn client_identity(headers: &HeaderMap, addr: &SocketAddr) -> String {
    let raw = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
        })
        .unwrap_or_else(|| addr.ip().to_string());
    raw.replace([':', '.'], "-")
}

/// Reject path segments that could escape the downloads tree.
fn safe_segment(value: &str) -> Result<&str, ApiError> {
    if value.is_empty()
        || value == "."
        || value == ".."
        || value.contains('/')
        || value.contains('\\')
    {
        return Err(ApiError::BadRequest(format!("invalid name: {:?}", value)));
    }
    Ok(value)
}

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    RateLimited {
        message: String,
        remaining: u32,
        reset_in: u64,
    },
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
            }
            ApiError::Conflict(message) => {
                (StatusCode::CONFLICT, Json(json!({ "error": message }))).into_response()
            }
            ApiError::RateLimited {
                message,
                remaining,
                reset_in,
            } => (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({
                    "error": message,
                    "remaining": remaining,
                    "resetIn": reset_in,
                })),
            )
                .into_response(),
            ApiError::Internal(err) => {
                warn!("Internal error: {:#}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": err.to_string() })),
                )
                    .into_response()
            }
        }
    }
}

fn status_client_closed_request() -> StatusCode {
    StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn rate_limited(remaining: u32, reset_in: u64) -> ApiError {
    let minutes = reset_in.div_ceil(60);
    ApiError::RateLimited {
        message: format!(
            "Download limit reached. Try again in {} minute(s).",
            minutes.max(1)
        ),
        remaining,
        reset_in,
    }
}

#[derive(Deserialize)]
struct DownloadRequest {
    idol: String,
    #[serde(alias = "startPage")]
    start: u32,
    #[serde(alias = "endPage")]
    end: u32,
}

#[derive(Deserialize)]
struct CreatorRequest {
    creator: String,
    #[serde(default = "default_start_page", alias = "startPage")]
    start: u32,
    /// Absent means walk until a page yields no posts.
    #[serde(default, alias = "endPage")]
    end: Option<u32>,
}

fn default_start_page() -> u32 {
    1
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadPostRequest {
    post_url: String,
    #[serde(default = "default_post_folder")]
    folder: String,
}

fn default_post_folder() -> String {
    "single".to_string()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CrawlResponse {
    status: &'static str,
    result: JobResult,
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn api_config(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "idols": state.config.idols,
        "creators": state.config.creators,
        "rateLimit": {
            "maxImages": state.config.rate_limit.max_images,
            "windowSecs": state.config.rate_limit.window_secs,
        },
    }))
}

/// POST /download — bounded idol crawl.
async fn download(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<DownloadRequest>,
) -> Result<Response, ApiError> {
    safe_segment(&req.idol)?;
    if req.start < 1 || req.end < req.start {
        return Err(ApiError::BadRequest(
            "start must be >= 1 and end >= start".to_string(),
        ));
    }
    let client = client_identity(&headers, &addr);
    let target = CrawlTarget::idol(req.idol.as_str(), req.start, req.end);

    // Pre-flight admission: a bounded crawl whose estimated volume cannot
    // fit in the remaining quota is refused before the browser launches.
    let status = state.limiter.check(&client);
    if !status.allowed {
        return Err(rate_limited(status.remaining, status.reset_in));
    }
    if let Some(pages) = target.range.len() {
        let estimate = pages.saturating_mul(state.config.download.images_per_page_estimate);
        if estimate > status.remaining {
            return Err(rate_limited(status.remaining, status.reset_in));
        }
    }

    run_crawl(&state, &client, target).await
}

/// POST /download-creator — creator crawl, open-ended unless endPage given.
async fn download_creator(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<CreatorRequest>,
) -> Result<Response, ApiError> {
    safe_segment(&req.creator)?;
    if req.start < 1 {
        return Err(ApiError::BadRequest("start must be >= 1".to_string()));
    }
    if let Some(end) = req.end {
        if end < req.start {
            return Err(ApiError::BadRequest("end must be >= start".to_string()));
        }
    }
    let client = client_identity(&headers, &addr);
    let range = match req.end {
        Some(end) => PageRange::Bounded {
            start: req.start,
            end,
        },
        None => PageRange::UntilEmpty { start: req.start },
    };
    let target = CrawlTarget::creator(req.creator.as_str(), range);

    // Open-ended volume is unknowable up front, so creator crawls are
    // admitted on any remaining quota and charged by what they saved.
    let status = state.limiter.check(&client);
    if !status.allowed {
        return Err(rate_limited(status.remaining, status.reset_in));
    }

    run_crawl(&state, &client, target).await
}

/// Shared crawl execution: claim the job slot, launch the browser, walk the
/// target, charge the quota by what was actually saved.
async fn run_crawl(
    state: &AppState,
    client: &str,
    target: CrawlTarget,
) -> Result<Response, ApiError> {
    let cancel = CancellationToken::new();
    let browser_handle = new_browser_handle();
    let ticket = state
        .jobs
        .try_start(client, target.to_string(), cancel.clone(), Arc::clone(&browser_handle))
        .map_err(|_| ApiError::Conflict("A download job is already running".to_string()))?;

    let sink = ClientSink {
        hub: state.logs.clone(),
        client: client.to_string(),
    };
    sink.log(&format!("Starting job: {}", target));

    let dir = state
        .config
        .downloads_dir
        .join(client)
        .join(&target.name);

    let mut result = JobResult::default();
    let outcome = async {
        let session = BrowserSession::launch(&state.config.browser, browser_handle).await?;
        let gallery = BrowserGallery::new(&session, &state.config.download).await?;
        let crawler = Crawler::new(
            &gallery,
            &state.config.download,
            &state.config.site_base,
            &sink,
            &cancel,
        );
        let walk = crawler.run(&target, &dir, &mut result).await;
        gallery.close().await;
        session.shutdown().await;
        walk
    }
    .await;

    state.limiter.consume(client, result.images_downloaded);
    drop(ticket);

    match outcome {
        Ok(()) => {
            sink.log(&format!(
                "Job completed: {} image(s) downloaded, {} error(s)",
                result.images_downloaded,
                result.errors.len()
            ));
            Ok(Json(CrawlResponse {
                status: "completed",
                result,
            })
            .into_response())
        }
        Err(e) if e.is_cancelled() => {
            sink.log("Job cancelled");
            Ok((
                status_client_closed_request(),
                Json(CrawlResponse {
                    status: "cancelled",
                    result,
                }),
            )
                .into_response())
        }
        Err(e) => {
            sink.log(&format!("Job failed: {}", e));
            Ok((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "status": "failed",
                    "error": e.to_string(),
                    "result": result,
                })),
            )
                .into_response())
        }
    }
}

/// POST /download-post — fetch the images of one post.
async fn download_post(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<DownloadPostRequest>,
) -> Result<Response, ApiError> {
    let url = url::Url::parse(&req.post_url)
        .map_err(|e| ApiError::BadRequest(format!("invalid postUrl: {}", e)))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ApiError::BadRequest("postUrl must be http(s)".to_string()));
    }
    safe_segment(&req.folder)?;
    let client = client_identity(&headers, &addr);

    let status = state.limiter.check(&client);
    if !status.allowed {
        return Err(rate_limited(status.remaining, status.reset_in));
    }

    let cancel = CancellationToken::new();
    let browser_handle = new_browser_handle();
    let ticket = state
        .jobs
        .try_start(
            client.as_str(),
            format!("post {}", req.post_url),
            cancel.clone(),
            Arc::clone(&browser_handle),
        )
        .map_err(|_| ApiError::Conflict("A download job is already running".to_string()))?;

    let sink = ClientSink {
        hub: state.logs.clone(),
        client: client.clone(),
    };
    sink.log(&format!("Downloading post {}", req.post_url));
    let dir = state.config.downloads_dir.join(&client).join(&req.folder);

    let outcome = async {
        let session = BrowserSession::launch(&state.config.browser, browser_handle).await?;
        let fetched = download_single_post(
            &session,
            &state.config.download,
            &req.post_url,
            &dir,
            &cancel,
            &sink,
        )
        .await;
        session.shutdown().await;
        fetched
    }
    .await;
    drop(ticket);

    match outcome {
        Ok(outcomes) => {
            let saved = outcomes
                .iter()
                .filter(|o| o.status == OutcomeStatus::Saved)
                .count() as u32;
            let skipped = outcomes
                .iter()
                .filter(|o| o.status == OutcomeStatus::Skipped)
                .count();
            state.limiter.consume(&client, saved);
            sink.log(&format!("Post done: {} saved, {} skipped", saved, skipped));
            Ok(Json(json!({
                "status": "completed",
                "savedCount": saved,
                "skippedCount": skipped,
                "images": outcomes,
            }))
            .into_response())
        }
        Err(e) if e.is_cancelled() => {
            sink.log("Job cancelled");
            Ok((
                status_client_closed_request(),
                Json(json!({ "status": "cancelled" })),
            )
                .into_response())
        }
        Err(e) => {
            sink.log(&format!("Job failed: {}", e));
            Ok((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "failed", "error": e.to_string() })),
            )
                .into_response())
        }
    }
}

/// POST /stop — cancel the active job and tear its browser down.
async fn stop(State(state): State<AppState>) -> Json<serde_json::Value> {
    match state.jobs.stop() {
        StopOutcome::Stopping { browser } => {
            if browser.lock().await.take().is_some() {
                info!("Browser torn down by stop request");
            }
            Json(json!({ "status": "stopping" }))
        }
        StopOutcome::NoActiveJob => Json(json!({ "status": "no_job" })),
    }
}

async fn job_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    match state.jobs.status() {
        Some(info) => Json(json!({
            "active": true,
            "id": info.id,
            "client": info.client,
            "summary": info.summary,
            "state": info.state,
            "startedAt": info.started_at.to_rfc3339(),
        })),
        None => Json(json!({ "active": false })),
    }
}

/// GET /logs — per-client progress stream over SSE.
async fn logs(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let client = client_identity(&headers, &addr);
    let rx = state.logs.subscribe(&client);
    state.logs.publish(&client, "Log stream connected");

    let stream = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(line) => return Some((Ok(Event::default().data(line)), rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Log stream lagged, {} line(s) dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("ping"),
    )
}

/// GET /api/idols — names with at least one download for this client.
async fn api_idols(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let client = client_identity(&headers, &addr);
    let root = state.config.downloads_dir.join(&client);
    let mut names = Vec::new();
    if let Ok(mut entries) = tokio::fs::read_dir(&root).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
    }
    names.sort();
    Ok(Json(json!({ "idols": names })))
}

#[derive(Deserialize)]
struct Pagination {
    #[serde(default)]
    offset: usize,
    #[serde(default = "default_page_limit")]
    limit: usize,
}

fn default_page_limit() -> usize {
    50
}

#[derive(Serialize)]
struct FileEntry {
    name: String,
    path: String,
    size: u64,
}

/// GET /api/files/{idol} — paginated file listing, newest names first.
async fn api_files(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(idol): Path<String>,
    Query(page): Query<Pagination>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let idol = safe_segment(&idol)?.to_string();
    let client = client_identity(&headers, &addr);
    let dir = state.config.downloads_dir.join(&client).join(&idol);

    let mut files = Vec::new();
    if let Ok(mut entries) = tokio::fs::read_dir(&dir).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            let meta = match entry.metadata().await {
                Ok(meta) if meta.is_file() => meta,
                _ => continue,
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            files.push(FileEntry {
                path: format!("/files/{}/{}", idol, name),
                size: meta.len(),
                name,
            });
        }
    }
    files.sort_by(|a, b| b.name.cmp(&a.name));

    let total = files.len();
    let limit = page.limit.clamp(1, 500);
    let slice: Vec<_> = files.into_iter().skip(page.offset).take(limit).collect();
    let has_more = page.offset + slice.len() < total;
    Ok(Json(json!({
        "files": slice,
        "total": total,
        "offset": page.offset,
        "limit": limit,
        "hasMore": has_more,
    })))
}

fn content_type_for(name: &str) -> &'static str {
    let ext = name.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "avif" => "image/avif",
        _ => "application/octet-stream",
    }
}

async fn read_client_file(
    state: &AppState,
    headers: &HeaderMap,
    addr: &SocketAddr,
    idol: &str,
    filename: &str,
) -> Result<Vec<u8>, ApiError> {
    let idol = safe_segment(idol)?;
    let filename = safe_segment(filename)?;
    let client = client_identity(headers, addr);
    let path = state
        .config
        .downloads_dir
        .join(&client)
        .join(idol)
        .join(filename);
    tokio::fs::read(&path)
        .await
        .map_err(|_| ApiError::NotFound(format!("{}/{} not found", idol, filename)))
}

/// GET /files/{idol}/{filename} — serve inline.
async fn serve_file(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path((idol, filename)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let bytes = read_client_file(&state, &headers, &addr, &idol, &filename).await?;
    Ok((
        [(header::CONTENT_TYPE, content_type_for(&filename).to_string())],
        bytes,
    )
        .into_response())
}

/// GET /files/download/{idol}/{filename} — serve as attachment.
async fn download_file(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path((idol, filename)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let bytes = read_client_file(&state, &headers, &addr, &idol, &filename).await?;
    Ok((
        [
            (
                header::CONTENT_TYPE,
                "application/octet-stream".to_string(),
            ),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        bytes,
    )
        .into_response())
}

/// GET /files/download-zip/{idol} — all of the client's files for a name,
/// zipped in memory.
async fn download_zip(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(idol): Path<String>,
) -> Result<Response, ApiError> {
    let idol = safe_segment(&idol)?.to_string();
    let client = client_identity(&headers, &addr);
    let dir = state.config.downloads_dir.join(&client).join(&idol);
    if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
        return Err(ApiError::NotFound(format!("no files for {}", idol)));
    }

    let archive = tokio::task::spawn_blocking(move || build_zip(&dir))
        .await
        .context("zip task panicked")?
        .context("failed to build archive")?;

    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}.zip\"", idol),
            ),
        ],
        archive,
    )
        .into_response())
}

fn build_zip(dir: &PathBuf) -> anyhow::Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    {
        let mut archive = zip::ZipWriter::new(&mut buffer);
        let options = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            archive.start_file(name, options)?;
            let mut file = std::fs::File::open(entry.path())?;
            let mut contents = Vec::new();
            file.read_to_end(&mut contents)?;
            archive.write_all(&contents)?;
        }
        archive.finish()?;
    }
    Ok(buffer.into_inner())
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    Router::new()
        .route("/health", get(health))
        .route("/download", post(download))
        .route("/download-creator", post(download_creator))
        .route("/download-post", post(download_post))
        .route("/stop", post(stop))
        .route("/logs", get(logs))
        .route("/api/config", get(api_config))
        .route("/api/job", get(job_status))
        .route("/api/idols", get(api_idols))
        .route("/api/files/:idol", get(api_files))
        .route("/files/:idol/:filename", get(serve_file))
        .route("/files/download/:idol/:filename", get(download_file))
        .route("/files/download-zip/:idol", get(download_zip))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", config.host, config.port))?;

    let limiter = Arc::new(RateLimiter::new(&config.rate_limit));
    limiter.spawn_sweeper(Duration::from_secs(config.rate_limit.sweep_secs.max(1)));

    let state = AppState {
        config: Arc::new(config),
        jobs: Arc::new(JobController::new()),
        limiter,
        logs: LogHub::default(),
    };

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Listening on http://{}", addr);
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")
}
