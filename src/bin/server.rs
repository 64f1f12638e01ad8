#![forbid(unsafe_code)]

//! Axum server exposing channel tracking and grab requests as a JSON API.
//!
//! Requests only touch the record store and enqueue jobs; every call to
//! `yt-dlp` happens on the worker pool hosted by this process.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{
        Path as AxumPath, Query, State,
        rejection::{JsonRejection, PathRejection, QueryRejection},
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::signal;
use ytgrab::{
    config::{RuntimeOverrides, resolve_runtime_config},
    dispatch::{AddedChannel, Dispatcher, GrabOutcome, RefreshSummary},
    error::CoreError,
    jobs::{JobExecutor, JobId, JobRecord, WorkerPool},
    logging,
    model::{Channel, ChannelId, Video, VideoId, VideoPage, VideoQuery},
    service::ServiceRegistry,
    store::RecordStore,
};

#[derive(Debug, Parser)]
#[command(name = "server", about = "Serve the ytgrab JSON API and run grab jobs")]
struct ServerArgs {
    /// Directory holding the database and downloads.
    #[arg(long)]
    media_root: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Concurrent jobs.
    #[arg(long)]
    workers: Option<usize>,
    /// yt-dlp executable.
    #[arg(long)]
    ytdlp: Option<PathBuf>,
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl ServerArgs {
    fn into_overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            media_root: self.media_root,
            host: self.host,
            port: self.port,
            workers: self.workers,
            ytdlp: self.ytdlp,
            env_path: self.env_file,
        }
    }
}

fn parse_host(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/YTGRAB_HOST")
}

#[derive(Clone)]
struct AppState {
    store: Arc<RecordStore>,
    dispatcher: Dispatcher,
    jobs: WorkerPool,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let status = match &err {
            CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            CoreError::AlreadyGrabbed { .. } | CoreError::AlreadyExists { .. } => {
                StatusCode::CONFLICT
            }
            CoreError::InvalidService { .. } => StatusCode::BAD_REQUEST,
            CoreError::Service(_) => StatusCode::BAD_GATEWAY,
            CoreError::Transition(_) | CoreError::JobRunner { .. } | CoreError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, headers, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddChannelRequest {
    chanid: String,
    service: String,
    #[serde(default)]
    title: Option<String>,
}

/// `force` only accepts `true` or `false`.
#[derive(Debug, Default, Deserialize)]
struct GrabParams {
    #[serde(default)]
    force: Option<bool>,
}

#[derive(Debug, Serialize)]
struct JobResponse {
    id: JobId,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init("server");
    let config = resolve_runtime_config(ServerArgs::parse().into_overrides())?;
    let host = parse_host(&config.host)?;

    let store = Arc::new(
        RecordStore::open(&config.database_path())
            .await
            .context("opening record store")?,
    );
    let services = Arc::new(ServiceRegistry::with_ytdlp(&config.ytdlp));
    let known_services: Vec<String> = services.names().into_iter().map(str::to_owned).collect();
    let executor = Arc::new(JobExecutor::new(
        store.clone(),
        services.clone(),
        config.downloads_root(),
    ));
    let (jobs, pool_handle) = WorkerPool::start(executor, config.workers);
    let dispatcher = Dispatcher::new(store.clone(), services, Arc::new(jobs.clone()));

    let state = AppState {
        store,
        dispatcher,
        jobs: jobs.clone(),
    };

    let addr = SocketAddr::new(host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    tracing::info!(
        %addr,
        workers = config.workers,
        services = ?known_services,
        "API server listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    // Accepted jobs still run so no video is left behind in `queued`.
    jobs.close();
    tracing::info!("waiting for running jobs");
    pool_handle.await.context("joining worker pool")?;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/channels", get(list_channels).post(add_channel))
        .route("/api/channels/refresh", post(refresh_all_channels))
        .route(
            "/api/channels/by-chanid/{service}/{chanid}",
            get(get_channel_by_chanid),
        )
        .route("/api/channels/{id}", delete(delete_channel))
        .route("/api/channels/{id}/refresh", post(refresh_channel))
        .route("/api/channels/{id}/videos", get(list_channel_videos))
        .route("/api/videos/{id}", get(get_video))
        .route("/api/videos/{id}/grab", post(grab_video))
        .route("/api/videos/{id}/viewed", post(mark_viewed))
        .route("/api/videos/{id}/ignore", post(mark_ignored))
        .route("/api/jobs/{id}", get(get_job_status))
        .fallback(api_not_found)
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to install Ctrl+C handler");
    }
}

async fn api_not_found() -> ApiError {
    ApiError::not_found("endpoint not found")
}

async fn list_channels(State(state): State<AppState>) -> ApiResult<Json<Vec<Channel>>> {
    let channels = state.store.list_channels().await.map_err(CoreError::from)?;
    Ok(Json(channels))
}

async fn get_channel_by_chanid(
    State(state): State<AppState>,
    AxumPath((service, chanid)): AxumPath<(String, String)>,
) -> ApiResult<Json<Channel>> {
    let channel = state
        .store
        .get_channel_by_chanid(&service, &chanid)
        .await
        .map_err(CoreError::from)?
        .ok_or_else(|| CoreError::NotFound {
            kind: "channel",
            id: format!("{service}/{chanid}"),
        })?;
    Ok(Json(channel))
}

async fn add_channel(
    State(state): State<AppState>,
    payload: Result<Json<AddChannelRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<AddedChannel>)> {
    let Json(request) = payload?;
    let chanid = request.chanid.trim();
    if chanid.is_empty() {
        return Err(ApiError::bad_request("chanid must not be empty"));
    }
    let title = request
        .title
        .as_deref()
        .map(str::trim)
        .filter(|title| !title.is_empty());
    let added = state
        .dispatcher
        .add_channel(chanid, request.service.trim(), title)
        .await?;
    Ok((StatusCode::CREATED, Json(added)))
}

async fn delete_channel(
    State(state): State<AppState>,
    path: Result<AxumPath<ChannelId>, PathRejection>,
) -> ApiResult<StatusCode> {
    let AxumPath(id) = path?;
    state.dispatcher.delete_channel(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn refresh_channel(
    State(state): State<AppState>,
    path: Result<AxumPath<ChannelId>, PathRejection>,
) -> ApiResult<(StatusCode, Json<JobResponse>)> {
    let AxumPath(id) = path?;
    let job_id = state.dispatcher.refresh_channel(id).await?;
    Ok((StatusCode::ACCEPTED, Json(JobResponse { id: job_id })))
}

async fn refresh_all_channels(
    State(state): State<AppState>,
) -> ApiResult<(StatusCode, Json<RefreshSummary>)> {
    let summary = state.dispatcher.refresh_all().await?;
    Ok((StatusCode::ACCEPTED, Json(summary)))
}

async fn list_channel_videos(
    State(state): State<AppState>,
    path: Result<AxumPath<ChannelId>, PathRejection>,
    query: Result<Query<VideoQuery>, QueryRejection>,
) -> ApiResult<Json<VideoPage>> {
    let AxumPath(id) = path?;
    let Query(query) = query?;
    state
        .store
        .get_channel(id)
        .await
        .map_err(CoreError::from)?
        .ok_or_else(|| CoreError::channel_not_found(id))?;
    let page = state
        .store
        .list_videos(id, &query)
        .await
        .map_err(CoreError::from)?;
    Ok(Json(page))
}

async fn get_video(
    State(state): State<AppState>,
    path: Result<AxumPath<VideoId>, PathRejection>,
) -> ApiResult<Json<Video>> {
    let AxumPath(id) = path?;
    let video = state
        .store
        .get_video(id)
        .await
        .map_err(CoreError::from)?
        .ok_or_else(|| CoreError::video_not_found(id))?;
    Ok(Json(video))
}

async fn grab_video(
    State(state): State<AppState>,
    path: Result<AxumPath<VideoId>, PathRejection>,
    query: Result<Query<GrabParams>, QueryRejection>,
) -> ApiResult<(StatusCode, Json<GrabOutcome>)> {
    let AxumPath(id) = path?;
    let Query(params) = query?;
    let outcome = state
        .dispatcher
        .request_grab(id, params.force.unwrap_or(false))
        .await?;
    Ok((StatusCode::ACCEPTED, Json(outcome)))
}

async fn mark_viewed(
    State(state): State<AppState>,
    path: Result<AxumPath<VideoId>, PathRejection>,
) -> ApiResult<Json<Video>> {
    let AxumPath(id) = path?;
    Ok(Json(state.dispatcher.mark_viewed(id).await?))
}

async fn mark_ignored(
    State(state): State<AppState>,
    path: Result<AxumPath<VideoId>, PathRejection>,
) -> ApiResult<Json<Video>> {
    let AxumPath(id) = path?;
    Ok(Json(state.dispatcher.mark_ignored(id).await?))
}

async fn get_job_status(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<JobRecord>> {
    let record = state
        .jobs
        .status(&id)
        .ok_or_else(|| ApiError::not_found("job not found"))?;
    Ok(Json(record))
}
