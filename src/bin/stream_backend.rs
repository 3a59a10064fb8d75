#![forbid(unsafe_code)]

//! Axum front for the stream resolution cache.
//!
//! Clients ask for a content id and get back a URL they can hand straight to
//! a native player. Every request goes through the shared cache, so bursts of
//! requests for the same id cost a single extraction.

use std::{
    collections::{BTreeMap, BTreeSet},
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
};
use newtube_streams::config::{RuntimeOverrides, resolve_runtime_config};
use newtube_streams::extract::YtDlpExtractor;
use newtube_streams::logging::init_logging;
use newtube_streams::{
    DefaultStreamCache, ExtractionMethod, MethodPreference, ResolveError, ResolverSettings,
    SettingsStore, open_default_cache,
};
use serde::{Deserialize, Serialize};
use tokio::signal;
use tracing::{info, warn};
use url::Url;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct BackendArgs {
    data_dir: Option<PathBuf>,
    newtube_port: Option<u16>,
    listen_host: Option<IpAddr>,
    verbose: bool,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut parsed = Self::default();
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--data-dir=") {
                parsed.data_dir = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--port=") {
                parsed.newtube_port = Some(parse_port_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--host=") {
                parsed.listen_host = Some(parse_host_arg(value)?);
                continue;
            }

            match arg.as_str() {
                "--data-dir" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--data-dir requires a value"))?;
                    parsed.data_dir = Some(PathBuf::from(value));
                }
                "--port" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--port requires a value"))?;
                    parsed.newtube_port = Some(parse_port_arg(&value)?);
                }
                "--host" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--host requires a value"))?;
                    parsed.listen_host = Some(parse_host_arg(&value)?);
                }
                "-v" | "--verbose" => parsed.verbose = true,
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }
        Ok(parsed)
    }

    fn overrides(&self) -> RuntimeOverrides {
        RuntimeOverrides {
            data_dir: self.data_dir.clone(),
            newtube_port: self.newtube_port,
            newtube_host: self.listen_host.map(|host| host.to_string()),
            ..RuntimeOverrides::default()
        }
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .trim()
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/NEWTUBE_HOST")
}

#[derive(Clone)]
struct AppState {
    cache: DefaultStreamCache,
    settings: Arc<SettingsStore>,
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

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<ResolveError> for ApiError {
    fn from(err: ResolveError) -> Self {
        let status = match &err {
            ResolveError::InvalidIdentifier => StatusCode::BAD_REQUEST,
            ResolveError::StreamNotFound(_) => StatusCode::NOT_FOUND,
            ResolveError::Extraction(_) => StatusCode::BAD_GATEWAY,
            ResolveError::Interrupted(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(status = %self.status, error = %self.message, "request failed");
        }
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Serialize, Deserialize)]
struct StreamResponse {
    id: String,
    url: Url,
}

#[derive(Debug, Deserialize)]
struct PrefetchRequest {
    ids: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PrefetchResponse {
    queued: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = BackendArgs::parse()?;
    init_logging(args.verbose);

    let config = resolve_runtime_config(args.overrides())?;
    let host = parse_host_arg(&config.newtube_host)?;
    let (cache, settings) = open_default_cache(&config);

    if settings.extraction_method() == ExtractionMethod::Local {
        let ytdlp = YtDlpExtractor::new(&config.ytdlp_bin);
        if let Err(err) = ytdlp.ensure_available().await {
            warn!(
                binary = %ytdlp.binary().display(),
                error = %err,
                "local extraction is selected but yt-dlp is unavailable"
            );
        }
    }

    info!(
        data_dir = %config.data_dir.display(),
        cached = cache.len(),
        method = settings.extraction_method().as_str(),
        piped = %config.piped_instance,
        policy = ?cache.policy(),
        "stream cache ready"
    );

    let app = router(AppState {
        cache: cache.clone(),
        settings,
    });

    let addr = SocketAddr::new(host, config.newtube_port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!(%addr, "stream API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running stream API server")?;

    cache.flush().await.context("flushing stream cache")?;
    info!(entries = cache.len(), "stream cache flushed, exiting");
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/streams", get(list_streams))
        .route("/api/streams/prefetch", post(prefetch_streams))
        .route("/api/streams/{id}", get(get_stream))
        .route("/api/streams/{id}/play", get(play_stream))
        .route("/api/settings", get(get_settings).post(update_settings))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "failed to install Ctrl+C handler");
    }
}

async fn get_stream(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<StreamResponse>> {
    let url = state.cache.resolve(&id).await?;
    Ok(Json(StreamResponse {
        id: id.trim().to_string(),
        url,
    }))
}

async fn play_stream(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Redirect> {
    let url = state.cache.resolve(&id).await?;
    Ok(Redirect::temporary(url.as_str()))
}

async fn prefetch_streams(
    State(state): State<AppState>,
    Json(payload): Json<PrefetchRequest>,
) -> ApiResult<(StatusCode, Json<PrefetchResponse>)> {
    let ids: BTreeSet<&str> = payload
        .ids
        .iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .collect();
    if ids.is_empty() && !payload.ids.is_empty() {
        return Err(ApiError::bad_request("every id was empty"));
    }

    state.cache.prefetch(ids.iter().copied());
    Ok((
        StatusCode::ACCEPTED,
        Json(PrefetchResponse { queued: ids.len() }),
    ))
}

async fn list_streams(State(state): State<AppState>) -> Json<BTreeMap<String, Url>> {
    Json(state.cache.snapshot())
}

async fn get_settings(State(state): State<AppState>) -> ApiResult<Json<ResolverSettings>> {
    Ok(Json(state.settings.get()))
}

async fn update_settings(
    State(state): State<AppState>,
    Json(payload): Json<ResolverSettings>,
) -> ApiResult<Json<ResolverSettings>> {
    let updated = state
        .settings
        .update(payload)
        .map_err(|err| ApiError::internal(format!("{err:#}")))?;
    info!(
        method = updated.extraction_method().as_str(),
        "extraction method updated"
    );
    Ok(Json(updated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use async_trait::async_trait;
    use axum::{body::to_bytes, http::header};
    use newtube_streams::{
        SharedExtractor, StreamCandidate, StreamExtractor, StreamResolutionCache,
    };
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Serves `https://cdn.example/<id>.mp4` for any id except the two
    /// reserved ones.
    #[derive(Default)]
    struct CdnExtractor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StreamExtractor for CdnExtractor {
        async fn extract(
            &self,
            id: &str,
            _method: ExtractionMethod,
        ) -> Result<Vec<StreamCandidate>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match id {
                "missing" => Ok(Vec::new()),
                "broken" => bail!("upstream returned 503"),
                _ => Ok(vec![StreamCandidate {
                    url: Url::parse(&format!("https://cdn.example/{id}.mp4"))?,
                    format_id: Some("18".into()),
                    has_audio: true,
                    has_video: true,
                    natively_playable: true,
                    resolution: 360,
                }]),
            }
        }
    }

    struct BackendTestContext {
        _temp: TempDir,
        extractor: Arc<CdnExtractor>,
        state: AppState,
    }

    impl BackendTestContext {
        fn new() -> Self {
            let temp = tempfile::tempdir().unwrap();
            let extractor = Arc::new(CdnExtractor::default());
            let settings = Arc::new(SettingsStore::load(
                temp.path(),
                ResolverSettings {
                    prefer_local_extraction: true,
                },
            ));
            let shared: SharedExtractor = extractor.clone();
            let cache = StreamResolutionCache::open(
                temp.path().join("StreamURLCache.json"),
                shared,
                Arc::clone(&settings),
            );
            Self {
                _temp: temp,
                extractor,
                state: AppState { cache, settings },
            }
        }

        fn state(&self) -> State<AppState> {
            State(self.state.clone())
        }
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn args(values: &[&str]) -> Result<BackendArgs> {
        BackendArgs::from_iter(values.iter().map(|value| value.to_string()))
    }

    #[test]
    fn parses_flags_in_both_forms() {
        let parsed = args(&["--data-dir", "/srv/newtube", "--port=9000", "--host", "::1"]).unwrap();
        assert_eq!(parsed.data_dir, Some(PathBuf::from("/srv/newtube")));
        assert_eq!(parsed.newtube_port, Some(9000));
        assert_eq!(parsed.listen_host, Some("::1".parse().unwrap()));

        let overrides = parsed.overrides();
        assert_eq!(overrides.newtube_host.as_deref(), Some("::1"));
        assert_eq!(overrides.newtube_port, Some(9000));
    }

    #[test]
    fn rejects_bad_flags() {
        assert!(args(&["--port", "http"]).is_err());
        assert!(args(&["--host=localhost"]).is_err());
        assert!(args(&["--data-dir"]).is_err());
        assert!(args(&["--media-root", "/tmp"]).is_err());
        assert_eq!(args(&[]).unwrap(), BackendArgs::default());
    }

    #[test]
    fn router_builds_without_conflicts() {
        let ctx = BackendTestContext::new();
        let _app = router(ctx.state.clone());
    }

    #[tokio::test]
    async fn resolves_stream_json() {
        let ctx = BackendTestContext::new();
        let Json(body) = get_stream(ctx.state(), AxumPath("abc123".into()))
            .await
            .unwrap();
        assert_eq!(body.id, "abc123");
        assert_eq!(body.url.as_str(), "https://cdn.example/abc123.mp4");

        get_stream(ctx.state(), AxumPath("abc123".into()))
            .await
            .unwrap();
        assert_eq!(ctx.extractor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn play_redirects_to_stream() {
        let ctx = BackendTestContext::new();
        let response = play_stream(ctx.state(), AxumPath("abc123".into()))
            .await
            .unwrap()
            .into_response();
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "https://cdn.example/abc123.mp4"
        );
    }

    #[tokio::test]
    async fn maps_resolution_errors_to_statuses() {
        let ctx = BackendTestContext::new();

        let missing = get_stream(ctx.state(), AxumPath("missing".into()))
            .await
            .unwrap_err();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);

        let broken = get_stream(ctx.state(), AxumPath("broken".into()))
            .await
            .unwrap_err();
        assert_eq!(broken.status, StatusCode::BAD_GATEWAY);
        assert!(broken.message.contains("503"));

        let empty = get_stream(ctx.state(), AxumPath("  ".into()))
            .await
            .unwrap_err();
        assert_eq!(empty.status, StatusCode::BAD_REQUEST);

        let response = missing.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = json_body(response).await;
        assert_eq!(body["error"], "no playable stream found for missing");
    }

    #[tokio::test]
    async fn prefetch_accepts_and_warms() {
        let ctx = BackendTestContext::new();
        let payload = PrefetchRequest {
            ids: vec!["a".into(), " ".into(), "a".into(), "b".into(), "broken".into()],
        };
        let (status, Json(body)) = prefetch_streams(ctx.state(), Json(payload))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body.queued, 3);

        ctx.state.cache.wait_idle().await;
        let Json(listing) = list_streams(ctx.state()).await;
        assert_eq!(
            listing.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
    }

    #[tokio::test]
    async fn prefetch_of_only_blank_ids_is_rejected() {
        let ctx = BackendTestContext::new();
        let err = prefetch_streams(
            ctx.state(),
            Json(PrefetchRequest {
                ids: vec!["".into(), "  ".into()],
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn settings_round_trip_through_handlers() {
        let ctx = BackendTestContext::new();
        let Json(current) = get_settings(ctx.state()).await.unwrap();
        assert!(current.prefer_local_extraction);

        let Json(updated) = update_settings(
            ctx.state(),
            Json(ResolverSettings {
                prefer_local_extraction: false,
            }),
        )
        .await
        .unwrap();
        assert!(!updated.prefer_local_extraction);
        assert_eq!(
            ctx.state.settings.extraction_method(),
            ExtractionMethod::Remote
        );
    }
}
