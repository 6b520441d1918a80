//! HTTP surface for the generation engine.
//!
//! - GET  /health
//! - POST /api/generate         synchronous, final image only
//! - POST /api/generate/stream  SSE: log, sketch, result, error
//! - POST /api/analyze          image to prompt modules
//! - POST /api/refine           instruction-driven module edits

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::stream::Stream;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Span;
use uuid::Uuid;
use weaver_contracts::config::EngineConfig;
use weaver_contracts::errors::GenerationError;
use weaver_contracts::events::{now_utc_iso, EventSink, EventWriter, ThinkingEvent};
use weaver_contracts::request::{
    AnalyzeRequest, AnalyzeResponse, GenerationRequest, GenerationResponse, RefineRequest,
    RefineResponse,
};
use weaver_engine::GenerationEngine;

const EVENT_BUFFER: usize = 32;
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;
pub const DEADLINE_MESSAGE: &str = "deadline exceeded";

#[derive(Clone)]
pub struct AppState {
    config: Arc<EngineConfig>,
    stream_deadline: Duration,
}

impl AppState {
    pub fn new(config: EngineConfig, stream_deadline: Duration) -> Self {
        Self {
            config: Arc::new(config),
            stream_deadline,
        }
    }
}

pub struct ServeOptions {
    pub bind: String,
    pub port: u16,
    pub allow_origins: Vec<String>,
}

pub fn create_router(state: AppState, allow_origins: &[String]) -> Result<Router> {
    let origins = if allow_origins.is_empty() {
        AllowOrigin::from(Any)
    } else {
        let values = allow_origins
            .iter()
            .map(|origin| {
                HeaderValue::from_str(origin.trim())
                    .with_context(|| format!("invalid --allow-origin value '{origin}'"))
            })
            .collect::<Result<Vec<HeaderValue>>>()?;
        AllowOrigin::list(values)
    };
    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Ok(Router::new()
        .route("/health", get(health_handler))
        .route("/api/generate", post(generate_handler))
        .route("/api/generate/stream", post(generate_stream_handler))
        .route("/api/analyze", post(analyze_handler))
        .route("/api/refine", post(refine_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

pub async fn serve(state: AppState, options: ServeOptions) -> Result<()> {
    let ip: IpAddr = options
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", options.bind))?;
    let addr = SocketAddr::from((ip, options.port));
    let app = create_router(state, &options.allow_origins)?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "voidweaver listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server terminated")?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("shutdown requested");
    }
}

/// Error body shared by every JSON endpoint.
pub struct ApiError(GenerationError);

impl From<GenerationError> for ApiError {
    fn from(err: GenerationError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(GenerationError::InvalidRequest(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status =
            StatusCode::from_u16(kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = json!({
            "error": true,
            "message": self.0.to_string(),
            "code": kind.code(),
            "timestamp": now_utc_iso(),
        });
        (status, Json(body)).into_response()
    }
}

fn request_span(route: &'static str) -> (Span, String) {
    let request_id = Uuid::new_v4().to_string();
    let span = tracing::info_span!("request", %request_id, route);
    (span, request_id)
}

/// Runs `job` against a fresh engine on the blocking pool. The engine owns
/// blocking HTTP clients, so it is created and dropped there.
async fn run_blocking<T, F>(config: Arc<EngineConfig>, span: Span, job: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&GenerationEngine) -> Result<T, GenerationError> + Send + 'static,
{
    let outcome = tokio::task::spawn_blocking(move || {
        let _guard = span.enter();
        let engine = GenerationEngine::new(&config).map_err(GenerationError::from_anyhow)?;
        job(&engine)
    })
    .await
    .map_err(|err| GenerationError::Internal(format!("generation task failed: {err}")))?;
    Ok(outcome?)
}

async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": now_utc_iso(),
    }))
}

async fn generate_handler(
    State(state): State<AppState>,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<Json<GenerationResponse>, ApiError> {
    let Json(request) = payload?;
    let (span, _) = request_span("generate");
    let response = run_blocking(state.config.clone(), span, move |engine| {
        engine.generate(&request)
    })
    .await?;
    Ok(Json(response))
}

async fn analyze_handler(
    State(state): State<AppState>,
    payload: Result<Json<AnalyzeRequest>, JsonRejection>,
) -> Result<Json<AnalyzeResponse>, ApiError> {
    let Json(request) = payload?;
    let (span, _) = request_span("analyze");
    let response =
        run_blocking(state.config.clone(), span, move |engine| engine.analyze(&request)).await?;
    Ok(Json(response))
}

async fn refine_handler(
    State(state): State<AppState>,
    payload: Result<Json<RefineRequest>, JsonRejection>,
) -> Result<Json<RefineResponse>, ApiError> {
    let Json(request) = payload?;
    let (span, _) = request_span("refine");
    let response =
        run_blocking(state.config.clone(), span, move |engine| engine.refine(&request)).await?;
    Ok(Json(response))
}

async fn generate_stream_handler(
    State(state): State<AppState>,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return ApiError::from(rejection).into_response(),
    };
    let (tx, rx) = mpsc::channel::<ThinkingEvent>(EVENT_BUFFER);
    let (span, request_id) = request_span("generate_stream");
    let config = state.config.clone();

    tokio::task::spawn_blocking(move || {
        let _guard = span.enter();
        let writer = EventWriter::new(ChannelSink::new(tx), request_id);
        match GenerationEngine::new(&config) {
            Ok(engine) => {
                if let Err(err) = engine.stream(&request, &writer) {
                    tracing::debug!(code = err.kind().code(), "stream closed with error event");
                }
            }
            Err(err) => {
                let err = GenerationError::from_anyhow(err);
                tracing::error!(code = err.kind().code(), "engine setup failed: {err}");
                let _ = writer.emit(ThinkingEvent::Error(err.to_string()));
            }
        }
    });

    Sse::new(event_stream(rx, state.stream_deadline))
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// Forwards events until the first terminal one. Guarantees a terminal event:
/// the deadline and a producer that vanished both end in `error`.
fn event_stream(
    mut rx: mpsc::Receiver<ThinkingEvent>,
    deadline: Duration,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        let deadline = tokio::time::sleep(deadline);
        tokio::pin!(deadline);
        loop {
            let next = tokio::select! {
                received = rx.recv() => received,
                _ = &mut deadline => {
                    tracing::warn!("stream deadline exceeded");
                    Some(ThinkingEvent::Error(DEADLINE_MESSAGE.to_string()))
                }
            };
            let event = match next {
                Some(event) => event,
                None => ThinkingEvent::Error("generation ended without a result".to_string()),
            };
            let terminal = event.is_terminal();
            yield Ok(sse_event(&event));
            if terminal {
                break;
            }
        }
    }
}

fn sse_event(event: &ThinkingEvent) -> Event {
    let data = event
        .data()
        .unwrap_or_else(|err| format!("failed to encode {} event: {err}", event.name()));
    Event::default().event(event.name()).data(data)
}

/// Bridges the blocking pipeline to the async SSE stream. Events sent after
/// the consumer went away are discarded.
pub struct ChannelSink {
    tx: mpsc::Sender<ThinkingEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<ThinkingEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn send(&self, event: ThinkingEvent) -> Result<()> {
        if self.tx.blocking_send(event).is_err() {
            tracing::debug!("stream consumer gone, event discarded");
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
