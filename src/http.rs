//! HTTP surface: health/info, submission, and cancellation endpoints
//! (SPEC_FULL.md §4.7), plus the two Transport Adapters (§4.6) that turn a
//! Pipeline Driver run into either one buffered JSON reply or a sequence of
//! named SSE events.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt as _;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::admission::AdmissionRegistry;
use crate::config::HarnessConfig;
use crate::event::OrchestratorEvent;
use crate::models::{CancelRequest, CancelResponse, SubmissionRequest};
use crate::multiplexer::StreamSignal;
use crate::pipeline::{self, PipelineOutcome};
use crate::{admission::AdmitConflict, process};

const CHANNEL_CAPACITY: usize = 256;

/// State shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<HarnessConfig>,
    pub registry: AdmissionRegistry,
}

impl AppState {
    pub fn new(config: Arc<HarnessConfig>, registry: AdmissionRegistry) -> Self {
        Self { config, registry }
    }
}

/// Builds the axum `Router` exposing `/`, `/health`, `/test`, and `/cancel`.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(service_info))
        .route("/health", get(health))
        .route("/test", post(submit))
        .route("/cancel", post(cancel))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct ServiceInfo {
    name: &'static str,
    version: &'static str,
    endpoints: Vec<&'static str>,
}

async fn service_info() -> impl IntoResponse {
    Json(ServiceInfo {
        name: "harness-orchestrator",
        version: env!("CARGO_PKG_VERSION"),
        endpoints: vec!["GET /", "GET /health", "POST /test", "POST /cancel"],
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: chrono::DateTime<chrono::Utc>,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        timestamp: crate::event::now_iso8601(),
    })
}

/// Whether the client declared it accepts an SSE response (SPEC_FULL.md
/// §4.7, "If the request advertises acceptance of the event-stream media
/// type").
fn wants_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(axum::http::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/event-stream"))
}

#[derive(Serialize)]
struct ConflictResponse {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    active_submission_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    active_project_id: Option<String>,
}

async fn submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SubmissionRequest>,
) -> axum::response::Response {
    if wants_event_stream(&headers) {
        submit_streaming(state, request).await.into_response()
    } else {
        submit_buffered(state, request).await.into_response()
    }
}

async fn submit_buffered(state: AppState, request: SubmissionRequest) -> axum::response::Response {
    let project_id = request.project_id.clone();
    match pipeline::run_submission(state.config.clone(), state.registry.clone(), request, None).await {
        PipelineOutcome::Conflict(conflict) => {
            let body = match conflict {
                AdmitConflict::ProjectBusy { active_submission_id } => ConflictResponse {
                    error: "project_busy",
                    message: format!("project busy: {active_submission_id} is already running"),
                    active_submission_id: Some(active_submission_id),
                    active_project_id: Some(project_id),
                },
                AdmitConflict::RequestIdBusy => ConflictResponse {
                    error: "request_id_busy",
                    message: "submission id already in use for another project".to_string(),
                    active_submission_id: None,
                    active_project_id: None,
                },
            };
            (StatusCode::CONFLICT, Json(body)).into_response()
        }
        PipelineOutcome::Verdict(verdict) => {
            let is_error = verdict.build_verdict.status == crate::models::VerdictStatus::Error
                || verdict
                    .test_verdict
                    .as_ref()
                    .is_some_and(|v| v.status == crate::models::VerdictStatus::Error);
            let status = if is_error { StatusCode::INTERNAL_SERVER_ERROR } else { StatusCode::OK };
            (status, Json(verdict)).into_response()
        }
    }
}

async fn submit_streaming(state: AppState, request: SubmissionRequest) -> axum::response::Response {
    let (tx, rx) = tokio::sync::mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(async move {
        pipeline::run_submission(state.config, state.registry, request, Some(tx)).await;
    });

    let stream = ReceiverStream::new(rx).map(signal_to_sse);
    Sse::new(stream).into_response()
}

fn signal_to_sse(signal: StreamSignal) -> Result<SseEvent, Infallible> {
    match signal {
        StreamSignal::Event(event) => Ok(orchestrator_event_to_sse(&event)),
        // Content-free, emitted by the Multiplexer only during the test
        // phase (SPEC_FULL.md §4.6); rendered as the bare SSE comment line
        // `: keep-alive\n\n` rather than a named event.
        StreamSignal::KeepAlive => Ok(SseEvent::default().comment("keep-alive")),
    }
}

fn orchestrator_event_to_sse(event: &OrchestratorEvent) -> SseEvent {
    let json = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    SseEvent::default().event(event.event_name()).data(json)
}

async fn cancel(
    State(state): State<AppState>,
    Json(request): Json<CancelRequest>,
) -> impl IntoResponse {
    let (status, child) = state.registry.cancel(&request.submission_id).await;

    if let Some(child) = child {
        let grace = Duration::from_secs(state.config.grace_period_secs);
        // Fire-and-forget: the cancel handler never waits for the pipeline
        // to observe the token (SPEC_FULL.md §4.1).
        tokio::spawn(async move {
            process::terminate_pid_group(child.pid, grace).await;
        });
    }

    Json(CancelResponse {
        submission_id: request.submission_id,
        status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wants_event_stream_detects_sse_accept_header() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::ACCEPT, "text/event-stream".parse().unwrap());
        assert!(wants_event_stream(&headers));

        let mut plain = HeaderMap::new();
        plain.insert(axum::http::header::ACCEPT, "application/json".parse().unwrap());
        assert!(!wants_event_stream(&plain));

        assert!(!wants_event_stream(&HeaderMap::new()));
    }

    #[test]
    fn keepalive_renders_as_comment_not_named_event() {
        let sse = signal_to_sse(StreamSignal::KeepAlive).unwrap();
        let rendered = format!("{sse}");
        assert!(rendered.contains(": keep-alive"));
        assert!(!rendered.contains("event:"));
    }

    #[test]
    fn done_event_renders_with_event_name() {
        let sse = signal_to_sse(StreamSignal::Event(OrchestratorEvent::Done { success: true }))
            .unwrap();
        let rendered = format!("{sse}");
        assert!(rendered.contains("event: done"));
        assert!(rendered.contains("\"success\":true"));
    }
}
