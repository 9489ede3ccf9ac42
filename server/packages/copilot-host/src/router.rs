//! HTTP bridge that lets a headless host drive the control: manage tabs,
//! queue messages through `PendingMessage`, flip host flags and follow
//! transcripts and captured replies over SSE.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use copilot_host_error::{HostError, ProblemDetails};
use futures::{stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tower_http::trace::TraceLayer;
use tracing::Span;

use crate::control::CopilotHostControl;
use crate::host::{HostField, HostFlag, InMemoryHostBinding};
use crate::registry::{CloseOutcome, TabInfo};
use crate::transcript::TranscriptRenderer;

const LOG_HTTP_ENV: &str = "COPILOT_HOST_LOG_HTTP";

#[derive(Debug, Clone)]
pub struct AppState {
    pub control: Arc<CopilotHostControl>,
    pub host: Arc<InMemoryHostBinding>,
    pub transcripts: Arc<TranscriptRenderer>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Host(#[from] HostError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Host(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (
            status,
            [(header::CONTENT_TYPE, "application/problem+json")],
            Json(problem),
        )
            .into_response()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    ok: bool,
    tabs: usize,
    active_tab: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TabListResponse {
    tabs: Vec<TabInfo>,
    active_tab: Option<String>,
    max_tabs: usize,
}

#[derive(Debug, Deserialize)]
struct RenameRequest {
    name: String,
}

#[derive(Debug, Deserialize)]
struct MessageRequest {
    text: String,
}

#[derive(Debug, Default, Deserialize)]
struct HostUpdate {
    #[serde(default)]
    fields: HashMap<HostField, String>,
    #[serde(default)]
    flags: HashMap<HostFlag, bool>,
}

#[derive(Debug, Serialize)]
struct AgentResponse {
    text: String,
}

pub fn build_router(state: AppState) -> Router {
    let v1 = Router::new()
        .route("/health", get(get_health))
        .route("/tabs", get(list_tabs).post(create_tab))
        .route("/tabs/:id", axum::routing::patch(rename_tab).delete(close_tab))
        .route("/tabs/:id/activate", post(activate_tab))
        .route("/tabs/:id/restart", post(restart_tab))
        .route("/tabs/:id/transcript", get(stream_transcript))
        .route("/messages", post(post_message))
        .route("/responses", get(stream_responses))
        .route("/host", put(update_host));

    let mut router = Router::new()
        .nest("/v1", v1)
        .with_state(Arc::new(state));

    let http_logging = match std::env::var(LOG_HTTP_ENV) {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!("http.request", method = %req.method(), uri = %req.uri())
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::debug!(parent: span, "bridge: request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis() as u64,
                    "bridge: response"
                );
            });
        router = router.layer(trace_layer);
    }
    router
}

async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let registry = state.control.registry();
    Json(HealthResponse {
        ok: true,
        tabs: registry.len(),
        active_tab: registry.active_id(),
    })
}

async fn list_tabs(State(state): State<Arc<AppState>>) -> Json<TabListResponse> {
    let registry = state.control.registry();
    Json(TabListResponse {
        tabs: registry.list(),
        active_tab: registry.active_id(),
        max_tabs: registry.max_sessions(),
    })
}

async fn create_tab(
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<TabInfo>), ApiError> {
    let handle = state.control.create_tab()?;
    let info = tab_info(&state, &handle.id)?;
    Ok((StatusCode::CREATED, Json(info)))
}

async fn rename_tab(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<RenameRequest>,
) -> Result<Json<TabInfo>, ApiError> {
    state.control.registry().rename(&id, &request.name)?;
    Ok(Json(tab_info(&state, &id)?))
}

async fn close_tab(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    match state.control.registry().close_session(&id) {
        CloseOutcome::Closed { detached } => {
            state.transcripts.forget(&id);
            if detached.is_some() {
                tracing::info!(session_id = %id, "bridge: closed tab kept its connection alive");
            }
            Ok(StatusCode::NO_CONTENT)
        }
        CloseOutcome::LastSession => Err(HostError::LastSession { session_id: id }.into()),
        CloseOutcome::NotFound => Err(HostError::SessionNotFound { session_id: id }.into()),
    }
}

async fn activate_tab(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.control.registry().switch_active(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(HostError::SessionNotFound { session_id: id }.into())
    }
}

async fn restart_tab(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.control.registry().restart_session(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stream_transcript(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if state.control.registry().session(&id).is_none() {
        return Err(HostError::SessionNotFound { session_id: id }.into());
    }
    let last_event_id = headers
        .get("last-event-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());

    let (replay, rx) = state.transcripts.subscribe(&id, last_event_id);
    let replay_stream = stream::iter(replay).map(|entry| Ok(activity_event(entry)));
    let live_stream = BroadcastStream::new(rx).filter_map(|item| async move {
        match item {
            Ok(entry) => Some(Ok(activity_event(entry))),
            Err(_) => None,
        }
    });
    Ok(Sse::new(replay_stream.chain(live_stream))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

async fn post_message(
    State(state): State<Arc<AppState>>,
    Json(request): Json<MessageRequest>,
) -> Result<StatusCode, ApiError> {
    if request.text.trim().is_empty() {
        return Err(HostError::InvalidRequest {
            message: "message text must not be empty".to_string(),
        }
        .into());
    }
    state.host.set_pending_message(&request.text);
    Ok(StatusCode::ACCEPTED)
}

async fn stream_responses(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.host.subscribe_responses()).filter_map(|item| async move {
        let text = item.ok()?;
        let event = Event::default()
            .event("response")
            .json_data(AgentResponse { text })
            .ok()?;
        Some(Ok(event))
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

async fn update_host(
    State(state): State<Arc<AppState>>,
    Json(update): Json<HostUpdate>,
) -> StatusCode {
    for (field, value) in &update.fields {
        state.host.set_field(*field, value);
    }
    for (flag, value) in &update.flags {
        state.host.set_flag(*flag, *value);
    }
    tracing::debug!(
        fields = update.fields.len(),
        flags = update.flags.len(),
        "bridge: host binding updated"
    );
    StatusCode::NO_CONTENT
}

fn tab_info(state: &AppState, id: &str) -> Result<TabInfo, HostError> {
    state
        .control
        .registry()
        .list()
        .into_iter()
        .find(|tab| tab.id == id)
        .ok_or_else(|| HostError::SessionNotFound {
            session_id: id.to_string(),
        })
}

fn activity_event(entry: crate::transcript::TranscriptEntry) -> Event {
    let data = serde_json::to_string(&entry.activity).unwrap_or_else(|_| "{}".to_string());
    Event::default()
        .event("activity")
        .id(entry.sequence.to_string())
        .data(data)
}
