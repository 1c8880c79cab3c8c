//! HTTP boundary: request validation, status-code mapping and SSE framing.
//! Everything of substance is delegated to [`RunManager`] and
//! [`SettingsStore`].

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tower_http::trace::TraceLayer;
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;

use agent_relay_error::{ProblemDetails, RelayError};

use crate::config::RelayConfig;
use crate::events::RunEvent;
use crate::run_manager::{ConversationTurn, RunManager, RunPayload, DEFAULT_TEMPERATURE};
use crate::settings_store::SettingsStore;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug)]
pub struct AppState {
    config: RelayConfig,
    settings_store: SettingsStore,
    run_manager: RunManager,
    started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: RelayConfig, settings_store: SettingsStore) -> Self {
        let run_manager = RunManager::new(config.clone(), settings_store.clone());
        Self::with_run_manager(config, settings_store, run_manager)
    }

    /// State with an externally constructed run manager (tests inject a mock
    /// model backend this way).
    pub fn with_run_manager(
        config: RelayConfig,
        settings_store: SettingsStore,
        run_manager: RunManager,
    ) -> Self {
        Self {
            config,
            settings_store,
            run_manager,
            started_at: Utc::now(),
        }
    }

    pub fn run_manager(&self) -> RunManager {
        self.run_manager.clone()
    }
}

pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);
    Router::new()
        .route("/status", get(get_status))
        .route(
            "/settings/provider",
            get(get_provider_settings)
                .post(set_provider_settings)
                .delete(reset_provider_settings),
        )
        .route("/runs", post(create_run))
        .route("/runs/:run_id/events", get(stream_run_events))
        .route("/runs/:run_id/cancel", post(cancel_run))
        .route("/openapi.json", get(get_openapi))
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Relay(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_sec: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Constraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_network: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tool_concurrency: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateRunRequest {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub record_id: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub conversation: Vec<ConversationMessage>,
    #[serde(default)]
    pub tool_inventory: Vec<ToolDefinition>,
    #[serde(default)]
    pub constraints: Constraints,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl CreateRunRequest {
    fn validate(&self) -> Result<(), RelayError> {
        if let Some(run_id) = self.run_id.as_deref() {
            // empty means "generate one"; whitespace-only is a caller mistake
            if !run_id.is_empty() && run_id.trim().is_empty() {
                return Err(RelayError::InvalidRequest {
                    message: "runId must not be blank".to_string(),
                });
            }
        }
        if let Some(temperature) = self.constraints.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(RelayError::InvalidRequest {
                    message: format!("temperature {temperature} is outside 0.0..=2.0"),
                });
            }
        }
        if let Some(tool) = self
            .tool_inventory
            .iter()
            .find(|tool| tool.timeout_sec == Some(0))
        {
            return Err(RelayError::InvalidRequest {
                message: format!("tool {} has a zero timeoutSec", tool.id),
            });
        }
        Ok(())
    }

    fn into_payload(self) -> RunPayload {
        RunPayload {
            prompt: self.prompt,
            conversation: self
                .conversation
                .into_iter()
                .map(|message| ConversationTurn {
                    role: message.role.as_str().to_string(),
                    content: message.content,
                })
                .collect(),
            temperature: self.constraints.temperature.unwrap_or(DEFAULT_TEMPERATURE),
        }
    }
}

#[derive(Debug, Serialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateRunResponse {
    pub run_id: String,
    pub status: String,
}

#[derive(Debug, Serialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CancelRunResponse {
    pub run_id: String,
    pub status: String,
}

#[derive(Debug, Serialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatusResponse {
    pub service: String,
    pub version: String,
    pub protocol_version: String,
    pub agents_etag: String,
    pub max_concurrent_runs: u32,
    pub started_at: DateTime<Utc>,
    pub metadata: StatusMetadata,
}

#[derive(Debug, Serialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusMetadata {
    pub offline_mode: bool,
    pub provider: ProviderStatus,
}

/// Provider configuration as reported by `/status` and `/settings/provider`.
/// Deliberately carries no credential material, only the `api_key_set` flag.
#[derive(Debug, Serialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    pub api_key_set: bool,
    pub model: String,
    pub base_url: String,
}

#[derive(Debug, Clone, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSettingsPayload {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Serialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSettingsResponse {
    pub api_key_set: bool,
    pub base_url: String,
}

#[utoipa::path(
    get,
    path = "/status",
    responses((status = 200, body = ServiceStatusResponse)),
    tag = "status"
)]
async fn get_status(State(state): State<Arc<AppState>>) -> Json<ServiceStatusResponse> {
    let provider = state.settings_store.provider_settings(&state.config.api_base);
    Json(ServiceStatusResponse {
        service: state.config.service_name.clone(),
        version: state.config.service_version.clone(),
        protocol_version: state.config.protocol_version.clone(),
        agents_etag: state.config.agents_etag.clone(),
        max_concurrent_runs: state.config.max_concurrent_runs,
        started_at: state.started_at,
        metadata: StatusMetadata {
            offline_mode: state.config.offline_mode,
            provider: ProviderStatus {
                api_key_set: provider.api_key.is_some(),
                model: state.config.model.clone(),
                base_url: provider.base_url,
            },
        },
    })
}

#[utoipa::path(
    get,
    path = "/settings/provider",
    responses((status = 200, body = ProviderSettingsResponse)),
    tag = "settings"
)]
async fn get_provider_settings(
    State(state): State<Arc<AppState>>,
) -> Json<ProviderSettingsResponse> {
    let provider = state.settings_store.provider_settings(&state.config.api_base);
    Json(ProviderSettingsResponse {
        api_key_set: provider.api_key.is_some(),
        base_url: provider.base_url,
    })
}

#[utoipa::path(
    post,
    path = "/settings/provider",
    request_body = ProviderSettingsPayload,
    responses(
        (status = 200, body = ProviderSettingsResponse),
        (status = 500, body = ProblemDetails)
    ),
    tag = "settings"
)]
async fn set_provider_settings(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ProviderSettingsPayload>,
) -> Result<Json<ProviderSettingsResponse>, ApiError> {
    state
        .settings_store
        .set_provider(payload.api_key.as_deref(), payload.base_url.as_deref())
        .map_err(|err| RelayError::SettingsWrite {
            message: err.to_string(),
        })?;
    let provider = state.settings_store.provider_settings(&state.config.api_base);
    Ok(Json(ProviderSettingsResponse {
        api_key_set: provider.api_key.is_some(),
        base_url: provider.base_url,
    }))
}

#[utoipa::path(
    delete,
    path = "/settings/provider",
    responses(
        (status = 200, body = ProviderSettingsResponse),
        (status = 500, body = ProblemDetails)
    ),
    tag = "settings"
)]
async fn reset_provider_settings(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ProviderSettingsResponse>, ApiError> {
    state
        .settings_store
        .set_provider(None, Some(&state.config.api_base))
        .map_err(|err| RelayError::SettingsWrite {
            message: err.to_string(),
        })?;
    Ok(Json(ProviderSettingsResponse {
        api_key_set: false,
        base_url: state.config.api_base.clone(),
    }))
}

#[utoipa::path(
    post,
    path = "/runs",
    request_body = CreateRunRequest,
    responses(
        (status = 202, body = CreateRunResponse),
        (status = 400, body = ProblemDetails),
        (status = 409, body = ProblemDetails)
    ),
    tag = "runs"
)]
async fn create_run(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateRunRequest>,
) -> Result<Response, ApiError> {
    request.validate()?;
    let run_id = request
        .run_id
        .clone()
        .filter(|run_id| !run_id.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    state
        .run_manager
        .create_run(&run_id, request.into_payload())
        .await?;

    let body = CreateRunResponse {
        run_id: run_id.clone(),
        status: "accepted".to_string(),
    };
    Ok((
        StatusCode::ACCEPTED,
        [(header::LOCATION, format!("/runs/{run_id}/events"))],
        Json(body),
    )
        .into_response())
}

#[utoipa::path(
    get,
    path = "/runs/{run_id}/events",
    params(("run_id" = String, Path, description = "Run id")),
    responses(
        (status = 200, description = "SSE event stream"),
        (status = 404, body = ProblemDetails),
        (status = 409, body = ProblemDetails)
    ),
    tag = "runs"
)]
async fn stream_run_events(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    state.run_manager.ensure_run_exists(&run_id).await?;
    let events = state.run_manager.stream_events(&run_id).await?;
    let stream = events.map(|event| Ok::<Event, Infallible>(to_sse_event(event)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL)))
}

#[utoipa::path(
    post,
    path = "/runs/{run_id}/cancel",
    params(("run_id" = String, Path, description = "Run id")),
    responses(
        (status = 202, body = CancelRunResponse),
        (status = 404, body = ProblemDetails)
    ),
    tag = "runs"
)]
async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Response, ApiError> {
    state.run_manager.cancel_run(&run_id).await?;
    let body = CancelRunResponse {
        run_id,
        status: "cancelling".to_string(),
    };
    Ok((StatusCode::ACCEPTED, Json(body)).into_response())
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

fn to_sse_event(event: RunEvent) -> Event {
    Event::default()
        .event(event.event_type.as_str())
        .json_data(&event.data)
        .unwrap_or_else(|_| Event::default().data("{}"))
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_status,
        get_provider_settings,
        set_provider_settings,
        reset_provider_settings,
        create_run,
        stream_run_events,
        cancel_run,
    ),
    components(schemas(
        ServiceStatusResponse,
        StatusMetadata,
        ProviderStatus,
        ProviderSettingsPayload,
        ProviderSettingsResponse,
        CreateRunRequest,
        CreateRunResponse,
        CancelRunResponse,
        ConversationMessage,
        MessageRole,
        ToolDefinition,
        Constraints,
        ProblemDetails,
    ))
)]
struct ApiDoc;
