use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    RunAlreadyExists,
    RunNotFound,
    Conflict,
    SettingsWriteFailed,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:agentrelay:error:invalid_request",
            Self::RunAlreadyExists => "urn:agentrelay:error:run_already_exists",
            Self::RunNotFound => "urn:agentrelay:error:run_not_found",
            Self::Conflict => "urn:agentrelay:error:conflict",
            Self::SettingsWriteFailed => "urn:agentrelay:error:settings_write_failed",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::RunAlreadyExists => "Run Already Exists",
            Self::RunNotFound => "Run Not Found",
            Self::Conflict => "Conflict",
            Self::SettingsWriteFailed => "Settings Write Failed",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::RunAlreadyExists => 409,
            Self::RunNotFound => 404,
            Self::Conflict => 409,
            Self::SettingsWriteFailed => 500,
        }
    }
}

/// RFC 7807 problem document returned by every non-2xx API response.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("run already exists: {run_id}")]
    RunAlreadyExists { run_id: String },
    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },
    #[error("run event stream is already being consumed: {run_id}")]
    StreamConsumed { run_id: String },
    #[error("failed to persist settings: {message}")]
    SettingsWrite { message: String },
}

impl RelayError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::RunAlreadyExists { .. } => ErrorType::RunAlreadyExists,
            Self::RunNotFound { .. } => ErrorType::RunNotFound,
            Self::StreamConsumed { .. } => ErrorType::Conflict,
            Self::SettingsWrite { .. } => ErrorType::SettingsWriteFailed,
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));

        let mut extensions = Map::new();
        match self {
            Self::RunAlreadyExists { run_id }
            | Self::RunNotFound { run_id }
            | Self::StreamConsumed { run_id } => {
                extensions.insert("runId".to_string(), Value::String(run_id.clone()));
            }
            Self::InvalidRequest { .. } | Self::SettingsWrite { .. } => {}
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<RelayError> for ProblemDetails {
    fn from(value: RelayError) -> Self {
        value.to_problem_details()
    }
}

impl From<&RelayError> for ProblemDetails {
    fn from(value: &RelayError) -> Self {
        value.to_problem_details()
    }
}
