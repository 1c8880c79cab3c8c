//! Progress and outcome notifications emitted on a run's event stream.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct RunEvent {
    #[serde(rename = "type")]
    pub event_type: RunEventType,
    pub data: RunEventData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub enum RunEventType {
    #[serde(rename = "run.started")]
    RunStarted,
    #[serde(rename = "run.delta")]
    RunDelta,
    #[serde(rename = "run.completed")]
    RunCompleted,
    #[serde(rename = "run.failed")]
    RunFailed,
    #[serde(rename = "run.cancelled")]
    RunCancelled,
}

impl RunEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunStarted => "run.started",
            Self::RunDelta => "run.delta",
            Self::RunCompleted => "run.completed",
            Self::RunFailed => "run.failed",
            Self::RunCancelled => "run.cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(untagged)]
pub enum RunEventData {
    Delta(DeltaData),
    Completed(CompletedData),
    Failed(FailedData),
    Cancelled(CancelledData),
    Started(StartedData),
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartedData {
    pub run_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeltaData {
    pub run_id: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CompletedData {
    pub run_id: String,
    pub response: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FailedData {
    pub run_id: String,
    pub error_code: RunErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CancelledData {
    pub run_id: String,
    pub reason: CancelReason,
}

/// Terminal failure codes carried by `run.failed`. These are event payload
/// codes, not HTTP statuses: the run was already accepted when they occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub enum RunErrorCode {
    #[serde(rename = "MISSING_API_KEY")]
    MissingApiKey,
    #[serde(rename = "MODEL_ERROR")]
    ModelError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    CancelledByClient,
}

impl RunEvent {
    pub fn started(run_id: &str) -> Self {
        Self {
            event_type: RunEventType::RunStarted,
            data: RunEventData::Started(StartedData {
                run_id: run_id.to_string(),
            }),
        }
    }

    pub fn delta(run_id: &str, text: &str) -> Self {
        Self {
            event_type: RunEventType::RunDelta,
            data: RunEventData::Delta(DeltaData {
                run_id: run_id.to_string(),
                text: text.to_string(),
            }),
        }
    }

    pub fn completed(run_id: &str, response: &str) -> Self {
        Self {
            event_type: RunEventType::RunCompleted,
            data: RunEventData::Completed(CompletedData {
                run_id: run_id.to_string(),
                response: response.to_string(),
            }),
        }
    }

    pub fn failed(run_id: &str, error_code: RunErrorCode, message: &str) -> Self {
        Self {
            event_type: RunEventType::RunFailed,
            data: RunEventData::Failed(FailedData {
                run_id: run_id.to_string(),
                error_code,
                message: message.to_string(),
            }),
        }
    }

    pub fn cancelled(run_id: &str) -> Self {
        Self {
            event_type: RunEventType::RunCancelled,
            data: RunEventData::Cancelled(CancelledData {
                run_id: run_id.to_string(),
                reason: CancelReason::CancelledByClient,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn started_event_serializes_with_dotted_name() {
        let event = RunEvent::started("run-1");
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value, json!({"type": "run.started", "data": {"runId": "run-1"}}));
    }

    #[test]
    fn failed_event_carries_error_code() {
        let event = RunEvent::failed("run-1", RunErrorCode::MissingApiKey, "no key");
        let value = serde_json::to_value(&event.data).expect("serialize");
        assert_eq!(
            value,
            json!({"runId": "run-1", "errorCode": "MISSING_API_KEY", "message": "no key"})
        );
    }

    #[test]
    fn cancelled_event_names_the_client() {
        let event = RunEvent::cancelled("run-1");
        let value = serde_json::to_value(&event.data).expect("serialize");
        assert_eq!(value["reason"], "cancelled_by_client");
    }

    #[test]
    fn event_type_names_match_serde_renames() {
        for event_type in [
            RunEventType::RunStarted,
            RunEventType::RunDelta,
            RunEventType::RunCompleted,
            RunEventType::RunFailed,
            RunEventType::RunCancelled,
        ] {
            let rendered = serde_json::to_value(event_type).expect("serialize");
            assert_eq!(rendered, event_type.as_str());
        }
    }
}
