use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    Validation,
    AuthenticationFailed,
    ConnectionFailed,
    StaleAttempt,
    SessionNotFound,
    SessionLimitReached,
    LastSession,
    RestartInProgress,
    RenderFailed,
    DependenciesUnavailable,
    StreamError,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:copilot-host:error:invalid_request",
            Self::Validation => "urn:copilot-host:error:validation",
            Self::AuthenticationFailed => "urn:copilot-host:error:authentication_failed",
            Self::ConnectionFailed => "urn:copilot-host:error:connection_failed",
            Self::StaleAttempt => "urn:copilot-host:error:stale_attempt",
            Self::SessionNotFound => "urn:copilot-host:error:session_not_found",
            Self::SessionLimitReached => "urn:copilot-host:error:session_limit_reached",
            Self::LastSession => "urn:copilot-host:error:last_session",
            Self::RestartInProgress => "urn:copilot-host:error:restart_in_progress",
            Self::RenderFailed => "urn:copilot-host:error:render_failed",
            Self::DependenciesUnavailable => "urn:copilot-host:error:dependencies_unavailable",
            Self::StreamError => "urn:copilot-host:error:stream_error",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::Validation => "Missing Control Parameters",
            Self::AuthenticationFailed => "Authentication Failed",
            Self::ConnectionFailed => "Connection Failed",
            Self::StaleAttempt => "Stale Attempt",
            Self::SessionNotFound => "Session Not Found",
            Self::SessionLimitReached => "Session Limit Reached",
            Self::LastSession => "Last Session",
            Self::RestartInProgress => "Restart In Progress",
            Self::RenderFailed => "Render Failed",
            Self::DependenciesUnavailable => "Dependencies Unavailable",
            Self::StreamError => "Stream Error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::Validation => 422,
            Self::AuthenticationFailed => 401,
            Self::ConnectionFailed => 502,
            Self::StaleAttempt => 409,
            Self::SessionNotFound => 404,
            Self::SessionLimitReached => 409,
            Self::LastSession => 409,
            Self::RestartInProgress => 409,
            Self::RenderFailed => 500,
            Self::DependenciesUnavailable => 503,
            Self::StreamError => 502,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
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

/// Every failure the host component can produce.
///
/// Lifecycle failures are scoped to a single session: the registry surfaces
/// them into that session's render target and never propagates them to
/// sibling tabs. `StaleAttempt` is not a user-visible failure at all.
#[derive(Debug, Clone, Error)]
pub enum HostError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("missing required control parameters: {}", missing.join(", "))]
    Validation { missing: Vec<String> },
    #[error("authentication failed: {message}")]
    AuthenticationFailed { message: String },
    #[error("connection failed: {message}")]
    ConnectionFailed { message: String },
    #[error("bootstrap attempt {generation} was superseded")]
    StaleAttempt { generation: u64 },
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },
    #[error("session limit reached ({limit})")]
    SessionLimitReached { limit: usize },
    #[error("cannot close the last session: {session_id}")]
    LastSession { session_id: String },
    #[error("restart already in progress: {session_id}")]
    RestartInProgress { session_id: String },
    #[error("render failed: {message}")]
    RenderFailed { message: String },
    #[error("dependencies did not load within {attempts} attempts")]
    DependenciesUnavailable { attempts: u32 },
    #[error("stream error: {message}")]
    StreamError { message: String },
}

impl HostError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::Validation { .. } => ErrorType::Validation,
            Self::AuthenticationFailed { .. } => ErrorType::AuthenticationFailed,
            Self::ConnectionFailed { .. } => ErrorType::ConnectionFailed,
            Self::StaleAttempt { .. } => ErrorType::StaleAttempt,
            Self::SessionNotFound { .. } => ErrorType::SessionNotFound,
            Self::SessionLimitReached { .. } => ErrorType::SessionLimitReached,
            Self::LastSession { .. } => ErrorType::LastSession,
            Self::RestartInProgress { .. } => ErrorType::RestartInProgress,
            Self::RenderFailed { .. } => ErrorType::RenderFailed,
            Self::DependenciesUnavailable { .. } => ErrorType::DependenciesUnavailable,
            Self::StreamError { .. } => ErrorType::StreamError,
        }
    }

    /// Superseded bootstraps are abandoned quietly; nothing is shown to the user.
    pub fn is_silent(&self) -> bool {
        matches!(self, Self::StaleAttempt { .. })
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        let mut extensions = Map::new();
        match self {
            Self::Validation { missing } => {
                extensions.insert(
                    "missing".to_string(),
                    Value::Array(missing.iter().cloned().map(Value::String).collect()),
                );
            }
            Self::StaleAttempt { generation } => {
                extensions.insert(
                    "generation".to_string(),
                    Value::Number(serde_json::Number::from(*generation)),
                );
            }
            Self::SessionNotFound { session_id }
            | Self::LastSession { session_id }
            | Self::RestartInProgress { session_id } => {
                extensions.insert("sessionId".to_string(), Value::String(session_id.clone()));
            }
            Self::SessionLimitReached { limit } => {
                extensions.insert(
                    "limit".to_string(),
                    Value::Number(serde_json::Number::from(*limit as u64)),
                );
            }
            Self::DependenciesUnavailable { attempts } => {
                extensions.insert(
                    "attempts".to_string(),
                    Value::Number(serde_json::Number::from(*attempts)),
                );
            }
            Self::InvalidRequest { .. }
            | Self::AuthenticationFailed { .. }
            | Self::ConnectionFailed { .. }
            | Self::RenderFailed { .. }
            | Self::StreamError { .. } => {}
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<HostError> for ProblemDetails {
    fn from(value: HostError) -> Self {
        value.to_problem_details()
    }
}

impl From<&HostError> for ProblemDetails {
    fn from(value: &HostError) -> Self {
        value.to_problem_details()
    }
}
