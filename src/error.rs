use rusqlite;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{error, warn};

pub type ScheduleResult<T> = Result<T, ScheduleError>;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("validation failed: {message}")]
    Validation {
        message: String,
        details: Option<JsonValue>,
    },

    #[error("unauthorized: {message}")]
    Auth { status: u16, message: String },

    #[error("record not found")]
    NotFound,

    #[error("scheduling conflict: {message}")]
    Conflict {
        message: String,
        details: Option<JsonValue>,
    },

    #[error("calendar precondition failed: {message}")]
    PreconditionFailed { message: String },

    #[error("calendar provider error: {message}")]
    Upstream {
        status: u16,
        message: String,
        details: Option<JsonValue>,
    },

    #[error("database error: {message}")]
    Database { message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl ScheduleError {
    /// HTTP-shaped status for the transport layer that mounts the engine.
    pub fn status(&self) -> u16 {
        match self {
            ScheduleError::Validation { .. } => 400,
            ScheduleError::Auth { status, .. } => *status,
            ScheduleError::NotFound => 404,
            ScheduleError::Conflict { .. } => 409,
            ScheduleError::PreconditionFailed { .. } => 412,
            ScheduleError::Upstream { status, .. } => *status,
            ScheduleError::Database { .. } => 500,
            ScheduleError::Serialization(_) => 500,
            ScheduleError::Io(_) => 500,
            ScheduleError::Internal { .. } => 500,
        }
    }

    pub fn details(&self) -> Option<&JsonValue> {
        match self {
            ScheduleError::Validation { details, .. }
            | ScheduleError::Conflict { details, .. }
            | ScheduleError::Upstream { details, .. } => details.as_ref(),
            _ => None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        let message = message.into();
        warn!(target: "engine::validation", %message, "validation error");
        ScheduleError::Validation {
            message,
            details: None,
        }
    }

    pub fn validation_with_details(message: impl Into<String>, details: JsonValue) -> Self {
        let message = message.into();
        warn!(target: "engine::validation", %message, details = %details, "validation error with details");
        ScheduleError::Validation {
            message,
            details: Some(details),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        let message = message.into();
        warn!(target: "engine::auth", %message, "unauthorized");
        ScheduleError::Auth {
            status: 401,
            message,
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        let message = message.into();
        warn!(target: "engine::auth", %message, "forbidden");
        ScheduleError::Auth {
            status: 403,
            message,
        }
    }

    pub fn not_found() -> Self {
        warn!(target: "engine::db", "resource not found");
        ScheduleError::NotFound
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        let message = message.into();
        warn!(target: "engine::conflict", %message, "scheduling conflict");
        ScheduleError::Conflict {
            message,
            details: None,
        }
    }

    pub fn conflict_with_details(message: impl Into<String>, details: JsonValue) -> Self {
        let message = message.into();
        warn!(target: "engine::conflict", %message, details = %details, "scheduling conflict");
        ScheduleError::Conflict {
            message,
            details: Some(details),
        }
    }

    pub fn precondition_failed(message: impl Into<String>) -> Self {
        let message = message.into();
        warn!(target: "engine::calendar", %message, "precondition failed");
        ScheduleError::PreconditionFailed { message }
    }

    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        warn!(target: "engine::calendar", status, %message, "upstream error");
        ScheduleError::Upstream {
            status,
            message,
            details: None,
        }
    }

    pub fn database(message: impl Into<String>) -> Self {
        let message = message.into();
        error!(target: "engine::db", %message, "database error");
        ScheduleError::Database { message }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        let message = message.into();
        error!(target: "engine::internal", %message, "internal error");
        ScheduleError::Internal { message }
    }

    /// Structured body for the no-placement 409 responses.
    pub fn no_slot(reason: &str, payload: JsonValue) -> Self {
        let mut details = payload;
        if let Some(map) = details.as_object_mut() {
            map.insert("error".into(), json!("no feasible placement"));
            map.insert("reason".into(), json!(reason));
        }
        Self::conflict_with_details(format!("no feasible placement: {reason}"), details)
    }
}

impl From<rusqlite::Error> for ScheduleError {
    fn from(error: rusqlite::Error) -> Self {
        use rusqlite::Error::{QueryReturnedNoRows, SqliteFailure};
        use rusqlite::ErrorCode;

        match &error {
            QueryReturnedNoRows => ScheduleError::not_found(),
            SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation => {
                ScheduleError::conflict("uniqueness or constraint violation")
            }
            _ => {
                error!(target: "engine::db", error = ?error, "sqlite error");
                ScheduleError::database(error.to_string())
            }
        }
    }
}
