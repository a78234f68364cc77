// src/error.rs
use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("insufficient credit: required {required}, available {available}")]
    InsufficientCredit { required: String, available: String },

    #[error("rating plan missing: {0}")]
    RatingPlanMissing(String),

    #[error("no matching destination: {0}")]
    DestinationNotMatched(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("trigger execution failed: {0}")]
    TriggerExecutionFailed(String),

    #[error("scheduler overloaded")]
    SchedulerOverloaded,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn error_code(&self) -> &str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::InsufficientCredit { .. } => "insufficient_credit",
            EngineError::RatingPlanMissing(_) => "rating_plan_missing",
            EngineError::DestinationNotMatched(_) => "destination_not_matched",
            EngineError::StorageUnavailable(_) => "storage_unavailable",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::TriggerExecutionFailed(_) => "trigger_execution_failed",
            EngineError::SchedulerOverloaded => "scheduler_overloaded",
            EngineError::Serialization(_) => "serialization_error",
            EngineError::Internal(_) => "internal_error",
        }
    }
}

impl ResponseError for EngineError {
    fn error_response(&self) -> HttpResponse {
        let status_code = self.status_code();

        HttpResponse::build(status_code).json(json!({
            "error": self.error_code(),
            "message": self.to_string(),
        }))
    }

    fn status_code(&self) -> StatusCode {
        match self {
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::InsufficientCredit { .. } => StatusCode::FORBIDDEN,
            EngineError::RatingPlanMissing(_) => StatusCode::NOT_FOUND,
            EngineError::DestinationNotMatched(_) => StatusCode::NOT_FOUND,
            EngineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            EngineError::SchedulerOverloaded => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
