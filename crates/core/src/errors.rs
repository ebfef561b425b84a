use std::fmt::Display;

use serde::Serialize;
use thiserror::Error;

/// Failure reported by a storage port. Adapters map their native errors into it.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("conflicting concurrent update: {0}")]
    Conflict(String),
    #[error("stored record could not be decoded: {0}")]
    Decode(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Rejected immediately and never retried.
    Validation,
    /// Equivalent to success for the caller.
    Idempotent,
    /// Safe to retry with backoff or batch replay.
    Transient,
    /// Diverted to the dead-letter sink.
    Data,
    /// Propagated to process termination.
    Fatal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Idempotent => "idempotent",
            Self::Transient => "transient",
            Self::Data => "data",
            Self::Fatal => "fatal",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

pub trait Classify: Display {
    fn class(&self) -> ErrorClass;

    fn into_interface(&self, correlation_id: impl Into<String>) -> InterfaceError
    where
        Self: Sized,
    {
        let message = self.to_string();
        let correlation_id = correlation_id.into();
        match self.class() {
            ErrorClass::Validation | ErrorClass::Data => {
                InterfaceError::BadRequest { message, correlation_id }
            }
            ErrorClass::Idempotent => InterfaceError::Conflict { message, correlation_id },
            ErrorClass::Transient => InterfaceError::ServiceUnavailable { message, correlation_id },
            ErrorClass::Fatal => InterfaceError::Internal { message, correlation_id },
        }
    }
}

impl Classify for StoreError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Unavailable(_) => ErrorClass::Transient,
            Self::UniqueViolation(_) => ErrorClass::Idempotent,
            Self::NotFound(_) | Self::Conflict(_) => ErrorClass::Validation,
            Self::Decode(_) => ErrorClass::Data,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("conflict: {message}")]
    Conflict { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::Conflict { .. } => "This request has already been processed.",
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest { .. } => 400,
            Self::Conflict { .. } => 409,
            Self::ServiceUnavailable { .. } => 503,
            Self::Internal { .. } => 500,
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::Conflict { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}
