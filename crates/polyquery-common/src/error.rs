use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::EngineKind;

pub type DbResult<T> = Result<T, DbError>;

/// Engine failure normalized at the adapter boundary.
///
/// Native error types (rusqlite, rocksdb, ...) are converted into this shape
/// before they reach callers, keeping the engine's own code when it has one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineError {
    pub engine: EngineKind,
    pub message: String,
    pub code: Option<String>,
    pub operation: String,
    pub timestamp: DateTime<Utc>,
}

impl EngineError {
    pub fn new(engine: EngineKind, operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            engine,
            message: message.into(),
            code: None,
            operation: operation.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} error during {}: {}", self.engine, self.operation, self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for EngineError {}

#[derive(Debug, Error)]
pub enum DbError {
    /// Malformed or unsupported descriptor state.
    #[error("validation error: {message}")]
    Validation {
        message: String,
        operation: Option<String>,
        target: Option<String>,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Begin/commit/rollback machinery failed.
    #[error("transaction error: {message}")]
    Transaction { message: String },

    #[error("{operation} is not implemented for {engine}")]
    NotImplemented { operation: String, engine: EngineKind },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl DbError {
    pub fn validation(message: impl Into<String>) -> Self {
        DbError::Validation {
            message: message.into(),
            operation: None,
            target: None,
        }
    }

    pub fn validation_for(
        message: impl Into<String>,
        operation: impl Into<String>,
        target: Option<&str>,
    ) -> Self {
        DbError::Validation {
            message: message.into(),
            operation: Some(operation.into()),
            target: target.map(str::to_string),
        }
    }

    pub fn not_implemented(operation: impl Into<String>, engine: EngineKind) -> Self {
        DbError::NotImplemented {
            operation: operation.into(),
            engine,
        }
    }

    /// True for errors a caller caused (4xx-style) rather than the engine (5xx-style).
    pub fn is_client_error(&self) -> bool {
        matches!(self, DbError::Validation { .. } | DbError::NotImplemented { .. })
    }
}

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        DbError::Serialization(e.to_string())
    }
}
