use amt_core::{StoreError, TunnelError};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub enum ErrorCode {
    Io,
    Parse,
    Json,
    InvalidInput,
    Channel,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Io => "IO_ERROR",
            ErrorCode::Parse => "PARSE_ERROR",
            ErrorCode::Json => "JSON_ERROR",
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::Channel => "CHANNEL_ERROR",
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.as_str().to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(code: ErrorCode, message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            code: code.as_str().to_string(),
            message: message.into(),
            details: Some(details.into()),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl From<ConfigError> for ApiError {
    fn from(err: ConfigError) -> Self {
        let code = match err {
            ConfigError::Io(_) => ErrorCode::Io,
            ConfigError::Parse(_) => ErrorCode::Parse,
        };
        let message = err.to_string();
        ApiError::with_details(code, message.clone(), message)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let code = match err {
            StoreError::Io(_) => ErrorCode::Io,
            StoreError::Json(_) => ErrorCode::Json,
        };
        let message = err.to_string();
        ApiError::with_details(code, message.clone(), message)
    }
}

impl From<TunnelError> for ApiError {
    fn from(err: TunnelError) -> Self {
        let code = match err {
            TunnelError::Io(_) => ErrorCode::Io,
            TunnelError::Json(_) => ErrorCode::Json,
            TunnelError::Base64(_) => ErrorCode::Parse,
            TunnelError::Channel(_) | TunnelError::Peer(_) => ErrorCode::Channel,
        };
        let message = err.to_string();
        ApiError::with_details(code, message.clone(), message)
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::new(ErrorCode::Json, err.to_string())
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        ApiError::new(ErrorCode::Io, err.to_string())
    }
}
