use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Engine binding not ready")]
    NotReady,
    #[error("Engine driver error: {0}")]
    Driver(String),
    #[error("Unexpected transport status {0}")]
    Status(u16),
    #[error("Engine returned {code}: {message}")]
    ReturnValue { code: u32, message: String },
    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Parse(err.to_string())
    }
}

impl From<base64::DecodeError> for EngineError {
    fn from(err: base64::DecodeError) -> Self {
        EngineError::Parse(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Data channel error: {0}")]
    Channel(String),
    #[error("Peer connection error: {0}")]
    Peer(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
