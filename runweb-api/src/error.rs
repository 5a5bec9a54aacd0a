use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Permanent client error. The caller should skip the resource.
    #[error("Not found ({status}): {uri}")]
    NotFound { status: u16, uri: String },

    #[error("Gave up on {uri} after {attempts} attempts")]
    RetriesExhausted { uri: String, attempts: u32 },

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Cache error: {0}")]
    CacheError(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound { .. })
    }

    /// Errors caused by the local machine (cache database, filesystem)
    /// rather than by the upstream API.
    pub fn is_local(&self) -> bool {
        matches!(self, ApiError::CacheError(_) | ApiError::IoError(_))
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;
