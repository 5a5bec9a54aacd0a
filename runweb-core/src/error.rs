use runweb_api::ApiError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    ConfigError(#[from] toml::de::Error),

    #[error("Invalid date: {0}")]
    InvalidDate(String),

    #[error("{0}")]
    Other(String),
}

impl CoreError {
    /// Failures reported by the upstream API, as opposed to the local
    /// filesystem or cache. Collectors treat these as partial data.
    pub fn is_remote(&self) -> bool {
        match self {
            CoreError::Api(e) => !e.is_local(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
