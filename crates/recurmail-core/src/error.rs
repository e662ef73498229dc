use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecurmailError {
    #[error("Configuration error: {0}")]
    Config(String),
}

impl RecurmailError {
    /// Short error code string returned to HTTP clients.
    pub fn code(&self) -> &'static str {
        match self {
            RecurmailError::Config(_) => "CONFIG_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, RecurmailError>;
