use thiserror::Error;

#[derive(Debug, Error)]
pub enum CadenceError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid setting {key}: {reason}")]
    InvalidSetting { key: String, reason: String },
}

impl CadenceError {
    /// Stable error code for logs and machine-readable output.
    pub fn code(&self) -> &'static str {
        match self {
            CadenceError::Config(_) => "CONFIG_ERROR",
            CadenceError::InvalidSetting { .. } => "INVALID_SETTING",
        }
    }
}

pub type Result<T> = std::result::Result<T, CadenceError>;
