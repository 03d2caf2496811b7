use mooring_core::config::ConfigError;
use mooring_core::ErrorCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] mooring_core::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Client id cannot be empty")]
    EmptyClientId,
    #[error("{0} must be at least 1 day")]
    ZeroDays(&'static str),
    #[error("Operation {operation_id} failed ({code}): {message}")]
    OperationFailed {
        operation_id: String,
        code: ErrorCode,
        message: String,
    },
}
