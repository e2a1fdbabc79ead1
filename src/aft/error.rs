//! AFT Error Types
//!
//! Internal faults only. What the host sees is always a [`TransferStatus`]
//! on the transfer record; these errors end up in the log.
//!
//! [`TransferStatus`]: super::types::TransferStatus

use thiserror::Error;

use crate::config::ConfigError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum AftError {
    #[error("Persistence failure: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transfer record decode failed: {0}")]
    RecordDecode(String),

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("No tokio runtime to run AFT timers on")]
    RuntimeUnavailable,
}

impl AftError {
    /// Stable code for logs and dashboards
    pub fn code(&self) -> &'static str {
        match self {
            AftError::Store(_) => "STORE_ERROR",
            AftError::Config(_) => "CONFIG_ERROR",
            AftError::RecordDecode(_) => "RECORD_DECODE",
            AftError::InvalidStateTransition(_) => "INVALID_STATE_TRANSITION",
            AftError::RuntimeUnavailable => "RUNTIME_UNAVAILABLE",
        }
    }
}
