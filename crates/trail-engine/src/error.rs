use std::time::Duration;

use trail_store::StoreError;

use crate::settings::SettingsError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),

    /// The store did not answer the startup probe.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("store probe timed out after {0:?}")]
    ProbeTimeout(Duration),

    /// The live object source failed to enumerate.
    #[error("live object source failed: {0}")]
    Source(String),

    #[error("working state error: {0}")]
    WorkingState(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Store(StoreError::NotFound(_)))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
