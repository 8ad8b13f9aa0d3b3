// File: rusty-cores/src/error.rs
// Purpose: Typed errors surfaced by the engine and the remote collaborator

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Every public operation resolves to success or one of these
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("Failed to load data: {0}")]
    DataLoadFailure(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Sync failed: {0}")]
    SyncFailure(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Unknown entity: {0}")]
    Navigation(String),
    #[error("Cache error: {0}")]
    Cache(String),
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Engine has been shut down")]
    ShutDown,
    #[error("{0}")]
    Unknown(String),
}

/// Flat classification of [`EngineError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DataLoadFailure,
    PersistenceError,
    SyncFailure,
    NetworkError,
    NavigationError,
    CacheError,
    ValidationError,
    ShutDown,
    Unknown,
}

/// Remediation a caller can trigger without knowing engine internals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    RefreshData,
    ClearCache,
    ForceSync,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::DataLoadFailure(_) => ErrorKind::DataLoadFailure,
            EngineError::Persistence(_) => ErrorKind::PersistenceError,
            EngineError::SyncFailure(_) => ErrorKind::SyncFailure,
            EngineError::Network(_) => ErrorKind::NetworkError,
            EngineError::Navigation(_) => ErrorKind::NavigationError,
            EngineError::Cache(_) => ErrorKind::CacheError,
            EngineError::Validation(_) => ErrorKind::ValidationError,
            EngineError::ShutDown => ErrorKind::ShutDown,
            EngineError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Bad input and bad references fail immediately and are not worth retrying
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            EngineError::Validation(_) | EngineError::Navigation(_) | EngineError::ShutDown
        )
    }

    pub fn recovery_actions(&self) -> Vec<RecoveryAction> {
        match self.kind() {
            ErrorKind::NetworkError | ErrorKind::SyncFailure => {
                vec![RecoveryAction::Retry, RecoveryAction::ForceSync]
            }
            ErrorKind::DataLoadFailure => {
                vec![RecoveryAction::RefreshData, RecoveryAction::Retry]
            }
            ErrorKind::CacheError => {
                vec![RecoveryAction::ClearCache, RecoveryAction::RefreshData]
            }
            ErrorKind::PersistenceError => vec![RecoveryAction::Retry],
            ErrorKind::Unknown => vec![RecoveryAction::RefreshData],
            ErrorKind::NavigationError | ErrorKind::ValidationError | ErrorKind::ShutDown => {
                Vec::new()
            }
        }
    }

    pub(crate) fn cache(err: anyhow::Error) -> Self {
        EngineError::Cache(format!("{:#}", err))
    }

    pub(crate) fn persistence(err: anyhow::Error) -> Self {
        EngineError::Persistence(format!("{:#}", err))
    }
}

impl From<RemoteError> for EngineError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Network(_) | RemoteError::Timeout(_) => {
                EngineError::Network(err.to_string())
            }
            RemoteError::Rejected(_) => EngineError::SyncFailure(err.to_string()),
        }
    }
}

/// Failure reported by the remote source of truth
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("remote unreachable: {0}")]
    Network(String),
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),
    #[error("remote rejected update: {0}")]
    Rejected(String),
}

impl RemoteError {
    /// Transient failures go down the retry path
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Network(_) | RemoteError::Timeout(_))
    }
}
