//! Error type for the backup scheduler and the engine capability traits.

use thiserror::Error;

use crate::types::DbPath;

/// Errors raised by engine collaborators or by scheduler setup.
///
/// None of these reach the engine's writers: backup failures are retried and
/// hook failures degrade to "no automatic backup for this handle".
#[derive(Debug, Error)]
pub enum BackupError {
    /// The handle could not open the probe transaction.
    #[error("database is busy: {path}")]
    Busy { path: DbPath },

    /// Transaction begin/rollback failed for a reason other than contention.
    #[error("transaction failed on {path}: {detail}")]
    TransactionFailed { path: DbPath, detail: String },

    /// The handle does not support the named WAL notification.
    #[error("{hook} notification unsupported on {path}")]
    HookUnsupported { hook: &'static str, path: DbPath },

    /// The engine's backup operation reported failure.
    #[error("backup of {path} failed: {detail}")]
    BackupFailed { path: DbPath, detail: String },

    /// Configuration rejected by [`crate::AutoBackupConfig::validate`].
    #[error("invalid auto-backup config: {0}")]
    InvalidConfig(String),

    /// Configuration could not be parsed.
    #[error("auto-backup config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// The owning service has already been torn down.
    #[error("auto-backup service is shut down")]
    ShutDown,

    /// The dispatch thread could not be spawned.
    #[error("failed to spawn backup thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl BackupError {
    /// Convenience constructor for [`BackupError::BackupFailed`].
    pub fn backup_failed(path: &DbPath, detail: impl Into<String>) -> Self {
        Self::BackupFailed {
            path: path.clone(),
            detail: detail.into(),
        }
    }

    /// Convenience constructor for [`BackupError::InvalidConfig`].
    pub fn invalid_config(detail: impl Into<String>) -> Self {
        Self::InvalidConfig(detail.into())
    }
}

pub type Result<T, E = BackupError> = std::result::Result<T, E>;
