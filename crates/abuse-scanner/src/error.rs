//! Scanner error types.

use thiserror::Error;

use crate::db::lock_client::LockError;

/// Top-level error for the scanner pipeline.
#[derive(Error, Debug)]
pub enum ScannerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Db(#[from] sea_orm::DbErr),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Email error: {0}")]
    Email(#[from] crate::email::error::EmailError),

    #[error("NCMEC error: {0}")]
    Ncmec(#[from] crate::email::ncmec::NcmecError),

    #[error("Accounts error: {0}")]
    Accounts(#[from] crate::accounts::AccountsError),

    /// An operation failed and the deferred lock release failed on top of it.
    #[error("{0}; could not release lock: {1}")]
    WithUnlock(Box<ScannerError>, #[source] LockError),
}

/// Errors raised while loading the environment configuration. All of these
/// are fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing env var '{0}'")]
    MissingEnv(String),

    #[error("env var '{0}' must not be empty")]
    EmptyEnv(String),

    #[error("invalid bool value for env var '{0}'")]
    InvalidBool(String),
}

/// Composes the result of an operation that ran under a lock with the result
/// of releasing that lock. State written before a failed release is kept; the
/// next tick reconciles via the persisted flags.
pub fn compose_unlock(
    op: Result<()>,
    unlock: std::result::Result<(), LockError>,
) -> Result<()> {
    match (op, unlock) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(err), Ok(())) => Err(err),
        (Ok(()), Err(unlock_err)) => Err(unlock_err.into()),
        (Err(err), Err(unlock_err)) => Err(ScannerError::WithUnlock(Box::new(err), unlock_err)),
    }
}

/// Result type for scanner operations.
pub type Result<T> = std::result::Result<T, ScannerError>;
