//! Unified error types for Interceptor

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Interceptor operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Config errors
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("Config validation failed: {0}")]
    ConfigValidation(String),

    // Startup errors
    #[error("Insufficient privileges: firewall management requires root")]
    PrivilegeDenied,

    // Store errors
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Store busy: serialized access timed out")]
    StoreBusy,

    #[error("Store query failed: {0}")]
    Store(rusqlite::Error),

    #[error("Invalid timestamp '{0}' in store")]
    InvalidTimestamp(String),

    // Firewall errors
    #[error("Firewall unavailable: {0}")]
    FirewallUnavailable(String),

    // Module errors
    #[error("Invalid module '{path}': {reason}")]
    ModuleInvalid { path: PathBuf, reason: String },

    // Tailer errors
    #[error("Follower failed for {source_name}: {reason}")]
    TailerFailed { source_name: String, reason: String },
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::SqliteFailure(f, _)
                if f.code == rusqlite::ErrorCode::DatabaseBusy =>
            {
                Error::StoreBusy
            }
            other => Error::Store(other),
        }
    }
}

/// Result type alias for Interceptor operations
pub type Result<T> = std::result::Result<T, Error>;
