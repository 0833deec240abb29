//! Unified error handling for the tunnel warden.

use std::io;
use thiserror::Error;

/// Errors produced at the supervisor's fallible edges. Most runtime
/// failures never surface through this type: spawn and firewall problems
/// degrade to log records so one broken instance cannot take the
/// supervisor down with it.
#[derive(Debug, Error)]
pub enum WardenError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to read config {path}: {message}")]
    Config { path: String, message: String },

    #[error("tunnel binary '{0}' not found in PATH")]
    BinaryNotFound(String),

    #[error("failed to spawn '{alias}': {source}")]
    Spawn {
        alias: String,
        #[source]
        source: io::Error,
    },
}
