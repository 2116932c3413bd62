use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PortError>;

#[derive(Error, Debug)]
pub enum PortError {
    #[error("Invalid port range '{0}': expected START-END with START <= END (e.g. 20000-20999)")]
    InvalidRange(String),

    #[error("No free port left on host '{host}' in range {range}")]
    PoolExhausted { host: String, range: String },

    #[error("Port {port} on host '{host}' is already held by '{holder}'")]
    Conflict {
        host: String,
        port: u16,
        holder: String,
    },

    #[error("Port {port} is outside the configured range {range}")]
    OutOfRange { port: u16, range: String },

    #[error("Could not lock port registry {path:?}: {reason}")]
    Lock { path: PathBuf, reason: String },

    #[error("Port registry {path:?} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to write port registry: {0}")]
    Write(#[from] ws_core::CoreError),
}
