use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Problems reading the configuration file. Always recoverable: the store
/// answers with defaults and hands one of these back as a notice.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {0:?} not found")]
    Missing(PathBuf),

    #[error("config file {path:?} could not be read: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config file {path:?} is not valid JSON: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("config file {path:?} is not a JSON object")]
    NotAnObject { path: PathBuf },

    #[error("invalid values replaced by defaults: {}", .0.join(", "))]
    InvalidFields(Vec<String>),
}

/// Writing the configuration back failed. Shown to the operator, who can
/// simply press save again.
#[derive(Debug, Error)]
pub enum SaveError {
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to replace {path:?}: {source}")]
    Replace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failures talking to the external decoding engine. The watchdog treats all
/// of these as a degraded stream.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("engine IPC socket {0:?} never became available")]
    IpcUnavailable(PathBuf),

    #[error("engine IPC i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("engine did not answer within {0:?}")]
    Timeout(Duration),

    #[error("engine rejected {command}: {reason}")]
    Rejected { command: String, reason: String },

    #[error("engine process is not running")]
    NotRunning,

    #[error("engine setup failed: {0}")]
    Setup(String),
}

/// A reachability probe that could not even be attempted.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("could not resolve {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("{host}:{port} resolved to no addresses")]
    NoAddress { host: String, port: u16 },

    #[error("invalid RTSP port {0:?}")]
    InvalidPort(String),

    #[error("failed to run ping: {0}")]
    Ping(#[source] std::io::Error),
}
