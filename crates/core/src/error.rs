use std::path::PathBuf;

use thiserror::Error;

/// Result type for the instance orchestrator.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while loading, starting or stopping an instance.
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration file does not exist.
    #[error("conf file at path {0} cannot be found")]
    ConfNotFound(PathBuf),

    /// The configuration file is not a valid configuration.
    #[error("parse conf file at path {path} failed: {source}")]
    ConfParse {
        /// The file that failed to parse.
        path: PathBuf,
        /// The parser's error.
        source: serde_json::Error,
    },

    /// A driver failed to initialize, reload or handle a hook.
    #[error(transparent)]
    Driver(#[from] turtle_driver::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The configuration cannot be reloaded because it was not loaded from a
    /// file.
    #[error("cannot reload conf, no conf path was set")]
    NoConfPath,

    /// An API or Worker transition failed.
    #[error(transparent)]
    Process(#[from] turtle_process::Error),

    /// Another live process already runs this instance.
    #[error("process of name:{name} id:{id} is running (pid:{pid}), runtime file {path}")]
    ProcessCollision {
        /// Service name.
        name: String,
        /// Instance id.
        id: String,
        /// Pid of the live process.
        pid: u32,
        /// The runtime descriptor recording it.
        path: PathBuf,
    },

    /// Could not set global default subscriber.
    #[error("could not set global default subscriber: {0}")]
    SetTracing(#[from] tracing::dispatcher::SetGlobalDefaultError),
}
