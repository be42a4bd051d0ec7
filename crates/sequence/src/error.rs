use std::path::PathBuf;

use thiserror::Error;

/// Result type for sequence operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when generating identifiers.
#[derive(Debug, Error)]
pub enum Error {
    /// The clock reads earlier than the configured epoch.
    #[error("clock is before the sequence epoch ({epoch_secs})")]
    ClockBeforeEpoch {
        /// Configured epoch in unix seconds.
        epoch_secs: u64,
    },

    /// The shared counter key holds something that is not a number.
    #[error("counter key {key} holds a non-numeric value")]
    CorruptCounter {
        /// The counter key.
        key: String,
    },

    /// The persisted header file could not be parsed.
    #[error("header file {path} is corrupt")]
    CorruptHeaderFile {
        /// Path of the header file.
        path: PathBuf,
    },

    /// The requested radix is outside `2..=36`.
    #[error("radix {0} is not supported")]
    InvalidRadix(u32),

    /// Reading or writing the persisted header failed.
    #[error("header file io error: {0}")]
    Io(#[from] std::io::Error),

    /// More identifiers were requested in one second than the generator can
    /// produce.
    #[error("sequence overflow at timestamp {timestamp}")]
    Overflow {
        /// Relative timestamp of the saturated second.
        timestamp: u64,
    },

    /// The external store failed.
    #[error("sequence store error: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The relative timestamp no longer fits its bit field.
    #[error("timestamp {0} exceeds the identifier layout")]
    TimestampOutOfRange(u64),
}

impl Error {
    pub(crate) fn store<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Store(Box::new(error))
    }
}
