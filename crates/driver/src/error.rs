use thiserror::Error;

use crate::{BoxError, Hook};

/// Result type for driver operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or notifying drivers.
#[derive(Debug, Error)]
pub enum Error {
    /// A hook of a live driver failed; the rest of the broadcast was skipped.
    #[error("{hook} hook of driver {driver} failed: {source}")]
    Hook {
        /// Type name of the failing driver.
        driver: &'static str,
        /// The hook being broadcast.
        hook: Hook,
        /// The driver's error.
        source: BoxError,
    },

    /// A driver's own initialization failed.
    #[error("init of driver {driver} failed: {source}")]
    Init {
        /// Logical name of the driver.
        driver: String,
        /// The driver's error.
        source: BoxError,
    },

    /// The configuration has no entry for a selected driver.
    #[error("config of driver {0} does not exist")]
    MissingConfig(String),

    /// A driver's reload failed.
    #[error("reload of driver {driver} failed: {source}")]
    Reload {
        /// Logical name of the driver.
        driver: String,
        /// The driver's error.
        source: BoxError,
    },

    /// A name selector matched no registered driver.
    #[error("no driver registered under name {0}")]
    UnknownDriver(String),

    /// A type selector matched no registered driver.
    #[error("driver type {0} is not registered")]
    UnregisteredType(&'static str),
}
