use thiserror::Error;

/// Result type for process roles.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the API or Worker roles.
#[derive(Debug, Error)]
pub enum Error {
    /// Binding the API listener failed.
    #[error(transparent)]
    Bind(#[from] std::io::Error),

    /// A scheduled task was given an unparsable cron expression.
    #[error("invalid cron expression {expression:?}: {reason}")]
    InvalidCron {
        /// The rejected expression.
        expression: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The role was asked to transition before it was prepared.
    #[error("{role} {name} hasn't prepared")]
    NotPrepared {
        /// `api` or `worker`.
        role: &'static str,
        /// Name of the instance.
        name: String,
    },

    /// Every port in the allow-list is already bound.
    #[error("all ports are occupied: {0:?}")]
    PortsOccupied(Vec<u16>),
}
