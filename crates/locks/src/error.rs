use thiserror::Error;

/// Errors that can occur when acquiring or releasing distributed locks.
#[derive(Debug, Error)]
pub enum Error {
    /// Too many callers of this process are already waiting on the key.
    #[error("too many ({waiters}) waiters for lock key <{key}>")]
    ContentionExceeded {
        /// The contended key.
        key: String,
        /// Outstanding waiters when the call was rejected.
        waiters: usize,
    },

    /// A lock key (or the key list) was empty.
    #[error("lock key cannot be empty")]
    EmptyKey,

    /// The external store failed.
    #[error("lock store error: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    pub(crate) fn store<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Store(Box::new(error))
    }
}
