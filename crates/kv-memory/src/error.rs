use thiserror::Error;
use turtle_kv::KvStoreError;

/// Errors that can occur in this crate.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The store was switched into unavailable mode.
    #[error("memory store unavailable")]
    Unavailable,
}

impl KvStoreError for Error {}
