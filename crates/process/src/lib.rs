//! API and Worker roles of a service instance.
//!
//! Both roles share one lifecycle (`RunningState`). Workers own recurring
//! tasks and drain their in-flight work on shutdown; the API binds a port from
//! an allow-list before handing it to its listener.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod api;
mod error;
mod health;
mod state;
mod task;
mod worker;

pub use api::{Api, ApiListener};
pub use error::{Error, Result};
pub use health::{DEFAULT_HEALTH_PATH, HealthListener, HealthCheck};
pub use state::RunningState;
pub use task::{TaskContext, TaskHandle, WorkGuard};
pub use worker::{Worker, WorkerHandler};

use std::time::Duration;

/// Error type role implementations report through.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result of a `start` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    /// Now Running.
    Started,
    /// The handler declined; now Closed.
    Declined,
    /// The handler raised; back to Prepared.
    Errored,
    /// Already starting, running or closing.
    Ignored,
}

/// Result of a worker `shutdown`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Drained and Closed.
    Closed,
    /// The drain bound expired; back to Running.
    DrainTimedOut,
    /// Nothing to shut down.
    Ignored,
}

/// Result of an API `close`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Now Closed.
    Closed,
    /// The listener failed to close; back to Running.
    Failed,
    /// Nothing to close.
    Ignored,
}

/// How long a worker shutdown waits for in-flight work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainTimeout {
    /// Wait until nothing is in flight.
    Unbounded,
    /// Do not wait.
    Immediate,
    /// Wait at most this long.
    Bounded(Duration),
}

impl DrainTimeout {
    /// Negative waits indefinitely, zero returns immediately, positive bounds
    /// the wait in milliseconds.
    #[must_use]
    pub const fn from_millis(millis: i64) -> Self {
        match millis {
            i64::MIN..=-1 => Self::Unbounded,
            0 => Self::Immediate,
            millis => Self::Bounded(Duration::from_millis(millis.unsigned_abs())),
        }
    }
}

impl Default for DrainTimeout {
    fn default() -> Self {
        Self::Bounded(Duration::from_secs(30))
    }
}
