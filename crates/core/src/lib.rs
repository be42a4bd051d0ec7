//! Runs one instance of a turtle service: configuration, drivers, the API
//! and Worker roles, signals and the runtime descriptor read by the `turtle`
//! tool.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod conf;
mod error;
mod runtime;
mod turtle;

pub use conf::{Conf, InstanceId, LogLevel, PortSpec, Setting};
pub use error::{Error, Result};
pub use runtime::{RuntimeDescriptor, SCHEMA_VERSION, advertised_host, discover, find, process_alive};
pub use turtle::{Turtle, WorkerReport};

use tracing_subscriber::FmtSubscriber;

/// Installs the global log subscriber at `level`.
///
/// # Errors
///
/// Fails if a global subscriber is already set.
pub fn init_logging(level: LogLevel) -> Result<()> {
    tracing::subscriber::set_global_default(
        FmtSubscriber::builder()
            .with_max_level(tracing::Level::from(level))
            .finish(),
    )?;

    Ok(())
}
