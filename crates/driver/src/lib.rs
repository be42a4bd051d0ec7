//! Named singleton adapters to external systems.
//!
//! Drivers are registered explicitly at bootstrap, created lazily (one
//! instance per type), initialized from their own block of configuration and
//! notified around the API and Worker lifecycle transitions.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod factory;
mod registry;

pub use error::{Error, Result};
pub use factory::{DriverEvent, DriverFactory, DriverObserver, Drivers};
pub use registry::{DriverDescriptor, DriverRegistry, DriverSelector};

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

/// Error type drivers report through.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The live service handle a driver produces on init.
pub type DriverHandle = Arc<dyn Any + Send + Sync>;

/// Trait for drivers.
///
/// Only `init` is required; the hooks and `reload` default to doing nothing.
#[async_trait]
pub trait Driver
where
    Self: Send + Sync + 'static,
{
    /// Initializes the driver from its configuration block and returns the
    /// handle services use.
    async fn init(&self, config: &Value) -> std::result::Result<DriverHandle, BoxError>;

    /// Applies a new configuration block to an initialized driver.
    async fn reload(&self, _config: &Value) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    /// Called after the API started.
    async fn on_api_start(&self) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    /// Called after the API closed.
    async fn on_api_close(&self) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    /// Called after the workers started.
    async fn on_worker_start(&self) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    /// Called after the workers closed.
    async fn on_worker_close(&self) -> std::result::Result<(), BoxError> {
        Ok(())
    }
}

/// Lifecycle hook broadcast to every live driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Hook {
    /// `on_api_start`
    ApiStart,
    /// `on_api_close`
    ApiClose,
    /// `on_worker_start`
    WorkerStart,
    /// `on_worker_close`
    WorkerClose,
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ApiStart => "on_api_start",
            Self::ApiClose => "on_api_close",
            Self::WorkerStart => "on_worker_start",
            Self::WorkerClose => "on_worker_close",
        })
    }
}
