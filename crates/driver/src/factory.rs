use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::registry::{Constructed, DriverDescriptor, DriverRegistry, DriverSelector};
use crate::{Driver, DriverHandle, Hook};

/// Emitted once per driver after it initialized.
#[derive(Clone, Debug)]
pub struct DriverEvent {
    /// Logical name of the driver.
    pub name: String,

    /// The handle it produced.
    pub handle: DriverHandle,
}

/// Receives a `DriverEvent` for every driver initialized by `init_all`.
pub trait DriverObserver: Send + Sync {
    /// Called after `event.name` initialized.
    fn driver_ready(&self, event: DriverEvent);
}

impl DriverObserver for mpsc::UnboundedSender<DriverEvent> {
    fn driver_ready(&self, event: DriverEvent) {
        // Nobody listening is not an error.
        let _ = self.send(event);
    }
}

/// Handles produced by `init_all`, keyed by logical name.
#[derive(Clone, Debug, Default)]
pub struct Drivers {
    handles: HashMap<String, DriverHandle>,
}

impl Drivers {
    /// The untyped handle of `name`.
    #[must_use]
    pub fn handle(&self, name: &str) -> Option<&DriverHandle> {
        self.handles.get(name)
    }

    /// The handle of `name`, if it is a `T`.
    #[must_use]
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.handles
            .get(name)
            .and_then(|handle| handle.clone().downcast::<T>().ok())
    }

    /// Whether a handle for `name` exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handles.contains_key(name)
    }

    /// Logical names of all handles.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handles.keys().map(String::as_str)
    }

    /// Adds every handle of `other`, replacing handles with the same name.
    pub fn merge(&mut self, other: Self) {
        self.handles.extend(other.handles);
    }

    /// Number of handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether there are no handles.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

struct Instance {
    type_id: TypeId,
    type_name: &'static str,
    constructed: Constructed,
}

#[derive(Default)]
struct State {
    // Creation order; hooks run in this order.
    instances: Vec<Instance>,
    initialized: Vec<(TypeId, String)>,
}

/// Creates, initializes, reloads and notifies drivers.
///
/// Holds exactly one instance per implementation type for its whole lifetime.
pub struct DriverFactory {
    registry: DriverRegistry,
    state: Mutex<State>,
}

impl DriverFactory {
    /// Creates a factory over a filled registry.
    #[must_use]
    pub fn new(registry: DriverRegistry) -> Self {
        Self {
            registry,
            state: Mutex::new(State::default()),
        }
    }

    /// The registry this factory builds from.
    #[must_use]
    pub const fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    fn instance_for(&self, descriptor: &DriverDescriptor) -> Arc<dyn Driver> {
        let mut state = self.state.lock();
        let type_id = descriptor.type_id();

        if let Some(instance) = state.instances.iter().find(|i| i.type_id == type_id) {
            return instance.constructed.driver.clone();
        }

        debug!(driver = descriptor.type_name(), "creating driver instance");
        let constructed = descriptor.construct();
        let driver = constructed.driver.clone();
        state.instances.push(Instance {
            type_id,
            type_name: descriptor.type_name(),
            constructed,
        });

        driver
    }

    /// The live instance of `T`, if one was created.
    #[must_use]
    pub fn instance<T: Driver>(&self) -> Option<Arc<T>> {
        let any = self
            .state
            .lock()
            .instances
            .iter()
            .find(|instance| instance.type_id == TypeId::of::<T>())
            .map(|instance| instance.constructed.any.clone())?;

        any.downcast::<T>().ok()
    }

    /// Initializes the selected drivers in registration order, each from the
    /// configuration block under its logical name.
    ///
    /// # Errors
    ///
    /// Fails on an unmatched selector, on the first driver without a
    /// configuration block and on the first driver whose init fails.
    pub async fn init_all(
        &self,
        config: &Map<String, Value>,
        selectors: &[DriverSelector],
        observer: Option<&dyn DriverObserver>,
    ) -> Result<Drivers> {
        let mut drivers = Drivers::default();

        for descriptor in self.registry.resolve(selectors)? {
            let name = descriptor.name();
            let block = config_block(config, name)?;

            let driver = self.instance_for(descriptor);
            let handle = driver.init(block).await.map_err(|source| Error::Init {
                driver: name.to_string(),
                source,
            })?;
            info!(driver = name, "driver initialized");

            {
                let mut state = self.state.lock();
                let key = (descriptor.type_id(), name.to_string());
                if !state.initialized.contains(&key) {
                    state.initialized.push(key);
                }
            }

            if let Some(observer) = observer {
                observer.driver_ready(DriverEvent {
                    name: name.to_string(),
                    handle: handle.clone(),
                });
            }
            drivers.handles.insert(name.to_string(), handle);
        }

        Ok(drivers)
    }

    /// Applies a new configuration to every initialized driver.
    ///
    /// All blocks are checked before any driver reloads, so a missing block
    /// leaves every driver on its old configuration.
    ///
    /// # Errors
    ///
    /// Fails on the first missing block or the first failing reload.
    pub async fn reload_all(&self, config: &Map<String, Value>) -> Result<()> {
        let targets: Vec<(Arc<dyn Driver>, String)> = {
            let state = self.state.lock();
            state
                .initialized
                .iter()
                .filter_map(|(type_id, name)| {
                    state
                        .instances
                        .iter()
                        .find(|instance| instance.type_id == *type_id)
                        .map(|instance| (instance.constructed.driver.clone(), name.clone()))
                })
                .collect()
        };

        let mut blocks = Vec::with_capacity(targets.len());
        for (driver, name) in targets {
            blocks.push((driver, config_block(config, &name)?, name));
        }

        for (driver, block, name) in blocks {
            driver
                .reload(block)
                .await
                .map_err(|source| Error::Reload {
                    driver: name.clone(),
                    source,
                })?;
            debug!(driver = %name, "driver reloaded");
        }

        Ok(())
    }

    async fn broadcast(&self, hook: Hook) -> Result<()> {
        let instances: Vec<(Arc<dyn Driver>, &'static str)> = self
            .state
            .lock()
            .instances
            .iter()
            .map(|instance| (instance.constructed.driver.clone(), instance.type_name))
            .collect();

        for (driver, type_name) in instances {
            let result = match hook {
                Hook::ApiStart => driver.on_api_start().await,
                Hook::ApiClose => driver.on_api_close().await,
                Hook::WorkerStart => driver.on_worker_start().await,
                Hook::WorkerClose => driver.on_worker_close().await,
            };

            result.map_err(|source| Error::Hook {
                driver: type_name,
                hook,
                source,
            })?;
        }

        debug!(%hook, "hook broadcast to drivers");
        Ok(())
    }

    /// Calls `on_api_start` on every live driver in creation order.
    ///
    /// # Errors
    ///
    /// Stops at and returns the first failing hook.
    pub async fn trigger_api_start(&self) -> Result<()> {
        self.broadcast(Hook::ApiStart).await
    }

    /// Calls `on_api_close` on every live driver in creation order.
    ///
    /// # Errors
    ///
    /// Stops at and returns the first failing hook.
    pub async fn trigger_api_close(&self) -> Result<()> {
        self.broadcast(Hook::ApiClose).await
    }

    /// Calls `on_worker_start` on every live driver in creation order.
    ///
    /// # Errors
    ///
    /// Stops at and returns the first failing hook.
    pub async fn trigger_worker_start(&self) -> Result<()> {
        self.broadcast(Hook::WorkerStart).await
    }

    /// Calls `on_worker_close` on every live driver in creation order.
    ///
    /// # Errors
    ///
    /// Stops at and returns the first failing hook.
    pub async fn trigger_worker_close(&self) -> Result<()> {
        self.broadcast(Hook::WorkerClose).await
    }
}

fn config_block<'a>(config: &'a Map<String, Value>, name: &str) -> Result<&'a Value> {
    match config.get(name) {
        Some(Value::Null) | None => Err(Error::MissingConfig(name.to_string())),
        Some(block) => Ok(block),
    }
}
