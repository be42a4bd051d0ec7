use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{error, info, warn};
use turtle_driver::{DriverFactory, DriverObserver, DriverRegistry, DriverSelector, Drivers};
use turtle_process::{
    Api, CloseOutcome, RunningState, ShutdownOutcome, StartOutcome, Worker,
};

use crate::conf::Conf;
use crate::error::{Error, Result};
use crate::runtime::{RuntimeDescriptor, advertised_host};

/// Names of workers grouped by how their start went.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkerReport {
    /// Now running.
    pub started: Vec<String>,
    /// Their handler declined.
    pub declined: Vec<String>,
    /// Their handler raised.
    pub errored: Vec<String>,
}

/// One service instance: its configuration, drivers, API, workers and
/// runtime descriptor.
pub struct Turtle {
    conf: RwLock<Conf>,
    conf_path: Option<PathBuf>,
    runtime_dir: PathBuf,
    factory: DriverFactory,
    drivers: RwLock<Drivers>,
    api: Mutex<Option<Arc<Api>>>,
    workers: Mutex<Vec<Worker>>,
    runtime: Mutex<RuntimeDescriptor>,
}

impl Turtle {
    /// Creates an instance from an in-memory configuration. The runtime
    /// descriptor lives in the working directory.
    ///
    /// # Errors
    ///
    /// Fails if the working directory cannot be read.
    pub fn new(conf: Conf, registry: DriverRegistry) -> Result<Self> {
        let runtime = RuntimeDescriptor::for_current_process(&conf)?;

        Ok(Self {
            runtime_dir: runtime.cwd.clone(),
            runtime: Mutex::new(runtime),
            conf: RwLock::new(conf),
            conf_path: None,
            factory: DriverFactory::new(registry),
            drivers: RwLock::new(Drivers::default()),
            api: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Creates an instance from a configuration file, remembered for
    /// `reload_conf`.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be loaded.
    pub fn from_path(path: impl AsRef<Path>, registry: DriverRegistry) -> Result<Self> {
        let (conf, path) = Conf::load(path)?;
        let mut turtle = Self::new(conf, registry)?;
        turtle.conf_path = Some(path);

        Ok(turtle)
    }

    /// Keeps the runtime descriptor in `dir` instead of the working
    /// directory.
    #[must_use]
    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = dir.into();
        self
    }

    /// A snapshot of the current configuration.
    #[must_use]
    pub fn conf(&self) -> Conf {
        self.conf.read().clone()
    }

    /// `<name>:<id>` of this instance.
    #[must_use]
    pub fn service_id(&self) -> String {
        self.conf.read().service_id()
    }

    /// The driver factory.
    #[must_use]
    pub const fn factory(&self) -> &DriverFactory {
        &self.factory
    }

    /// Every driver handle initialized so far.
    #[must_use]
    pub fn drivers(&self) -> Drivers {
        self.drivers.read().clone()
    }

    /// The handle of driver `name`, if it is a `T`.
    #[must_use]
    pub fn driver<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.drivers.read().get::<T>(name)
    }

    /// A snapshot of the runtime descriptor.
    #[must_use]
    pub fn runtime(&self) -> RuntimeDescriptor {
        self.runtime.lock().clone()
    }

    /// The static part of a health report: the runtime descriptor and the
    /// configuration, as `HealthListener::with_info` takes it.
    ///
    /// # Errors
    ///
    /// Fails if either cannot be serialized.
    pub fn health_info(&self) -> Result<serde_json::Value> {
        let mut info = serde_json::Map::new();
        info.insert("runtime".to_string(), serde_json::to_value(self.runtime())?);
        info.insert("conf".to_string(), serde_json::to_value(self.conf())?);

        Ok(serde_json::Value::Object(info))
    }

    /// Path of the runtime descriptor file.
    #[must_use]
    pub fn runtime_path(&self) -> PathBuf {
        self.runtime.lock().path_in(&self.runtime_dir)
    }

    /// The registered API.
    #[must_use]
    pub fn api(&self) -> Option<Arc<Api>> {
        self.api.lock().clone()
    }

    /// The registered workers.
    #[must_use]
    pub fn workers(&self) -> Vec<Worker> {
        self.workers.lock().clone()
    }

    /// Initializes the selected drivers from the `drivers` section and merges
    /// their handles into the live driver map.
    ///
    /// # Errors
    ///
    /// Fails on the first missing configuration block or failed init.
    pub async fn init_drivers(
        &self,
        selectors: &[DriverSelector],
        observer: Option<&dyn DriverObserver>,
    ) -> Result<()> {
        let config = self.conf.read().drivers.clone();

        let drivers = match self.factory.init_all(&config, selectors, observer).await {
            Ok(drivers) => drivers,
            Err(e) => {
                error!(error = %e, "initial drivers failed");
                return Err(e.into());
            }
        };
        info!(drivers = drivers.len(), "drivers initialized");
        self.drivers.write().merge(drivers);

        Ok(())
    }

    /// Fails if another live process already runs this instance from the
    /// same directory.
    ///
    /// # Errors
    ///
    /// `Error::ProcessCollision` when the recorded process is alive.
    pub fn check_collision(&self) -> Result<()> {
        let path = self.runtime_path();
        if !path.exists() {
            return Ok(());
        }

        let recorded = match RuntimeDescriptor::load(&path) {
            Ok(recorded) => recorded,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable runtime file");
                return Ok(());
            }
        };

        if recorded.pid != std::process::id() && recorded.is_alive() {
            error!(pid = recorded.pid, path = %path.display(), "process collision detected");
            return Err(Error::ProcessCollision {
                name: recorded.name,
                id: recorded.id,
                pid: recorded.pid,
                path,
            });
        }

        Ok(())
    }

    fn save_runtime(&self) -> Result<()> {
        self.runtime.lock().save(&self.runtime_dir)?;
        Ok(())
    }

    /// Starts the API, then the workers.
    ///
    /// # Errors
    ///
    /// Fails on a process collision, an unprepared role, a bind failure or a
    /// failing driver hook.
    pub async fn start_all(&self, api: Arc<Api>, workers: Vec<Worker>) -> Result<WorkerReport> {
        self.check_collision()?;
        self.save_runtime()?;
        info!(service = %self.service_id(), pid = std::process::id(), "process initialized");

        self.start_api(api).await?;
        self.start_workers(workers).await
    }

    /// Starts `api` on a port from the configured allow-list, records the
    /// bound address and notifies drivers.
    ///
    /// Another API already registered wins; `api` is then left alone.
    ///
    /// # Errors
    ///
    /// Fails on an unprepared API, a bind failure or a failing driver hook.
    pub async fn start_api(&self, api: Arc<Api>) -> Result<()> {
        {
            let mut registered = self.api.lock();
            match registered.as_ref() {
                Some(current) if !Arc::ptr_eq(current, &api) => {
                    warn!(api = %api.name(), "another api is registered, nothing will happen");
                    return Ok(());
                }
                Some(_) => {}
                None => *registered = Some(api.clone()),
            }
        }

        let ports = self.conf.read().ports();
        match api.start(&ports).await? {
            StartOutcome::Started => info!(api = %api.name(), "api service started"),
            StartOutcome::Declined => error!(api = %api.name(), "api service cannot be started"),
            StartOutcome::Errored => error!(api = %api.name(), "api service start errored"),
            StartOutcome::Ignored => {
                warn!(api = %api.name(), state = %api.state(), "api service not started");
            }
        }

        if api.state() != RunningState::Running {
            return Ok(());
        }

        if let Some(addr) = api.local_addr() {
            {
                let mut runtime = self.runtime.lock();
                runtime.port = Some(addr.port());
                runtime.host = Some(advertised_host(addr.ip()));
                runtime.pid = std::process::id();
            }
            self.save_runtime()?;
            info!(%addr, "api serving");
        }

        self.factory.trigger_api_start().await?;
        Ok(())
    }

    /// Registers `workers` (skipping names already registered), starts every
    /// registered worker and notifies drivers.
    ///
    /// # Errors
    ///
    /// Fails on an unprepared worker or a failing driver hook.
    pub async fn start_workers(&self, workers: Vec<Worker>) -> Result<WorkerReport> {
        let all = {
            let mut registered = self.workers.lock();
            for worker in workers {
                if registered.iter().any(|w| w.name() == worker.name()) {
                    warn!(worker = %worker.name(), "worker is already registered");
                } else {
                    registered.push(worker);
                }
            }
            registered.clone()
        };

        if all.is_empty() {
            info!("there are no workers to start");
            return Ok(WorkerReport::default());
        }

        let mut report = WorkerReport::default();
        for worker in &all {
            match worker.start().await? {
                StartOutcome::Started => report.started.push(worker.name().to_string()),
                StartOutcome::Declined => report.declined.push(worker.name().to_string()),
                StartOutcome::Errored => report.errored.push(worker.name().to_string()),
                StartOutcome::Ignored => {}
            }
        }

        info!(
            started = ?report.started,
            declined = ?report.declined,
            errored = ?report.errored,
            "workers started"
        );
        self.factory.trigger_worker_start().await?;

        Ok(report)
    }

    /// Shuts every worker down with the configured drain bound and notifies
    /// drivers. Returns the names of the workers that closed.
    ///
    /// # Errors
    ///
    /// Fails on an unprepared worker or a failing driver hook.
    pub async fn close_workers(&self) -> Result<Vec<String>> {
        let workers = self.workers();
        if workers.is_empty() {
            info!("there are no workers to close");
            return Ok(Vec::new());
        }

        let drain = self.conf.read().setting.drain_timeout();
        let mut closed = Vec::new();
        for worker in &workers {
            match worker.shutdown(drain).await? {
                ShutdownOutcome::Closed => closed.push(worker.name().to_string()),
                ShutdownOutcome::DrainTimedOut => {
                    error!(worker = %worker.name(), "close worker failed");
                }
                ShutdownOutcome::Ignored => {}
            }
        }

        info!(closed = ?closed, "workers closed");
        self.factory.trigger_worker_close().await?;

        Ok(closed)
    }

    /// Closes the API and notifies drivers.
    ///
    /// # Errors
    ///
    /// Fails on an unprepared API or a failing driver hook.
    pub async fn close_api(&self) -> Result<()> {
        let Some(api) = self.api() else {
            info!("there is no api to close");
            return Ok(());
        };

        match api.close().await? {
            CloseOutcome::Closed => info!(api = %api.name(), "api service closed"),
            CloseOutcome::Failed => error!(api = %api.name(), "close api service failed"),
            CloseOutcome::Ignored => {}
        }

        self.factory.trigger_api_close().await?;
        Ok(())
    }

    /// Closes the workers, then the API.
    ///
    /// # Errors
    ///
    /// Returns the first failure of either step.
    pub async fn close_all(&self) -> Result<()> {
        self.close_workers().await?;
        self.close_api().await
    }

    /// Re-reads the configuration file.
    ///
    /// # Errors
    ///
    /// Fails if no file was given or it cannot be loaded.
    pub fn reload_conf(&self) -> Result<()> {
        let path = self.conf_path.as_ref().ok_or(Error::NoConfPath)?;
        let (conf, _) = Conf::load(path)?;
        info!(path = %path.display(), "conf reloaded");
        *self.conf.write() = conf;

        Ok(())
    }

    /// Re-reads the configuration file and reloads every driver from it.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be loaded or a driver fails to reload.
    pub async fn reload(&self) -> Result<()> {
        self.reload_conf()?;
        let config = self.conf.read().drivers.clone();
        self.factory.reload_all(&config).await?;

        Ok(())
    }

    /// Serves until SIGTERM or SIGINT, then closes everything. SIGHUP
    /// reloads the configuration.
    ///
    /// # Errors
    ///
    /// Fails if the signal handlers cannot be installed or closing fails.
    pub async fn run_until_signal(&self) -> Result<()> {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("SIGTERM received, please hold");
                    break;
                }
                _ = sigint.recv() => {
                    info!("SIGINT received, please hold");
                    break;
                }
                _ = sighup.recv() => {
                    info!("SIGHUP received, reloading");
                    if let Err(e) = self.reload().await {
                        error!(error = %e, "reload failed");
                    }
                }
            }
        }

        self.close_all().await?;
        info!(service = %self.service_id(), "process exited");

        Ok(())
    }
}

impl std::fmt::Debug for Turtle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Turtle")
            .field("service", &self.service_id())
            .field("conf_path", &self.conf_path)
            .field("runtime_dir", &self.runtime_dir)
            .finish_non_exhaustive()
    }
}
