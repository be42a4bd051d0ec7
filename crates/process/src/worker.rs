use std::future::Future;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::state::{Begin, RunningState, StateCell};
use crate::task::{self, TaskContext, TaskGate, TaskHandle, Trigger, WorkGuard};
use crate::{BoxError, DrainTimeout, ShutdownOutcome, StartOutcome};

/// Application half of a worker.
#[async_trait]
pub trait WorkerHandler
where
    Self: Send + Sync + 'static,
{
    /// Brings the worker's background work up, usually by registering tasks
    /// on `worker`. `Ok(false)` declines the start.
    async fn on_start(&self, worker: &Worker) -> std::result::Result<bool, BoxError>;
}

struct Inner {
    state: StateCell,
    gate: Arc<TaskGate>,
    handler: Arc<dyn WorkerHandler>,
    tasks: Mutex<Vec<TaskHandle>>,
}

/// The background role of an instance.
///
/// Cheap to clone; clones share state and tasks.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<Inner>,
}

impl Worker {
    /// Creates a prepared worker.
    pub fn new(name: impl Into<String>, handler: Arc<dyn WorkerHandler>) -> Self {
        let name = name.into();
        Self {
            inner: Arc::new(Inner {
                gate: Arc::new(TaskGate::new(name.clone())),
                state: StateCell::new("worker", name, RunningState::Prepared),
                handler,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The worker's name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.inner.state.name()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> RunningState {
        self.inner.state.get()
    }

    /// Whether tasks are admitted to run.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.gate.is_enabled()
    }

    /// Number of task iterations and guarded units of work currently running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.gate.in_flight()
    }

    /// Counts work done outside registered tasks, so shutdown drains it too.
    pub fn begin_work(&self) -> WorkGuard {
        self.inner.gate.enter()
    }

    /// Registers a task that runs `work` every `interval`, after a random
    /// start delay below 100 ms.
    ///
    /// An iteration error is logged; with `crash_on_error` it also ends the
    /// task.
    pub fn create_continuous_work<F, Fut>(
        &self,
        label: &str,
        interval: Duration,
        crash_on_error: bool,
        work: F,
    ) -> TaskHandle
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.register(label, Trigger::Every(interval), crash_on_error, work)
    }

    /// Registers a task that runs `work` at every occurrence of a cron
    /// expression. Five or six fields (leading seconds) are accepted.
    ///
    /// # Errors
    ///
    /// Fails if the expression does not parse.
    pub fn create_scheduled_work<F, Fut>(
        &self,
        label: &str,
        expression: &str,
        crash_on_error: bool,
        work: F,
    ) -> Result<TaskHandle>
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        let trigger = Trigger::cron(expression)?;
        Ok(self.register(label, trigger, crash_on_error, work))
    }

    fn register<F, Fut>(
        &self,
        label: &str,
        trigger: Trigger,
        crash_on_error: bool,
        work: F,
    ) -> TaskHandle
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        let handle = task::spawn(
            self.inner.gate.clone(),
            label,
            trigger,
            crash_on_error,
            work,
        );
        self.inner.tasks.lock().push(handle.clone());
        info!(worker = %self.name(), task = label, "task registered");

        handle
    }

    /// Handles of the tasks registered since the last shutdown.
    #[must_use]
    pub fn tasks(&self) -> Vec<TaskHandle> {
        self.inner.tasks.lock().clone()
    }

    /// Starts the worker through its handler.
    ///
    /// A declined or errored start cancels whatever tasks the handler
    /// registered before giving up.
    ///
    /// # Errors
    ///
    /// Fails if the worker was never prepared.
    pub async fn start(&self) -> Result<StartOutcome> {
        if self.inner.state.begin_start()? == Begin::Ignored {
            return Ok(StartOutcome::Ignored);
        }

        info!(worker = %self.name(), "starting worker");
        match self.inner.handler.on_start(self).await {
            Ok(true) => {
                self.inner.gate.set_enabled(true);
                self.inner.state.set(RunningState::Running);
                info!(worker = %self.name(), "worker started");
                Ok(StartOutcome::Started)
            }
            Ok(false) => {
                warn!(worker = %self.name(), "start failed, worker declined");
                self.cancel_tasks();
                self.inner.state.set(RunningState::Closed);
                Ok(StartOutcome::Declined)
            }
            Err(e) => {
                error!(worker = %self.name(), error = %e, "start errored");
                self.cancel_tasks();
                self.inner.state.set(RunningState::Prepared);
                Ok(StartOutcome::Errored)
            }
        }
    }

    fn cancel_tasks(&self) {
        let tasks = mem::take(&mut *self.inner.tasks.lock());
        for task in &tasks {
            task.cancel();
        }
        info!(worker = %self.name(), tasks = tasks.len(), "tasks cancelled");
    }

    /// Stops admitting task firings, cancels every task and waits for
    /// in-flight work to drain within `drain`.
    ///
    /// A drain that times out leaves the worker Running (but disabled) so the
    /// shutdown can be retried.
    ///
    /// # Errors
    ///
    /// Fails if the worker was never prepared.
    pub async fn shutdown(&self, drain: DrainTimeout) -> Result<ShutdownOutcome> {
        if self.inner.state.begin_close()? == Begin::Ignored {
            return Ok(ShutdownOutcome::Ignored);
        }

        info!(worker = %self.name(), "shutting down worker");
        self.inner.gate.set_enabled(false);

        self.cancel_tasks();

        let drained = match drain {
            DrainTimeout::Immediate => true,
            DrainTimeout::Unbounded => {
                self.inner.gate.wait_idle().await;
                true
            }
            DrainTimeout::Bounded(limit) => {
                tokio::time::timeout(limit, self.inner.gate.wait_idle())
                    .await
                    .is_ok()
            }
        };

        if drained {
            self.inner.state.set(RunningState::Closed);
            info!(worker = %self.name(), "worker closed");
            Ok(ShutdownOutcome::Closed)
        } else {
            error!(
                worker = %self.name(),
                in_flight = self.in_flight(),
                "drain timed out, worker stays running"
            );
            self.inner.state.set(RunningState::Running);
            Ok(ShutdownOutcome::DrainTimedOut)
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}
