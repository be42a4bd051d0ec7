use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use croner::Cron;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::BoxError;
use crate::error::{Error, Result};

const MAX_START_JITTER_MS: u64 = 100;

/// Admission flag and in-flight counter of one worker, shared with its tasks.
#[derive(Debug)]
pub(crate) struct TaskGate {
    pub(crate) worker: String,
    enabled: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl TaskGate {
    pub(crate) fn new(worker: impl Into<String>) -> Self {
        Self {
            worker: worker.into(),
            enabled: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn enter(self: &Arc<Self>) -> WorkGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        WorkGuard { gate: self.clone() }
    }

    /// Resolves once nothing is in flight.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Counts one unit of in-flight work until dropped.
#[derive(Debug)]
#[must_use = "work is only counted while the guard is alive"]
pub struct WorkGuard {
    gate: Arc<TaskGate>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        if self.gate.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.gate.idle.notify_waiters();
        }
    }
}

/// Passed to every task iteration.
#[derive(Clone, Debug)]
pub struct TaskContext {
    /// When this firing happened.
    pub fired_at: DateTime<Utc>,

    /// 1-based count of executed iterations.
    pub round: u64,

    cancel: CancellationToken,
}

impl TaskContext {
    /// Whether the task was cancelled while this iteration runs.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Handle to a recurring task registered on a worker.
#[derive(Clone, Debug)]
pub struct TaskHandle {
    label: Arc<str>,
    cancel: CancellationToken,
    finished: CancellationToken,
}

impl TaskHandle {
    /// The label given at registration.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Stops scheduling further iterations; a running one completes.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether `cancel` was called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the task loop has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Resolves once the task loop has exited.
    pub async fn finished(&self) {
        self.finished.cancelled().await;
    }
}

pub(crate) enum Trigger {
    Every(Duration),
    Cron(Box<Cron>),
}

impl Trigger {
    pub(crate) fn cron(expression: &str) -> Result<Self> {
        Cron::new(expression)
            .with_seconds_optional()
            .parse()
            .map(|cron| Self::Cron(Box::new(cron)))
            .map_err(|e| Error::InvalidCron {
                expression: expression.to_string(),
                reason: e.to_string(),
            })
    }
}

fn next_occurrence(
    cron: &Cron,
    last: Option<DateTime<Utc>>,
) -> Option<(DateTime<Utc>, Duration)> {
    let now = Utc::now();
    // Never fire twice for one occurrence if the clock lags.
    let from = last.map_or(now, |last| last.max(now));
    let next = cron.find_next_occurrence(&from, false).ok()?;

    Some((next, (next - now).to_std().unwrap_or_default()))
}

pub(crate) fn spawn<F, Fut>(
    gate: Arc<TaskGate>,
    label: &str,
    trigger: Trigger,
    crash_on_error: bool,
    work: F,
) -> TaskHandle
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
{
    let handle = TaskHandle {
        label: Arc::from(label),
        cancel: CancellationToken::new(),
        finished: CancellationToken::new(),
    };

    let task = handle.clone();
    tokio::spawn(async move {
        let _finished = task.finished.clone().drop_guard();
        run(&gate, &task, &trigger, crash_on_error, work).await;
        debug!(worker = %gate.worker, task = %task.label, "task exited");
    });

    handle
}

async fn run<F, Fut>(
    gate: &Arc<TaskGate>,
    task: &TaskHandle,
    trigger: &Trigger,
    crash_on_error: bool,
    work: F,
) where
    F: Fn(TaskContext) -> Fut,
    Fut: Future<Output = std::result::Result<(), BoxError>>,
{
    let mut round = 0;
    let mut last_occurrence = None;

    loop {
        let wait = match trigger {
            Trigger::Every(_) => Duration::from_millis(fastrand::u64(0..MAX_START_JITTER_MS)),
            Trigger::Cron(cron) => {
                let Some((at, wait)) = next_occurrence(cron, last_occurrence) else {
                    warn!(worker = %gate.worker, task = %task.label, "no next occurrence");
                    return;
                };
                last_occurrence = Some(at);
                wait
            }
        };

        tokio::select! {
            () = task.cancel.cancelled() => return,
            () = tokio::time::sleep(wait) => {}
        }

        // Counted before the admission check so a concurrent drain sees it.
        let work_guard = gate.enter();
        if gate.is_enabled() {
            round += 1;
            let context = TaskContext {
                fired_at: Utc::now(),
                round,
                cancel: task.cancel.clone(),
            };

            if let Err(e) = work(context).await {
                warn!(worker = %gate.worker, task = %task.label, round, error = %e, "task failed");
                if crash_on_error {
                    error!(worker = %gate.worker, task = %task.label, "task stopped after error");
                    return;
                }
            } else if round == 1 {
                info!(worker = %gate.worker, task = %task.label, "task first round done");
            }
        }
        drop(work_guard);

        if let Trigger::Every(interval) = trigger {
            tokio::select! {
                () = task.cancel.cancelled() => return,
                () = tokio::time::sleep(*interval) => {}
            }
        }
    }
}
