//! Polling engine — a single background task awaiting a poll callback.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::error::{PollError, PollResult};
use crate::trigger::Trigger;

/// Future returned by a poll callback.
pub type PollFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Zero-argument poll callback invoked once per tick.
pub type PollFn = Arc<dyn Fn() -> PollFuture + Send + Sync>;

/// `tokio::time::interval` panics on a zero period.
const MIN_RATE_PERIOD: Duration = Duration::from_millis(1);

/// The currently scheduled poll loop.
struct RunningTask {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

#[derive(Default)]
struct Tasks {
    running: Option<RunningTask>,
    /// A stopped loop that may still be inside a poll.
    stopping: Option<JoinHandle<()>>,
}

impl Tasks {
    /// Stop the running loop, keeping its handle until it exits.
    fn stop(&mut self) -> bool {
        match self.running.take() {
            Some(task) => {
                let _ = task.shutdown_tx.send(true);
                self.stopping = Some(task.handle);
                true
            }
            None => false,
        }
    }
}

/// Runs a poll callback on a [`Trigger`], one invocation at a time.
pub struct PollingEngine {
    name: String,
    trigger: Trigger,
    /// Runtime to spawn on; the ambient runtime when unset.
    runtime: Option<Handle>,
    tasks: Mutex<Tasks>,
}

impl PollingEngine {
    pub fn new(name: impl Into<String>, trigger: Trigger) -> Self {
        Self {
            name: name.into(),
            trigger,
            runtime: None,
            tasks: Mutex::new(Tasks::default()),
        }
    }

    /// Spawn the poll loop on `handle` instead of the caller's runtime.
    pub fn with_runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn trigger(&self) -> Trigger {
        self.trigger
    }

    /// Schedule repeating invocations of `poll`.
    ///
    /// Fails if a poll loop is already running or no runtime is available.
    /// After a stop, the first poll waits for a poll still in progress on
    /// the stopped loop.
    pub fn start(&self, poll: PollFn) -> PollResult<()> {
        let mut tasks = lock(&self.tasks);
        if let Some(task) = tasks.running.as_ref()
            && !task.handle.is_finished()
        {
            return Err(PollError::AlreadyRunning(self.name.clone()));
        }

        let handle = match &self.runtime {
            Some(handle) => handle.clone(),
            None => Handle::try_current().map_err(|_| PollError::NoRuntime(self.name.clone()))?,
        };

        let previous = tasks.stopping.take().filter(|prev| !prev.is_finished());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let name = self.name.clone();
        let trigger = self.trigger;
        let join = handle.spawn(async move {
            // Awaited even if stopped meanwhile, so a later start chains onto this task.
            if let Some(previous) = previous {
                debug!(engine = %name, "waiting for stopped poll loop to exit");
                let _ = previous.await;
            }
            run_poll_loop(&name, trigger, poll, shutdown_rx).await;
        });

        tasks.running = Some(RunningTask {
            handle: join,
            shutdown_tx,
        });

        info!(
            engine = %self.name,
            period_ms = self.trigger.period().as_millis() as u64,
            "polling engine started"
        );
        Ok(())
    }

    /// Cancel future polls. Idempotent; a poll in progress runs to completion.
    pub fn stop(&self) {
        if lock(&self.tasks).stop() {
            info!(engine = %self.name, "polling engine stopped");
        }
    }

    /// Stop and wait for the poll loop, including any poll in progress, to exit.
    pub async fn stop_and_join(&self) {
        let (stopped, handle) = {
            let mut tasks = lock(&self.tasks);
            let stopped = tasks.stop();
            (stopped, tasks.stopping.take())
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        if stopped {
            info!(engine = %self.name, "polling engine stopped");
        }
    }

    /// Whether a poll loop is scheduled. A stopped loop finishing its last
    /// poll does not count.
    pub fn is_running(&self) -> bool {
        lock(&self.tasks)
            .running
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }
}

impl Drop for PollingEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The poll loop. Polls are awaited inline, so they never overlap.
async fn run_poll_loop(
    name: &str,
    trigger: Trigger,
    poll: PollFn,
    mut shutdown: watch::Receiver<bool>,
) {
    let initial_delay = trigger.initial_delay();
    if !initial_delay.is_zero() {
        tokio::select! {
            _ = tokio::time::sleep(initial_delay) => {}
            _ = shutdown.changed() => {
                debug!(engine = %name, "poll loop stopped before first poll");
                return;
            }
        }
    }

    match trigger {
        Trigger::FixedDelay { period, .. } => loop {
            if *shutdown.borrow() {
                break;
            }
            poll().await;
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = shutdown.changed() => break,
            }
        },
        Trigger::FixedRate { period, .. } => {
            let mut interval = tokio::time::interval(period.max(MIN_RATE_PERIOD));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if *shutdown.borrow() {
                            break;
                        }
                        poll().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }
    }

    debug!(engine = %name, "poll loop exited");
}
