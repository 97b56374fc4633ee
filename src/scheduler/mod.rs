use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// When a background task fires.
#[derive(Clone)]
pub enum Cadence {
    /// A fixed period between runs.
    Every(Duration),
    /// A cron expression with a seconds field, e.g. `0 0 3 * * *`.
    Cron(Box<cron::Schedule>),
}

impl Cadence {
    /// Parse a seconds-granularity cron expression.
    pub fn cron(expr: &str) -> Result<Cadence> {
        let schedule = cron::Schedule::from_str(expr)
            .map_err(|e| Error::Config(format!("invalid cron expression {expr:?}: {e}")))?;
        Ok(Cadence::Cron(Box::new(schedule)))
    }

    // Time until the next firing.
    fn next_delay(&self) -> Duration {
        match self {
            Cadence::Every(period) => *period,
            Cadence::Cron(schedule) => schedule
                .upcoming(chrono::Utc)
                .next()
                .and_then(|at| (at - chrono::Utc::now()).to_std().ok())
                .unwrap_or(Duration::from_secs(60)),
        }
    }
}

/// Context provided to background tasks during execution
pub struct Context {
    pub task_name: &'static str,
    pub run_id: u64,
}

/// Trait for background tasks that run on a cadence
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging and stop requests
    fn name(&self) -> &'static str;

    /// When this task fires
    fn cadence(&self) -> Cadence;

    /// Execute the task
    async fn execute(&self, ctx: Context) -> Result<()>;
}

struct TaskEntry {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Runs registered background tasks until stopped, individually or all
/// at once. Stopping halts a task at its next tick; an iteration that is
/// already running completes naturally.
pub struct Scheduler {
    tasks: Mutex<HashMap<&'static str, TaskEntry>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn the timer loop for a task. Returns false when a task with
    /// the same name is already running.
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> bool {
        let mut tasks = self.tasks.lock().unwrap();
        if tasks.contains_key(task.name()) {
            return false;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let name = task.name();
        let handle = Self::spawn_timer_loop(task, stop_rx);
        tasks.insert(name, TaskEntry { stop: stop_tx, handle });
        true
    }

    /// Signal one task to stop at its next tick. Returns false when no
    /// task with that name is running.
    pub fn stop(&self, name: &str) -> bool {
        match self.tasks.lock().unwrap().remove(name) {
            Some(entry) => {
                let _ = entry.stop.send(true);
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.tasks.lock().unwrap().contains_key(name)
    }

    /// Graceful shutdown: signal every task and wait for each loop to
    /// finish its current iteration and exit.
    pub async fn shutdown(&self) {
        let entries: Vec<TaskEntry> = {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.drain().map(|(_, entry)| entry).collect()
        };

        for entry in &entries {
            let _ = entry.stop.send(true);
        }
        for entry in entries {
            let _ = entry.handle.await;
        }
    }

    fn spawn_timer_loop<T: BackgroundTask + 'static>(
        task: Arc<T>,
        mut stop_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let cadence = task.cadence();
            let mut run_id = 0u64;

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(cadence.next_delay()) => {
                        run_id += 1;
                        let ctx = Context {
                            task_name: task.name(),
                            run_id,
                        };

                        if let Err(e) = task.execute(ctx).await {
                            tracing::error!(
                                task = task.name(),
                                error = %e,
                                "Task execution failed"
                            );
                        }
                    }

                    _ = stop_rx.changed() => {
                        tracing::info!(task = task.name(), "Task shutting down");
                        break;
                    }
                }
            }
        })
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
