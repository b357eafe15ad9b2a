//! Named background tasks with cooperative cancellation.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use log::{error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns every background task of the daemon.
///
/// Each task gets a child of `global_token`; cancelling the global token
/// stops them all.
pub struct TaskManager {
    tasks: HashMap<String, TaskInfo>,
    pub global_token: CancellationToken,
}

struct TaskInfo {
    handle: JoinHandle<Result<()>>,
    cancel_token: CancellationToken,
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            global_token: CancellationToken::new(),
        }
    }

    /// Spawns `task_fn` under `name`. A task already registered under the
    /// same name is cancelled first.
    pub async fn spawn_task<F, Fut>(&mut self, name: String, task_fn: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        if self.tasks.contains_key(&name) {
            warn!("Task '{name}' already running, replacing it");
            if let Err(e) = self.stop_task(&name).await {
                warn!("Previous '{name}' task ended badly: {e:#}");
            }
        }

        let cancel_token = self.global_token.child_token();
        let task_token = cancel_token.clone();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            match task_fn(task_token).await {
                Ok(()) => {
                    info!("Task '{task_name}' finished");
                    Ok(())
                }
                Err(e) => {
                    error!("Task '{task_name}' failed: {e:#}");
                    Err(e)
                }
            }
        });

        self.tasks.insert(name.clone(), TaskInfo { handle, cancel_token });
        info!("Task '{name}' spawned");
        Ok(())
    }

    /// Cancels one task and waits for it to finish.
    pub async fn stop_task(&mut self, name: &str) -> Result<()> {
        let info = self
            .tasks
            .remove(name)
            .ok_or_else(|| anyhow!("No task named '{name}'"))?;
        info.cancel_token.cancel();
        join(name, info.handle).await
    }

    /// Cancels everything and waits up to 10 s per task. Returns the first
    /// failure after all tasks were joined.
    pub async fn shutdown_all(&mut self) -> Result<()> {
        info!("Stopping {} task(s)", self.tasks.len());
        self.global_token.cancel();

        let mut first_error = None;
        for (name, info) in self.tasks.drain() {
            if let Err(e) = join(&name, info.handle).await {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e).context("One or more tasks failed during shutdown"),
            None => {
                info!("All tasks stopped");
                Ok(())
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.tasks
            .get(name)
            .is_some_and(|info| !info.handle.is_finished())
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

async fn join(name: &str, handle: JoinHandle<Result<()>>) -> Result<()> {
    match tokio::time::timeout(JOIN_TIMEOUT, handle).await {
        Ok(Ok(result)) => result.with_context(|| format!("Task '{name}' failed")),
        Ok(Err(e)) => {
            error!("Task '{name}' panicked: {e}");
            Err(anyhow!("Task '{name}' panicked: {e}"))
        }
        Err(_) => {
            error!("Task '{name}' did not stop within {}s", JOIN_TIMEOUT.as_secs());
            Err(anyhow!("Task '{name}' shutdown timeout exceeded"))
        }
    }
}
