use anyhow::Result;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use notify::{Event, EventHandler, RecursiveMode, Watcher, recommended_watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    event::{ControlEvent, ControlSender},
    providers::traits::ServiceProvider,
    task_manager::TaskManager,
};

const DEBOUNCE: Duration = Duration::from_millis(2000);

/// Watches the device configuration store and tells the control loop when
/// it changes.
///
/// This is how configuration written by an external setup tool reaches the
/// device: the state machine reloads the store on
/// [`ControlEvent::ConfigChanged`] and, while the setup portal is open,
/// treats a complete configuration as a submission.
///
/// Bursts of filesystem events are collapsed into one notification every
/// two seconds at most.
pub struct ConfigWatcherServiceProvider {
    store_path: PathBuf,
    events: ControlSender,
}

impl ConfigWatcherServiceProvider {
    pub fn new(store_path: PathBuf, events: ControlSender) -> Self {
        Self { store_path, events }
    }
}

#[async_trait]
impl ServiceProvider for ConfigWatcherServiceProvider {
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
        let store_path = self.store_path.clone();
        let events = self.events.clone();

        task_manager
            .spawn_task(self.name().to_string(), |cancel_token| async move {
                run_store_watcher(store_path, events, cancel_token).await
            })
            .await
    }

    fn name(&self) -> &'static str {
        "ConfigWatcherService"
    }

    fn priority(&self) -> i32 {
        6
    }

    fn is_critical(&self) -> bool {
        false
    }
}

/// Forwards notify callbacks into the async task.
#[derive(Debug)]
struct AsyncEventHandler {
    sender: mpsc::UnboundedSender<notify::Result<Event>>,
}

impl EventHandler for AsyncEventHandler {
    fn handle_event(&mut self, event: notify::Result<Event>) {
        if let Err(e) = self.sender.send(event) {
            error!("Failed to forward filesystem event: {e}");
        }
    }
}

fn affects(event: &Event, store_path: &Path) -> bool {
    let relevant = event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove();
    relevant
        && event
            .paths
            .iter()
            .any(|path| path == store_path || path.file_name() == store_path.file_name())
}

/// The store file itself may not exist yet, so its directory is watched
/// and events are filtered by file name.
async fn run_store_watcher(
    store_path: PathBuf,
    events: ControlSender,
    cancel_token: CancellationToken,
) -> Result<()> {
    let watch_dir = match store_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    if !watch_dir.exists() {
        tokio::fs::create_dir_all(&watch_dir).await?;
    }

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let mut watcher = recommended_watcher(AsyncEventHandler { sender: event_tx })?;
    watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;
    info!("Watching {} for device configuration changes", store_path.display());

    let mut debounce = tokio::time::interval(DEBOUNCE);
    debounce.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut pending = false;

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                debug!("Store watcher cancelled");
                break;
            }

            event = event_rx.recv() => match event {
                Some(Ok(event)) => {
                    if affects(&event, &store_path) {
                        debug!("Store event {:?}", event.kind);
                        pending = true;
                    }
                }
                Some(Err(e)) => warn!("Filesystem watcher error: {e}"),
                None => {
                    warn!("Filesystem event channel closed");
                    break;
                }
            },

            _ = debounce.tick(), if pending => {
                pending = false;
                info!("Device configuration changed on disk");
                if let Err(e) = events.send(ControlEvent::ConfigChanged).await {
                    warn!("{e:#}");
                    break;
                }
            }
        }
    }

    if let Err(e) = watcher.unwatch(&watch_dir) {
        warn!("Failed to unwatch {}: {e}", watch_dir.display());
    }
    Ok(())
}
