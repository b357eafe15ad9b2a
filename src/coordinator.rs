//! Lifecycle of the daemon: background services plus the control loop.

use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::time::MissedTickBehavior;
use tokio_stream::{StreamExt, wrappers::IntervalStream};

use crate::{
    app_context::DeviceContext,
    config::ConfigManager,
    event::{ControlReceiver, ControlSender, control_channel},
    providers::{ConfigWatcherServiceProvider, ServiceProvider},
    state_machine::{AppState, AppStateMachine},
    task_manager::TaskManager,
};

/// Owns the state machine, the control channel and the background services.
///
/// The control loop is the only place device state changes. Services such as
/// the store watcher reach it through [`ControlSender`], and the loop drains
/// the channel before every tick.
pub struct SystemCoordinator {
    task_manager: TaskManager,
    control_tx: ControlSender,
    control_rx: ControlReceiver,
    machine: Option<AppStateMachine>,
    service_providers: Vec<Box<dyn ServiceProvider>>,
    tick: Duration,
}

impl Default for SystemCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemCoordinator {
    pub fn new() -> Self {
        let (control_tx, control_rx) = control_channel();

        Self {
            task_manager: TaskManager::new(),
            control_tx,
            control_rx,
            machine: None,
            service_providers: Vec::new(),
            tick: Duration::from_secs(1),
        }
    }

    pub async fn initialize(&mut self, config_manager: ConfigManager, context: DeviceContext) -> Result<()> {
        info!("Initializing SystemCoordinator...");

        let config = config_manager.clone_config().await;
        config.validate().context("Invalid daemon configuration")?;

        self.tick = config.tick();
        let mut providers: Vec<Box<dyn ServiceProvider>> = vec![Box::new(
            ConfigWatcherServiceProvider::new(config.store_path.clone(), self.control_tx.clone()),
        )];
        providers.sort_by_key(|p| std::cmp::Reverse(p.priority()));
        self.service_providers = providers;
        self.machine = Some(AppStateMachine::new(context, config));

        info!(
            "Registered {} service provider(s), tick every {} ms",
            self.service_providers.len(),
            self.tick.as_millis()
        );
        Ok(())
    }

    /// Starts services in priority order. Only critical services may abort
    /// startup.
    pub async fn start_all_services(&mut self) -> Result<()> {
        for provider in &self.service_providers {
            let is_critical = provider.is_critical();

            match provider.start(&mut self.task_manager).await {
                Ok(()) => info!(
                    "Service '{}' started (priority: {}, critical: {})",
                    provider.name(),
                    provider.priority(),
                    is_critical
                ),
                Err(e) if is_critical => {
                    return Err(e).with_context(|| {
                        format!("Critical service '{}' failed to start", provider.name())
                    });
                }
                Err(e) => warn!(
                    "Non-critical service '{}' failed to start: {e:#}",
                    provider.name()
                ),
            }
        }
        Ok(())
    }

    /// Ticks the state machine until Ctrl+C.
    pub async fn run_main_loop(&mut self) -> Result<()> {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ticks = IntervalStream::new(interval);
        info!("Starting control loop");

        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    match result {
                        Ok(()) => {
                            info!("Received Ctrl+C, shutting down");
                            self.shutdown().await?;
                            break;
                        }
                        Err(e) => bail!("Failed to listen for shutdown signal: {e}"),
                    }
                }

                Some(_) = ticks.next() => {
                    self.step(Utc::now()).await?;
                }
            }
        }

        info!("Control loop terminated");
        Ok(())
    }

    /// Hands queued control events to the state machine and runs one tick.
    pub async fn step(&mut self, now: DateTime<Utc>) -> Result<AppState> {
        let machine = self
            .machine
            .as_mut()
            .ok_or_else(|| anyhow!("System not initialized"))?;

        for event in self.control_rx.drain() {
            machine.handle_event(event);
        }
        let state = machine.tick(now).await;
        debug!("Tick finished in {state}");
        Ok(state)
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Initiating graceful shutdown...");

        if let Err(e) = self.task_manager.shutdown_all().await {
            warn!("Error during task shutdown: {e:#}");
        }
        if let Some(machine) = self.machine.as_mut() {
            machine.shutdown();
        }

        info!("Shutdown complete");
        Ok(())
    }

    /// Sender for producers outside the coordinator, such as a setup UI.
    pub fn control_sender(&self) -> ControlSender {
        self.control_tx.clone()
    }

    pub fn state_machine(&self) -> Option<&AppStateMachine> {
        self.machine.as_ref()
    }

    pub fn running_services(&self) -> Vec<&'static str> {
        self.service_providers.iter().map(|p| p.name()).collect()
    }
}
