//! Top-level device controller.
//!
//! ```text
//!   Boot ──incomplete──▶ WiFiSetup ──▶ CaptivePortal ──validated──▶ Normal
//!    ▲  └──complete──────────────────────────────────────────────────▶ │
//!    │                         ▲                                      │
//!    │                         └────── link lost / token rejected ────┤
//!    │                                                                ▼
//!  Error ◀── display or storage failure ── Normal → GitHubSync → LEDUpdate
//! ```
//!
//! Everything runs on the control loop. [`AppStateMachine::tick`] first
//! applies queued [`ControlEvent`]s, then performs one step of the current
//! state; the steady `Normal → GitHubSync → LEDUpdate → Normal` cycle
//! completes within a single tick.

use std::{collections::VecDeque, fmt};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};

use crate::{
    app_context::DeviceContext,
    config::Config,
    device_config::DeviceConfig,
    event::ControlEvent,
    matrix::{MatrixDimensions, MatrixError, PixelBuffer, palette, write_frame},
    notification::NotificationBar,
    rate_limiter::RateLimiter,
    render::ContributionRenderer,
    sync::{GitHubSyncEngine, github::GitHubApi},
};

const HISTORY_LIMIT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AppState {
    Boot,
    WiFiSetup,
    CaptivePortal,
    Normal,
    GitHubSync,
    LEDUpdate,
    Error,
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Transient per-boot state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSession {
    pub state: AppState,
    pub wifi_connected: bool,
    /// First tick the link was seen down, cleared when it returns.
    pub link_lost_since: Option<DateTime<Utc>>,
    /// The link dropped while a sync was in flight.
    pub link_dropped: bool,
    pub error_since: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Consecutive sync rounds with at least one failed signal.
    pub sync_failures: u32,
}

impl DeviceSession {
    fn new() -> Self {
        Self {
            state: AppState::Boot,
            wifi_connected: false,
            link_lost_since: None,
            link_dropped: false,
            error_since: None,
            last_error: None,
            sync_failures: 0,
        }
    }
}

pub struct AppStateMachine {
    context: DeviceContext,
    config: Config,
    device: Option<DeviceConfig>,
    limiter: RateLimiter,
    engine: Option<GitHubSyncEngine>,
    renderer: ContributionRenderer,
    bar: NotificationBar,
    session: DeviceSession,
    pending: VecDeque<ControlEvent>,
    history: Vec<AppState>,
}

impl AppStateMachine {
    pub fn new(context: DeviceContext, config: Config) -> Self {
        let limiter = RateLimiter::new(config.rate_limit.clone());
        let bar = NotificationBar::new(&config.notifications, config.matrix.width);

        Self {
            context,
            config,
            device: None,
            limiter,
            engine: None,
            renderer: ContributionRenderer,
            bar,
            session: DeviceSession::new(),
            pending: VecDeque::new(),
            history: vec![AppState::Boot],
        }
    }

    pub fn state(&self) -> AppState {
        self.session.state
    }

    pub fn session(&self) -> &DeviceSession {
        &self.session
    }

    pub fn device_config(&self) -> Option<&DeviceConfig> {
        self.device.as_ref()
    }

    pub fn engine(&self) -> Option<&GitHubSyncEngine> {
        self.engine.as_ref()
    }

    pub fn notifications(&self) -> &NotificationBar {
        &self.bar
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// States entered so far, oldest first.
    pub fn history(&self) -> &[AppState] {
        &self.history
    }

    pub fn visited(&self, state: AppState) -> bool {
        self.history.contains(&state)
    }

    /// Queues an event for the start of the next tick.
    pub fn handle_event(&mut self, event: ControlEvent) {
        debug!("Queued control event {event:?}");
        self.pending.push_back(event);
    }

    /// Runs one step and returns the state the device ends the tick in.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> AppState {
        self.apply_pending(now).await;

        match self.session.state {
            AppState::Boot => self.boot(now).await,
            AppState::WiFiSetup | AppState::CaptivePortal => {}
            AppState::Normal | AppState::GitHubSync | AppState::LEDUpdate => {
                self.run_cycle(now).await;
            }
            AppState::Error => self.check_watchdog(now),
        }

        if self.session.state == AppState::WiFiSetup {
            self.start_portal(now).await;
        }
        self.session.state
    }

    /// Blanks the display before the process exits.
    pub fn shutdown(&mut self) {
        info!("Blanking display for shutdown");
        self.blank_display();
    }

    fn transition(&mut self, to: AppState, now: DateTime<Utc>) {
        let from = self.session.state;
        if from == to {
            return;
        }

        match to {
            AppState::Normal | AppState::GitHubSync | AppState::LEDUpdate => {
                debug!("State {from} -> {to}");
            }
            _ => info!("State {from} -> {to}"),
        }
        self.session.state = to;
        self.history.push(to);
        if self.history.len() > HISTORY_LIMIT {
            let excess = self.history.len() - HISTORY_LIMIT;
            self.history.drain(..excess);
        }

        match to {
            AppState::Error => {
                self.session.error_since = Some(now);
                self.engine = None;
                self.bar.clear();
                self.blank_display();
            }
            AppState::WiFiSetup => {
                self.engine = None;
                self.session.link_lost_since = None;
                self.session.link_dropped = false;
            }
            AppState::Boot => {
                self.session.error_since = None;
            }
            _ => {}
        }
    }

    fn fail(&mut self, reason: String, now: DateTime<Utc>) {
        error!("{reason}");
        self.session.last_error = Some(reason);
        self.transition(AppState::Error, now);
    }

    fn blank_display(&mut self) {
        self.context.matrix.clear();
        if let Err(e) = self.context.matrix.show() {
            debug!("Could not blank display: {e}");
        }
    }

    async fn apply_pending(&mut self, now: DateTime<Utc>) {
        while let Some(event) = self.pending.pop_front() {
            match event {
                ControlEvent::ConfigSubmitted(device) => self.submit_config(device, now).await,
                ControlEvent::PortalAborted => self.abort_portal(now).await,
                ControlEvent::ConfigChanged => self.reload_config(now).await,
                ControlEvent::Reset => {
                    if self.session.state == AppState::Error {
                        info!("Reset requested");
                        self.transition(AppState::Boot, now);
                    } else {
                        debug!("Ignoring reset in {}", self.session.state);
                    }
                }
            }
        }
    }

    async fn boot(&mut self, now: DateTime<Utc>) {
        let dimensions = MatrixDimensions::new(self.config.matrix.width, self.config.matrix.height);
        if let Err(e) = self.context.matrix.init(dimensions) {
            self.fail(format!("Display initialisation failed: {e}"), now);
            return;
        }

        let device = match DeviceConfig::load(self.context.store.as_ref()) {
            Ok(device) => device,
            Err(e) => {
                self.fail(format!("Device configuration unreadable: {e}"), now);
                return;
            }
        };
        self.context.matrix.set_brightness(device.led_brightness);

        if !device.is_complete() {
            info!(
                "Device is not configured (missing {})",
                device.missing_fields().join(", ")
            );
            self.device = Some(device);
            self.transition(AppState::WiFiSetup, now);
            return;
        }

        if let Err(e) = self
            .context
            .wifi
            .connect(&device.wifi_ssid, &device.wifi_password)
            .await
        {
            warn!("Joining '{}' failed: {e:#}", device.wifi_ssid);
        }
        self.enter_normal(device, now);
    }

    /// The only way into `Normal`: requires a valid configuration and a
    /// working sync engine.
    fn enter_normal(&mut self, device: DeviceConfig, now: DateTime<Utc>) {
        if let Err(e) = device.validate() {
            warn!("Cannot start normal operation: {e:#}");
            self.device = Some(device);
            self.transition(AppState::WiFiSetup, now);
            return;
        }

        let engine = GitHubApi::new(self.context.http.clone(), &self.config.http, &device.github_token)
            .and_then(|api| GitHubSyncEngine::new(api, &device, &self.config.notifications, now));
        let engine = match engine {
            Ok(engine) => engine,
            Err(e) => {
                self.fail(format!("Cannot start GitHub sync: {e:#}"), now);
                return;
            }
        };

        info!(
            "Monitoring {} repositories for {}",
            device.repositories.len(),
            device.github_username
        );
        self.context.matrix.set_brightness(device.led_brightness);
        self.device = Some(device);
        self.engine = Some(engine);
        self.session.link_lost_since = None;
        self.session.link_dropped = false;
        self.session.sync_failures = 0;
        self.transition(AppState::Normal, now);
    }

    async fn start_portal(&mut self, now: DateTime<Utc>) {
        let defaults = DeviceConfig::default();
        let device = self.device.as_ref().unwrap_or(&defaults);
        let ssid = device.setup_ssid.clone();
        let password = device.setup_password.clone();

        match self.context.wifi.start_access_point(&ssid, &password).await {
            Ok(()) => {
                info!("Setup access point '{ssid}' is up");
                self.transition(AppState::CaptivePortal, now);
            }
            Err(e) => warn!("Starting setup access point failed, retrying: {e:#}"),
        }
    }

    /// Accepts a configuration from the setup UI once the credentials work.
    async fn submit_config(&mut self, device: DeviceConfig, now: DateTime<Utc>) {
        if self.session.state != AppState::CaptivePortal {
            debug!("Ignoring submitted configuration in {}", self.session.state);
            return;
        }
        if let Err(e) = device.validate() {
            warn!("Rejected submitted configuration: {e:#}");
            return;
        }
        if let Err(e) = self
            .context
            .wifi
            .connect(&device.wifi_ssid, &device.wifi_password)
            .await
        {
            warn!("Cannot join '{}': {e:#}", device.wifi_ssid);
            return;
        }

        let api = match GitHubApi::new(self.context.http.clone(), &self.config.http, &device.github_token) {
            Ok(api) => api,
            Err(e) => {
                warn!("Cannot reach GitHub: {e:#}");
                return;
            }
        };
        match api.validate_token(&mut self.limiter, now).await {
            Ok(login) if !login.eq_ignore_ascii_case(&device.github_username) => {
                warn!(
                    "Token belongs to '{login}', showing activity of '{}'",
                    device.github_username
                );
            }
            Ok(_) => {}
            Err(e) => {
                warn!("GitHub token validation failed: {e}");
                return;
            }
        }

        if let Err(e) = device.save(self.context.store.as_mut()) {
            self.fail(format!("Saving device configuration failed: {e}"), now);
            return;
        }
        if let Err(e) = self.context.wifi.stop_access_point().await {
            warn!("Stopping setup access point failed: {e:#}");
        }
        info!("Device configured for {}", device.github_username);
        self.enter_normal(device, now);
    }

    async fn abort_portal(&mut self, now: DateTime<Utc>) {
        if self.session.state != AppState::CaptivePortal {
            debug!("Ignoring portal abort in {}", self.session.state);
            return;
        }
        if let Err(e) = self.context.wifi.stop_access_point().await {
            warn!("Stopping setup access point failed: {e:#}");
        }
        self.transition(AppState::Boot, now);
    }

    /// Re-reads the store after it changed underneath us.
    async fn reload_config(&mut self, now: DateTime<Utc>) {
        let state = self.session.state;
        if matches!(state, AppState::Boot | AppState::Error) {
            debug!("Ignoring configuration change in {state}");
            return;
        }

        let device = match DeviceConfig::load(self.context.store.as_ref()) {
            Ok(device) => device,
            Err(e) => {
                self.fail(format!("Device configuration unreadable: {e}"), now);
                return;
            }
        };

        match state {
            AppState::CaptivePortal => {
                if device.is_complete() {
                    self.submit_config(device, now).await;
                } else {
                    self.device = Some(device);
                }
            }
            AppState::WiFiSetup => self.device = Some(device),
            _ => {
                if self.device.as_ref() == Some(&device) {
                    debug!("Device configuration unchanged");
                    return;
                }
                info!("Device configuration changed, restarting sync");
                self.enter_normal(device, now);
            }
        }
    }

    async fn run_cycle(&mut self, now: DateTime<Utc>) {
        if self.session.link_dropped {
            warn!("WiFi link dropped during sync, entering setup");
            self.transition(AppState::WiFiSetup, now);
            return;
        }

        let connected = self.context.wifi.is_connected().await;
        self.session.wifi_connected = connected;
        if connected {
            if self.session.link_lost_since.take().is_some() {
                info!("WiFi link restored");
            }
        } else {
            let since = *self.session.link_lost_since.get_or_insert(now);
            if since == now {
                warn!("WiFi link lost");
            }
            if now - since >= self.config.connectivity_grace() {
                warn!("WiFi link down for {}s, entering setup", (now - since).num_seconds());
                self.transition(AppState::WiFiSetup, now);
                return;
            }
        }

        let Some(engine) = self.engine.as_mut() else {
            self.transition(AppState::WiFiSetup, now);
            return;
        };
        engine.refresh_calendar(now);
        let due = connected && engine.is_any_due(now, &self.limiter);

        if due {
            self.transition(AppState::GitHubSync, now);
            if !self.sync(now).await {
                return;
            }
        }

        self.transition(AppState::LEDUpdate, now);
        if let Err(e) = self.update_display(now) {
            self.fail(format!("Display update failed: {e}"), now);
            return;
        }
        self.transition(AppState::Normal, now);
    }

    /// Fetches, re-checks the link and applies. Returns whether the cycle
    /// should go on to the display update.
    async fn sync(&mut self, now: DateTime<Utc>) -> bool {
        let Some(engine) = self.engine.as_mut() else {
            return false;
        };
        let batch = engine.fetch(now, &mut self.limiter).await;

        if !self.context.wifi.is_connected().await {
            warn!("WiFi link lost during sync, discarding {} result(s)", batch.len());
            self.session.wifi_connected = false;
            self.session.link_dropped = true;
            self.transition(AppState::Normal, now);
            return false;
        }

        let auth_failure = batch.auth_failure();
        let failed = batch.polls.iter().any(|p| p.result.is_err());
        let events = match self.engine.as_mut() {
            Some(engine) => engine.apply(batch, now),
            None => Vec::new(),
        };

        self.session.sync_failures = if failed {
            self.session.sync_failures.saturating_add(1)
        } else {
            0
        };
        for event in events {
            if let Some(evicted) = self.bar.push(event) {
                debug!("Notification {evicted} evicted");
            }
        }

        if let Some(status) = auth_failure {
            error!("GitHub rejected the token ({status}), reconfiguration required");
            self.transition(AppState::WiFiSetup, now);
            return false;
        }
        true
    }

    /// Bar on `bar_row`, graph starting at `graph_row_offset`.
    fn compose(&mut self, now: DateTime<Utc>) -> PixelBuffer {
        let width = self.config.matrix.width;
        let height = self.config.matrix.height;
        let bar_row = self.config.matrix.bar_row;
        let graph_row = self.config.matrix.graph_row_offset;

        let mut frame = PixelBuffer::filled(MatrixDimensions::new(width, height), palette::BACKGROUND);
        frame.blit(&self.bar.render(now), 0, bar_row);
        if let Some(engine) = &self.engine {
            frame.blit(&self.renderer.render(engine.graph()), 0, graph_row);
        }
        frame
    }

    fn update_display(&mut self, now: DateTime<Utc>) -> Result<(), MatrixError> {
        let frame = self.compose(now);
        write_frame(self.context.matrix.as_mut(), &frame)
    }

    fn check_watchdog(&mut self, now: DateTime<Utc>) {
        let (Some(delay), Some(since)) = (self.config.watchdog_reset(), self.session.error_since) else {
            return;
        };
        if now - since >= delay {
            warn!("Watchdog reset after {}s in error state", delay.num_seconds());
            self.transition(AppState::Boot, now);
        }
    }
}
