//! Configuration management for the gitglow daemon.
//!
//! Handles loading, parsing, and validation of the YAML file that describes
//! the host: matrix geometry, tick rate, API endpoint and quota settings.
//! Per-user device settings (WiFi, token, repositories) live separately in
//! the device store, see [`crate::device_config`].

use anyhow::{Context, Result, anyhow, bail};
use log::{LevelFilter, info};
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};
use tokio::sync::RwLock;

use crate::{
    graph::{GRAPH_COLUMNS, GRAPH_ROWS},
    sync::Signal,
};

/// Main configuration structure for the gitglow daemon.
///
/// # Example
///
/// ```yaml
/// version: 1
/// tick_millis: 1000
/// store_path: /var/lib/gitglow/device.yml
///
/// matrix:
///   width: 32
///   height: 8
///   bar_row: 0
///   graph_row_offset: 1
///   layout: serpentine
///
/// rate_limit:
///   ceiling: 5000
///   safety_margin: 100
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Configuration version for compatibility checking.
    pub version: u8,

    /// Control loop period in milliseconds.
    #[serde(default = "defaults::tick_millis")]
    pub tick_millis: u64,

    /// How long the WiFi link may be down before falling back to setup.
    #[serde(default = "defaults::connectivity_grace_secs")]
    pub connectivity_grace_secs: u64,

    /// One of `error`, `warn`, `info`, `debug`, `trace`.
    #[serde(default = "defaults::log_level")]
    pub log_level: String,

    /// File backing the device configuration store.
    #[serde(default = "defaults::store_path")]
    pub store_path: PathBuf,

    /// Automatic `Error -> Boot` delay. Unset means wait for a manual reset.
    #[serde(default)]
    pub watchdog_reset_secs: Option<u64>,

    #[serde(default)]
    pub matrix: MatrixConfig,

    #[serde(default)]
    pub notifications: NotificationConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub network: NetworkConfig,
}

/// Physical LED order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatrixLayout {
    RowMajor,
    /// Every other row runs right to left.
    #[default]
    Serpentine,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatrixConfig {
    pub width: usize,
    pub height: usize,
    /// Row used by the notification bar.
    pub bar_row: usize,
    /// First row of the contribution graph.
    pub graph_row_offset: usize,
    pub layout: MatrixLayout,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            width: 32,
            height: 8,
            bar_row: 0,
            graph_row_offset: 1,
            layout: MatrixLayout::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub capacity: usize,
    pub ttl_secs: u64,
    /// Events shown on the bar at once.
    pub visible: usize,
    /// Events younger than this blink.
    pub blink_secs: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            capacity: 8,
            ttl_secs: 600,
            visible: 4,
            blink_secs: 10,
        }
    }
}

impl NotificationConfig {
    pub fn ttl(&self) -> chrono::Duration {
        seconds(self.ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests allowed per window.
    pub ceiling: u32,
    pub window_secs: u64,
    /// Requests kept in reserve before the window resets.
    pub safety_margin: u32,
    /// Requests consumed by one poll.
    pub call_cost: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            ceiling: 5000,
            window_secs: 3600,
            safety_margin: 100,
            call_cost: 1,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> chrono::Duration {
        seconds(self.window_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub api_base: String,
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.github.com".to_string(),
            timeout_secs: 10,
            user_agent: concat!("gitglow/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl HttpConfig {
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Station interface to monitor.
    pub interface: String,
    pub sysfs_root: PathBuf,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface: "wlan0".to_string(),
            sysfs_root: PathBuf::from("/sys/class/net"),
        }
    }
}

mod defaults {
    use std::path::PathBuf;

    pub fn tick_millis() -> u64 {
        1000
    }

    pub fn connectivity_grace_secs() -> u64 {
        30
    }

    pub fn log_level() -> String {
        "info".to_string()
    }

    pub fn store_path() -> PathBuf {
        PathBuf::from("/var/lib/gitglow/device.yml")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            tick_millis: defaults::tick_millis(),
            connectivity_grace_secs: defaults::connectivity_grace_secs(),
            log_level: defaults::log_level(),
            store_path: defaults::store_path(),
            watchdog_reset_secs: None,
            matrix: MatrixConfig::default(),
            notifications: NotificationConfig::default(),
            rate_limit: RateLimitConfig::default(),
            http: HttpConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

impl Config {
    /// Validates the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.version != 1 {
            bail!("Unsupported config version {}", self.version);
        }
        if self.tick_millis == 0 {
            bail!("tick_millis must be positive");
        }

        self.log_level_filter()?;

        let m = &self.matrix;
        if m.width < GRAPH_COLUMNS {
            bail!(
                "Matrix width {} cannot hold {} graph columns",
                m.width,
                GRAPH_COLUMNS
            );
        }
        if m.graph_row_offset + GRAPH_ROWS > m.height {
            bail!(
                "Matrix height {} cannot hold {} graph rows starting at row {}",
                m.height,
                GRAPH_ROWS,
                m.graph_row_offset
            );
        }
        if m.bar_row >= m.height {
            bail!("Notification bar row {} is outside the matrix", m.bar_row);
        }
        if (m.graph_row_offset..m.graph_row_offset + GRAPH_ROWS).contains(&m.bar_row) {
            bail!("Notification bar row {} overlaps the graph", m.bar_row);
        }

        let n = &self.notifications;
        if n.capacity == 0 || n.visible == 0 {
            bail!("Notification capacity and visible count must be positive");
        }

        let r = &self.rate_limit;
        if r.call_cost == 0 || r.window_secs == 0 {
            bail!("Rate limit call cost and window must be positive");
        }
        if r.safety_margin >= r.ceiling {
            bail!(
                "Safety margin {} must be below the ceiling {}",
                r.safety_margin,
                r.ceiling
            );
        }
        let largest_reserve = Signal::ALL
            .iter()
            .map(|s| r.safety_margin.saturating_mul(s.reserve_factor()))
            .max()
            .unwrap_or(r.safety_margin);
        if largest_reserve.saturating_add(r.call_cost) > r.ceiling {
            bail!(
                "Ceiling {} leaves no room for a call above the largest reserve {}",
                r.ceiling,
                largest_reserve
            );
        }

        if self.http.timeout_secs == 0 {
            bail!("HTTP timeout must be positive");
        }

        Ok(())
    }

    pub fn log_level_filter(&self) -> Result<LevelFilter> {
        LevelFilter::from_str(&self.log_level)
            .map_err(|_| anyhow!("Invalid log level '{}'", self.log_level))
    }

    pub const fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_millis)
    }

    pub fn connectivity_grace(&self) -> chrono::Duration {
        seconds(self.connectivity_grace_secs)
    }

    pub fn watchdog_reset(&self) -> Option<chrono::Duration> {
        self.watchdog_reset_secs.map(seconds)
    }
}

/// Converts a configured second count, saturating instead of overflowing.
pub fn seconds(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

fn locate_config() -> Option<PathBuf> {
    if let Ok(env_path) = env::var("GITGLOW_CONFIG") {
        return Some(PathBuf::from(env_path));
    }

    if let Some(mut cfg_dir) = env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("HOME").map(|h| Path::new(&h).join(".config")))
    {
        cfg_dir.push("gitglow/config.yml");
        if cfg_dir.exists() {
            return Some(cfg_dir);
        }
    }

    let etc = Path::new("/etc/gitglow/config.yml");
    if etc.exists() {
        return Some(etc.to_path_buf());
    }

    None
}

/// Configuration manager that owns the daemon config and where it came from.
///
/// # Example
///
/// ```no_run
/// use gitglow::config::ConfigManager;
///
/// # async fn example() -> anyhow::Result<()> {
/// let config_manager = ConfigManager::load(None).await?;
/// let tick = config_manager.get().await.tick();
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: Arc<RwLock<Config>>,
    path: Option<PathBuf>,
}

impl ConfigManager {
    pub fn new(config: Config, path: Option<PathBuf>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            path,
        }
    }

    /// Loads configuration from file or standard locations.
    ///
    /// Searches for configuration in the following order:
    /// 1. Provided path parameter
    /// 2. GITGLOW_CONFIG environment variable
    /// 3. XDG_CONFIG_HOME/gitglow/config.yml or ~/.config/gitglow/config.yml
    /// 4. /etc/gitglow/config.yml
    ///
    /// Built-in defaults are used when none of these exist.
    pub async fn load(path: Option<PathBuf>) -> Result<Self> {
        let Some(config_path) = path.or_else(locate_config) else {
            info!("No configuration file found, using defaults");
            let config = Config::default();
            config.validate()?;
            return Ok(Self::new(config, None));
        };

        info!("Loading config from: {}", config_path.display());
        let config = Self::load_config_from_path(&config_path)?;

        Ok(Self::new(config, Some(config_path)))
    }

    pub async fn get(&self) -> tokio::sync::RwLockReadGuard<'_, Config> {
        self.config.read().await
    }

    /// Path the configuration was read from, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn clone_config(&self) -> Config {
        self.config.read().await.clone()
    }

    fn load_config_from_path(path: &Path) -> Result<Config> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML in: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Configuration validation failed for: {}", path.display()))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(content.as_bytes()).unwrap();
        temp_file.flush().unwrap();
        temp_file
    }

    #[tokio::test]
    async fn config_load_valid_yaml() {
        let yaml_content = r#"
version: 1
tick_millis: 500
connectivity_grace_secs: 45
log_level: debug
store_path: /tmp/gitglow-device.yml
watchdog_reset_secs: 120
matrix:
  width: 32
  height: 8
  bar_row: 7
  graph_row_offset: 0
  layout: row-major
notifications:
  capacity: 6
rate_limit:
  ceiling: 1000
  safety_margin: 50
http:
  api_base: "http://localhost:8080"
network:
  interface: eth0
"#;
        let temp_file = create_temp_config(yaml_content);

        let config_manager = ConfigManager::load(Some(temp_file.path().to_path_buf()))
            .await
            .unwrap();
        let config = config_manager.clone_config().await;

        assert_eq!(config_manager.path(), Some(temp_file.path()));
        assert_eq!(config.tick(), Duration::from_millis(500));
        assert_eq!(config.connectivity_grace_secs, 45);
        assert_eq!(config.log_level_filter().unwrap(), LevelFilter::Debug);
        assert_eq!(config.watchdog_reset(), Some(chrono::Duration::seconds(120)));
        assert_eq!(config.matrix.bar_row, 7);
        assert_eq!(config.matrix.layout, MatrixLayout::RowMajor);
        assert_eq!(config.notifications.capacity, 6);
        assert_eq!(config.notifications.ttl_secs, 600);
        assert_eq!(config.rate_limit.ceiling, 1000);
        assert_eq!(config.rate_limit.window_secs, 3600);
        assert_eq!(config.http.api_base, "http://localhost:8080");
        assert_eq!(config.http.timeout_secs, 10);
        assert_eq!(config.network.interface, "eth0");
    }

    #[tokio::test]
    async fn config_minimal_yaml_uses_defaults() {
        let temp_file = create_temp_config("version: 1\n");
        let config = ConfigManager::load(Some(temp_file.path().to_path_buf()))
            .await
            .unwrap()
            .clone_config()
            .await;

        assert_eq!(config, Config::default());
    }

    #[tokio::test]
    async fn config_rejects_unsupported_version() {
        let temp_file = create_temp_config("version: 2\n");
        let result = ConfigManager::load(Some(temp_file.path().to_path_buf())).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn config_missing_explicit_path_fails() {
        let result = ConfigManager::load(Some(PathBuf::from("/nonexistent/gitglow.yml"))).await;
        assert!(result.is_err());
    }

    #[test]
    fn config_default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn config_validate_rejects_short_matrix() {
        let mut config = Config::default();
        config.matrix.height = 7;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("graph rows"));
    }

    #[test]
    fn config_validate_rejects_bar_inside_graph() {
        let mut config = Config::default();
        config.matrix.bar_row = 3;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("overlaps"));
    }

    #[test]
    fn config_validate_rejects_margin_above_ceiling() {
        let mut config = Config::default();
        config.rate_limit.safety_margin = 5000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_validate_rejects_narrow_matrix() {
        let mut config = Config::default();
        config.matrix.width = GRAPH_COLUMNS - 1;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("graph columns"));
    }

    #[test]
    fn config_validate_rejects_margin_that_starves_commits() {
        let mut config = Config::default();
        config.rate_limit.ceiling = 300;
        config.rate_limit.safety_margin = 100;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("largest reserve"));

        config.rate_limit.ceiling = 301;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_validate_rejects_unknown_log_level() {
        let config = Config {
            log_level: "loud".into(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    #[serial]
    async fn config_located_through_env_var() {
        let temp_file = create_temp_config("version: 1\ntick_millis: 250\n");
        // SAFETY: serialised with other env-mutating tests.
        unsafe { env::set_var("GITGLOW_CONFIG", temp_file.path()) };

        let result = ConfigManager::load(None).await;

        unsafe { env::remove_var("GITGLOW_CONFIG") };

        let config = result.unwrap().clone_config().await;
        assert_eq!(config.tick_millis, 250);
    }

    #[tokio::test]
    #[serial]
    async fn config_falls_back_to_defaults_when_nothing_found() {
        let empty_dir = tempfile::TempDir::new().unwrap();
        let saved_xdg = env::var_os("XDG_CONFIG_HOME");
        // SAFETY: serialised with other env-mutating tests.
        unsafe {
            env::remove_var("GITGLOW_CONFIG");
            env::set_var("XDG_CONFIG_HOME", empty_dir.path());
        }

        let result = ConfigManager::load(None).await;

        unsafe {
            match saved_xdg {
                Some(value) => env::set_var("XDG_CONFIG_HOME", value),
                None => env::remove_var("XDG_CONFIG_HOME"),
            }
        }

        // /etc/gitglow/config.yml may exist on a developer machine
        if !Path::new("/etc/gitglow/config.yml").exists() {
            let manager = result.unwrap();
            assert_eq!(manager.path(), None);
            assert_eq!(manager.clone_config().await, Config::default());
        }
    }
}
