use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{info, warn};
use std::sync::Arc;

use crate::{
    app_context::DeviceContext,
    config::Config,
    device_config::DeviceConfig,
    drivers::{ReqwestClient, SysfsLink, VirtualMatrix},
    providers::traits::AsyncProvider,
    store::{ConfigStore, YamlFileStore},
};

/// Builds the host [`DeviceContext`]: virtual matrix, reqwest client,
/// YAML-backed store and a sysfs link monitor.
///
/// An unconfigured store is seeded from `GITGLOW_*` variables unless setup
/// was forced.
pub struct PlatformProvider {
    config: Config,
    force_setup: bool,
}

impl PlatformProvider {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            force_setup: false,
        }
    }

    /// Wipes the device store so the next boot opens the setup portal.
    /// Also skips seeding from the environment.
    pub fn force_setup(mut self, force: bool) -> Self {
        self.force_setup = force;
        self
    }
}

#[async_trait]
impl AsyncProvider<DeviceContext> for PlatformProvider {
    async fn provide(&self) -> Result<DeviceContext> {
        let mut store = YamlFileStore::new(&self.config.store_path);
        if self.force_setup {
            info!("Clearing device configuration at {}", store.path().display());
            store
                .clear()
                .context("Failed to clear device configuration")?;
        } else {
            seed_from_environment(&mut store)?;
        }

        let http = ReqwestClient::new(self.config.http.timeout())?;
        let network = &self.config.network;
        let wifi = SysfsLink::new(&network.sysfs_root, &network.interface);

        Ok(DeviceContext::new(
            Box::new(VirtualMatrix::new(self.config.matrix.layout)),
            Arc::new(http),
            Box::new(store),
            Arc::new(wifi),
        ))
    }
}

fn seed_from_environment(store: &mut dyn ConfigStore) -> Result<()> {
    let candidate = match DeviceConfig::from_environment() {
        Ok(candidate) => candidate,
        Err(e) => {
            warn!("Ignoring GITGLOW_* device settings: {e:#}");
            return Ok(());
        }
    };
    if DeviceConfig::seed(store, &candidate).context("Failed to seed device configuration")? {
        info!("Device configuration seeded from the environment");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_config::DeviceConfig;
    use crate::matrix::MatrixDimensions;
    use crate::testing::complete_device_config;
    use pretty_assertions::assert_eq;
    use serial_test::serial;
    use std::env;
    use tempfile::TempDir;

    const DEVICE_VARS: [(&str, &str); 5] = [
        ("GITGLOW_WIFI_SSID", "envnet"),
        ("GITGLOW_WIFI_PASSWORD", "envpass"),
        ("GITGLOW_GITHUB_TOKEN", "env_token"),
        ("GITGLOW_GITHUB_USERNAME", "envuser"),
        ("GITGLOW_REPOSITORIES", "envuser/one"),
    ];

    fn set_device_vars() {
        // SAFETY: serialised with other env-mutating tests.
        unsafe {
            for (name, value) in DEVICE_VARS {
                env::set_var(name, value);
            }
        }
    }

    fn clear_device_vars() {
        unsafe {
            for (name, _) in DEVICE_VARS {
                env::remove_var(name);
            }
        }
    }

    fn config_in(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.store_path = dir.path().join("device.yml");
        config.network.sysfs_root = dir.path().join("net");
        config
    }

    #[tokio::test]
    async fn context_reads_the_configured_store() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        complete_device_config()
            .save(&mut YamlFileStore::new(&config.store_path))
            .unwrap();

        let mut context = PlatformProvider::new(config).provide().await.unwrap();

        let device = DeviceConfig::load(context.store.as_ref()).unwrap();
        assert_eq!(device, complete_device_config());
        assert!(!context.wifi.is_connected().await);
        context.matrix.init(MatrixDimensions::new(32, 8)).unwrap();
        assert_eq!(context.matrix.dimensions(), MatrixDimensions::new(32, 8));
    }

    #[tokio::test]
    #[serial]
    async fn empty_store_is_seeded_from_the_environment() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);

        set_device_vars();
        let result = PlatformProvider::new(config.clone()).provide().await;
        clear_device_vars();

        let context = result.unwrap();
        let device = DeviceConfig::load(context.store.as_ref()).unwrap();
        assert!(device.is_complete());
        assert_eq!(device.github_username, "envuser");
        assert!(config.store_path.exists());
    }

    #[tokio::test]
    #[serial]
    async fn environment_does_not_override_a_configured_store() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        complete_device_config()
            .save(&mut YamlFileStore::new(&config.store_path))
            .unwrap();

        set_device_vars();
        let result = PlatformProvider::new(config).provide().await;
        clear_device_vars();

        let device = DeviceConfig::load(result.unwrap().store.as_ref()).unwrap();
        assert_eq!(device, complete_device_config());
    }

    #[tokio::test]
    #[serial]
    async fn force_setup_skips_the_environment() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);

        set_device_vars();
        let result = PlatformProvider::new(config.clone()).force_setup(true).provide().await;
        clear_device_vars();

        assert!(!DeviceConfig::load(result.unwrap().store.as_ref()).unwrap().is_complete());
        assert!(!config.store_path.exists());
    }

    #[tokio::test]
    #[serial]
    async fn force_setup_wipes_the_store() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        complete_device_config()
            .save(&mut YamlFileStore::new(&config.store_path))
            .unwrap();

        let context = PlatformProvider::new(config.clone())
            .force_setup(true)
            .provide()
            .await
            .unwrap();

        assert!(!config.store_path.exists());
        assert!(!DeviceConfig::load(context.store.as_ref()).unwrap().is_complete());
    }
}
