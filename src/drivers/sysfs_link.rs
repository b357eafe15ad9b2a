//! [`WifiLink`] for Linux hosts where the OS manages the radio.
//!
//! Link state comes from `<sysfs_root>/<interface>/operstate`. Station
//! association and the setup access point are handled outside this process,
//! so those calls only log.

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info};

use crate::network::WifiLink;

#[derive(Debug, Clone)]
pub struct SysfsLink {
    operstate: PathBuf,
    interface: String,
}

impl SysfsLink {
    pub fn new(sysfs_root: &Path, interface: &str) -> Self {
        Self {
            operstate: sysfs_root.join(interface).join("operstate"),
            interface: interface.to_string(),
        }
    }
}

#[async_trait]
impl WifiLink for SysfsLink {
    async fn connect(&self, ssid: &str, _password: &str) -> Result<()> {
        info!(
            "Station mode for '{ssid}' on {} is managed by the OS",
            self.interface
        );
        Ok(())
    }

    async fn start_access_point(&self, ssid: &str, _password: &str) -> Result<()> {
        info!("Setup access point '{ssid}' requested on {}", self.interface);
        Ok(())
    }

    async fn stop_access_point(&self) -> Result<()> {
        info!("Setup access point on {} stopped", self.interface);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        match tokio::fs::read_to_string(&self.operstate).await {
            Ok(state) => matches!(state.trim(), "up" | "unknown"),
            Err(e) => {
                debug!("Cannot read {}: {e}", self.operstate.display());
                false
            }
        }
    }
}
