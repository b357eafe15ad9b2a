//! WiFi link capability.

use anyhow::Result;
use async_trait::async_trait;

/// Radio control used by the setup flow and connectivity checks.
///
/// # Implementations
/// - [`SysfsLink`](crate::drivers::sysfs_link::SysfsLink): reads interface
///   state from sysfs; station association is left to the OS.
#[async_trait]
pub trait WifiLink: Send + Sync {
    /// Joins the given network in station mode.
    async fn connect(&self, ssid: &str, password: &str) -> Result<()>;

    /// Starts the setup access point.
    async fn start_access_point(&self, ssid: &str, password: &str) -> Result<()>;

    async fn stop_access_point(&self) -> Result<()>;

    /// Whether the station link is currently up.
    async fn is_connected(&self) -> bool;
}
