//! Providers: how the daemon builds its platform and starts its services.

pub mod config_watcher;
pub mod platform;
pub mod traits;

pub use config_watcher::ConfigWatcherServiceProvider;
pub use platform::PlatformProvider;
pub use traits::{AsyncProvider, ServiceProvider};
