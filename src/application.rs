//! Application entry point and builder.

use crate::{
    app_context::DeviceContext,
    config::ConfigManager,
    coordinator::SystemCoordinator,
    providers::{AsyncProvider, PlatformProvider},
};
use anyhow::{Context, Result, anyhow};

/// The whole daemon: platform capabilities, services and control loop.
///
/// # Example
///
/// ```no_run
/// use gitglow::application::Application;
/// use gitglow::config::ConfigManager;
///
/// # async fn example() -> anyhow::Result<()> {
/// let config_manager = ConfigManager::load(None).await?;
/// let mut app = Application::builder()
///     .with_config_manager(config_manager)
///     .build()
///     .await?;
///
/// app.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Application {
    pub coordinator: SystemCoordinator,
    config_manager: ConfigManager,
    context: Option<DeviceContext>,
}

impl Application {
    pub fn builder() -> ApplicationBuilder {
        ApplicationBuilder::new()
    }

    /// Initializes, starts services and runs the control loop until Ctrl+C.
    pub async fn run(&mut self) -> Result<()> {
        let context = self
            .context
            .take()
            .ok_or_else(|| anyhow!("Application has already run"))?;

        self.coordinator
            .initialize(self.config_manager.clone(), context)
            .await?;
        self.coordinator.start_all_services().await?;
        self.coordinator.run_main_loop().await
    }
}

pub struct ApplicationBuilder {
    config_manager: Option<ConfigManager>,
    platform: Option<DeviceContext>,
    force_setup: bool,
}

impl ApplicationBuilder {
    fn new() -> Self {
        Self {
            config_manager: None,
            platform: None,
            force_setup: false,
        }
    }

    pub fn with_config_manager(mut self, config_manager: ConfigManager) -> Self {
        self.config_manager = Some(config_manager);
        self
    }

    /// Uses the given capabilities instead of the host drivers.
    pub fn with_platform(mut self, context: DeviceContext) -> Self {
        self.platform = Some(context);
        self
    }

    /// Clears the device store before boot. Only applies to the host
    /// platform.
    pub fn force_setup(mut self, force: bool) -> Self {
        self.force_setup = force;
        self
    }

    pub async fn build(self) -> Result<Application> {
        let config_manager = self
            .config_manager
            .ok_or_else(|| anyhow!("Configuration manager is required"))?;

        let context = match self.platform {
            Some(context) => context,
            None => PlatformProvider::new(config_manager.clone_config().await)
                .force_setup(self.force_setup)
                .provide()
                .await
                .context("Failed to set up host platform")?,
        };

        Ok(Application {
            coordinator: SystemCoordinator::new(),
            config_manager,
            context: Some(context),
        })
    }
}
