//! # gitglow
//!
//! Renders a GitHub user's contribution heat-map and pull request activity
//! on a small LED matrix.
//!
//! ## Architecture
//!
//! - [`AppStateMachine`](state_machine::AppStateMachine) sequences boot,
//!   WiFi setup and the steady sync/render cycle. It is driven by one
//!   control loop in [`SystemCoordinator`](coordinator::SystemCoordinator).
//! - [`GitHubSyncEngine`](sync::GitHubSyncEngine) polls commits, pull
//!   requests and review comments on independent schedules, staying inside
//!   the API quota through the [`RateLimiter`](rate_limiter::RateLimiter).
//! - [`ContributionRenderer`](render::ContributionRenderer) and
//!   [`NotificationBar`](notification::NotificationBar) turn that data into
//!   pixels for a [`MatrixWriter`](matrix::MatrixWriter).
//! - Hardware, HTTP, storage and WiFi are reached through traits; host
//!   implementations live in [`drivers`].
//!
//! ## Example
//!
//! ```no_run
//! use gitglow::{application::Application, config::ConfigManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config_manager = ConfigManager::load(None).await?;
//!     Application::builder()
//!         .with_config_manager(config_manager)
//!         .build()
//!         .await?
//!         .run()
//!         .await
//! }
//! ```

pub mod app_context;
pub mod application;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod device_config;
pub mod drivers;
pub mod event;
pub mod graph;
pub mod http;
pub mod matrix;
pub mod network;
pub mod notification;
pub mod providers;
pub mod rate_limiter;
pub mod render;
pub mod state_machine;
pub mod store;
pub mod sync;
pub mod task_manager;

#[cfg(test)]
pub(crate) mod testing;
