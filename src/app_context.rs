//! Platform capabilities owned by the control loop.

use std::sync::Arc;

use crate::{
    http::HttpClient, matrix::MatrixWriter, network::WifiLink, store::ConfigStore,
};

/// One implementation of each collaborator, chosen at startup.
///
/// The state machine owns the context for the life of the process; nothing
/// else holds the matrix or the store.
pub struct DeviceContext {
    pub matrix: Box<dyn MatrixWriter>,
    pub http: Arc<dyn HttpClient>,
    pub store: Box<dyn ConfigStore>,
    pub wifi: Arc<dyn WifiLink>,
}

impl DeviceContext {
    pub fn new(
        matrix: Box<dyn MatrixWriter>,
        http: Arc<dyn HttpClient>,
        store: Box<dyn ConfigStore>,
        wifi: Arc<dyn WifiLink>,
    ) -> Self {
        Self {
            matrix,
            http,
            store,
            wifi,
        }
    }
}
