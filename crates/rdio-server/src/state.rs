//! Application state management

use crate::controller::Controller;
use rdio_core::Config;
use std::sync::Arc;

/// Shared application state
#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Call pipeline and session registry
    pub controller: Arc<Controller>,
}

impl AppState {
    /// Create new application state around a started or unstarted controller
    #[must_use]
    pub fn new(controller: Arc<Controller>) -> Self {
        Self {
            config: Arc::new(controller.config().clone()),
            controller,
        }
    }
}
