//! Kubernetes controllers for watched resources

pub mod httproute;
pub mod retry;

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::OperatorConfig;
use crate::resources::{Gateway, HTTPRoute};
use crate::store::ResourceStore;

use self::retry::RetryTracker;

/// Shared state for the HTTPRoute controller
pub struct ControllerContext {
    /// HTTPRoute reads and finalizer/annotation writes
    pub routes: Arc<dyn ResourceStore<HTTPRoute>>,
    /// Gateway reads and writes
    pub gateways: Arc<dyn ResourceStore<Gateway>>,
    /// Operator configuration
    pub config: Arc<OperatorConfig>,
    /// Redelivery attempts per route
    pub retry_tracker: Arc<RetryTracker>,
    /// Held for the whole of each reconciliation
    serial: Mutex<()>,
}

impl ControllerContext {
    pub fn new(
        routes: Arc<dyn ResourceStore<HTTPRoute>>,
        gateways: Arc<dyn ResourceStore<Gateway>>,
        config: Arc<OperatorConfig>,
    ) -> Self {
        Self {
            routes,
            gateways,
            config,
            retry_tracker: Arc::new(RetryTracker::new()),
            serial: Mutex::new(()),
        }
    }
}
