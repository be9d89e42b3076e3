use std::sync::Arc;

use matrimony_store::{Kv, services::ExpiryReport};
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct AppState {
    /// Backing store, shared with the scheduled jobs.
    pub kv: Arc<dyn Kv>,
    /// Report from the most recent scheduled expiry run.
    pub last_expiry_run: Arc<RwLock<Option<ExpiryReport>>>,
}

impl AppState {
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self {
            kv,
            last_expiry_run: Arc::new(RwLock::new(None)),
        }
    }
}
