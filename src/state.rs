use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::config::AppConfig;
use crate::session::SessionStore;

pub struct AppState {
    pub limiter: Arc<Semaphore>,
    pub sessions: Arc<SessionStore>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            limiter: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
            sessions: Arc::new(SessionStore::default()),
            config: Arc::new(config),
        }
    }
}
