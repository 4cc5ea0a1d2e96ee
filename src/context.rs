use std::sync::Arc;
use tokio_rusqlite::Connection;

use crate::config::AppConfig;
use crate::core::ProgressTracker;
use crate::core::remote::RemoteConnector;
use crate::core::session::SessionManager;

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub db: Connection,
    pub progress: ProgressTracker,
    pub sessions: Arc<SessionManager>,
}

impl AppContext {
    pub fn new(config: AppConfig, db: Connection, connector: Arc<dyn RemoteConnector>) -> Self {
        let sessions = SessionManager::new(connector, config.session_settings());
        Self {
            config: Arc::new(config),
            db,
            progress: ProgressTracker::new(),
            sessions: Arc::new(sessions),
        }
    }
}
