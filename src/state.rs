use std::sync::Arc;

use crate::config::Config;
use crate::ice::IceProvider;
use crate::registry::Registry;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<Registry>,
    pub ice: Arc<IceProvider>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let ice = IceProvider::from_config(&config);
        let registry = Registry::new(config.chat_history_limit);

        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            ice: Arc::new(ice),
        }
    }
}
