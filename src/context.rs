use crate::config::AppConfig;
use crate::core::ProgressRegistry;
use crate::core::notifications::{self, CompletionNotifier};
use std::sync::Arc;

/// Everything the upload server shares between requests.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub registry: ProgressRegistry,
    pub notifier: Option<Arc<dyn CompletionNotifier>>,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Self {
        let notifier = notifications::create_notifier(&config.notify);
        Self {
            config: Arc::new(config),
            registry: ProgressRegistry::new(),
            notifier,
        }
    }
}
