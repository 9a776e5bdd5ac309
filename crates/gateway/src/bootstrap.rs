//! Application state construction.

use std::sync::Arc;

use verdant_backends::{CompletionBackend, DedalusBackend, HelperBackend};
use verdant_conversations::ConversationStore;
use verdant_domain::config::{CompletionConfig, Config, TransportKind};

use crate::runtime::conversation_lock::ConversationLockMap;
use crate::state::AppState;

/// Build the shared [`AppState`]: open the conversation store and
/// initialize the configured completion transport.
pub fn build_app_state(config: Arc<Config>) -> anyhow::Result<AppState> {
    let store = Arc::new(ConversationStore::new(&config.conversations.state_dir)?);
    let backend = build_backend(&config.completion);

    Ok(AppState {
        config,
        store,
        backend,
        conversation_locks: Arc::new(ConversationLockMap::new()),
    })
}

/// Initialize the completion transport selected in the config.
///
/// A missing credential does not abort startup: the server runs and
/// answers chat requests with the misconfiguration error, which is far
/// easier to diagnose than a crash loop behind a supervisor.
pub fn build_backend(cfg: &CompletionConfig) -> Option<Arc<dyn CompletionBackend>> {
    match cfg.transport {
        TransportKind::Helper => {
            tracing::info!(command = %cfg.helper.command, "using helper-process completion transport");
            Some(Arc::new(HelperBackend::new(&cfg.helper)))
        }
        TransportKind::Http => {
            let api_key = match cfg.resolve_api_key() {
                Ok(key) => key,
                Err(e) => {
                    tracing::warn!(error = %e, "completion backend unavailable");
                    return None;
                }
            };
            match DedalusBackend::new(cfg, api_key) {
                Ok(backend) => {
                    tracing::info!(base_url = %cfg.base_url, "using HTTP completion transport");
                    Some(Arc::new(backend))
                }
                Err(e) => {
                    tracing::warn!(error = %e, "completion backend init failed");
                    None
                }
            }
        }
    }
}
