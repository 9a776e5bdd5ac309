use std::sync::Arc;

use verdant_backends::CompletionBackend;
use verdant_conversations::ConversationStore;
use verdant_domain::config::Config;
use verdant_domain::error::{Error, Result};

use crate::runtime::conversation_lock::ConversationLockMap;

/// Shared application state passed to all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Durable conversation bundle store.
    pub store: Arc<ConversationStore>,
    /// The configured completion transport. `None` when the backend could
    /// not be initialized at startup (missing credential) — the server
    /// still starts so operators get actionable errors over HTTP instead
    /// of a crash loop.
    pub backend: Option<Arc<dyn CompletionBackend>>,
    /// Per-conversation turn serialization.
    pub conversation_locks: Arc<ConversationLockMap>,
}

impl AppState {
    /// The completion backend, or the `Misconfigured` error explaining
    /// why it is unavailable.
    pub fn backend(&self) -> Result<Arc<dyn CompletionBackend>> {
        match &self.backend {
            Some(backend) => Ok(backend.clone()),
            None => {
                // Re-derive the startup failure: the credential check
                // produces the same operator-facing message it did then.
                self.config.completion.resolve_api_key()?;
                Err(Error::Misconfigured(
                    "The completion backend failed to initialize. \
                     Check the gateway logs and restart."
                        .into(),
                ))
            }
        }
    }
}
