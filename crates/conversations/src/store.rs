//! Durable conversation store.
//!
//! One `<id>.json` bundle per conversation under the state directory, with
//! an in-memory write-through cache so reads never hit disk after the first
//! load. All disk writes go through a temp-file-plus-rename so readers never
//! observe a torn bundle, and the async wrappers push file I/O onto blocking
//! threads.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use verdant_domain::error::{Error, Result};

use crate::bundle::ConversationBundle;

/// JSON-file-backed conversation store.
pub struct ConversationStore {
    base_dir: PathBuf,
    cache: RwLock<HashMap<String, ConversationBundle>>,
}

impl ConversationStore {
    /// Open the store rooted at `base_dir`, creating the directory if needed.
    pub fn new(base_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(base_dir).map_err(Error::Io)?;

        tracing::info!(path = %base_dir.display(), "conversation store opened");

        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Validate a caller-supplied conversation id.
    ///
    /// Ids name files on disk, so only `[A-Za-z0-9_-]` is accepted. Returns
    /// the trimmed id.
    pub fn sanitize_id(raw: &str) -> Result<&str> {
        let id = raw.trim();
        if id.is_empty()
            || !id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        {
            return Err(Error::BadRequest(
                "conversationId must be non-empty and contain only letters, digits, \
                 '-' or '_'."
                    .into(),
            ));
        }
        Ok(id)
    }

    /// Whether a conversation exists (in cache or on disk).
    pub fn exists(&self, id: &str) -> bool {
        self.cache.read().contains_key(id) || self.bundle_path(id).exists()
    }

    /// Load a conversation bundle. Returns `NotFound` when no bundle exists.
    pub fn load(&self, id: &str) -> Result<ConversationBundle> {
        // Fast path: return from cache.
        {
            let cache = self.cache.read();
            if let Some(bundle) = cache.get(id) {
                return Ok(bundle.clone());
            }
        }

        // Slow path: load from disk and populate cache.
        let bundle = read_bundle_file(&self.bundle_path(id), id)?;
        self.cache.write().insert(id.to_owned(), bundle.clone());
        Ok(bundle)
    }

    /// Load a conversation bundle (async). Cache hit stays on the runtime;
    /// a miss reads from disk on a blocking thread.
    pub async fn load_async(&self, id: &str) -> Result<ConversationBundle> {
        {
            let cache = self.cache.read();
            if let Some(bundle) = cache.get(id) {
                return Ok(bundle.clone());
            }
        }

        let path = self.bundle_path(id);
        let bundle_id = id.to_owned();
        let bundle = tokio::task::spawn_blocking(move || read_bundle_file(&path, &bundle_id))
            .await
            .map_err(|e| Error::Other(format!("spawn_blocking join: {e}")))??;

        self.cache.write().insert(id.to_owned(), bundle.clone());
        Ok(bundle)
    }

    /// Record the latest user prompt before streaming begins.
    ///
    /// Appends the user message unless it duplicates the last stored user
    /// message (a client retry after a failed turn), stamps the model and
    /// `updated_at`, normalizes the title, and persists the bundle. Returns
    /// the updated bundle for request building.
    pub async fn snapshot_prompt(
        &self,
        id: &str,
        user_message: &str,
        model: &str,
    ) -> Result<ConversationBundle> {
        let mut bundle = self.load_async(id).await?;
        bundle.push_user_unless_duplicate(user_message);
        bundle.touch(model);
        self.persist(id, bundle.clone()).await?;
        Ok(bundle)
    }

    /// Append a finished assistant completion and persist.
    pub async fn append_assistant(&self, id: &str, text: &str, model: &str) -> Result<()> {
        let mut bundle = self.load_async(id).await?;
        bundle
            .messages
            .messages
            .push(crate::bundle::StoredMessage::assistant(text));
        bundle.touch(model);
        self.persist(id, bundle).await
    }

    /// Re-stamp the model record, e.g. after a turn recovered on a
    /// non-primary candidate.
    pub async fn record_model(&self, id: &str, model: &str) -> Result<()> {
        let mut bundle = self.load_async(id).await?;
        if bundle.model.name == model {
            return Ok(());
        }
        bundle.touch(model);
        self.persist(id, bundle).await
    }

    /// On-disk path of the conversation's JSON bundle. The helper transport
    /// receives this path so it can read the same file the store writes.
    pub fn bundle_path(&self, id: &str) -> PathBuf {
        self.base_dir.join(format!("{id}.json"))
    }

    // ── Private helpers ───────────────────────────────────────────────

    /// Write through to disk first, then update the cache, so a failed write
    /// never leaves the cache ahead of the file.
    async fn persist(&self, id: &str, bundle: ConversationBundle) -> Result<()> {
        let json = serde_json::to_string_pretty(&bundle)
            .map_err(|e| Error::Other(format!("serializing conversation bundle: {e}")))?;
        let path = self.bundle_path(id);

        tokio::task::spawn_blocking(move || write_atomic(&path, &json))
            .await
            .map_err(|e| Error::Other(format!("spawn_blocking join: {e}")))??;

        self.cache.write().insert(id.to_owned(), bundle);
        Ok(())
    }
}

/// Read and parse a bundle file. A missing file is `NotFound`.
fn read_bundle_file(path: &Path, id: &str) -> Result<ConversationBundle> {
    if !path.exists() {
        return Err(Error::NotFound(id.to_owned()));
    }
    let raw = std::fs::read_to_string(path).map_err(Error::Io)?;
    let mut bundle: ConversationBundle = serde_json::from_str(&raw)
        .map_err(|e| Error::Other(format!("parsing conversation bundle {id}: {e}")))?;
    if bundle.conversation.id.is_empty() {
        bundle.conversation.id = id.to_owned();
    }
    if bundle.conversation.name.is_empty() {
        bundle.conversation.name = crate::bundle::default_conversation_title(id);
    }
    Ok(bundle)
}

/// Write `contents` to `path` atomically via a sibling temp file and rename.
fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Other(format!("invalid bundle path: {}", path.display())))?;
    let temp_path = path.with_file_name(format!(
        ".{file_name}.{}.{}.tmp",
        std::process::id(),
        uuid::Uuid::new_v4().simple()
    ));

    std::fs::write(&temp_path, contents).map_err(Error::Io)?;
    if let Err(e) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(Error::Io(e));
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::StoredMessage;

    fn seeded_store(id: &str) -> (tempfile::TempDir, ConversationStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path()).unwrap();
        let bundle = ConversationBundle::new(id);
        let json = serde_json::to_string_pretty(&bundle).unwrap();
        std::fs::write(dir.path().join(format!("{id}.json")), json).unwrap();
        (dir, store)
    }

    #[test]
    fn sanitize_accepts_safe_ids() {
        assert_eq!(
            ConversationStore::sanitize_id(" conversation1 ").unwrap(),
            "conversation1"
        );
        assert_eq!(
            ConversationStore::sanitize_id("weekly_sync-2").unwrap(),
            "weekly_sync-2"
        );
    }

    #[test]
    fn sanitize_rejects_traversal_and_empty() {
        assert!(ConversationStore::sanitize_id("").is_err());
        assert!(ConversationStore::sanitize_id("   ").is_err());
        assert!(ConversationStore::sanitize_id("../etc/passwd").is_err());
        assert!(ConversationStore::sanitize_id("a/b").is_err());
        assert!(ConversationStore::sanitize_id("a b").is_err());
    }

    #[tokio::test]
    async fn missing_conversation_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path()).unwrap();
        let err = store.load_async("conversation9").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn snapshot_appends_user_and_stamps_model() {
        let (_dir, store) = seeded_store("conversation1");

        let bundle = store
            .snapshot_prompt("conversation1", "hello there", "anthropic/claude-opus-4-5")
            .await
            .unwrap();
        assert_eq!(bundle.messages.messages.len(), 1);
        assert_eq!(bundle.messages.messages[0].role, "user");
        assert_eq!(bundle.model.name, "anthropic/claude-opus-4-5");
        assert_eq!(bundle.conversation.name, "Conversation 1");

        // Retrying the same prompt does not double the user message.
        let bundle = store
            .snapshot_prompt("conversation1", "hello there", "anthropic/claude-opus-4-5")
            .await
            .unwrap();
        assert_eq!(bundle.messages.messages.len(), 1);
    }

    #[tokio::test]
    async fn append_assistant_persists_to_disk() {
        let (dir, store) = seeded_store("conversation1");

        store
            .snapshot_prompt("conversation1", "hi", "openai/gpt-4o")
            .await
            .unwrap();
        store
            .append_assistant("conversation1", "Hi there", "openai/gpt-4o")
            .await
            .unwrap();

        // Fresh store instance forces a disk read.
        let fresh = ConversationStore::new(dir.path()).unwrap();
        let bundle = fresh.load("conversation1").unwrap();
        let roles: Vec<&str> = bundle
            .messages
            .messages
            .iter()
            .map(|m| m.role.as_str())
            .collect();
        assert_eq!(roles, vec!["user", "assistant"]);
        assert_eq!(bundle.messages.messages[1].text, "Hi there");
    }

    #[tokio::test]
    async fn record_model_skips_noop_writes() {
        let (_dir, store) = seeded_store("conversation1");
        store
            .snapshot_prompt("conversation1", "hi", "openai/gpt-4o")
            .await
            .unwrap();
        let before = store.load("conversation1").unwrap().conversation.updated_at;
        store
            .record_model("conversation1", "openai/gpt-4o")
            .await
            .unwrap();
        let after = store.load("conversation1").unwrap().conversation.updated_at;
        assert_eq!(before, after);

        store
            .record_model("conversation1", "anthropic/claude-sonnet-4-5")
            .await
            .unwrap();
        let bundle = store.load("conversation1").unwrap();
        assert_eq!(bundle.model.name, "anthropic/claude-sonnet-4-5");
    }

    #[tokio::test]
    async fn corrupt_history_entries_survive_reload() {
        let (dir, store) = seeded_store("conversation1");
        drop(store);

        // Bundles written by other tooling may carry extra roles.
        std::fs::write(
            dir.path().join("conversation1.json"),
            r#"{
                "conversation": {"id": "conversation1", "name": ""},
                "messages": {"messages": [
                    {"role": "tool", "text": "ignored"},
                    {"role": "user", "text": "hi"}
                ]}
            }"#,
        )
        .unwrap();

        let store = ConversationStore::new(dir.path()).unwrap();
        let bundle = store.load("conversation1").unwrap();
        assert_eq!(bundle.conversation.name, "Conversation 1");
        assert_eq!(bundle.history().count(), 1);
        assert!(bundle
            .messages
            .messages
            .iter()
            .any(|m| { m.role == "tool" }));
    }

    #[test]
    fn atomic_write_replaces_without_temp_residue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conversation1.json");
        write_atomic(&path, "{\"a\":1}").unwrap();
        write_atomic(&path, "{\"a\":2}").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"a\":2}");
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn push_then_filter_preserves_order() {
        let (_dir, store) = seeded_store("conversation1");
        let mut bundle = store.load("conversation1").unwrap();
        bundle.messages.messages.push(StoredMessage::user("one"));
        bundle
            .messages
            .messages
            .push(StoredMessage::assistant("two"));
        let texts: Vec<&str> = bundle.history().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "two"]);
    }
}
