//! Conversation persistence for Verdant.
//!
//! One JSON bundle file per conversation id under the configured state
//! directory: title metadata, the last model used, and the ordered message
//! history. Writes are atomic (temp file + rename) so a crashed turn never
//! leaves a half-written bundle behind.

pub mod bundle;
pub mod store;

pub use bundle::{
    default_conversation_title, normalize_conversation_title, ConversationBundle,
    ConversationMeta, ModelRecord, StoredMessage,
};
pub use store::ConversationStore;
