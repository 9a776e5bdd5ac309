//! Conversation bundle shape.
//!
//! The on-disk JSON format is tolerant to partially-populated files: every
//! section defaults individually, so a hand-edited or older bundle still
//! loads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// System prompt used when a conversation does not carry its own.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Verdant, an eco-conscious AI assistant. You are knowledgeable, helpful, and thoughtful.\n\
You have a warm, grounded personality inspired by nature and sustainability.\n\
When appropriate, you weave in eco-friendly perspectives without being preachy.\n\
You provide clear, well-structured responses with practical advice.\n\
You are capable of helping with coding, writing, analysis, brainstorming, and any general knowledge questions.\n\
Always be concise yet thorough. Use markdown formatting when it helps clarity.";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bundle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One conversation's durable state: title metadata, last model used, and
/// the ordered message history.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConversationBundle {
    #[serde(default)]
    pub conversation: ConversationMeta,
    #[serde(default)]
    pub model: ModelRecord,
    #[serde(default)]
    pub messages: MessageLog,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConversationMeta {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

/// The backend/model pair last used for this conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRecord {
    #[serde(default = "d_model_kind")]
    pub kind: String,
    #[serde(default)]
    pub name: String,
}

impl Default for ModelRecord {
    fn default() -> Self {
        Self {
            kind: d_model_kind(),
            name: String::new(),
        }
    }
}

/// Nested container kept for on-disk compatibility with existing bundles.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MessageLog {
    #[serde(default)]
    pub messages: Vec<StoredMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: String,
    pub text: String,
}

impl StoredMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            text: text.into(),
        }
    }
}

impl ConversationBundle {
    /// A fresh bundle for a conversation id with the default title.
    pub fn new(id: &str) -> Self {
        Self {
            conversation: ConversationMeta {
                id: id.to_owned(),
                name: default_conversation_title(id),
                updated_at: Utc::now(),
            },
            ..Default::default()
        }
    }

    /// The effective system prompt: the bundle's own when non-blank, else
    /// the default persona.
    pub fn system_prompt(&self) -> &str {
        match self.system_prompt.as_deref().map(str::trim) {
            Some(custom) if !custom.is_empty() => custom,
            _ => DEFAULT_SYSTEM_PROMPT,
        }
    }

    /// History entries usable as chat context: known role, non-blank text,
    /// original order.
    pub fn history(&self) -> impl Iterator<Item = &StoredMessage> {
        self.messages.messages.iter().filter(|m| {
            matches!(m.role.as_str(), "user" | "assistant" | "system")
                && !m.text.trim().is_empty()
        })
    }

    /// Append the latest user message unless it exactly duplicates the last
    /// stored user message (a retried request after a failed turn).
    /// Returns whether a message was appended.
    pub fn push_user_unless_duplicate(&mut self, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() {
            return false;
        }
        if let Some(last) = self.messages.messages.last() {
            if last.role == "user" && last.text.trim() == text {
                return false;
            }
        }
        self.messages.messages.push(StoredMessage::user(text));
        true
    }

    /// Stamp the model record and `updated_at`, and normalize the title.
    pub fn touch(&mut self, model: &str) {
        self.model.name = model.to_owned();
        self.conversation.name =
            normalize_conversation_title(&self.conversation.name, &self.conversation.id);
        self.conversation.updated_at = Utc::now();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Title normalization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Human-readable default title for a conversation id.
///
/// Ids of the form `conversation<N>` become `Conversation N`; anything else
/// is used verbatim.
pub fn default_conversation_title(conversation_id: &str) -> String {
    match conversation_number(conversation_id) {
        Some(n) => format!("Conversation {n}"),
        None => conversation_id.to_owned(),
    }
}

/// Normalize a stored title: blank titles fall back to the id-derived
/// default, and raw `conversation<N>` titles are prettified the same way.
pub fn normalize_conversation_title(raw_name: &str, conversation_id: &str) -> String {
    let trimmed = raw_name.trim();
    if trimmed.is_empty() {
        return default_conversation_title(conversation_id);
    }
    match conversation_number(trimmed) {
        Some(n) => format!("Conversation {n}"),
        None => trimmed.to_owned(),
    }
}

fn conversation_number(value: &str) -> Option<u64> {
    let digits = value
        .strip_prefix("conversation")
        .or_else(|| value.strip_prefix("Conversation"))
        .or_else(|| value.strip_prefix("CONVERSATION"))?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn d_model_kind() -> String {
    "dedalus".into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
