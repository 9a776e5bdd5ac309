use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Completion backend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Values that count as "not actually configured" when found in the API key
/// environment variable.  Fresh deployments often ship a `.env` template with
/// one of these still in place.
const PLACEHOLDER_KEYS: &[&str] = &[
    "changeme",
    "your-api-key",
    "your_api_key",
    "your-api-key-here",
    "placeholder",
    "xxx",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    /// Environment variable holding the backend API key. The config file
    /// stores the variable *name*, never the secret itself.
    #[serde(default = "d_api_key_env")]
    pub api_key_env: String,
    /// Base URL of the OpenAI-compatible completion API.
    #[serde(default = "d_base_url")]
    pub base_url: String,
    /// Model used when the caller does not request one (or requests one that
    /// is not on the allow-list).
    #[serde(default = "d_default_model")]
    pub default_model: String,
    /// Reliable fallback model tried before the default during failover.
    #[serde(default = "d_fallback_model")]
    pub fallback_model: String,
    /// Models callers may request. Requests for anything else fall back to
    /// the default model.
    #[serde(default = "d_allowed_models")]
    pub allowed_models: Vec<String>,
    /// When true, exhaust a candidate chain of models on retryable failures;
    /// when false, only the requested-or-default model is attempted, once.
    #[serde(default = "d_true")]
    pub failover: bool,
    /// Log an info line when a turn recovers on a non-primary candidate.
    #[serde(default)]
    pub log_recovery: bool,
    /// Per-attempt request timeout.
    #[serde(default = "d_300000")]
    pub request_timeout_ms: u64,
    /// Base delay between retries of the same candidate; attempt `n` waits
    /// `n * backoff_ms` (linear).
    #[serde(default = "d_500")]
    pub backoff_ms: u64,
    /// Which transport invokes the backend.
    #[serde(default)]
    pub transport: TransportKind,
    /// Helper-process transport settings (used when `transport = "helper"`).
    #[serde(default)]
    pub helper: HelperConfig,
    /// Delivery pacing for the token relay.
    #[serde(default)]
    pub stream: StreamTuning,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            api_key_env: d_api_key_env(),
            base_url: d_base_url(),
            default_model: d_default_model(),
            fallback_model: d_fallback_model(),
            allowed_models: d_allowed_models(),
            failover: true,
            log_recovery: false,
            request_timeout_ms: 300_000,
            backoff_ms: 500,
            transport: TransportKind::default(),
            helper: HelperConfig::default(),
            stream: StreamTuning::default(),
        }
    }
}

impl CompletionConfig {
    /// Maximum tries per candidate model: 2 with failover, 1 without.
    pub fn max_tries(&self) -> u32 {
        if self.failover {
            2
        } else {
            1
        }
    }

    /// Resolve the API key from the configured environment variable.
    ///
    /// Missing, empty, and template-placeholder values all map to
    /// [`Error::Misconfigured`] with operator-actionable guidance.
    pub fn resolve_api_key(&self) -> Result<String> {
        let value = std::env::var(&self.api_key_env).unwrap_or_default();
        let trimmed = value.trim();
        if trimmed.is_empty() || is_placeholder_key(trimmed) {
            return Err(Error::Misconfigured(format!(
                "The {} environment variable is not configured. \
                 Set it to a valid API key and restart the gateway.",
                self.api_key_env
            )));
        }
        Ok(trimmed.to_string())
    }

    /// Build the ordered candidate model chain for one turn.
    ///
    /// With failover enabled: requested model (if on the allow-list), then
    /// the reliable fallback, then the default — deduplicated, priority
    /// order preserved. With failover disabled: just the requested-or-default
    /// model. Blank model names never enter the chain, so the result is
    /// empty when the configured models are all blank.
    pub fn candidate_models(&self, requested: Option<&str>) -> Vec<String> {
        let requested = requested
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .filter(|m| self.allowed_models.iter().any(|a| a == m));

        if !self.failover {
            let model = requested.unwrap_or(&self.default_model).trim();
            return if model.is_empty() {
                Vec::new()
            } else {
                vec![model.to_string()]
            };
        }

        let mut chain: Vec<String> = Vec::with_capacity(3);
        for candidate in requested
            .into_iter()
            .chain([self.fallback_model.as_str(), self.default_model.as_str()])
        {
            if !candidate.is_empty() && !chain.iter().any(|c| c == candidate) {
                chain.push(candidate.to_string());
            }
        }
        chain
    }
}

fn is_placeholder_key(value: &str) -> bool {
    PLACEHOLDER_KEYS
        .iter()
        .any(|p| value.eq_ignore_ascii_case(p))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transport selection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Direct HTTP SSE streaming against the completion API.
    #[default]
    Http,
    /// Spawn a local helper process that emits newline-delimited JSON events.
    Helper,
}

/// Helper-process transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelperConfig {
    /// Executable to spawn (e.g. `python3`).
    #[serde(default = "d_helper_command")]
    pub command: String,
    /// Leading arguments (e.g. the script path). The adapter appends
    /// `--message`, `--conversation-json-path`, `--conversation-id`, and
    /// `--model` per invocation.
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            command: d_helper_command(),
            args: Vec::new(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream pacing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Delivery pacing for the token relay. Affects perceived typing speed only;
/// the logical content and fragment order never change.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StreamTuning {
    /// Fragments coalesced into one `text-delta` write.
    #[serde(default = "d_4")]
    pub delta_batch_size: usize,
    /// Pause between `text-delta` writes, in milliseconds.
    #[serde(default = "d_10")]
    pub delta_delay_ms: u64,
}

impl Default for StreamTuning {
    fn default() -> Self {
        Self {
            delta_batch_size: 4,
            delta_delay_ms: 10,
        }
    }
}

impl StreamTuning {
    pub const MAX_BATCH_SIZE: usize = 64;
    pub const MAX_DELAY_MS: u64 = 250;

    /// Clamp the tunables to their safe ranges.
    pub fn clamped(self) -> Self {
        Self {
            delta_batch_size: self.delta_batch_size.clamp(1, Self::MAX_BATCH_SIZE),
            delta_delay_ms: self.delta_delay_ms.min(Self::MAX_DELAY_MS),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_api_key_env() -> String {
    "DEDALUS_API_KEY".into()
}
fn d_base_url() -> String {
    "https://api.dedaluslabs.ai/v1".into()
}
fn d_default_model() -> String {
    "anthropic/claude-opus-4-5".into()
}
fn d_fallback_model() -> String {
    "anthropic/claude-sonnet-4-5".into()
}
fn d_allowed_models() -> Vec<String> {
    vec![
        "anthropic/claude-opus-4-5".into(),
        "anthropic/claude-sonnet-4-5".into(),
        "openai/gpt-4o".into(),
        "openai/gpt-4o-mini".into(),
    ]
}
fn d_helper_command() -> String {
    "python3".into()
}
fn d_true() -> bool {
    true
}
fn d_300000() -> u64 {
    300_000
}
fn d_500() -> u64 {
    500
}
fn d_4() -> usize {
    4
}
fn d_10() -> u64 {
    10
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
