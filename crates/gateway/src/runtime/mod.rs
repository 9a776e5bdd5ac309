//! Turn execution runtime: the completion orchestrator, per-conversation
//! locking, token relay, and cancellation.

pub mod cancel;
pub mod conversation_lock;
pub mod relay;
pub mod turn;

pub use cancel::CancelToken;
pub use conversation_lock::{ConversationLockGuard, ConversationLockMap};
pub use turn::{run_turn, TurnInput};
