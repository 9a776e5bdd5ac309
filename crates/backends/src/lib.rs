//! Completion backend adapters.
//!
//! Two transports implement the same [`CompletionBackend`] contract:
//! - [`dedalus::DedalusBackend`] talks to the OpenAI-compatible Dedalus API
//!   over HTTP, streaming via SSE.
//! - [`helper::HelperBackend`] spawns a local helper process and reads
//!   newline-delimited JSON events from its stdout.

pub mod dedalus;
pub mod helper;
mod sse;
pub mod traits;
mod util;

pub use dedalus::DedalusBackend;
pub use helper::HelperBackend;
pub use traits::{Completion, CompletionBackend, CompletionRequest, WireMessage};
