//! Streaming chat client for OpenAI-compatible chat-completions endpoints.
//!
//! The core is a line-streaming SSE client: one request goes out through a
//! curl subprocess, response lines are parsed as they arrive, text deltas
//! are accumulated incrementally, and the host receives every fragment plus
//! exactly one terminal outcome over a channel. The terminal front-end in
//! `main.rs` is deliberately thin glue over this.

pub mod accumulate;
pub mod config;
pub mod diag;
pub mod error;
pub mod message;
pub mod session;
pub mod sse;
pub mod transport;

pub use config::{ChatConfig, FileConfig, StreamOptions};
pub use error::ChatError;
pub use message::{Conversation, Message, Role};
pub use session::{ChatSession, SessionEvent, start_session};
pub use transport::{CancelHandle, CurlTransport, Transport};
