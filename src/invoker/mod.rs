//! External reasoning-agent invocation: process spawning, streamed JSON
//! event parsing, and delta extraction.

pub mod invoker;
pub mod stream;

pub use invoker::{AgentInvoker, AgentProvider, AgentReply, InvokeRequest, TokenCallback};
pub use stream::{AgentEvent, ContentBlock, DeltaTracker, StreamState};
