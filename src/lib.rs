//! Agent Relay — orchestration kernel routing conversational work to an
//! external reasoning-agent process.

pub mod config;
pub mod delivery;
pub mod error;
pub mod invoker;
pub mod queue;
pub mod scheduler;
pub mod store;
