//! Aether loop: a periodic agent runtime.
//!
//! Each tick fetches guidance from a chat-completion endpoint (or a local
//! template bank), derives a thought and occasional task from it, runs
//! side-effect sinks, persists a bounded JSON snapshot, and publishes events
//! to dashboard subscribers.

pub mod actions;
pub mod agent;
pub mod config;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod metrics;
pub mod provider;
pub mod state;
pub mod types;

pub use error::{LoopError, LoopResult};
