//! llama-session: conversational inference sessions over a local LLM.
//!
//! Owns a loaded model's context across conversational turns: chat
//! templating, incremental prompt decode, the sampling loop, cooperative
//! cancellation, and rollback that evicts only the KV cells of the removed
//! turns.
//!
//! All model work runs on one background worker; results reach the caller
//! through callbacks dispatched by an explicit `poll()`.

pub mod config;
pub mod inference;
pub mod pump;
pub mod session;

pub use config::Config;
pub use session::{ConversationController, Role};
