//! Conversational session management.
//!
//! - [`message`]: Roles and turns
//! - [`state`]: Rendered history, committed offset, snapshots
//! - [`conversation`]: Background state machine and generation loop
//! - [`controller`]: Foreground API
//! - [`callbacks`]: Observer slots and session events
//! - [`partials`]: Sentence-level partial splitting
//! - [`error`]: Error taxonomy

pub mod callbacks;
pub mod controller;
pub mod conversation;
pub mod error;
pub mod message;
pub mod partials;
pub mod state;

pub use callbacks::{CallbackSink, GenerationSummary, SessionEvent, StopReason};
pub use controller::ConversationController;
pub use conversation::{ConversationCore, SessionFlags};
pub use error::{ErrorCode, SessionError};
pub use message::{Message, Role};
pub use state::{ModelLifecycle, ModelState, SessionState};
