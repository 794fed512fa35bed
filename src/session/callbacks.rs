//! Observer slots invoked on the foreground thread.
//!
//! Each event kind has one optional slot. Background work never calls a
//! slot directly: it produces [`SessionEvent`]s that travel through the
//! foreground queue and are dispatched here during `poll()`.

use tracing::trace;

use crate::session::error::ErrorCode;
use crate::session::message::Role;
use crate::session::state::ModelState;

/// Why a generation loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum StopReason {
    EndOfGeneration,
    Stopped,
    /// The reply ended with a configured stop sequence.
    StopSequence,
    ContextOverflow,
    DecodeFailure,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GenerationSummary {
    /// Full response text, including everything emitted before a failure.
    pub response: String,
    pub duration_secs: f32,
    pub token_count: usize,
    pub tokens_per_second: f32,
    pub stop_reason: StopReason,
}

/// Everything the background worker reports to the foreground.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ModelLoaded(String),
    ModelUnloaded,
    PromptProcessed {
        tokens: usize,
        role: Role,
        tokens_per_second: f32,
    },
    GenerationStarted,
    Token(String),
    Partial(String),
    GenerationComplete(GenerationSummary),
    ContextReset,
    StateChanged(ModelState),
    Error {
        message: String,
        code: ErrorCode,
    },
}

type Slot<T> = Option<Box<T>>;

/// Named optional observer slots.
#[derive(Default)]
pub struct CallbackSink {
    on_token: Slot<dyn FnMut(&str) + Send>,
    on_partial: Slot<dyn FnMut(&str) + Send>,
    on_prompt_processed: Slot<dyn FnMut(usize, Role, f32) + Send>,
    on_generation_started: Slot<dyn FnMut() + Send>,
    on_generation_complete: Slot<dyn FnMut(&GenerationSummary) + Send>,
    on_model_loaded: Slot<dyn FnMut(&str) + Send>,
    on_model_unloaded: Slot<dyn FnMut() + Send>,
    on_context_reset: Slot<dyn FnMut() + Send>,
    on_state_changed: Slot<dyn FnMut(&ModelState) + Send>,
    on_error: Slot<dyn FnMut(&str, ErrorCode) + Send>,
}

impl CallbackSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_token(&mut self, f: impl FnMut(&str) + Send + 'static) -> &mut Self {
        self.on_token = Some(Box::new(f));
        self
    }

    pub fn on_partial(&mut self, f: impl FnMut(&str) + Send + 'static) -> &mut Self {
        self.on_partial = Some(Box::new(f));
        self
    }

    pub fn on_prompt_processed(
        &mut self,
        f: impl FnMut(usize, Role, f32) + Send + 'static,
    ) -> &mut Self {
        self.on_prompt_processed = Some(Box::new(f));
        self
    }

    pub fn on_generation_started(&mut self, f: impl FnMut() + Send + 'static) -> &mut Self {
        self.on_generation_started = Some(Box::new(f));
        self
    }

    pub fn on_generation_complete(
        &mut self,
        f: impl FnMut(&GenerationSummary) + Send + 'static,
    ) -> &mut Self {
        self.on_generation_complete = Some(Box::new(f));
        self
    }

    pub fn on_model_loaded(&mut self, f: impl FnMut(&str) + Send + 'static) -> &mut Self {
        self.on_model_loaded = Some(Box::new(f));
        self
    }

    pub fn on_model_unloaded(&mut self, f: impl FnMut() + Send + 'static) -> &mut Self {
        self.on_model_unloaded = Some(Box::new(f));
        self
    }

    pub fn on_context_reset(&mut self, f: impl FnMut() + Send + 'static) -> &mut Self {
        self.on_context_reset = Some(Box::new(f));
        self
    }

    pub fn on_state_changed(&mut self, f: impl FnMut(&ModelState) + Send + 'static) -> &mut Self {
        self.on_state_changed = Some(Box::new(f));
        self
    }

    pub fn on_error(&mut self, f: impl FnMut(&str, ErrorCode) + Send + 'static) -> &mut Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Clear every slot.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Invoke the slot for `event`, if one is set.
    pub fn dispatch(&mut self, event: &SessionEvent) {
        trace!(?event, "Dispatching session event");
        match event {
            SessionEvent::ModelLoaded(path) => {
                if let Some(f) = self.on_model_loaded.as_mut() {
                    f(path);
                }
            }
            SessionEvent::ModelUnloaded => {
                if let Some(f) = self.on_model_unloaded.as_mut() {
                    f();
                }
            }
            SessionEvent::PromptProcessed {
                tokens,
                role,
                tokens_per_second,
            } => {
                if let Some(f) = self.on_prompt_processed.as_mut() {
                    f(*tokens, *role, *tokens_per_second);
                }
            }
            SessionEvent::GenerationStarted => {
                if let Some(f) = self.on_generation_started.as_mut() {
                    f();
                }
            }
            SessionEvent::Token(text) => {
                if let Some(f) = self.on_token.as_mut() {
                    f(text);
                }
            }
            SessionEvent::Partial(text) => {
                if let Some(f) = self.on_partial.as_mut() {
                    f(text);
                }
            }
            SessionEvent::GenerationComplete(summary) => {
                if let Some(f) = self.on_generation_complete.as_mut() {
                    f(summary);
                }
            }
            SessionEvent::ContextReset => {
                if let Some(f) = self.on_context_reset.as_mut() {
                    f();
                }
            }
            SessionEvent::StateChanged(state) => {
                if let Some(f) = self.on_state_changed.as_mut() {
                    f(state);
                }
            }
            SessionEvent::Error { message, code } => {
                if let Some(f) = self.on_error.as_mut() {
                    f(message, *code);
                }
            }
        }
    }
}
