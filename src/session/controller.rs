//! Foreground facade over a background conversation.
//!
//! [`ConversationController`] is what an embedder holds. It validates calls
//! synchronously, queues the real work on a [`TaskPump`] whose worker owns
//! the [`ConversationCore`], and dispatches the resulting events to the
//! [`CallbackSink`] whenever [`ConversationController::poll`] is called.
//!
//! Generation is cancelled cooperatively: [`ConversationController::stop_generation`]
//! only raises a flag that the generation loop checks once per token, so
//! one more token may still arrive after the call returns.

use std::io;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::inference::llama_ffi::{ChatMessageRef, LlamaBackend};
use crate::pump::{TaskId, TaskPump};
use crate::session::callbacks::{CallbackSink, SessionEvent};
use crate::session::conversation::{ConversationCore, SessionFlags};
use crate::session::error::SessionError;
use crate::session::message::{Message, Role};
use crate::session::state::ModelState;

const WORKER_THREAD_NAME: &str = "llama-session-worker";

/// Foreground-owned state: observer slots plus the last published snapshot.
#[derive(Default)]
pub struct Foreground {
    callbacks: CallbackSink,
    state: ModelState,
}

impl Foreground {
    fn handle(&mut self, event: SessionEvent) {
        if let SessionEvent::StateChanged(state) = &event {
            self.state = state.clone();
        }
        self.callbacks.dispatch(&event);
    }
}

pub struct ConversationController {
    pump: TaskPump<ConversationCore, Foreground>,
    flags: Arc<SessionFlags>,
    foreground: Foreground,
    config: Config,
}

impl ConversationController {
    /// Start the background worker. Nothing is loaded yet.
    pub fn new(backend: Box<dyn LlamaBackend>, config: Config) -> io::Result<Self> {
        let flags = SessionFlags::new();
        let core = ConversationCore::new(backend, config.clone(), flags.clone());
        let pump = TaskPump::spawn(WORKER_THREAD_NAME, core)?;
        Ok(Self {
            pump,
            flags,
            foreground: Foreground::default(),
            config,
        })
    }

    pub fn callbacks_mut(&mut self) -> &mut CallbackSink {
        &mut self.foreground.callbacks
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Configuration used by the next [`ConversationController::load_model`].
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Queue a background operation whose events are marshalled to the foreground.
    fn submit<T: 'static>(
        &mut self,
        op: impl FnOnce(&mut ConversationCore, &mut dyn FnMut(SessionEvent)) -> Result<T, SessionError>
            + Send
            + 'static,
    ) -> Result<TaskId, SessionError> {
        let result = self.pump.submit(move |core, fg| {
            let mut emit = |event: SessionEvent| fg.enqueue(move |f: &mut Foreground| f.handle(event));
            if let Err(e) = op(core, &mut emit) {
                debug!(task_id = fg.task_id(), error = %e, "Background operation failed");
            }
        });
        match result {
            Ok(id) => Ok(id),
            Err(e) => Err(self.reject(SessionError::invalid(e.to_string()))),
        }
    }

    /// Report a synchronously rejected call.
    fn reject(&mut self, err: SessionError) -> SessionError {
        warn!(code = err.code().as_i32(), "Rejected: {err}");
        self.foreground.callbacks.dispatch(&SessionEvent::Error {
            message: err.to_string(),
            code: err.code(),
        });
        err
    }

    fn check_loaded(&mut self) -> Result<(), SessionError> {
        if self.flags.is_load_requested() {
            Ok(())
        } else {
            Err(self.reject(SessionError::invalid("no model loaded")))
        }
    }

    /// Claim the generation slot; only one generating operation may be queued or running.
    fn begin_generation(&mut self) -> Result<(), SessionError> {
        if !self.flags.try_begin_generation() {
            return Err(self.reject(SessionError::invalid(
                "a generation is already in progress",
            )));
        }
        self.flags.clear_stop();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Model lifecycle
    // ------------------------------------------------------------------

    /// Load the model described by the current configuration.
    pub fn load_model(&mut self) -> Result<TaskId, SessionError> {
        if let Err(e) = self.config.validate() {
            return Err(self.reject(SessionError::ModelLoadFailure(e.to_string())));
        }
        info!(path = %self.config.model.model_path.display(), "Loading model");
        self.flags.mark_loading();
        let config = self.config.clone();
        let submitted = self.submit(move |core, emit| {
            core.set_config(config);
            core.load_model(emit)
        });
        if submitted.is_err() {
            self.flags.mark_unloaded();
        }
        submitted
    }

    /// Release the model. Any running generation is asked to stop first.
    pub fn unload_model(&mut self) -> Result<TaskId, SessionError> {
        self.flags.request_stop();
        self.flags.mark_unloaded();
        self.submit(|core, emit| {
            core.unload(emit);
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Prompts
    // ------------------------------------------------------------------

    /// Insert a templated message and optionally generate a reply.
    ///
    /// Rejected while unloaded, and (when `generate_reply` is set) while
    /// another generation is queued or running.
    pub fn insert_prompt(
        &mut self,
        text: impl Into<String>,
        role: Role,
        add_assistant_prefix: bool,
        generate_reply: bool,
    ) -> Result<TaskId, SessionError> {
        self.check_loaded()?;
        if generate_reply {
            self.begin_generation()?;
        }
        let text = text.into();
        let flags = self.flags.clone();
        let submitted = self.submit(move |core, emit| {
            let result = core.insert_prompt(&text, role, add_assistant_prefix, generate_reply, emit);
            if generate_reply {
                flags.end_generation();
            }
            result
        });
        if submitted.is_err() && generate_reply {
            self.flags.end_generation();
        }
        submitted
    }

    /// Decode text verbatim, outside the chat template.
    pub fn insert_raw_prompt(
        &mut self,
        text: impl Into<String>,
        generate_reply: bool,
    ) -> Result<TaskId, SessionError> {
        self.check_loaded()?;
        if generate_reply {
            self.begin_generation()?;
        }
        let text = text.into();
        let flags = self.flags.clone();
        let submitted = self.submit(move |core, emit| {
            let result = core.insert_raw_prompt(&text, generate_reply, emit);
            if generate_reply {
                flags.end_generation();
            }
            result
        });
        if submitted.is_err() && generate_reply {
            self.flags.end_generation();
        }
        submitted
    }

    /// Continue generating after a stop.
    pub fn resume_generation(&mut self) -> Result<TaskId, SessionError> {
        self.check_loaded()?;
        self.begin_generation()?;
        let flags = self.flags.clone();
        let submitted = self.submit(move |core, emit| {
            let result = core.resume_generation(emit);
            flags.end_generation();
            result
        });
        if submitted.is_err() {
            self.flags.end_generation();
        }
        submitted
    }

    /// How `text` would render as a single `role` message under the loaded
    /// model's template. Renders on the caller's thread from the last
    /// published snapshot; nothing is queued.
    pub fn wrap_prompt_for_role(
        &mut self,
        text: &str,
        role: Role,
        add_assistant_prefix: bool,
    ) -> Result<String, SessionError> {
        if self.foreground.state.template.is_empty() {
            return Err(self.reject(SessionError::invalid("no chat template loaded")));
        }
        let message = [ChatMessageRef {
            role: role.as_str(),
            content: text,
        }];
        let rendered = self.foreground.state.template.render(&message, add_assistant_prefix);
        rendered.map_err(|e| self.reject(SessionError::TemplateRenderFailure(e.to_string())))
    }

    /// Ask the running generation to stop after its current token.
    pub fn stop_generation(&self) {
        self.flags.request_stop();
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    /// Stop any generation, then clear the conversation. With
    /// `keep_system_prompt`, a leading system message survives.
    pub fn reset_context_history(&mut self, keep_system_prompt: bool) -> Result<TaskId, SessionError> {
        self.stop_generation();
        self.check_loaded()?;
        self.submit(move |core, emit| core.reset(keep_system_prompt, emit))
    }

    /// Remove the last `n` messages and their cached cells.
    pub fn rollback_messages(&mut self, n: usize) -> Result<TaskId, SessionError> {
        self.check_loaded()?;
        self.submit(move |core, emit| core.rollback(n, emit))
    }

    /// Undo the last assistant reply.
    pub fn remove_last_reply(&mut self) -> Result<TaskId, SessionError> {
        self.rollback_messages(1)
    }

    /// Undo the last user input together with the reply to it.
    pub fn remove_last_user_input(&mut self) -> Result<TaskId, SessionError> {
        self.rollback_messages(2)
    }

    // ------------------------------------------------------------------
    // Foreground
    // ------------------------------------------------------------------

    /// Deliver queued results to the callbacks. Call regularly, e.g. once per frame.
    pub fn poll(&mut self) -> usize {
        self.pump.poll(&mut self.foreground)
    }

    /// Id of the task whose results were delivered most recently.
    pub fn completed_task_id(&self) -> TaskId {
        self.pump.completed_task_id()
    }

    /// Last published snapshot.
    pub fn state(&self) -> &ModelState {
        &self.foreground.state
    }

    pub fn raw_context_history(&self) -> &str {
        &self.foreground.state.context_history
    }

    pub fn structured_history(&self) -> &[Message] {
        &self.foreground.state.chat_history
    }

    pub fn is_loaded(&self) -> bool {
        self.flags.is_loaded()
    }

    /// A generating operation is queued or running.
    pub fn is_generating(&self) -> bool {
        self.flags.is_generation_in_flight()
    }

    /// Stop generation, let the worker drain its queue, join it, and deliver
    /// the remaining results.
    pub fn shutdown(&mut self) {
        self.stop_generation();
        self.pump.shutdown();
        self.poll();
    }
}

impl Drop for ConversationController {
    fn drop(&mut self) {
        self.flags.request_stop();
    }
}
