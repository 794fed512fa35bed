//! The conversation state machine and generation loop.
//!
//! [`ConversationCore`] owns the [`InferenceEngine`] and the [`SessionState`]
//! and runs on the background worker. Every operation is synchronous and
//! reports what happened through an `emit` sink of [`SessionEvent`]s; the
//! controller forwards those to the foreground queue.
//!
//! Prompt insertion and rollback both go through the same reconcile step:
//! render the message list, find how much of the committed text the new
//! render still starts with, evict the KV cells of the committed text past
//! that point, then decode whatever the render adds.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::inference::engine::{InferenceEngine, Utf8Pieces};
use crate::inference::llama_ffi::{ChatMessageRef, LlamaBackend};
use crate::session::callbacks::{GenerationSummary, SessionEvent, StopReason};
use crate::session::error::{ErrorCode, SessionError};
use crate::session::message::{Message, Role};
use crate::session::partials::PartialSplitter;
use crate::session::state::{ModelLifecycle, ModelState, SessionState};

const UNLOADED: u8 = 0;
const LOADING: u8 = 1;
const LOADED: u8 = 2;

/// Flags shared between the controller and the background worker.
#[derive(Debug, Default)]
pub struct SessionFlags {
    lifecycle: AtomicU8,
    generation_in_flight: AtomicBool,
    stop_requested: AtomicBool,
}

impl SessionFlags {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// True once a load has been requested, until an unload or a failed load.
    pub fn is_load_requested(&self) -> bool {
        self.lifecycle.load(Ordering::Acquire) != UNLOADED
    }

    pub fn is_loaded(&self) -> bool {
        self.lifecycle.load(Ordering::Acquire) == LOADED
    }

    pub fn mark_loading(&self) {
        self.lifecycle.store(LOADING, Ordering::Release);
    }

    fn mark_loaded(&self) {
        self.lifecycle.store(LOADED, Ordering::Release);
    }

    pub fn mark_unloaded(&self) {
        self.lifecycle.store(UNLOADED, Ordering::Release);
    }

    /// Claim the single generation slot. Fails if a generation is queued or running.
    pub fn try_begin_generation(&self) -> bool {
        self.generation_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_generation(&self) {
        self.generation_in_flight.store(false, Ordering::Release);
    }

    pub fn is_generation_in_flight(&self) -> bool {
        self.generation_in_flight.load(Ordering::Acquire)
    }

    /// Checked once per generated token. A stop raised while no generation
    /// slot is claimed is dropped when the next generation starts.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    pub fn clear_stop(&self) {
        self.stop_requested.store(false, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }
}

/// How a finished generation is folded back into the session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GenerationMode {
    /// Record the reply as an assistant message; `continue_last` extends the
    /// trailing assistant message instead of adding one.
    Templated { continue_last: bool },

    /// Append the reply to the rendered text only.
    Raw,
}

/// Background-owned conversation state machine.
pub struct ConversationCore {
    engine: InferenceEngine,
    state: SessionState,
    config: Config,
    flags: Arc<SessionFlags>,
    partials: PartialSplitter,
    generating: bool,

    /// The most recent text the model saw was untemplated.
    raw_tail: bool,
}

impl ConversationCore {
    pub fn new(backend: Box<dyn LlamaBackend>, config: Config, flags: Arc<SessionFlags>) -> Self {
        let partials = PartialSplitter::new(&config.chat.partial_separators);
        Self {
            engine: InferenceEngine::new(backend),
            state: SessionState::default(),
            config,
            flags,
            partials,
            generating: false,
            raw_tail: false,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn engine(&self) -> &InferenceEngine {
        &self.engine
    }

    pub fn flags(&self) -> &Arc<SessionFlags> {
        &self.flags
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Replace the configuration used by the next load.
    pub fn set_config(&mut self, config: Config) {
        self.partials = PartialSplitter::new(&config.chat.partial_separators);
        self.config = config;
    }

    pub fn snapshot(&self) -> ModelState {
        let lifecycle = if !self.engine.is_loaded() {
            ModelLifecycle::Unloaded
        } else if self.generating {
            ModelLifecycle::Generating
        } else {
            ModelLifecycle::Idle
        };
        self.state
            .snapshot(lifecycle, self.engine.max_context_cells())
    }

    fn state_changed(&mut self, emit: &mut dyn FnMut(SessionEvent)) {
        self.state.set_used_cells(self.engine.used_context_cells());
        emit(SessionEvent::StateChanged(self.snapshot()));
    }

    /// Log and surface an error, handing it back for `?`.
    fn fail(&self, err: SessionError, emit: &mut dyn FnMut(SessionEvent)) -> SessionError {
        match err.code() {
            ErrorCode::InvalidOperation | ErrorCode::ContextOverflow => {
                warn!(code = err.code().as_i32(), "{err}");
            }
            _ => error!(code = err.code().as_i32(), "{err}"),
        }
        emit(SessionEvent::Error {
            message: err.to_string(),
            code: err.code(),
        });
        err
    }

    fn ensure_loaded(&self, emit: &mut dyn FnMut(SessionEvent)) -> Result<(), SessionError> {
        if self.engine.is_loaded() {
            Ok(())
        } else {
            Err(self.fail(SessionError::invalid("no model loaded"), emit))
        }
    }

    // ------------------------------------------------------------------
    // Model lifecycle
    // ------------------------------------------------------------------

    pub fn load_model(&mut self, emit: &mut dyn FnMut(SessionEvent)) -> Result<(), SessionError> {
        self.flags.mark_loading();
        if let Err(e) = self.engine.load_model(&self.config) {
            self.flags.mark_unloaded();
            self.state = SessionState::default();
            return Err(self.fail(SessionError::ModelLoadFailure(e.to_string()), emit));
        }

        self.state = SessionState::new(self.engine.template().clone());
        self.raw_tail = false;
        self.flags.mark_loaded();

        let path = self.config.model.model_path.display().to_string();
        emit(SessionEvent::ModelLoaded(path));
        self.state_changed(emit);

        let chat = &self.config.chat;
        if chat.auto_insert_system_prompt && !chat.system_prompt.is_empty() {
            let prompt = chat.system_prompt.clone();
            debug!("Inserting system prompt after load");
            self.insert_prompt(&prompt, Role::System, false, false, emit)?;
        }
        Ok(())
    }

    /// Release the model. A no-op when nothing is loaded.
    pub fn unload(&mut self, emit: &mut dyn FnMut(SessionEvent)) {
        let was_loaded = self.engine.is_loaded();
        self.engine.unload();
        self.flags.mark_unloaded();
        if !was_loaded {
            return;
        }
        self.state = SessionState::default();
        self.partials.reset();
        self.raw_tail = false;
        emit(SessionEvent::ModelUnloaded);
        self.state_changed(emit);
    }

    // ------------------------------------------------------------------
    // Prompts
    // ------------------------------------------------------------------

    /// Add a templated message, decode it, and optionally generate a reply.
    pub fn insert_prompt(
        &mut self,
        text: &str,
        role: Role,
        add_assistant_prefix: bool,
        generate_reply: bool,
        emit: &mut dyn FnMut(SessionEvent),
    ) -> Result<Option<GenerationSummary>, SessionError> {
        self.ensure_loaded(emit)?;
        if !text.is_empty() {
            self.process_templated(text, role, add_assistant_prefix, emit)?;
        }
        if !generate_reply {
            return Ok(None);
        }
        let mode = GenerationMode::Templated {
            continue_last: false,
        };
        self.generate(mode, emit).map(Some)
    }

    /// Decode text verbatim, outside the structured message list.
    pub fn insert_raw_prompt(
        &mut self,
        text: &str,
        generate_reply: bool,
        emit: &mut dyn FnMut(SessionEvent),
    ) -> Result<Option<GenerationSummary>, SessionError> {
        self.ensure_loaded(emit)?;
        if !text.is_empty() {
            self.process_raw(text, emit)?;
        }
        if !generate_reply {
            return Ok(None);
        }
        self.generate(GenerationMode::Raw, emit).map(Some)
    }

    /// Continue generating from wherever the cache left off.
    pub fn resume_generation(
        &mut self,
        emit: &mut dyn FnMut(SessionEvent),
    ) -> Result<GenerationSummary, SessionError> {
        self.ensure_loaded(emit)?;
        let mode = if self.raw_tail {
            GenerationMode::Raw
        } else {
            GenerationMode::Templated {
                continue_last: true,
            }
        };
        self.generate(mode, emit)
    }

    /// How `text` would render as a single `role` message under the active
    /// template. History and the cache are left untouched.
    pub fn wrap_prompt_for_role(
        &mut self,
        text: &str,
        role: Role,
        add_assistant_prefix: bool,
    ) -> Result<String, SessionError> {
        if !self.engine.is_loaded() {
            return Err(SessionError::invalid("no model loaded"));
        }
        let message = [ChatMessageRef {
            role: role.as_str(),
            content: text,
        }];
        Ok(self.engine.render_template(&message, add_assistant_prefix)?)
    }

    fn process_templated(
        &mut self,
        text: &str,
        role: Role,
        add_assistant_prefix: bool,
        emit: &mut dyn FnMut(SessionEvent),
    ) -> Result<usize, SessionError> {
        let start = Instant::now();
        self.state.push_message(Message::new(role, text));

        let rendered = match self.render(self.state.messages().len(), add_assistant_prefix) {
            Ok(r) => r,
            Err(e) => {
                self.state.pop_message();
                return Err(self.fail(e, emit));
            }
        };
        let n_tokens = match self.apply_render(rendered) {
            Ok(n) => n,
            Err(e) => {
                self.state.pop_message();
                self.state_changed(emit);
                return Err(self.fail(e, emit));
            }
        };
        self.raw_tail = false;
        self.prompt_processed(n_tokens, role, start, emit);
        Ok(n_tokens)
    }

    fn process_raw(&mut self, text: &str, emit: &mut dyn FnMut(SessionEvent)) -> Result<usize, SessionError> {
        let start = Instant::now();
        let used = self.engine.used_context_cells();
        let tokens = self
            .engine
            .tokenize(text, used == 0)
            .map_err(|e| self.fail(e.into(), emit))?;

        let capacity = self.engine.max_context_cells();
        if used + tokens.len() > capacity {
            let err = SessionError::ContextOverflow {
                used,
                requested: tokens.len(),
                capacity,
            };
            return Err(self.fail(err, emit));
        }
        if let Err(e) = self.engine.decode(&tokens) {
            return Err(self.fail(e.into(), emit));
        }

        self.state.extend_committed(text);
        self.raw_tail = true;
        self.prompt_processed(tokens.len(), Role::Unknown, start, emit);
        Ok(tokens.len())
    }

    fn prompt_processed(
        &mut self,
        tokens: usize,
        role: Role,
        start: Instant,
        emit: &mut dyn FnMut(SessionEvent),
    ) {
        let secs = start.elapsed().as_secs_f32();
        let tokens_per_second = if secs > 0.0 { tokens as f32 / secs } else { 0.0 };
        self.state.record_throughput(role, tokens_per_second);
        info!(
            tokens,
            role = %role,
            tokens_per_second,
            used = self.engine.used_context_cells(),
            "Prompt processed"
        );
        emit(SessionEvent::PromptProcessed {
            tokens,
            role,
            tokens_per_second,
        });
        self.state_changed(emit);
    }

    /// Render the first `count` messages with the session template.
    fn render(&mut self, count: usize, add_assistant: bool) -> Result<String, SessionError> {
        let refs = self.state.message_refs();
        let refs = &refs[..count.min(refs.len())];
        Ok(self.engine.render_template(refs, add_assistant)?)
    }

    /// Byte length of the committed text `new_render` keeps, and how many
    /// KV cells hold committed text beyond it.
    fn stale_cells(&self, new_render: &str) -> Result<(usize, usize), SessionError> {
        let (keep, stale) = self.state.plan_rebase(new_render);
        if stale.is_empty() {
            return Ok((keep, 0));
        }
        let n = self.engine.tokenize(stale, keep == 0)?.len();
        Ok((keep, n))
    }

    /// Bring the cache in line with `new_render` and decode what it adds.
    ///
    /// Nothing is mutated if the pending tokens would not fit. If the decode
    /// itself fails, the cache and committed text are left at the shared
    /// prefix.
    fn apply_render(&mut self, new_render: String) -> Result<usize, SessionError> {
        let (keep, stale) = self.stale_cells(&new_render)?;
        let base = self.engine.used_context_cells().saturating_sub(stale);

        let pending = &new_render[keep..];
        let tokens = if pending.is_empty() {
            Vec::new()
        } else {
            self.engine.tokenize(pending, base == 0)?
        };

        let capacity = self.engine.max_context_cells();
        if base + tokens.len() > capacity {
            return Err(SessionError::ContextOverflow {
                used: base,
                requested: tokens.len(),
                capacity,
            });
        }

        if stale > 0 {
            debug!(stale, keep, "Evicting cells no longer in the render");
            self.engine.evict_trailing_cells(stale);
        }
        if let Err(e) = self.engine.decode(&tokens) {
            let kept = self.state.committed_text()[..keep].to_string();
            self.state.rebase(kept, keep);
            return Err(e.into());
        }

        self.state.rebase(new_render, keep);
        self.state.commit_to(self.state.rendered().len());
        Ok(tokens.len())
    }

    /// Bring the cache in line with `new_render` without decoding anything;
    /// text past the shared prefix stays pending.
    fn resync(&mut self, new_render: String) -> Result<(), SessionError> {
        let (keep, stale) = self.stale_cells(&new_render)?;
        self.engine.evict_trailing_cells(stale);
        self.state.rebase(new_render, keep);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Generation
    // ------------------------------------------------------------------

    fn generate(
        &mut self,
        mode: GenerationMode,
        emit: &mut dyn FnMut(SessionEvent),
    ) -> Result<GenerationSummary, SessionError> {
        if !self.flags.is_generation_in_flight() {
            self.flags.clear_stop();
        }
        self.generating = true;
        emit(SessionEvent::GenerationStarted);
        self.state_changed(emit);

        let start = Instant::now();
        let used_at_start = self.engine.used_context_cells();
        let capacity = self.engine.max_context_cells();
        let debug_log = self.config.chat.debug_log_model_output;
        let emit_partials = self.config.chat.emit_partials;
        let stop_sequences = self.config.chat.stop_sequences.clone();

        let mut response = String::new();
        let mut pieces = Utf8Pieces::new();
        let mut decoded = 0usize;
        let mut failure: Option<SessionError> = None;

        // Reply cells and response bytes before the first text-less token.
        let mut respell_from: Option<(usize, usize)> = None;
        self.partials.reset();

        let stop_reason = loop {
            if self.flags.stop_requested() {
                break StopReason::Stopped;
            }

            let token = match self.engine.sample_next() {
                Ok(t) => t,
                Err(e) => {
                    failure = Some(e.into());
                    break StopReason::DecodeFailure;
                }
            };
            if self.engine.is_end_of_generation(token) {
                break StopReason::EndOfGeneration;
            }
            if used_at_start + decoded + 1 > capacity {
                failure = Some(SessionError::ContextOverflow {
                    used: used_at_start + decoded,
                    requested: 1,
                    capacity,
                });
                break StopReason::ContextOverflow;
            }

            let bytes = self.engine.token_to_piece(token);
            if let Err(e) = self.engine.decode(&[token]) {
                failure = Some(e.into());
                break StopReason::DecodeFailure;
            }
            decoded += 1;

            if bytes.is_empty() {
                // Control token: it holds a cell but adds no text.
                if respell_from.is_none() {
                    let clean = decoded - 1 - pieces.pending_tokens();
                    respell_from = Some((clean, response.len()));
                }
                continue;
            }
            let text = pieces.push(&bytes);
            if text.is_empty() {
                continue;
            }
            if debug_log {
                debug!(token, piece = %text, "Model output");
            }
            response.push_str(&text);
            emit(SessionEvent::Token(text.clone()));
            if emit_partials {
                for partial in self.partials.push(&text) {
                    emit(SessionEvent::Partial(partial));
                }
            }
            if completes_stop_sequence(&response, text.len(), &stop_sequences) {
                break StopReason::StopSequence;
            }
        };

        if emit_partials {
            if let Some(partial) = self.partials.finish() {
                emit(SessionEvent::Partial(partial));
            }
        }

        // Cells of a character that never completed are not part of the reply.
        let held = pieces.pending_tokens();
        if held > 0 {
            self.engine.evict_trailing_cells(held);
        }
        let token_count = decoded - held;

        // Cells must spell exactly the committed text, so the reply is
        // re-tokenized from the first control token on.
        let mut committed_reply = response.len();
        if let Some((cells, text_at)) = respell_from {
            debug!(cells, text_at, "Re-decoding reply past a control token");
            if let Err(e) = self.respell_reply(used_at_start + cells, &response[text_at..]) {
                committed_reply = text_at;
                self.fail(e, emit);
            }
        }

        let duration_secs = start.elapsed().as_secs_f32();
        let tokens_per_second = if duration_secs > 0.0 {
            token_count as f32 / duration_secs
        } else {
            0.0
        };

        if let Err(e) = self.finalize(mode, &response[..committed_reply]) {
            self.fail(e, emit);
        }
        if let Some(err) = failure {
            self.fail(err, emit);
        }

        self.generating = false;
        self.flags.clear_stop();
        self.state.record_throughput(Role::Assistant, tokens_per_second);

        info!(
            tokens = token_count,
            tokens_per_second,
            duration_secs,
            reason = ?stop_reason,
            "Generation complete"
        );
        let summary = GenerationSummary {
            response,
            duration_secs,
            token_count,
            tokens_per_second,
            stop_reason,
        };
        emit(SessionEvent::GenerationComplete(summary.clone()));
        self.state_changed(emit);
        Ok(summary)
    }

    /// Replace the cells from `base` on with the tokenization of `tail`.
    fn respell_reply(&mut self, base: usize, tail: &str) -> Result<(), SessionError> {
        let used = self.engine.used_context_cells();
        self.engine.evict_trailing_cells(used.saturating_sub(base));
        if tail.is_empty() {
            return Ok(());
        }
        let tokens = self.engine.tokenize(tail, base == 0)?;
        self.engine.decode(&tokens)?;
        Ok(())
    }

    /// Fold a decoded reply into the message list and rendered text.
    fn finalize(&mut self, mode: GenerationMode, response: &str) -> Result<(), SessionError> {
        self.state.extend_committed(response);

        let continue_last = match mode {
            GenerationMode::Raw => {
                self.raw_tail = true;
                return Ok(());
            }
            GenerationMode::Templated { continue_last } => continue_last,
        };

        match self.state.last_message_mut() {
            Some(last) if continue_last && last.role == Role::Assistant => {
                last.content.push_str(response);
            }
            _ => self.state.push_message(Message::new(Role::Assistant, response)),
        }

        let rendered = self.render(self.state.messages().len(), false)?;
        self.resync(rendered)
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    /// Remove the last `n` messages and evict their cells. Untemplated text
    /// past the last message is dropped as well, even when `n` is 0.
    pub fn rollback(&mut self, n: usize, emit: &mut dyn FnMut(SessionEvent)) -> Result<usize, SessionError> {
        self.ensure_loaded(emit)?;
        let remaining = self.state.messages().len().saturating_sub(n);
        let removed = self.state.messages().len() - remaining;
        if removed == 0 && !self.raw_tail {
            return Ok(0);
        }

        if remaining == 0 {
            self.clear_all();
        } else {
            let rendered = self.render(remaining, false).map_err(|e| self.fail(e, emit))?;
            self.state.truncate_messages(removed);
            self.resync(rendered).map_err(|e| self.fail(e, emit))?;
        }
        self.raw_tail = false;

        info!(
            removed,
            remaining,
            used = self.engine.used_context_cells(),
            "Rolled back messages"
        );
        self.state_changed(emit);
        Ok(removed)
    }

    /// Clear history, or roll back to the leading system message.
    pub fn reset(&mut self, keep_system_prompt: bool, emit: &mut dyn FnMut(SessionEvent)) -> Result<(), SessionError> {
        self.ensure_loaded(emit)?;
        let messages = self.state.messages();
        let keeps_system = keep_system_prompt
            && messages.first().is_some_and(|m| m.role == Role::System);

        if keeps_system {
            let n = messages.len() - 1;
            self.rollback(n, emit)?;
        } else {
            self.clear_all();
            self.state_changed(emit);
        }
        info!(keep_system_prompt = keeps_system, "Context reset");
        emit(SessionEvent::ContextReset);
        Ok(())
    }

    fn clear_all(&mut self) {
        self.state.clear();
        self.engine.clear_context();
        self.partials.reset();
        self.raw_tail = false;
    }
}

/// Whether `appended` bytes just added to `response` completed a stop
/// sequence. Sequences are compared trimmed; blank ones never match.
fn completes_stop_sequence(response: &str, appended: usize, stops: &[String]) -> bool {
    stops.iter().map(|s| s.trim()).filter(|s| !s.is_empty()).any(|stop| {
        let mut from = response.len().saturating_sub(appended + stop.len() - 1);
        while !response.is_char_boundary(from) {
            from -= 1;
        }
        response[from..].contains(stop)
    })
}
