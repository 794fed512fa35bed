//! Inference engine: the model-facing half of a session.
//!
//! Wraps a [`LlamaBackend`] with everything a conversation needs on top of
//! the raw primitives:
//! 1. Model + context lifetime and chat-template selection
//! 2. Tokenization with first-segment special tokens
//! 3. Batch-chunked decode
//! 4. Sampling through the [`SamplerChain`] installed in the backend
//! 5. Two-pass chat-template rendering
//! 6. KV-cell accounting and trailing-cell eviction
//!
//! The engine is owned by the background worker; nothing here is shared.

use tracing::{debug, info, warn};

use crate::config::{Config, MODEL_TEMPLATE_SOURCE};
use crate::inference::llama_ffi::{
    ChatMessageRef, ContextParams, LlamaBackend, LlamaError, ModelParams, TokenId,
};
use crate::inference::sampler::SamplerChain;
use crate::inference::template::{self, ChatTemplate};

/// Template source recorded when the template text came from configuration.
pub const CUSTOM_TEMPLATE_SOURCE: &str = "Custom Jinja";

/// Initial render buffer size; grown on demand.
const INITIAL_RENDER_BUFFER: usize = 1024;

/// Outcome of one template render pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderPass {
    /// The buffer held the whole render.
    Rendered(String),

    /// The buffer was too small; retry with at least this many bytes.
    RequiredSize(usize),
}

/// The inference engine.
pub struct InferenceEngine {
    backend: Box<dyn LlamaBackend>,

    /// A model, context and sampler are installed.
    loaded: bool,

    template: ChatTemplate,

    batch_size: usize,

    /// Reused between renders so the common case is a single pass.
    render_buf: Vec<u8>,
}

impl InferenceEngine {
    pub fn new(backend: Box<dyn LlamaBackend>) -> Self {
        Self {
            backend,
            loaded: false,
            template: ChatTemplate::default(),
            batch_size: 1,
            render_buf: vec![0; INITIAL_RENDER_BUFFER],
        }
    }

    /// Load a model, create its context and sampler, and select the chat template.
    ///
    /// Any previously loaded model is released first. On failure nothing
    /// stays loaded.
    pub fn load_model(&mut self, config: &Config) -> Result<(), LlamaError> {
        self.unload();

        let model = &config.model;
        let model_params = ModelParams {
            n_gpu_layers: model.gpu_layers,
            use_mlock: model.use_mlock,
        };
        let ctx_params = ContextParams {
            n_ctx: model.context_size.max(1) as u32,
            n_batch: model.batch_size.max(1) as u32,
            n_threads: model.threads.max(1) as u32,
            n_threads_batch: model.threads.max(1) as u32,
        };

        self.backend.load_model(&model.model_path, &model_params)?;
        if let Err(e) = self.backend.new_context(&ctx_params) {
            self.backend.free();
            return Err(e);
        }

        self.batch_size = ctx_params.n_batch as usize;
        let (bos, eos) = self.backend.special_token_text();
        self.template = self.select_template(config).with_special_tokens(bos, eos);
        let sampler = SamplerChain::from_config(
            &config.sampling,
            &config.penalties,
            model.seed,
            self.backend.n_vocab(),
            self.backend.n_ctx(),
        );
        debug!(
            chain = sampler.describe(),
            fused = sampler.is_fused(),
            seed = sampler.seed(),
            "Sampler chain"
        );
        self.backend.set_sampler(sampler);
        self.backend.kv_clear();
        self.loaded = true;

        info!(
            path = %model.model_path.display(),
            context_size = model.context_size,
            batch = model.batch_size,
            threads = model.threads,
            gpu_layers = model.gpu_layers,
            mlock = model.use_mlock,
            template = %self.template.source,
            "Model loaded"
        );
        Ok(())
    }

    /// Template priority: explicit text, then a named template (from the
    /// model or the built-in registry), then the model's embedded default.
    fn select_template(&self, config: &Config) -> ChatTemplate {
        let requested = &config.template;

        if !requested.custom_template.is_empty() {
            let source = if requested.template_source.is_empty() {
                CUSTOM_TEMPLATE_SOURCE
            } else {
                requested.template_source.as_str()
            };
            return ChatTemplate::new(source, requested.custom_template.clone());
        }

        let name = requested.template_source.as_str();
        if !name.is_empty() && name != MODEL_TEMPLATE_SOURCE {
            if let Some(text) = self.backend.model_chat_template(Some(name)) {
                return ChatTemplate::new(name, text);
            }
            if let Some(text) = template::builtin(name) {
                return ChatTemplate::new(name, text);
            }
            warn!(template = name, "Named chat template not found, using model default");
        }

        match self.backend.model_chat_template(None) {
            Some(text) => ChatTemplate::new(MODEL_TEMPLATE_SOURCE, text),
            None => {
                warn!("Model has no embedded chat template, falling back to chatml");
                ChatTemplate::new("chatml", template::builtin("chatml").unwrap_or_default())
            }
        }
    }

    /// Release model, context and sampler. Idempotent.
    pub fn unload(&mut self) {
        if std::mem::take(&mut self.loaded) {
            info!("Model unloaded");
        }
        self.backend.free();
        self.template = ChatTemplate::default();
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded && self.backend.is_loaded()
    }

    pub fn template(&self) -> &ChatTemplate {
        &self.template
    }

    /// Tokenize text; BOS and other leading specials only when `first`.
    pub fn tokenize(&self, text: &str, first: bool) -> Result<Vec<TokenId>, LlamaError> {
        if !self.is_loaded() {
            return Err(LlamaError::NotLoaded);
        }
        self.backend.tokenize(text, first, true)
    }

    /// Decode tokens in chunks of at most the batch size.
    ///
    /// If a chunk fails, the cells written by earlier chunks of this call are
    /// evicted so the cache is left as it was before the call.
    pub fn decode(&mut self, tokens: &[TokenId]) -> Result<(), LlamaError> {
        if !self.is_loaded() {
            return Err(LlamaError::NotLoaded);
        }
        let start = self.backend.kv_used_cells();
        for chunk in tokens.chunks(self.batch_size.max(1)) {
            if let Err(e) = self.backend.decode(chunk) {
                let written = self.backend.kv_used_cells().saturating_sub(start);
                if written > 0 {
                    warn!(written, "Evicting partially decoded prompt");
                    self.backend.kv_seq_rm(start);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Sample the next token from the most recent logits and record it in
    /// the penalty window.
    pub fn sample_next(&mut self) -> Result<TokenId, LlamaError> {
        if !self.is_loaded() {
            return Err(LlamaError::NotLoaded);
        }
        self.backend
            .sample()
            .ok_or_else(|| LlamaError::DecodeFailed("no logits available".to_string()))
    }

    /// Raw bytes of a token.
    pub fn token_to_piece(&self, token: TokenId) -> Vec<u8> {
        self.backend.token_to_piece(token)
    }

    pub fn is_end_of_generation(&self, token: TokenId) -> bool {
        self.backend.is_eog(token)
    }

    pub fn used_context_cells(&self) -> usize {
        self.backend.kv_used_cells()
    }

    pub fn max_context_cells(&self) -> usize {
        self.backend.n_ctx()
    }

    /// Drop the last `n` cells from the KV cache.
    pub fn evict_trailing_cells(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        let used = self.backend.kv_used_cells();
        let keep = used.saturating_sub(n);
        debug!(used, evict = used - keep, "Evicting trailing KV cells");
        self.backend.kv_seq_rm(keep);
    }

    /// Drop every cell and forget sampler history.
    pub fn clear_context(&mut self) {
        self.backend.kv_clear();
        self.backend.reset_sampler();
    }

    /// One render pass into the engine's buffer.
    pub fn render_pass(
        &mut self,
        messages: &[ChatMessageRef<'_>],
        add_assistant: bool,
    ) -> Result<RenderPass, LlamaError> {
        let len = self.backend.apply_chat_template(
            &self.template.text,
            messages,
            add_assistant,
            &mut self.render_buf,
        );
        let len = usize::try_from(len).map_err(|_| {
            LlamaError::TemplateFailed(format!(
                "renderer returned {len} for template '{}'",
                self.template.source
            ))
        })?;
        if len > self.render_buf.len() {
            return Ok(RenderPass::RequiredSize(len));
        }
        let text = String::from_utf8_lossy(&self.render_buf[..len]).into_owned();
        Ok(RenderPass::Rendered(text))
    }

    /// Render the chat template, growing the buffer and retrying once if the
    /// first pass reports a larger required size.
    pub fn render_template(
        &mut self,
        messages: &[ChatMessageRef<'_>],
        add_assistant: bool,
    ) -> Result<String, LlamaError> {
        match self.render_pass(messages, add_assistant)? {
            RenderPass::Rendered(text) => Ok(text),
            RenderPass::RequiredSize(len) => {
                self.render_buf.resize(len, 0);
                match self.render_pass(messages, add_assistant)? {
                    RenderPass::Rendered(text) => Ok(text),
                    RenderPass::RequiredSize(len) => Err(LlamaError::TemplateFailed(format!(
                        "renderer still needs {len} bytes after resize"
                    ))),
                }
            }
        }
    }
}

/// Reassembles UTF-8 text from token pieces.
///
/// A multi-byte character may be split across several tokens; bytes are
/// held back until they complete a character.
#[derive(Debug, Default)]
pub struct Utf8Pieces {
    pending: Vec<u8>,
    pending_tokens: usize,
}

impl Utf8Pieces {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a token's bytes; returns the text that is now complete (possibly empty).
    ///
    /// Empty pieces carry no bytes and are not counted as held back.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        if bytes.is_empty() {
            return String::new();
        }
        self.pending.extend_from_slice(bytes);
        self.pending_tokens += 1;

        let valid = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(e) => match e.error_len() {
                // Incomplete sequence at the end: wait for more bytes.
                None => e.valid_up_to(),
                // Invalid bytes can never complete; flush them lossily.
                Some(_) => self.pending.len(),
            },
        };
        if valid == 0 {
            return String::new();
        }

        let out = String::from_utf8_lossy(&self.pending[..valid]).into_owned();
        self.pending.drain(..valid);
        if self.pending.is_empty() {
            self.pending_tokens = 0;
        } else {
            // The held-back bytes started in the latest token.
            self.pending_tokens = 1;
        }
        out
    }

    /// Tokens whose bytes are still held back.
    pub fn pending_tokens(&self) -> usize {
        self.pending_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::stub::{StubBackend, StubConfig};
    use tempfile::NamedTempFile;

    fn loaded_engine(stub: StubConfig, mut config: Config) -> (InferenceEngine, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        config.model.model_path = file.path().to_path_buf();
        let mut engine = InferenceEngine::new(Box::new(StubBackend::new(stub)));
        engine.load_model(&config).unwrap();
        (engine, file)
    }

    fn small_config() -> Config {
        let mut config = Config::default();
        config.model.context_size = 128;
        config.model.batch_size = 16;
        config
    }

    #[test]
    fn test_load_missing_model_fails() {
        let mut engine = InferenceEngine::new(Box::new(StubBackend::default()));
        let mut config = Config::default();
        config.model.model_path = "/nonexistent/model.gguf".into();
        assert!(matches!(
            engine.load_model(&config),
            Err(LlamaError::ModelLoadFailed(_))
        ));
        assert!(!engine.is_loaded());
        assert_eq!(engine.used_context_cells(), 0);
    }

    #[test]
    fn test_template_priority() {
        let stub = StubConfig::default().with_named_template("tool_use", "{{ 'tools' }}");

        let mut config = small_config();
        config.template.custom_template = "{{ 'custom' }}".to_string();
        config.template.template_source = "tool_use".to_string();
        let (engine, _f) = loaded_engine(stub.clone(), config);
        assert_eq!(engine.template().source, "tool_use");
        assert_eq!(engine.template().text, "{{ 'custom' }}");

        let mut config = small_config();
        config.template.template_source = "tool_use".to_string();
        let (engine, _f) = loaded_engine(stub.clone(), config);
        assert_eq!(engine.template().text, "{{ 'tools' }}");

        let mut config = small_config();
        config.template.template_source = "llama3".to_string();
        let (engine, _f) = loaded_engine(stub.clone(), config);
        assert_eq!(engine.template().source, "llama3");

        let mut config = small_config();
        config.template.template_source = MODEL_TEMPLATE_SOURCE.to_string();
        let (engine, _f) = loaded_engine(stub, config);
        assert_eq!(engine.template().source, MODEL_TEMPLATE_SOURCE);
    }

    #[test]
    fn test_custom_template_without_source() {
        let mut config = small_config();
        config.template.custom_template = "{{ 'x' }}".to_string();
        let (engine, _f) = loaded_engine(StubConfig::default(), config);
        assert_eq!(engine.template().source, CUSTOM_TEMPLATE_SOURCE);
    }

    #[test]
    fn test_decode_is_chunked_by_batch() {
        let (mut engine, _f) = loaded_engine(StubConfig::default(), small_config());
        let tokens = engine.tokenize(&"a".repeat(40), true).unwrap();
        assert_eq!(tokens.len(), 41);
        engine.decode(&tokens).unwrap();
        assert_eq!(engine.used_context_cells(), 41);
    }

    #[test]
    fn test_failed_decode_restores_cells() {
        let (mut engine, _f) = loaded_engine(StubConfig::default().fail_decode_after(2), small_config());
        engine.decode(&[1, 2, 3]).unwrap();
        let tokens = vec![65; 40];
        assert!(engine.decode(&tokens).is_err());
        assert_eq!(engine.used_context_cells(), 3);
    }

    #[test]
    fn test_two_pass_render() {
        let (mut engine, _f) = loaded_engine(StubConfig::default(), small_config());
        let long = "x".repeat(INITIAL_RENDER_BUFFER * 2);
        let messages = [ChatMessageRef {
            role: "user",
            content: &long,
        }];
        match engine.render_pass(&messages, true).unwrap() {
            RenderPass::RequiredSize(n) => assert!(n > INITIAL_RENDER_BUFFER),
            RenderPass::Rendered(_) => panic!("expected a size request"),
        }
        let text = engine.render_template(&messages, true).unwrap();
        assert!(text.contains(&long));
        assert!(matches!(
            engine.render_pass(&messages, true).unwrap(),
            RenderPass::Rendered(_)
        ));
    }

    #[test]
    fn test_negative_render_is_error() {
        let mut config = small_config();
        config.template.custom_template = "{{ raise_exception('bad') }}".to_string();
        let (mut engine, _f) = loaded_engine(StubConfig::default(), config);
        let messages = [ChatMessageRef {
            role: "user",
            content: "hi",
        }];
        assert!(matches!(
            engine.render_template(&messages, true),
            Err(LlamaError::TemplateFailed(_))
        ));
    }

    #[test]
    fn test_evict_trailing_cells() {
        let (mut engine, _f) = loaded_engine(StubConfig::default(), small_config());
        engine.decode(&[1, 2, 3, 4, 5]).unwrap();
        engine.evict_trailing_cells(2);
        assert_eq!(engine.used_context_cells(), 3);
        engine.evict_trailing_cells(10);
        assert_eq!(engine.used_context_cells(), 0);
    }

    #[test]
    fn test_unload_twice() {
        let (mut engine, _f) = loaded_engine(StubConfig::default(), small_config());
        engine.unload();
        engine.unload();
        assert!(!engine.is_loaded());
        assert!(engine.tokenize("x", true).is_err());
    }

    #[test]
    fn test_utf8_pieces_hold_split_chars() {
        let mut pieces = Utf8Pieces::new();
        assert_eq!(pieces.push(b"a"), "a");
        assert_eq!(pieces.push(&[0xC3]), "");
        assert_eq!(pieces.pending_tokens(), 1);
        assert_eq!(pieces.push(&[0xA9]), "é");
        assert_eq!(pieces.pending_tokens(), 0);
    }

    #[test]
    fn test_utf8_pieces_skip_empty_pieces() {
        let mut pieces = Utf8Pieces::new();
        assert_eq!(pieces.push(&[]), "");
        assert_eq!(pieces.pending_tokens(), 0);
        assert_eq!(pieces.push(&[0xE2, 0x82]), "");
        assert_eq!(pieces.push(&[]), "");
        assert_eq!(pieces.pending_tokens(), 1);
        assert_eq!(pieces.push(&[0xAC]), "€");
    }

    #[test]
    fn test_sampling_after_load_and_unload() {
        let mut config = small_config();
        config.model.use_mlock = true;
        let (mut engine, _f) = loaded_engine(StubConfig::default(), config);
        assert!(engine.is_loaded());
        // Sampling is served by the backend once loaded.
        let tokens = engine.tokenize("x", true).unwrap();
        engine.decode(&tokens).unwrap();
        assert!(engine.sample_next().is_ok());
        engine.unload();
        assert_eq!(engine.sample_next(), Err(LlamaError::NotLoaded));
    }
}
