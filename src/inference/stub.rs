//! Simulated llama.cpp backend.
//!
//! Implements [`LlamaBackend`] without the C library so the session layer
//! can be exercised end to end. The simulation keeps the properties the
//! session layer relies on:
//!
//! - Byte tokenizer: one token per UTF-8 byte, plus BOS/EOS/EOT specials.
//!   Tokenizing a string and concatenating its pieces is lossless.
//! - Fixed-capacity KV cache: decode appends one cell per token and fails
//!   with [`LlamaError::KvCacheFull`] instead of writing past `n_ctx`.
//! - Scripted logits: after a prompt, the logits spell a configured reply
//!   one byte at a time, then peak on EOS.
//! - Sampling runs the installed [`SamplerChain`] over those logits.

use std::path::Path;
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::inference::llama_ffi::{
    write_rendered, ChatMessageRef, ContextParams, LlamaBackend, LlamaError, ModelParams, TokenId,
};
use crate::inference::sampler::SamplerChain;
use crate::inference::template::{self, SpecialTokens};

pub const TOKEN_BOS: TokenId = 256;
pub const TOKEN_EOS: TokenId = 257;
pub const TOKEN_EOT: TokenId = 258;
pub const N_VOCAB: usize = 259;

pub const BOS_TEXT: &str = "<s>";
pub const EOS_TEXT: &str = "</s>";

/// Logit given to the scripted next token; everything else is 0.
const PEAK_LOGIT: f32 = 30.0;

/// Behavior of the simulated model.
#[derive(Debug, Clone)]
pub struct StubConfig {
    /// Text the model replies with after any prompt.
    pub reply: String,

    /// Never emit EOS; cycle through `reply` forever.
    pub repeat_reply: bool,

    /// Sleep per single-token decode, to simulate generation latency.
    pub token_delay: Option<Duration>,

    /// Number of decode calls that succeed before every further call fails.
    pub fail_decode_after: Option<usize>,

    /// Tokenizing any text containing this marker fails.
    pub fail_tokenize_on: Option<String>,

    /// Emit a text-less control token (BOS) before this byte of the reply.
    pub control_token_at: Option<usize>,

    /// The model's default `tokenizer.chat_template`.
    pub embedded_template: String,

    /// Named alternative templates shipped with the model.
    pub named_templates: Vec<(String, String)>,
}

impl Default for StubConfig {
    fn default() -> Self {
        Self {
            reply: "Hello! How can I help you today?".to_string(),
            repeat_reply: false,
            token_delay: None,
            fail_decode_after: None,
            fail_tokenize_on: None,
            control_token_at: None,
            embedded_template: template::builtin("chatml").unwrap_or_default().to_string(),
            named_templates: Vec::new(),
        }
    }
}

impl StubConfig {
    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = reply.into();
        self
    }

    pub fn repeating(mut self) -> Self {
        self.repeat_reply = true;
        self
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = Some(delay);
        self
    }

    pub fn fail_decode_after(mut self, calls: usize) -> Self {
        self.fail_decode_after = Some(calls);
        self
    }

    pub fn fail_tokenize_on(mut self, marker: impl Into<String>) -> Self {
        self.fail_tokenize_on = Some(marker.into());
        self
    }

    pub fn with_control_token_at(mut self, byte: usize) -> Self {
        self.control_token_at = Some(byte);
        self
    }

    pub fn with_embedded_template(mut self, text: impl Into<String>) -> Self {
        self.embedded_template = text.into();
        self
    }

    pub fn with_named_template(mut self, name: impl Into<String>, text: impl Into<String>) -> Self {
        self.named_templates.push((name.into(), text.into()));
        self
    }
}

/// The simulated model and context.
pub struct StubBackend {
    config: StubConfig,
    model_loaded: bool,

    /// Token sequence the model replies with.
    script: Vec<TokenId>,

    // Set by `new_context`.
    n_ctx: usize,
    n_batch: usize,
    has_context: bool,

    kv: Vec<TokenId>,
    logits: Vec<f32>,
    sampler: Option<SamplerChain>,

    /// Position within the scripted reply.
    cursor: usize,
    decode_calls: usize,
}

impl StubBackend {
    pub fn new(config: StubConfig) -> Self {
        let mut script: Vec<TokenId> = config.reply.bytes().map(TokenId::from).collect();
        if let Some(at) = config.control_token_at {
            script.insert(at.min(script.len()), TOKEN_BOS);
        }
        Self {
            config,
            model_loaded: false,
            script,
            n_ctx: 0,
            n_batch: 0,
            has_context: false,
            kv: Vec::new(),
            logits: Vec::new(),
            sampler: None,
            cursor: 0,
            decode_calls: 0,
        }
    }

    /// Logits for the last token of the most recent decode.
    pub fn logits(&self) -> &[f32] {
        &self.logits
    }

    /// Tokens currently held in the KV cache, oldest first.
    pub fn kv_tokens(&self) -> &[TokenId] {
        &self.kv
    }

    /// Total decode calls since the context was created.
    pub fn decode_calls(&self) -> usize {
        self.decode_calls
    }

    fn scripted_token(&self) -> TokenId {
        if self.script.is_empty() {
            return TOKEN_EOS;
        }
        if self.config.repeat_reply {
            return self.script[self.cursor % self.script.len()];
        }
        self.script.get(self.cursor).copied().unwrap_or(TOKEN_EOS)
    }

    fn refresh_logits(&mut self) {
        self.logits.iter_mut().for_each(|l| *l = 0.0);
        let next = self.scripted_token() as usize;
        if let Some(l) = self.logits.get_mut(next) {
            *l = PEAK_LOGIT;
        }
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new(StubConfig::default())
    }
}

impl LlamaBackend for StubBackend {
    fn load_model(&mut self, path: &Path, params: &ModelParams) -> Result<(), LlamaError> {
        if !path.exists() {
            return Err(LlamaError::ModelLoadFailed(format!(
                "model file not found: {}",
                path.display()
            )));
        }
        self.model_loaded = true;
        info!(
            path = %path.display(),
            gpu_layers = params.n_gpu_layers,
            mlock = params.use_mlock,
            "Simulated model loaded"
        );
        Ok(())
    }

    fn new_context(&mut self, params: &ContextParams) -> Result<(), LlamaError> {
        if !self.model_loaded {
            return Err(LlamaError::NotLoaded);
        }
        if params.n_ctx == 0 || params.n_batch == 0 {
            return Err(LlamaError::ContextFailed(format!(
                "invalid sizes n_ctx={} n_batch={}",
                params.n_ctx, params.n_batch
            )));
        }
        self.n_ctx = params.n_ctx as usize;
        self.n_batch = params.n_batch as usize;
        self.kv = Vec::with_capacity(self.n_ctx);
        self.logits = vec![0.0; N_VOCAB];
        self.cursor = 0;
        self.decode_calls = 0;
        self.has_context = true;
        self.refresh_logits();
        Ok(())
    }

    fn free(&mut self) {
        self.sampler = None;
        self.model_loaded = false;
        self.has_context = false;
        self.n_ctx = 0;
        self.kv.clear();
        self.logits.clear();
    }

    fn is_loaded(&self) -> bool {
        self.model_loaded && self.has_context
    }

    fn n_vocab(&self) -> usize {
        N_VOCAB
    }

    fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    fn tokenize(
        &self,
        text: &str,
        add_special: bool,
        parse_special: bool,
    ) -> Result<Vec<TokenId>, LlamaError> {
        if !self.model_loaded {
            return Err(LlamaError::NotLoaded);
        }
        if let Some(marker) = &self.config.fail_tokenize_on {
            if text.contains(marker.as_str()) {
                return Err(LlamaError::TokenizeFailed(format!(
                    "simulated tokenizer rejected {marker:?}"
                )));
            }
        }
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_special {
            tokens.push(TOKEN_BOS);
        }
        let mut rest = text;
        while !rest.is_empty() {
            if parse_special {
                if let Some(tail) = rest.strip_prefix(BOS_TEXT) {
                    tokens.push(TOKEN_BOS);
                    rest = tail;
                    continue;
                }
                if let Some(tail) = rest.strip_prefix(EOS_TEXT) {
                    tokens.push(TOKEN_EOS);
                    rest = tail;
                    continue;
                }
            }
            // Advance one char so the special-text checks stay on char boundaries.
            let ch_len = rest.chars().next().map_or(1, char::len_utf8);
            tokens.extend(rest.as_bytes()[..ch_len].iter().map(|&b| TokenId::from(b)));
            rest = &rest[ch_len..];
        }
        Ok(tokens)
    }

    fn token_to_piece(&self, token: TokenId) -> Vec<u8> {
        match u8::try_from(token) {
            Ok(b) => vec![b],
            // Control tokens render as nothing.
            Err(_) => Vec::new(),
        }
    }

    fn is_eog(&self, token: TokenId) -> bool {
        token == TOKEN_EOS || token == TOKEN_EOT
    }

    fn decode(&mut self, tokens: &[TokenId]) -> Result<(), LlamaError> {
        if !self.has_context {
            return Err(LlamaError::NotLoaded);
        }
        if tokens.is_empty() {
            return Ok(());
        }
        if tokens.len() > self.n_batch {
            return Err(LlamaError::DecodeFailed(format!(
                "batch of {} exceeds n_batch {}",
                tokens.len(),
                self.n_batch
            )));
        }
        if let Some(limit) = self.config.fail_decode_after {
            if self.decode_calls >= limit {
                return Err(LlamaError::DecodeFailed(
                    "simulated allocation failure".to_string(),
                ));
            }
        }
        if self.kv.len() + tokens.len() > self.n_ctx {
            return Err(LlamaError::KvCacheFull {
                used: self.kv.len(),
                capacity: self.n_ctx,
                requested: tokens.len(),
            });
        }
        if tokens.iter().any(|&t| t < 0 || t as usize >= N_VOCAB) {
            return Err(LlamaError::DecodeFailed("token out of vocabulary".to_string()));
        }

        self.decode_calls += 1;
        self.kv.extend_from_slice(tokens);

        // A single token matching the script continues the reply; anything
        // else is a new prompt and restarts it.
        if tokens.len() == 1 && tokens[0] == self.scripted_token() {
            self.cursor += 1;
            if let Some(delay) = self.config.token_delay {
                thread::sleep(delay);
            }
        } else {
            self.cursor = 0;
        }
        self.refresh_logits();

        debug!(
            n_tokens = tokens.len(),
            used = self.kv.len(),
            "Simulated decode"
        );
        Ok(())
    }

    fn set_sampler(&mut self, chain: SamplerChain) {
        self.sampler = Some(chain);
    }

    fn sample(&mut self) -> Option<TokenId> {
        let chain = self.sampler.as_mut()?;
        let token = chain.sample(&self.logits)?;
        chain.accept(token);
        Some(token)
    }

    fn reset_sampler(&mut self) {
        if let Some(chain) = self.sampler.as_mut() {
            chain.reset();
        }
    }

    fn kv_used_cells(&self) -> usize {
        self.kv.len()
    }

    fn kv_seq_rm(&mut self, from: usize) {
        self.kv.truncate(from);
    }

    fn kv_clear(&mut self) {
        self.kv.clear();
        self.cursor = 0;
        self.refresh_logits();
    }

    fn special_token_text(&self) -> (String, String) {
        (BOS_TEXT.to_string(), EOS_TEXT.to_string())
    }

    fn model_chat_template(&self, name: Option<&str>) -> Option<String> {
        match name {
            None => Some(self.config.embedded_template.clone()).filter(|t| !t.is_empty()),
            Some(name) => self
                .config
                .named_templates
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, text)| text.clone()),
        }
    }

    fn apply_chat_template(
        &self,
        template: &str,
        messages: &[ChatMessageRef<'_>],
        add_assistant: bool,
        buf: &mut [u8],
    ) -> i32 {
        let special = SpecialTokens {
            bos: BOS_TEXT,
            eos: EOS_TEXT,
        };
        match template::render(template, messages, add_assistant, special) {
            Ok(rendered) => write_rendered(&rendered, buf),
            Err(e) => {
                debug!(error = %e, "Template render failed");
                -1
            }
        }
    }
}
