//! Capability boundary to llama.cpp.
//!
//! [`LlamaBackend`] is the narrow set of primitives the session layer needs
//! from the inference library: model and context lifetime, tokenization,
//! batch decode, sampling, KV-cache cell management and chat-template
//! rendering. The shapes mirror the C API (`llama_tokenize`, `llama_decode`,
//! `llama_sampler_sample`, `llama_kv_cache_seq_rm`, `llama_chat_apply_template`, ...).
//!
//! Implementations:
//! - [`crate::inference::llama_cpp::LlamaCppBackend`] (feature `llama`): llama.cpp via `llama-cpp-2`
//! - [`crate::inference::stub::StubBackend`]: simulated model for tests and builds without the C library

use std::path::Path;

use thiserror::Error;

use crate::inference::sampler::SamplerChain;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlamaError {
    #[error("Failed to load model: {0}")]
    ModelLoadFailed(String),

    #[error("Context creation failed: {0}")]
    ContextFailed(String),

    #[error("Tokenization failed: {0}")]
    TokenizeFailed(String),

    #[error("KV cache full: {used} of {capacity} cells used, {requested} requested")]
    KvCacheFull {
        used: usize,
        capacity: usize,
        requested: usize,
    },

    #[error("Decode failed: {0}")]
    DecodeFailed(String),

    #[error("Chat template failed: {0}")]
    TemplateFailed(String),

    #[error("No model loaded")]
    NotLoaded,
}

/// Token ID type.
pub type TokenId = i32;

/// Model parameters (mirrors llama_model_params).
#[derive(Debug, Clone)]
pub struct ModelParams {
    /// Number of GPU layers to offload (negative = all).
    pub n_gpu_layers: i32,

    /// Lock the weights in RAM so they cannot be swapped out.
    pub use_mlock: bool,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            n_gpu_layers: -1,
            use_mlock: false,
        }
    }
}

/// Context parameters (mirrors llama_context_params).
#[derive(Debug, Clone)]
pub struct ContextParams {
    /// Context size in tokens.
    pub n_ctx: u32,

    /// Batch size for prompt processing.
    pub n_batch: u32,

    /// Number of threads for generation.
    pub n_threads: u32,

    /// Number of threads for batch (prompt) processing.
    pub n_threads_batch: u32,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            n_ctx: 2048,
            n_batch: 512,
            n_threads: 4,
            n_threads_batch: 4,
        }
    }
}

/// Borrowed role/content pair handed to the template renderer
/// (mirrors llama_chat_message).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatMessageRef<'a> {
    pub role: &'a str,
    pub content: &'a str,
}

/// Primitives provided by the inference library.
///
/// All calls are synchronous and may block for a long time inside decode;
/// implementations are owned by exactly one thread at a time.
pub trait LlamaBackend: Send {
    /// Load model weights from a file.
    fn load_model(&mut self, path: &Path, params: &ModelParams) -> Result<(), LlamaError>;

    /// Create the execution context (KV cache) for the loaded model.
    fn new_context(&mut self, params: &ContextParams) -> Result<(), LlamaError>;

    /// Free context and model. Safe to call when nothing is loaded.
    fn free(&mut self);

    fn is_loaded(&self) -> bool;

    /// Vocabulary size.
    fn n_vocab(&self) -> usize;

    /// Context capacity in cells (0 without a context).
    fn n_ctx(&self) -> usize;

    /// Tokenize text. `add_special` prepends BOS for the first segment of a
    /// sequence; `parse_special` maps control-token text to control tokens.
    fn tokenize(
        &self,
        text: &str,
        add_special: bool,
        parse_special: bool,
    ) -> Result<Vec<TokenId>, LlamaError>;

    /// Raw bytes of a token. A multi-byte character may span several tokens.
    fn token_to_piece(&self, token: TokenId) -> Vec<u8>;

    /// Whether the token ends generation (EOS, EOT, ...).
    fn is_eog(&self, token: TokenId) -> bool;

    /// Feed a batch of tokens through the model, appending them to the KV
    /// cache. The batch must not exceed the context's `n_batch`.
    fn decode(&mut self, tokens: &[TokenId]) -> Result<(), LlamaError>;

    /// Install the sampler chain used by [`LlamaBackend::sample`].
    fn set_sampler(&mut self, chain: SamplerChain);

    /// Sample from the logits of the last decoded token and record the pick
    /// in the chain's penalty window. `None` without a sampler or logits.
    fn sample(&mut self) -> Option<TokenId>;

    /// Forget penalty history and adaptive sampler state.
    fn reset_sampler(&mut self);

    /// Number of occupied KV cells.
    fn kv_used_cells(&self) -> usize;

    /// Remove every cell at position `from` and beyond.
    fn kv_seq_rm(&mut self, from: usize);

    /// Remove all cells.
    fn kv_clear(&mut self);

    /// BOS and EOS as they appear in rendered text.
    fn special_token_text(&self) -> (String, String);

    /// A chat template shipped with the model: the default one for `None`,
    /// or a named alternative.
    fn model_chat_template(&self, name: Option<&str>) -> Option<String>;

    /// Render `messages` with `template` into `buf`.
    ///
    /// Returns the total rendered length in bytes. A result larger than
    /// `buf.len()` means the buffer was too small and the caller must retry
    /// with a larger one; a negative result means the template failed.
    fn apply_chat_template(
        &self,
        template: &str,
        messages: &[ChatMessageRef<'_>],
        add_assistant: bool,
        buf: &mut [u8],
    ) -> i32;
}

/// Copy a finished render into a caller buffer with the
/// `llama_chat_apply_template` length contract.
pub fn write_rendered(rendered: &str, buf: &mut [u8]) -> i32 {
    let Ok(len) = i32::try_from(rendered.len()) else {
        return -1;
    };
    let n = rendered.len().min(buf.len());
    buf[..n].copy_from_slice(&rendered.as_bytes()[..n]);
    len
}
