//! llama.cpp backend over the `llama-cpp-2` bindings (feature `llama`).
//!
//! Positions are tracked here rather than queried from the KV cache: every
//! decode appends at `n_past`, and `kv_seq_rm` truncates sequence 0 back to
//! a position. Sampling runs a native `llama_sampler` chain built from the
//! configured [`SamplerChain`].

use std::num::NonZeroU32;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend as LlamaRuntime;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaChatTemplate, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use llama_cpp_2::{send_logs_to_tracing, DecodeError, LogOptions};
use tracing::{debug, info, warn};

use crate::inference::llama_ffi::{
    write_rendered, ChatMessageRef, ContextParams, LlamaBackend, LlamaError, ModelParams, TokenId,
};
use crate::inference::sampler::{SamplerChain, Stage};
use crate::inference::template::{self, SpecialTokens};

/// llama.cpp may only be initialized once per process.
static RUNTIME: OnceLock<LlamaRuntime> = OnceLock::new();
static RUNTIME_INIT: Mutex<()> = Mutex::new(());

fn runtime() -> Result<&'static LlamaRuntime, LlamaError> {
    if let Some(runtime) = RUNTIME.get() {
        return Ok(runtime);
    }
    let _guard = RUNTIME_INIT
        .lock()
        .map_err(|_| LlamaError::ModelLoadFailed("backend init lock poisoned".to_string()))?;
    if let Some(runtime) = RUNTIME.get() {
        return Ok(runtime);
    }
    send_logs_to_tracing(LogOptions::default().with_logs_enabled(true));
    let runtime = LlamaRuntime::init().map_err(|e| LlamaError::ModelLoadFailed(e.to_string()))?;
    Ok(RUNTIME.get_or_init(|| runtime))
}

/// GPU layer count for llama.cpp; negative offloads everything.
fn gpu_layers(n: i32) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Map one configured stage onto its native sampler.
fn native_stage(stage: &Stage, seed: u32, penalty_window: usize) -> LlamaSampler {
    match stage {
        Stage::Penalties(p) => LlamaSampler::penalties(
            i32::try_from(penalty_window).unwrap_or(i32::MAX),
            p.repeat,
            p.frequency,
            p.presence,
        ),
        Stage::Greedy => LlamaSampler::greedy(),
        Stage::TopK(k) => LlamaSampler::top_k(i32::try_from(*k).unwrap_or(i32::MAX)),
        Stage::Typical(p) => LlamaSampler::typical(*p, 1),
        Stage::TopP(p) => LlamaSampler::top_p(*p, 1),
        Stage::MinP(p) => LlamaSampler::min_p(*p, 1),
        Stage::Temperature(t) => LlamaSampler::temp(*t),
        Stage::Dist => LlamaSampler::dist(seed),
        Stage::MirostatV1 {
            tau, eta, m, n_vocab, ..
        } => LlamaSampler::mirostat(
            i32::try_from(*n_vocab).unwrap_or(i32::MAX),
            seed,
            *tau,
            *eta,
            i32::try_from(*m).unwrap_or(i32::MAX),
        ),
        Stage::MirostatV2 { tau, eta, .. } => LlamaSampler::mirostat_v2(seed, *tau, *eta),
    }
}

/// The native sampler chain for `chain`, stage for stage.
pub fn build_sampler(chain: &SamplerChain) -> LlamaSampler {
    // llama.cpp treats 0xFFFFFFFF as "random"; the chain already resolved one.
    let seed = chain.seed() as u32;
    let stages: Vec<LlamaSampler> = chain
        .stages()
        .iter()
        .map(|stage| native_stage(stage, seed, chain.penalty_window()))
        .collect();
    LlamaSampler::chain_simple(stages)
}

/// A model and its context, loaded through llama.cpp.
///
/// Field order is drop order: the sampler and context go before the model
/// they were created from.
pub struct LlamaCppBackend {
    sampler: Option<LlamaSampler>,
    chain: Option<SamplerChain>,
    ctx: Option<LlamaContext<'static>>,
    batch: Option<LlamaBatch>,
    model: Option<Box<LlamaModel>>,

    n_batch: usize,
    n_past: usize,

    /// Batch index holding the logits of the last decoded token.
    logits_at: Option<i32>,
}

// SAFETY: the session worker owns the backend exclusively; llama.cpp model,
// context and sampler handles are only touched from whichever single thread
// holds it.
unsafe impl Send for LlamaCppBackend {}

impl LlamaCppBackend {
    pub fn new() -> Self {
        Self {
            sampler: None,
            chain: None,
            ctx: None,
            batch: None,
            model: None,
            n_batch: 0,
            n_past: 0,
            logits_at: None,
        }
    }

    fn model(&self) -> Result<&LlamaModel, LlamaError> {
        self.model.as_deref().ok_or(LlamaError::NotLoaded)
    }

    fn render(
        &self,
        template: &str,
        messages: &[ChatMessageRef<'_>],
        add_assistant: bool,
    ) -> Result<String, LlamaError> {
        let (bos, eos) = self.special_token_text();
        let special = SpecialTokens {
            bos: &bos,
            eos: &eos,
        };
        let jinja_err = match template::render(template, messages, add_assistant, special) {
            Ok(rendered) => return Ok(rendered),
            Err(e) => e,
        };

        // llama.cpp's own formatter recognizes the common templates by their markers.
        debug!(error = %jinja_err, "Jinja render failed, trying llama.cpp formatter");
        let model = self.model()?;
        let native = LlamaChatTemplate::new(template)
            .map_err(|e| LlamaError::TemplateFailed(e.to_string()))?;
        let chat = messages
            .iter()
            .map(|m| LlamaChatMessage::new(m.role.to_string(), m.content.to_string()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| LlamaError::TemplateFailed(e.to_string()))?;
        model
            .apply_chat_template(&native, &chat, add_assistant)
            .map_err(|e| LlamaError::TemplateFailed(format!("{jinja_err}; {e}")))
    }
}

impl Default for LlamaCppBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LlamaBackend for LlamaCppBackend {
    fn load_model(&mut self, path: &Path, params: &ModelParams) -> Result<(), LlamaError> {
        self.free();
        let runtime = runtime()?;
        let model_params = LlamaModelParams::default()
            .with_n_gpu_layers(gpu_layers(params.n_gpu_layers))
            .with_use_mlock(params.use_mlock);
        let model = LlamaModel::load_from_file(runtime, path, &model_params)
            .map_err(|e| LlamaError::ModelLoadFailed(format!("{}: {e}", path.display())))?;
        info!(
            path = %path.display(),
            n_vocab = model.n_vocab(),
            gpu_layers = params.n_gpu_layers,
            "llama.cpp model loaded"
        );
        self.model = Some(Box::new(model));
        Ok(())
    }

    fn new_context(&mut self, params: &ContextParams) -> Result<(), LlamaError> {
        let runtime = runtime()?;
        let model = self.model.as_deref().ok_or(LlamaError::NotLoaded)?;
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(params.n_ctx))
            .with_n_batch(params.n_batch)
            .with_n_threads(params.n_threads as i32)
            .with_n_threads_batch(params.n_threads_batch as i32);
        let ctx = model
            .new_context(runtime, ctx_params)
            .map_err(|e| LlamaError::ContextFailed(e.to_string()))?;

        // SAFETY: the model is boxed, so its address is stable, and `free`
        // drops the context before the box. The runtime is a process static.
        let ctx = unsafe { std::mem::transmute::<LlamaContext<'_>, LlamaContext<'static>>(ctx) };

        self.n_batch = params.n_batch as usize;
        self.batch = Some(LlamaBatch::new(self.n_batch, 1));
        self.ctx = Some(ctx);
        self.n_past = 0;
        self.logits_at = None;
        Ok(())
    }

    fn free(&mut self) {
        self.sampler = None;
        self.chain = None;
        self.batch = None;
        self.ctx = None;
        self.model = None;
        self.n_past = 0;
        self.logits_at = None;
    }

    fn is_loaded(&self) -> bool {
        self.model.is_some() && self.ctx.is_some()
    }

    fn n_vocab(&self) -> usize {
        self.model
            .as_deref()
            .map_or(0, |m| usize::try_from(m.n_vocab()).unwrap_or(0))
    }

    fn n_ctx(&self) -> usize {
        self.ctx.as_ref().map_or(0, |c| c.n_ctx() as usize)
    }

    fn tokenize(
        &self,
        text: &str,
        add_special: bool,
        _parse_special: bool,
    ) -> Result<Vec<TokenId>, LlamaError> {
        let add_bos = if add_special {
            AddBos::Always
        } else {
            AddBos::Never
        };
        let tokens = self
            .model()?
            .str_to_token(text, add_bos)
            .map_err(|e| LlamaError::TokenizeFailed(e.to_string()))?;
        Ok(tokens.into_iter().map(|t| t.0).collect())
    }

    fn token_to_piece(&self, token: TokenId) -> Vec<u8> {
        let Ok(model) = self.model() else {
            return Vec::new();
        };
        match model.token_to_bytes(LlamaToken::new(token), Special::Tokenize) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(token, error = %e, "Token has no printable piece");
                Vec::new()
            }
        }
    }

    fn is_eog(&self, token: TokenId) -> bool {
        self.model()
            .is_ok_and(|m| m.is_eog_token(LlamaToken::new(token)))
    }

    fn decode(&mut self, tokens: &[TokenId]) -> Result<(), LlamaError> {
        if tokens.is_empty() {
            return Ok(());
        }
        let capacity = self.n_ctx();
        let (Some(ctx), Some(batch)) = (self.ctx.as_mut(), self.batch.as_mut()) else {
            return Err(LlamaError::NotLoaded);
        };
        if tokens.len() > self.n_batch {
            return Err(LlamaError::DecodeFailed(format!(
                "batch of {} exceeds n_batch {}",
                tokens.len(),
                self.n_batch
            )));
        }
        if self.n_past + tokens.len() > capacity {
            return Err(LlamaError::KvCacheFull {
                used: self.n_past,
                capacity,
                requested: tokens.len(),
            });
        }

        batch.clear();
        let last = tokens.len() - 1;
        for (i, &token) in tokens.iter().enumerate() {
            let pos = (self.n_past + i) as i32;
            batch
                .add(LlamaToken::new(token), pos, &[0], i == last)
                .map_err(|e| LlamaError::DecodeFailed(e.to_string()))?;
        }

        if let Err(e) = ctx.decode(batch) {
            // Drop anything a failed batch may have left behind.
            let _ = ctx.clear_kv_cache_seq(Some(0), Some(self.n_past as u32), None);
            return Err(match e {
                DecodeError::NoKvCacheSlot => LlamaError::KvCacheFull {
                    used: self.n_past,
                    capacity,
                    requested: tokens.len(),
                },
                e => LlamaError::DecodeFailed(e.to_string()),
            });
        }

        self.n_past += tokens.len();
        self.logits_at = Some(batch.n_tokens() - 1);
        Ok(())
    }

    fn set_sampler(&mut self, chain: SamplerChain) {
        self.sampler = Some(build_sampler(&chain));
        self.chain = Some(chain);
    }

    fn sample(&mut self) -> Option<TokenId> {
        let ctx = self.ctx.as_ref()?;
        let at = self.logits_at?;
        // Sampling also accepts the token into the chain's history.
        let token = self.sampler.as_mut()?.sample(ctx, at);
        Some(token.0)
    }

    fn reset_sampler(&mut self) {
        if let Some(chain) = &self.chain {
            self.sampler = Some(build_sampler(chain));
        }
    }

    fn kv_used_cells(&self) -> usize {
        self.n_past
    }

    fn kv_seq_rm(&mut self, from: usize) {
        let Some(ctx) = self.ctx.as_mut() else {
            return;
        };
        let from = from.min(self.n_past);
        match ctx.clear_kv_cache_seq(Some(0), Some(from as u32), None) {
            Ok(_) => self.n_past = from,
            Err(e) => warn!(from, error = %e, "KV sequence removal failed"),
        }
    }

    fn kv_clear(&mut self) {
        if let Some(ctx) = self.ctx.as_mut() {
            ctx.clear_kv_cache();
        }
        self.n_past = 0;
        self.logits_at = None;
    }

    fn special_token_text(&self) -> (String, String) {
        let Ok(model) = self.model() else {
            return (String::new(), String::new());
        };
        let text = |token| model.token_to_str(token, Special::Tokenize).unwrap_or_default();
        (text(model.token_bos()), text(model.token_eos()))
    }

    fn model_chat_template(&self, name: Option<&str>) -> Option<String> {
        let template = self.model().ok()?.chat_template(name).ok()?;
        template.as_c_str().to_str().ok().map(str::to_owned)
    }

    fn apply_chat_template(
        &self,
        template: &str,
        messages: &[ChatMessageRef<'_>],
        add_assistant: bool,
        buf: &mut [u8],
    ) -> i32 {
        match self.render(template, messages, add_assistant) {
            Ok(rendered) => write_rendered(&rendered, buf),
            Err(e) => {
                debug!(error = %e, "Template render failed");
                -1
            }
        }
    }
}
