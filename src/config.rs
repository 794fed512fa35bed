//! Runtime configuration for llama-session.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Model sizing, sampler chain, penalty, chat-template and partial-emission
//! knobs all live here and are applied when a model is loaded.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sentinel that disables an optional sampling stage.
pub const DISABLED: f32 = -1.0;

/// Template source name that means "use the model's embedded template".
pub const MODEL_TEMPLATE_SOURCE: &str = "tokenizer.chat_template";

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "llama-session", about = "Interactive chat session over a local LLM")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Model file, overrides `model.model_path` from the config file.
    #[arg(short, long)]
    pub model: Option<PathBuf>,

    /// System prompt inserted right after the model loads.
    #[arg(long)]
    pub system: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("context_size must be positive, got {0}")]
    InvalidContextSize(i32),

    #[error("batch_size must be positive, got {0}")]
    InvalidBatchSize(i32),

    #[error("batch_size ({batch}) must not exceed context_size ({context})")]
    BatchExceedsContext { batch: i32, context: i32 },

    #[error("mirostat must be 0, 1 or 2, got {0}")]
    InvalidMirostat(i32),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Model file and context sizing.
    pub model: ModelConfig,

    /// Sampler chain settings.
    pub sampling: SamplingConfig,

    /// Repetition penalties.
    pub penalties: PenaltyConfig,

    /// Chat template selection.
    pub template: TemplateConfig,

    /// Conversation behavior.
    pub chat: ChatConfig,
}

/// Model-related settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Path to the GGUF model file.
    pub model_path: PathBuf,

    /// Context size in token cells.
    pub context_size: i32,

    /// Maximum tokens per decode batch.
    pub batch_size: i32,

    /// Number of threads for computation.
    pub threads: i32,

    /// Number of layers to offload to the GPU.
    pub gpu_layers: i32,

    /// Lock model weights in RAM.
    pub use_mlock: bool,

    /// RNG seed for sampling (-1 = random).
    pub seed: i64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("./model.gguf"),
            context_size: 2048,
            batch_size: 512,
            threads: 8,
            gpu_layers: 50,
            use_mlock: false,
            seed: -1,
        }
    }
}

/// Sampler chain settings.
///
/// `top_k`, `top_p`, `typical_p` and `min_p` accept [`DISABLED`] to skip
/// that stage. A temperature at or below zero forces greedy decoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub temperature: f32,
    pub top_k: i32,
    pub top_p: f32,
    pub typical_p: f32,
    pub min_p: f32,

    /// 0 = off, 1 = mirostat v1, 2 = mirostat v2.
    pub mirostat: i32,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,
    pub mirostat_m: i32,

    /// Use the fused sampler path (partial top-k selection instead of a
    /// full-vocabulary sort).
    pub use_common_sampler: bool,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
            typical_p: 1.0,
            min_p: 0.05,
            mirostat: 0,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            mirostat_m: 100,
            use_common_sampler: false,
        }
    }
}

/// Repetition penalty settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PenaltyConfig {
    /// Window of recent tokens considered (0 = disabled, -1 = whole context).
    pub last_n: i32,

    /// Multiplicative repeat penalty (1.0 = off).
    pub repeat: f32,

    /// Frequency penalty scalar.
    pub frequency: f32,

    /// Presence penalty scalar.
    pub presence: f32,
}

impl Default for PenaltyConfig {
    fn default() -> Self {
        Self {
            last_n: 64,
            repeat: 1.1,
            frequency: 0.0,
            presence: 0.0,
        }
    }
}

impl PenaltyConfig {
    /// Whether any penalty differs from its neutral value.
    pub fn is_active(&self) -> bool {
        self.last_n != 0 || self.repeat != 1.0 || self.frequency != 0.0 || self.presence != 0.0
    }
}

/// Chat template selection.
///
/// Priority at load time: `custom_template`, then a named template from
/// `template_source`, then the model's embedded default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    /// Explicit jinja template text.
    pub custom_template: String,

    /// Name of a built-in or model-provided template.
    pub template_source: String,
}

/// Conversation behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub system_prompt: String,

    /// Insert `system_prompt` (without generating a reply) right after load.
    pub auto_insert_system_prompt: bool,

    /// Emit sentence-level partials in addition to raw tokens.
    pub emit_partials: bool,

    /// Separators that close a partial, usually sentence-ending punctuation.
    pub partial_separators: Vec<String>,

    /// Log every generated token at debug level.
    pub debug_log_model_output: bool,

    /// Generation stops once the reply ends with any of these.
    pub stop_sequences: Vec<String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            system_prompt: "You are a helpful assistant.".to_string(),
            auto_insert_system_prompt: false,
            emit_partials: true,
            partial_separators: vec![".".to_string(), "?".to_string(), "!".to_string()],
            debug_log_model_output: false,
            stop_sequences: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            config.validate()?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Check sizing and sampler settings for values the backend cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let model = &self.model;
        if model.context_size <= 0 {
            return Err(ConfigError::InvalidContextSize(model.context_size));
        }
        if model.batch_size <= 0 {
            return Err(ConfigError::InvalidBatchSize(model.batch_size));
        }
        if model.batch_size > model.context_size {
            return Err(ConfigError::BatchExceedsContext {
                batch: model.batch_size,
                context: model.context_size,
            });
        }
        if !(0..=2).contains(&self.sampling.mirostat) {
            return Err(ConfigError::InvalidMirostat(self.sampling.mirostat));
        }
        Ok(())
    }

    /// Apply command-line overrides on top of the file configuration.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(model) = &cli.model {
            self.model.model_path = model.clone();
        }
        if let Some(system) = &cli.system {
            self.chat.system_prompt = system.clone();
            self.chat.auto_insert_system_prompt = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.model.context_size, 2048);
        assert_eq!(cfg.sampling.top_k, 40);
        assert_eq!(cfg.chat.partial_separators, vec![".", "?", "!"]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_penalties_neutral_detection() {
        let mut penalties = PenaltyConfig {
            last_n: 0,
            repeat: 1.0,
            frequency: 0.0,
            presence: 0.0,
        };
        assert!(!penalties.is_active());
        penalties.presence = 0.5;
        assert!(penalties.is_active());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: Config =
            serde_json::from_str(r#"{ "model": { "context_size": 4096 } }"#).unwrap();
        assert_eq!(cfg.model.context_size, 4096);
        assert_eq!(cfg.model.batch_size, 512);
        assert_eq!(cfg.sampling.temperature, 0.8);
        assert!(!cfg.model.use_mlock);
        assert!(cfg.chat.stop_sequences.is_empty());
    }

    #[test]
    fn test_stop_sequences_from_json() {
        let cfg: Config = serde_json::from_str(
            r#"{ "chat": { "stop_sequences": ["User:", "\n\n"] }, "model": { "use_mlock": true } }"#,
        )
        .unwrap();
        assert_eq!(cfg.chat.stop_sequences, vec!["User:", "\n\n"]);
        assert!(cfg.model.use_mlock);
    }

    #[test]
    fn test_validate_rejects_oversized_batch() {
        let mut cfg = Config::default();
        cfg.model.batch_size = 4096;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::BatchExceedsContext {
                batch: 4096,
                context: 2048
            })
        );
    }
}
