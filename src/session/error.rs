//! Session error taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inference::llama_ffi::LlamaError;

/// Stable numeric codes delivered with the error callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ErrorCode {
    ModelLoadFailure = 10,
    TemplateRenderFailure = 20,
    TokenizeFailure = 30,
    ContextOverflow = 40,
    DecodeFailure = 50,
    InvalidOperation = 60,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Model load failed: {0}")]
    ModelLoadFailure(String),

    #[error("Chat template render failed: {0}")]
    TemplateRenderFailure(String),

    #[error("Tokenization failed: {0}")]
    TokenizeFailure(String),

    #[error("Context overflow: {used} used + {requested} requested > {capacity} cells")]
    ContextOverflow {
        used: usize,
        requested: usize,
        capacity: usize,
    },

    #[error("Decode failed: {0}")]
    DecodeFailure(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl SessionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::ModelLoadFailure(_) => ErrorCode::ModelLoadFailure,
            SessionError::TemplateRenderFailure(_) => ErrorCode::TemplateRenderFailure,
            SessionError::TokenizeFailure(_) => ErrorCode::TokenizeFailure,
            SessionError::ContextOverflow { .. } => ErrorCode::ContextOverflow,
            SessionError::DecodeFailure(_) => ErrorCode::DecodeFailure,
            SessionError::InvalidOperation(_) => ErrorCode::InvalidOperation,
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        SessionError::InvalidOperation(msg.into())
    }
}

impl From<LlamaError> for SessionError {
    fn from(e: LlamaError) -> Self {
        match e {
            LlamaError::ModelLoadFailed(_) | LlamaError::ContextFailed(_) => {
                SessionError::ModelLoadFailure(e.to_string())
            }
            LlamaError::TokenizeFailed(_) => SessionError::TokenizeFailure(e.to_string()),
            LlamaError::KvCacheFull { .. } | LlamaError::DecodeFailed(_) => {
                SessionError::DecodeFailure(e.to_string())
            }
            LlamaError::TemplateFailed(_) => SessionError::TemplateRenderFailure(e.to_string()),
            LlamaError::NotLoaded => SessionError::InvalidOperation(e.to_string()),
        }
    }
}
