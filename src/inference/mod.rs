//! Model-facing layer.
//!
//! - [`llama_ffi`]: Capability boundary to llama.cpp
//! - `llama_cpp`: llama.cpp backend (feature `llama`)
//! - [`stub`]: Simulated backend
//! - [`template`]: Chat-template registry and renderer
//! - [`sampler`]: Penalty and sampling chain
//! - [`engine`]: Inference engine used by a session

pub mod engine;
pub mod llama_ffi;
#[cfg(feature = "llama")]
pub mod llama_cpp;
pub mod sampler;
pub mod stub;
pub mod template;
