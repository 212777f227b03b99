//! Contract with the inference engine.
//!
//! The harness never touches tensors or cache memory directly. Everything it
//! needs from a backend goes through [`EngineHandle`], which mirrors the
//! lifecycle (load, configure, free, deinit) and forward-step surface of a
//! native runtime.

mod lifecycle;
mod tokenizer;

use std::path::Path;

use thiserror::Error;

use crate::config::GenerationConfig;
use crate::device::DeviceSet;

pub use lifecycle::{ModelInstance, ModelState, Teardown};
pub use tokenizer::{resolve_tokenizer_path, HfCodec, TextCodec};

/// Opaque token id as produced by the tokenizer and the engine.
pub type Token = u32;

/// Failures reported by an engine, one variant per documented native code.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("input is empty or exceeds the maximum length: {0}")]
    InvalidInput(String),
    #[error("cannot create handle: {0}")]
    HandleCreation(String),
    #[error("cannot create runtime: {0}")]
    RuntimeCreation(String),
    #[error("cannot load model (wrong key?): {0}")]
    ModelLoad(String),
    #[error("cannot run inference: {0}")]
    Inference(String),
    #[error("engine code {code}: {detail}")]
    Unknown { code: i32, detail: String },
}

impl EngineError {
    pub fn from_code(code: i32, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match code {
            -1 => Self::InvalidInput(detail),
            -2 => Self::HandleCreation(detail),
            -3 => Self::RuntimeCreation(detail),
            -4 => Self::ModelLoad(detail),
            -5 => Self::Inference(detail),
            code => Self::Unknown { code, detail },
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidInput(_) => -1,
            Self::HandleCreation(_) => -2,
            Self::RuntimeCreation(_) => -3,
            Self::ModelLoad(_) => -4,
            Self::Inference(_) => -5,
            Self::Unknown { code, .. } => *code,
        }
    }
}

/// A prefill request: the full prompt plus where its shared prefix ends.
///
/// `tokens[..shared_len]` is the shared prefix, `tokens[shared_len..]` the
/// unshared tail. A `normal` prefill computes everything and may retain the
/// cache at the boundary; a `share` prefill reuses that retained cache and
/// only computes the tail.
#[derive(Debug, Clone, Copy)]
pub struct Prefill<'a> {
    pub tokens: &'a [Token],
    pub shared_len: usize,
}

impl<'a> Prefill<'a> {
    pub fn new(tokens: &'a [Token], shared_len: usize) -> Self {
        Self {
            tokens,
            shared_len: shared_len.min(tokens.len()),
        }
    }

    pub fn shared(&self) -> &'a [Token] {
        &self.tokens[..self.shared_len]
    }

    pub fn tail(&self) -> &'a [Token] {
        &self.tokens[self.shared_len..]
    }
}

/// Capability interface of an inference backend.
///
/// All calls block the caller for their full duration. Implementations keep a
/// session-wide sequence counter ([`EngineHandle::total_length`]) that spans
/// prefill and every generated token.
pub trait EngineHandle {
    fn load(&mut self, devices: &DeviceSet, weights: &Path) -> Result<(), EngineError>;

    /// Applies sampling parameters. Must precede the first forward step.
    fn configure(&mut self, config: &GenerationConfig);

    fn forward_first(&mut self, prefill: Prefill<'_>) -> Result<Token, EngineError>;

    fn forward_shared(&mut self, prefill: Prefill<'_>) -> Result<Token, EngineError>;

    fn forward_next(&mut self) -> Result<Token, EngineError>;

    fn total_length(&self) -> usize;

    fn max_sequence_length(&self) -> usize;

    fn init_decryption(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    fn deinit_decryption(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Releases device memory but keeps the engine resident for a new load.
    fn free_devices(&mut self) -> Result<(), EngineError>;

    /// Full teardown.
    fn deinit(&mut self) -> Result<(), EngineError>;
}

impl<E: EngineHandle + ?Sized> EngineHandle for Box<E> {
    fn load(&mut self, devices: &DeviceSet, weights: &Path) -> Result<(), EngineError> {
        (**self).load(devices, weights)
    }

    fn configure(&mut self, config: &GenerationConfig) {
        (**self).configure(config)
    }

    fn forward_first(&mut self, prefill: Prefill<'_>) -> Result<Token, EngineError> {
        (**self).forward_first(prefill)
    }

    fn forward_shared(&mut self, prefill: Prefill<'_>) -> Result<Token, EngineError> {
        (**self).forward_shared(prefill)
    }

    fn forward_next(&mut self) -> Result<Token, EngineError> {
        (**self).forward_next()
    }

    fn total_length(&self) -> usize {
        (**self).total_length()
    }

    fn max_sequence_length(&self) -> usize {
        (**self).max_sequence_length()
    }

    fn init_decryption(&mut self) -> Result<(), EngineError> {
        (**self).init_decryption()
    }

    fn deinit_decryption(&mut self) -> Result<(), EngineError> {
        (**self).deinit_decryption()
    }

    fn free_devices(&mut self) -> Result<(), EngineError> {
        (**self).free_devices()
    }

    fn deinit(&mut self) -> Result<(), EngineError> {
        (**self).deinit()
    }
}
