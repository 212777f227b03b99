//! Deterministic engine and codec.
//!
//! Used by the test-suite and by `--backend stub`, which runs a full scenario
//! without weights or a tokenizer file. The engine replays a fixed token
//! script and records every call it receives.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::config::GenerationConfig;
use crate::device::DeviceSet;
use crate::engine::{EngineError, EngineHandle, Prefill, TextCodec, Token};
use crate::error::{HarnessError, Result};

/// End-of-sequence token of [`ByteCodec`]; one past the byte range.
pub const BYTE_EOS: Token = 256;

const DEFAULT_REPLY: &str = "The shared prefix was reused.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Load(PathBuf),
    Configure,
    ForwardFirst { len: usize, shared_len: usize },
    ForwardShared { len: usize, shared_len: usize, reused: bool },
    ForwardNext,
    InitDecryption,
    DeinitDecryption,
    FreeDevices,
    Deinit,
}

/// Replays `script` (cycling) from the start of every prefill.
#[derive(Debug, Clone)]
pub struct ScriptedEngine {
    script: Vec<Token>,
    cursor: usize,
    max_seq_len: usize,
    total_len: usize,
    loaded: Option<PathBuf>,
    configured: bool,
    resident_prefix: Option<Vec<Token>>,
    load_failures: HashMap<PathBuf, i32>,
    decryption_failure: Option<i32>,
    fail_after_next: Option<usize>,
    next_calls: usize,
    calls: Vec<EngineCall>,
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        let mut script: Vec<Token> = DEFAULT_REPLY.bytes().map(Token::from).collect();
        script.push(BYTE_EOS);
        Self::new(script, 4096)
    }
}

impl ScriptedEngine {
    pub fn new(script: Vec<Token>, max_seq_len: usize) -> Self {
        assert!(!script.is_empty(), "script must contain at least one token");
        Self {
            script,
            cursor: 0,
            max_seq_len,
            total_len: 0,
            loaded: None,
            configured: false,
            resident_prefix: None,
            load_failures: HashMap::new(),
            decryption_failure: None,
            fail_after_next: None,
            next_calls: 0,
            calls: Vec::new(),
        }
    }

    /// Makes `load` of `weights` fail with the given native error code.
    pub fn fail_load(mut self, weights: impl Into<PathBuf>, code: i32) -> Self {
        self.load_failures.insert(weights.into(), code);
        self
    }

    /// Makes `init_decryption` fail with the given native error code.
    pub fn fail_decryption(mut self, code: i32) -> Self {
        self.decryption_failure = Some(code);
        self
    }

    /// Makes `forward_next` fail once `n` next-steps have succeeded since the
    /// last prefill.
    pub fn fail_after_next(mut self, n: usize) -> Self {
        self.fail_after_next = Some(n);
        self
    }

    pub fn calls(&self) -> &[EngineCall] {
        &self.calls
    }

    pub fn count(&self, pred: impl Fn(&EngineCall) -> bool) -> usize {
        self.calls.iter().filter(|c| pred(c)).count()
    }

    pub fn loaded_weights(&self) -> Option<&Path> {
        self.loaded.as_deref()
    }

    fn emit(&mut self) -> Token {
        let token = self.script[self.cursor % self.script.len()];
        self.cursor += 1;
        token
    }

    fn check_ready(&self) -> Result<(), EngineError> {
        if self.loaded.is_none() {
            return Err(EngineError::Inference("no model loaded".to_string()));
        }
        if !self.configured {
            return Err(EngineError::Inference(
                "generation config not applied".to_string(),
            ));
        }
        Ok(())
    }

    fn check_prompt(&self, tokens: &[Token]) -> Result<(), EngineError> {
        if tokens.is_empty() || tokens.len() >= self.max_seq_len {
            return Err(EngineError::InvalidInput(format!(
                "{} tokens for a context of {}",
                tokens.len(),
                self.max_seq_len
            )));
        }
        Ok(())
    }

    fn start_sequence(&mut self, prompt_len: usize) -> Token {
        self.cursor = 0;
        self.next_calls = 0;
        self.total_len = prompt_len + 1;
        self.emit()
    }
}

impl EngineHandle for ScriptedEngine {
    fn load(&mut self, _devices: &DeviceSet, weights: &Path) -> Result<(), EngineError> {
        self.calls.push(EngineCall::Load(weights.to_path_buf()));
        if let Some(code) = self.load_failures.get(weights) {
            return Err(EngineError::from_code(
                *code,
                format!("scripted failure for {}", weights.display()),
            ));
        }
        self.loaded = Some(weights.to_path_buf());
        self.configured = false;
        self.resident_prefix = None;
        self.total_len = 0;
        Ok(())
    }

    fn configure(&mut self, _config: &GenerationConfig) {
        self.calls.push(EngineCall::Configure);
        self.configured = true;
    }

    fn forward_first(&mut self, prefill: Prefill<'_>) -> Result<Token, EngineError> {
        self.calls.push(EngineCall::ForwardFirst {
            len: prefill.tokens.len(),
            shared_len: prefill.shared_len,
        });
        self.check_ready()?;
        self.check_prompt(prefill.tokens)?;
        if prefill.shared_len > 0 {
            self.resident_prefix = Some(prefill.shared().to_vec());
        }
        Ok(self.start_sequence(prefill.tokens.len()))
    }

    fn forward_shared(&mut self, prefill: Prefill<'_>) -> Result<Token, EngineError> {
        let reused = self.resident_prefix.as_deref() == Some(prefill.shared());
        self.calls.push(EngineCall::ForwardShared {
            len: prefill.tokens.len(),
            shared_len: prefill.shared_len,
            reused,
        });
        self.check_ready()?;
        self.check_prompt(prefill.tokens)?;
        if prefill.tail().is_empty() {
            return Err(EngineError::InvalidInput(
                "shared prefill needs a non-empty tail".to_string(),
            ));
        }
        if !reused {
            self.resident_prefix = Some(prefill.shared().to_vec());
        }
        Ok(self.start_sequence(prefill.tokens.len()))
    }

    fn forward_next(&mut self) -> Result<Token, EngineError> {
        self.calls.push(EngineCall::ForwardNext);
        self.check_ready()?;
        if self.fail_after_next == Some(self.next_calls) {
            return Err(EngineError::Inference("scripted decode failure".to_string()));
        }
        if self.total_len >= self.max_seq_len {
            return Err(EngineError::InvalidInput("context is full".to_string()));
        }
        self.next_calls += 1;
        self.total_len += 1;
        Ok(self.emit())
    }

    fn total_length(&self) -> usize {
        self.total_len
    }

    fn max_sequence_length(&self) -> usize {
        self.max_seq_len
    }

    fn init_decryption(&mut self) -> Result<(), EngineError> {
        self.calls.push(EngineCall::InitDecryption);
        match self.decryption_failure {
            Some(code) => Err(EngineError::from_code(code, "scripted decryption failure")),
            None => Ok(()),
        }
    }

    fn deinit_decryption(&mut self) -> Result<(), EngineError> {
        self.calls.push(EngineCall::DeinitDecryption);
        Ok(())
    }

    fn free_devices(&mut self) -> Result<(), EngineError> {
        self.calls.push(EngineCall::FreeDevices);
        self.loaded = None;
        self.configured = false;
        self.resident_prefix = None;
        Ok(())
    }

    fn deinit(&mut self) -> Result<(), EngineError> {
        self.calls.push(EngineCall::Deinit);
        self.loaded = None;
        self.configured = false;
        self.resident_prefix = None;
        self.total_len = 0;
        Ok(())
    }
}

/// One token per UTF-8 byte, plus [`BYTE_EOS`].
///
/// Multi-byte characters span several tokens, so decoding them one token at
/// a time yields replacement characters while decoding the whole buffer
/// yields the character.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteCodec;

impl TextCodec for ByteCodec {
    fn encode(&self, text: &str) -> Result<Vec<Token>> {
        if text.contains('\0') {
            return Err(HarnessError::Encoding(
                "NUL bytes are not encodable".to_string(),
            ));
        }
        Ok(text.bytes().map(Token::from).collect())
    }

    fn decode(&self, tokens: &[Token], skip_special: bool) -> Result<String> {
        let mut bytes = Vec::with_capacity(tokens.len());
        for &token in tokens {
            match token {
                t if t < BYTE_EOS => bytes.push(t as u8),
                BYTE_EOS if skip_special => {}
                BYTE_EOS => bytes.extend_from_slice(b"<eos>"),
                other => {
                    return Err(HarnessError::Encoding(format!("unknown token {}", other)));
                }
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn eos_token(&self) -> Token {
        BYTE_EOS
    }
}
