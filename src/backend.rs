//! GGUF backend on top of candle's quantized transformer implementations.
//!
//! Prefix reuse works by cloning the model (and with it the attention cache)
//! right after the shared prefix has been prefilled. A later `share` prefill
//! over the same prefix restores that clone and only runs the tail. Backends
//! whose weights cannot be cloned fall back to recomputing the prefix.

use std::fs::File;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::quantized_llama;
use candle_transformers::models::quantized_qwen2;

use crate::config::{GenerationConfig, GenerationMode};
use crate::device::DeviceSet;
use crate::engine::{EngineError, EngineHandle, Prefill, Token};

const DEFAULT_CONTEXT_LENGTH: usize = 4096;
const SAMPLER_SEED: u64 = 299_792_458;

pub enum RuntimeModel {
    Llama(quantized_llama::ModelWeights),
    Qwen2(quantized_qwen2::ModelWeights),
}

impl RuntimeModel {
    /// Loads weights and returns them with the model's context length.
    pub fn load_from_gguf(path: &Path, device: &Device) -> Result<(Self, usize)> {
        let mut file = File::open(path)
            .with_context(|| format!("failed to open model file {}", path.display()))?;
        let content = gguf_file::Content::read(&mut file)
            .map_err(|e| anyhow!("{}: not a readable GGUF file: {}", path.display(), e))?;

        let arch = match content.metadata.get("general.architecture") {
            Some(value) => value.to_string().cloned().unwrap_or_default(),
            None => arch_from_filename(path),
        };
        let context_length = content
            .metadata
            .get(&format!("{}.context_length", arch))
            .and_then(|v| {
                v.to_u32()
                    .map(|n| n as usize)
                    .or_else(|_| v.to_u64().map(|n| n as usize))
                    .ok()
            })
            .unwrap_or(DEFAULT_CONTEXT_LENGTH);

        let model = match arch.as_str() {
            "llama" => {
                let model = quantized_llama::ModelWeights::from_gguf(content, &mut file, device)?;
                // rotary tables stop at MAX_SEQ_LEN whatever the file claims
                let context_length = context_length.min(quantized_llama::MAX_SEQ_LEN);
                return Ok((Self::Llama(model), context_length));
            }
            "qwen2" => Self::Qwen2(quantized_qwen2::ModelWeights::from_gguf(
                content, &mut file, device,
            )?),
            other => bail!("unsupported GGUF architecture '{}'", other),
        };
        Ok((model, context_length))
    }

    pub fn forward(&mut self, input: &Tensor, position: usize) -> candle_core::Result<Tensor> {
        match self {
            Self::Llama(model) => model.forward(input, position),
            Self::Qwen2(model) => model.forward(input, position),
        }
    }

    pub fn duplicate_if_supported(&self) -> Option<Self> {
        match self {
            Self::Llama(model) => Some(Self::Llama(model.clone())),
            Self::Qwen2(_) => None,
        }
    }
}

fn arch_from_filename(path: &Path) -> String {
    let lowered = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_lowercase();
    if lowered.contains("qwen") {
        "qwen2".to_string()
    } else {
        "llama".to_string()
    }
}

struct Sampler {
    processor: LogitsProcessor,
    mode: GenerationMode,
    repeat_penalty: f32,
    repeat_last_n: usize,
}

impl Sampler {
    fn new(config: &GenerationConfig) -> Self {
        let sampling = match config.generation_mode {
            GenerationMode::Greedy => Sampling::ArgMax,
            GenerationMode::PenaltySample => Sampling::TopP {
                p: config.top_p,
                temperature: config.temperature,
            },
        };
        Self {
            processor: LogitsProcessor::from_sampling(SAMPLER_SEED, sampling),
            mode: config.generation_mode,
            repeat_penalty: config.repeat_penalty as f32,
            repeat_last_n: config.repeat_last_n,
        }
    }
}

/// Cache state captured at the end of a shared prefix.
struct PrefixSnapshot {
    tokens: Vec<Token>,
    model: RuntimeModel,
}

#[derive(Default)]
pub struct CandleEngine {
    device: Option<Device>,
    model: Option<RuntimeModel>,
    snapshot: Option<PrefixSnapshot>,
    sampler: Option<Sampler>,
    /// Every token in the current sequence, prompt and generated.
    context: Vec<Token>,
    max_seq_len: usize,
    decrypting: bool,
}

impl CandleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn loaded(&mut self) -> Result<(&mut RuntimeModel, &Device), EngineError> {
        match (self.model.as_mut(), self.device.as_ref()) {
            (Some(model), Some(device)) => Ok((model, device)),
            _ => Err(EngineError::Inference("no model loaded".to_string())),
        }
    }

    fn sample(&mut self, logits: &Tensor) -> Result<Token, EngineError> {
        let sampler = self
            .sampler
            .as_mut()
            .ok_or_else(|| EngineError::Inference("generation config not applied".to_string()))?;

        let logits = logits.squeeze(0)?;
        let logits = if logits.dims().len() > 1 {
            logits.squeeze(0)?
        } else {
            logits
        };
        let logits = logits.to_dtype(DType::F32)?;

        let logits = if sampler.mode == GenerationMode::PenaltySample && sampler.repeat_penalty != 1.0 {
            let start = self.context.len().saturating_sub(sampler.repeat_last_n);
            candle_transformers::utils::apply_repeat_penalty(
                &logits,
                sampler.repeat_penalty,
                &self.context[start..],
            )?
        } else {
            logits
        };

        Ok(sampler.processor.sample(&logits)?)
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

    fn release(&mut self) {
        self.snapshot = None;
        self.model = None;
        self.device = None;
        self.sampler = None;
        self.context.clear();
    }
}

fn step(
    model: &mut RuntimeModel,
    device: &Device,
    tokens: &[Token],
    position: usize,
) -> candle_core::Result<Tensor> {
    let input = Tensor::new(tokens, device)?.unsqueeze(0)?;
    model.forward(&input, position)
}

/// Feeds `tokens` starting at `position` and returns the logits of the last
/// one.
///
/// The quantized models only build a causal mask that fits an empty cache, so
/// a multi-token chunk is allowed at position 0 only. Anything after that goes
/// in one token at a time.
fn prefill_from(
    model: &mut RuntimeModel,
    device: &Device,
    tokens: &[Token],
    position: usize,
) -> Result<Tensor, EngineError> {
    if tokens.is_empty() {
        return Err(EngineError::InvalidInput("nothing to prefill".to_string()));
    }
    if position == 0 {
        return Ok(step(model, device, tokens, 0)?);
    }

    let mut logits = None;
    for (offset, token) in tokens.iter().enumerate() {
        logits = Some(step(model, device, std::slice::from_ref(token), position + offset)?);
    }
    logits.ok_or_else(|| EngineError::Inference("prefill produced no logits".to_string()))
}

impl From<candle_core::Error> for EngineError {
    fn from(err: candle_core::Error) -> Self {
        EngineError::Inference(err.to_string())
    }
}

impl EngineHandle for CandleEngine {
    fn load(&mut self, devices: &DeviceSet, weights: &Path) -> Result<(), EngineError> {
        if devices.ids().len() > 1 {
            tracing::warn!(devices = %devices, "candle backend runs on the first device only");
        }
        let device = Device::cuda_if_available(devices.primary() as usize)
            .map_err(|e| EngineError::RuntimeCreation(e.to_string()))?;
        let (model, context_length) = RuntimeModel::load_from_gguf(weights, &device)
            .map_err(|e| EngineError::ModelLoad(format!("{:#}", e)))?;

        tracing::debug!(context_length, ?device, "candle model ready");
        self.release();
        self.device = Some(device);
        self.model = Some(model);
        self.max_seq_len = context_length;
        Ok(())
    }

    fn configure(&mut self, config: &GenerationConfig) {
        if let Some(lib) = &config.lib_path {
            tracing::warn!(lib = %lib.display(), "kernel library path is ignored by the candle backend");
        }
        self.sampler = Some(Sampler::new(config));
    }

    fn forward_first(&mut self, prefill: Prefill<'_>) -> Result<Token, EngineError> {
        self.check_prompt(prefill.tokens)?;
        self.snapshot = None;
        let split = prefill.shared_len > 0 && !prefill.tail().is_empty();

        let (model, device) = self.loaded()?;
        let device = device.clone();
        let (logits, snapshot) = if split {
            prefill_from(model, &device, prefill.shared(), 0)?;
            let snapshot = model.duplicate_if_supported().map(|copy| PrefixSnapshot {
                tokens: prefill.shared().to_vec(),
                model: copy,
            });
            let logits = prefill_from(model, &device, prefill.tail(), prefill.shared_len)?;
            (logits, snapshot)
        } else {
            (prefill_from(model, &device, prefill.tokens, 0)?, None)
        };
        if split && snapshot.is_none() {
            tracing::warn!("backend cannot retain the shared prefix; share prefills will recompute it");
        }
        self.snapshot = snapshot;

        self.context = prefill.tokens.to_vec();
        let token = self.sample(&logits)?;
        self.context.push(token);
        Ok(token)
    }

    fn forward_shared(&mut self, prefill: Prefill<'_>) -> Result<Token, EngineError> {
        self.check_prompt(prefill.tokens)?;
        if prefill.tail().is_empty() {
            return Err(EngineError::InvalidInput(
                "shared prefill needs a non-empty tail".to_string(),
            ));
        }

        let restored = match &self.snapshot {
            Some(snapshot) if snapshot.tokens == prefill.shared() => {
                snapshot.model.duplicate_if_supported()
            }
            _ => None,
        };
        let Some(restored) = restored else {
            tracing::debug!(shared_len = prefill.shared_len, "shared prefix not resident, computing it");
            return self.forward_first(prefill);
        };

        self.model = Some(restored);
        let (model, device) = self.loaded()?;
        let device = device.clone();
        let logits = prefill_from(model, &device, prefill.tail(), prefill.shared_len)?;

        self.context = prefill.tokens.to_vec();
        let token = self.sample(&logits)?;
        self.context.push(token);
        Ok(token)
    }

    fn forward_next(&mut self) -> Result<Token, EngineError> {
        let last = *self
            .context
            .last()
            .ok_or_else(|| EngineError::Inference("forward_next before prefill".to_string()))?;
        if self.context.len() >= self.max_seq_len {
            return Err(EngineError::InvalidInput("context is full".to_string()));
        }
        let position = self.context.len() - 1;

        let (model, device) = self.loaded()?;
        let device = device.clone();
        let logits = step(model, &device, &[last], position)?;

        let token = self.sample(&logits)?;
        self.context.push(token);
        Ok(token)
    }

    fn total_length(&self) -> usize {
        self.context.len()
    }

    fn max_sequence_length(&self) -> usize {
        self.max_seq_len
    }

    fn init_decryption(&mut self) -> Result<(), EngineError> {
        // GGUF weights are plaintext; the session is tracked for symmetry only
        self.decrypting = true;
        Ok(())
    }

    fn deinit_decryption(&mut self) -> Result<(), EngineError> {
        self.decrypting = false;
        Ok(())
    }

    fn free_devices(&mut self) -> Result<(), EngineError> {
        self.release();
        Ok(())
    }

    fn deinit(&mut self) -> Result<(), EngineError> {
        self.release();
        self.decrypting = false;
        self.max_seq_len = 0;
        Ok(())
    }
}
