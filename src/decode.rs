//! Two-phase generation: one prefill step, then next-token steps until the
//! stopping policy fires.

use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;

use serde::Serialize;

use crate::config::{GenerationConfig, StopSpec, TaskSpec};
use crate::engine::{EngineHandle, Prefill, TextCodec, Token};
use crate::error::HarnessError;
use crate::metrics::{Metrics, MetricsRecorder};
use crate::planner::TaskPrompt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceMode {
    /// Full prefill, no cache reuse.
    Normal,
    /// Reuse the engine-resident shared prefix cache, compute only the tail.
    Share,
}

impl FromStr for InferenceMode {
    type Err = HarnessError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "normal" => Ok(Self::Normal),
            "share" => Ok(Self::Share),
            other => Err(HarnessError::UnsupportedMode(other.to_string())),
        }
    }
}

impl fmt::Display for InferenceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => f.write_str("normal"),
            Self::Share => f.write_str("share"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopPolicy {
    /// Exactly this many tokens, whatever they are.
    FixedCount(NonZeroUsize),
    /// Until end-of-sequence or until the engine's context is full.
    UntilExhausted,
}

impl StopPolicy {
    /// A bound of zero means "run until exhaustion".
    pub fn from_bound(bound: usize) -> Self {
        match NonZeroUsize::new(bound) {
            Some(n) => Self::FixedCount(n),
            None => Self::UntilExhausted,
        }
    }

    pub fn for_task(task: &TaskSpec, config: &GenerationConfig) -> Self {
        match task.stop {
            StopSpec::Eos => Self::UntilExhausted,
            StopSpec::Fixed => Self::from_bound(task.max_tokens.unwrap_or(config.max_new_tokens)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    TokenLimit,
    EndOfSequence,
    ContextExhausted,
}

/// Per-task mutable state. Lives for one decode-loop run.
#[derive(Debug, Default)]
struct StreamState {
    tokens: Vec<Token>,
    streamed: String,
}

impl StreamState {
    fn push<C: TextCodec + ?Sized>(&mut self, token: Token, codec: &C, observer: &mut dyn FnMut(&str)) {
        self.tokens.push(token);
        // best effort: a lone piece of a multi-token symbol may not decode
        let word = codec.decode(&[token], true).unwrap_or_default();
        observer(&word);
        self.streamed.push_str(&word);
    }

    fn len(&self) -> usize {
        self.tokens.len()
    }
}

/// A finished generation.
///
/// `streamed_text` concatenates per-token decodes as they were shown;
/// `answer` decodes the whole buffer at once. The two differ when a symbol
/// spans several tokens.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub tokens: Vec<Token>,
    pub streamed_text: String,
    pub answer: String,
    pub stop_reason: StopReason,
    pub metrics: Metrics,
}

/// A task that did not complete, with whatever it produced before failing.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub error: HarnessError,
    pub tokens: Vec<Token>,
    pub partial_text: String,
}

impl TaskFailure {
    pub fn new(error: HarnessError) -> Self {
        Self {
            error,
            tokens: Vec::new(),
            partial_text: String::new(),
        }
    }

    fn with_partial(error: HarnessError, state: StreamState) -> Self {
        Self {
            error,
            tokens: state.tokens,
            partial_text: state.streamed,
        }
    }
}

impl From<HarnessError> for TaskFailure {
    fn from(error: HarnessError) -> Self {
        Self::new(error)
    }
}

pub struct DecodeLoop<'a, E: ?Sized, C: ?Sized> {
    engine: &'a mut E,
    codec: &'a C,
}

impl<'a, E, C> DecodeLoop<'a, E, C>
where
    E: EngineHandle + ?Sized,
    C: TextCodec + ?Sized,
{
    pub fn new(engine: &'a mut E, codec: &'a C) -> Self {
        Self { engine, codec }
    }

    /// Runs one task. `observer` receives each token's text as soon as it is
    /// produced.
    pub fn run(
        &mut self,
        prompt: &TaskPrompt,
        mode: InferenceMode,
        policy: StopPolicy,
        observer: &mut dyn FnMut(&str),
    ) -> Result<Generation, TaskFailure> {
        let tokens = prompt.tokens();
        let capacity = self.engine.max_sequence_length();
        if tokens.is_empty() {
            return Err(HarnessError::InvalidInput("prompt is empty".to_string()).into());
        }
        if tokens.len() >= capacity {
            return Err(HarnessError::InvalidInput(format!(
                "prompt has {} tokens, engine context holds {}",
                tokens.len(),
                capacity
            ))
            .into());
        }

        let prefill = Prefill::new(tokens, prompt.shared_len());
        let mut recorder = MetricsRecorder::start();
        let first = match mode {
            InferenceMode::Normal => self.engine.forward_first(prefill),
            InferenceMode::Share => self.engine.forward_shared(prefill),
        }
        .map_err(|e| TaskFailure::new(e.into()))?;
        recorder.mark_prefill_done();

        let mut state = StreamState::default();
        let mut decode_tokens = 0usize;
        let stop_reason = match policy {
            StopPolicy::FixedCount(limit) => {
                state.push(first, self.codec, observer);
                while state.len() < limit.get() {
                    let token = match self.engine.forward_next() {
                        Ok(token) => token,
                        Err(e) => return Err(TaskFailure::with_partial(e.into(), state)),
                    };
                    decode_tokens += 1;
                    state.push(token, self.codec, observer);
                }
                StopReason::TokenLimit
            }
            StopPolicy::UntilExhausted => {
                let eos = self.codec.eos_token();
                let mut token = first;
                loop {
                    if token == eos {
                        break StopReason::EndOfSequence;
                    }
                    // session-wide counter: prefix, tail and every generated token
                    if self.engine.total_length() >= self.engine.max_sequence_length() {
                        break StopReason::ContextExhausted;
                    }
                    state.push(token, self.codec, observer);
                    token = match self.engine.forward_next() {
                        Ok(token) => token,
                        Err(e) => return Err(TaskFailure::with_partial(e.into(), state)),
                    };
                    decode_tokens += 1;
                }
            }
        };
        let metrics = recorder.finish(decode_tokens);

        let answer = match self.codec.decode(&state.tokens, false) {
            Ok(answer) => answer,
            Err(e) => return Err(TaskFailure::with_partial(e, state)),
        };

        Ok(Generation {
            tokens: state.tokens,
            streamed_text: state.streamed,
            answer,
            stop_reason,
            metrics,
        })
    }
}
