use std::time::{Duration, Instant};

use serde::Serialize;

/// Timing of one decode-loop run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Metrics {
    /// Prefill duration: time to the first token.
    #[serde(serialize_with = "as_secs")]
    pub first_token_latency: Duration,
    #[serde(serialize_with = "as_secs")]
    pub decode_duration: Duration,
    /// Tokens produced by next-token steps (the prefill token is not counted).
    pub decode_tokens: usize,
    /// Decode tokens per second; `None` when nothing was decoded or no time
    /// elapsed.
    pub tokens_per_second: Option<f64>,
}

impl Metrics {
    pub fn new(first_token_latency: Duration, decode_duration: Duration, decode_tokens: usize) -> Self {
        let tokens_per_second = if decode_tokens == 0 || decode_duration.is_zero() {
            None
        } else {
            Some(decode_tokens as f64 / decode_duration.as_secs_f64())
        };
        Self {
            first_token_latency,
            decode_duration,
            decode_tokens,
            tokens_per_second,
        }
    }
}

/// Wall-clock marks around prefill and decode.
#[derive(Debug, Clone, Copy)]
pub struct MetricsRecorder {
    started: Instant,
    prefill_done: Option<Instant>,
}

impl MetricsRecorder {
    /// Marks the moment just before prefill.
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            prefill_done: None,
        }
    }

    pub fn mark_prefill_done(&mut self) {
        self.prefill_done = Some(Instant::now());
    }

    /// Marks the end of the last decode step.
    pub fn finish(&self, decode_tokens: usize) -> Metrics {
        self.finish_at(Instant::now(), decode_tokens)
    }

    fn finish_at(&self, end: Instant, decode_tokens: usize) -> Metrics {
        let prefill_done = self.prefill_done.unwrap_or(end);
        Metrics::new(
            prefill_done.saturating_duration_since(self.started),
            end.saturating_duration_since(prefill_done),
            decode_tokens,
        )
    }
}

pub(crate) fn as_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}
