//! Benchmark harness for shared-prefix KV-cache reuse.
//!
//! A scenario loads one model after another onto a device set, computes a
//! shared prompt prefix once, and then runs tasks either from scratch
//! (`normal`) or on top of the retained prefix cache (`share`), recording
//! first-token latency and decode throughput for each.

pub mod backend;
pub mod cli;
pub mod config;
pub mod decode;
pub mod device;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod planner;
pub mod prompting;
pub mod report;
pub mod scenario;
pub mod stub;

pub use config::{GenerationConfig, GenerationMode, ModelStage, ScenarioConfig, StopSpec, TaskSpec};
pub use decode::{DecodeLoop, Generation, InferenceMode, StopPolicy, StopReason, TaskFailure};
pub use device::{DeviceRegistry, DeviceSet};
pub use engine::{EngineError, EngineHandle, Prefill, TextCodec, Token};
pub use error::{HarnessError, Result};
pub use metrics::{Metrics, MetricsRecorder};
pub use planner::{PrefixPlanner, SharedPrefix, TaskPrompt};
pub use prompting::{TestCase, TestCases};
pub use report::ScenarioReport;
pub use scenario::ScenarioRunner;
