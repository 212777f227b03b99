//! Generation parameters and scenario description.
//!
//! A scenario is usually read from a TOML file:
//!
//! ```toml
//! devices = [0]
//! tokenizer = "../support/token_config"
//! cases = "assets/kv_cache_share_test_case.json"
//! decryption = true
//!
//! [generation]
//! temperature = 1.0
//! generation_mode = "greedy"
//!
//! [[models]]
//! weights = "qwen-share-8k.gguf"
//! prefix_max_tokens = 8000
//! tasks = [{ case = 0, mode = "normal" }, { case = 0, mode = "normal" }]
//! ```

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::device::DeviceSet;
use crate::engine::Teardown;
use crate::error::{HarnessError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    Greedy,
    PenaltySample,
}

impl FromStr for GenerationMode {
    type Err = HarnessError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim() {
            "greedy" => Ok(Self::Greedy),
            "penalty_sample" => Ok(Self::PenaltySample),
            other => Err(HarnessError::Config(format!(
                "unknown generation mode '{}' (expected greedy or penalty_sample)",
                other
            ))),
        }
    }
}

impl fmt::Display for GenerationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Greedy => f.write_str("greedy"),
            Self::PenaltySample => f.write_str("penalty_sample"),
        }
    }
}

/// Sampling/decoding parameters handed to the engine once per model load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub temperature: f64,
    pub top_p: f64,
    pub repeat_penalty: f64,
    pub repeat_last_n: usize,
    pub max_new_tokens: usize,
    pub generation_mode: GenerationMode,
    /// Compute-kernel library handed to the engine, if any.
    pub lib_path: Option<PathBuf>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 1.0,
            repeat_penalty: 1.2,
            repeat_last_n: 32,
            max_new_tokens: 1024,
            generation_mode: GenerationMode::Greedy,
            lib_path: None,
        }
    }
}

impl GenerationConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.temperature > 0.0) {
            return Err(HarnessError::Config("temperature must be > 0".to_string()));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(HarnessError::Config("top_p must be in (0, 1]".to_string()));
        }
        if !self.repeat_penalty.is_finite() {
            return Err(HarnessError::Config("repeat_penalty must be finite".to_string()));
        }
        Ok(())
    }
}

/// When a task's decode loop ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopSpec {
    /// Until end-of-sequence or engine capacity.
    #[default]
    Eos,
    /// A fixed number of tokens, `max_tokens` or the generation default.
    Fixed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Index into the test-case file.
    pub case: usize,
    /// Inference mode, `normal` or `share`. Kept raw so an unknown mode only
    /// fails the task that asked for it.
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub stop: StopSpec,
    #[serde(default)]
    pub max_tokens: Option<usize>,
}

fn default_mode() -> String {
    "normal".to_string()
}

impl TaskSpec {
    pub fn new(case: usize, mode: impl Into<String>) -> Self {
        Self {
            case,
            mode: mode.into(),
            stop: StopSpec::Eos,
            max_tokens: None,
        }
    }

    pub fn fixed(mut self, max_tokens: usize) -> Self {
        self.stop = StopSpec::Fixed;
        self.max_tokens = Some(max_tokens);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStage {
    pub weights: PathBuf,
    /// Shared prefix truncation bound; `None` keeps the whole prefix.
    #[serde(default)]
    pub prefix_max_tokens: Option<usize>,
    /// Test case whose `content` forms the shared prefix.
    #[serde(default)]
    pub prefix_case: usize,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub teardown: Teardown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub devices: DeviceSet,
    pub tokenizer: PathBuf,
    pub cases: PathBuf,
    #[serde(default)]
    pub decryption: bool,
    /// Overrides the end-of-sequence token name looked up in the tokenizer.
    #[serde(default)]
    pub eos_token: Option<String>,
    #[serde(default)]
    pub generation: GenerationConfig,
    pub models: Vec<ModelStage>,
}

impl ScenarioConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let cfg: Self =
            toml::from_str(raw).map_err(|e| HarnessError::Config(format!("scenario: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Loads a scenario file; relative paths inside it resolve against the
    /// file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            HarnessError::Config(format!("cannot read scenario {}: {}", path.display(), e))
        })?;
        let mut cfg = Self::from_toml_str(&raw)?;
        if let Some(base) = path.parent() {
            cfg.rebase(base);
        }
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        self.generation.validate()?;
        if self.models.is_empty() {
            return Err(HarnessError::Config(
                "scenario must list at least one model".to_string(),
            ));
        }
        for (idx, stage) in self.models.iter().enumerate() {
            if stage.tasks.is_empty() {
                return Err(HarnessError::Config(format!("model #{} has no tasks", idx)));
            }
        }
        Ok(())
    }

    fn rebase(&mut self, base: &Path) {
        let join = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        join(&mut self.tokenizer);
        join(&mut self.cases);
        for stage in &mut self.models {
            join(&mut stage.weights);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"
        devices = [0, 1]
        tokenizer = "tok"
        cases = "cases.json"
        decryption = true

        [generation]
        temperature = 0.7
        generation_mode = "penalty_sample"

        [[models]]
        weights = "a.gguf"
        prefix_max_tokens = 8000
        tasks = [{ case = 0 }, { case = 1, mode = "share", stop = "fixed", max_tokens = 16 }]

        [[models]]
        weights = "b.gguf"
        prefix_max_tokens = 3000
        teardown = "deinit"
        tasks = [{ case = 2 }]
    "#;

    #[test]
    fn parses_scenario_with_defaults() {
        let cfg = ScenarioConfig::from_toml_str(SCENARIO).expect("scenario parses");
        assert_eq!(cfg.devices.ids(), &[0, 1]);
        assert!(cfg.decryption);
        assert_eq!(cfg.generation.generation_mode, GenerationMode::PenaltySample);
        assert_eq!(cfg.generation.top_p, 1.0);
        assert_eq!(cfg.generation.repeat_last_n, 32);

        let first = &cfg.models[0];
        assert_eq!(first.tasks[0].mode, "normal");
        assert_eq!(first.tasks[0].stop, StopSpec::Eos);
        assert_eq!(first.tasks[1], TaskSpec::new(1, "share").fixed(16));
        assert_eq!(first.teardown, Teardown::FreeDevices);
        assert_eq!(cfg.models[1].teardown, Teardown::Deinit);
    }

    #[test]
    fn rejects_out_of_range_sampling() {
        let mut gen = GenerationConfig::default();
        gen.temperature = 0.0;
        assert!(gen.validate().is_err());

        let mut gen = GenerationConfig::default();
        gen.top_p = 1.5;
        assert!(gen.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_devices_and_empty_models() {
        let dup = SCENARIO.replace("devices = [0, 1]", "devices = [1, 1]");
        assert!(ScenarioConfig::from_toml_str(&dup).is_err());

        let raw = "devices = [0]\ntokenizer = \"t\"\ncases = \"c\"\nmodels = []\n";
        assert!(matches!(
            ScenarioConfig::from_toml_str(raw),
            Err(HarnessError::Config(_))
        ));
    }

    #[test]
    fn rebase_resolves_relative_paths() {
        let mut cfg = ScenarioConfig::from_toml_str(SCENARIO).expect("scenario parses");
        cfg.rebase(Path::new("/opt/bench"));
        assert_eq!(cfg.cases, PathBuf::from("/opt/bench/cases.json"));
        assert_eq!(cfg.models[1].weights, PathBuf::from("/opt/bench/b.gguf"));
    }
}
