use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::config::{GenerationConfig, GenerationMode, ModelStage, ScenarioConfig, TaskSpec};
use crate::device::DeviceSet;
use crate::engine::Teardown;
use crate::error::{HarnessError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// GGUF weights through candle.
    Candle,
    /// Scripted engine and byte codec; needs no weights or tokenizer.
    Stub,
}

/// Shared-prefix KV-cache reuse benchmark.
///
/// Either pass a TOML scenario with `--scenario`, or describe a run with the
/// flags below: every model in `--model-path-list` runs the tasks listed in
/// `--task-cases` against the shared prefix of `--prefix-case`.
#[derive(Debug, Parser)]
#[command(name = "share-cache-bench", version)]
pub struct Cli {
    #[arg(long, conflicts_with = "model_path_list")]
    pub scenario: Option<PathBuf>,

    /// Comma separated weight files, run in order.
    #[arg(short = 'm', long, alias = "model_path_list", value_delimiter = ',')]
    pub model_path_list: Vec<PathBuf>,

    #[arg(short = 't', long, alias = "tokenizer_path", default_value = "../support/token_config")]
    pub tokenizer_path: PathBuf,

    /// Device ids, e.g. `0,1`.
    #[arg(short = 'd', long, default_value = "0")]
    pub devid: String,

    /// JSON file with `{content?, question}` records.
    #[arg(long)]
    pub cases: Option<PathBuf>,

    #[arg(long, default_value_t = 1.0)]
    pub temperature: f64,

    #[arg(long, default_value_t = 1.0)]
    pub top_p: f64,

    #[arg(long, default_value_t = 1.2)]
    pub repeat_penalty: f64,

    #[arg(long, default_value_t = 32)]
    pub repeat_last_n: usize,

    #[arg(long, default_value_t = 1024)]
    pub max_new_tokens: usize,

    #[arg(long, default_value = "greedy")]
    pub generation_mode: GenerationMode,

    /// Compute-kernel library handed to the engine.
    #[arg(long)]
    pub lib_path: Option<PathBuf>,

    /// Inference mode for every task: `normal` or `share`.
    #[arg(long, default_value = "normal")]
    pub mode: String,

    /// Shared prefix bound per model; the last value repeats.
    #[arg(long, value_delimiter = ',', default_value = "8000")]
    pub prefix_max_tokens: Vec<usize>,

    /// Test case providing the shared prefix.
    #[arg(long, default_value_t = 0)]
    pub prefix_case: usize,

    /// Test cases to run against each model, in order.
    #[arg(long, value_delimiter = ',', default_value = "0,0")]
    pub task_cases: Vec<usize>,

    /// Stop every task after exactly this many tokens instead of at EOS.
    #[arg(long)]
    pub fixed_tokens: Option<usize>,

    /// Open a weight-decryption session around the run.
    #[arg(long)]
    pub decrypt: bool,

    /// Name of the end-of-sequence token in the tokenizer.
    #[arg(long)]
    pub eos_token: Option<String>,

    #[arg(long, value_enum, default_value_t = Backend::Candle)]
    pub backend: Backend,

    /// Write a JSON report here.
    #[arg(long)]
    pub report_json: Option<PathBuf>,

    /// Do not echo generated text.
    #[arg(short, long)]
    pub quiet: bool,
}

impl Cli {
    pub fn scenario_config(&self) -> Result<ScenarioConfig> {
        if let Some(path) = &self.scenario {
            return ScenarioConfig::load(path);
        }

        if self.model_path_list.is_empty() {
            return Err(HarnessError::Config(
                "pass --scenario or at least one --model-path-list entry".to_string(),
            ));
        }
        let cases = self
            .cases
            .clone()
            .ok_or_else(|| HarnessError::Config("--cases is required without --scenario".to_string()))?;

        let tasks: Vec<TaskSpec> = self
            .task_cases
            .iter()
            .map(|&case| {
                let task = TaskSpec::new(case, self.mode.clone());
                match self.fixed_tokens {
                    Some(n) => task.fixed(n),
                    None => task,
                }
            })
            .collect();

        let models = self
            .model_path_list
            .iter()
            .enumerate()
            .map(|(idx, weights)| ModelStage {
                weights: weights.clone(),
                prefix_max_tokens: self
                    .prefix_max_tokens
                    .get(idx)
                    .or_else(|| self.prefix_max_tokens.last())
                    .copied(),
                prefix_case: self.prefix_case,
                tasks: tasks.clone(),
                teardown: Teardown::FreeDevices,
            })
            .collect();

        let cfg = ScenarioConfig {
            devices: self.devid.parse::<DeviceSet>()?,
            tokenizer: self.tokenizer_path.clone(),
            cases,
            decryption: self.decrypt,
            eos_token: self.eos_token.clone(),
            generation: GenerationConfig {
                temperature: self.temperature,
                top_p: self.top_p,
                repeat_penalty: self.repeat_penalty,
                repeat_last_n: self.repeat_last_n,
                max_new_tokens: self.max_new_tokens,
                generation_mode: self.generation_mode,
                lib_path: self.lib_path.clone().filter(|p| !p.as_os_str().is_empty()),
            },
            models,
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StopSpec;

    #[test]
    fn builds_scenario_from_flags() {
        let cli = Cli::parse_from([
            "share-cache-bench",
            "-m",
            "a.gguf,b.gguf",
            "-d",
            "0,1",
            "--cases",
            "cases.json",
            "--prefix-max-tokens",
            "8000,3000",
            "--mode",
            "share",
            "--fixed-tokens",
            "16",
            "--generation-mode",
            "penalty_sample",
        ]);
        let cfg = cli.scenario_config().expect("scenario");
        assert_eq!(cfg.devices.ids(), &[0, 1]);
        assert_eq!(cfg.models.len(), 2);
        assert_eq!(cfg.models[0].prefix_max_tokens, Some(8000));
        assert_eq!(cfg.models[1].prefix_max_tokens, Some(3000));
        assert_eq!(cfg.models[1].tasks.len(), 2);
        assert_eq!(cfg.models[1].tasks[0].mode, "share");
        assert_eq!(cfg.models[1].tasks[0].stop, StopSpec::Fixed);
        assert_eq!(cfg.generation.generation_mode, GenerationMode::PenaltySample);
        assert_eq!(cfg.generation.repeat_penalty, 1.2);
    }

    #[test]
    fn last_prefix_bound_repeats() {
        let cli = Cli::parse_from([
            "share-cache-bench",
            "-m",
            "a,b,c",
            "--cases",
            "c.json",
            "--prefix-max-tokens",
            "500",
        ]);
        let cfg = cli.scenario_config().expect("scenario");
        assert!(cfg.models.iter().all(|m| m.prefix_max_tokens == Some(500)));
        assert_eq!(cli.backend, Backend::Candle);
    }

    #[test]
    fn flags_are_validated() {
        let cli = Cli::parse_from(["share-cache-bench", "-m", "a", "--cases", "c", "--top-p", "0"]);
        assert!(cli.scenario_config().is_err());

        let cli = Cli::parse_from(["share-cache-bench", "--cases", "c"]);
        assert!(cli.scenario_config().is_err());
    }
}
