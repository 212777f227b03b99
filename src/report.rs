use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use crate::decode::{Generation, StopReason, TaskFailure};
use crate::error::{ErrorKind, HarnessError, Result};
use crate::metrics::{as_secs, Metrics};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&HarnessError> for ErrorReport {
    fn from(err: &HarnessError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed {
        answer: String,
        tokens: usize,
        stop_reason: StopReason,
        metrics: Metrics,
    },
    Failed {
        error: ErrorReport,
        partial_text: String,
        tokens: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskReport {
    pub index: usize,
    pub case: usize,
    pub mode: String,
    #[serde(flatten)]
    pub outcome: TaskOutcome,
}

impl TaskReport {
    pub fn completed(index: usize, case: usize, mode: &str, gen: &Generation) -> Self {
        Self {
            index,
            case,
            mode: mode.to_string(),
            outcome: TaskOutcome::Completed {
                answer: gen.answer.clone(),
                tokens: gen.tokens.len(),
                stop_reason: gen.stop_reason,
                metrics: gen.metrics,
            },
        }
    }

    pub fn failed(index: usize, case: usize, mode: &str, failure: &TaskFailure) -> Self {
        Self {
            index,
            case,
            mode: mode.to_string(),
            outcome: TaskOutcome::Failed {
                error: ErrorReport::from(&failure.error),
                partial_text: failure.partial_text.clone(),
                tokens: failure.tokens.len(),
            },
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, TaskOutcome::Completed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelReport {
    pub index: usize,
    pub weights: PathBuf,
    #[serde(serialize_with = "as_opt_secs")]
    pub load_time: Option<Duration>,
    pub tasks: Vec<TaskReport>,
    /// Set when the model instance had to be abandoned.
    pub error: Option<ErrorReport>,
    /// Tasks never attempted because of `error`.
    pub skipped_tasks: usize,
    pub teardown_error: Option<ErrorReport>,
}

impl ModelReport {
    pub fn new(index: usize, weights: &Path) -> Self {
        Self {
            index,
            weights: weights.to_path_buf(),
            load_time: None,
            tasks: Vec::new(),
            error: None,
            skipped_tasks: 0,
            teardown_error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ScenarioReport {
    pub models: Vec<ModelReport>,
    #[serde(serialize_with = "as_secs")]
    pub total_time: Duration,
}

impl ScenarioReport {
    pub fn completed_tasks(&self) -> usize {
        self.tasks().filter(|t| t.is_completed()).count()
    }

    pub fn failed_tasks(&self) -> usize {
        self.tasks().filter(|t| !t.is_completed()).count()
    }

    fn tasks(&self) -> impl Iterator<Item = &TaskReport> {
        self.models.iter().flat_map(|m| m.tasks.iter())
    }

    /// Human readable summary, one line per model and per task.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for model in &self.models {
            let _ = write!(out, "model #{} {}", model.index, model.weights.display());
            if let Some(load) = model.load_time {
                let _ = write!(out, "  Load Time: {:.3} s", load.as_secs_f64());
            }
            out.push('\n');

            for task in &model.tasks {
                let _ = write!(out, "  task {} case {} {:<6} ", task.index, task.case, task.mode);
                match &task.outcome {
                    TaskOutcome::Completed {
                        tokens,
                        stop_reason,
                        metrics,
                        ..
                    } => {
                        let ftl_label = if task.mode == "share" { "Unshare FTL" } else { "FTL" };
                        let tps = match metrics.tokens_per_second {
                            Some(tps) => format!("{:.3} token/s", tps),
                            None => "n/a".to_string(),
                        };
                        let _ = writeln!(
                            out,
                            "{} Time: {:.3} s  TPS: {}  tokens: {} ({:?})",
                            ftl_label,
                            metrics.first_token_latency.as_secs_f64(),
                            tps,
                            tokens,
                            stop_reason
                        );
                    }
                    TaskOutcome::Failed { error, tokens, .. } => {
                        let _ = writeln!(
                            out,
                            "FAILED {}: {} (partial tokens: {})",
                            error.kind, error.message, tokens
                        );
                    }
                }
            }

            if let Some(err) = &model.error {
                let _ = writeln!(
                    out,
                    "  FAILED {}: {} (skipped tasks: {})",
                    err.kind, err.message, model.skipped_tasks
                );
            }
            if let Some(err) = &model.teardown_error {
                let _ = writeln!(out, "  teardown failed {}: {}", err.kind, err.message);
            }
        }
        let _ = writeln!(out, "Total Time: {:.3} s", self.total_time.as_secs_f64());
        out
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| HarnessError::Io(format!("cannot serialize report: {}", e)))?;
        fs::write(path, json)?;
        Ok(())
    }
}

fn as_opt_secs<S: serde::Serializer>(d: &Option<Duration>, s: S) -> std::result::Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_some(&d.as_secs_f64()),
        None => s.serialize_none(),
    }
}
