//! Sequences models and tasks against one engine.
//!
//! Models run strictly one after another. Within a model every task shares
//! the same loaded weights and the same engine-resident prefix cache; only
//! the decode loop is re-run between tasks.

use std::io::{self, Write};
use std::time::Instant;

use crate::config::{GenerationConfig, ModelStage, ScenarioConfig, TaskSpec};
use crate::decode::{DecodeLoop, Generation, InferenceMode, StopPolicy, TaskFailure};
use crate::device::DeviceRegistry;
use crate::engine::{EngineHandle, ModelInstance, TextCodec};
use crate::error::{HarnessError, Result};
use crate::planner::{PrefixPlanner, SharedPrefix};
use crate::prompting::TestCases;
use crate::report::{ErrorReport, ModelReport, ScenarioReport, TaskReport};

pub struct ScenarioRunner<E, C> {
    engine: E,
    codec: C,
    registry: DeviceRegistry,
    stream_output: bool,
}

impl<E: EngineHandle, C: TextCodec> ScenarioRunner<E, C> {
    pub fn new(engine: E, codec: C) -> Self {
        Self {
            engine,
            codec,
            registry: DeviceRegistry::new(),
            stream_output: false,
        }
    }

    /// Echo generated text to stdout token by token.
    pub fn with_stream_output(mut self, enabled: bool) -> Self {
        self.stream_output = enabled;
        self
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn into_engine(self) -> E {
        self.engine
    }

    /// Runs every model stage of `scenario`.
    ///
    /// Only a failure to open the decryption session aborts the whole run;
    /// model and task failures are recorded in the report.
    pub fn run(&mut self, scenario: &ScenarioConfig, cases: &TestCases) -> Result<ScenarioReport> {
        let started = Instant::now();
        scenario.validate()?;

        if scenario.decryption {
            if let Err(e) = self.engine.init_decryption() {
                tracing::error!(error = %e, "cannot open decryption session");
                if let Err(deinit_err) = self.engine.deinit() {
                    tracing::warn!(error = %deinit_err, "engine deinit failed");
                }
                return Err(e.into());
            }
        }

        let mut report = ScenarioReport::default();
        for (index, stage) in scenario.models.iter().enumerate() {
            let model_report = self.run_model(index, stage, scenario, cases);
            report.models.push(model_report);
        }

        if scenario.decryption {
            if let Err(e) = self.engine.deinit_decryption() {
                tracing::warn!(error = %e, "closing decryption session failed");
            }
        }
        if let Err(e) = self.engine.deinit() {
            tracing::warn!(error = %e, "engine deinit failed");
        }

        report.total_time = started.elapsed();
        tracing::info!(
            completed = report.completed_tasks(),
            failed = report.failed_tasks(),
            elapsed = ?report.total_time,
            "scenario finished"
        );
        Ok(report)
    }

    fn run_model(
        &mut self,
        index: usize,
        stage: &ModelStage,
        scenario: &ScenarioConfig,
        cases: &TestCases,
    ) -> ModelReport {
        let Self {
            engine,
            codec,
            registry,
            stream_output,
        } = self;
        let mut report = ModelReport::new(index, &stage.weights);

        let mut model = match ModelInstance::load(engine, registry, &scenario.devices, &stage.weights) {
            Ok(model) => model,
            Err(err) => {
                tracing::error!(model = index, kind = %err.kind(), error = %err, "model load failed, skipping its tasks");
                if !matches!(err, HarnessError::DeviceBusy { .. }) {
                    if let Err(free_err) = engine.free_devices() {
                        tracing::warn!(model = index, error = %free_err, "freeing devices after failed load");
                    }
                }
                report.error = Some(ErrorReport::from(&err));
                report.skipped_tasks = stage.tasks.len();
                return report;
            }
        };
        report.load_time = Some(model.load_time());
        tracing::debug!(model = index, devices = %model.devices(), "devices claimed");

        if let Err(err) = model.configure(engine, &scenario.generation) {
            tracing::error!(model = index, kind = %err.kind(), error = %err, "cannot configure model");
            report.error = Some(ErrorReport::from(&err));
            report.skipped_tasks = stage.tasks.len();
        } else {
            let planner = PrefixPlanner::new(&*codec);
            let prefix = cases
                .get(stage.prefix_case)
                .and_then(|case| planner.shared_prefix(&case.shared_text(), stage.prefix_max_tokens));
            if let Ok(prefix) = &prefix {
                tracing::info!(model = index, tokens = prefix.len(), truncated = prefix.was_truncated(), "shared prefix ready");
            }

            let stream = *stream_output;
            let mut observer = |word: &str| {
                if stream {
                    print!("{}", word);
                    let _ = io::stdout().flush();
                }
            };

            for (task_index, task) in stage.tasks.iter().enumerate() {
                let outcome = run_task(
                    &mut *engine,
                    &*codec,
                    &mut model,
                    &prefix,
                    task,
                    cases,
                    &scenario.generation,
                    &mut observer,
                );
                if stream {
                    println!();
                }

                match outcome {
                    Ok(gen) => {
                        tracing::info!(
                            model = index,
                            task = task_index,
                            mode = %task.mode,
                            tokens = gen.tokens.len(),
                            ftl = ?gen.metrics.first_token_latency,
                            tps = ?gen.metrics.tokens_per_second,
                            "task finished"
                        );
                        report
                            .tasks
                            .push(TaskReport::completed(task_index, task.case, &task.mode, &gen));
                    }
                    Err(failure) => {
                        let err = &failure.error;
                        tracing::warn!(
                            model = index,
                            task = task_index,
                            kind = %err.kind(),
                            error = %err,
                            partial_tokens = failure.tokens.len(),
                            "task failed"
                        );
                        report
                            .tasks
                            .push(TaskReport::failed(task_index, task.case, &task.mode, &failure));
                        if err.is_model_fatal() {
                            report.error = Some(ErrorReport::from(err));
                            report.skipped_tasks = stage.tasks.len() - task_index - 1;
                            break;
                        }
                    }
                }
            }
        }

        model.finish_tasks();
        if let Err(err) = model.teardown(engine, stage.teardown) {
            tracing::error!(model = index, error = %err, "model teardown failed");
            report.teardown_error = Some(ErrorReport::from(&err));
        }
        report
    }
}

#[allow(clippy::too_many_arguments)]
fn run_task<E, C>(
    engine: &mut E,
    codec: &C,
    model: &mut ModelInstance,
    prefix: &Result<SharedPrefix>,
    task: &TaskSpec,
    cases: &TestCases,
    config: &GenerationConfig,
    observer: &mut dyn FnMut(&str),
) -> std::result::Result<Generation, TaskFailure>
where
    E: EngineHandle + ?Sized,
    C: TextCodec + ?Sized,
{
    model.begin_task()?;
    let mode: InferenceMode = task.mode.parse()?;
    let prefix = prefix.as_ref().map_err(|e| e.clone())?;
    let case = cases.get(task.case)?;
    let prompt = PrefixPlanner::new(codec).task_prompt(prefix, &case.task_text())?;
    let policy = StopPolicy::for_task(task, config);

    DecodeLoop::new(engine, codec).run(&prompt, mode, policy, observer)
}
