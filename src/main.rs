use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use share_cache_bench::backend::CandleEngine;
use share_cache_bench::cli::{Backend, Cli};
use share_cache_bench::engine::HfCodec;
use share_cache_bench::stub::{ByteCodec, ScriptedEngine};
use share_cache_bench::{
    EngineHandle, ScenarioConfig, ScenarioReport, ScenarioRunner, TestCases, TextCodec,
};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "share_cache_bench=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let scenario = cli.scenario_config()?;
    let cases = TestCases::load(&scenario.cases)
        .with_context(|| format!("loading test cases from {}", scenario.cases.display()))?;
    tracing::info!(
        models = scenario.models.len(),
        cases = cases.len(),
        devices = %scenario.devices,
        backend = ?cli.backend,
        "starting scenario"
    );

    let report = match cli.backend {
        Backend::Candle => {
            let codec = HfCodec::load(&scenario.tokenizer, scenario.eos_token.as_deref())
                .with_context(|| format!("loading tokenizer from {}", scenario.tokenizer.display()))?;
            run(CandleEngine::new(), codec, &scenario, &cases, !cli.quiet)?
        }
        Backend::Stub => run(ScriptedEngine::default(), ByteCodec, &scenario, &cases, !cli.quiet)?,
    };

    print!("{}", report.render());
    if let Some(path) = &cli.report_json {
        report.write_json(path)?;
        tracing::info!(path = %path.display(), "report written");
    }
    if report.failed_tasks() > 0 || report.models.iter().any(|m| m.error.is_some()) {
        tracing::warn!(failed = report.failed_tasks(), "scenario finished with failures");
    }
    Ok(())
}

fn run<E: EngineHandle, C: TextCodec>(
    engine: E,
    codec: C,
    scenario: &ScenarioConfig,
    cases: &TestCases,
    stream: bool,
) -> Result<ScenarioReport> {
    let mut runner = ScenarioRunner::new(engine, codec).with_stream_output(stream);
    Ok(runner.run(scenario, cases)?)
}
