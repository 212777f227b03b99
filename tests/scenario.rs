use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use share_cache_bench::engine::Teardown;
use share_cache_bench::error::ErrorKind;
use share_cache_bench::report::TaskOutcome;
use share_cache_bench::stub::{ByteCodec, EngineCall, ScriptedEngine};
use share_cache_bench::{
    DeviceRegistry, DeviceSet, GenerationConfig, HarnessError, ModelStage, ScenarioConfig,
    ScenarioRunner, StopReason, TaskSpec, TestCase, TestCases,
};

fn mk_temp_dir(label: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!(
        "share_cache_bench_{}_{}_{}",
        label,
        std::process::id(),
        nanos
    ));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn long_document() -> TestCases {
    TestCases::from(vec![
        TestCase {
            content: Some("lorem ipsum ".repeat(500)),
            question: "summarise the document".to_string(),
        },
        TestCase {
            content: None,
            question: "and in one word?".to_string(),
        },
    ])
}

fn short_document() -> TestCases {
    TestCases::from(vec![
        TestCase {
            content: Some("Release notes for the 2.1 firmware.".to_string()),
            question: "what changed?".to_string(),
        },
        TestCase {
            content: None,
            question: "say hello".to_string(),
        },
    ])
}

fn stage(weights: &str, prefix: Option<usize>, tasks: Vec<TaskSpec>) -> ModelStage {
    ModelStage {
        weights: PathBuf::from(weights),
        prefix_max_tokens: prefix,
        prefix_case: 0,
        tasks,
        teardown: Teardown::FreeDevices,
    }
}

fn scenario(models: Vec<ModelStage>, max_new_tokens: usize) -> ScenarioConfig {
    ScenarioConfig {
        devices: DeviceSet::new(vec![0]).expect("devices"),
        tokenizer: PathBuf::from("unused"),
        cases: PathBuf::from("unused"),
        decryption: true,
        eos_token: None,
        generation: GenerationConfig {
            max_new_tokens,
            ..GenerationConfig::default()
        },
        models,
    }
}

#[test]
fn share_task_reuses_truncated_prefix_and_decodes_exact_count() {
    let cfg = scenario(
        vec![stage(
            "model1.gguf",
            Some(3000),
            vec![
                TaskSpec::new(0, "normal").fixed(16),
                TaskSpec {
                    max_tokens: None,
                    ..TaskSpec::new(0, "share").fixed(16)
                },
            ],
        )],
        16,
    );
    let cases = long_document();
    let script: Vec<u32> = b"abc".iter().map(|&b| u32::from(b)).collect();
    let mut runner = ScenarioRunner::new(ScriptedEngine::new(script, 8192), ByteCodec);

    let report = runner.run(&cfg, &cases).expect("scenario");
    assert_eq!(report.completed_tasks(), 2);

    let calls = runner.engine().calls();
    let shared_at = calls
        .iter()
        .position(|c| matches!(c, EngineCall::ForwardShared { .. }))
        .expect("share prefill issued");
    match &calls[shared_at] {
        EngineCall::ForwardShared {
            shared_len, reused, ..
        } => {
            assert_eq!(*shared_len, 3000);
            assert!(*reused, "prefix computed by the normal task must be reused");
        }
        other => panic!("unexpected call {:?}", other),
    }
    assert_eq!(
        runner
            .engine()
            .count(|c| matches!(c, EngineCall::ForwardShared { .. })),
        1
    );
    let nexts_after_share = calls[shared_at..]
        .iter()
        .filter(|c| **c == EngineCall::ForwardNext)
        .count();
    assert_eq!(nexts_after_share, 15);

    match &report.models[0].tasks[1].outcome {
        TaskOutcome::Completed {
            tokens,
            stop_reason,
            metrics,
            ..
        } => {
            assert_eq!(*tokens, 16);
            assert_eq!(*stop_reason, StopReason::TokenLimit);
            assert_eq!(metrics.decode_tokens, 15);
        }
        other => panic!("share task failed: {:?}", other),
    }
}

#[test]
fn two_models_run_in_order_and_a_load_failure_is_contained() {
    let cfg = scenario(
        vec![
            stage(
                "model0.gguf",
                Some(8000),
                vec![TaskSpec::new(0, "normal"), TaskSpec::new(1, "normal")],
            ),
            stage(
                "model1.gguf",
                Some(3000),
                vec![TaskSpec::new(0, "normal"), TaskSpec::new(0, "share")],
            ),
        ],
        1024,
    );
    let engine = ScriptedEngine::default().fail_load("model1.gguf", -4);
    let mut runner = ScenarioRunner::new(engine, ByteCodec);

    let report = runner.run(&cfg, &short_document()).expect("scenario");
    assert_eq!(report.models.len(), 2);
    assert_eq!(report.models[0].tasks.len(), 2);
    assert!(report.models[0].tasks.iter().all(|t| t.is_completed()));
    assert!(report.models[0].load_time.is_some());

    let failed = &report.models[1];
    assert!(failed.tasks.is_empty());
    assert_eq!(failed.skipped_tasks, 2);
    assert_eq!(
        failed.error.as_ref().map(|e| e.kind),
        Some(ErrorKind::ModelLoad)
    );

    let engine = runner.into_engine();
    assert_eq!(
        engine.count(|c| matches!(c, EngineCall::Load(_))),
        2,
        "each model is loaded exactly once"
    );
    let tail: Vec<&EngineCall> = engine.calls().iter().rev().take(2).collect();
    assert_eq!(tail, vec![&EngineCall::Deinit, &EngineCall::DeinitDecryption]);
    assert_eq!(engine.calls().first(), Some(&EngineCall::InitDecryption));
}

#[test]
fn device_sets_are_exclusive_until_released() {
    let registry = DeviceRegistry::new();
    let pair: DeviceSet = "0,1".parse().expect("device set");
    let overlap: DeviceSet = "1,2".parse().expect("device set");

    let lease = registry.claim(&pair).expect("free devices");
    let err = registry.claim(&overlap).expect_err("device 1 is busy");
    assert_eq!(err, HarnessError::DeviceBusy { device: 1 });
    assert!(!registry.is_occupied(2), "failed claim must not hold anything");

    drop(lease);
    registry.claim(&overlap).expect("released");
}

#[test]
fn scenario_file_drives_a_stub_run() {
    let dir = mk_temp_dir("scenario");
    fs::write(
        dir.join("cases.json"),
        r#"[{"content": "A short shared document.", "question": "what is it about?"}]"#,
    )
    .expect("write cases");
    fs::write(
        dir.join("scenario.toml"),
        r#"
        devices = [0]
        tokenizer = "tokenizer"
        cases = "cases.json"

        [generation]
        max_new_tokens = 8

        [[models]]
        weights = "model0.gguf"
        prefix_max_tokens = 8000
        tasks = [
            { case = 0, mode = "normal" },
            { case = 0, mode = "share", stop = "fixed" },
        ]
        "#,
    )
    .expect("write scenario");

    let cfg = ScenarioConfig::load(&dir.join("scenario.toml")).expect("scenario");
    assert_eq!(cfg.cases, dir.join("cases.json"));
    assert_eq!(cfg.models[0].weights, dir.join("model0.gguf"));
    let cases = TestCases::load(&cfg.cases).expect("cases");

    let mut runner = ScenarioRunner::new(ScriptedEngine::default(), ByteCodec);
    let report = runner.run(&cfg, &cases).expect("run");
    assert_eq!(report.completed_tasks(), 2);

    match &report.models[0].tasks[0].outcome {
        TaskOutcome::Completed {
            answer,
            stop_reason,
            ..
        } => {
            assert_eq!(answer, "The shared prefix was reused.");
            assert_eq!(*stop_reason, StopReason::EndOfSequence);
        }
        other => panic!("normal task failed: {:?}", other),
    }
    match &report.models[0].tasks[1].outcome {
        TaskOutcome::Completed { tokens, .. } => assert_eq!(*tokens, 8),
        other => panic!("share task failed: {:?}", other),
    }

    let json_path = dir.join("report.json");
    report.write_json(&json_path).expect("write report");
    let raw = fs::read_to_string(&json_path).expect("read report");
    assert!(raw.contains("\"status\": \"completed\""));

    let _ = fs::remove_dir_all(Path::new(&dir));
}
