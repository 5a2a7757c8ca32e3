use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dp_conversion::{
    BridgeError, ConversionJob, ConversionRunner, InterpreterBridge, InterpreterConfig, Language,
    ScriptInterpreter, SubprocessFactory, MIN_BLOCK_SIZE,
};
use dp_core::Step;
use futures::{pin_mut, StreamExt};
use tempfile::tempdir;

const PASS_THROUGH: &str = "def convert(raw, out):\n    with open(raw) as src, open(out, 'w') as dst:\n        dst.write(src.read())\n";

fn python_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .is_ok_and(|out| out.status.success())
}

fn write_script(dir: &Path, body: &str) -> std::path::PathBuf {
    let script = dir.join("conversion.py");
    std::fs::write(&script, body).expect("write script");
    script
}

#[tokio::test]
async fn python_bridge_runs_conversion_script() {
    if !python_available() {
        eprintln!("python3 not installed, skipping");
        return;
    }
    let dir = tempdir().expect("tempdir");
    let script = write_script(dir.path(), PASS_THROUGH);
    let input = dir.path().join("in.raw");
    let output = dir.path().join("out.csv");
    std::fs::write(&input, "timestamp;parameter;value;site\n2020-01-01 00:00:00;temp;1;lake\n")
        .expect("input");

    let mut bridge = InterpreterBridge::start(Language::Python, InterpreterConfig::default())
        .await
        .expect("python starts");
    bridge
        .run_script(&script, &input, &output)
        .await
        .expect("script runs");
    let written = std::fs::read_to_string(&output).expect("output");
    assert!(written.contains("temp;1;lake"));
    bridge.shutdown().await;
    assert_eq!(bridge.pid(), None);
}

#[tokio::test]
async fn raising_script_returns_trace() {
    if !python_available() {
        eprintln!("python3 not installed, skipping");
        return;
    }
    let dir = tempdir().expect("tempdir");
    let script = write_script(
        dir.path(),
        "def convert(raw, out):\n    raise ValueError('unexpected column count')\n",
    );
    let input = dir.path().join("in.raw");
    std::fs::write(&input, "header\n").expect("input");

    let mut bridge = InterpreterBridge::start(Language::Python, InterpreterConfig::default())
        .await
        .expect("python starts");
    let err = bridge
        .run_script(&script, &input, &dir.path().join("out.csv"))
        .await
        .expect_err("script raises");
    match err {
        BridgeError::ScriptFailed { exit_code, trace } => {
            assert_eq!(exit_code, 1);
            assert!(trace.contains("ValueError"));
        }
        other => panic!("unexpected error {other}"),
    }

    // The interpreter survives a failing script.
    bridge.execute("0").await.expect("still alive");
    bridge.shutdown().await;
}

#[tokio::test]
async fn call_limit_restarts_interpreter() {
    if !python_available() {
        eprintln!("python3 not installed, skipping");
        return;
    }
    let dir = tempdir().expect("tempdir");
    let script = write_script(dir.path(), PASS_THROUGH);
    let raw = dir.path().join("data-20200101.raw");
    std::fs::write(&raw, "timestamp;parameter;value;site\n2020-01-01 00:00:00;temp;1;lake\n")
        .expect("raw");
    let job = ConversionJob {
        script,
        raw,
        source: Some("sensor-1".to_string()),
    };
    let mut runner = ConversionRunner::new(
        Arc::new(SubprocessFactory::new(InterpreterConfig::default())),
        MIN_BLOCK_SIZE,
    )
    .with_call_limit(2);

    let mut pids = Vec::new();
    for _ in 0..3 {
        {
            let steps = runner.run(&job);
            pin_mut!(steps);
            while let Some(step) = steps.next().await {
                if let Step::Failure(err) = step {
                    panic!("conversion failed: {err}");
                }
            }
        }
        pids.push(runner.interpreter_pids()[&Language::Python]);
    }
    assert_eq!(pids[0], pids[1]);
    assert_ne!(pids[1], pids[2]);
    runner.shutdown().await;
}

#[tokio::test]
async fn exited_interpreter_still_shuts_down() {
    if !python_available() {
        eprintln!("python3 not installed, skipping");
        return;
    }
    let mut bridge = InterpreterBridge::start(Language::Python, InterpreterConfig::default())
        .await
        .expect("python starts");
    assert!(bridge.execute("import os\nos._exit(0)").await.is_err());
    bridge.shutdown().await;
    assert_eq!(bridge.pid(), None);
}

#[tokio::test]
async fn timed_out_call_leaves_interpreter_usable() {
    if !python_available() {
        eprintln!("python3 not installed, skipping");
        return;
    }
    let config = InterpreterConfig {
        call_timeout: Some(Duration::from_millis(200)),
        ..InterpreterConfig::default()
    };
    let mut bridge = InterpreterBridge::start(Language::Python, config)
        .await
        .expect("python starts");
    let pid = bridge.pid();
    let err = bridge
        .execute("import time\ntime.sleep(1)")
        .await
        .expect_err("times out");
    assert!(matches!(err, BridgeError::Timeout { .. }));

    let response = bridge.execute("print('after')").await.expect("next call");
    assert_eq!(response.output, vec!["after"]);
    assert_eq!(bridge.pid(), pid);
    bridge.shutdown().await;
}

#[tokio::test]
async fn runner_converts_with_real_python() {
    if !python_available() {
        eprintln!("python3 not installed, skipping");
        return;
    }
    let dir = tempdir().expect("tempdir");
    let script = write_script(dir.path(), PASS_THROUGH);
    let raw = dir.path().join("data-20200101.raw");
    std::fs::write(
        &raw,
        "timestamp;parameter;value;site\n2020-01-01 00:00:00;temp;23.5;lake\n2020-01-01 00:01:00;temp;23.6;lake\n",
    )
    .expect("raw");

    let mut runner = ConversionRunner::new(
        Arc::new(SubprocessFactory::new(InterpreterConfig::default())),
        MIN_BLOCK_SIZE,
    );
    let job = ConversionJob {
        script,
        raw,
        source: Some("sensor-1".to_string()),
    };
    let mut signals = None;
    {
        let steps = runner.run(&job);
        pin_mut!(steps);
        while let Some(step) = steps.next().await {
            match step {
                Step::Done(done) => signals = Some(done),
                Step::Failure(err) => panic!("conversion failed: {err}"),
                Step::Progress(_) => {}
            }
        }
    }
    let signals = signals.expect("signals");
    assert_eq!(signals.len(), 2);
    assert!(signals.iter().all(|s| s.source == "sensor-1"));
    assert!(runner.interpreter_pids().contains_key(&Language::Python));
    runner.shutdown().await;
}
