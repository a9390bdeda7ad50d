//! Physical targets driven from a platform file, with the console tailed
//! from a log file.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use test_runner::stream::DEFAULT_POLL_INTERVAL;
use test_runner::{
    BoardRunner, BoardState, Config, Outcome, Pattern, RunContext, StreamSource, Target,
    TestResultChecker,
};

fn append(path: &Path, text: &str) {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    file.write_all(text.as_bytes()).unwrap();
}

fn platform_file(log: &Path) -> Config {
    let text = format!(
        r#"{{
            "platforms": {{
                "bench": {{
                    "kind": "physical",
                    "console": {{"tail": {log:?}}},
                    "power": {{
                        "lines": ["power", "reset"],
                        "backend": {{"type": "memory"}},
                        "on": {{"power": "on", "reset": "off"}},
                        "off": {{"power": "off", "reset": "on"}}
                    }},
                    "boot_pattern": "^\\*\\*\\* Booting .* \\*\\*\\*$",
                    "boot_regex": true,
                    "boot_timeout_secs": 5
                }}
            }}
        }}"#
    );
    Config::from_json(&text).unwrap()
}

#[tokio::test]
async fn tailed_file_may_appear_late() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("late.log");
    let mut stream = StreamSource::tail_file(&log, DEFAULT_POLL_INTERVAL);

    let writer = {
        let log = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            append(&log, "test1 PA");
            tokio::time::sleep(Duration::from_millis(200)).await;
            append(&log, "SS\n");
        })
    };

    let report = TestResultChecker::default()
        .check(&mut stream, &Pattern::literal("test1 PASS"), Duration::from_secs(5), true)
        .await
        .unwrap();
    assert!(report.outcome.is_success());
    writer.await.unwrap();
}

#[tokio::test]
async fn board_from_platform_file() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("console.log");
    let config = platform_file(&log);
    append(
        &log,
        "*** Booting Zephyr OS build v3.6 ***\nRunning TESTSUITE kernel\nASSERT main.c:42\nPASS - test_sem\n",
    );

    let target = Target::from_config("bench", config.platform("bench").unwrap()).unwrap();
    let mut runner = BoardRunner::new(target);
    runner
        .start(&RunContext::new("bench", Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(runner.state(), BoardState::Ready);

    let report = runner
        .check(&Pattern::literal("PASS - test_sem"), None, true)
        .await
        .unwrap();
    match report.outcome {
        Outcome::Failure { assertion } => assert_eq!(assertion.location_text, "ASSERT main.c:42"),
        other => panic!("unexpected {other:?}"),
    }

    runner.stop().await.unwrap();
    assert_eq!(runner.state(), BoardState::Done);
}

#[test]
fn unknown_line_in_platform_file_fails_fast() {
    let text = r#"{
        "platforms": {
            "bench": {
                "kind": "physical",
                "console": {"device": "/dev/ttyACM0"},
                "power": {
                    "lines": ["power"],
                    "backend": {"type": "memory"},
                    "on": {"power": "on", "reset": "off"}
                }
            }
        }
    }"#;
    let err = Config::from_json(text).unwrap_err();
    assert!(err.to_string().contains("platform `bench`"), "{err}");
}
