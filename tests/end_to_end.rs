use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use taskgrader::{
    constants::{TOOL_MEMORY_LIMIT_BYTES, TOOL_TIME_LIMIT_MS},
    core::{
        calibration::multiplier::Calibrator,
        domain::{Program, ResourceLimit, SanitizerVerdict, TestCase},
        stages::{checking::CheckerRunner, sanitizing::SanitizerRunner},
        traits::process::ProcessRunner,
    },
    native::process::NativeProcessRunner,
};

const SANITIZER: &str = env!("CARGO_BIN_EXE_three-ints-sanitizer");
const CHECKER: &str = env!("CARGO_BIN_EXE_min3-checker");
const TASKGRADER: &str = env!("CARGO_BIN_EXE_taskgrader");

/// Prints the minimum of three integers read from standard input.
const MIN3_SOLUTION: &str =
    "read a b c; m=$a; [ $b -lt $m ] && m=$b; [ $c -lt $m ] && m=$c; echo $m";

fn process() -> Arc<dyn ProcessRunner> {
    Arc::new(NativeProcessRunner::default())
}

fn tool_ceiling() -> ResourceLimit {
    ResourceLimit::new(TOOL_TIME_LIMIT_MS, TOOL_MEMORY_LIMIT_BYTES).unwrap()
}

fn temp_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("taskgrader_e2e_{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn checker() -> CheckerRunner {
    CheckerRunner::new(process(), Program::new(CHECKER), tool_ceiling(), temp_dir())
}

#[tokio::test]
async fn test_sanitizer_accepts_three_integers() {
    let sanitizer = SanitizerRunner::new(process(), Program::new(SANITIZER), tool_ceiling());

    let valid = sanitizer.verify(&TestCase::from("1 2 3")).await.unwrap();
    assert_eq!(valid.verdict, SanitizerVerdict::Valid);

    let invalid = sanitizer.verify(&TestCase::from("1 2")).await.unwrap();
    assert_eq!(invalid.verdict, SanitizerVerdict::Invalid);
    assert_eq!(
        invalid.diagnostic,
        "Test case invalid: expected 3 elements, got 2 instead."
    );
}

#[tokio::test]
async fn test_checker_accepts_minimum() {
    let grade = checker().grade(b"1", b"3 1 2", None).await.unwrap();

    assert_eq!(grade.score(), 100.0);
}

#[tokio::test]
async fn test_checker_rejects_wrong_answer() {
    let grade = checker().grade(b"2\n", b"3 1 2", None).await.unwrap();

    assert_eq!(grade.score(), 0.0);
    assert!(grade.message().contains("expected answer was `1`"), "{}", grade.message());
}

#[test]
fn test_checker_wrong_argument_count() {
    let output = Command::new(CHECKER).arg("only-one").output().unwrap();

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stdout).starts_with("Error:"));
}

#[tokio::test]
async fn test_calibration_leaves_headroom() {
    let reference = Program::new("/bin/sh").with_args(["-c", "sleep 0.2; cat >/dev/null"]);
    let calibrator = Calibrator::new(
        process(),
        ResourceLimit::new(60_000, 1024 * 1024 * 1024).unwrap(),
        2,
    );

    let limit = calibrator
        .calibrate(&reference, &[TestCase::from("1 2 3"), TestCase::from("4 5 6")], 1.5)
        .await
        .unwrap();

    assert!(limit.time_limit_ms >= 300, "{limit:?}");
    assert_eq!(limit.time_limit_ms % 100, 0);
    assert!(limit.memory_limit_bytes > 0);
}

fn write_task(dir: &Path, solution: &str) -> PathBuf {
    std::fs::create_dir_all(dir.join("tests")).unwrap();
    std::fs::write(dir.join("tests/01.in"), "3 1 2\n").unwrap();
    std::fs::write(dir.join("tests/02.in"), "1 2\n").unwrap();
    std::fs::write(dir.join("tests/03.in"), "5 4 6\n").unwrap();

    let task = serde_json::json!({
        "sanitizer": {"path": SANITIZER},
        "solution": {"path": "/bin/sh", "args": ["-c", solution]},
        "checker": {"path": CHECKER},
        "tests_dir": "tests",
        "limits": {"time_limit_ms": 2000, "memory_limit_bytes": 268435456u64},
        "parallelism": 2
    });
    let path = dir.join("task.json");
    std::fs::write(&path, task.to_string()).unwrap();
    path
}

fn grade_task(task: &Path, work_dir: &Path) -> (Option<i32>, serde_json::Value) {
    let output = Command::new(TASKGRADER)
        .arg("--work-dir")
        .arg(work_dir)
        .arg("grade")
        .arg("--task")
        .arg(task)
        .output()
        .unwrap();
    let report = serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
        panic!(
            "no report ({e}), stderr: {}",
            String::from_utf8_lossy(&output.stderr)
        )
    });
    (output.status.code(), report)
}

#[test]
fn test_grade_task_with_correct_solution() {
    let dir = temp_dir();
    let task = write_task(&dir, MIN3_SOLUTION);

    let (code, report) = grade_task(&task, &dir.join("work"));

    assert_eq!(code, Some(0));
    assert_eq!(report["tests"][0]["name"], "01");
    assert_eq!(report["tests"][0]["outcome"], "graded");
    assert_eq!(report["tests"][1]["outcome"], "rejected");
    assert_eq!(report["tests"][2]["outcome"], "graded");
    assert_eq!(report["summary"]["graded"], 2);
    assert_eq!(report["summary"]["rejected"], 1);
    assert_eq!(report["summary"]["mean_score"], 100.0);
}

#[test]
fn test_grade_task_with_faulty_solutions() {
    let dir = temp_dir();

    let task = write_task(&dir, "cat >/dev/null; echo 2");
    let (_, report) = grade_task(&task, &dir.join("work"));
    assert_eq!(report["summary"]["mean_score"], 0.0);
    assert!(
        report["tests"][0]["grade"]["message"]
            .as_str()
            .unwrap()
            .contains("expected answer was `1`")
    );

    let task = write_task(&dir, "sleep 30");
    let (_, report) = grade_task(&task, &dir.join("work"));
    assert_eq!(report["tests"][0]["outcome"], "limits_exceeded");
    assert_eq!(report["tests"][0]["limit_type"], "time");
    assert_eq!(report["summary"]["limits_exceeded"], 2);

    let task = write_task(&dir, "exit 3");
    let (_, report) = grade_task(&task, &dir.join("work"));
    assert_eq!(report["tests"][2]["outcome"], "runtime_error");
    assert_eq!(report["tests"][2]["termination"]["code"], 3);
}

#[test]
fn test_run_command_reports_timeout() {
    let output = Command::new(TASKGRADER)
        .args(["run", "--time-limit-ms", "200", "--", "/bin/sh", "-c", "echo started; sleep 10"])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(124));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "started\n");
}

#[test]
fn test_run_command_forwards_exit_code() {
    let output = Command::new(TASKGRADER)
        .args(["run", "--", "/bin/sh", "-c", "echo out; echo err >&2; exit 5"])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(5));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "out\n");
    assert!(String::from_utf8_lossy(&output.stderr).contains("err"));
}
