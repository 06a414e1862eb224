use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::{
    config::{HarnessSettings, TaskConfig, default_parallelism, read_file},
    constants::DEFAULT_SAFETY_MULTIPLIER,
    core::{
        calibration::{multiplier::Calibrator, search::LimitSearch},
        domain::{
            Program, ResourceLimit, SanitizerVerdict, Task, TaskState, TestCase, TestData,
            TestState, Termination,
        },
        errors::HarnessError,
        pipeline::grading::{TaskPipeline, handle_grading},
        stages::{checking::CheckerRunner, running::SolutionRunner, sanitizing::SanitizerRunner},
        traits::process::ProcessRunner,
    },
    native::process::NativeProcessRunner,
    report::TaskReport,
};

/// Exit status of `run` when the command hit its time limit, as with `timeout(1)`.
const TIMED_OUT_EXIT_STATUS: u8 = 124;
/// Exit status of `run` when the command hit its memory limit, as for a SIGKILL.
const OUT_OF_MEMORY_EXIT_STATUS: u8 = 137;
/// Exit status of `run` when the command flooded stdout, as for a SIGXFSZ.
const OUTPUT_LIMIT_EXIT_STATUS: u8 = 153;

#[derive(Debug, Parser)]
#[command(
    name = "taskgrader",
    version,
    about = "Grades solutions against sanitized tests and a checker"
)]
pub struct Cli {
    /// Scratch directory for checker inputs.
    #[arg(long, global = true)]
    pub work_dir: Option<PathBuf>,

    /// Programs run at the same time.
    #[arg(long, global = true)]
    pub parallelism: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Derive limits from a reference program and a safety multiplier.
    Calibrate(CalibrateArgs),
    /// Bisect for the tightest limits the reference still passes under.
    SearchLimits(SearchArgs),
    /// Run a sanitizer on test inputs.
    Sanitize(SanitizeArgs),
    /// Grade one solution output with a checker.
    Check(CheckArgs),
    /// Grade a whole task.
    Grade(GradeArgs),
    /// Run a command under time and memory limits.
    Run(RunArgs),
}

#[derive(Debug, Args)]
pub struct ReferenceArgs {
    #[arg(long)]
    pub reference: PathBuf,
    /// Argument passed to the reference; repeatable.
    #[arg(long = "arg", allow_hyphen_values = true)]
    pub args: Vec<String>,
    #[arg(long = "sample", required = true)]
    pub samples: Vec<PathBuf>,
}

#[derive(Debug, Args)]
pub struct CalibrateArgs {
    #[command(flatten)]
    pub reference: ReferenceArgs,
    #[arg(long, default_value_t = DEFAULT_SAFETY_MULTIPLIER)]
    pub safety_multiplier: f64,
    /// Also write the limits to this file.
    #[arg(long)]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct SearchArgs {
    #[command(flatten)]
    pub reference: ReferenceArgs,
}

#[derive(Debug, Args)]
pub struct SanitizeArgs {
    #[arg(long)]
    pub sanitizer: PathBuf,
    #[arg(long = "arg", allow_hyphen_values = true)]
    pub args: Vec<String>,
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,
}

#[derive(Debug, Args)]
pub struct CheckArgs {
    #[arg(long)]
    pub checker: PathBuf,
    #[arg(long = "arg", allow_hyphen_values = true)]
    pub args: Vec<String>,
    /// Solution output.
    #[arg(long)]
    pub output: PathBuf,
    /// Test input.
    #[arg(long)]
    pub input: PathBuf,
    /// Reference output.
    #[arg(long)]
    pub expected: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct GradeArgs {
    #[arg(long)]
    pub task: PathBuf,
    /// Overrides the task's calibration multiplier.
    #[arg(long)]
    pub safety_multiplier: Option<f64>,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[arg(long, default_value_t = 10_000)]
    pub time_limit_ms: u64,
    #[arg(long, default_value_t = 1024 * 1024 * 1024)]
    pub memory_limit_bytes: u64,
    /// File fed to the command's standard input.
    #[arg(long)]
    pub stdin: Option<PathBuf>,
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

struct Harness {
    settings: HarnessSettings,
    process: Arc<dyn ProcessRunner>,
    parallelism: Option<usize>,
}

impl Harness {
    fn new(cli: &Cli) -> Self {
        let mut settings = HarnessSettings::default();
        if let Some(work_dir) = &cli.work_dir {
            settings.work_dir = work_dir.clone();
        }
        let process = Arc::new(NativeProcessRunner::new(
            settings.memory_poll_interval,
            settings.stdout_capture_bytes,
            settings.stderr_capture_bytes,
        ));
        Harness {
            settings,
            process,
            parallelism: cli.parallelism,
        }
    }

    fn parallelism_or(&self, default: usize) -> usize {
        self.parallelism.unwrap_or(default).max(1)
    }
}

pub async fn execute(cli: Cli) -> Result<ExitCode, Box<dyn Error>> {
    let harness = Harness::new(&cli);

    match cli.command {
        Command::Calibrate(args) => calibrate(&harness, args).await,
        Command::SearchLimits(args) => search_limits(&harness, args).await,
        Command::Sanitize(args) => sanitize(&harness, args).await,
        Command::Check(args) => check(&harness, args).await,
        Command::Grade(args) => grade(&harness, args).await,
        Command::Run(args) => run(&harness, args).await,
    }
}

async fn calibrate(harness: &Harness, args: CalibrateArgs) -> Result<ExitCode, Box<dyn Error>> {
    let reference = Program::new(&args.reference.reference).with_args(args.reference.args);
    let samples = read_samples(&args.reference.samples).await?;

    let calibrator = Calibrator::new(
        harness.process.clone(),
        harness.settings.provisional_ceiling,
        harness.parallelism_or(default_parallelism()),
    );
    let limit = calibrator
        .calibrate(&reference, &samples, args.safety_multiplier)
        .await?;

    let json = serde_json::to_string(&limit)?;
    if let Some(output) = &args.output {
        tokio::fs::write(output, format!("{json}\n"))
            .await
            .map_err(HarnessError::io("failed to write limits", output))?;
    }
    println!("{json}");
    Ok(ExitCode::SUCCESS)
}

async fn search_limits(harness: &Harness, args: SearchArgs) -> Result<ExitCode, Box<dyn Error>> {
    let reference = Program::new(&args.reference.reference).with_args(args.reference.args);
    let samples = read_samples(&args.reference.samples).await?;

    let search = LimitSearch::new(
        harness.process.clone(),
        harness.settings.provisional_ceiling,
        harness.parallelism_or(default_parallelism()),
    );
    let searched = search.search(&reference, &samples).await?;

    println!("{}", serde_json::to_string(&searched)?);
    Ok(ExitCode::SUCCESS)
}

async fn sanitize(harness: &Harness, args: SanitizeArgs) -> Result<ExitCode, Box<dyn Error>> {
    let sanitizer = SanitizerRunner::new(
        harness.process.clone(),
        Program::new(&args.sanitizer).with_args(args.args),
        harness.settings.tool_ceiling,
    );

    let mut all_valid = true;
    for input in &args.inputs {
        let test = TestCase::new(read_file(input, "failed to read test input").await?);
        let sanitization = sanitizer.verify(&test).await?;
        all_valid &= sanitization.verdict == SanitizerVerdict::Valid;
        println!(
            "{}",
            serde_json::json!({
                "input": input,
                "verdict": sanitization.verdict,
                "diagnostic": sanitization.diagnostic,
            })
        );
    }

    Ok(if all_valid {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

async fn check(harness: &Harness, args: CheckArgs) -> Result<ExitCode, Box<dyn Error>> {
    let checker = CheckerRunner::new(
        harness.process.clone(),
        Program::new(&args.checker).with_args(args.args),
        harness.settings.tool_ceiling,
        &harness.settings.work_dir,
    );

    let solution_output = read_file(&args.output, "failed to read solution output").await?;
    let input = read_file(&args.input, "failed to read test input").await?;
    let expected = match &args.expected {
        Some(path) => Some(read_file(path, "failed to read expected output").await?),
        None => None,
    };

    let grade = checker
        .grade(&solution_output, &input, expected.as_deref())
        .await?;

    println!("{}", serde_json::to_string(&grade)?);
    Ok(ExitCode::SUCCESS)
}

async fn grade(harness: &Harness, args: GradeArgs) -> Result<ExitCode, Box<dyn Error>> {
    let mut config = TaskConfig::load(&args.task).await?;
    if let Some(parallelism) = harness.parallelism {
        config.parallelism = parallelism.max(1);
        config.calibration.parallelism = parallelism.max(1);
    }
    if let Some(multiplier) = args.safety_multiplier {
        config.calibration.safety_multiplier = multiplier;
    }

    let mut tests = config.load_tests().await?;
    let sanitizer = match (&config.sanitizer, config.sanitize) {
        (Some(sanitizer), true) => Some(SanitizerRunner::new(
            harness.process.clone(),
            sanitizer.clone(),
            harness.settings.tool_ceiling,
        )),
        _ => None,
    };

    let limits = match config.limits {
        Some(limits) => limits,
        None => calibrate_task(harness, &config, sanitizer.as_ref(), &mut tests).await?,
    };
    tracing::info!(
        time_limit_ms = limits.time_limit_ms,
        memory_limit_bytes = limits.memory_limit_bytes,
        "grading {} tests",
        tests.len()
    );

    let pipeline = Arc::new(TaskPipeline::new(
        sanitizer,
        SolutionRunner::new(harness.process.clone(), config.solution.clone()),
        CheckerRunner::new(
            harness.process.clone(),
            config.checker.clone(),
            harness.settings.tool_ceiling,
            &harness.settings.work_dir,
        ),
        config.parallelism,
    ));

    let (res_tx, mut res_rx) = mpsc::channel(32);
    let (grade_tx, grade_rx) = mpsc::channel(1);
    handle_grading(res_tx, grade_rx, pipeline);

    let task = Task::new(tests, limits);
    grade_tx.send(task).await?;

    while let Some(task) = res_rx.recv().await {
        match task.state {
            TaskState::Pending => {}
            TaskState::Grading { tests } => {
                let finished = tests
                    .iter()
                    .filter(|t| matches!(t, TestState::Finished(_)))
                    .count();
                tracing::debug!("{}/{} tests finished", finished, tests.len());
            }
            TaskState::Done { outcomes } => {
                let report = TaskReport::new(task.id, task.limits, &task.tests, outcomes);
                tracing::info!("{}", report.summary);
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(ExitCode::SUCCESS);
            }
            TaskState::Failed { msg } => {
                return Err(msg.into());
            }
        }
    }

    Err("grading stopped before the task finished".into())
}

/// Calibrates limits for a task without fixed ones. Samples default to the
/// task's tests that the sanitizer accepts; their verdicts stay attached to
/// the tests so grading does not sanitize them again.
async fn calibrate_task(
    harness: &Harness,
    config: &TaskConfig,
    sanitizer: Option<&SanitizerRunner>,
    tests: &mut [TestData],
) -> Result<ResourceLimit, Box<dyn Error>> {
    let reference = config
        .reference
        .as_ref()
        .ok_or_else(|| HarnessError::InvalidConfig {
            msg: "no limits and no reference program".to_string(),
        })?;

    let samples = match config.load_samples().await? {
        Some(samples) => samples,
        None => {
            let mut samples = Vec::with_capacity(tests.len());
            for test in tests.iter_mut() {
                if let Some(sanitizer) = sanitizer {
                    test.sanitization = Some(sanitizer.verify(&test.input).await?);
                }
                let valid = test
                    .sanitization
                    .as_ref()
                    .is_none_or(|s| s.verdict == SanitizerVerdict::Valid);
                if valid {
                    samples.push(test.input.clone());
                }
            }
            samples
        }
    };

    let calibrator = Calibrator::new(
        harness.process.clone(),
        harness.settings.provisional_ceiling,
        config.calibration.parallelism,
    );
    Ok(calibrator
        .calibrate(reference, &samples, config.calibration.safety_multiplier)
        .await?)
}

async fn run(harness: &Harness, args: RunArgs) -> Result<ExitCode, Box<dyn Error>> {
    let limits = ResourceLimit::new(args.time_limit_ms, args.memory_limit_bytes)?;
    let (path, rest) = args
        .command
        .split_first()
        .ok_or("missing command to run")?;
    let program = Program::new(path).with_args(rest.iter().cloned());
    let stdin = match &args.stdin {
        Some(path) => read_file(path, "failed to read standard input file").await?,
        None => Vec::new(),
    };

    let result = harness.process.run(&program, &stdin, &limits).await?;

    let mut stdout = tokio::io::stdout();
    stdout.write_all(&result.stdout).await?;
    stdout.flush().await?;
    let mut stderr = tokio::io::stderr();
    stderr.write_all(&result.stderr).await?;
    stderr.flush().await?;

    tracing::info!(
        termination = %result.termination,
        wall_time_ms = result.wall_time.as_millis() as u64,
        cpu_time_ms = result.cpu_time.as_millis() as u64,
        peak_memory_bytes = result.peak_memory_bytes,
        "command finished"
    );
    Ok(ExitCode::from(exit_status(&result.termination)))
}

fn exit_status(termination: &Termination) -> u8 {
    match *termination {
        Termination::Exited { code } => u8::try_from(code).unwrap_or(1),
        Termination::Signaled { signal } => u8::try_from(128 + signal).unwrap_or(1),
        Termination::TimedOut => TIMED_OUT_EXIT_STATUS,
        Termination::OutOfMemory => OUT_OF_MEMORY_EXIT_STATUS,
        Termination::OutputLimitExceeded => OUTPUT_LIMIT_EXIT_STATUS,
    }
}

async fn read_samples(paths: &[PathBuf]) -> Result<Vec<TestCase>, HarnessError> {
    let mut samples = Vec::with_capacity(paths.len());
    for path in paths {
        samples.push(TestCase::new(
            read_file(path, "failed to read calibration sample").await?,
        ));
    }
    Ok(samples)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{domain::ExecutionResult, traits::process::MockProcessRunner};
    use clap::CommandFactory;
    use std::time::Duration;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_calibrate() {
        let cli = Cli::try_parse_from([
            "taskgrader",
            "calibrate",
            "--reference",
            "./ref",
            "--arg",
            "-O",
            "--sample",
            "a.in",
            "--sample",
            "b.in",
            "--safety-multiplier",
            "2",
        ])
        .unwrap();

        let Command::Calibrate(args) = cli.command else {
            panic!("expected calibrate, got {:?}", cli.command);
        };
        assert_eq!(args.reference.args, vec!["-O"]);
        assert_eq!(args.reference.samples.len(), 2);
        assert_eq!(args.safety_multiplier, 2.0);
    }

    #[test]
    fn test_parse_run_keeps_command_flags() {
        let cli = Cli::try_parse_from([
            "taskgrader",
            "--parallelism",
            "3",
            "run",
            "--time-limit-ms",
            "500",
            "--",
            "/bin/sh",
            "-c",
            "echo hi",
        ])
        .unwrap();

        assert_eq!(cli.parallelism, Some(3));
        let Command::Run(args) = cli.command else {
            panic!("expected run, got {:?}", cli.command);
        };
        assert_eq!(args.time_limit_ms, 500);
        assert_eq!(args.command, vec!["/bin/sh", "-c", "echo hi"]);
    }

    #[test]
    fn test_calibrate_requires_samples() {
        let result = Cli::try_parse_from(["taskgrader", "calibrate", "--reference", "./ref"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_exit_status() {
        assert_eq!(exit_status(&Termination::Exited { code: 0 }), 0);
        assert_eq!(exit_status(&Termination::Exited { code: 3 }), 3);
        assert_eq!(exit_status(&Termination::Signaled { signal: 9 }), 137);
        assert_eq!(exit_status(&Termination::TimedOut), TIMED_OUT_EXIT_STATUS);
        assert_eq!(exit_status(&Termination::OutOfMemory), OUT_OF_MEMORY_EXIT_STATUS);
        assert_eq!(
            exit_status(&Termination::OutputLimitExceeded),
            OUTPUT_LIMIT_EXIT_STATUS
        );
    }

    fn exited(code: i32) -> ExecutionResult {
        ExecutionResult {
            stdout: Vec::new(),
            stderr: Vec::new(),
            stderr_truncated: false,
            termination: Termination::Exited { code },
            wall_time: Duration::from_millis(400),
            cpu_time: Duration::from_millis(390),
            peak_memory_bytes: 50 * 1024 * 1024,
        }
    }

    #[tokio::test]
    async fn test_calibration_keeps_sanitizer_verdicts() {
        let mut sanitizer = MockProcessRunner::new();
        sanitizer
            .expect_run()
            .times(2)
            .returning(|_, stdin, _| Ok(exited(if stdin == b"3 1 2" { 0 } else { 1 })));
        let sanitizer = SanitizerRunner::new(
            Arc::new(sanitizer),
            Program::new("/task/sanitizer"),
            HarnessSettings::default().tool_ceiling,
        );
        let mut reference = MockProcessRunner::new();
        reference
            .expect_run()
            .withf(|_, stdin, _| stdin == b"3 1 2")
            .times(1)
            .returning(|_, _, _| Ok(exited(0)));
        let harness = Harness {
            settings: HarnessSettings::default(),
            process: Arc::new(reference),
            parallelism: None,
        };
        let config = TaskConfig::from_json(
            br#"{
                "solution": {"path": "solution"},
                "checker": {"path": "checker"},
                "reference": {"path": "reference"},
                "tests": [{"input": "01.in"}, {"input": "02.in"}]
            }"#,
            std::path::Path::new("/task"),
        )
        .unwrap();
        let mut tests = vec![
            TestData {
                name: "01".to_string(),
                input: TestCase::from("3 1 2"),
                expected_output: None,
                sanitization: None,
            },
            TestData {
                name: "02".to_string(),
                input: TestCase::from("1 2"),
                expected_output: None,
                sanitization: None,
            },
        ];

        let limits = calibrate_task(&harness, &config, Some(&sanitizer), &mut tests)
            .await
            .unwrap();

        assert_eq!(limits, ResourceLimit::new(600, 75 * 1024 * 1024).unwrap());
        let verdicts: Vec<_> = tests
            .iter()
            .map(|t| t.sanitization.as_ref().map(|s| s.verdict))
            .collect();
        assert_eq!(
            verdicts,
            vec![Some(SanitizerVerdict::Valid), Some(SanitizerVerdict::Invalid)]
        );
    }
}
