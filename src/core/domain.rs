use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::errors::HarnessError;

/// A test input. Opaque bytes; two test cases are the same test when their
/// contents are equal.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TestCase(Vec<u8>);

impl TestCase {
    pub fn new(input: impl Into<Vec<u8>>) -> Self {
        TestCase(input.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for TestCase {
    fn from(input: &str) -> Self {
        TestCase::new(input.as_bytes())
    }
}

/// A test of a task: the input plus the reference answer, if the task has one.
#[derive(Clone, Debug)]
pub struct TestData {
    pub name: String,
    pub input: TestCase,
    pub expected_output: Option<Vec<u8>>,
    /// Sanitizer verdict obtained before grading started, if any.
    pub sanitization: Option<Sanitization>,
}

/// An executable and the arguments it is always started with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub path: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Program {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Program {
            path: path.into(),
            args: Vec::new(),
        }
    }

    /// Returns a copy of the program with `extra` appended to its arguments.
    pub fn with_args<I, S>(&self, extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut program = self.clone();
        program.args.extend(extra.into_iter().map(Into::into));
        program
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SanitizerVerdict {
    Valid,
    Invalid,
}

/// What a sanitizer said about a test case. The diagnostic is whatever the
/// sanitizer printed and is never interpreted.
#[derive(Clone, Debug, PartialEq)]
pub struct Sanitization {
    pub verdict: SanitizerVerdict,
    pub diagnostic: String,
}

/// Time and memory ceilings enforced on a program run.
///
/// Comes either from the task configuration or from calibration; there is no
/// default limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimit {
    pub time_limit_ms: u64,
    pub memory_limit_bytes: u64,
}

impl ResourceLimit {
    pub fn new(time_limit_ms: u64, memory_limit_bytes: u64) -> Result<Self, HarnessError> {
        let limit = ResourceLimit {
            time_limit_ms,
            memory_limit_bytes,
        };
        limit.validate()?;
        Ok(limit)
    }

    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.time_limit_ms == 0 {
            return Err(HarnessError::InvalidLimits {
                reason: "time limit must be positive".to_string(),
            });
        }
        if self.memory_limit_bytes == 0 {
            return Err(HarnessError::InvalidLimits {
                reason: "memory limit must be positive".to_string(),
            });
        }
        Ok(())
    }

    pub fn time_limit(&self) -> Duration {
        Duration::from_millis(self.time_limit_ms)
    }
}

/// How a run ended. Timeout, memory exhaustion and an oversized stdout are
/// terminal conditions of their own, so an exit code only exists for a normal
/// exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Termination {
    Exited { code: i32 },
    Signaled { signal: i32 },
    TimedOut,
    OutOfMemory,
    OutputLimitExceeded,
}

impl Termination {
    pub fn is_success(&self) -> bool {
        matches!(self, Termination::Exited { code: 0 })
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Exited { code } => write!(f, "exited with code {code}"),
            Termination::Signaled { signal } => write!(f, "killed by signal {signal}"),
            Termination::TimedOut => write!(f, "timed out"),
            Termination::OutOfMemory => write!(f, "ran out of memory"),
            Termination::OutputLimitExceeded => write!(f, "wrote too much output"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stderr_truncated: bool,
    pub termination: Termination,
    pub wall_time: Duration,
    pub cpu_time: Duration,
    pub peak_memory_bytes: u64,
}

impl ExecutionResult {
    pub fn exit_code(&self) -> Option<i32> {
        match self.termination {
            Termination::Exited { code } => Some(code),
            _ => None,
        }
    }

    pub fn timed_out(&self) -> bool {
        self.termination == Termination::TimedOut
    }

    pub fn out_of_memory(&self) -> bool {
        self.termination == Termination::OutOfMemory
    }

    pub fn output_exceeded(&self) -> bool {
        self.termination == Termination::OutputLimitExceeded
    }
}

pub const MAX_SCORE: f64 = 100.0;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("score {0} is outside of [0, 100]")]
pub struct ScoreOutOfRange(pub f64);

/// A checker's grade. The score is always within `[0, 100]`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Grade {
    score: f64,
    message: String,
}

impl Grade {
    pub fn new(score: f64, message: impl Into<String>) -> Result<Self, ScoreOutOfRange> {
        if !score.is_finite() || !(0.0..=MAX_SCORE).contains(&score) {
            return Err(ScoreOutOfRange(score));
        }
        Ok(Grade {
            score,
            message: message.into(),
        })
    }

    pub fn zero(message: impl Into<String>) -> Self {
        Grade {
            score: 0.0,
            message: message.into(),
        }
    }

    pub fn full(message: impl Into<String>) -> Self {
        Grade {
            score: MAX_SCORE,
            message: message.into(),
        }
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitType {
    Time,
    Memory,
    Output,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct TestResources {
    pub wall_time_ms: u64,
    pub cpu_time_ms: u64,
    pub peak_memory_bytes: u64,
}

impl From<&ExecutionResult> for TestResources {
    fn from(result: &ExecutionResult) -> Self {
        TestResources {
            wall_time_ms: result.wall_time.as_millis() as u64,
            cpu_time_ms: result.cpu_time.as_millis() as u64,
            peak_memory_bytes: result.peak_memory_bytes,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TestOutcome {
    Rejected {
        diagnostic: String,
    },
    RuntimeError {
        termination: Termination,
        grade: Grade,
        resources: TestResources,
    },
    LimitsExceeded {
        limit_type: LimitType,
        grade: Grade,
        resources: TestResources,
    },
    Graded {
        grade: Grade,
        resources: TestResources,
    },
    CheckerFailed {
        message: String,
        resources: TestResources,
    },
}

impl TestOutcome {
    /// The score counted towards task statistics. Rejected tests and checker
    /// failures carry none.
    pub fn score(&self) -> Option<f64> {
        match self {
            TestOutcome::RuntimeError { grade, .. }
            | TestOutcome::LimitsExceeded { grade, .. }
            | TestOutcome::Graded { grade, .. } => Some(grade.score()),
            TestOutcome::Rejected { .. } | TestOutcome::CheckerFailed { .. } => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TestState {
    Pending,
    Running,
    Finished(TestOutcome),
}

#[derive(Clone, Debug)]
pub struct Task {
    pub id: Uuid,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub tests: Arc<Vec<TestData>>,
    pub limits: ResourceLimit,
    pub state: TaskState,
}

impl Task {
    pub fn new(tests: Vec<TestData>, limits: ResourceLimit) -> Self {
        let now = chrono::Utc::now();
        Task {
            id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            tests: Arc::new(tests),
            limits,
            state: TaskState::Pending,
        }
    }

    pub fn change_state(&self, new_state: TaskState) -> Self {
        Self {
            state: new_state,
            updated_at: chrono::Utc::now(),
            ..self.clone()
        }
    }
}

#[derive(Clone, Debug, Default)]
pub enum TaskState {
    #[default]
    Pending,
    Grading {
        tests: Vec<TestState>,
    },
    Done {
        outcomes: Vec<TestOutcome>,
    },
    Failed {
        msg: String,
    },
}
