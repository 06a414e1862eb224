use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use uuid::Uuid;

use crate::core::{
    domain::{ExecutionResult, Grade, Program, ResourceLimit, Termination},
    errors::{CheckerError, HarnessError},
    traits::process::ProcessRunner,
};

const SOLUTION_OUTPUT_FILE: &str = "test.solout";
const INPUT_FILE: &str = "test.in";
const REFERENCE_OUTPUT_FILE: &str = "test.out";

/// Harness side of the checker protocol.
///
/// The checker gets three paths, in this order: the solution output, the test
/// input and the reference output (an empty file when the task has none). It
/// prints a score in `[0, 100]` on its first line and free-form diagnostics
/// after it. Exit code 0 means checking completed, whatever the score; any
/// other exit means checking itself failed.
#[derive(Clone, Debug)]
pub struct CheckerRunner {
    process: Arc<dyn ProcessRunner>,
    checker: Program,
    ceiling: ResourceLimit,
    scratch_dir: PathBuf,
}

impl CheckerRunner {
    pub fn new(
        process: Arc<dyn ProcessRunner>,
        checker: Program,
        ceiling: ResourceLimit,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        CheckerRunner {
            process,
            checker,
            ceiling,
            scratch_dir: scratch_dir.into(),
        }
    }

    #[tracing::instrument(skip_all, fields(checker = %self.checker))]
    pub async fn grade(
        &self,
        solution_output: &[u8],
        original_input: &[u8],
        reference_output: Option<&[u8]>,
    ) -> Result<Grade, CheckerError> {
        let dir = self.scratch_dir.join(format!("check_{}", Uuid::new_v4()));
        fs::create_dir_all(&dir)
            .await
            .map_err(HarnessError::io("failed to create checker directory", &dir))?;

        let result = self
            .check_in(&dir, solution_output, original_input, reference_output)
            .await;

        if let Err(e) = fs::remove_dir_all(&dir).await {
            tracing::warn!("failed to remove {}: {}", dir.display(), e);
        }

        let grade = parse_checker_output(&result?)?;
        tracing::debug!(score = grade.score(), "checker graded the output");
        Ok(grade)
    }

    async fn check_in(
        &self,
        dir: &Path,
        solution_output: &[u8],
        original_input: &[u8],
        reference_output: Option<&[u8]>,
    ) -> Result<ExecutionResult, HarnessError> {
        let artifacts = [
            (dir.join(SOLUTION_OUTPUT_FILE), solution_output),
            (dir.join(INPUT_FILE), original_input),
            (dir.join(REFERENCE_OUTPUT_FILE), reference_output.unwrap_or_default()),
        ];
        for (path, contents) in &artifacts {
            fs::write(path, contents)
                .await
                .map_err(HarnessError::io("failed to write checker input", path))?;
        }

        let invocation = self.checker.with_args(
            artifacts
                .iter()
                .map(|(path, _)| path.to_string_lossy().into_owned()),
        );
        Ok(self.process.run(&invocation, b"", &self.ceiling).await?)
    }
}

/// Turns a finished checker run into a grade. Only the first line of standard
/// output is interpreted.
pub fn parse_checker_output(result: &ExecutionResult) -> Result<Grade, CheckerError> {
    let stdout = String::from_utf8_lossy(&result.stdout);

    match result.termination {
        Termination::Exited { code: 0 } => {}
        Termination::Exited { code } => {
            return Err(CheckerError::InternalError {
                exit_code: Some(code),
                message: failure_message(&stdout, &result.stderr),
            });
        }
        termination => {
            return Err(CheckerError::InternalError {
                exit_code: None,
                message: format!("checker {termination}"),
            });
        }
    }

    let mut lines = stdout.lines();
    let score_line = lines.next().map(str::trim).unwrap_or_default();
    if score_line.is_empty() {
        return Err(CheckerError::ProtocolViolation {
            reason: "missing score line".to_string(),
        });
    }
    let score: f64 = score_line
        .parse()
        .map_err(|_| CheckerError::ProtocolViolation {
            reason: format!("score line `{score_line}` is not a number"),
        })?;
    let message = lines.collect::<Vec<_>>().join("\n").trim().to_string();

    Grade::new(score, message).map_err(|e| CheckerError::ProtocolViolation {
        reason: e.to_string(),
    })
}

fn failure_message(stdout: &str, stderr: &[u8]) -> String {
    let stdout = stdout.trim();
    if !stdout.is_empty() {
        return stdout.to_string();
    }
    String::from_utf8_lossy(stderr).trim().to_string()
}
