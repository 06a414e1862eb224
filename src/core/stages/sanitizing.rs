use std::sync::Arc;

use crate::core::{
    domain::{Program, ResourceLimit, Sanitization, SanitizerVerdict, TestCase},
    errors::HarnessError,
    traits::process::ProcessRunner,
};

#[derive(Clone, Debug)]
pub struct SanitizerRunner {
    process: Arc<dyn ProcessRunner>,
    sanitizer: Program,
    ceiling: ResourceLimit,
}

impl SanitizerRunner {
    pub fn new(
        process: Arc<dyn ProcessRunner>,
        sanitizer: Program,
        ceiling: ResourceLimit,
    ) -> Self {
        SanitizerRunner {
            process,
            sanitizer,
            ceiling,
        }
    }

    /// Feeds `test` to the sanitizer. Exit code 0 means valid; any other
    /// termination, signals and timeouts included, means invalid. Failing to
    /// start the sanitizer is a configuration error.
    #[tracing::instrument(skip(self, test), fields(sanitizer = %self.sanitizer))]
    pub async fn verify(&self, test: &TestCase) -> Result<Sanitization, HarnessError> {
        let result = self
            .process
            .run(&self.sanitizer, test.as_bytes(), &self.ceiling)
            .await?;

        let diagnostic = String::from_utf8_lossy(&result.stdout).trim_end().to_string();
        let verdict = if result.termination.is_success() {
            SanitizerVerdict::Valid
        } else {
            tracing::debug!(
                termination = %result.termination,
                %diagnostic,
                "test case rejected by sanitizer"
            );
            SanitizerVerdict::Invalid
        };

        Ok(Sanitization {
            verdict,
            diagnostic,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::{
        domain::{ExecutionResult, Termination},
        traits::process::{MockProcessRunner, SpawnError},
    };

    fn result(termination: Termination, stdout: &str) -> ExecutionResult {
        ExecutionResult {
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
            stderr_truncated: false,
            termination,
            wall_time: Duration::from_millis(3),
            cpu_time: Duration::from_millis(1),
            peak_memory_bytes: 1024,
        }
    }

    fn runner(process: MockProcessRunner) -> SanitizerRunner {
        SanitizerRunner::new(
            Arc::new(process),
            Program::new("/task/sanitizer"),
            ResourceLimit::new(1000, 64 * 1024 * 1024).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_exit_zero_is_valid() {
        let mut process = MockProcessRunner::new();
        process
            .expect_run()
            .withf(|program, stdin, _| {
                program.path.ends_with("sanitizer") && stdin == b"1 2 3"
            })
            .times(1)
            .return_const(Ok(result(Termination::Exited { code: 0 }, "")));

        let sanitization = runner(process).verify(&TestCase::from("1 2 3")).await.unwrap();

        assert_eq!(sanitization.verdict, SanitizerVerdict::Valid);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_invalid() {
        let mut process = MockProcessRunner::new();
        process.expect_run().return_const(Ok(result(
            Termination::Exited { code: 1 },
            "Test case invalid: expected 3 elements, got 2 instead.\n",
        )));

        let sanitization = runner(process).verify(&TestCase::from("1 2")).await.unwrap();

        assert_eq!(sanitization.verdict, SanitizerVerdict::Invalid);
        assert_eq!(
            sanitization.diagnostic,
            "Test case invalid: expected 3 elements, got 2 instead."
        );
    }

    #[tokio::test]
    async fn test_abnormal_termination_is_invalid() {
        for termination in [
            Termination::Exited { code: 7 },
            Termination::Signaled { signal: 11 },
            Termination::TimedOut,
            Termination::OutOfMemory,
            Termination::OutputLimitExceeded,
        ] {
            let mut process = MockProcessRunner::new();
            process.expect_run().return_const(Ok(result(termination, "")));

            let sanitization = runner(process).verify(&TestCase::from("x")).await.unwrap();

            assert_eq!(sanitization.verdict, SanitizerVerdict::Invalid);
        }
    }

    #[tokio::test]
    async fn test_stdout_does_not_affect_verdict() {
        let mut process = MockProcessRunner::new();
        process.expect_run().return_const(Ok(result(
            Termination::Exited { code: 0 },
            "INVALID\n",
        )));

        let sanitization = runner(process).verify(&TestCase::from("1 2 3")).await.unwrap();

        assert_eq!(sanitization.verdict, SanitizerVerdict::Valid);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_configuration_error() {
        let mut process = MockProcessRunner::new();
        process
            .expect_run()
            .return_const(Err(SpawnError::FailedToLaunch {
                program: "/task/sanitizer".to_string(),
                msg: "No such file or directory".to_string(),
            }));

        let result = runner(process).verify(&TestCase::from("1 2 3")).await;

        assert!(matches!(result, Err(HarnessError::Spawn(_))));
    }
}
