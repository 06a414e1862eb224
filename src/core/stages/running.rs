use std::sync::Arc;

use crate::core::{
    domain::{ExecutionResult, Program, ResourceLimit, TestCase},
    errors::HarnessError,
    traits::process::ProcessRunner,
};

#[derive(Clone, Debug)]
pub struct SolutionRunner {
    process: Arc<dyn ProcessRunner>,
    solution: Program,
}

impl SolutionRunner {
    pub fn new(process: Arc<dyn ProcessRunner>, solution: Program) -> Self {
        SolutionRunner { process, solution }
    }

    /// Runs the solution on an already sanitized test under `limits`.
    #[tracing::instrument(skip(self, test), fields(solution = %self.solution))]
    pub async fn run(
        &self,
        test: &TestCase,
        limits: &ResourceLimit,
    ) -> Result<ExecutionResult, HarnessError> {
        let result = self
            .process
            .run(&self.solution, test.as_bytes(), limits)
            .await?;

        if result.timed_out() || result.out_of_memory() || result.output_exceeded() {
            tracing::info!(
                termination = %result.termination,
                wall_time_ms = result.wall_time.as_millis() as u64,
                peak_memory_bytes = result.peak_memory_bytes,
                "solution exceeded its limits"
            );
        }

        Ok(result)
    }
}
