use crate::core::domain::{ExecutionResult, Program, ResourceLimit};

/// Starting or awaiting a process failed. The program never ran, so there is
/// nothing to grade.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to launch `{program}`: {msg}")]
    FailedToLaunch { program: String, msg: String },
    #[error("failed to wait for `{program}`: {msg}")]
    FailedToWait { program: String, msg: String },
}

/// Runs a program to completion with `stdin` as its standard input, enforcing
/// `limits` on it and every process it starts.
#[mockall::automock]
#[async_trait::async_trait]
pub trait ProcessRunner: std::fmt::Debug + Send + Sync {
    async fn run(
        &self,
        program: &Program,
        stdin: &[u8],
        limits: &ResourceLimit,
    ) -> Result<ExecutionResult, SpawnError>;
}
