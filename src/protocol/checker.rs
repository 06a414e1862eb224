use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use crate::{
    core::domain::{Grade, ScoreOutOfRange},
    protocol::ProtocolError,
};

/// The three files a checker is invoked with, read once up front.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckerInput {
    pub solution_output: Vec<u8>,
    pub input: Vec<u8>,
    /// Empty when the task has no reference output.
    pub reference_output: Vec<u8>,
}

impl CheckerInput {
    pub fn from_env() -> Result<Self, ProtocolError> {
        Self::from_args(std::env::args_os().skip(1))
    }

    pub fn from_args<I>(args: I) -> Result<Self, ProtocolError>
    where
        I: IntoIterator,
        I::Item: Into<OsString>,
    {
        let paths: Vec<PathBuf> = args.into_iter().map(|a| PathBuf::from(a.into())).collect();
        let [solution_output, input, reference_output] = paths.as_slice() else {
            return Err(ProtocolError::WrongArgumentCount { got: paths.len() });
        };

        Ok(CheckerInput {
            solution_output: read(solution_output)?,
            input: read(input)?,
            reference_output: read(reference_output)?,
        })
    }

    pub fn solution_answer(&self) -> String {
        trimmed(&self.solution_output)
    }

    pub fn input_text(&self) -> String {
        trimmed(&self.input)
    }

    pub fn reference_answer(&self) -> Option<String> {
        Some(trimmed(&self.reference_output)).filter(|answer| !answer.is_empty())
    }
}

fn read(path: &Path) -> Result<Vec<u8>, ProtocolError> {
    std::fs::read(path).map_err(|source| ProtocolError::Unreadable {
        path: path.to_path_buf(),
        source,
    })
}

fn trimmed(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}

/// What a checker prints: the score line, then the diagnostics, if any.
#[derive(Clone, Debug, PartialEq)]
pub struct CheckerVerdict(Grade);

impl CheckerVerdict {
    pub fn accept() -> Self {
        CheckerVerdict(Grade::full(""))
    }

    pub fn reject(message: impl Into<String>) -> Self {
        CheckerVerdict(Grade::zero(message))
    }

    pub fn partial(score: f64, message: impl Into<String>) -> Result<Self, ScoreOutOfRange> {
        Ok(CheckerVerdict(Grade::new(score, message)?))
    }

    pub fn grade(&self) -> &Grade {
        &self.0
    }

    /// Prints the verdict and yields exit code 0: checking succeeded,
    /// whatever the score.
    pub fn emit(&self) -> ExitCode {
        print!("{self}");
        ExitCode::SUCCESS
    }
}

impl fmt::Display for CheckerVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.0.score())?;
        if !self.0.message().is_empty() {
            writeln!(f, "{}", self.0.message())?;
        }
        Ok(())
    }
}
