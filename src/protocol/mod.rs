//! Program-side halves of the sanitizer and checker protocols, for task
//! authors writing those programs in Rust.
//!
//! A sanitizer reads the test from standard input, exits 0 when it is valid
//! and 1 with a one-line reason on standard output otherwise. A checker gets
//! the solution output, the test input and the reference output as three
//! paths, prints a score in `[0, 100]` on the first line of standard output
//! and exits 0; it exits 1 only when checking itself failed.

pub mod checker;
pub mod sanitizer;

use std::path::PathBuf;
use std::process::ExitCode;

/// The program could not even look at its inputs.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid number of arguments, expected 3, got {got}")]
    WrongArgumentCount { got: usize },

    #[error("cannot read {}: {source}", .path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot read standard input: {0}")]
    Stdin(#[source] std::io::Error),
}

impl ProtocolError {
    /// Reports the error on standard output and yields exit code 1.
    pub fn exit(&self) -> ExitCode {
        println!("Error: {self}.");
        ExitCode::from(1)
    }
}
