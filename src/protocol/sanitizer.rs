use std::fmt;
use std::io::Read;
use std::process::ExitCode;

use crate::protocol::ProtocolError;

/// A test input as seen by a sanitizer. Standard input is read once, when
/// the value is built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SanitizerInput {
    text: String,
}

impl SanitizerInput {
    pub fn from_stdin() -> Result<Self, ProtocolError> {
        let mut raw = Vec::new();
        std::io::stdin()
            .read_to_end(&mut raw)
            .map_err(ProtocolError::Stdin)?;
        Ok(Self::from_bytes(&raw))
    }

    pub fn from_bytes(raw: &[u8]) -> Self {
        SanitizerInput {
            text: String::from_utf8_lossy(raw).into_owned(),
        }
    }

    pub fn elements(&self) -> Vec<&str> {
        self.text.split_whitespace().collect()
    }

    /// Every whitespace separated element, as an integer.
    pub fn integers(&self) -> Result<Vec<i64>, Rejection> {
        self.elements()
            .into_iter()
            .enumerate()
            .map(|(idx, element)| {
                element.parse().map_err(|_| {
                    Rejection::new(format!("element #{idx}, `{element}`, is not a number"))
                })
            })
            .collect()
    }

    /// Exactly `count` integers.
    pub fn expect_integers(&self, count: usize) -> Result<Vec<i64>, Rejection> {
        let got = self.elements().len();
        if got != count {
            return Err(Rejection::new(format!(
                "expected {count} elements, got {got} instead"
            )));
        }
        self.integers()
    }
}

/// Why a test case is invalid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rejection {
    reason: String,
}

impl Rejection {
    pub fn new(reason: impl Into<String>) -> Self {
        Rejection {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Prints the rejection and yields exit code 1.
    pub fn exit(&self) -> ExitCode {
        println!("{self}");
        ExitCode::from(1)
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Test case invalid: {}.", self.reason)
    }
}
