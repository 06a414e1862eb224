//! Accepts a test case made of exactly three integers.

use std::process::ExitCode;

use taskgrader::protocol::sanitizer::SanitizerInput;

fn main() -> ExitCode {
    let input = match SanitizerInput::from_stdin() {
        Ok(input) => input,
        Err(e) => return e.exit(),
    };

    match input.expect_integers(3) {
        Ok(_) => ExitCode::SUCCESS,
        Err(rejection) => rejection.exit(),
    }
}
