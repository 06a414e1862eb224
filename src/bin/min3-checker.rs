//! Grades answers to "print the minimum of three integers". The expected
//! answer is computed from the test input; the reference output is unused.

use std::process::ExitCode;

use taskgrader::protocol::{
    checker::{CheckerInput, CheckerVerdict},
    sanitizer::SanitizerInput,
};

fn main() -> ExitCode {
    let input = match CheckerInput::from_env() {
        Ok(input) => input,
        Err(e) => return e.exit(),
    };

    let expected = match SanitizerInput::from_bytes(&input.input).expect_integers(3) {
        Ok(numbers) => numbers[0].min(numbers[1]).min(numbers[2]),
        Err(rejection) => {
            println!("Error: {rejection}");
            return ExitCode::from(1);
        }
    };

    let answer = input.solution_answer();
    let verdict = if answer == expected.to_string() {
        CheckerVerdict::accept()
    } else {
        CheckerVerdict::reject(format!(
            "Invalid answer: solution answered `{answer}`, expected answer was `{expected}`."
        ))
    };
    verdict.emit()
}
