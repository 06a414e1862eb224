//! Deriving resource limits from a reference program.
//!
//! `multiplier` measures the reference on every sample and scales the worst
//! case by a safety multiplier. `search` bisects for the tightest limits under
//! which every sample still completes.

pub mod multiplier;
pub mod search;

use std::time::Duration;

use futures::StreamExt;

use crate::core::{
    domain::{Program, ResourceLimit, TestCase, Termination},
    errors::{CalibrationError, HarnessError},
    traits::process::ProcessRunner,
};

/// The worst resource usage observed across all samples.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct Measurement {
    #[serde(rename = "max_wall_time_ms", serialize_with = "serialize_millis")]
    pub max_wall_time: Duration,
    pub max_peak_memory_bytes: u64,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

enum SampleRuns {
    Completed(Measurement),
    Failed {
        sample: usize,
        termination: Termination,
    },
}

impl SampleRuns {
    fn into_result(self) -> Result<Measurement, CalibrationError> {
        match self {
            SampleRuns::Completed(measurement) => Ok(measurement),
            SampleRuns::Failed {
                sample,
                termination,
            } => Err(CalibrationError::from_failed_sample(sample, termination)),
        }
    }
}

/// Runs `reference` on every sample under `limits`, at most `parallelism`
/// at a time, and stops at the first sample that does not exit with code 0.
async fn run_samples(
    process: &dyn ProcessRunner,
    reference: &Program,
    samples: &[TestCase],
    limits: &ResourceLimit,
    parallelism: usize,
) -> Result<SampleRuns, HarnessError> {
    if samples.is_empty() {
        return Err(HarnessError::NoSamples);
    }

    let mut runs = futures::stream::iter(samples.iter().enumerate())
        .map(|(idx, sample)| async move {
            (idx, process.run(reference, sample.as_bytes(), limits).await)
        })
        .buffer_unordered(parallelism.max(1));

    let mut measurement = Measurement::default();
    while let Some((sample, result)) = runs.next().await {
        let result = result?;
        if !result.termination.is_success() {
            return Ok(SampleRuns::Failed {
                sample,
                termination: result.termination,
            });
        }
        tracing::debug!(
            sample,
            wall_time_ms = result.wall_time.as_millis() as u64,
            peak_memory_bytes = result.peak_memory_bytes,
            "sample measured"
        );
        measurement.max_wall_time = measurement.max_wall_time.max(result.wall_time);
        measurement.max_peak_memory_bytes =
            measurement.max_peak_memory_bytes.max(result.peak_memory_bytes);
    }

    Ok(SampleRuns::Completed(measurement))
}
