use std::sync::Arc;

use crate::{
    constants::{MEMORY_GRANULARITY_BYTES, TIME_GRANULARITY_MS},
    core::{
        calibration::{Measurement, run_samples},
        domain::{Program, ResourceLimit, TestCase},
        errors::{CalibrationError, HarnessError},
        traits::process::ProcessRunner,
    },
};

/// Absorbs floating point noise so that an exact product such as
/// `400 ms * 1.5` is not rounded up by a whole granule.
const ROUNDING_SLACK: f64 = 1e-6;

#[derive(Clone, Debug)]
pub struct Calibrator {
    process: Arc<dyn ProcessRunner>,
    ceiling: ResourceLimit,
    parallelism: usize,
}

impl Calibrator {
    /// `ceiling` is the provisional limit the reference runs under while it is
    /// being measured.
    pub fn new(
        process: Arc<dyn ProcessRunner>,
        ceiling: ResourceLimit,
        parallelism: usize,
    ) -> Self {
        Calibrator {
            process,
            ceiling,
            parallelism,
        }
    }

    #[tracing::instrument(
        skip(self, reference, samples),
        fields(reference = %reference, samples = samples.len())
    )]
    pub async fn calibrate(
        &self,
        reference: &Program,
        samples: &[TestCase],
        safety_multiplier: f64,
    ) -> Result<ResourceLimit, CalibrationError> {
        validate_multiplier(safety_multiplier)?;

        let measurement = self.measure(reference, samples).await?;
        let limit = derive_limit(&measurement, safety_multiplier)?;

        tracing::info!(
            max_wall_time_ms = measurement.max_wall_time.as_millis() as u64,
            max_peak_memory_bytes = measurement.max_peak_memory_bytes,
            time_limit_ms = limit.time_limit_ms,
            memory_limit_bytes = limit.memory_limit_bytes,
            "calibrated limits"
        );
        Ok(limit)
    }

    /// Runs the reference on every sample and keeps the worst wall time and
    /// the worst peak memory. Any sample that does not exit with code 0 fails
    /// the calibration.
    pub async fn measure(
        &self,
        reference: &Program,
        samples: &[TestCase],
    ) -> Result<Measurement, CalibrationError> {
        let runs = run_samples(
            self.process.as_ref(),
            reference,
            samples,
            &self.ceiling,
            self.parallelism,
        )
        .await?;

        runs.into_result()
    }
}

pub fn validate_multiplier(safety_multiplier: f64) -> Result<(), HarnessError> {
    if safety_multiplier.is_finite() && safety_multiplier > 1.0 {
        Ok(())
    } else {
        Err(HarnessError::InvalidSafetyMultiplier(safety_multiplier))
    }
}

/// Scales the measurement by `safety_multiplier` and rounds each limit up to
/// 100 ms and 1 MiB respectively.
pub fn derive_limit(
    measurement: &Measurement,
    safety_multiplier: f64,
) -> Result<ResourceLimit, HarnessError> {
    validate_multiplier(safety_multiplier)?;

    let time_limit_us = scale_up(
        measurement.max_wall_time.as_micros() as u64,
        safety_multiplier,
        TIME_GRANULARITY_MS * 1000,
    );
    let memory_limit_bytes = scale_up(
        measurement.max_peak_memory_bytes,
        safety_multiplier,
        MEMORY_GRANULARITY_BYTES,
    );

    ResourceLimit::new(time_limit_us / 1000, memory_limit_bytes)
}

/// Rounds `measured * multiplier` up to whole granules. The result is always
/// strictly greater than `measured`.
fn scale_up(measured: u64, multiplier: f64, granularity: u64) -> u64 {
    let granules = (measured as f64 * multiplier / granularity as f64 - ROUNDING_SLACK)
        .ceil()
        .max(1.0) as u64;
    let limit = granules.saturating_mul(granularity);
    if limit > measured {
        limit
    } else {
        (measured / granularity + 1).saturating_mul(granularity)
    }
}
