use std::sync::Arc;

use serde::Serialize;

use crate::{
    constants::LIMIT_SEARCH_RATIO,
    core::{
        calibration::{Measurement, SampleRuns, run_samples},
        domain::{LimitType, Program, ResourceLimit, TestCase},
        errors::CalibrationError,
        traits::process::ProcessRunner,
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct SearchedLimits {
    pub limit: ResourceLimit,
    /// Worst usage observed when running every sample under `limit`.
    pub measurement: Measurement,
}

/// Bisects for the tightest limits under which the reference still passes
/// every sample. The time limit is searched first with memory held at the
/// ceiling, then the memory limit with time held at the found value.
#[derive(Clone, Debug)]
pub struct LimitSearch {
    process: Arc<dyn ProcessRunner>,
    ceiling: ResourceLimit,
    parallelism: usize,
}

impl LimitSearch {
    pub fn new(
        process: Arc<dyn ProcessRunner>,
        ceiling: ResourceLimit,
        parallelism: usize,
    ) -> Self {
        LimitSearch {
            process,
            ceiling,
            parallelism,
        }
    }

    #[tracing::instrument(
        skip(self, reference, samples),
        fields(reference = %reference, samples = samples.len())
    )]
    pub async fn search(
        &self,
        reference: &Program,
        samples: &[TestCase],
    ) -> Result<SearchedLimits, CalibrationError> {
        // Under the ceiling itself every sample has to pass, or there is
        // nothing to search for.
        self.evaluate(reference, samples, &self.ceiling)
            .await?
            .into_result()?;

        let time_limit_ms = self
            .bisect(reference, samples, LimitType::Time, self.ceiling.time_limit_ms, |ms| {
                ResourceLimit {
                    time_limit_ms: ms,
                    memory_limit_bytes: self.ceiling.memory_limit_bytes,
                }
            })
            .await?;

        let memory_limit_bytes = self
            .bisect(
                reference,
                samples,
                LimitType::Memory,
                self.ceiling.memory_limit_bytes,
                |bytes| ResourceLimit {
                    time_limit_ms,
                    memory_limit_bytes: bytes,
                },
            )
            .await?;

        let limit = ResourceLimit::new(time_limit_ms, memory_limit_bytes)?;
        let measurement = self
            .evaluate(reference, samples, &limit)
            .await?
            .into_result()?;

        tracing::info!(
            time_limit_ms = limit.time_limit_ms,
            memory_limit_bytes = limit.memory_limit_bytes,
            "found tightest limits"
        );
        Ok(SearchedLimits { limit, measurement })
    }

    /// Narrows `[0, max]` until the interval is within `LIMIT_SEARCH_RATIO`
    /// of its upper end. The upper end always passes.
    async fn bisect(
        &self,
        reference: &Program,
        samples: &[TestCase],
        limit_type: LimitType,
        mut max: u64,
        limits_for: impl Fn(u64) -> ResourceLimit,
    ) -> Result<u64, CalibrationError> {
        let mut min = 0u64;

        while max.saturating_sub(min) as f64 >= LIMIT_SEARCH_RATIO * max as f64 {
            let cur = ((min + max) / 2).max(1);
            let passed = matches!(
                self.evaluate(reference, samples, &limits_for(cur)).await?,
                SampleRuns::Completed(_)
            );
            tracing::debug!(?limit_type, cur, passed, "bisection step");

            if passed {
                max = cur;
            } else {
                min = cur + 1;
            }
            if min >= max {
                break;
            }
        }

        Ok(max)
    }

    async fn evaluate(
        &self,
        reference: &Program,
        samples: &[TestCase],
        limits: &ResourceLimit,
    ) -> Result<SampleRuns, CalibrationError> {
        Ok(run_samples(
            self.process.as_ref(),
            reference,
            samples,
            limits,
            self.parallelism,
        )
        .await?)
    }
}
