use std::fmt;

use serde::Serialize;
use uuid::Uuid;

use crate::core::domain::{ResourceLimit, TestData, TestOutcome};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TestReport {
    pub name: String,
    #[serde(flatten)]
    pub outcome: TestOutcome,
}

/// Outcome counts of a task. The mean score only covers tests that received
/// a score, so rejected tests and checker failures never drag it down.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Summary {
    pub total: usize,
    pub rejected: usize,
    pub runtime_errors: usize,
    pub limits_exceeded: usize,
    pub graded: usize,
    pub checker_failures: usize,
    pub mean_score: Option<f64>,
}

impl Summary {
    pub fn from_outcomes<'a>(outcomes: impl IntoIterator<Item = &'a TestOutcome>) -> Self {
        let mut summary = Summary::default();
        let mut score_sum = 0.0;
        let mut scored = 0usize;

        for outcome in outcomes {
            summary.total += 1;
            match outcome {
                TestOutcome::Rejected { .. } => summary.rejected += 1,
                TestOutcome::RuntimeError { .. } => summary.runtime_errors += 1,
                TestOutcome::LimitsExceeded { .. } => summary.limits_exceeded += 1,
                TestOutcome::Graded { .. } => summary.graded += 1,
                TestOutcome::CheckerFailed { .. } => summary.checker_failures += 1,
            }
            if let Some(score) = outcome.score() {
                score_sum += score;
                scored += 1;
            }
        }

        summary.mean_score = (scored > 0).then(|| score_sum / scored as f64);
        summary
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} tests: {} graded, {} runtime errors, {} over limits, {} rejected, {} checker failures",
            self.total,
            self.graded,
            self.runtime_errors,
            self.limits_exceeded,
            self.rejected,
            self.checker_failures
        )?;
        match self.mean_score {
            Some(mean) => write!(f, "; mean score {mean:.2}"),
            None => write!(f, "; no scored tests"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TaskReport {
    pub task_id: Uuid,
    pub limits: ResourceLimit,
    pub tests: Vec<TestReport>,
    pub summary: Summary,
}

impl TaskReport {
    /// Pairs each test with its outcome, in task order.
    pub fn new(
        task_id: Uuid,
        limits: ResourceLimit,
        tests: &[TestData],
        outcomes: Vec<TestOutcome>,
    ) -> Self {
        let summary = Summary::from_outcomes(&outcomes);
        let tests = tests
            .iter()
            .zip(outcomes)
            .map(|(test, outcome)| TestReport {
                name: test.name.clone(),
                outcome,
            })
            .collect();

        TaskReport {
            task_id,
            limits,
            tests,
            summary,
        }
    }
}
