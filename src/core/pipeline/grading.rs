use futures::stream::FuturesUnordered;
use std::sync::Arc;
use tokio_stream::StreamExt;

use tokio::sync::mpsc::{Receiver, Sender};

use crate::{
    constants::TASK_TX_ERR,
    core::{
        domain::{
            Grade, LimitType, ResourceLimit, SanitizerVerdict, Task, TaskState, TestData,
            TestOutcome, TestResources, TestState, Termination,
        },
        errors::{CheckerError, HarnessError},
        stages::{checking::CheckerRunner, running::SolutionRunner, sanitizing::SanitizerRunner},
    },
};

/// The three stages of a task, wired together.
#[derive(Debug)]
pub struct TaskPipeline {
    sanitizer: Option<SanitizerRunner>,
    solution: SolutionRunner,
    checker: CheckerRunner,
    parallelism: usize,
}

impl TaskPipeline {
    /// Without a sanitizer every test is taken as valid.
    pub fn new(
        sanitizer: Option<SanitizerRunner>,
        solution: SolutionRunner,
        checker: CheckerRunner,
        parallelism: usize,
    ) -> Self {
        TaskPipeline {
            sanitizer,
            solution,
            checker,
            parallelism: parallelism.max(1),
        }
    }

    /// Sanitize, execute, check. A stage only runs when the previous one let
    /// the test through. A verdict already attached to the test is not asked
    /// for again.
    #[tracing::instrument(skip(self, test, limits), fields(test = %test.name))]
    pub async fn grade_test(
        &self,
        test: &TestData,
        limits: &ResourceLimit,
    ) -> Result<TestOutcome, HarnessError> {
        let sanitization = match (&test.sanitization, &self.sanitizer) {
            (Some(known), _) => Some(known.clone()),
            (None, Some(sanitizer)) => Some(sanitizer.verify(&test.input).await?),
            (None, None) => None,
        };
        if let Some(sanitization) = sanitization {
            if sanitization.verdict == SanitizerVerdict::Invalid {
                return Ok(TestOutcome::Rejected {
                    diagnostic: sanitization.diagnostic,
                });
            }
        }

        let result = self.solution.run(&test.input, limits).await?;
        let resources = TestResources::from(&result);

        match result.termination {
            Termination::Exited { code: 0 } => {}
            Termination::TimedOut => {
                return Ok(TestOutcome::LimitsExceeded {
                    limit_type: LimitType::Time,
                    grade: Grade::zero(format!(
                        "time limit of {} ms exceeded",
                        limits.time_limit_ms
                    )),
                    resources,
                });
            }
            Termination::OutOfMemory => {
                return Ok(TestOutcome::LimitsExceeded {
                    limit_type: LimitType::Memory,
                    grade: Grade::zero(format!(
                        "memory limit of {} bytes exceeded",
                        limits.memory_limit_bytes
                    )),
                    resources,
                });
            }
            Termination::OutputLimitExceeded => {
                return Ok(TestOutcome::LimitsExceeded {
                    limit_type: LimitType::Output,
                    grade: Grade::zero("output size limit exceeded"),
                    resources,
                });
            }
            termination => {
                return Ok(TestOutcome::RuntimeError {
                    termination,
                    grade: Grade::zero(format!("solution {termination}")),
                    resources,
                });
            }
        }

        let grading = self
            .checker
            .grade(
                &result.stdout,
                test.input.as_bytes(),
                test.expected_output.as_deref(),
            )
            .await;

        match grading {
            Ok(grade) => Ok(TestOutcome::Graded { grade, resources }),
            Err(CheckerError::Harness(e)) => Err(e),
            Err(e) => {
                tracing::error!("Checker failed on test {}: {}", test.name, e);
                Ok(TestOutcome::CheckerFailed {
                    message: e.to_string(),
                    resources,
                })
            }
        }
    }
}

#[tracing::instrument(skip_all)]
pub fn handle_grading(
    res_tx: Sender<Task>,
    mut grade_rx: Receiver<Task>,
    pipeline: Arc<TaskPipeline>,
) {
    tokio::spawn(async move {
        while let Some(task) = grade_rx.recv().await {
            process_task(task, &res_tx, &pipeline).await;
        }
    });
}

/// Grades every test of a pending task and streams each state change.
async fn process_task(task: Task, res_tx: &Sender<Task>, pipeline: &TaskPipeline) {
    tracing::debug!("Grading task {} with {} tests", task.id, task.tests.len());

    let TaskState::Pending = task.state else {
        tracing::error!("Task {} is not pending", task.id);
        return;
    };

    let mut tests = vec![TestState::Pending; task.tests.len()];
    let task = task.change_state(TaskState::Grading {
        tests: tests.clone(),
    });
    res_tx.send(task.clone()).await.expect(TASK_TX_ERR);

    let task = match grade_tests_concurrently(&task, &mut tests, res_tx, pipeline).await {
        Ok(outcomes) => task.change_state(TaskState::Done { outcomes }),
        Err(e) => {
            tracing::error!("Grading of task {} aborted: {}", task.id, e);
            task.change_state(TaskState::Failed { msg: e.to_string() })
        }
    };
    tracing::info!("Task {} finished", task.id);
    res_tx.send(task).await.expect(TASK_TX_ERR);
}

/// Keeps at most `pipeline.parallelism` tests in flight. The first harness
/// error stops the task; dropping the remaining futures kills their
/// processes.
async fn grade_tests_concurrently(
    task: &Task,
    tests: &mut [TestState],
    res_tx: &Sender<Task>,
    pipeline: &TaskPipeline,
) -> Result<Vec<TestOutcome>, HarnessError> {
    let grade = move |test_idx: usize| {
        let test = &task.tests[test_idx];
        async move { (test_idx, pipeline.grade_test(test, &task.limits).await) }
    };

    let mut futures = FuturesUnordered::new();
    let mut next = 0;

    loop {
        while next < task.tests.len() && futures.len() < pipeline.parallelism {
            futures.push(grade(next));
            tests[next] = TestState::Running;
            send_progress(task, tests, res_tx).await;
            next += 1;
        }

        let Some((test_idx, outcome)) = futures.next().await else {
            break;
        };
        tests[test_idx] = TestState::Finished(outcome?);
        send_progress(task, tests, res_tx).await;
    }

    Ok(tests
        .iter()
        .filter_map(|state| match state {
            TestState::Finished(outcome) => Some(outcome.clone()),
            _ => None,
        })
        .collect())
}

async fn send_progress(task: &Task, tests: &[TestState], res_tx: &Sender<Task>) {
    let task = task.change_state(TaskState::Grading {
        tests: tests.to_vec(),
    });
    res_tx.send(task).await.expect(TASK_TX_ERR);
}
