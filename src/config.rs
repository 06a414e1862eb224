use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tokio::fs;

use crate::{
    constants::{
        DEFAULT_MEMORY_POLL_INTERVAL_MS, DEFAULT_SAFETY_MULTIPLIER, DEFAULT_STDERR_CAPTURE_BYTES,
        DEFAULT_STDOUT_CAPTURE_BYTES, PROVISIONAL_MEMORY_LIMIT_BYTES, PROVISIONAL_TIME_LIMIT_MS,
        TOOL_MEMORY_LIMIT_BYTES, TOOL_TIME_LIMIT_MS,
    },
    core::{
        domain::{Program, ResourceLimit, TestCase, TestData},
        errors::HarnessError,
    },
};

const INPUT_EXTENSION: &str = "in";
const EXPECTED_EXTENSION: &str = "out";

/// A task file.
///
/// Relative paths are resolved against the directory holding the task file.
/// Either `limits` or `reference` must be given; with only a reference the
/// limits are calibrated before grading.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskConfig {
    #[serde(default)]
    pub sanitizer: Option<Program>,
    pub solution: Program,
    pub checker: Program,
    #[serde(default)]
    pub reference: Option<Program>,
    #[serde(default)]
    pub tests: Vec<TestSource>,
    /// Every `*.in` file of this directory is a test; a sibling `*.out` file
    /// is its reference output.
    #[serde(default)]
    pub tests_dir: Option<PathBuf>,
    #[serde(default)]
    pub limits: Option<ResourceLimit>,
    #[serde(default)]
    pub calibration: CalibrationSettings,
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default = "default_sanitize")]
    pub sanitize: bool,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestSource {
    #[serde(default)]
    pub name: Option<String>,
    pub input: PathBuf,
    #[serde(default)]
    pub expected: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CalibrationSettings {
    #[serde(default = "default_safety_multiplier")]
    pub safety_multiplier: f64,
    /// Sample inputs for the reference. When empty, the task's own tests
    /// that pass the sanitizer are used.
    #[serde(default)]
    pub samples: Vec<PathBuf>,
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        CalibrationSettings {
            safety_multiplier: default_safety_multiplier(),
            samples: Vec::new(),
            parallelism: default_parallelism(),
        }
    }
}

pub(crate) fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_sanitize() -> bool {
    true
}

fn default_safety_multiplier() -> f64 {
    DEFAULT_SAFETY_MULTIPLIER
}

impl TaskConfig {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, HarnessError> {
        let path = path.as_ref();
        let raw = fs::read(path)
            .await
            .map_err(HarnessError::io("failed to read task file", path))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_json(&raw, base)
    }

    pub fn from_json(raw: &[u8], base: &Path) -> Result<Self, HarnessError> {
        let mut config: TaskConfig =
            serde_json::from_slice(raw).map_err(|e| HarnessError::InvalidConfig {
                msg: e.to_string(),
            })?;
        config.resolve_paths(base);
        config.validate()?;
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let programs = [
            self.sanitizer.as_mut(),
            Some(&mut self.solution),
            Some(&mut self.checker),
            self.reference.as_mut(),
        ];
        for program in programs.into_iter().flatten() {
            resolve(&mut program.path, base);
        }
        for test in &mut self.tests {
            resolve(&mut test.input, base);
            if let Some(expected) = &mut test.expected {
                resolve(expected, base);
            }
        }
        if let Some(dir) = &mut self.tests_dir {
            resolve(dir, base);
        }
        for sample in &mut self.calibration.samples {
            resolve(sample, base);
        }
    }

    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.parallelism == 0 || self.calibration.parallelism == 0 {
            return Err(HarnessError::InvalidConfig {
                msg: "parallelism must be at least 1".to_string(),
            });
        }
        if let Some(limits) = &self.limits {
            limits.validate()?;
        }
        if self.limits.is_none() && self.reference.is_none() {
            return Err(HarnessError::InvalidConfig {
                msg: "either `limits` or a `reference` program to calibrate them is required"
                    .to_string(),
            });
        }
        if self.tests.is_empty() && self.tests_dir.is_none() {
            return Err(HarnessError::InvalidConfig {
                msg: "task has no tests".to_string(),
            });
        }
        Ok(())
    }

    /// Reads the listed tests first, then the tests directory in file name
    /// order.
    pub async fn load_tests(&self) -> Result<Vec<TestData>, HarnessError> {
        let mut tests = Vec::with_capacity(self.tests.len());

        for source in &self.tests {
            let name = match &source.name {
                Some(name) => name.clone(),
                None => file_stem(&source.input),
            };
            let expected_output = match &source.expected {
                Some(path) => Some(read_file(path, "failed to read expected output").await?),
                None => None,
            };
            tests.push(TestData {
                name,
                input: TestCase::new(read_file(&source.input, "failed to read test input").await?),
                expected_output,
                sanitization: None,
            });
        }

        if let Some(dir) = &self.tests_dir {
            tests.extend(load_tests_dir(dir).await?);
        }

        Ok(tests)
    }

    /// Sample inputs listed for calibration, or `None` when the task's tests
    /// should be used instead.
    pub async fn load_samples(&self) -> Result<Option<Vec<TestCase>>, HarnessError> {
        if self.calibration.samples.is_empty() {
            return Ok(None);
        }
        let mut samples = Vec::with_capacity(self.calibration.samples.len());
        for path in &self.calibration.samples {
            samples.push(TestCase::new(
                read_file(path, "failed to read calibration sample").await?,
            ));
        }
        Ok(Some(samples))
    }
}

async fn load_tests_dir(dir: &Path) -> Result<Vec<TestData>, HarnessError> {
    let mut entries = fs::read_dir(dir)
        .await
        .map_err(HarnessError::io("failed to list tests directory", dir))?;

    let mut inputs = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(HarnessError::io("failed to list tests directory", dir))?
    {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == INPUT_EXTENSION) {
            inputs.push(path);
        }
    }
    inputs.sort();

    let mut tests = Vec::with_capacity(inputs.len());
    for input in inputs {
        let expected = input.with_extension(EXPECTED_EXTENSION);
        let expected_output = if fs::try_exists(&expected).await.unwrap_or(false) {
            Some(read_file(&expected, "failed to read expected output").await?)
        } else {
            None
        };
        tests.push(TestData {
            name: file_stem(&input),
            input: TestCase::new(read_file(&input, "failed to read test input").await?),
            expected_output,
            sanitization: None,
        });
    }
    Ok(tests)
}

pub(crate) async fn read_file(
    path: &Path,
    context: &'static str,
) -> Result<Vec<u8>, HarnessError> {
    fs::read(path).await.map_err(HarnessError::io(context, path))
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .unwrap_or(path.as_os_str())
        .to_string_lossy()
        .into_owned()
}

fn resolve(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

/// Harness-wide settings that do not belong to any task.
#[derive(Clone, Debug, PartialEq)]
pub struct HarnessSettings {
    /// Scratch space for checker inputs.
    pub work_dir: PathBuf,
    /// Limits for reference runs while the real limits are unknown.
    pub provisional_ceiling: ResourceLimit,
    /// Limits for sanitizer and checker runs.
    pub tool_ceiling: ResourceLimit,
    /// Stdout beyond this kills the program.
    pub stdout_capture_bytes: usize,
    pub stderr_capture_bytes: usize,
    pub memory_poll_interval: Duration,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        HarnessSettings {
            work_dir: std::env::temp_dir().join("taskgrader"),
            provisional_ceiling: ResourceLimit {
                time_limit_ms: PROVISIONAL_TIME_LIMIT_MS,
                memory_limit_bytes: PROVISIONAL_MEMORY_LIMIT_BYTES,
            },
            tool_ceiling: ResourceLimit {
                time_limit_ms: TOOL_TIME_LIMIT_MS,
                memory_limit_bytes: TOOL_MEMORY_LIMIT_BYTES,
            },
            stdout_capture_bytes: DEFAULT_STDOUT_CAPTURE_BYTES,
            stderr_capture_bytes: DEFAULT_STDERR_CAPTURE_BYTES,
            memory_poll_interval: Duration::from_millis(DEFAULT_MEMORY_POLL_INTERVAL_MS),
        }
    }
}
