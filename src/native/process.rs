use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::constants::{
    DEFAULT_MEMORY_POLL_INTERVAL_MS, DEFAULT_STDERR_CAPTURE_BYTES, DEFAULT_STDOUT_CAPTURE_BYTES,
};
use crate::core::domain::{ExecutionResult, Program, ResourceLimit, Termination};
use crate::core::traits::process::{ProcessRunner, SpawnError};

/// Runs programs as plain child processes.
///
/// Every run gets its own process group so that the whole tree can be killed
/// on timeout, on memory exhaustion, and after the leader exits. Wall time is
/// enforced by the harness; `RLIMIT_CPU` only backstops programs that burn CPU
/// on several threads at once. Peak memory is the leader's `VmHWM`, sampled
/// while it runs. A program that writes more than the stdout ceiling is killed.
#[derive(Clone, Debug)]
pub struct NativeProcessRunner {
    memory_poll_interval: Duration,
    stdout_capture_bytes: usize,
    stderr_capture_bytes: usize,
}

impl NativeProcessRunner {
    pub fn new(
        memory_poll_interval: Duration,
        stdout_capture_bytes: usize,
        stderr_capture_bytes: usize,
    ) -> Self {
        NativeProcessRunner {
            memory_poll_interval,
            stdout_capture_bytes,
            stderr_capture_bytes,
        }
    }
}

impl Default for NativeProcessRunner {
    fn default() -> Self {
        NativeProcessRunner::new(
            Duration::from_millis(DEFAULT_MEMORY_POLL_INTERVAL_MS),
            DEFAULT_STDOUT_CAPTURE_BYTES,
            DEFAULT_STDERR_CAPTURE_BYTES,
        )
    }
}

#[async_trait::async_trait]
impl ProcessRunner for NativeProcessRunner {
    #[tracing::instrument(skip(self, program, stdin), fields(program = %program))]
    async fn run(
        &self,
        program: &Program,
        stdin: &[u8],
        limits: &ResourceLimit,
    ) -> Result<ExecutionResult, SpawnError> {
        let wait_err = |msg: String| SpawnError::FailedToWait {
            program: program.to_string(),
            msg,
        };

        let cpu_seconds = cpu_backstop_seconds(limits);
        let mut cmd = Command::new(&program.path);
        cmd.args(&program.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // SAFETY: the closure only issues async-signal-safe syscalls.
        unsafe {
            cmd.pre_exec(move || isolate_child(cpu_seconds));
        }

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|e| SpawnError::FailedToLaunch {
            program: program.to_string(),
            msg: e.to_string(),
        })?;
        let Some(pid) = child.id() else {
            return Err(wait_err("process id is unavailable".to_string()));
        };
        let pid = pid as libc::pid_t;
        let mut group = GroupGuard { pgid: pid, armed: true };

        let stdin_writer = child
            .stdin
            .take()
            .map(|handle| tokio::spawn(feed_stdin(handle, stdin.to_vec())));
        let stdout_cap = Ceiling::KillGroup {
            bytes: self.stdout_capture_bytes,
            pgid: pid,
        };
        let stdout_reader = child.stdout.take().map(|out| tokio::spawn(capture(out, stdout_cap)));
        let stderr_cap = Ceiling::Truncate {
            bytes: self.stderr_capture_bytes,
        };
        let stderr_reader = child.stderr.take().map(|err| tokio::spawn(capture(err, stderr_cap)));

        let mut exited = tokio::task::spawn_blocking(move || wait_for_exit(pid));
        let deadline = tokio::time::sleep(limits.time_limit());
        tokio::pin!(deadline);
        let mut poll = tokio::time::interval(self.memory_poll_interval);
        let mut peak_memory_bytes = 0u64;
        let mut forced: Option<Termination> = None;

        let exit = loop {
            tokio::select! {
                exit = &mut exited => break exit,
                _ = &mut deadline, if forced.is_none() => {
                    tracing::debug!(pid, "deadline reached, killing process group");
                    kill_group(pid);
                    forced = Some(Termination::TimedOut);
                }
                _ = poll.tick(), if forced.is_none() => {
                    if let Some(hwm) = memory_high_water_bytes(pid).await {
                        peak_memory_bytes = peak_memory_bytes.max(hwm);
                        if hwm > limits.memory_limit_bytes {
                            tracing::debug!(pid, hwm, "memory ceiling exceeded, killing group");
                            kill_group(pid);
                            forced = Some(Termination::OutOfMemory);
                        }
                    }
                }
            }
        };
        exit.map_err(|e| wait_err(e.to_string()))?
            .map_err(|e| wait_err(e.to_string()))?;
        let wall_time = start.elapsed();

        // The leader is still a zombie here, so its group id cannot have been reused.
        kill_group(pid);
        let cpu_time = zombie_cpu_time(pid).await.unwrap_or_default();
        let status = child.wait().await.map_err(|e| wait_err(e.to_string()))?;
        group.armed = false;

        if let Some(writer) = stdin_writer {
            let _ = writer.await;
        }
        let (stdout, stdout_overflowed) = join_capture(stdout_reader).await.map_err(wait_err)?;
        let (stderr, stderr_truncated) = join_capture(stderr_reader).await.map_err(wait_err)?;

        let forced = forced.or(stdout_overflowed.then_some(Termination::OutputLimitExceeded));
        let termination = classify(
            status.into_raw(),
            forced,
            wall_time,
            cpu_time,
            peak_memory_bytes,
            limits,
        );
        tracing::debug!(%termination, ?wall_time, peak_memory_bytes, "process finished");

        Ok(ExecutionResult {
            stdout,
            stderr,
            stderr_truncated,
            termination,
            wall_time,
            cpu_time,
            peak_memory_bytes,
        })
    }
}

/// Kills the process group if a run is abandoned before its leader is reaped.
struct GroupGuard {
    pgid: libc::pid_t,
    armed: bool,
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if self.armed {
            kill_group(self.pgid);
        }
    }
}

fn kill_group(pgid: libc::pid_t) {
    // ESRCH only means the group is already gone.
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

fn cpu_backstop_seconds(limits: &ResourceLimit) -> u64 {
    limits.time_limit_ms.div_ceil(1000) + 1
}

fn isolate_child(cpu_seconds: u64) -> io::Result<()> {
    unsafe {
        if libc::setpgid(0, 0) == -1 {
            return Err(io::Error::last_os_error());
        }

        let mut current = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::getrlimit(libc::RLIMIT_CPU, &mut current) != 0 {
            return Err(io::Error::last_os_error());
        }
        let soft = (cpu_seconds as libc::rlim_t).min(current.rlim_max);
        let cpu = libc::rlimit {
            rlim_cur: soft,
            rlim_max: soft.saturating_add(1).min(current.rlim_max),
        };
        if libc::setrlimit(libc::RLIMIT_CPU, &cpu) != 0 {
            return Err(io::Error::last_os_error());
        }

        let core = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::setrlimit(libc::RLIMIT_CORE, &core) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

async fn feed_stdin(mut handle: ChildStdin, input: Vec<u8>) {
    if let Err(e) = handle.write_all(&input).await {
        // Programs are free to exit without reading their input.
        if e.kind() != io::ErrorKind::BrokenPipe {
            tracing::debug!("failed to write stdin: {}", e);
        }
    }
    drop(handle);
}

/// What happens once a stream outgrows its capture buffer.
#[derive(Clone, Copy, Debug)]
enum Ceiling {
    /// Keep the first `bytes` and drain the rest.
    Truncate { bytes: usize },
    /// Stop reading and kill the process group.
    KillGroup { bytes: usize, pgid: libc::pid_t },
}

impl Ceiling {
    fn bytes(&self) -> usize {
        match *self {
            Ceiling::Truncate { bytes } | Ceiling::KillGroup { bytes, .. } => bytes,
        }
    }
}

/// Reads a stream to its end. The flag is set when the ceiling was hit.
async fn capture<R>(mut reader: R, ceiling: Ceiling) -> io::Result<(Vec<u8>, bool)>
where
    R: AsyncRead + Unpin,
{
    let mut captured = Vec::new();
    let mut overflowed = false;
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        if captured.len() + n <= ceiling.bytes() {
            captured.extend_from_slice(&buf[..n]);
            continue;
        }
        let room = ceiling.bytes().saturating_sub(captured.len());
        captured.extend_from_slice(&buf[..room]);
        overflowed = true;
        if let Ceiling::KillGroup { pgid, .. } = ceiling {
            tracing::debug!(pgid, "output ceiling exceeded, killing process group");
            kill_group(pgid);
            break;
        }
    }
    Ok((captured, overflowed))
}

async fn join_capture(
    reader: Option<JoinHandle<io::Result<(Vec<u8>, bool)>>>,
) -> Result<(Vec<u8>, bool), String> {
    match reader {
        Some(reader) => reader
            .await
            .map_err(|e| e.to_string())?
            .map_err(|e| e.to_string()),
        None => Ok((Vec::new(), false)),
    }
}

/// Blocks until `pid` exits without reaping it.
fn wait_for_exit(pid: libc::pid_t) -> io::Result<()> {
    loop {
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// CPU time of an exited but unreaped process, including the descendants it
/// waited for.
#[cfg(target_os = "linux")]
async fn zombie_cpu_time(pid: libc::pid_t) -> Option<Duration> {
    let stat = tokio::fs::read_to_string(format!("/proc/{pid}/stat"))
        .await
        .ok()?;
    let ticks = parse_cpu_ticks(&stat)?;
    let per_second = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if per_second <= 0 {
        return None;
    }
    Some(Duration::from_secs_f64(ticks as f64 / per_second as f64))
}

#[cfg(not(target_os = "linux"))]
async fn zombie_cpu_time(_pid: libc::pid_t) -> Option<Duration> {
    None
}

/// Sums `utime`, `stime`, `cutime` and `cstime` from a `/proc/<pid>/stat` line.
fn parse_cpu_ticks(stat: &str) -> Option<u64> {
    // The command name may contain spaces and parentheses.
    let (_, fields) = stat.rsplit_once(')')?;
    let ticks = fields
        .split_whitespace()
        .skip(11)
        .take(4)
        .map(|field| field.parse::<u64>().ok())
        .collect::<Option<Vec<_>>>()?;
    (ticks.len() == 4).then(|| ticks.iter().sum())
}

#[cfg(target_os = "linux")]
async fn memory_high_water_bytes(pid: libc::pid_t) -> Option<u64> {
    let status = tokio::fs::read_to_string(format!("/proc/{pid}/status"))
        .await
        .ok()?;
    parse_vm_hwm(&status)
}

#[cfg(not(target_os = "linux"))]
async fn memory_high_water_bytes(_pid: libc::pid_t) -> Option<u64> {
    None
}

/// `VmHWM` belongs to the address space, so it starts over at `exec`.
fn parse_vm_hwm(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmHWM:"))
        .and_then(|value| value.trim().trim_end_matches("kB").trim().parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

fn classify(
    status: libc::c_int,
    forced: Option<Termination>,
    wall_time: Duration,
    cpu_time: Duration,
    peak_memory_bytes: u64,
    limits: &ResourceLimit,
) -> Termination {
    if let Some(forced) = forced {
        return forced;
    }
    if libc::WIFSIGNALED(status) {
        let signal = libc::WTERMSIG(status);
        let cpu_exhausted = cpu_time >= Duration::from_secs(cpu_backstop_seconds(limits));
        if signal == libc::SIGXCPU || (signal == libc::SIGKILL && cpu_exhausted) {
            return Termination::TimedOut;
        }
    }
    if peak_memory_bytes > limits.memory_limit_bytes {
        return Termination::OutOfMemory;
    }
    if wall_time > limits.time_limit() {
        return Termination::TimedOut;
    }
    if libc::WIFEXITED(status) {
        Termination::Exited {
            code: libc::WEXITSTATUS(status),
        }
    } else {
        Termination::Signaled {
            signal: libc::WTERMSIG(status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Program {
        Program {
            path: "/bin/sh".into(),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    fn limits(time_limit_ms: u64) -> ResourceLimit {
        ResourceLimit::new(time_limit_ms, 512 * 1024 * 1024).unwrap()
    }

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let runner = NativeProcessRunner::default();

        let result = runner
            .run(&sh("cat"), b"1 2 3\n", &limits(5000))
            .await
            .expect("cat should run");

        assert_eq!(result.stdout, b"1 2 3\n");
        assert_eq!(result.termination, Termination::Exited { code: 0 });
        assert_eq!(result.exit_code(), Some(0));
    }

    #[tokio::test]
    async fn test_run_reports_exit_code() {
        let runner = NativeProcessRunner::default();

        let result = runner
            .run(&sh("echo oops >&2; exit 3"), b"", &limits(5000))
            .await
            .unwrap();

        assert_eq!(result.termination, Termination::Exited { code: 3 });
        assert_eq!(result.stderr, b"oops\n");
        assert!(!result.stderr_truncated);
    }

    #[tokio::test]
    async fn test_run_same_input_twice_is_deterministic() {
        let runner = NativeProcessRunner::default();
        let program = sh("tr a-z A-Z");

        let first = runner.run(&program, b"hello", &limits(5000)).await.unwrap();
        let second = runner.run(&program, b"hello", &limits(5000)).await.unwrap();

        assert_eq!(first.stdout, b"HELLO");
        assert_eq!(first.stdout, second.stdout);
        assert_eq!(first.exit_code(), second.exit_code());
    }

    #[tokio::test]
    async fn test_run_times_out() {
        let runner = NativeProcessRunner::default();
        let started = std::time::Instant::now();

        let result = runner.run(&sh("sleep 10"), b"", &limits(200)).await.unwrap();

        assert_eq!(result.termination, Termination::TimedOut);
        assert!(result.timed_out());
        assert_eq!(result.exit_code(), None);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_run_kills_descendants_holding_stdout() {
        let runner = NativeProcessRunner::default();
        let started = std::time::Instant::now();

        // The background sleep keeps stdout open after the shell exits.
        let result = runner
            .run(&sh("sleep 30 & echo started"), b"", &limits(5000))
            .await
            .unwrap();

        assert_eq!(result.stdout, b"started\n");
        assert_eq!(result.termination, Termination::Exited { code: 0 });
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_run_out_of_memory() {
        let runner = NativeProcessRunner::default();

        let result = runner
            .run(
                &sh("sleep 2"),
                b"",
                &ResourceLimit::new(5000, 1024).unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(result.termination, Termination::OutOfMemory);
        assert!(result.out_of_memory());
        assert!(!result.timed_out());
    }

    #[tokio::test]
    async fn test_run_truncates_stderr() {
        let runner = NativeProcessRunner::new(Duration::from_millis(10), 1024, 10);

        let result = runner
            .run(&sh("printf '%0100d' 0 >&2"), b"", &limits(5000))
            .await
            .unwrap();

        assert_eq!(result.stderr.len(), 10);
        assert!(result.stderr_truncated);
    }

    #[tokio::test]
    async fn test_run_large_output() {
        let runner = NativeProcessRunner::default();

        let result = runner
            .run(&sh("head -c 1000000 /dev/zero"), b"", &limits(5000))
            .await
            .unwrap();

        assert_eq!(result.stdout.len(), 1_000_000);
    }

    #[tokio::test]
    async fn test_run_ignores_unread_stdin() {
        let runner = NativeProcessRunner::default();
        let input = vec![b'x'; 1 << 20];

        let result = runner.run(&sh("exit 0"), &input, &limits(5000)).await.unwrap();

        assert!(result.termination.is_success());
    }

    #[tokio::test]
    async fn test_run_missing_executable() {
        let runner = NativeProcessRunner::default();

        let result = runner
            .run(&Program::new("/nonexistent/sanitizer"), b"", &limits(1000))
            .await;

        assert!(matches!(result, Err(SpawnError::FailedToLaunch { .. })));
    }

    #[tokio::test]
    async fn test_peak_memory_excludes_harness_memory() {
        // A large resident buffer in this process must not be charged to the child.
        let ballast = vec![7u8; 300 * 1024 * 1024];
        let runner = NativeProcessRunner::default();
        let limits = ResourceLimit::new(5000, 64 * 1024 * 1024).unwrap();

        let result = runner.run(&Program::new("/bin/true"), b"", &limits).await.unwrap();

        assert_eq!(result.termination, Termination::Exited { code: 0 });
        assert!(result.peak_memory_bytes < 64 * 1024 * 1024, "{}", result.peak_memory_bytes);
        assert_eq!(std::hint::black_box(&ballast)[0], 7);
    }

    #[tokio::test]
    async fn test_peak_memory_tracks_allocation() {
        let runner = NativeProcessRunner::default();
        let allocated = 16 * 1024 * 1024;

        // The shell keeps the whole command substitution in memory while it sleeps.
        let script = format!("x=$(head -c {allocated} /dev/zero | tr '\\0' a); sleep 0.5");
        let result = runner.run(&sh(&script), b"", &limits(10_000)).await.unwrap();

        assert_eq!(result.termination, Termination::Exited { code: 0 });
        assert!(result.peak_memory_bytes >= allocated, "{}", result.peak_memory_bytes);
        assert!(result.peak_memory_bytes <= 6 * allocated, "{}", result.peak_memory_bytes);
    }

    #[tokio::test]
    async fn test_run_kills_program_flooding_stdout() {
        let runner = NativeProcessRunner::new(Duration::from_millis(10), 1024 * 1024, 1024);
        let started = std::time::Instant::now();

        let result = runner.run(&Program::new("yes"), b"", &limits(10_000)).await.unwrap();

        assert_eq!(result.termination, Termination::OutputLimitExceeded);
        assert_eq!(result.stdout.len(), 1024 * 1024);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_run_reports_cpu_time() {
        let runner = NativeProcessRunner::default();

        let result = runner
            .run(
                &sh("i=0; while [ $i -lt 300000 ]; do i=$((i+1)); done"),
                b"",
                &limits(30_000),
            )
            .await
            .unwrap();

        assert!(result.termination.is_success());
        assert!(result.cpu_time > Duration::ZERO);
        assert!(result.cpu_time <= result.wall_time + Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_concurrent_runs_are_reaped_independently() {
        let runner = NativeProcessRunner::default();

        let results = futures::future::join_all((0..64).map(|i| {
            let runner = runner.clone();
            async move {
                let program = sh(&format!("exit {}", i % 3));
                runner.run(&program, b"", &limits(5000)).await
            }
        }))
        .await;

        for (i, result) in results.into_iter().enumerate() {
            let result = result.unwrap();
            assert_eq!(result.termination, Termination::Exited { code: (i % 3) as i32 });
        }
    }

    #[test]
    fn test_parse_vm_hwm() {
        let status = "Name:\tcat\nVmPeak:\t    8000 kB\nVmHWM:\t    2048 kB\n\
                      VmRSS:\t    1536 kB\n";
        assert_eq!(parse_vm_hwm(status), Some(2048 * 1024));
        assert_eq!(parse_vm_hwm("Name:\tzombie\nState:\tZ (zombie)\n"), None);
    }

    #[test]
    fn test_parse_cpu_ticks() {
        let stat = "4242 (my (odd) prog) Z 1 4242 4242 0 -1 4194564 90 0 0 0 12 3 40 5 20 0 1 0";
        assert_eq!(parse_cpu_ticks(stat), Some(12 + 3 + 40 + 5));
        assert_eq!(parse_cpu_ticks("4242 (sh) Z 1 4242"), None);
    }

    #[test]
    fn test_classify() {
        let limits = ResourceLimit::new(1000, 1024 * 1024).unwrap();
        let exited = |code: i32| code << 8;
        let fast = Duration::from_millis(10);

        assert_eq!(
            classify(exited(0), None, fast, fast, 1024, &limits),
            Termination::Exited { code: 0 }
        );
        assert_eq!(
            classify(exited(1), None, fast, fast, 1024, &limits),
            Termination::Exited { code: 1 }
        );
        assert_eq!(
            classify(libc::SIGSEGV, None, fast, fast, 1024, &limits),
            Termination::Signaled {
                signal: libc::SIGSEGV
            }
        );
        assert_eq!(
            classify(libc::SIGXCPU, None, fast, fast, 1024, &limits),
            Termination::TimedOut
        );
        assert_eq!(
            classify(libc::SIGKILL, Some(Termination::OutOfMemory), fast, fast, 1024, &limits),
            Termination::OutOfMemory
        );
        assert_eq!(
            classify(exited(0), None, fast, fast, 2 * 1024 * 1024, &limits),
            Termination::OutOfMemory
        );
        assert_eq!(
            classify(exited(0), None, Duration::from_millis(1500), fast, 1024, &limits),
            Termination::TimedOut
        );
    }
}
