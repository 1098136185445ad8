use log::{debug, error, warn};
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::cancel::CancelToken;
use crate::sanitizer::EnvOverlay;

/// Extra time granted beyond the caller's deadline to absorb sanitizer shutdown.
pub const DEADLINE_SLACK: Duration = Duration::from_secs(60);
pub const GRACEFUL_WAIT: Duration = Duration::from_secs(10);
pub const KILL_WAIT: Duration = Duration::from_secs(5);
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How one supervised process run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    /// Non-zero exit status. A child killed by signal `n` reports `128 + n`.
    NonZeroExit(i32),
    TimedOut,
    SpawnError(String),
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success)
    }

    fn from_status(status: ExitStatus) -> Self {
        if status.success() {
            return RunOutcome::Success;
        }
        if let Some(code) = status.code() {
            return RunOutcome::NonZeroExit(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return RunOutcome::NonZeroExit(128 + signal);
            }
        }
        RunOutcome::NonZeroExit(-1)
    }
}

#[derive(Error, Debug)]
pub enum SupervisorError {
    /// The operator cancelled the run. The child has already been terminated.
    #[error("Interrupted while running {0}")]
    Interrupted(String),

    #[error("Error waiting for child process: {0}")]
    Wait(#[from] io::Error),
}

/// Timing of the deadline and the terminate-then-kill sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationPolicy {
    pub deadline_slack: Duration,
    pub graceful_wait: Duration,
    pub kill_wait: Duration,
    pub poll_interval: Duration,
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self {
            deadline_slack: DEADLINE_SLACK,
            graceful_wait: GRACEFUL_WAIT,
            kill_wait: KILL_WAIT,
            poll_interval: POLL_INTERVAL,
        }
    }
}

impl TerminationPolicy {
    /// No slack: the caller's deadline is the hard bound.
    pub fn strict() -> Self {
        Self {
            deadline_slack: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// Everything needed to launch one external process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: EnvOverlay,
    pub working_dir: Option<PathBuf>,
    pub soft_deadline: Duration,
    /// Pipe stdout/stderr into memory instead of inheriting them.
    pub capture_output: bool,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: EnvOverlay::default(),
            working_dir: None,
            soft_deadline: Duration::from_secs(30),
            capture_output: false,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, env: EnvOverlay) -> Self {
        self.env = env;
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn soft_deadline(mut self, deadline: Duration) -> Self {
        self.soft_deadline = deadline;
        self
    }

    pub fn capture_output(mut self, capture: bool) -> Self {
        self.capture_output = capture;
        self
    }

    /// The command line, shell-quoted for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.to_string_lossy().into_owned())
            .chain(self.args.iter().cloned())
            .map(|part| shell_quote(&part))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn shell_quote(part: &str) -> String {
    let safe = !part.is_empty()
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_=./,:@%+".contains(c));
    if safe {
        part.to_string()
    } else {
        format!("'{}'", part.replace('\'', r"'\''"))
    }
}

#[derive(Debug, Default, Clone)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Empty unless `ProcessSpec::capture_output` was set.
    pub output: ProcessOutput,
    pub elapsed: Duration,
}

impl RunReport {
    fn spawn_error(reason: String) -> Self {
        Self {
            outcome: RunOutcome::SpawnError(reason),
            output: ProcessOutput::default(),
            elapsed: Duration::ZERO,
        }
    }
}

/// Runs external processes one at a time and makes sure none outlives its run.
///
/// The child is placed in its own process group so that termination signals
/// also reach any workers it forked. The supervisor never changes its own
/// working directory or environment; both are set on the spawned command.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    policy: TerminationPolicy,
    cancel: CancelToken,
}

impl ProcessSupervisor {
    pub fn new(policy: TerminationPolicy, cancel: CancelToken) -> Self {
        Self { policy, cancel }
    }

    pub fn policy(&self) -> &TerminationPolicy {
        &self.policy
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn run(&self, spec: &ProcessSpec) -> Result<RunReport, SupervisorError> {
        if !spec.program.exists() {
            return Ok(RunReport::spawn_error(format!(
                "Executable not found: {}",
                spec.program.display()
            )));
        }
        if self.cancel.is_cancelled() {
            return Err(SupervisorError::Interrupted(spec.display()));
        }

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args).envs(spec.env.iter()).stdin(Stdio::null());
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        if spec.capture_output {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let start = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let reason = format!("Failed to spawn command '{}': {e}", spec.display());
                error!("{reason}");
                return Ok(RunReport::spawn_error(reason));
            }
        };
        debug!("Spawned pid {} for {}", child.id(), spec.display());

        let stdout_reader = child.stdout.take().map(spawn_reader);
        let stderr_reader = child.stderr.take().map(spawn_reader);
        let mut guard = ChildGuard::new(child, self.policy);

        let hard_deadline = spec.soft_deadline.saturating_add(self.policy.deadline_slack);
        let outcome = loop {
            if let Some(status) = guard.try_wait()? {
                break RunOutcome::from_status(status);
            }
            if self.cancel.is_cancelled() {
                warn!("Interrupted, terminating pid {}", guard.pid());
                guard.terminate();
                return Err(SupervisorError::Interrupted(spec.display()));
            }
            if start.elapsed() >= hard_deadline {
                warn!(
                    "Process {} exceeded timeout ({}s), terminating...",
                    guard.pid(),
                    hard_deadline.as_secs()
                );
                guard.terminate();
                break RunOutcome::TimedOut;
            }
            thread::sleep(self.policy.poll_interval);
        };

        // Readers only finish once every holder of the pipe is gone, so
        // workers the leader left behind go first.
        let output = if guard.is_reaped() {
            guard.kill_remnants();
            ProcessOutput {
                stdout: join_reader(stdout_reader),
                stderr: join_reader(stderr_reader),
            }
        } else {
            ProcessOutput::default()
        };

        Ok(RunReport {
            outcome,
            output,
            elapsed: start.elapsed(),
        })
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut source: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Err(e) = source.read_to_end(&mut buf) {
            debug!("Stopped reading child output: {e}");
        }
        buf
    })
}

fn join_reader(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

/// Owns a spawned child and terminates it on drop unless it was reaped.
struct ChildGuard {
    child: Child,
    reaped: bool,
    policy: TerminationPolicy,
}

impl ChildGuard {
    fn new(child: Child, policy: TerminationPolicy) -> Self {
        Self {
            child,
            reaped: false,
            policy,
        }
    }

    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn is_reaped(&self) -> bool {
        self.reaped
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        let status = self.child.try_wait()?;
        if status.is_some() {
            self.reaped = true;
        }
        Ok(status)
    }

    fn wait_up_to(&mut self, limit: Duration) -> bool {
        let start = Instant::now();
        loop {
            match self.try_wait() {
                Ok(Some(_)) => return true,
                Ok(None) => {}
                Err(e) => {
                    warn!("Error polling pid {}: {e}", self.pid());
                    return false;
                }
            }
            if start.elapsed() >= limit {
                return false;
            }
            thread::sleep(self.policy.poll_interval.min(limit));
        }
    }

    /// SIGTERM, wait, SIGKILL, wait. Returns whether the child was reaped.
    fn terminate(&mut self) -> bool {
        if matches!(self.try_wait(), Ok(Some(_))) {
            return true;
        }

        self.signal_group(Signal::Terminate);
        if self.wait_up_to(self.policy.graceful_wait) {
            return true;
        }

        warn!("Process {} didn't respond to SIGTERM, sending SIGKILL...", self.pid());
        self.signal_group(Signal::Kill);
        if let Err(e) = self.child.kill() {
            debug!("Direct kill of pid {} failed: {e}", self.pid());
        }
        if self.wait_up_to(self.policy.kill_wait) {
            return true;
        }

        error!("Process {} didn't respond to SIGKILL - may be zombie", self.pid());
        false
    }

    /// SIGKILL whatever is left of the group after the leader was reaped.
    #[cfg(unix)]
    fn kill_remnants(&self) {
        let pgid = self.pid() as libc::pid_t;
        // SAFETY: kill(2) has no memory-safety preconditions. The group id
        // stays reserved while any member is alive; ESRCH means none is.
        if unsafe { libc::kill(-pgid, libc::SIGKILL) } == 0 {
            warn!("Killed processes left behind in group {pgid}");
        }
    }

    #[cfg(not(unix))]
    fn kill_remnants(&self) {}

    #[cfg(unix)]
    fn signal_group(&self, signal: Signal) {
        let sig = match signal {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        let pid = self.pid() as libc::pid_t;
        // SAFETY: kill(2) has no memory-safety preconditions. The negative pid
        // addresses the group the child leads.
        let rc = unsafe { libc::kill(-pid, sig) };
        if rc != 0 {
            // Group gone or never created; fall back to the leader alone.
            // SAFETY: as above. The leader is not reaped yet, so `pid` still
            // names our child.
            let _ = unsafe { libc::kill(pid, sig) };
        }
    }

    #[cfg(not(unix))]
    fn signal_group(&mut self, _signal: Signal) {
        let _ = self.child.kill();
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if !self.reaped {
            self.terminate();
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}
