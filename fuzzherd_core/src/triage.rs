use log::{info, warn};
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::layout::ProjectLayout;
use crate::sanitizer::SanitizerProfile;
use crate::supervisor::{ProcessSpec, ProcessSupervisor, RunOutcome, RunReport, SupervisorError};

pub const DEFAULT_REPLAY_TIMEOUT_SECS: u64 = 30;
const SEPARATOR: &str = "==================================================";

#[derive(Error, Debug)]
pub enum TriageError {
    #[error("Crash analysis interrupted while replaying {crash_file:?}")]
    Interrupted { crash_file: PathBuf },

    #[error("Replaying {crash_file:?} failed: {source}")]
    Supervisor {
        crash_file: PathBuf,
        #[source]
        source: SupervisorError,
    },

    #[error("Failed to discover targets under {path:?}: {source}")]
    Discovery {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Verdict for one replayed crash input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// The target still fails on the input.
    Reproduced,
    Clean,
    TimedOut,
    /// The replay could not be started.
    Error,
}

impl Classification {
    pub fn from_outcome(outcome: &RunOutcome) -> Self {
        match outcome {
            RunOutcome::Success => Classification::Clean,
            RunOutcome::NonZeroExit(_) => Classification::Reproduced,
            RunOutcome::TimedOut => Classification::TimedOut,
            RunOutcome::SpawnError(_) => Classification::Error,
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Classification::Reproduced => "REPRODUCED",
            Classification::Clean => "CLEAN",
            Classification::TimedOut => "TIMEOUT",
            Classification::Error => "ERROR",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub struct CrashRecord {
    pub target_name: String,
    pub crash_file: PathBuf,
    pub log_file: PathBuf,
    pub outcome: RunOutcome,
    /// True iff the replay exited non-zero.
    pub reproduced: bool,
}

impl CrashRecord {
    pub fn classification(&self) -> Classification {
        Classification::from_outcome(&self.outcome)
    }
}

/// Replay results for one target.
#[derive(Debug, Clone, Default)]
pub struct TargetTriage {
    pub target: String,
    pub records: Vec<CrashRecord>,
}

impl TargetTriage {
    fn empty(target: &str) -> Self {
        Self {
            target: target.to_string(),
            records: Vec::new(),
        }
    }

    pub fn total_crash_files(&self) -> usize {
        self.records.len()
    }

    pub fn reproduced(&self) -> usize {
        self.count(Classification::Reproduced)
    }

    pub fn clean(&self) -> usize {
        self.count(Classification::Clean)
    }

    pub fn timed_out(&self) -> usize {
        self.count(Classification::TimedOut)
    }

    pub fn errors(&self) -> usize {
        self.count(Classification::Error)
    }

    /// Reproduced plus timed-out replays.
    pub fn needs_attention(&self) -> usize {
        self.reproduced() + self.timed_out()
    }

    /// `(total crash files, reproduced)`.
    pub fn counts(&self) -> (usize, usize) {
        (self.total_crash_files(), self.reproduced())
    }

    fn count(&self, class: Classification) -> usize {
        self.records
            .iter()
            .filter(|r| r.classification() == class)
            .count()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TriageSummary {
    pub targets: Vec<TargetTriage>,
    pub logs_dir: PathBuf,
}

impl TriageSummary {
    pub fn total_crash_files(&self) -> usize {
        self.targets.iter().map(TargetTriage::total_crash_files).sum()
    }

    pub fn total_reproduced(&self) -> usize {
        self.targets.iter().map(TargetTriage::reproduced).sum()
    }

    pub fn total_timed_out(&self) -> usize {
        self.targets.iter().map(TargetTriage::timed_out).sum()
    }

    pub fn total_errors(&self) -> usize {
        self.targets.iter().map(TargetTriage::errors).sum()
    }

    pub fn needs_attention(&self) -> usize {
        self.targets.iter().map(TargetTriage::needs_attention).sum()
    }

    /// True when no crash reproduced. Timeouts are reported but do not fail.
    pub fn passed(&self) -> bool {
        self.total_reproduced() == 0
    }

    pub fn log_summary(&self) {
        info!("Overall analysis summary:");
        info!("  Total crash files: {}", self.total_crash_files());
        info!("  Total crashes reproduced: {}", self.total_reproduced());
        info!("  Timeouts: {}", self.total_timed_out());
        if self.total_errors() > 0 {
            info!("  Replay errors: {}", self.total_errors());
        }
        info!("  Logs saved to: {}", self.logs_dir.display());
        if self.needs_attention() > 0 {
            warn!("{} crashes need attention!", self.needs_attention());
        }
        if self.passed() {
            info!("All crash analysis completed successfully!");
        }
    }
}

/// Replays saved crash inputs under the triage sanitizer profile.
///
/// Give it a supervisor built with [`crate::supervisor::TerminationPolicy::strict`]
/// so the replay timeout is not stretched by the fuzzing slack.
pub struct CrashAnalyzer {
    layout: ProjectLayout,
    supervisor: ProcessSupervisor,
    timeout: Duration,
}

impl CrashAnalyzer {
    pub fn new(layout: ProjectLayout, supervisor: ProcessSupervisor, timeout: Duration) -> Self {
        Self {
            layout,
            supervisor,
            timeout,
        }
    }

    /// Analyzes the named targets, or every target with an artifacts
    /// directory when `targets` is `None`.
    pub fn analyze_campaign(&self, targets: Option<&[String]>) -> Result<TriageSummary, TriageError> {
        let logs_dir = self.ensure_logs_dir();

        let names = match targets {
            Some(names) => names.to_vec(),
            None => match self.layout.discover_artifact_targets() {
                Ok(Some(names)) => names,
                Ok(None) => {
                    info!("No corpora directory found");
                    Vec::new()
                }
                Err(source) => {
                    return Err(TriageError::Discovery {
                        path: self.layout.corpora_dir(),
                        source,
                    });
                }
            },
        };

        let mut summary = TriageSummary {
            targets: Vec::with_capacity(names.len()),
            logs_dir,
        };
        for name in &names {
            let triage = self.analyze_target(name)?;
            info!(
                "Summary for {}: {} crash files, {} reproduced, {} clean, {} timeouts",
                name,
                triage.total_crash_files(),
                triage.reproduced(),
                triage.clean(),
                triage.timed_out()
            );
            summary.targets.push(triage);
        }
        Ok(summary)
    }

    pub fn analyze_target(&self, target: &str) -> Result<TargetTriage, TriageError> {
        info!("Analyzing crashes for {target}");
        let artifacts_dir = self.layout.artifacts_dir(target);
        let binary = self.layout.binary(target);

        if !artifacts_dir.is_dir() {
            info!("No artifact directory found: {}", artifacts_dir.display());
            return Ok(TargetTriage::empty(target));
        }
        if !binary.exists() {
            warn!("Fuzzer binary not found: {}", binary.display());
            return Ok(TargetTriage::empty(target));
        }

        let crash_files = list_crash_files(&artifacts_dir);
        if crash_files.is_empty() {
            info!("No crash files found in {}", artifacts_dir.display());
            return Ok(TargetTriage::empty(target));
        }
        info!("Found {} crash files", crash_files.len());
        self.ensure_logs_dir();

        let mut triage = TargetTriage::empty(target);
        for crash_file in crash_files {
            if self.supervisor.cancel_token().is_cancelled() {
                return Err(TriageError::Interrupted { crash_file });
            }
            let record = self.replay(target, &binary, &crash_file)?;
            triage.records.push(record);
        }
        Ok(triage)
    }

    /// Best-effort; replays still run when the directory cannot be created.
    fn ensure_logs_dir(&self) -> PathBuf {
        let logs_dir = self.layout.logs_dir();
        if let Err(e) = std::fs::create_dir_all(&logs_dir) {
            warn!("Could not create logs directory {logs_dir:?}: {e}");
        }
        logs_dir
    }

    fn replay(
        &self,
        target: &str,
        binary: &Path,
        crash_file: &Path,
    ) -> Result<CrashRecord, TriageError> {
        let file_name = crash_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!("Analyzing crash: {file_name}");

        let log_file = self
            .layout
            .logs_dir()
            .join(format!("crash_{target}_{file_name}.log"));
        let spec = ProcessSpec::new(binary)
            .args([crash_file.to_string_lossy().into_owned()])
            .env(SanitizerProfile::Triage.environment(&self.layout.coverage_dir()))
            .soft_deadline(self.timeout)
            .capture_output(true);
        info!("Command: {}", spec.display());

        let mut log = TriageLog::create(&log_file);
        log.write_header(crash_file, &spec.display());
        log.write_input_dump(crash_file);
        log.flush();

        let report = match self.supervisor.run(&spec) {
            Ok(report) => report,
            Err(SupervisorError::Interrupted(_)) => {
                log.write_line("\nINTERRUPTED by operator");
                return Err(TriageError::Interrupted {
                    crash_file: crash_file.to_path_buf(),
                });
            }
            Err(source) => {
                return Err(TriageError::Supervisor {
                    crash_file: crash_file.to_path_buf(),
                    source,
                });
            }
        };
        log.write_result(&report, self.timeout);

        let classification = Classification::from_outcome(&report.outcome);
        match &report.outcome {
            RunOutcome::NonZeroExit(code) => {
                warn!("Crash reproduced! Return code: {code}");
                info!("Details saved to: {}", log_file.display());
            }
            RunOutcome::Success => info!("No crash (return code: 0)"),
            RunOutcome::TimedOut => warn!(
                "Timeout after {}s - possible infinite loop",
                self.timeout.as_secs_f64()
            ),
            RunOutcome::SpawnError(reason) => warn!("Error running crash: {reason}"),
        }

        Ok(CrashRecord {
            target_name: target.to_string(),
            crash_file: crash_file.to_path_buf(),
            log_file,
            reproduced: classification == Classification::Reproduced,
            outcome: report.outcome,
        })
    }
}

/// Regular files in `dir`, sorted by name. Unreadable directories yield none.
fn list_crash_files(dir: &Path) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Could not list {dir:?}: {e}");
            return Vec::new();
        }
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    files.sort();
    files
}

/// Per-crash log. Write failures are reported once and never abort a replay.
struct TriageLog {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl TriageLog {
    fn create(path: &Path) -> Self {
        let writer = match File::create(path) {
            Ok(file) => Some(BufWriter::new(file)),
            Err(e) => {
                warn!("Could not create crash log {path:?}: {e}");
                None
            }
        };
        Self {
            path: path.to_path_buf(),
            writer,
        }
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.write_all(bytes) {
                warn!("Could not write crash log {:?}: {e}", self.path);
                self.writer = None;
            }
        }
    }

    fn write_line(&mut self, line: &str) {
        self.write_bytes(line.as_bytes());
        self.write_bytes(b"\n");
    }

    fn flush(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.flush() {
                warn!("Could not flush crash log {:?}: {e}", self.path);
                self.writer = None;
            }
        }
    }

    fn write_header(&mut self, crash_file: &Path, command: &str) {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        self.write_line(&format!("Crash analysis for: {}", crash_file.display()));
        self.write_line(&format!("Command: {command}"));
        self.write_line(&format!("Timestamp: {timestamp}"));
        self.write_line(SEPARATOR);
        self.write_line("");
    }

    fn write_input_dump(&mut self, crash_file: &Path) {
        match std::fs::read(crash_file) {
            Ok(data) => {
                self.write_line(&format!("CRASH INPUT DATA ({} bytes):", data.len()));
                self.write_line(&format!("Hex string: {}", hex::encode(&data)));
                self.write_line(&format!("MD5: {:x}", md5::compute(&data)));
                self.write_line(SEPARATOR);
                self.write_line("");
            }
            Err(e) => {
                self.write_line(&format!("Error reading crash file: {e}"));
                self.write_line("");
            }
        }
    }

    fn write_result(&mut self, report: &RunReport, timeout: Duration) {
        self.write_line("STDOUT:");
        self.write_bytes(&report.output.stdout);
        self.write_line("\nSTDERR:");
        self.write_bytes(&report.output.stderr);
        self.write_line("");
        match &report.outcome {
            RunOutcome::Success => self.write_line("Return code: 0"),
            RunOutcome::NonZeroExit(code) => self.write_line(&format!("Return code: {code}")),
            RunOutcome::TimedOut => self.write_line(&format!(
                "TIMEOUT after {} seconds",
                timeout.as_secs_f64()
            )),
            RunOutcome::SpawnError(reason) => {
                self.write_line(&format!("SPAWN ERROR: {reason}"))
            }
        }
        let class = Classification::from_outcome(&report.outcome);
        self.write_line(&format!("Classification: {class}"));
        self.flush();
    }
}
