use log::{error, info, warn};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::budget::{self, BudgetError, ResourceBudget, ResourceLimits};
use crate::config::TargetConfig;
use crate::host::{HostProbe, LiveHost};
use crate::layout::ProjectLayout;
use crate::sanitizer::SanitizerProfile;
use crate::supervisor::{ProcessSpec, ProcessSupervisor, RunOutcome, SupervisorError};

pub const MUTATE_DEPTH_RANGE: RangeInclusive<u32> = 1..=20;
const GENERIC_LOG_PREFIX: &str = "fuzz-";
const LOG_SUFFIX: &str = ".log";

#[derive(Error, Debug)]
pub enum CampaignError {
    /// Pre-flight rejected the resource budget; nothing was spawned.
    #[error("Environment validation failed: {0}")]
    Budget(#[from] BudgetError),

    #[error("Failed to create directory {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The operator cancelled; the running target was terminated and no
    /// later target was started.
    #[error("Campaign interrupted while running '{target}'")]
    Interrupted { target: String },

    #[error("Supervising '{target}' failed: {source}")]
    Supervisor {
        target: String,
        #[source]
        source: SupervisorError,
    },
}

/// Per-invocation knobs of a campaign.
#[derive(Debug, Clone)]
pub struct CampaignSettings {
    /// Total fuzzing time handed to each target.
    pub max_seconds_per_target: u64,
    pub requested_jobs: Option<usize>,
    pub limits: ResourceLimits,
}

#[derive(Debug, Clone)]
pub struct TargetRunResult {
    pub name: String,
    pub outcome: RunOutcome,
    pub success: bool,
    pub elapsed: Duration,
    /// Per-worker logs moved to target-qualified names.
    pub renamed_logs: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct CampaignSummary {
    pub budget: ResourceBudget,
    pub results: Vec<TargetRunResult>,
    pub elapsed: Duration,
}

impl CampaignSummary {
    pub fn targets_run(&self) -> usize {
        self.results.len()
    }

    pub fn targets_succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn overall_success(&self) -> bool {
        self.results.iter().all(|r| r.success)
    }

    pub fn per_target_success(&self) -> Vec<bool> {
        self.results.iter().map(|r| r.success).collect()
    }

    pub fn log_summary(&self) {
        for result in &self.results {
            let verdict = if result.success { "ok" } else { "FAILED" };
            info!(
                "  {:<24} {:<8} {:?} ({:.1}s)",
                result.name,
                verdict,
                result.outcome,
                result.elapsed.as_secs_f64()
            );
        }
        info!(
            "Fuzzing session completed in {:.1}s: {}/{} targets succeeded",
            self.elapsed.as_secs_f64(),
            self.targets_succeeded(),
            self.targets_run()
        );
        info!(
            "Overall result: {}",
            if self.overall_success() {
                "SUCCESS"
            } else {
                "FAILURE"
            }
        );
    }
}

/// Runs fuzz targets one after another under the fuzzing sanitizer profile.
///
/// Parallelism inside a target is left to the target's own `-jobs` flag.
pub struct FuzzCampaign {
    layout: ProjectLayout,
    supervisor: ProcessSupervisor,
    host: Box<dyn HostProbe>,
    rng: ChaCha8Rng,
}

impl FuzzCampaign {
    pub fn new(layout: ProjectLayout, supervisor: ProcessSupervisor) -> Self {
        Self {
            layout,
            supervisor,
            host: Box::new(LiveHost),
            rng: ChaCha8Rng::seed_from_u64(rand::random()),
        }
    }

    pub fn with_host(mut self, host: Box<dyn HostProbe>) -> Self {
        self.host = host;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        self
    }

    pub fn run_campaign(
        &mut self,
        targets: &[TargetConfig],
        settings: &CampaignSettings,
    ) -> Result<CampaignSummary, CampaignError> {
        settings.limits.validate()?;
        for dir in [self.layout.coverage_dir(), self.layout.logs_dir()] {
            create_dir(&dir)?;
        }

        info!("Validating environment...");
        budget::check_disk_space(&self.layout.fuzz_dir());
        let budget =
            ResourceBudget::compute(self.host.as_ref(), &settings.limits, settings.requested_jobs);
        budget.log_report();
        let warnings = budget.preflight()?;
        budget::log_warnings(&warnings);

        let mutate_depth = self.rng.random_range(MUTATE_DEPTH_RANGE);
        info!(
            "Starting fuzzing session with {} fuzzers: {} jobs, {}s per fuzzer, mutate depth {}",
            targets.len(),
            budget.job_count,
            settings.max_seconds_per_target,
            mutate_depth
        );

        let start = Instant::now();
        let mut results = Vec::with_capacity(targets.len());
        for (i, target) in targets.iter().enumerate() {
            if self.supervisor.cancel_token().is_cancelled() {
                return Err(CampaignError::Interrupted {
                    target: target.name.clone(),
                });
            }
            info!("Running fuzzer {}/{}: {}", i + 1, targets.len(), target.name);
            let result = self.run_target(
                target,
                &budget,
                settings.max_seconds_per_target,
                mutate_depth,
            )?;
            if result.success {
                info!("Fuzzer {} completed successfully", target.name);
            } else {
                warn!("Fuzzer {} failed or found issues: {:?}", target.name, result.outcome);
            }
            results.push(result);
        }

        Ok(CampaignSummary {
            budget,
            results,
            elapsed: start.elapsed(),
        })
    }

    fn run_target(
        &self,
        target: &TargetConfig,
        budget: &ResourceBudget,
        max_seconds: u64,
        mutate_depth: u32,
    ) -> Result<TargetRunResult, CampaignError> {
        let start = Instant::now();
        let logs_dir = self.layout.logs_dir();
        let artifacts_dir = self.layout.artifacts_dir(&target.name);
        let corpus_dir = self.layout.corpus_dir(&target.name);

        for dir in [&artifacts_dir, &corpus_dir] {
            if let Err(e) = std::fs::create_dir_all(dir) {
                error!("Could not create {dir:?} for {}: {e}", target.name);
                return Ok(TargetRunResult {
                    name: target.name.clone(),
                    outcome: RunOutcome::SpawnError(e.to_string()),
                    success: false,
                    elapsed: start.elapsed(),
                    renamed_logs: Vec::new(),
                });
            }
        }

        let args = fuzzer_args(
            target,
            budget,
            max_seconds,
            mutate_depth,
            &artifacts_dir,
            &corpus_dir,
        );
        let spec = ProcessSpec::new(self.layout.binary(&target.name))
            .args(args)
            .env(SanitizerProfile::Fuzzing.environment(&self.layout.coverage_dir()))
            .working_dir(&logs_dir)
            .soft_deadline(Duration::from_secs(max_seconds));
        info!("Command: {}", spec.display());

        remove_generic_job_logs(&logs_dir);
        let run = self.supervisor.run(&spec);
        let renamed_logs = rename_job_logs(&logs_dir, &target.name);

        let report = match run {
            Ok(report) => report,
            Err(SupervisorError::Interrupted(_)) => {
                return Err(CampaignError::Interrupted {
                    target: target.name.clone(),
                });
            }
            Err(source) => {
                return Err(CampaignError::Supervisor {
                    target: target.name.clone(),
                    source,
                });
            }
        };

        if let RunOutcome::SpawnError(reason) = &report.outcome {
            error!("Fuzzer {} could not be started: {reason}", target.name);
        }

        Ok(TargetRunResult {
            name: target.name.clone(),
            success: report.outcome.is_success(),
            outcome: report.outcome,
            elapsed: start.elapsed(),
            renamed_logs,
        })
    }
}

/// libFuzzer command line for one target, excluding the binary itself.
pub fn fuzzer_args(
    target: &TargetConfig,
    budget: &ResourceBudget,
    max_seconds: u64,
    mutate_depth: u32,
    artifacts_dir: &Path,
    corpus_dir: &Path,
) -> Vec<String> {
    vec![
        format!("-max_total_time={max_seconds}"),
        format!("-timeout={}", budget.adaptive_timeout_secs),
        format!("-rss_limit_mb={}", budget.per_job_rss_limit_mb),
        format!("-jobs={}", budget.job_count),
        format!("-max_len={}", target.max_len),
        format!("-mutate_depth={mutate_depth}"),
        format!("-artifact_prefix={}/", artifacts_dir.display()),
        "-print_pcs=1".to_string(),
        "-print_funcs=1".to_string(),
        "-print_final_stats=1".to_string(),
        "-shrink=1".to_string(),
        "-reduce_inputs=1".to_string(),
        "-use_value_profile=1".to_string(),
        corpus_dir.display().to_string(),
    ]
}

fn create_dir(dir: &Path) -> Result<(), CampaignError> {
    std::fs::create_dir_all(dir).map_err(|source| CampaignError::Io {
        path: dir.to_path_buf(),
        source,
    })
}

/// Job id of a worker log named `fuzz-<job>.log`.
fn generic_job_id(file_name: &str) -> Option<&str> {
    file_name
        .strip_prefix(GENERIC_LOG_PREFIX)
        .and_then(|rest| rest.strip_suffix(LOG_SUFFIX))
        .filter(|job| !job.is_empty())
}

fn generic_job_logs(logs_dir: &Path) -> Vec<(PathBuf, String)> {
    let entries = match std::fs::read_dir(logs_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Could not list {logs_dir:?}: {e}");
            return Vec::new();
        }
    };
    let mut logs: Vec<(PathBuf, String)> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name();
            let job = generic_job_id(name.to_str()?)?.to_string();
            Some((entry.path(), job))
        })
        .collect();
    logs.sort();
    logs
}

fn remove_generic_job_logs(logs_dir: &Path) {
    for (path, _) in generic_job_logs(logs_dir) {
        if let Err(e) = std::fs::remove_file(&path) {
            warn!("Could not remove stale log {path:?}: {e}");
        }
    }
}

/// Renames `fuzz-<job>.log` to `<target>_<job>.log`. Failures are logged only.
pub fn rename_job_logs(logs_dir: &Path, target: &str) -> Vec<PathBuf> {
    let mut renamed = Vec::new();
    for (path, job) in generic_job_logs(logs_dir) {
        let new_path = logs_dir.join(format!("{target}_{job}{LOG_SUFFIX}"));
        match std::fs::rename(&path, &new_path) {
            Ok(()) => {
                info!("Renamed {path:?} -> {new_path:?}");
                renamed.push(new_path);
            }
            Err(e) => warn!("Could not rename {path:?} to {new_path:?}: {e}"),
        }
    }
    renamed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::FixedHost;
    use crate::layout::default_build_dir;

    #[test]
    fn job_ids_from_generic_logs() {
        assert_eq!(generic_job_id("fuzz-0.log"), Some("0"));
        assert_eq!(generic_job_id("fuzz-12.log"), Some("12"));
        assert_eq!(generic_job_id("fuzz-.log"), None);
        assert_eq!(generic_job_id("bech32_0.log"), None);
        assert_eq!(generic_job_id("fuzz-0.txt"), None);
    }

    #[test]
    fn args_embed_budget_and_target() {
        let budget = ResourceBudget::from_measurements(4096, 8, &ResourceLimits::default(), Some(4));
        let target = TargetConfig::new("bech32", 256);
        let args = fuzzer_args(
            &target,
            &budget,
            600,
            7,
            Path::new("/p/fuzz/corpora/bech32-artifacts"),
            Path::new("/p/fuzz/corpora/bech32"),
        );
        assert_eq!(
            args,
            vec![
                "-max_total_time=600",
                "-timeout=18",
                "-rss_limit_mb=614",
                "-jobs=4",
                "-max_len=256",
                "-mutate_depth=7",
                "-artifact_prefix=/p/fuzz/corpora/bech32-artifacts/",
                "-print_pcs=1",
                "-print_funcs=1",
                "-print_final_stats=1",
                "-shrink=1",
                "-reduce_inputs=1",
                "-use_value_profile=1",
                "/p/fuzz/corpora/bech32",
            ]
        );
    }

    #[test]
    fn rename_is_collision_free_across_targets() {
        let tmp = tempfile::tempdir().unwrap();
        let logs = tmp.path();
        std::fs::write(logs.join("fuzz-0.log"), "a0").unwrap();
        std::fs::write(logs.join("fuzz-1.log"), "a1").unwrap();
        std::fs::write(logs.join("notes.txt"), "keep").unwrap();
        let renamed = rename_job_logs(logs, "alpha");
        assert_eq!(renamed, vec![logs.join("alpha_0.log"), logs.join("alpha_1.log")]);

        std::fs::write(logs.join("fuzz-0.log"), "b0").unwrap();
        rename_job_logs(logs, "beta");
        assert_eq!(std::fs::read_to_string(logs.join("alpha_0.log")).unwrap(), "a0");
        assert_eq!(std::fs::read_to_string(logs.join("beta_0.log")).unwrap(), "b0");
        assert!(logs.join("notes.txt").exists());
    }

    #[test]
    fn rename_in_missing_dir_is_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(rename_job_logs(&tmp.path().join("absent"), "x").is_empty());
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use crate::cancel::CancelToken;
        use crate::test_support::{fast_policy, install_target};
        use std::thread;

        fn campaign(layout: &ProjectLayout, cancel: CancelToken) -> FuzzCampaign {
            FuzzCampaign::new(layout.clone(), ProcessSupervisor::new(fast_policy(), cancel))
                .with_host(Box::new(FixedHost {
                    total_ram_mb: 65536,
                    cpu_count: 8,
                }))
                .with_seed(42)
        }

        fn settings(max_seconds: u64) -> CampaignSettings {
            CampaignSettings {
                max_seconds_per_target: max_seconds,
                requested_jobs: Some(2),
                limits: ResourceLimits::default(),
            }
        }

        #[test]
        fn one_failing_target_fails_the_campaign_but_not_the_others() {
            let tmp = tempfile::tempdir().unwrap();
            let layout = ProjectLayout::new(tmp.path(), default_build_dir());
            install_target(&layout, "good", "target_ok.sh");
            install_target(&layout, "bad", "target_fail.sh");
            install_target(&layout, "after", "target_ok.sh");

            let targets = vec![
                TargetConfig::new("good", 64),
                TargetConfig::new("bad", 64),
                TargetConfig::new("missing", 64),
                TargetConfig::new("after", 64),
            ];
            let summary = campaign(&layout, CancelToken::new())
                .run_campaign(&targets, &settings(1))
                .unwrap();

            assert_eq!(summary.per_target_success(), vec![true, false, false, true]);
            assert!(!summary.overall_success());
            assert_eq!(summary.targets_run(), 4);
            assert_eq!(summary.targets_succeeded(), 2);
            assert_eq!(summary.results[1].outcome, RunOutcome::NonZeroExit(1));
            assert!(matches!(summary.results[2].outcome, RunOutcome::SpawnError(_)));
            assert!(layout.artifacts_dir("good").is_dir());
            assert!(layout.corpus_dir("good").is_dir());
        }

        #[test]
        fn two_target_end_to_end() {
            let tmp = tempfile::tempdir().unwrap();
            let layout = ProjectLayout::new(tmp.path(), default_build_dir());
            install_target(&layout, "zero", "target_ok.sh");
            install_target(&layout, "one", "target_fail.sh");

            let targets = vec![TargetConfig::new("zero", 32), TargetConfig::new("one", 32)];
            let summary = campaign(&layout, CancelToken::new())
                .run_campaign(&targets, &settings(1))
                .unwrap();
            assert_eq!(summary.per_target_success(), vec![true, false]);
            assert!(!summary.overall_success());
        }

        #[test]
        fn worker_logs_are_renamed_and_command_is_complete() {
            let tmp = tempfile::tempdir().unwrap();
            let layout = ProjectLayout::new(tmp.path(), default_build_dir());
            install_target(&layout, "alpha", "target_libfuzzer.sh");
            install_target(&layout, "beta", "target_libfuzzer.sh");
            std::fs::create_dir_all(layout.logs_dir()).unwrap();
            std::fs::write(layout.logs_dir().join("fuzz-7.log"), "stale").unwrap();

            let targets = vec![TargetConfig::new("alpha", 256), TargetConfig::new("beta", 512)];
            let summary = campaign(&layout, CancelToken::new())
                .run_campaign(&targets, &settings(3))
                .unwrap();
            assert!(summary.overall_success());

            let logs = layout.logs_dir();
            for name in ["alpha_0.log", "alpha_1.log", "beta_0.log", "beta_1.log"] {
                assert!(logs.join(name).exists(), "missing {name}");
            }
            assert!(!logs.join("fuzz-7.log").exists());
            assert!(!logs.join("alpha_7.log").exists());
            assert_eq!(summary.results[0].renamed_logs.len(), 2);

            // The fixture records its argv and environment in its working directory.
            let invocation = std::fs::read_to_string(logs.join("invocation.txt")).unwrap();
            let lines: Vec<&str> = invocation.lines().collect();
            assert!(lines.contains(&"-max_total_time=3"));
            assert!(lines.contains(&"-jobs=2"));
            assert!(lines.contains(&"-max_len=512"));
            assert!(lines.contains(&"-rss_limit_mb=16384"));
            let prefix = format!("-artifact_prefix={}/", layout.artifacts_dir("beta").display());
            assert!(lines.contains(&prefix.as_str()));
            assert_eq!(
                lines.iter().find(|l| !l.starts_with('-') && !l.contains('=')),
                Some(&layout.corpus_dir("beta").display().to_string().as_str())
            );
            assert!(invocation.contains("ASAN_OPTIONS=halt_on_error=1:"));
            assert!(invocation.contains("detect_heap_use_after_free=0"));
            assert!(invocation.contains(&format!(
                "LLVM_PROFILE_FILE={}/%p.profraw",
                layout.coverage_dir().display()
            )));
        }

        #[test]
        fn fatal_budget_aborts_before_spawning() {
            let tmp = tempfile::tempdir().unwrap();
            let layout = ProjectLayout::new(tmp.path(), default_build_dir());
            install_target(&layout, "alpha", "target_libfuzzer.sh");

            let mut campaign = campaign(&layout, CancelToken::new()).with_host(Box::new(FixedHost {
                total_ram_mb: 2048,
                cpu_count: 32,
            }));
            let settings = CampaignSettings {
                max_seconds_per_target: 1,
                requested_jobs: Some(16),
                limits: ResourceLimits::default(),
            };
            let result = campaign.run_campaign(&[TargetConfig::new("alpha", 8)], &settings);
            assert!(matches!(
                result,
                Err(CampaignError::Budget(BudgetError::InsufficientMemory { .. }))
            ));
            assert!(!layout.logs_dir().join("invocation.txt").exists());
        }

        #[test]
        fn timed_out_target_is_a_failure() {
            let tmp = tempfile::tempdir().unwrap();
            let layout = ProjectLayout::new(tmp.path(), default_build_dir());
            install_target(&layout, "slow", "target_hang.sh");
            let summary = campaign(&layout, CancelToken::new())
                .run_campaign(&[TargetConfig::new("slow", 8)], &settings(1))
                .unwrap();
            assert_eq!(summary.results[0].outcome, RunOutcome::TimedOut);
            assert!(!summary.overall_success());
        }

        #[test]
        fn interrupt_stops_the_campaign() {
            let tmp = tempfile::tempdir().unwrap();
            let layout = ProjectLayout::new(tmp.path(), default_build_dir());
            install_target(&layout, "slow", "target_hang.sh");
            install_target(&layout, "next", "target_libfuzzer.sh");

            let cancel = CancelToken::new();
            let canceller = {
                let cancel = cancel.clone();
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(300));
                    cancel.cancel();
                })
            };
            let targets = vec![TargetConfig::new("slow", 8), TargetConfig::new("next", 8)];
            let result = campaign(&layout, cancel).run_campaign(&targets, &settings(30));
            canceller.join().unwrap();

            match result {
                Err(CampaignError::Interrupted { target }) => assert_eq!(target, "slow"),
                other => panic!("Expected Interrupted, got {other:?}"),
            }
            assert!(!layout.logs_dir().join("invocation.txt").exists());
        }

        #[test]
        fn mutate_depth_is_seeded_and_in_range() {
            let tmp = tempfile::tempdir().unwrap();
            let layout = ProjectLayout::new(tmp.path(), default_build_dir());
            let mut a = campaign(&layout, CancelToken::new());
            let mut b = campaign(&layout, CancelToken::new());
            let da: u32 = a.rng.random_range(MUTATE_DEPTH_RANGE);
            let db: u32 = b.rng.random_range(MUTATE_DEPTH_RANGE);
            assert_eq!(da, db);
            assert!(MUTATE_DEPTH_RANGE.contains(&da));
        }
    }
}
