use log::{info, warn};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

use crate::host::{self, HostProbe};

/// Memory the host must keep for itself before a warning is raised.
pub const SYSTEM_HEADROOM_MB: i64 = 512;
/// Memory left to the system when recommending a safer job count.
pub const SAFE_JOBS_RESERVE_MB: u64 = 1024;
/// Total fuzzer memory may not exceed this share of RAM (percent).
pub const MAX_TOTAL_FUZZER_SHARE_PERCENT: u64 = 75;
pub const MIN_FREE_DISK_BYTES: u64 = 1024 * 1024 * 1024;
pub const LOW_RAM_MB: u64 = 2048;

pub const MIN_TIMEOUT_SECS: u64 = 15;
pub const MAX_TIMEOUT_SECS: u64 = 60;

/// Fatal pre-flight conditions. A campaign never starts when one is raised.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum BudgetError {
    /// `job_count * per_job_rss_limit_mb` exceeds physical memory.
    #[error(
        "Fuzzer memory allocation ({requested_mb}MB) exceeds total RAM ({total_mb}MB); reduce jobs to {recommended_jobs}"
    )]
    InsufficientMemory {
        requested_mb: u64,
        total_mb: u64,
        recommended_jobs: usize,
    },

    #[error(
        "Fuzzer memory allocation ({requested_mb}MB) is above {MAX_TOTAL_FUZZER_SHARE_PERCENT}% of total RAM ({total_mb}MB); reduce jobs or memory-percent"
    )]
    ExcessiveMemory { requested_mb: u64, total_mb: u64 },

    #[error("Invalid resource limits: {0}")]
    InvalidLimits(String),
}

/// Tunable constants of the budget calculation.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
#[serde(default)]
pub struct ResourceLimits {
    /// CPU cores left to the system when choosing a default job count.
    pub reserved_cpu_cores: usize,
    /// Share of total RAM (percent) split across all fuzzer jobs.
    pub memory_percent: u64,
    pub min_rss_mb: u64,
    pub max_rss_mb: u64,
    pub max_jobs: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            reserved_cpu_cores: 2,
            memory_percent: 60,
            min_rss_mb: 256,
            max_rss_mb: 16384,
            max_jobs: 16,
        }
    }
}

impl ResourceLimits {
    pub fn validate(&self) -> Result<(), BudgetError> {
        if self.memory_percent == 0 || self.memory_percent > 100 {
            return Err(BudgetError::InvalidLimits(format!(
                "memory-percent must be within 1..=100, got {}",
                self.memory_percent
            )));
        }
        if self.min_rss_mb == 0 || self.min_rss_mb > self.max_rss_mb {
            return Err(BudgetError::InvalidLimits(format!(
                "min-rss-mb ({}) must be non-zero and not above max-rss-mb ({})",
                self.min_rss_mb, self.max_rss_mb
            )));
        }
        if self.max_jobs == 0 {
            return Err(BudgetError::InvalidLimits(
                "max-jobs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Non-fatal findings of the pre-flight check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BudgetWarning {
    /// Less than [`SYSTEM_HEADROOM_MB`] would remain for the system.
    LowHeadroom {
        reserved_mb: i64,
        recommended_jobs: usize,
    },
    LowRam,
    LowCpu,
    UnusedCores { unused: usize, suggested_jobs: usize },
}

/// Resource parameters of one campaign invocation. Derived once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceBudget {
    pub total_ram_mb: u64,
    pub cpu_count: usize,
    pub reserved_cpu_cores: usize,
    pub memory_percent: u64,
    pub job_count: usize,
    pub per_job_rss_limit_mb: u64,
    pub budget_mb: u64,
    /// Per-input timeout handed to the target, in seconds.
    pub adaptive_timeout_secs: u64,
}

impl ResourceBudget {
    pub fn compute(
        host: &dyn HostProbe,
        limits: &ResourceLimits,
        requested_jobs: Option<usize>,
    ) -> Self {
        Self::from_measurements(
            host.total_ram_mb(),
            host.cpu_count(),
            limits,
            requested_jobs,
        )
    }

    pub fn from_measurements(
        total_ram_mb: u64,
        cpu_count: usize,
        limits: &ResourceLimits,
        requested_jobs: Option<usize>,
    ) -> Self {
        let cpu_count = cpu_count.max(1);
        let available_cores = cpu_count.saturating_sub(limits.reserved_cpu_cores).max(1);
        let max_jobs = limits.max_jobs.max(1);

        let job_count = match requested_jobs {
            Some(requested) => {
                let clamped = requested.clamp(1, max_jobs);
                if clamped != requested {
                    warn!("Requested {requested} jobs, clamped to {clamped}");
                }
                clamped
            }
            None => available_cores.min(max_jobs),
        };

        let budget_mb = total_ram_mb * limits.memory_percent / 100;

        let per_job_rss_limit_mb = if total_ram_mb < limits.min_rss_mb {
            limits.min_rss_mb
        } else {
            (budget_mb / job_count as u64)
                .min(limits.max_rss_mb)
                .max(limits.min_rss_mb)
        };

        Self {
            total_ram_mb,
            cpu_count,
            reserved_cpu_cores: limits.reserved_cpu_cores,
            memory_percent: limits.memory_percent,
            job_count,
            per_job_rss_limit_mb,
            budget_mb,
            adaptive_timeout_secs: adaptive_timeout_secs(total_ram_mb),
        }
    }

    pub fn total_fuzzer_memory_mb(&self) -> u64 {
        self.job_count as u64 * self.per_job_rss_limit_mb
    }

    /// RAM left after every job reaches its RSS limit. Negative when overcommitted.
    pub fn system_reserved_mb(&self) -> i64 {
        self.total_ram_mb as i64 - self.total_fuzzer_memory_mb() as i64
    }

    pub fn available_cores(&self) -> usize {
        self.cpu_count.saturating_sub(self.reserved_cpu_cores).max(1)
    }

    pub fn recommended_jobs(&self) -> usize {
        let safe_mb = self.total_ram_mb.saturating_sub(SAFE_JOBS_RESERVE_MB);
        ((safe_mb / self.per_job_rss_limit_mb.max(1)) as usize).max(1)
    }

    /// Decides whether the campaign may start.
    pub fn preflight(&self) -> Result<Vec<BudgetWarning>, BudgetError> {
        let reserved_mb = self.system_reserved_mb();
        let total_fuzzer_mb = self.total_fuzzer_memory_mb();

        if reserved_mb < 0 {
            return Err(BudgetError::InsufficientMemory {
                requested_mb: total_fuzzer_mb,
                total_mb: self.total_ram_mb,
                recommended_jobs: self.recommended_jobs(),
            });
        }
        if total_fuzzer_mb * 100 > self.total_ram_mb * MAX_TOTAL_FUZZER_SHARE_PERCENT {
            return Err(BudgetError::ExcessiveMemory {
                requested_mb: total_fuzzer_mb,
                total_mb: self.total_ram_mb,
            });
        }

        let mut warnings = Vec::new();
        if reserved_mb < SYSTEM_HEADROOM_MB {
            warnings.push(BudgetWarning::LowHeadroom {
                reserved_mb,
                recommended_jobs: self.recommended_jobs(),
            });
        }
        if self.total_ram_mb < LOW_RAM_MB {
            warnings.push(BudgetWarning::LowRam);
        }
        if self.cpu_count < 2 {
            warnings.push(BudgetWarning::LowCpu);
        }
        let available = self.available_cores();
        let unused = available.saturating_sub(self.job_count);
        if unused >= 3 {
            warnings.push(BudgetWarning::UnusedCores {
                unused,
                suggested_jobs: available.min(8),
            });
        }
        Ok(warnings)
    }

    /// Logs the allocation breakdown shown before a campaign starts.
    pub fn log_report(&self) {
        let total_fuzzer_mb = self.total_fuzzer_memory_mb();
        let reserved_mb = self.system_reserved_mb();
        let ram = self.total_ram_mb.max(1) as f64;

        info!(
            "System resources: {}MB RAM, {} CPU cores",
            self.total_ram_mb, self.cpu_count
        );
        info!(
            "Jobs: {} (available cores: {}, system reserved: {})",
            self.job_count,
            self.available_cores(),
            self.reserved_cpu_cores
        );
        info!(
            "Memory per job: {}MB (from {}MB budget / {} jobs)",
            self.per_job_rss_limit_mb, self.budget_mb, self.job_count
        );
        info!(
            "Total fuzzer memory: {}MB ({:.1}% of RAM), configured budget {}MB ({}%)",
            total_fuzzer_mb,
            total_fuzzer_mb as f64 / ram * 100.0,
            self.budget_mb,
            self.memory_percent
        );
        if total_fuzzer_mb.abs_diff(self.budget_mb) > 1 {
            info!(
                "Actual allocation ({total_fuzzer_mb}MB) differs from budget ({}MB) due to per-job limits",
                self.budget_mb
            );
        }
        info!(
            "System memory reserved: {}MB ({:.1}% of RAM)",
            reserved_mb,
            reserved_mb as f64 / ram * 100.0
        );
        info!("Per-input timeout: {}s", self.adaptive_timeout_secs);
    }
}

pub fn log_warnings(warnings: &[BudgetWarning]) {
    for warning in warnings {
        match warning {
            BudgetWarning::LowHeadroom {
                reserved_mb,
                recommended_jobs,
            } => warn!(
                "Fuzzer allocation leaves only {reserved_mb}MB for the system; recommended jobs: {recommended_jobs}"
            ),
            BudgetWarning::LowRam => warn!("Low system RAM detected, fuzzing may be slower"),
            BudgetWarning::LowCpu => {
                warn!("Low CPU core count detected, consider increasing --jobs if the system allows")
            }
            BudgetWarning::UnusedCores {
                unused,
                suggested_jobs,
            } => warn!("{unused} cores unused; consider increasing jobs to {suggested_jobs}"),
        }
    }
}

/// `clamp(total_ram_mb / 500 + 10, 15, 60)` seconds.
pub fn adaptive_timeout_secs(total_ram_mb: u64) -> u64 {
    (total_ram_mb / 500 + 10).clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskCheck {
    Sufficient(u64),
    Low(u64),
    Unknown,
}

/// Soft check of free space under `dir`; logs its finding.
pub fn check_disk_space(dir: &Path) -> DiskCheck {
    let result = match host::free_disk_bytes(dir) {
        Some(bytes) if bytes < MIN_FREE_DISK_BYTES => DiskCheck::Low(bytes),
        Some(bytes) => DiskCheck::Sufficient(bytes),
        None => DiskCheck::Unknown,
    };
    let gib = |bytes: u64| bytes as f64 / (1024.0 * 1024.0 * 1024.0);
    match result {
        DiskCheck::Sufficient(bytes) => info!("Disk space: {:.1}GB available", gib(bytes)),
        DiskCheck::Low(bytes) => warn!(
            "Low disk space: {:.1}GB available, at least 1GB recommended",
            gib(bytes)
        ),
        DiskCheck::Unknown => warn!("Could not check disk space for {dir:?}"),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::FixedHost;

    fn limits() -> ResourceLimits {
        ResourceLimits::default()
    }

    #[test]
    fn four_gig_four_jobs_example() {
        let budget = ResourceBudget::from_measurements(4096, 8, &limits(), Some(4));
        assert_eq!(budget.budget_mb, 2457);
        assert_eq!(budget.per_job_rss_limit_mb, 614);
        assert_eq!(budget.job_count, 4);
        assert!(budget.preflight().is_ok());
    }

    #[test]
    fn default_jobs_leave_reserved_cores() {
        let budget = ResourceBudget::compute(
            &FixedHost {
                total_ram_mb: 65536,
                cpu_count: 8,
            },
            &limits(),
            None,
        );
        assert_eq!(budget.job_count, 6);

        let many = ResourceBudget::from_measurements(65536, 64, &limits(), None);
        assert_eq!(many.job_count, 16);

        let tiny = ResourceBudget::from_measurements(65536, 1, &limits(), None);
        assert_eq!(tiny.job_count, 1);
    }

    #[test]
    fn requested_jobs_are_clamped() {
        assert_eq!(
            ResourceBudget::from_measurements(65536, 8, &limits(), Some(0)).job_count,
            1
        );
        assert_eq!(
            ResourceBudget::from_measurements(65536, 8, &limits(), Some(64)).job_count,
            16
        );
    }

    #[test]
    fn rss_limit_stays_within_bounds() {
        let limits = limits();
        for total in [512u64, 700, 1024, 2048, 4096, 16384, 131072, 1 << 20] {
            for jobs in 1..=20usize {
                let budget = ResourceBudget::from_measurements(total, 32, &limits, Some(jobs));
                assert!(
                    (limits.min_rss_mb..=limits.max_rss_mb).contains(&budget.per_job_rss_limit_mb),
                    "total={total} jobs={jobs} limit={}",
                    budget.per_job_rss_limit_mb
                );
                assert!(budget.job_count >= 1 && budget.job_count <= limits.max_jobs);
            }
        }
    }

    #[test]
    fn passing_preflight_never_overcommits() {
        let limits = limits();
        for total in [512u64, 1000, 2048, 3000, 8192, 65536] {
            for jobs in 1..=16usize {
                let budget = ResourceBudget::from_measurements(total, 32, &limits, Some(jobs));
                if budget.preflight().is_ok() {
                    assert!(budget.total_fuzzer_memory_mb() <= budget.total_ram_mb);
                }
            }
        }
    }

    #[test]
    fn degenerate_low_memory_host_uses_minimum() {
        let budget = ResourceBudget::from_measurements(200, 4, &limits(), Some(2));
        assert_eq!(budget.per_job_rss_limit_mb, 256);
        assert!(matches!(
            budget.preflight(),
            Err(BudgetError::InsufficientMemory { .. })
        ));
    }

    #[test]
    fn overcommit_is_fatal() {
        // 16 jobs at the 256MB floor on a 2GB host needs 4GB.
        let budget = ResourceBudget::from_measurements(2048, 32, &limits(), Some(16));
        assert_eq!(budget.per_job_rss_limit_mb, 256);
        match budget.preflight() {
            Err(BudgetError::InsufficientMemory {
                requested_mb,
                total_mb,
                recommended_jobs,
            }) => {
                assert_eq!(requested_mb, 4096);
                assert_eq!(total_mb, 2048);
                assert_eq!(recommended_jobs, 4);
            }
            other => panic!("Expected InsufficientMemory, got {other:?}"),
        }
    }

    #[test]
    fn high_share_is_fatal() {
        // 8 jobs at 256MB = 2048MB out of 2560MB is 80% of RAM.
        let budget = ResourceBudget::from_measurements(2560, 32, &limits(), Some(8));
        assert_eq!(budget.system_reserved_mb(), 512);
        assert!(matches!(
            budget.preflight(),
            Err(BudgetError::ExcessiveMemory { .. })
        ));
    }

    #[test]
    fn low_headroom_only_warns() {
        // 1500MB out of 2000MB is exactly 75% of RAM, which is still allowed.
        let budget = ResourceBudget {
            total_ram_mb: 2000,
            cpu_count: 4,
            reserved_cpu_cores: 2,
            memory_percent: 100,
            job_count: 1,
            per_job_rss_limit_mb: 1500,
            budget_mb: 2000,
            adaptive_timeout_secs: adaptive_timeout_secs(2000),
        };
        let warnings = budget.preflight().unwrap();
        assert!(warnings.contains(&BudgetWarning::LowHeadroom {
            reserved_mb: 500,
            recommended_jobs: 1,
        }));
        assert!(warnings.contains(&BudgetWarning::LowRam));
    }

    #[test]
    fn unused_cores_are_reported() {
        let budget = ResourceBudget::from_measurements(65536, 16, &limits(), Some(2));
        let warnings = budget.preflight().unwrap();
        assert!(warnings.contains(&BudgetWarning::UnusedCores {
            unused: 12,
            suggested_jobs: 8,
        }));
    }

    #[test]
    fn adaptive_timeout_is_clamped() {
        assert_eq!(adaptive_timeout_secs(512), 15);
        assert_eq!(adaptive_timeout_secs(4096), 18);
        assert_eq!(adaptive_timeout_secs(16384), 42);
        assert_eq!(adaptive_timeout_secs(1 << 20), 60);
    }

    #[test]
    fn limits_validation() {
        assert!(limits().validate().is_ok());
        let bad_percent = ResourceLimits {
            memory_percent: 0,
            ..limits()
        };
        assert!(bad_percent.validate().is_err());
        let inverted = ResourceLimits {
            min_rss_mb: 1024,
            max_rss_mb: 512,
            ..limits()
        };
        assert!(inverted.validate().is_err());
        let no_jobs = ResourceLimits {
            max_jobs: 0,
            ..limits()
        };
        assert!(no_jobs.validate().is_err());
    }

    #[test]
    fn disk_check_on_tempdir() {
        let tmp = tempfile::tempdir().unwrap();
        assert_ne!(check_disk_space(tmp.path()), DiskCheck::Unknown);
    }
}
