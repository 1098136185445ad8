//! Live host measurements used to size a campaign.

use log::{debug, warn};
use std::path::Path;
use std::process::Command;
use sysinfo::System;

/// Reported when every RAM probe fails.
pub const FALLBACK_TOTAL_RAM_MB: u64 = 2048;
/// Floor applied to any detected RAM figure.
pub const MIN_REPORTED_RAM_MB: u64 = 512;
pub const FALLBACK_CPU_COUNT: usize = 4;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Source of the host facts the budget depends on.
///
/// Production code uses [`LiveHost`]; tests substitute fixed values.
pub trait HostProbe {
    /// Total physical memory in MB. Never fails and is at least
    /// [`MIN_REPORTED_RAM_MB`].
    fn total_ram_mb(&self) -> u64;
    fn cpu_count(&self) -> usize;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LiveHost;

impl HostProbe for LiveHost {
    fn total_ram_mb(&self) -> u64 {
        let probes: [(&str, fn() -> Option<u64>); 3] = [
            ("/proc/meminfo", ram_from_proc_meminfo),
            ("sysinfo", ram_from_sysinfo),
            ("sysctl", ram_from_sysctl),
        ];
        for (source, probe) in probes {
            if let Some(mb) = probe() {
                debug!("Detected {mb}MB of RAM via {source}");
                return mb.max(MIN_REPORTED_RAM_MB);
            }
        }
        warn!("Could not detect system RAM, using conservative {FALLBACK_TOTAL_RAM_MB}MB estimate");
        FALLBACK_TOTAL_RAM_MB
    }

    fn cpu_count(&self) -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(FALLBACK_CPU_COUNT)
    }
}

/// Fixed measurements, for dry runs and tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedHost {
    pub total_ram_mb: u64,
    pub cpu_count: usize,
}

impl HostProbe for FixedHost {
    fn total_ram_mb(&self) -> u64 {
        self.total_ram_mb
    }

    fn cpu_count(&self) -> usize {
        self.cpu_count
    }
}

fn ram_from_proc_meminfo() -> Option<u64> {
    let content = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo_total_mb(&content)
}

/// Extracts `MemTotal` (reported in kB) as MB.
pub fn parse_meminfo_total_mb(content: &str) -> Option<u64> {
    content
        .lines()
        .find(|line| line.starts_with("MemTotal:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb / 1024)
}

fn ram_from_sysinfo() -> Option<u64> {
    let mut sys = System::new();
    sys.refresh_memory();
    match sys.total_memory() {
        0 => None,
        bytes => Some(bytes / BYTES_PER_MB),
    }
}

fn ram_from_sysctl() -> Option<u64> {
    if !cfg!(target_os = "macos") {
        return None;
    }
    let output = Command::new("sysctl")
        .args(["-n", "hw.memsize"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let bytes: u64 = String::from_utf8_lossy(&output.stdout).trim().parse().ok()?;
    Some(bytes / BYTES_PER_MB)
}

/// Bytes available to unprivileged users on the filesystem holding `path`.
#[cfg(unix)]
pub fn free_disk_bytes(path: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat = std::mem::MaybeUninit::<libc::statvfs>::uninit();
    // SAFETY: `c_path` is NUL-terminated and `stat` points to writable storage
    // of the right size; it is only read after statvfs reports success.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if rc != 0 {
        return None;
    }
    // SAFETY: statvfs returned 0, so it fully initialised `stat`.
    let stat = unsafe { stat.assume_init() };
    #[allow(clippy::unnecessary_cast)]
    let bytes = (stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64);
    Some(bytes)
}

#[cfg(not(unix))]
pub fn free_disk_bytes(_path: &Path) -> Option<u64> {
    None
}
