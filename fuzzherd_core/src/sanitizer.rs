use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::Path;
use thiserror::Error;

pub const ASAN_OPTIONS: &str = "ASAN_OPTIONS";
pub const UBSAN_OPTIONS: &str = "UBSAN_OPTIONS";
pub const LLVM_PROFILE_FILE: &str = "LLVM_PROFILE_FILE";

type SanitizerOption = (&'static str, &'static str);

const FUZZING_ASAN: &[SanitizerOption] = &[
    ("halt_on_error", "1"),
    ("print_stacktrace", "1"),
    ("detect_stack_use_after_return", "false"),
    ("detect_stack_use_after_scope", "true"),
    ("symbolize", "1"),
    ("print_module_map", "1"),
    ("handle_segv", "1"),
    ("handle_sigbus", "1"),
    ("handle_abort", "1"),
    ("handle_sigfpe", "1"),
    ("allow_user_segv_handler", "0"),
    ("use_sigaltstack", "1"),
    ("detect_odr_violation", "0"),
    ("fast_unwind_on_malloc", "1"),
    ("detect_leaks", "0"),
    ("check_malloc_usable_size", "0"),
    ("detect_heap_use_after_free", "0"),
    ("quarantine_size_mb", "0"),
];

const TRIAGE_ASAN: &[SanitizerOption] = &[
    ("halt_on_error", "1"),
    ("print_stacktrace", "1"),
    ("detect_stack_use_after_return", "true"),
    ("detect_stack_use_after_scope", "true"),
    ("symbolize", "1"),
    ("print_module_map", "2"),
    ("handle_segv", "1"),
    ("handle_sigbus", "1"),
    ("handle_abort", "1"),
    ("handle_sigfpe", "1"),
    ("allow_user_segv_handler", "0"),
    ("use_sigaltstack", "1"),
    ("detect_odr_violation", "1"),
    ("mmap_limit_mb", "512"),
    ("fast_unwind_on_malloc", "0"),
];

const UBSAN: &[SanitizerOption] = &[
    ("halt_on_error", "1"),
    ("print_stacktrace", "1"),
    ("symbolize", "1"),
    ("print_summary", "1"),
    ("silence_unsigned_overflow", "0"),
];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SanitizerError {
    #[error("Sanitizer option '{key}={value}' in {profile:?} contains a reserved character")]
    MalformedOption {
        profile: SanitizerProfile,
        key: &'static str,
        value: &'static str,
    },
    #[error("Sanitizer option '{key}' is set twice in {profile:?}")]
    DuplicateOption {
        profile: SanitizerProfile,
        key: &'static str,
    },
}

/// Runtime configuration for the sanitizers linked into a target.
///
/// `Fuzzing` trades heap-use-after-free and stack-use-after-return coverage
/// for throughput. `Triage` turns every diagnostic back on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SanitizerProfile {
    Fuzzing,
    Triage,
}

impl SanitizerProfile {
    pub const ALL: [SanitizerProfile; 2] = [SanitizerProfile::Fuzzing, SanitizerProfile::Triage];

    pub fn asan_options(self) -> &'static [SanitizerOption] {
        match self {
            SanitizerProfile::Fuzzing => FUZZING_ASAN,
            SanitizerProfile::Triage => TRIAGE_ASAN,
        }
    }

    pub fn ubsan_options(self) -> &'static [SanitizerOption] {
        UBSAN
    }

    /// Checks that every option renders into an unambiguous `k=v:k=v` string.
    pub fn validate(self) -> Result<(), SanitizerError> {
        for table in [self.asan_options(), self.ubsan_options()] {
            let mut seen = Vec::with_capacity(table.len());
            for &(key, value) in table {
                let reserved = |s: &str| s.is_empty() || s.contains([':', '=', ' ']);
                if reserved(key) || reserved(value) {
                    return Err(SanitizerError::MalformedOption {
                        profile: self,
                        key,
                        value,
                    });
                }
                if seen.contains(&key) {
                    return Err(SanitizerError::DuplicateOption { profile: self, key });
                }
                seen.push(key);
            }
        }
        Ok(())
    }

    /// Builds the environment overlay for this profile. `coverage_dir` is
    /// only consulted by the fuzzing profile.
    pub fn environment(self, coverage_dir: &Path) -> EnvOverlay {
        let mut overlay = EnvOverlay::default();
        overlay.insert(ASAN_OPTIONS, join_options(self.asan_options()));
        overlay.insert(UBSAN_OPTIONS, join_options(self.ubsan_options()));
        if self == SanitizerProfile::Fuzzing {
            overlay.insert(
                LLVM_PROFILE_FILE,
                coverage_dir.join("%p.profraw").to_string_lossy().into_owned(),
            );
        }
        overlay
    }
}

/// Validates both profiles. Run once at startup.
pub fn validate_profiles() -> Result<(), SanitizerError> {
    SanitizerProfile::ALL.iter().try_for_each(|p| p.validate())
}

fn join_options(options: &[SanitizerOption]) -> String {
    options
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Variables layered over the inherited environment of one child process.
///
/// The overlay is applied to the spawned command only; the orchestrator's
/// own environment is never modified.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverlay {
    vars: BTreeMap<String, String>,
}

impl EnvOverlay {
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OsStr, &OsStr)> {
        self.vars
            .iter()
            .map(|(k, v)| (OsStr::new(k.as_str()), OsStr::new(v.as_str())))
    }
}
