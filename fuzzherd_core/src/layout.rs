use std::path::{Path, PathBuf};

pub const FUZZ_DIR: &str = "fuzz";
pub const CORPORA_DIR: &str = "corpora";
pub const LOGS_DIR: &str = "logs";
pub const COVERAGE_DIR: &str = "coverage";
pub const CONFIG_FILE: &str = "fuzz_config.toml";
pub const ARTIFACTS_SUFFIX: &str = "-artifacts";
pub const BINARY_PREFIX: &str = "fuzz-";

pub fn default_build_dir() -> PathBuf {
    Path::new(FUZZ_DIR).join("build")
}

/// Resolves the on-disk conventions of a fuzzing project.
///
/// ```text
/// <root>/fuzz/build/fuzz-<name>          target binary
/// <root>/fuzz/corpora/<name>/            seed corpus
/// <root>/fuzz/corpora/<name>-artifacts/  crash inputs
/// <root>/fuzz/logs/                      supervisor and analyzer logs
/// <root>/fuzz/coverage/                  coverage profiles
/// ```
#[derive(Debug, Clone)]
pub struct ProjectLayout {
    root: PathBuf,
    build_dir: PathBuf,
}

impl ProjectLayout {
    /// `build_dir` is taken relative to `root` unless it is absolute.
    pub fn new(root: impl Into<PathBuf>, build_dir: impl AsRef<Path>) -> Self {
        let root = root.into();
        let build_dir = root.join(build_dir);
        Self { root, build_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn fuzz_dir(&self) -> PathBuf {
        self.root.join(FUZZ_DIR)
    }

    pub fn config_file(&self) -> PathBuf {
        self.fuzz_dir().join(CONFIG_FILE)
    }

    pub fn corpora_dir(&self) -> PathBuf {
        self.fuzz_dir().join(CORPORA_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.fuzz_dir().join(LOGS_DIR)
    }

    pub fn coverage_dir(&self) -> PathBuf {
        self.fuzz_dir().join(COVERAGE_DIR)
    }

    pub fn binary(&self, target: &str) -> PathBuf {
        self.build_dir.join(format!("{BINARY_PREFIX}{target}"))
    }

    pub fn corpus_dir(&self, target: &str) -> PathBuf {
        self.corpora_dir().join(target)
    }

    pub fn artifacts_dir(&self, target: &str) -> PathBuf {
        self.corpora_dir().join(format!("{target}{ARTIFACTS_SUFFIX}"))
    }

    /// Target names with an artifacts directory under `corpora/`, sorted.
    /// `None` when the corpora directory itself does not exist.
    pub fn discover_artifact_targets(&self) -> std::io::Result<Option<Vec<String>>> {
        let corpora = self.corpora_dir();
        if !corpora.is_dir() {
            return Ok(None);
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&corpora)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let file_name = entry.file_name();
            if let Some(name) = file_name
                .to_str()
                .and_then(|n| n.strip_suffix(ARTIFACTS_SUFFIX))
            {
                if !name.is_empty() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(Some(names))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_follow_conventions() {
        let layout = ProjectLayout::new("/proj", default_build_dir());
        assert_eq!(layout.binary("bech32"), PathBuf::from("/proj/fuzz/build/fuzz-bech32"));
        assert_eq!(layout.corpus_dir("bech32"), PathBuf::from("/proj/fuzz/corpora/bech32"));
        assert_eq!(
            layout.artifacts_dir("bech32"),
            PathBuf::from("/proj/fuzz/corpora/bech32-artifacts")
        );
        assert_eq!(layout.logs_dir(), PathBuf::from("/proj/fuzz/logs"));
        assert_eq!(layout.coverage_dir(), PathBuf::from("/proj/fuzz/coverage"));
        assert_eq!(layout.config_file(), PathBuf::from("/proj/fuzz/fuzz_config.toml"));
    }

    #[test]
    fn absolute_build_dir_is_kept() {
        let layout = ProjectLayout::new("/proj", "/opt/fuzzers");
        assert_eq!(layout.binary("x"), PathBuf::from("/opt/fuzzers/fuzz-x"));
    }

    #[test]
    fn discovers_artifact_directories_only() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = ProjectLayout::new(tmp.path(), default_build_dir());
        assert!(layout.discover_artifact_targets().unwrap().is_none());

        std::fs::create_dir_all(layout.artifacts_dir("zeta")).unwrap();
        std::fs::create_dir_all(layout.artifacts_dir("alpha")).unwrap();
        std::fs::create_dir_all(layout.corpus_dir("alpha")).unwrap();
        std::fs::write(layout.corpora_dir().join("stray-artifacts"), b"file").unwrap();

        let found = layout.discover_artifact_targets().unwrap().unwrap();
        assert_eq!(found, vec!["alpha".to_string(), "zeta".to_string()]);
    }
}
