use std::path::PathBuf;
use std::time::Duration;

use crate::layout::ProjectLayout;
use crate::supervisor::TerminationPolicy;

pub(crate) fn fixture(name: &str) -> PathBuf {
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let path = manifest_dir.join("../test_targets").join(name);
    if !path.exists() {
        panic!("Test target missing: {path:?}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

pub(crate) fn fast_policy() -> TerminationPolicy {
    TerminationPolicy {
        deadline_slack: Duration::ZERO,
        graceful_wait: Duration::from_millis(500),
        kill_wait: Duration::from_millis(500),
        poll_interval: Duration::from_millis(10),
    }
}

/// Links a fixture script in as `fuzz-<target>` under the layout's build dir.
#[cfg(unix)]
pub(crate) fn install_target(layout: &ProjectLayout, target: &str, fixture_name: &str) {
    let binary = layout.binary(target);
    std::fs::create_dir_all(binary.parent().unwrap()).unwrap();
    std::os::unix::fs::symlink(fixture(fixture_name), &binary).unwrap();
}
