use std::path::Path;

use tracing::info;

/// Decide whether JavaScript scenarios can run.
///
/// They need a Java runtime for the Selenium server, so the capability is off when the caller
/// asked for it to be, when no runtime is configured, or when the configured path is not a file.
pub fn probe_javascript(disable_requested: bool, runtime_path: Option<&Path>) -> bool {
    if disable_requested {
        return false;
    }
    let Some(runtime) = runtime_path.filter(|path| !path.as_os_str().is_empty()) else {
        info!("disabling JavaScript: no Java runtime is configured to run Selenium");
        return false;
    };
    if !runtime.is_file() {
        info!(
            java = %runtime.display(),
            "disabling JavaScript: the configured Java runtime could not be found"
        );
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, path::PathBuf};

    #[test]
    fn every_combination_of_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let java = dir.path().join("java");
        fs::write(&java, "#!/bin/sh\n").unwrap();
        let missing = dir.path().join("missing-java");

        for disable in [false, true] {
            for configured in [false, true] {
                for exists in [false, true] {
                    let path: Option<PathBuf> = match (configured, exists) {
                        (false, _) => None,
                        (true, true) => Some(java.clone()),
                        (true, false) => Some(missing.clone()),
                    };
                    let enabled = probe_javascript(disable, path.as_deref());
                    let expected = !disable && configured && exists;
                    assert_eq!(
                        enabled, expected,
                        "disable={disable} configured={configured} exists={exists}"
                    );
                }
            }
        }
    }

    #[test]
    fn empty_path_counts_as_unset() {
        assert!(!probe_javascript(false, Some(Path::new(""))));
    }

    #[test]
    fn directories_are_not_runtimes() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!probe_javascript(false, Some(dir.path())));
    }
}
