use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{Context, Result, anyhow, bail};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use semver::Version;
use serde_json::{Map, Value};
use tracing::debug;

use crate::supervisor::{OutputPolicy, exit_code};

/// Name of the per-instance settings file; a directory without it is not an instance.
pub const INSTANCE_FILE: &str = "instance.json";

/// A local deployment of the application under test.
///
/// The engine only reads and writes a handful of keys and runs scripts inside the instance;
/// everything else about the deployment is owned elsewhere.
pub trait Instance {
    fn root(&self) -> &Path;

    fn get(&self, key: &str) -> Option<Value>;

    fn set_config(&self, key: &str, value: Value) -> Result<()>;

    /// Removing a key that is not set is not an error.
    fn remove_config(&self, key: &str) -> Result<()>;

    /// Run a PHP script relative to the instance root and return its exit code.
    fn cli(&self, script: &str, args: &[&str], output: OutputPolicy) -> Result<i32>;

    fn runtime_version(&self) -> Result<Version>;

    fn is_installed(&self) -> bool {
        self.get("installed")
            .and_then(|value| value.as_bool())
            .unwrap_or(false)
    }

    fn get_str(&self, key: &str) -> Option<String> {
        self.get(key)
            .and_then(|value| value.as_str().map(str::to_owned))
            .filter(|value| !value.trim().is_empty())
    }
}

/// Instance backed by `<root>/instance.json` and a PHP interpreter on the host.
#[derive(Debug)]
pub struct LocalInstance {
    root: PathBuf,
    php: PathBuf,
    config: Mutex<Map<String, Value>>,
    version: OnceCell<Version>,
}

impl LocalInstance {
    /// Open the instance rooted at `root`, or `None` when the directory is not an instance.
    pub fn open(root: impl Into<PathBuf>, php: impl Into<PathBuf>) -> Result<Option<Self>> {
        let root = root.into();
        let store = root.join(INSTANCE_FILE);
        if !store.is_file() {
            return Ok(None);
        }
        let data = fs::read_to_string(&store)
            .with_context(|| format!("failed to read {}", store.display()))?;
        let config: Map<String, Value> = serde_json::from_str(&data)
            .with_context(|| format!("invalid JSON in {}", store.display()))?;
        Ok(Some(Self {
            root,
            php: php.into(),
            config: Mutex::new(config),
            version: OnceCell::new(),
        }))
    }

    fn persist(&self, config: &Map<String, Value>) -> Result<()> {
        let store = self.root.join(INSTANCE_FILE);
        let data = serde_json::to_vec_pretty(config).context("failed to serialize instance config")?;
        fs::write(&store, data).with_context(|| format!("failed to write {}", store.display()))?;
        Ok(())
    }
}

impl Instance for LocalInstance {
    fn root(&self) -> &Path {
        &self.root
    }

    fn get(&self, key: &str) -> Option<Value> {
        self.config.lock().get(key).cloned()
    }

    fn set_config(&self, key: &str, value: Value) -> Result<()> {
        let mut config = self.config.lock();
        config.insert(key.to_string(), value);
        self.persist(&config)
    }

    fn remove_config(&self, key: &str) -> Result<()> {
        let mut config = self.config.lock();
        if config.remove(key).is_none() {
            return Ok(());
        }
        self.persist(&config)
    }

    fn cli(&self, script: &str, args: &[&str], output: OutputPolicy) -> Result<i32> {
        debug!(script, ?args, root = %self.root.display(), "running instance script");
        let mut cmd = Command::new(&self.php);
        cmd.arg(script).args(args).current_dir(&self.root);
        output.apply(&mut cmd);
        let status = cmd
            .status()
            .with_context(|| format!("failed to run {script} with {}", self.php.display()))?;
        Ok(exit_code(status))
    }

    fn runtime_version(&self) -> Result<Version> {
        self.version
            .get_or_try_init(|| {
                let output = Command::new(&self.php)
                    .args(["-r", "echo PHP_VERSION;"])
                    .output()
                    .with_context(|| format!("failed to execute {}", self.php.display()))?;
                if !output.status.success() {
                    bail!(
                        "{} exited with {:?} while reporting its version",
                        self.php.display(),
                        output.status.code()
                    );
                }
                let raw = String::from_utf8_lossy(&output.stdout);
                parse_loose_version(&raw)
                    .ok_or_else(|| anyhow!("unrecognised PHP version string {:?}", raw.trim()))
            })
            .cloned()
    }
}

/// Parse versions such as `5.3.10-1ubuntu3.4` or `8.2`, ignoring any distribution suffix.
pub fn parse_loose_version(raw: &str) -> Option<Version> {
    let numeric: String = raw
        .trim()
        .chars()
        .take_while(|ch| ch.is_ascii_digit() || *ch == '.')
        .collect();
    let mut parts = numeric
        .split('.')
        .filter(|part| !part.is_empty())
        .map(|part| part.parse::<u64>());
    let major = parts.next()?.ok()?;
    let minor = parts.next().transpose().ok()?.unwrap_or(0);
    let patch = parts.next().transpose().ok()?.unwrap_or(0);
    Some(Version::new(major, minor, patch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seeded(config: Value) -> (tempfile::TempDir, LocalInstance) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(INSTANCE_FILE),
            serde_json::to_vec(&config).unwrap(),
        )
        .unwrap();
        let instance = LocalInstance::open(dir.path(), "php").unwrap().unwrap();
        (dir, instance)
    }

    #[test]
    fn directory_without_store_is_not_an_instance() {
        let dir = tempfile::tempdir().unwrap();
        assert!(LocalInstance::open(dir.path(), "php").unwrap().is_none());
    }

    #[test]
    fn config_changes_are_persisted() {
        let (dir, instance) = seeded(json!({"installed": true}));
        assert!(instance.is_installed());

        instance
            .set_config("behat_switchcompletely", json!(true))
            .unwrap();
        let reopened = LocalInstance::open(dir.path(), "php").unwrap().unwrap();
        assert_eq!(reopened.get("behat_switchcompletely"), Some(json!(true)));

        instance.remove_config("behat_switchcompletely").unwrap();
        instance.remove_config("behat_switchcompletely").unwrap();
        let reopened = LocalInstance::open(dir.path(), "php").unwrap().unwrap();
        assert_eq!(reopened.get("behat_switchcompletely"), None);
    }

    #[test]
    fn blank_strings_read_as_missing() {
        let (_dir, instance) = seeded(json!({"behat_dataroot": "  ", "installed": "yes"}));
        assert_eq!(instance.get_str("behat_dataroot"), None);
        assert!(!instance.is_installed());
    }

    #[test]
    fn loose_versions_parse() {
        assert_eq!(
            parse_loose_version("5.3.10-1ubuntu3.4"),
            Some(Version::new(5, 3, 10))
        );
        assert_eq!(parse_loose_version("8.2\n"), Some(Version::new(8, 2, 0)));
        assert_eq!(parse_loose_version("7"), Some(Version::new(7, 0, 0)));
        assert_eq!(parse_loose_version("PHP"), None);
        assert_eq!(parse_loose_version(""), None);
    }
}
