use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use directories::{BaseDirs, ProjectDirs};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    driver::ToolSettings,
    provision::{COMPOSER_INSTALLER_URL, SELENIUM_INDEX_URL},
};

pub const APP_NAME: &str = "behat-harness";
pub const ENV_PREFIX: &str = "BEHAT_HARNESS_";

static DEFAULT_CONFIG: Lazy<AppConfig> = Lazy::new(AppConfig::default);

/// Tool-wide settings: executables, shared directories and download locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_php")]
    pub php: Utf8PathBuf,
    #[serde(default)]
    pub java: Option<Utf8PathBuf>,
    #[serde(default)]
    pub dirs: DirsConfig,
    #[serde(default)]
    pub behat: BehatConfig,
    #[serde(default)]
    pub downloads: DownloadConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            php: default_php(),
            java: default_java(),
            dirs: DirsConfig::default(),
            behat: BehatConfig::default(),
            downloads: DownloadConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirsConfig {
    /// Shared data directory (the Selenium jar lives here).
    #[serde(default = "default_data_dir")]
    pub data: Utf8PathBuf,
    /// Directory holding one sub-directory per named instance.
    #[serde(default = "default_instances_dir")]
    pub instances: Utf8PathBuf,
}

impl Default for DirsConfig {
    fn default() -> Self {
        Self {
            data: default_data_dir(),
            instances: default_instances_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehatConfig {
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Script run inside the instance before the suite; empty to skip.
    #[serde(default = "default_init_script")]
    pub init_script: String,
}

impl Default for BehatConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            settle_delay_ms: default_settle_delay_ms(),
            init_script: default_init_script(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    #[serde(default = "default_composer_installer_url")]
    pub composer_installer_url: String,
    #[serde(default = "default_selenium_index_url")]
    pub selenium_index_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            composer_installer_url: default_composer_installer_url(),
            selenium_index_url: default_selenium_index_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_php() -> Utf8PathBuf {
    which::which("php")
        .ok()
        .and_then(|path| Utf8PathBuf::from_path_buf(path).ok())
        .unwrap_or_else(|| Utf8PathBuf::from("php"))
}

fn default_java() -> Option<Utf8PathBuf> {
    which::which("java")
        .ok()
        .and_then(|path| Utf8PathBuf::from_path_buf(path).ok())
}

fn default_data_dir() -> Utf8PathBuf {
    ProjectDirs::from("org", "BehatHarness", APP_NAME)
        .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.data_dir().to_path_buf()).ok())
        .unwrap_or_else(|| Utf8PathBuf::from("~/.behat-harness"))
}

fn default_instances_dir() -> Utf8PathBuf {
    Utf8PathBuf::from("~/www")
}

fn default_server_addr() -> String {
    "localhost:8000".into()
}

fn default_settle_delay_ms() -> u64 {
    3000
}

fn default_init_script() -> String {
    "admin/tool/behat/cli/init.php".into()
}

fn default_composer_installer_url() -> String {
    COMPOSER_INSTALLER_URL.into()
}

fn default_selenium_index_url() -> String {
    SELENIUM_INDEX_URL.into()
}

fn default_timeout_secs() -> u64 {
    120
}

impl AppConfig {
    pub fn data_dir(&self) -> PathBuf {
        expand_home(&self.dirs.data)
    }

    pub fn instances_dir(&self) -> PathBuf {
        expand_home(&self.dirs.instances)
    }

    /// The directories `check` looks after, labelled by their config key.
    pub fn directories(&self) -> Vec<(String, PathBuf)> {
        vec![
            ("dirs.data".into(), self.data_dir()),
            ("dirs.instances".into(), self.instances_dir()),
        ]
    }

    pub fn tool_settings(&self) -> ToolSettings {
        let init_script = self.behat.init_script.trim();
        ToolSettings {
            php: expand_home(&self.php),
            java: self
                .java
                .as_deref()
                .filter(|java| !java.as_str().trim().is_empty())
                .map(expand_home),
            data_dir: self.data_dir(),
            server_addr: self.behat.server_addr.clone(),
            settle_delay: Duration::from_millis(self.behat.settle_delay_ms),
            init_script: (!init_script.is_empty()).then(|| init_script.to_string()),
        }
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.downloads.timeout_secs)
    }
}

/// Load configuration: defaults, then a TOML file, then `BEHAT_HARNESS_*` env overrides.
pub fn load_config(explicit_path: Option<&Utf8Path>) -> Result<AppConfig> {
    let mut figment = Figment::from(Serialized::defaults(DEFAULT_CONFIG.clone()));

    if let Some(path) = explicit_path {
        figment = figment.merge(Toml::file(path));
    } else if let Some(path) = resolve_default_config_path() {
        debug!(%path, "using config file");
        figment = figment.merge(Toml::file(path));
    } else {
        warn!("no config file found; relying on defaults + env overrides");
    }

    figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

    figment
        .extract()
        .context("failed to load behat-harness configuration")
}

fn resolve_default_config_path() -> Option<Utf8PathBuf> {
    let local = Utf8PathBuf::from("config").join(format!("{APP_NAME}.toml"));
    if local.exists() {
        return Some(local);
    }

    if let Some(dirs) = ProjectDirs::from("org", "BehatHarness", APP_NAME)
        && let Ok(path) = Utf8PathBuf::from_path_buf(dirs.config_dir().join("config.toml"))
        && path.exists()
    {
        return Some(path);
    }

    None
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &Utf8Path) -> PathBuf {
    let raw = path.as_str();
    let rest = if raw == "~" {
        Some("")
    } else {
        raw.strip_prefix("~/")
    };
    match (rest, BaseDirs::new()) {
        (Some(rest), Some(base)) => base.home_dir().join(rest),
        _ => path.as_std_path().to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("config.toml")).unwrap();
        fs::write(
            &path,
            r#"
java = "/opt/jdk/bin/java"

[dirs]
data = "/var/lib/behat"

[behat]
settle_delay_ms = 250
init_script = ""
"#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.java.as_deref(), Some(Utf8Path::new("/opt/jdk/bin/java")));
        assert_eq!(config.behat.server_addr, "localhost:8000");

        let settings = config.tool_settings();
        assert_eq!(settings.data_dir, PathBuf::from("/var/lib/behat"));
        assert_eq!(settings.settle_delay, Duration::from_millis(250));
        assert_eq!(settings.init_script, None);
        assert_eq!(settings.selenium_jar(), PathBuf::from("/var/lib/behat/selenium.jar"));
    }

    #[test]
    fn home_is_expanded() {
        let Some(base) = BaseDirs::new() else {
            return;
        };
        assert_eq!(
            expand_home(Utf8Path::new("~/www")),
            base.home_dir().join("www")
        );
        assert_eq!(expand_home(Utf8Path::new("~")), base.home_dir().join(""));
        assert_eq!(
            expand_home(Utf8Path::new("/srv/~data")),
            PathBuf::from("/srv/~data")
        );
    }

    #[test]
    fn blank_java_is_unset() {
        let config = AppConfig {
            java: Some(Utf8PathBuf::from(" ")),
            ..AppConfig::default()
        };
        assert_eq!(config.tool_settings().java, None);
    }
}
