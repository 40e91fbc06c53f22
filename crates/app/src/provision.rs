use std::{
    ffi::OsString,
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, anyhow};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::{
    error::{HarnessError, Result},
    instance::Instance,
    supervisor::OutputPolicy,
};

pub const COMPOSER_INSTALLER_URL: &str = "https://getcomposer.org/installer";
pub const SELENIUM_INDEX_URL: &str = "http://docs.seleniumhq.org/download/";

pub const COMPOSER_PHAR: &str = "composer.phar";
pub const COMPOSER_INSTALLER_SCRIPT: &str = "behat_install_composer.php";

static SELENIUM_JAR_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)https?:[a-z0-9/._-]+selenium-server-standalone-[0-9.]+\.jar")
        .expect("selenium download pattern is valid")
});

/// Network access used while provisioning.
pub trait Fetcher {
    fn fetch_text(&self, url: &str) -> anyhow::Result<String>;

    /// Save the body of `url` at `dest`, replacing any existing file.
    fn download(&self, url: &str, dest: &Path) -> anyhow::Result<()>;
}

/// Plain unauthenticated HTTP(S) over `ureq`.
#[derive(Clone)]
pub struct HttpFetcher {
    agent: ureq::Agent,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();
        Self { agent }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch_text(&self, url: &str) -> anyhow::Result<String> {
        self.agent
            .get(url)
            .call()
            .map_err(|err| anyhow!("failed to GET {url}: {err}"))?
            .into_body()
            .read_to_string()
            .map_err(|err| anyhow!("failed to read response from {url}: {err}"))
    }

    fn download(&self, url: &str, dest: &Path) -> anyhow::Result<()> {
        let response = self
            .agent
            .get(url)
            .call()
            .map_err(|err| anyhow!("failed to GET {url}: {err}"))?;

        let partial = partial_path(dest);
        let mut file = File::create(&partial)
            .with_context(|| format!("failed to create {}", partial.display()))?;
        let mut body = response.into_body().into_reader();
        if let Err(err) = io::copy(&mut body, &mut file) {
            let _ = fs::remove_file(&partial);
            return Err(err).with_context(|| format!("failed to download {url}"));
        }
        drop(file);
        fs::rename(&partial, dest).with_context(|| {
            format!("failed to move {} to {}", partial.display(), dest.display())
        })?;
        Ok(())
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = OsString::from(dest.as_os_str());
    name.push(".part");
    PathBuf::from(name)
}

/// Return `expected` if it exists; otherwise run `install` and require that it produced it.
pub fn ensure_artifact(
    expected: &Path,
    install: impl FnOnce(&Path) -> Result<()>,
) -> Result<PathBuf> {
    if expected.exists() {
        debug!(artifact = %expected.display(), "artifact already present");
        return Ok(expected.to_path_buf());
    }

    info!(artifact = %expected.display(), "artifact missing; installing");
    install(expected)?;
    if !expected.exists() {
        return Err(HarnessError::provision(
            expected.display().to_string(),
            "the install step finished but the file is still missing",
        ));
    }
    Ok(expected.to_path_buf())
}

/// First Selenium standalone server jar linked from `page`.
pub fn discover_selenium_url(page: &str) -> Option<String> {
    SELENIUM_JAR_URL
        .find(page)
        .map(|found| found.as_str().to_string())
}

/// Fetches Composer and the Selenium server when they are not on disk yet.
pub struct Provisioner<'a> {
    fetcher: &'a dyn Fetcher,
    composer_installer_url: String,
    selenium_index_url: String,
}

impl<'a> Provisioner<'a> {
    pub fn new(fetcher: &'a dyn Fetcher) -> Self {
        Self {
            fetcher,
            composer_installer_url: COMPOSER_INSTALLER_URL.into(),
            selenium_index_url: SELENIUM_INDEX_URL.into(),
        }
    }

    pub fn with_urls(
        mut self,
        composer_installer_url: impl Into<String>,
        selenium_index_url: impl Into<String>,
    ) -> Self {
        self.composer_installer_url = composer_installer_url.into();
        self.selenium_index_url = selenium_index_url.into();
        self
    }

    /// Make sure `composer.phar` exists in the instance root.
    pub fn ensure_composer(&self, instance: &dyn Instance) -> Result<PathBuf> {
        let expected = instance.root().join(COMPOSER_PHAR);
        ensure_artifact(&expected, |_| self.install_composer(instance))
    }

    fn install_composer(&self, instance: &dyn Instance) -> Result<()> {
        info!("installing Composer");
        let installer = instance.root().join(COMPOSER_INSTALLER_SCRIPT);
        self.fetcher
            .download(&self.composer_installer_url, &installer)
            .map_err(|err| HarnessError::provision("Composer", format!("{err:#}")))?;

        let ran = instance.cli(COMPOSER_INSTALLER_SCRIPT, &[], OutputPolicy::Inherit);
        if let Err(err) = fs::remove_file(&installer) {
            warn!(%err, path = %installer.display(), "failed to remove the Composer installer");
        }
        let code = ran.map_err(|err| HarnessError::provision("Composer", format!("{err:#}")))?;
        if code != 0 {
            return Err(HarnessError::provision(
                "Composer",
                format!("the installer exited with status {code}"),
            ));
        }

        info!("installing Behat dependencies with Composer");
        let code = instance
            .cli(COMPOSER_PHAR, &["install", "--dev"], OutputPolicy::Inherit)
            .map_err(|err| HarnessError::provision("Composer dependencies", format!("{err:#}")))?;
        if code != 0 {
            return Err(HarnessError::provision(
                "Composer dependencies",
                format!("composer install exited with status {code}"),
            ));
        }
        Ok(())
    }

    /// Resolve the Selenium server jar.
    ///
    /// An override is returned as given. Otherwise the jar at `default_path` is downloaded when
    /// missing; failing to find a download is only a warning, so the returned path may not exist.
    pub fn ensure_selenium(
        &self,
        override_path: Option<&Path>,
        default_path: &Path,
    ) -> Result<PathBuf> {
        if let Some(path) = override_path {
            debug!(jar = %path.display(), "using the Selenium server given on the command line");
            return Ok(path.to_path_buf());
        }
        if default_path.exists() {
            return Ok(default_path.to_path_buf());
        }

        info!("attempting to find a download for Selenium");
        let page = match self.fetcher.fetch_text(&self.selenium_index_url) {
            Ok(page) => page,
            Err(err) => {
                warn!(?err, "could not fetch the Selenium download page");
                return Ok(default_path.to_path_buf());
            }
        };
        let Some(url) = discover_selenium_url(&page) else {
            warn!(index = %self.selenium_index_url, "could not locate a Selenium server to download");
            return Ok(default_path.to_path_buf());
        };

        ensure_artifact(default_path, |dest| {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|err| {
                    HarnessError::provision(
                        "Selenium server",
                        format!("failed to create {}: {err}", parent.display()),
                    )
                })?;
            }
            info!(%url, "downloading Selenium");
            self.fetcher
                .download(&url, dest)
                .map_err(|err| HarnessError::provision("Selenium server", format!("{err:#}")))
        })
    }
}
