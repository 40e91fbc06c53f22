use std::{
    fmt::Write as _,
    path::{Path, PathBuf},
    time::Duration,
};

use tracing::info;

use crate::{
    error::{HarnessError, Result},
    instance::Instance,
    probe::probe_javascript,
    provision::Provisioner,
    supervisor::{ForegroundSpec, Launcher, OutputPolicy, ServiceSpec, ShellLauncher, Supervisor},
    switch::with_switch_complete_override,
};

pub const BEHAT_BIN: &str = "vendor/bin/behat";
pub const BEHAT_DATAROOT_KEY: &str = "behat_dataroot";
pub const JAVASCRIPT_TAG_EXCLUSION: &str = "--tags ~@javascript";
pub const SELENIUM_JAR: &str = "selenium.jar";

/// Tool-wide values the driver needs, resolved from configuration up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSettings {
    pub php: PathBuf,
    pub java: Option<PathBuf>,
    pub data_dir: PathBuf,
    pub server_addr: String,
    pub settle_delay: Duration,
    pub init_script: Option<String>,
}

impl ToolSettings {
    pub fn selenium_jar(&self) -> PathBuf {
        self.data_dir.join(SELENIUM_JAR)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Print the commands to run by hand.
    #[default]
    Describe,
    Run,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub mode: Mode,
    pub disable_javascript: bool,
    pub selenium_override: Option<PathBuf>,
    pub selenium_verbose: bool,
    pub force_switch_completely: bool,
}

/// The commands making up a Behat run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPlan {
    pub web_server: String,
    pub selenium: Option<String>,
    pub behat: String,
}

impl CommandPlan {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Launch PHP Server (or set {} to true):\n  {}",
            crate::switch::SWITCH_COMPLETELY_KEY,
            self.web_server
        );
        if let Some(selenium) = &self.selenium {
            let _ = writeln!(out, "Launch Selenium (optional):\n  {selenium}");
        }
        let _ = writeln!(out, "Launch Behat:\n  {}", self.behat);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Described(CommandPlan),
    /// The suite ran; a non-zero code means failing scenarios, not a harness error.
    Completed { exit_code: i32 },
}

/// Sequences provisioning, probing, the environment switch and the supervised run.
pub struct Driver<'a, L = ShellLauncher> {
    settings: ToolSettings,
    provisioner: Provisioner<'a>,
    supervisor: Supervisor<L>,
}

impl<'a, L: Launcher> Driver<'a, L> {
    pub fn new(settings: ToolSettings, provisioner: Provisioner<'a>, launcher: L) -> Self {
        let supervisor = Supervisor::new(launcher, settings.settle_delay);
        Self {
            settings,
            provisioner,
            supervisor,
        }
    }

    pub fn supervisor(&self) -> &Supervisor<L> {
        &self.supervisor
    }

    pub fn execute(&self, instance: Option<&dyn Instance>, options: &RunOptions) -> Result<Outcome> {
        let instance =
            instance.ok_or_else(|| HarnessError::precondition("this is not an instance"))?;
        if !instance.is_installed() {
            return Err(HarnessError::precondition(format!(
                "the instance at {} needs to be installed first",
                instance.root().display()
            )));
        }

        let javascript = probe_javascript(options.disable_javascript, self.settings.java.as_deref());

        self.provisioner.ensure_composer(instance)?;

        let selenium_jar = if javascript || options.selenium_override.is_some() {
            let jar = self.provisioner.ensure_selenium(
                options.selenium_override.as_deref(),
                &self.settings.selenium_jar(),
            )?;
            if !jar.is_file() {
                return Err(HarnessError::precondition(format!(
                    "Selenium server {} does not exist",
                    jar.display()
                )));
            }
            Some(jar)
        } else {
            None
        };

        let plan = self.plan(instance, javascript, selenium_jar.as_deref())?;

        match options.mode {
            Mode::Describe => {
                info!(
                    web_server = %plan.web_server,
                    selenium = ?plan.selenium,
                    behat = %plan.behat,
                    "Behat ready; commands not started"
                );
                Ok(Outcome::Described(plan))
            }
            Mode::Run => {
                let exit_code = with_switch_complete_override(
                    instance,
                    options.force_switch_completely,
                    |switched| self.run_suite(instance, options, javascript, &plan, switched),
                )?;
                Ok(Outcome::Completed { exit_code })
            }
        }
    }

    fn plan(
        &self,
        instance: &dyn Instance,
        javascript: bool,
        selenium_jar: Option<&Path>,
    ) -> Result<CommandPlan> {
        let dataroot = instance.get_str(BEHAT_DATAROOT_KEY).ok_or_else(|| {
            HarnessError::precondition(format!(
                "the instance at {} has no {BEHAT_DATAROOT_KEY} configured",
                instance.root().display()
            ))
        })?;

        let mut behat = vec![BEHAT_BIN.to_string()];
        if !javascript {
            behat.push(JAVASCRIPT_TAG_EXCLUSION.to_string());
        }
        behat.push(format!(
            "--config={}/behat/behat.yml",
            dataroot.trim_end_matches('/')
        ));

        let selenium = match (selenium_jar, &self.settings.java) {
            (Some(jar), Some(java)) => Some(format!("{} -jar {}", java.display(), jar.display())),
            _ => None,
        };

        Ok(CommandPlan {
            web_server: format!(
                "{} -S {}",
                self.settings.php.display(),
                self.settings.server_addr
            ),
            selenium,
            behat: behat.join(" "),
        })
    }

    fn run_suite(
        &self,
        instance: &dyn Instance,
        options: &RunOptions,
        javascript: bool,
        plan: &CommandPlan,
        switch_completely: bool,
    ) -> Result<i32> {
        if let Some(script) = &self.settings.init_script {
            info!(script, "initialising the Behat environment");
            let code = instance.cli(script, &[], OutputPolicy::Inherit)?;
            if code != 0 {
                return Err(HarnessError::precondition(format!(
                    "{script} exited with status {code}"
                )));
            }
        }
        info!("preparing Behat testing");

        let mut background = Vec::with_capacity(2);
        if !switch_completely {
            background.push(ServiceSpec::new("php-server", &plan.web_server).in_dir(instance.root()));
        }
        if javascript && let Some(selenium) = &plan.selenium {
            let output = if options.selenium_verbose {
                OutputPolicy::Inherit
            } else {
                OutputPolicy::Suppress
            };
            background.push(ServiceSpec::new("selenium", selenium).with_output(output));
        }
        let foreground = ForegroundSpec::new("behat", &plan.behat).in_dir(instance.root());

        self.supervisor.run_supervised(&background, &foreground)
    }
}
