use std::{
    env,
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::{Context, Result};
use behat_harness::{
    check::check_directories,
    config::{AppConfig, load_config},
    driver::{Driver, Mode, Outcome, RunOptions},
    instance::{INSTANCE_FILE, Instance, LocalInstance},
    provision::{HttpFetcher, Provisioner},
    supervisor::ShellLauncher,
};
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "behat-harness",
    version,
    about = "Prepare and run Behat against a local instance"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<Utf8PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialise Behat, and run the tests with --run
    Behat(BehatArgs),
    /// Check the configured directories
    Check(CheckArgs),
}

#[derive(Args, Debug)]
struct BehatArgs {
    /// Run the tests
    #[arg(short, long)]
    run: bool,
    /// Skip the tests involving JavaScript
    #[arg(short = 'j', long = "no-javascript")]
    no_javascript: bool,
    /// Force the switch completely setting (always on for PHP < 5.4)
    #[arg(short, long)]
    switch_completely: bool,
    /// Path to the Selenium standalone server to use
    #[arg(long, value_name = "JARFILE", num_args = 0..=1)]
    selenium: Option<Option<Utf8PathBuf>>,
    /// Show the output of Selenium in this window
    #[arg(long)]
    selenium_verbose: bool,
    /// Name of the instance (defaults to the one containing the current directory)
    name: Option<String>,
}

#[derive(Args, Debug)]
struct CheckArgs {
    /// Create the directories that are missing
    #[arg(long)]
    fix: bool,
}

fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();
    match dispatch(cli) {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn dispatch(cli: Cli) -> Result<ExitCode> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Behat(args) => behat(&config, args),
        Command::Check(args) => check(&config, args),
    }
}

fn behat(config: &AppConfig, args: BehatArgs) -> Result<ExitCode> {
    let settings = config.tool_settings();
    let instance = resolve_instance(config, args.name.as_deref(), &settings.php)?;

    let fetcher = HttpFetcher::new(config.download_timeout());
    let provisioner = Provisioner::new(&fetcher).with_urls(
        config.downloads.composer_installer_url.clone(),
        config.downloads.selenium_index_url.clone(),
    );
    let driver = Driver::new(settings, provisioner, ShellLauncher);

    let options = RunOptions {
        mode: if args.run { Mode::Run } else { Mode::Describe },
        disable_javascript: args.no_javascript,
        selenium_override: args.selenium.flatten().map(Utf8PathBuf::into_std_path_buf),
        selenium_verbose: args.selenium_verbose,
        force_switch_completely: args.switch_completely,
    };

    let outcome = driver.execute(instance.as_ref().map(|i| i as &dyn Instance), &options)?;
    match outcome {
        Outcome::Described(plan) => {
            print!("{}", plan.render());
            Ok(ExitCode::SUCCESS)
        }
        Outcome::Completed { exit_code } => {
            info!(exit_code, "Behat finished");
            Ok(ExitCode::from(u8::try_from(exit_code).unwrap_or(1)))
        }
    }
}

fn check(config: &AppConfig, args: CheckArgs) -> Result<ExitCode> {
    println!("Checking directories");
    let report = check_directories(&config.directories(), args.fix)?;
    let mut problems = 0;
    for entry in &report {
        println!("  {} ({}): {}", entry.key, entry.path.display(), entry.status);
        if entry.is_problem() {
            problems += 1;
        }
    }
    if problems > 0 {
        warn!(problems, "some directories need attention; rerun with --fix");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

/// A named instance lives under the instances directory; without a name, the closest
/// ancestor of the working directory holding an instance file is used.
fn resolve_instance(
    config: &AppConfig,
    name: Option<&str>,
    php: &Path,
) -> Result<Option<LocalInstance>> {
    let root = match name {
        Some(name) => Some(config.instances_dir().join(name)),
        None => {
            let cwd = env::current_dir().context("failed to read the working directory")?;
            find_instance_root(&cwd)
        }
    };
    match root {
        Some(root) => LocalInstance::open(root, php),
        None => Ok(None),
    }
}

fn find_instance_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(INSTANCE_FILE).is_file())
        .map(Path::to_path_buf)
}

fn init_tracing() {
    let filter = env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
