use std::{
    io::{self, BufRead, BufReader, Read},
    path::PathBuf,
    process::{Child, ChildStdout, Command, ExitStatus, Stdio},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{HarnessError, Result};

/// Pause between starting background services and the foreground run.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(3);

const TERM_GRACE: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const RELAY_GRACE: Duration = Duration::from_secs(1);

/// Where a process writes its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputPolicy {
    /// Share the operator's console.
    #[default]
    Inherit,
    /// Keep it off the console (background services relay it to `debug` logs).
    Suppress,
}

impl OutputPolicy {
    pub(crate) fn apply(self, cmd: &mut Command) {
        match self {
            OutputPolicy::Inherit => {
                cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
            OutputPolicy::Suppress => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }
    }
}

/// A background service to keep alive for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub command: String,
    pub cwd: Option<PathBuf>,
    pub output: OutputPolicy,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            cwd: None,
            output: OutputPolicy::Inherit,
        }
    }

    pub fn in_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_output(mut self, output: OutputPolicy) -> Self {
        self.output = output;
        self
    }
}

/// The command whose exit status becomes the result of a supervised run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForegroundSpec {
    pub name: String,
    pub command: String,
    pub cwd: Option<PathBuf>,
}

impl ForegroundSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            cwd: None,
        }
    }

    pub fn in_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running,
    Terminated,
}

/// A started background service owned by the supervisor.
pub trait ServiceHandle: Send {
    fn name(&self) -> &str;

    fn state(&self) -> ProcessState;

    /// Stop the service. Must tolerate a process that already exited and repeated calls.
    fn terminate(&mut self) -> io::Result<()>;
}

/// Starts services and runs foreground commands.
pub trait Launcher {
    fn start(&self, spec: &ServiceSpec) -> Result<Box<dyn ServiceHandle>>;

    fn run(&self, spec: &ForegroundSpec) -> Result<i32>;
}

/// Launches shell command strings on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellLauncher;

impl Launcher for ShellLauncher {
    fn start(&self, spec: &ServiceSpec) -> Result<Box<dyn ServiceHandle>> {
        Ok(Box::new(ShellProcess::spawn(spec)?))
    }

    fn run(&self, spec: &ForegroundSpec) -> Result<i32> {
        let mut cmd = shell_command(&spec.command);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        OutputPolicy::Inherit.apply(&mut cmd);
        let status = cmd.status().map_err(|source| HarnessError::Spawn {
            name: spec.name.clone(),
            command: spec.command.clone(),
            source,
        })?;
        Ok(exit_code(status))
    }
}

/// A shell command running in the background, with an auxiliary thread relaying its output and
/// noticing an early exit.
#[derive(Debug)]
pub struct ShellProcess {
    name: String,
    pid: u32,
    child: Arc<Mutex<Child>>,
    stop: Arc<AtomicBool>,
    relay: Option<JoinHandle<()>>,
    terminated: bool,
}

impl ShellProcess {
    pub fn spawn(spec: &ServiceSpec) -> Result<Self> {
        let spawn_error = |source: io::Error| HarnessError::Spawn {
            name: spec.name.clone(),
            command: spec.command.clone(),
            source,
        };

        let mut cmd = shell_command(&spec.command);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        match spec.output {
            OutputPolicy::Inherit => {
                cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
            OutputPolicy::Suppress => {
                cmd.stdout(Stdio::piped()).stderr(Stdio::null());
            }
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(spawn_error)?;
        let pid = child.id();
        let stdout = child.stdout.take();
        let child = Arc::new(Mutex::new(child));
        let stop = Arc::new(AtomicBool::new(false));

        let relay = thread::Builder::new()
            .name(format!("service-{}", spec.name))
            .spawn({
                let name = spec.name.clone();
                let child = Arc::clone(&child);
                let stop = Arc::clone(&stop);
                move || watch_service(&name, stdout, &child, &stop)
            });
        let relay = match relay {
            Ok(relay) => relay,
            Err(source) => {
                let mut orphan = child.lock();
                let _ = orphan.kill();
                let _ = orphan.wait();
                return Err(spawn_error(source));
            }
        };

        debug!(service = %spec.name, pid, "service process spawned");
        Ok(Self {
            name: spec.name.clone(),
            pid,
            child,
            stop,
            relay: Some(relay),
            terminated: false,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// A descendant outside the process group can keep the output pipe open; the relay is
    /// detached rather than waited on past [`RELAY_GRACE`].
    fn join_relay(&mut self) {
        let Some(relay) = self.relay.take() else {
            return;
        };
        let deadline = Instant::now() + RELAY_GRACE;
        while !relay.is_finished() && Instant::now() < deadline {
            thread::sleep(POLL_INTERVAL);
        }
        if !relay.is_finished() {
            warn!(service = %self.name, "service output is still open after stopping; detaching relay");
            return;
        }
        if relay.join().is_err() {
            warn!(service = %self.name, "output relay thread panicked");
        }
    }

    fn stop_child(&self) -> io::Result<()> {
        let mut child = self.child.lock();
        if let Some(status) = child.try_wait()? {
            debug!(service = %self.name, code = ?status.code(), "service already exited");
            return Ok(());
        }

        info!(service = %self.name, pid = self.pid, "stopping service");
        request_stop(&mut child, self.pid)?;
        let deadline = Instant::now() + TERM_GRACE;
        while Instant::now() < deadline {
            if child.try_wait()?.is_some() {
                return Ok(());
            }
            thread::sleep(POLL_INTERVAL);
        }

        warn!(service = %self.name, pid = self.pid, "service ignored the stop request; killing it");
        force_stop(&mut child, self.pid)?;
        child.wait()?;
        Ok(())
    }
}

impl ServiceHandle for ShellProcess {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> ProcessState {
        if self.terminated {
            return ProcessState::Terminated;
        }
        match self.child.lock().try_wait() {
            Ok(None) => ProcessState::Running,
            _ => ProcessState::Terminated,
        }
    }

    fn terminate(&mut self) -> io::Result<()> {
        if self.terminated {
            return Ok(());
        }
        self.terminated = true;
        self.stop.store(true, Ordering::Release);
        let result = self.stop_child();
        self.join_relay();
        result
    }
}

impl Drop for ShellProcess {
    fn drop(&mut self) {
        if let Err(err) = self.terminate() {
            warn!(service = %self.name, %err, "failed to stop service on drop");
        }
    }
}

fn watch_service(name: &str, stdout: Option<ChildStdout>, child: &Mutex<Child>, stop: &AtomicBool) {
    if let Some(stdout) = stdout {
        relay_output(name, stdout);
    }

    while !stop.load(Ordering::Acquire) {
        let exited = child.lock().try_wait();
        match exited {
            Ok(Some(status)) => {
                if !stop.load(Ordering::Acquire) {
                    warn!(service = name, code = ?status.code(), "service exited before teardown");
                }
                return;
            }
            Ok(None) => {}
            Err(err) => {
                debug!(service = name, %err, "lost track of service process");
                return;
            }
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Log `output` line by line until EOF. The pipe stays open until then so the writer never
/// sees EPIPE.
fn relay_output(name: &str, output: impl Read) {
    let mut reader = BufReader::new(output);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => return,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                debug!(service = name, "{}", text.trim_end());
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                debug!(service = name, %err, "cannot read service output; discarding the rest");
                let _ = io::copy(&mut reader, &mut io::sink());
                return;
            }
        }
    }
}

/// The reusable teardown collection: every handle pushed here is terminated exactly once,
/// either by [`RunningServices::shutdown`] or when the collection is dropped.
#[derive(Default)]
struct RunningServices {
    handles: Vec<Box<dyn ServiceHandle>>,
}

impl RunningServices {
    fn shutdown(&mut self) {
        for mut handle in self.handles.drain(..).rev() {
            if let Err(err) = handle.terminate() {
                warn!(service = handle.name(), %err, "failed to terminate service");
            }
        }
    }
}

impl Drop for RunningServices {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Runs a foreground command while a set of background services is alive.
#[derive(Debug)]
pub struct Supervisor<L = ShellLauncher> {
    launcher: L,
    settle_delay: Duration,
}

impl<L: Launcher> Supervisor<L> {
    pub fn new(launcher: L, settle_delay: Duration) -> Self {
        Self {
            launcher,
            settle_delay,
        }
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    pub fn settle_delay(&self) -> Duration {
        self.settle_delay
    }

    /// Start `background`, wait for them to settle, run `foreground`, and stop every service
    /// that was started on all exit paths. Returns the foreground exit code.
    pub fn run_supervised(
        &self,
        background: &[ServiceSpec],
        foreground: &ForegroundSpec,
    ) -> Result<i32> {
        let mut running = RunningServices::default();
        for spec in background {
            info!(service = %spec.name, command = %spec.command, "starting service");
            let handle = self.launcher.start(spec)?;
            running.handles.push(handle);
        }

        if !running.handles.is_empty() {
            debug!(
                delay_ms = self.settle_delay.as_millis() as u64,
                "waiting for services to settle"
            );
            thread::sleep(self.settle_delay);
        }

        info!(process = %foreground.name, command = %foreground.command, "running foreground command");
        let result = self.launcher.run(foreground);
        running.shutdown();

        let code = result?;
        if code != 0 {
            warn!(process = %foreground.name, code, "foreground command failed");
        }
        Ok(code)
    }
}

/// Build a command that runs `command` through the platform shell.
pub fn shell_command(command: &str) -> Command {
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    }
    #[cfg(not(windows))]
    {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}

/// Exit code of a finished process; signal deaths map to `128 + signal` like a shell reports.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) -> io::Result<()> {
    use nix::{errno::Errno, sys::signal::killpg, unistd::Pid};

    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(io::Error::from_raw_os_error(errno as i32)),
    }
}

#[cfg(unix)]
fn request_stop(_child: &mut Child, pid: u32) -> io::Result<()> {
    signal_group(pid, nix::sys::signal::Signal::SIGTERM)
}

#[cfg(unix)]
fn force_stop(_child: &mut Child, pid: u32) -> io::Result<()> {
    signal_group(pid, nix::sys::signal::Signal::SIGKILL)
}

#[cfg(not(unix))]
fn request_stop(child: &mut Child, _pid: u32) -> io::Result<()> {
    match child.kill() {
        Err(err) if err.kind() != io::ErrorKind::InvalidInput => Err(err),
        _ => Ok(()),
    }
}

#[cfg(not(unix))]
fn force_stop(child: &mut Child, pid: u32) -> io::Result<()> {
    request_stop(child, pid)
}
