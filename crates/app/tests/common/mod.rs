#![allow(dead_code)]

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use anyhow::anyhow;
use behat_harness::{
    HarnessError,
    driver::ToolSettings,
    instance::Instance,
    provision::{COMPOSER_PHAR, Fetcher},
    supervisor::{ForegroundSpec, Launcher, OutputPolicy, ProcessState, ServiceHandle, ServiceSpec},
};
use parking_lot::Mutex;
use semver::Version;
use serde_json::{Map, Value, json};
use tempfile::TempDir;

/// In-memory instance rooted in a temporary directory.
pub struct FakeInstance {
    pub dir: TempDir,
    pub config: Mutex<Map<String, Value>>,
    pub version: Version,
    pub scripts: Mutex<Vec<String>>,
    pub config_writes: Mutex<Vec<(String, Option<Value>)>>,
    pub init_exit: i32,
}

impl FakeInstance {
    /// Installed, with Composer already present and a Behat data root configured.
    pub fn installed() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(COMPOSER_PHAR), b"phar").expect("write composer.phar");
        let mut config = Map::new();
        config.insert("installed".into(), json!(true));
        config.insert("behat_dataroot".into(), json!("/var/behatdata"));
        Self {
            dir,
            config: Mutex::new(config),
            version: Version::new(8, 2, 0),
            scripts: Mutex::new(Vec::new()),
            config_writes: Mutex::new(Vec::new()),
            init_exit: 0,
        }
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn with_config(self, key: &str, value: Value) -> Self {
        self.config.lock().insert(key.into(), value);
        self
    }

    pub fn without_config(self, key: &str) -> Self {
        self.config.lock().remove(key);
        self
    }
}

impl Instance for FakeInstance {
    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn get(&self, key: &str) -> Option<Value> {
        self.config.lock().get(key).cloned()
    }

    fn set_config(&self, key: &str, value: Value) -> anyhow::Result<()> {
        self.config_writes
            .lock()
            .push((key.to_string(), Some(value.clone())));
        self.config.lock().insert(key.to_string(), value);
        Ok(())
    }

    fn remove_config(&self, key: &str) -> anyhow::Result<()> {
        self.config_writes.lock().push((key.to_string(), None));
        self.config.lock().remove(key);
        Ok(())
    }

    fn cli(&self, script: &str, _args: &[&str], _output: OutputPolicy) -> anyhow::Result<i32> {
        self.scripts.lock().push(script.to_string());
        Ok(self.init_exit)
    }

    fn runtime_version(&self) -> anyhow::Result<Version> {
        Ok(self.version.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Started(String),
    Ran(String),
    Terminated(String),
}

#[derive(Default)]
pub struct Recording {
    pub events: Vec<Event>,
    pub started_at: Vec<Instant>,
    pub ran_at: Option<Instant>,
    pub specs: Vec<ServiceSpec>,
    pub foreground: Option<ForegroundSpec>,
}

/// Launcher that records what it was asked to do instead of spawning anything.
#[derive(Clone, Default)]
pub struct RecordingLauncher {
    pub log: Arc<Mutex<Recording>>,
    pub fail_start: Option<String>,
    pub foreground_exit: i32,
    pub fail_foreground: bool,
    pub panic_foreground: bool,
}

impl RecordingLauncher {
    pub fn failing_start(name: &str) -> Self {
        Self {
            fail_start: Some(name.to_string()),
            ..Self::default()
        }
    }

    pub fn exiting_with(code: i32) -> Self {
        Self {
            foreground_exit: code,
            ..Self::default()
        }
    }

    pub fn failing_foreground() -> Self {
        Self {
            fail_foreground: true,
            ..Self::default()
        }
    }

    pub fn panicking_foreground() -> Self {
        Self {
            panic_foreground: true,
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.log.lock().events.clone()
    }

    pub fn count(&self, matcher: impl Fn(&Event) -> bool) -> usize {
        self.log.lock().events.iter().filter(|e| matcher(e)).count()
    }

    pub fn started(&self) -> usize {
        self.count(|e| matches!(e, Event::Started(_)))
    }

    pub fn terminated(&self) -> usize {
        self.count(|e| matches!(e, Event::Terminated(_)))
    }

    pub fn specs(&self) -> Vec<ServiceSpec> {
        self.log.lock().specs.clone()
    }

    pub fn foreground(&self) -> Option<ForegroundSpec> {
        self.log.lock().foreground.clone()
    }
}

struct RecordedHandle {
    name: String,
    log: Arc<Mutex<Recording>>,
    terminated: bool,
}

impl ServiceHandle for RecordedHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> ProcessState {
        if self.terminated {
            ProcessState::Terminated
        } else {
            ProcessState::Running
        }
    }

    fn terminate(&mut self) -> io::Result<()> {
        if !self.terminated {
            self.terminated = true;
            self.log
                .lock()
                .events
                .push(Event::Terminated(self.name.clone()));
        }
        Ok(())
    }
}

impl Launcher for RecordingLauncher {
    fn start(&self, spec: &ServiceSpec) -> behat_harness::Result<Box<dyn ServiceHandle>> {
        if self.fail_start.as_deref() == Some(spec.name.as_str()) {
            return Err(HarnessError::Spawn {
                name: spec.name.clone(),
                command: spec.command.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "no such program"),
            });
        }
        let mut log = self.log.lock();
        log.events.push(Event::Started(spec.name.clone()));
        log.started_at.push(Instant::now());
        log.specs.push(spec.clone());
        Ok(Box::new(RecordedHandle {
            name: spec.name.clone(),
            log: Arc::clone(&self.log),
            terminated: false,
        }))
    }

    fn run(&self, spec: &ForegroundSpec) -> behat_harness::Result<i32> {
        let mut log = self.log.lock();
        log.events.push(Event::Ran(spec.name.clone()));
        log.ran_at = Some(Instant::now());
        log.foreground = Some(spec.clone());
        drop(log);
        if self.panic_foreground {
            panic!("{} blew up", spec.name);
        }
        if self.fail_foreground {
            return Err(HarnessError::Spawn {
                name: spec.name.clone(),
                command: spec.command.clone(),
                source: io::Error::new(io::ErrorKind::PermissionDenied, "not executable"),
            });
        }
        Ok(self.foreground_exit)
    }
}

/// Fetcher serving canned pages and files, recording each request.
#[derive(Default)]
pub struct StubFetcher {
    pub pages: HashMap<String, String>,
    pub files: HashMap<String, Vec<u8>>,
    pub requests: Mutex<Vec<String>>,
}

impl StubFetcher {
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

impl Fetcher for StubFetcher {
    fn fetch_text(&self, url: &str) -> anyhow::Result<String> {
        self.requests.lock().push(url.to_string());
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("404 for {url}"))
    }

    fn download(&self, url: &str, dest: &Path) -> anyhow::Result<()> {
        self.requests.lock().push(url.to_string());
        let body = self
            .files
            .get(url)
            .ok_or_else(|| anyhow!("404 for {url}"))?;
        fs::write(dest, body)?;
        Ok(())
    }
}

/// Tool directory with a fake Java runtime and, optionally, a Selenium jar.
pub struct Toolbox {
    pub dir: TempDir,
    pub java: PathBuf,
}

impl Toolbox {
    pub fn new(with_jar: bool) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let java = dir.path().join("java");
        fs::write(&java, b"#!/bin/sh\n").expect("write java");
        if with_jar {
            fs::write(dir.path().join("selenium.jar"), b"jar").expect("write jar");
        }
        Self { dir, java }
    }

    pub fn settings(&self) -> ToolSettings {
        ToolSettings {
            php: PathBuf::from("/usr/bin/php"),
            java: Some(self.java.clone()),
            data_dir: self.dir.path().to_path_buf(),
            server_addr: "localhost:8000".into(),
            settle_delay: std::time::Duration::from_millis(20),
            init_script: Some("admin/tool/behat/cli/init.php".into()),
        }
    }

    pub fn settings_without_java(&self) -> ToolSettings {
        ToolSettings {
            java: Some(self.dir.path().join("no-such-java")),
            ..self.settings()
        }
    }
}
