//! Browser runtime management
//!
//! Tracks which browser engines are installed, installs missing ones, and
//! launches browser instances. At most one install per engine runs at a time:
//! later callers wait on the install already in flight.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use stepwise_common::{BrowserInstallState, BrowserKind, InstallEvent, InstallPhase};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::driver::{Browser, DriverResult, LaunchOptions};
use crate::error::{EngineError, EngineResult};

const INSTALL_EVENT_CAPACITY: usize = 256;
const SYNTHETIC_PROGRESS_CAP: u8 = 95;

static PERCENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,3})%").unwrap_or_else(|e| panic!("invalid percent pattern: {e}")));

/// Installs browser engines and reports whether they are present
#[async_trait]
pub trait EngineInstaller: Send + Sync {
    /// Executable path when the engine is installed
    async fn probe(&self, kind: BrowserKind) -> Result<Option<PathBuf>, String>;

    /// Install the engine, sending each line of installer output to `output`
    async fn install(&self, kind: BrowserKind, output: mpsc::UnboundedSender<String>) -> Result<(), String>;
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, kind: BrowserKind, options: &LaunchOptions) -> DriverResult<Arc<dyn Browser>>;
}

type InstallTask = Shared<BoxFuture<'static, Result<BrowserInstallState, String>>>;

/// Manages browser engine installation and launching
#[derive(Clone)]
pub struct BrowserRuntimeManager {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    installer: Arc<dyn EngineInstaller>,
    launcher: Arc<dyn BrowserLauncher>,
    states: Mutex<HashMap<BrowserKind, BrowserInstallState>>,
    in_flight: Mutex<HashMap<BrowserKind, InstallTask>>,
    events: broadcast::Sender<InstallEvent>,
    launch_options: LaunchOptions,
}

impl BrowserRuntimeManager {
    pub fn new(
        installer: Arc<dyn EngineInstaller>,
        launcher: Arc<dyn BrowserLauncher>,
        launch_options: LaunchOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(INSTALL_EVENT_CAPACITY);
        Self {
            inner: Arc::new(RuntimeInner {
                installer,
                launcher,
                states: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                events,
                launch_options,
            }),
        }
    }

    /// Receive install progress for every engine
    pub fn subscribe(&self) -> broadcast::Receiver<InstallEvent> {
        self.inner.events.subscribe()
    }

    /// Current state of an engine, probing the installation unless an
    /// install is running
    pub async fn get_status(&self, kind: BrowserKind) -> BrowserInstallState {
        let in_progress = self.inner.in_flight.lock().contains_key(&kind);
        if !in_progress {
            match self.inner.installer.probe(kind).await {
                Ok(path) => {
                    let mut states = self.inner.states.lock();
                    let state = states.entry(kind).or_insert_with(|| BrowserInstallState::new(kind));
                    state.installed = path.is_some();
                    state.executable_path = path;
                }
                Err(e) => {
                    warn!(browser = %kind, error = %e, "browser probe failed");
                    let mut states = self.inner.states.lock();
                    let state = states.entry(kind).or_insert_with(|| BrowserInstallState::new(kind));
                    state.installed = false;
                    state.last_error = Some(e);
                }
            }
        }
        self.inner.snapshot(kind)
    }

    /// Install the engine only when it is missing
    pub async fn ensure_installed(&self, kind: BrowserKind) -> EngineResult<BrowserInstallState> {
        let state = self.get_status(kind).await;
        if state.installed {
            return Ok(state);
        }
        self.install(kind).await
    }

    /// Install the engine, joining an install already in flight for it.
    ///
    /// The install runs on its own task, so dropping this future stops the
    /// wait without stopping the install.
    pub async fn install(&self, kind: BrowserKind) -> EngineResult<BrowserInstallState> {
        let task = {
            let mut in_flight = self.inner.in_flight.lock();
            match in_flight.get(&kind) {
                Some(task) => {
                    debug!(browser = %kind, "joining install in flight");
                    task.clone()
                }
                None => {
                    let inner = self.inner.clone();
                    let handle = tokio::spawn(async move { inner.run_install(kind).await });
                    let task: InstallTask = async move {
                        handle
                            .await
                            .unwrap_or_else(|e| Err(format!("install task failed: {}", e)))
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(kind, task.clone());
                    task
                }
            }
        };

        task.await.map_err(EngineError::Install)
    }

    /// Launch a browser with the configured launch options
    pub async fn launch(&self, kind: BrowserKind) -> EngineResult<Arc<dyn Browser>> {
        let mut options = self.inner.launch_options.clone();
        if options.executable_path.is_none() {
            options.executable_path = self
                .inner
                .states
                .lock()
                .get(&kind)
                .and_then(|s| s.executable_path.clone());
        }
        info!(browser = %kind, headless = options.headless, "launching browser");
        Ok(self.inner.launcher.launch(kind, &options).await?)
    }
}

impl RuntimeInner {
    fn snapshot(&self, kind: BrowserKind) -> BrowserInstallState {
        let mut state = self
            .states
            .lock()
            .entry(kind)
            .or_insert_with(|| BrowserInstallState::new(kind))
            .clone();
        state.install_in_progress = self.in_flight.lock().contains_key(&kind);
        state
    }

    fn update(&self, kind: BrowserKind, f: impl FnOnce(&mut BrowserInstallState)) {
        let mut states = self.states.lock();
        f(states.entry(kind).or_insert_with(|| BrowserInstallState::new(kind)));
    }

    fn emit(&self, kind: BrowserKind, phase: InstallPhase, progress: Option<u8>, message: impl Into<String>) {
        // No subscribers is fine
        let _ = self.events.send(InstallEvent {
            browser: kind,
            phase,
            progress,
            message: message.into(),
            timestamp: Utc::now(),
        });
    }

    async fn run_install(self: Arc<Self>, kind: BrowserKind) -> Result<BrowserInstallState, String> {
        info!(browser = %kind, "installing browser engine");
        self.update(kind, |s| {
            s.install_in_progress = true;
            s.last_error = None;
        });
        self.emit(kind, InstallPhase::Starting, Some(0), format!("Installing {}", kind));

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let install = self.installer.install(kind, tx);
        let report = async {
            let mut tracker = ProgressTracker::default();
            while let Some(line) = rx.recv().await {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                let (phase, progress) = tracker.observe(&line);
                self.emit(kind, phase, Some(progress), line);
            }
        };
        let (result, ()) = tokio::join!(install, report);

        let result = match result {
            Ok(()) => {
                self.emit(kind, InstallPhase::Verifying, Some(SYNTHETIC_PROGRESS_CAP), "Verifying installation");
                match self.installer.probe(kind).await {
                    Ok(Some(path)) => Ok(path),
                    Ok(None) => Err(format!("{} executable not found after install", kind)),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };

        let outcome = match result {
            Ok(path) => {
                info!(browser = %kind, path = %path.display(), "browser engine installed");
                self.update(kind, |s| {
                    s.installed = true;
                    s.install_in_progress = false;
                    s.executable_path = Some(path);
                    s.last_error = None;
                });
                self.emit(kind, InstallPhase::Completed, Some(100), format!("{} installed", kind));
                let state = self.snapshot_locked(kind);
                Ok(state)
            }
            Err(e) => {
                warn!(browser = %kind, error = %e, "browser engine install failed");
                self.update(kind, |s| {
                    s.install_in_progress = false;
                    s.last_error = Some(e.clone());
                });
                self.emit(kind, InstallPhase::Failed, None, e.clone());
                Err(e)
            }
        };

        self.in_flight.lock().remove(&kind);
        outcome
    }

    /// State as recorded, without consulting the in-flight table
    fn snapshot_locked(&self, kind: BrowserKind) -> BrowserInstallState {
        self.states
            .lock()
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| BrowserInstallState::new(kind))
    }
}

/// Turns installer output into phases and a percentage that never goes
/// backwards unless the installer reports one explicitly
#[derive(Debug)]
pub struct ProgressTracker {
    phase: InstallPhase,
    progress: u8,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self {
            phase: InstallPhase::Starting,
            progress: 0,
        }
    }
}

impl ProgressTracker {
    pub fn observe(&mut self, line: &str) -> (InstallPhase, u8) {
        if let Some(phase) = phase_for_line(line) {
            self.phase = phase;
        }

        let explicit = PERCENT
            .captures(line)
            .and_then(|caps| caps[1].parse::<u8>().ok())
            .filter(|p| *p <= 100);

        let progress = match explicit {
            Some(p) => p,
            None => (self.progress + 1).max(phase_floor(self.phase)).min(SYNTHETIC_PROGRESS_CAP),
        };
        self.progress = self.progress.max(progress.min(SYNTHETIC_PROGRESS_CAP));
        (self.phase, progress)
    }
}

fn phase_for_line(line: &str) -> Option<InstallPhase> {
    let lower = line.to_lowercase();
    if lower.contains("download") {
        Some(InstallPhase::Downloading)
    } else if lower.contains("install") || lower.contains("extract") || lower.contains("unzip") {
        Some(InstallPhase::Installing)
    } else if lower.contains("verif") || lower.contains("validat") {
        Some(InstallPhase::Verifying)
    } else {
        None
    }
}

fn phase_floor(phase: InstallPhase) -> u8 {
    match phase {
        InstallPhase::Starting => 0,
        InstallPhase::Downloading => 5,
        InstallPhase::Installing => 60,
        InstallPhase::Verifying => 85,
        InstallPhase::Completed => 100,
        InstallPhase::Failed => 0,
    }
}
