//! Run orchestration
//!
//! Drives one run at a time from start to a terminal status:
//!
//! ```text
//! start ──► install ──► launch ──► open base URL ──► steps ──► finalize
//!   │                                                  │
//!   └──────────────────── cancel ──────────────────────┘
//! ```
//!
//! The active run lives in a single-slot register claimed at start. Whichever
//! of cancel and finalize flips the run's `finalized` flag first writes the
//! terminal status; the other backs off.

use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use stepwise_common::{
    now_millis, Action, ActiveRunInfo, BrowserKind, Database, Run, RunContext, RunEvent, RunEventKind, RunStatus,
    Step, StepResult, StepStatus,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::artifacts::ArtifactStore;
use crate::classify::{classify_failure, is_abort};
use crate::config::{EngineConfig, RunSettings};
use crate::driver::{Browser, Page};
use crate::error::{EngineError, EngineResult};
use crate::events::{EventHub, RunEmitter};
use crate::executor::ActionExecutor;
use crate::interpreter;
use crate::playwright::{PlaywrightInstaller, PlaywrightLauncher};
use crate::runtime::BrowserRuntimeManager;

/// A stored step together with the action it will execute as
#[derive(Debug, Clone)]
pub struct ExecutionStep {
    pub step: Step,
    pub action: Action,
}

struct ActiveRun {
    run_id: String,
    test_case_id: String,
    browser_kind: BrowserKind,
    started_at: i64,
    token: CancellationToken,
    finalized: AtomicBool,
    browser: Mutex<Option<Arc<dyn Browser>>>,
    emitter: RunEmitter,
}

impl ActiveRun {
    fn info(&self) -> ActiveRunInfo {
        ActiveRunInfo {
            run_id: self.run_id.clone(),
            test_case_id: self.test_case_id.clone(),
            browser: self.browser_kind,
            started_at: self.started_at,
        }
    }

    /// Claim the right to write the terminal status
    fn try_finalize(&self) -> bool {
        self.finalized
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    async fn close_browser(&self) {
        let browser = self.browser.lock().take();
        if let Some(browser) = browser {
            browser.close().await;
        }
    }
}

#[derive(Debug, Default)]
struct RunOutcome {
    total: usize,
    failed: usize,
}

/// Runs test cases against a browser, one at a time
#[derive(Clone)]
pub struct RunOrchestrator {
    inner: Arc<OrchestratorInner>,
}

struct OrchestratorInner {
    db: Database,
    runtime: BrowserRuntimeManager,
    artifacts: ArtifactStore,
    executor: ActionExecutor,
    events: EventHub,
    settings: RwLock<RunSettings>,
    active: Mutex<Option<Arc<ActiveRun>>>,
}

impl RunOrchestrator {
    pub fn new(db: Database, runtime: BrowserRuntimeManager, artifacts: ArtifactStore, settings: RunSettings) -> Self {
        let executor = ActionExecutor::new(artifacts.downloads_dir());
        Self {
            inner: Arc::new(OrchestratorInner {
                db,
                runtime,
                artifacts,
                executor,
                events: EventHub::default(),
                settings: RwLock::new(settings),
                active: Mutex::new(None),
            }),
        }
    }

    /// Open the store and artifacts root and drive browsers through Playwright
    pub fn from_config(config: &EngineConfig) -> EngineResult<Self> {
        let db = Database::open(config.db_path())?;
        let artifacts = ArtifactStore::new(config.artifacts_dir())?;
        let node = config.browser.node_settings();
        let runtime = BrowserRuntimeManager::new(
            Arc::new(PlaywrightInstaller::new(node.clone())),
            Arc::new(PlaywrightLauncher::new(node)),
            config.browser.launch_options(),
        );
        Ok(Self::new(db, runtime, artifacts, config.run_settings()))
    }

    pub fn db(&self) -> &Database {
        &self.inner.db
    }

    /// Lifecycle events for every run. Drop the receiver to unsubscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.inner.events.subscribe()
    }

    pub fn runtime(&self) -> &BrowserRuntimeManager {
        &self.inner.runtime
    }

    pub fn settings(&self) -> RunSettings {
        self.inner.settings.read().clone()
    }

    /// Applies to runs started after this call
    pub fn update_settings(&self, settings: RunSettings) {
        *self.inner.settings.write() = settings;
    }

    /// Start a run of a test case. Returns as soon as the run is recorded;
    /// execution continues in the background.
    pub async fn start(&self, test_case_id: &str, browser: BrowserKind) -> EngineResult<Run> {
        let inner = &self.inner;
        if inner.active.lock().is_some() {
            return Err(EngineError::RunInProgress);
        }

        let context = inner
            .db
            .run_context(test_case_id)?
            .ok_or_else(|| EngineError::not_found("test case", test_case_id))?;
        let steps = execution_steps(inner.db.list_steps(test_case_id)?)?;
        if steps.is_empty() {
            return Err(EngineError::NoSteps(test_case_id.to_string()));
        }

        let run_id = stepwise_common::new_id();
        let active = Arc::new(ActiveRun {
            run_id: run_id.clone(),
            test_case_id: test_case_id.to_string(),
            browser_kind: browser,
            started_at: now_millis(),
            token: CancellationToken::new(),
            finalized: AtomicBool::new(false),
            browser: Mutex::new(None),
            emitter: inner.events.emitter(run_id.clone()),
        });
        inner.claim(active.clone())?;

        let step_ids: Vec<String> = steps.iter().map(|s| s.step.id.clone()).collect();
        let run = match inner.db.create_run_with_results(&run_id, test_case_id, browser, &step_ids) {
            Ok(run) => run,
            Err(e) => {
                inner.release(&run_id);
                return Err(e.into());
            }
        };

        info!(
            run_id = %run_id,
            test_case = %context.test_title,
            project = %context.project_name,
            browser = %browser,
            steps = steps.len(),
            "run started"
        );
        active.emitter.emit(RunEventKind::RunStarted {
            test_case_id: test_case_id.to_string(),
            browser,
        });

        let settings = inner.settings.read().clone();
        let task_inner = inner.clone();
        tokio::spawn(async move {
            let outcome = task_inner.execute(&active, &context, &steps, &settings).await;
            task_inner.finalize(&active, outcome).await;
        });

        Ok(run)
    }

    /// Cancel the active run. Returns false unless `run_id` is the active run
    /// and this call got to finalize it.
    pub async fn cancel(&self, run_id: &str) -> bool {
        let inner = &self.inner;
        let active = match inner.active.lock().as_ref() {
            Some(active) if active.run_id == run_id => active.clone(),
            _ => return false,
        };

        active.token.cancel();
        if !active.try_finalize() {
            debug!(run_id = %run_id, "run already finalized");
            return false;
        }

        info!(run_id = %run_id, "cancelling run");
        active.close_browser().await;

        if let Err(e) = inner.db.finish_run(run_id, RunStatus::Cancelled) {
            error!(run_id = %run_id, error = %e, "failed to mark run cancelled");
        }
        if let Err(e) = inner.db.cancel_pending_results(run_id) {
            error!(run_id = %run_id, error = %e, "failed to cancel pending results");
        }
        active.emitter.emit(RunEventKind::RunFinished {
            run_status: RunStatus::Cancelled,
            message: "Run cancelled.".to_string(),
        });
        inner.release(run_id);
        true
    }

    pub fn status(&self, run_id: &str) -> EngineResult<Run> {
        self.inner
            .db
            .get_run(run_id)?
            .ok_or_else(|| EngineError::not_found("run", run_id))
    }

    /// Runs of a test case, oldest first
    pub fn history(&self, test_case_id: &str) -> EngineResult<Vec<Run>> {
        Ok(self.inner.db.list_runs_for_test_case(test_case_id)?)
    }

    pub fn step_results(&self, run_id: &str) -> EngineResult<Vec<StepResult>> {
        Ok(self.inner.db.list_step_results(run_id)?)
    }

    /// The run executing right now.
    ///
    /// Without an in-memory run this falls back to any run the store still
    /// marks as running, which after a crash may be a run nobody executes.
    pub fn active_context(&self) -> EngineResult<Option<ActiveRunInfo>> {
        if let Some(active) = self.inner.active.lock().as_ref() {
            return Ok(Some(active.info()));
        }
        Ok(self.inner.db.find_running_run()?.map(|run| ActiveRunInfo {
            run_id: run.id,
            test_case_id: run.test_case_id,
            browser: run.browser,
            started_at: run.started_at,
        }))
    }

    pub fn read_screenshot(&self, path: &Path) -> EngineResult<Vec<u8>> {
        self.inner.artifacts.read_screenshot(path)
    }

    pub fn read_thumbnail(&self, path: &Path) -> EngineResult<Vec<u8>> {
        self.inner.artifacts.read_thumbnail(path)
    }
}

/// Re-derive each stored step's action from its text
fn execution_steps(steps: Vec<Step>) -> EngineResult<Vec<ExecutionStep>> {
    steps
        .into_iter()
        .map(|step| {
            let action = interpreter::resolve_for_execution(&step.raw_text, Some(&step.action))
                .map_err(|source| EngineError::InvalidStep {
                    order: step.step_order,
                    source,
                })?;
            Ok(ExecutionStep { step, action })
        })
        .collect()
}

async fn cancellable<T>(token: &CancellationToken, work: impl Future<Output = EngineResult<T>>) -> EngineResult<T> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(EngineError::Cancelled),
        result = work => result,
    }
}

impl OrchestratorInner {
    /// Compare-and-set on the active slot
    fn claim(&self, run: Arc<ActiveRun>) -> EngineResult<()> {
        let mut slot = self.active.lock();
        if slot.is_some() {
            return Err(EngineError::RunInProgress);
        }
        *slot = Some(run);
        Ok(())
    }

    fn release(&self, run_id: &str) {
        let mut slot = self.active.lock();
        if slot.as_ref().map_or(false, |active| active.run_id == run_id) {
            *slot = None;
        }
    }

    async fn execute(
        &self,
        active: &ActiveRun,
        context: &RunContext,
        steps: &[ExecutionStep],
        settings: &RunSettings,
    ) -> EngineResult<RunOutcome> {
        let page = match self.open_page(active, context, settings).await {
            Ok(page) => page,
            Err(e) => {
                if !active.token.is_cancelled() {
                    self.fail_setup(active, steps, &e)?;
                }
                return Err(e);
            }
        };

        let mut outcome = RunOutcome {
            total: steps.len(),
            failed: 0,
        };

        for exec in steps {
            if active.token.is_cancelled() {
                return Ok(outcome);
            }
            let step = &exec.step;
            active.emitter.emit(RunEventKind::StepStarted {
                step_id: step.id.clone(),
                step_order: step.step_order,
            });
            debug!(run_id = %active.run_id, step_order = step.step_order, action = exec.action.kind(), "executing step");

            let result = cancellable(
                &active.token,
                self.executor
                    .execute(page.as_ref(), &exec.action, settings.step_timeout_ms, &context.base_url),
            )
            .await;

            match result {
                Ok(()) => {
                    let screenshot = self.capture(active, step, page.as_ref()).await;
                    self.db.update_step_result(
                        &active.run_id,
                        &step.id,
                        StepStatus::Passed,
                        None,
                        screenshot.as_deref(),
                    )?;
                    self.step_finished(active, step, StepStatus::Passed, None);
                }
                Err(_) if active.token.is_cancelled() => {
                    debug!(run_id = %active.run_id, step_order = step.step_order, "step aborted by cancellation");
                    return Ok(outcome);
                }
                Err(e) => {
                    let failure = classify_failure(&e, exec.action.target_text(), active.browser_kind);
                    warn!(
                        run_id = %active.run_id,
                        step_order = step.step_order,
                        error = %e,
                        "step failed"
                    );
                    outcome.failed += 1;

                    let screenshot = self.capture(active, step, page.as_ref()).await;
                    self.db.update_step_result(
                        &active.run_id,
                        &step.id,
                        StepStatus::Failed,
                        Some(&failure.message),
                        screenshot.as_deref(),
                    )?;
                    self.step_finished(active, step, StepStatus::Failed, Some(failure.message));

                    if !settings.continue_on_failure {
                        let skipped = self.db.cancel_pending_results(&active.run_id)?;
                        debug!(run_id = %active.run_id, skipped, "stopping after failure");
                        break;
                    }
                }
            }
        }

        Ok(outcome)
    }

    /// Install, launch and open the project base URL
    async fn open_page(
        &self,
        active: &ActiveRun,
        context: &RunContext,
        settings: &RunSettings,
    ) -> EngineResult<Arc<dyn Page>> {
        let token = &active.token;
        let kind = active.browser_kind;

        cancellable(token, self.runtime.ensure_installed(kind)).await?;
        let browser = cancellable(token, self.runtime.launch(kind)).await?;

        *active.browser.lock() = Some(browser.clone());
        // A cancel that ran before the browser was registered could not close it
        if token.is_cancelled() {
            active.close_browser().await;
            return Err(EngineError::Cancelled);
        }

        let page = cancellable(token, async { Ok(browser.new_page().await?) }).await?;
        info!(run_id = %active.run_id, url = %context.base_url, "opening base URL");
        cancellable(token, async {
            Ok(page.goto(&context.base_url, settings.navigation_timeout_ms).await?)
        })
        .await?;
        Ok(page)
    }

    /// Record a setup failure against the first step and skip the rest
    fn fail_setup(&self, active: &ActiveRun, steps: &[ExecutionStep], err: &EngineError) -> EngineResult<()> {
        let failure = classify_failure(err, None, active.browser_kind);
        error!(run_id = %active.run_id, error = %err, "run setup failed");

        if let Some(first) = steps.first() {
            self.db.update_step_result(
                &active.run_id,
                &first.step.id,
                StepStatus::Failed,
                Some(&failure.message),
                None,
            )?;
            self.step_finished(active, &first.step, StepStatus::Failed, Some(failure.message));
        }
        self.db.cancel_pending_results(&active.run_id)?;
        Ok(())
    }

    fn step_finished(&self, active: &ActiveRun, step: &Step, status: StepStatus, message: Option<String>) {
        let step_result = match self.db.get_step_result(&active.run_id, &step.id) {
            Ok(result) => result,
            Err(e) => {
                warn!(run_id = %active.run_id, error = %e, "failed to load step result");
                None
            }
        };
        active.emitter.emit(RunEventKind::StepFinished {
            step_id: step.id.clone(),
            step_order: step.step_order,
            step_status: status,
            step_result,
            message,
        });
    }

    /// Best-effort screenshot. Failures are logged and never replace the
    /// step outcome.
    async fn capture(&self, active: &ActiveRun, step: &Step, page: &dyn Page) -> Option<String> {
        let png = match page.screenshot(true).await {
            Ok(png) => png,
            Err(e) => {
                warn!(run_id = %active.run_id, step_order = step.step_order, error = %e, "screenshot failed");
                return None;
            }
        };

        let artifacts = self.artifacts.clone();
        let run_id = active.run_id.clone();
        let step_id = step.id.clone();
        let step_order = step.step_order;
        let saved =
            tokio::task::spawn_blocking(move || artifacts.save_screenshot(&run_id, step_order, &step_id, &png)).await;

        match saved {
            Ok(Ok(path)) => Some(path.to_string_lossy().into_owned()),
            Ok(Err(e)) => {
                warn!(run_id = %active.run_id, error = %e, "failed to store screenshot");
                None
            }
            Err(e) => {
                warn!(run_id = %active.run_id, error = %e, "screenshot task failed");
                None
            }
        }
    }

    async fn finalize(&self, active: &ActiveRun, outcome: EngineResult<RunOutcome>) {
        if !active.try_finalize() {
            debug!(run_id = %active.run_id, "finalize skipped, run was cancelled");
            active.close_browser().await;
            return;
        }

        let (status, message) = match &outcome {
            Ok(outcome) if outcome.failed == 0 => (
                RunStatus::Passed,
                format!("All {} step(s) passed.", outcome.total),
            ),
            Ok(outcome) => (
                RunStatus::Failed,
                format!("{} of {} step(s) failed.", outcome.failed, outcome.total),
            ),
            Err(e) if is_abort(e) && active.token.is_cancelled() => (RunStatus::Cancelled, "Run cancelled.".to_string()),
            Err(e) => {
                let failure = classify_failure(e, None, active.browser_kind);
                (
                    RunStatus::Failed,
                    format!("Run failed: {}.", failure.message.trim_end_matches('.')),
                )
            }
        };

        if let Err(e) = self.db.finish_run(&active.run_id, status) {
            error!(run_id = %active.run_id, error = %e, "failed to finalize run");
        }
        if let Err(e) = self.db.cancel_pending_results(&active.run_id) {
            error!(run_id = %active.run_id, error = %e, "failed to cancel leftover results");
        }

        info!(run_id = %active.run_id, status = %status, "{}", message);
        active.emitter.emit(RunEventKind::RunFinished {
            run_status: status,
            message,
        });

        active.close_browser().await;
        self.release(&active.run_id);
    }
}
