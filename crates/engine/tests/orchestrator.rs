//! Run orchestration against an in-process fake browser

use std::collections::HashSet;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use stepwise_common::{
    BrowserKind, Database, DialogResponse, RunEvent, RunEventKind, RunStatus, StepStatus, TestCase,
    STEP_DID_NOT_RUN,
};
use stepwise_engine::driver::{DriverResult, EventOutcome, EventWait, PendingEvent};
use stepwise_engine::{
    interpreter, ArtifactStore, Browser, BrowserLauncher, BrowserRuntimeManager, DriverError, EngineError,
    EngineInstaller, LaunchOptions, Locator, Page, RunOrchestrator, RunSettings,
};
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc, Notify};

const BASE_URL: &str = "https://shop.example.com";

fn png() -> Vec<u8> {
    let img = image::DynamicImage::ImageRgba8(image::RgbaImage::new(8, 8));
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageOutputFormat::Png)
        .unwrap();
    buf
}

fn locator_subject(locator: &Locator) -> &str {
    match locator {
        Locator::Label { text } | Locator::Placeholder { text } | Locator::Text { text } => text,
        Locator::Role { name, .. } => name,
        Locator::Css { selector } => selector,
    }
}

/// Finds every element except the ones named in `missing`. Clicks on
/// anything named in `hanging` never finish until the browser closes.
struct FakePage {
    missing: HashSet<String>,
    hanging: HashSet<String>,
    hung: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    visits: Mutex<Vec<String>>,
}

impl FakePage {
    fn check(&self, locator: &Locator, action: &str, timeout_ms: u64) -> DriverResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::Closed);
        }
        let subject = locator_subject(locator);
        if self.missing.iter().any(|m| subject.contains(m.as_str())) {
            return Err(DriverError::Timeout {
                action: action.to_string(),
                timeout_ms,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Page for FakePage {
    async fn goto(&self, url: &str, _timeout_ms: u64) -> DriverResult<()> {
        self.visits.lock().push(url.to_string());
        Ok(())
    }

    async fn current_url(&self) -> DriverResult<String> {
        Ok(self.visits.lock().last().cloned().unwrap_or_default())
    }

    async fn fill(&self, locator: &Locator, _value: &str, timeout_ms: u64) -> DriverResult<()> {
        self.check(locator, "locator.fill", timeout_ms)
    }

    async fn click(&self, locator: &Locator, timeout_ms: u64) -> DriverResult<()> {
        let subject = locator_subject(locator);
        if self.hanging.iter().any(|h| subject.contains(h.as_str())) {
            self.hung.store(true, Ordering::SeqCst);
            while !self.closed.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            return Err(DriverError::Closed);
        }
        self.check(locator, "locator.click", timeout_ms)
    }

    async fn type_text(&self, _text: &str) -> DriverResult<()> {
        Ok(())
    }

    async fn press(&self, locator: Option<&Locator>, _key: &str, timeout_ms: u64) -> DriverResult<()> {
        match locator {
            Some(locator) => self.check(locator, "locator.press", timeout_ms),
            None => Ok(()),
        }
    }

    async fn wait_visible(&self, locator: &Locator, timeout_ms: u64) -> DriverResult<()> {
        self.check(locator, "locator.waitFor", timeout_ms)
    }

    async fn select_option(&self, locator: &Locator, _value: &str, timeout_ms: u64) -> DriverResult<()> {
        self.check(locator, "locator.selectOption", timeout_ms)
    }

    async fn set_checked(&self, locator: &Locator, _checked: bool, timeout_ms: u64) -> DriverResult<()> {
        self.check(locator, "locator.setChecked", timeout_ms)
    }

    async fn hover(&self, locator: &Locator, timeout_ms: u64) -> DriverResult<()> {
        self.check(locator, "locator.hover", timeout_ms)
    }

    async fn set_input_files(&self, locator: &Locator, _files: &[PathBuf], timeout_ms: u64) -> DriverResult<()> {
        self.check(locator, "locator.setInputFiles", timeout_ms)
    }

    async fn arm_dialog(&self, _response: DialogResponse, _prompt_text: Option<&str>) -> DriverResult<()> {
        Ok(())
    }

    async fn arm_event(&self, wait: EventWait, _timeout_ms: u64) -> DriverResult<PendingEvent> {
        let outcome = match wait {
            EventWait::Response { pattern, .. } => EventOutcome::Response {
                url: format!("{}/{}", BASE_URL, pattern.as_str()),
                status: 200,
            },
            EventWait::Download { save_dir } => EventOutcome::Download {
                path: save_dir.join("report.csv"),
            },
        };
        Ok(futures::future::ready(Ok(outcome)).boxed())
    }

    async fn screenshot(&self, _full_page: bool) -> DriverResult<Vec<u8>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::Closed);
        }
        Ok(png())
    }
}

struct FakeBrowser {
    page: Arc<FakePage>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Browser for FakeBrowser {
    async fn new_page(&self) -> DriverResult<Arc<dyn Page>> {
        Ok(self.page.clone())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct FakeLauncher {
    missing: HashSet<String>,
    hanging: HashSet<String>,
    hung: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    fail: bool,
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    async fn launch(&self, _kind: BrowserKind, _options: &LaunchOptions) -> DriverResult<Arc<dyn Browser>> {
        if self.fail {
            return Err(DriverError::Launch("browser crashed on startup".into()));
        }
        let page = Arc::new(FakePage {
            missing: self.missing.clone(),
            hanging: self.hanging.clone(),
            hung: self.hung.clone(),
            closed: self.closed.clone(),
            visits: Mutex::new(Vec::new()),
        });
        Ok(Arc::new(FakeBrowser {
            page,
            closed: self.closed.clone(),
        }))
    }
}

/// Reports the engine as installed unless gated, in which case install
/// blocks until the gate opens
struct FakeInstaller {
    gated: bool,
    gate: Notify,
    installs: AtomicUsize,
}

#[async_trait]
impl EngineInstaller for FakeInstaller {
    async fn probe(&self, _kind: BrowserKind) -> Result<Option<PathBuf>, String> {
        if self.gated {
            Ok(None)
        } else {
            Ok(Some(PathBuf::from("/opt/browsers/chromium")))
        }
    }

    async fn install(&self, _kind: BrowserKind, output: mpsc::UnboundedSender<String>) -> Result<(), String> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        output.send("Downloading Chromium".into()).ok();
        self.gate.notified().await;
        Ok(())
    }
}

struct Harness {
    orchestrator: RunOrchestrator,
    db: Database,
    installer: Arc<FakeInstaller>,
    browser_closed: Arc<AtomicBool>,
    hung: Arc<AtomicBool>,
    _dir: TempDir,
}

#[derive(Default)]
struct Options {
    missing: &'static [&'static str],
    hanging: &'static [&'static str],
    gated_install: bool,
    failing_launch: bool,
    continue_on_failure: bool,
}

fn harness(options: Options) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_memory().unwrap();
    let artifacts = ArtifactStore::new(dir.path().join("artifacts")).unwrap();
    let installer = Arc::new(FakeInstaller {
        gated: options.gated_install,
        gate: Notify::new(),
        installs: AtomicUsize::new(0),
    });
    let browser_closed = Arc::new(AtomicBool::new(false));
    let hung = Arc::new(AtomicBool::new(false));
    let launcher = Arc::new(FakeLauncher {
        missing: options.missing.iter().map(|s| s.to_string()).collect(),
        hanging: options.hanging.iter().map(|s| s.to_string()).collect(),
        hung: hung.clone(),
        closed: browser_closed.clone(),
        fail: options.failing_launch,
    });
    let runtime = BrowserRuntimeManager::new(installer.clone(), launcher, LaunchOptions::default());
    let settings = RunSettings {
        step_timeout_ms: 500,
        navigation_timeout_ms: 1_000,
        continue_on_failure: options.continue_on_failure,
    };
    Harness {
        orchestrator: RunOrchestrator::new(db.clone(), runtime, artifacts, settings),
        db,
        installer,
        browser_closed,
        hung,
        _dir: dir,
    }
}

fn seed(db: &Database, steps: &[&str]) -> TestCase {
    let project = db.create_project("Shop", BASE_URL).unwrap();
    let test_case = db.create_test_case(&project.id, "Checkout").unwrap();
    for raw in steps {
        let action = interpreter::parse(raw).unwrap();
        db.add_step(&test_case.id, raw, &action).unwrap();
    }
    test_case
}

async fn collect_until_finished(events: &mut broadcast::Receiver<RunEvent>) -> Vec<RunEvent> {
    tokio::time::timeout(Duration::from_secs(5), async {
        let mut seen = Vec::new();
        loop {
            let event = events.recv().await.unwrap();
            let terminal = event.is_terminal();
            seen.push(event);
            if terminal {
                return seen;
            }
        }
    })
    .await
    .expect("run did not finish")
}

async fn wait_idle(orchestrator: &RunOrchestrator) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while orchestrator.active_context().unwrap().is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("run slot was not released");
}

#[tokio::test]
async fn test_all_steps_pass() {
    let h = harness(Options::default());
    let tc = seed(
        &h.db,
        &[r#"Enter "jane@example.com" in "Email" field"#, r#"Click "Place order" button"#],
    );
    let mut events = h.orchestrator.subscribe();

    let run = h.orchestrator.start(&tc.id, BrowserKind::Chromium).await.unwrap();
    assert_eq!(run.status, RunStatus::Running);

    let seen = collect_until_finished(&mut events).await;
    let names: Vec<&str> = seen.iter().map(|e| e.name()).collect();
    assert_eq!(
        names,
        vec![
            "run-started",
            "step-started",
            "step-finished",
            "step-started",
            "step-finished",
            "run-finished"
        ]
    );
    assert!(seen.iter().all(|e| e.run_id == run.id));

    wait_idle(&h.orchestrator).await;
    assert!(h.browser_closed.load(Ordering::SeqCst));

    let finished = h.orchestrator.status(&run.id).unwrap();
    assert_eq!(finished.status, RunStatus::Passed);
    assert!(finished.ended_at.is_some());

    let results = h.orchestrator.step_results(&run.id).unwrap();
    assert_eq!(results.len(), 2);
    for result in &results {
        assert_eq!(result.status, StepStatus::Passed);
        let shot = result.screenshot_path.as_deref().unwrap();
        let bytes = h.orchestrator.read_screenshot(Path::new(shot)).unwrap();
        assert_eq!(&bytes[..4], b"\x89PNG");
        assert!(h.orchestrator.read_thumbnail(Path::new(shot)).is_ok());
    }

    assert_eq!(h.orchestrator.history(&tc.id).unwrap().len(), 1);
}

#[tokio::test]
async fn test_failure_stops_remaining_steps() {
    let h = harness(Options {
        missing: &["Ghost"],
        ..Default::default()
    });
    let tc = seed(&h.db, &[r#"Click "Ghost" button"#, r#"Click "Place order" button"#]);
    let mut events = h.orchestrator.subscribe();

    let run = h.orchestrator.start(&tc.id, BrowserKind::Chromium).await.unwrap();
    collect_until_finished(&mut events).await;
    wait_idle(&h.orchestrator).await;

    assert_eq!(h.orchestrator.status(&run.id).unwrap().status, RunStatus::Failed);
    let results = h.orchestrator.step_results(&run.id).unwrap();
    assert_eq!(results[0].status, StepStatus::Failed);
    assert!(results[0]
        .error_text
        .as_deref()
        .unwrap()
        .starts_with("Could not find \"Ghost\" on the page"));
    assert!(results[0].screenshot_path.is_some());
    assert_eq!(results[1].status, StepStatus::Cancelled);
    assert_eq!(results[1].error_text.as_deref(), Some(STEP_DID_NOT_RUN));
}

#[tokio::test]
async fn test_continue_on_failure_runs_every_step() {
    let h = harness(Options {
        missing: &["Ghost"],
        continue_on_failure: true,
        ..Default::default()
    });
    let tc = seed(&h.db, &[r#"Click "Ghost" button"#, r#"Click "Place order" button"#]);
    let mut events = h.orchestrator.subscribe();

    let run = h.orchestrator.start(&tc.id, BrowserKind::Chromium).await.unwrap();
    let seen = collect_until_finished(&mut events).await;
    wait_idle(&h.orchestrator).await;

    let results = h.orchestrator.step_results(&run.id).unwrap();
    assert_eq!(results[0].status, StepStatus::Failed);
    assert_eq!(results[1].status, StepStatus::Passed);
    assert_eq!(h.orchestrator.status(&run.id).unwrap().status, RunStatus::Failed);

    let last = serde_json::to_value(seen.last().unwrap()).unwrap();
    assert_eq!(last["runStatus"], "failed");
    assert_eq!(last["message"], "1 of 2 step(s) failed.");
}

#[tokio::test]
async fn test_second_start_is_rejected_while_running() {
    let h = harness(Options {
        gated_install: true,
        ..Default::default()
    });
    let tc = seed(&h.db, &["Go to /cart"]);

    let run = h.orchestrator.start(&tc.id, BrowserKind::Chromium).await.unwrap();
    let err = h.orchestrator.start(&tc.id, BrowserKind::Chromium).await.unwrap_err();
    assert!(matches!(err, EngineError::RunInProgress));

    let active = h.orchestrator.active_context().unwrap().unwrap();
    assert_eq!(active.run_id, run.id);
    assert_eq!(active.test_case_id, tc.id);

    assert!(h.orchestrator.cancel(&run.id).await);
}

#[tokio::test]
async fn test_cancel_during_install() {
    let h = harness(Options {
        gated_install: true,
        ..Default::default()
    });
    let tc = seed(&h.db, &["Go to /cart", r#"Click "Checkout" button"#]);
    let mut events = h.orchestrator.subscribe();

    let run = h.orchestrator.start(&tc.id, BrowserKind::Chromium).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.installer.installs.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert!(!h.orchestrator.cancel("some-other-run").await);
    assert!(h.orchestrator.cancel(&run.id).await);
    assert!(!h.orchestrator.cancel(&run.id).await);

    let seen = collect_until_finished(&mut events).await;
    let last = serde_json::to_value(seen.last().unwrap()).unwrap();
    assert_eq!(last["runStatus"], "cancelled");
    assert_eq!(last["message"], "Run cancelled.");

    assert_eq!(h.orchestrator.status(&run.id).unwrap().status, RunStatus::Cancelled);
    for result in h.orchestrator.step_results(&run.id).unwrap() {
        assert_eq!(result.status, StepStatus::Cancelled);
        assert_eq!(result.error_text.as_deref(), Some(STEP_DID_NOT_RUN));
    }
    assert!(h.orchestrator.active_context().unwrap().is_none());

    // A new run can start once the slot is free
    let next = h.orchestrator.start(&tc.id, BrowserKind::Chromium).await.unwrap();
    assert!(h.orchestrator.cancel(&next.id).await);
}

#[tokio::test]
async fn test_cancel_during_step_leaves_no_failure() {
    let h = harness(Options {
        hanging: &["Frozen"],
        ..Default::default()
    });
    let tc = seed(
        &h.db,
        &["Go to /cart", r#"Click "Frozen" button"#, r#"Click "Checkout" button"#],
    );
    let mut events = h.orchestrator.subscribe();

    let run = h.orchestrator.start(&tc.id, BrowserKind::Chromium).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !h.hung.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert!(h.orchestrator.cancel(&run.id).await);
    let seen = collect_until_finished(&mut events).await;
    assert!(h.browser_closed.load(Ordering::SeqCst));

    // Give the run task time to observe the abort
    tokio::time::sleep(Duration::from_millis(100)).await;

    for event in &seen {
        if let RunEventKind::StepFinished { step_status, .. } = &event.kind {
            assert_ne!(*step_status, StepStatus::Failed);
        }
    }
    let last = serde_json::to_value(seen.last().unwrap()).unwrap();
    assert_eq!(last["runStatus"], "cancelled");

    assert_eq!(h.orchestrator.status(&run.id).unwrap().status, RunStatus::Cancelled);
    let results = h.orchestrator.step_results(&run.id).unwrap();
    assert_eq!(results[0].status, StepStatus::Passed);
    for result in &results[1..] {
        assert_eq!(result.status, StepStatus::Cancelled);
        assert_eq!(result.error_text.as_deref(), Some(STEP_DID_NOT_RUN));
        assert!(result.screenshot_path.is_none());
    }
}

#[tokio::test]
async fn test_launch_failure_fails_first_step() {
    let h = harness(Options {
        failing_launch: true,
        ..Default::default()
    });
    let tc = seed(&h.db, &["Go to /cart", r#"Click "Checkout" button"#]);
    let mut events = h.orchestrator.subscribe();

    let run = h.orchestrator.start(&tc.id, BrowserKind::Firefox).await.unwrap();
    let seen = collect_until_finished(&mut events).await;
    wait_idle(&h.orchestrator).await;

    assert_eq!(h.orchestrator.status(&run.id).unwrap().status, RunStatus::Failed);
    let results = h.orchestrator.step_results(&run.id).unwrap();
    assert_eq!(results[0].status, StepStatus::Failed);
    assert!(results[0].error_text.is_some());
    assert_eq!(results[1].status, StepStatus::Cancelled);

    let last = serde_json::to_value(seen.last().unwrap()).unwrap();
    assert!(last["message"].as_str().unwrap().starts_with("Run failed: "));
}

#[tokio::test]
async fn test_start_validation() {
    let h = harness(Options::default());

    let err = h.orchestrator.start("missing", BrowserKind::Chromium).await.unwrap_err();
    assert!(matches!(err, EngineError::Store(_)));

    let empty = seed(&h.db, &[]);
    let err = h.orchestrator.start(&empty.id, BrowserKind::Chromium).await.unwrap_err();
    assert!(matches!(err, EngineError::NoSteps(_)));
    assert!(h.orchestrator.active_context().unwrap().is_none());
}

#[tokio::test]
async fn test_screenshot_paths_are_confined() {
    let h = harness(Options::default());
    let err = h
        .orchestrator
        .read_screenshot(Path::new("../../etc/passwd"))
        .unwrap_err();
    assert!(matches!(err, EngineError::PathOutsideArtifacts(_)));

    let err = h
        .orchestrator
        .read_screenshot(Path::new("runs/nope/step-1-x.png"))
        .unwrap_err();
    assert!(matches!(err, EngineError::ArtifactNotFound(_)));
}
