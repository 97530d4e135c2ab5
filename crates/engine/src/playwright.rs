//! Playwright browser automation
//!
//! Each launched browser is backed by one long-lived Node.js process running
//! an embedded bridge script. Requests and replies are line-delimited JSON
//! over the child's stdin and stdout:
//!
//! ```text
//! -> {"id": 7, "cmd": "click", "args": {"pageId": "page-1", "locator": {...}, "timeout": 5000}}
//! <- {"id": 7, "ok": true, "result": null}
//! <- {"event": "response", "pageId": "page-1", "url": "...", "method": "GET", "status": 200}
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use stepwise_common::{BrowserKind, DialogResponse};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::driver::{
    Browser, DriverError, DriverResult, EventOutcome, EventWait, LaunchOptions, Locator, Page, PendingEvent,
    CLOSED_MESSAGE,
};
use crate::runtime::{BrowserLauncher, EngineInstaller};
use crate::url_pattern::UrlPattern;

const BRIDGE_SCRIPT: &str = include_str!("../assets/bridge.cjs");

/// Extra time the bridge gets to report its own timeout before we give up
const REPLY_GRACE_MS: u64 = 2_000;
const LAUNCH_TIMEOUT_MS: u64 = 60_000;
const SHORT_CALL_TIMEOUT_MS: u64 = 10_000;
const GRACEFUL_CLOSE_MS: u64 = 1_000;
const RESPONSE_CHANNEL_CAPACITY: usize = 512;

/// How to reach Node.js and the `playwright` package
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub node_binary: String,
    pub npx_binary: String,
    pub node_path: Option<PathBuf>,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            node_binary: "node".to_string(),
            npx_binary: "npx".to_string(),
            node_path: None,
        }
    }
}

impl NodeSettings {
    fn command(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        if let Some(node_path) = &self.node_path {
            cmd.env("NODE_PATH", node_path);
        }
        cmd
    }
}

// ============================================================================
// Bridge process
// ============================================================================

type Reply = Result<Value, String>;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseNotice {
    page_id: String,
    url: String,
    method: String,
    status: u16,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Incoming {
    Reply {
        id: u64,
        ok: bool,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        error: Option<String>,
    },
    Event {
        event: String,
        #[serde(flatten)]
        body: Value,
    },
}

struct Bridge {
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>,
    next_id: AtomicU64,
    responses: broadcast::Sender<ResponseNotice>,
    shutdown: CancellationToken,
}

impl Bridge {
    async fn spawn(settings: &NodeSettings) -> DriverResult<Arc<Self>> {
        let mut child = settings
            .command(&settings.node_binary)
            .arg("-e")
            .arg(BRIDGE_SCRIPT)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DriverError::Launch(format!("failed to start {}: {}", settings.node_binary, e)))?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DriverError::Launch("bridge stdout unavailable".to_string()))?;
        let stderr = child.stderr.take();

        let (responses, _) = broadcast::channel(RESPONSE_CHANNEL_CAPACITY);
        let bridge = Arc::new(Self {
            stdin: tokio::sync::Mutex::new(stdin),
            child: Mutex::new(Some(child)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            responses,
            shutdown: CancellationToken::new(),
        });

        // The reader must not keep the bridge alive: dropping the last handle
        // drops the child, and kill_on_drop ends the process.
        let reader = Arc::downgrade(&bridge);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match reader.upgrade() {
                    Some(bridge) => bridge.dispatch(&line),
                    None => return,
                }
            }
            debug!("bridge stdout closed");
            if let Some(bridge) = reader.upgrade() {
                bridge.mark_closed();
            }
        });

        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "stepwise::bridge", "{}", line);
                }
            });
        }

        Ok(bridge)
    }

    fn dispatch(&self, line: &str) {
        match serde_json::from_str::<Incoming>(line) {
            Ok(Incoming::Reply { id, ok, result, error }) => {
                if let Some(tx) = self.pending.lock().remove(&id) {
                    let reply = if ok {
                        Ok(result)
                    } else {
                        Err(error.unwrap_or_else(|| "unknown bridge error".to_string()))
                    };
                    let _ = tx.send(reply);
                }
            }
            Ok(Incoming::Event { event, body }) if event == "response" => {
                if let Ok(notice) = serde_json::from_value::<ResponseNotice>(body) {
                    let _ = self.responses.send(notice);
                }
            }
            Ok(Incoming::Event { event, .. }) => debug!(event = %event, "ignoring bridge event"),
            Err(e) => warn!(error = %e, "malformed bridge output"),
        }
    }

    /// Fail every waiting and future call
    fn mark_closed(&self) {
        self.shutdown.cancel();
        let drained: Vec<_> = self.pending.lock().drain().map(|(_, tx)| tx).collect();
        for tx in drained {
            let _ = tx.send(Err(CLOSED_MESSAGE.to_string()));
        }
    }

    fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    async fn call(&self, cmd: &str, args: Value, timeout_ms: u64) -> DriverResult<Value> {
        if self.is_closed() {
            return Err(DriverError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let mut line = json!({ "id": id, "cmd": cmd, "args": args }).to_string();
        line.push('\n');
        let written = {
            let mut stdin = self.stdin.lock().await;
            match stdin.as_mut() {
                Some(stdin) => match stdin.write_all(line.as_bytes()).await {
                    Ok(()) => stdin.flush().await.is_ok(),
                    Err(_) => false,
                },
                None => false,
            }
        };
        if !written {
            self.pending.lock().remove(&id);
            return Err(DriverError::Closed);
        }

        let wait = Duration::from_millis(timeout_ms.saturating_add(REPLY_GRACE_MS));
        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(backend_error(message)),
            Ok(Err(_)) => Err(DriverError::Closed),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(DriverError::Timeout {
                    action: cmd.to_string(),
                    timeout_ms,
                })
            }
        }
    }

    /// Ask the bridge to close the browser, then kill the process regardless
    async fn shutdown(&self) {
        if self.is_closed() {
            return;
        }
        let graceful = Duration::from_millis(GRACEFUL_CLOSE_MS);
        match tokio::time::timeout(graceful, self.call("close", json!({}), GRACEFUL_CLOSE_MS)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => debug!(error = %e, "graceful bridge close failed"),
            Err(_) => debug!("graceful bridge close timed out"),
        }
        self.stdin.lock().await.take();
        if let Some(mut child) = self.child.lock().take() {
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "bridge process already gone");
            }
        }
        self.mark_closed();
    }
}

fn backend_error(message: String) -> DriverError {
    if message.contains(CLOSED_MESSAGE) {
        DriverError::Closed
    } else {
        DriverError::Backend(message)
    }
}

// ============================================================================
// Browser and page
// ============================================================================

pub struct PlaywrightBrowser {
    bridge: Arc<Bridge>,
    kind: BrowserKind,
}

#[async_trait]
impl Browser for PlaywrightBrowser {
    async fn new_page(&self) -> DriverResult<Arc<dyn Page>> {
        let result = self.bridge.call("newPage", json!({}), SHORT_CALL_TIMEOUT_MS).await?;
        let page_id = result
            .get("pageId")
            .and_then(Value::as_str)
            .ok_or_else(|| DriverError::Backend("bridge returned no page id".to_string()))?
            .to_string();
        debug!(browser = %self.kind, page_id = %page_id, "opened page");
        Ok(Arc::new(PlaywrightPage {
            bridge: self.bridge.clone(),
            page_id,
        }))
    }

    async fn close(&self) {
        info!(browser = %self.kind, "closing browser");
        self.bridge.shutdown().await;
    }
}

impl Drop for PlaywrightBrowser {
    fn drop(&mut self) {
        // Pages can outlive the browser handle and still hold the bridge
        if let Some(mut child) = self.bridge.child.lock().take() {
            let _ = child.start_kill();
        }
    }
}

pub struct PlaywrightPage {
    bridge: Arc<Bridge>,
    page_id: String,
}

impl PlaywrightPage {
    async fn call(&self, cmd: &str, mut args: Value, timeout_ms: u64) -> DriverResult<Value> {
        if let Value::Object(map) = &mut args {
            map.insert("pageId".to_string(), Value::String(self.page_id.clone()));
        }
        self.bridge.call(cmd, args, timeout_ms).await
    }

    fn wait_for_response(
        &self,
        pattern: UrlPattern,
        method: Option<String>,
        status: Option<u16>,
        timeout_ms: u64,
    ) -> PendingEvent {
        let mut rx = self.bridge.responses.subscribe();
        let shutdown = self.bridge.shutdown.clone();
        let page_id = self.page_id.clone();
        let action = format!("waitForResponse \"{}\"", pattern);

        async move {
            let matching = async {
                loop {
                    match rx.recv().await {
                        Ok(notice) => {
                            let matches = notice.page_id == page_id
                                && pattern.matches(&notice.url)
                                && method.as_deref().map_or(true, |m| m.eq_ignore_ascii_case(&notice.method))
                                && status.map_or(true, |s| s == notice.status);
                            if matches {
                                return Ok(EventOutcome::Response {
                                    url: notice.url,
                                    status: notice.status,
                                });
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "response notifications dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => return Err(DriverError::Closed),
                    }
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => Err(DriverError::Closed),
                result = tokio::time::timeout(Duration::from_millis(timeout_ms), matching) => {
                    result.unwrap_or_else(|_| Err(DriverError::Timeout { action, timeout_ms }))
                }
            }
        }
        .boxed()
    }
}

#[async_trait]
impl Page for PlaywrightPage {
    async fn goto(&self, url: &str, timeout_ms: u64) -> DriverResult<()> {
        self.call("goto", json!({ "url": url, "timeout": timeout_ms }), timeout_ms).await?;
        Ok(())
    }

    async fn current_url(&self) -> DriverResult<String> {
        let value = self.call("url", json!({}), SHORT_CALL_TIMEOUT_MS).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn fill(&self, locator: &Locator, value: &str, timeout_ms: u64) -> DriverResult<()> {
        let args = json!({ "locator": locator, "value": value, "timeout": timeout_ms });
        self.call("fill", args, timeout_ms).await?;
        Ok(())
    }

    async fn click(&self, locator: &Locator, timeout_ms: u64) -> DriverResult<()> {
        self.call("click", json!({ "locator": locator, "timeout": timeout_ms }), timeout_ms).await?;
        Ok(())
    }

    async fn type_text(&self, text: &str) -> DriverResult<()> {
        self.call("type", json!({ "text": text }), SHORT_CALL_TIMEOUT_MS).await?;
        Ok(())
    }

    async fn press(&self, locator: Option<&Locator>, key: &str, timeout_ms: u64) -> DriverResult<()> {
        let args = json!({ "locator": locator, "key": key, "timeout": timeout_ms });
        self.call("press", args, timeout_ms).await?;
        Ok(())
    }

    async fn wait_visible(&self, locator: &Locator, timeout_ms: u64) -> DriverResult<()> {
        self.call("waitVisible", json!({ "locator": locator, "timeout": timeout_ms }), timeout_ms).await?;
        Ok(())
    }

    async fn select_option(&self, locator: &Locator, value: &str, timeout_ms: u64) -> DriverResult<()> {
        let args = json!({ "locator": locator, "value": value, "timeout": timeout_ms });
        // The bridge tries by label and then by value, each with the full timeout
        self.call("selectOption", args, timeout_ms.saturating_mul(2)).await?;
        Ok(())
    }

    async fn set_checked(&self, locator: &Locator, checked: bool, timeout_ms: u64) -> DriverResult<()> {
        let args = json!({ "locator": locator, "checked": checked, "timeout": timeout_ms });
        self.call("setChecked", args, timeout_ms).await?;
        Ok(())
    }

    async fn hover(&self, locator: &Locator, timeout_ms: u64) -> DriverResult<()> {
        self.call("hover", json!({ "locator": locator, "timeout": timeout_ms }), timeout_ms).await?;
        Ok(())
    }

    async fn set_input_files(&self, locator: &Locator, files: &[PathBuf], timeout_ms: u64) -> DriverResult<()> {
        let files: Vec<String> = files.iter().map(|f| f.to_string_lossy().into_owned()).collect();
        let args = json!({ "locator": locator, "files": files, "timeout": timeout_ms });
        self.call("setInputFiles", args, timeout_ms).await?;
        Ok(())
    }

    async fn arm_dialog(&self, response: DialogResponse, prompt_text: Option<&str>) -> DriverResult<()> {
        let action = match response {
            DialogResponse::Accept => "accept",
            DialogResponse::Dismiss => "dismiss",
        };
        let args = json!({ "action": action, "promptText": prompt_text });
        self.call("armDialog", args, SHORT_CALL_TIMEOUT_MS).await?;
        Ok(())
    }

    async fn arm_event(&self, wait: EventWait, timeout_ms: u64) -> DriverResult<PendingEvent> {
        match wait {
            EventWait::Response { pattern, method, status } => {
                Ok(self.wait_for_response(pattern, method, status, timeout_ms))
            }
            EventWait::Download { save_dir } => {
                let armed = self
                    .call("armDownload", json!({ "timeout": timeout_ms }), SHORT_CALL_TIMEOUT_MS)
                    .await?;
                let wait_id = armed
                    .get("waitId")
                    .and_then(Value::as_str)
                    .ok_or_else(|| DriverError::Backend("bridge returned no wait id".to_string()))?
                    .to_string();
                let bridge = self.bridge.clone();
                Ok(async move {
                    let args = json!({ "waitId": wait_id, "saveDir": save_dir.to_string_lossy() });
                    let saved = bridge.call("awaitDownload", args, timeout_ms).await?;
                    let path = saved
                        .get("path")
                        .and_then(Value::as_str)
                        .ok_or_else(|| DriverError::Backend("bridge returned no download path".to_string()))?;
                    Ok(EventOutcome::Download {
                        path: PathBuf::from(path),
                    })
                }
                .boxed())
            }
        }
    }

    async fn screenshot(&self, full_page: bool) -> DriverResult<Vec<u8>> {
        let value = self
            .call("screenshot", json!({ "fullPage": full_page }), SHORT_CALL_TIMEOUT_MS * 3)
            .await?;
        let data = value
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| DriverError::Backend("bridge returned no screenshot data".to_string()))?;
        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| DriverError::Backend(format!("invalid screenshot data: {}", e)))
    }
}

// ============================================================================
// Launcher and installer
// ============================================================================

/// Launches browsers through the Playwright bridge
#[derive(Debug, Clone, Default)]
pub struct PlaywrightLauncher {
    settings: NodeSettings,
}

impl PlaywrightLauncher {
    pub fn new(settings: NodeSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl BrowserLauncher for PlaywrightLauncher {
    async fn launch(&self, kind: BrowserKind, options: &LaunchOptions) -> DriverResult<Arc<dyn Browser>> {
        let bridge = Bridge::spawn(&self.settings).await?;
        let args = json!({
            "browser": kind.as_str(),
            "headless": options.headless,
            "executablePath": options.executable_path.as_ref().map(|p| p.to_string_lossy().into_owned()),
            "viewport": { "width": options.viewport_width, "height": options.viewport_height },
        });

        match bridge.call("launch", args, LAUNCH_TIMEOUT_MS).await {
            Ok(info) => {
                debug!(browser = %kind, version = ?info.get("version"), "browser launched");
                Ok(Arc::new(PlaywrightBrowser { bridge, kind }))
            }
            Err(e) => {
                bridge.shutdown().await;
                Err(e)
            }
        }
    }
}

/// Installs engines with `npx playwright install`
#[derive(Debug, Clone, Default)]
pub struct PlaywrightInstaller {
    settings: NodeSettings,
}

impl PlaywrightInstaller {
    pub fn new(settings: NodeSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl EngineInstaller for PlaywrightInstaller {
    async fn probe(&self, kind: BrowserKind) -> Result<Option<PathBuf>, String> {
        let script = format!(
            "process.stdout.write(require('playwright').{}.executablePath())",
            kind.as_str()
        );
        let output = self
            .settings
            .command(&self.settings.node_binary)
            .arg("-e")
            .arg(script)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| format!("failed to run {}: {}", self.settings.node_binary, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let first = stderr.lines().find(|l| !l.trim().is_empty()).unwrap_or("playwright not found");
            return Err(first.trim().to_string());
        }

        let path = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
        Ok(executable_exists(&path).then_some(path))
    }

    async fn install(&self, kind: BrowserKind, output: mpsc::UnboundedSender<String>) -> Result<(), String> {
        info!(browser = %kind, "running playwright install");
        let mut child = self
            .settings
            .command(&self.settings.npx_binary)
            .args(["playwright", "install", kind.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to run `{} playwright install`: {}", self.settings.npx_binary, e))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let last_stderr = Arc::new(Mutex::new(None::<String>));

        let out_tx = output.clone();
        let forward_stdout = async move {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = out_tx.send(line);
                }
            }
        };
        let err_tx = output;
        let last = last_stderr.clone();
        let forward_stderr = async move {
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        *last.lock() = Some(line.trim().to_string());
                    }
                    let _ = err_tx.send(line);
                }
            }
        };

        let (_, _, status) = tokio::join!(forward_stdout, forward_stderr, child.wait());
        let status = status.map_err(|e| e.to_string())?;
        if status.success() {
            return Ok(());
        }

        let detail = last_stderr.lock().take();
        Err(match detail {
            Some(line) => format!("playwright install {} failed ({}): {}", kind, status, line),
            None => format!("playwright install {} failed ({})", kind, status),
        })
    }
}

fn executable_exists(path: &Path) -> bool {
    !path.as_os_str().is_empty() && path.exists()
}
