//! Core types for Stepwise

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::Error;

/// Error text recorded on step results that never got to execute
pub const STEP_DID_NOT_RUN: &str = "Step did not run.";

/// Raw text reported for a step result whose step row no longer exists
pub const MISSING_STEP_TEXT: &str = "(step deleted)";

/// Milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

// ============================================================================
// Browsers
// ============================================================================

/// Browser engines a run can be executed against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserKind {
    Chromium,
    Firefox,
    Webkit,
}

impl BrowserKind {
    pub const ALL: [BrowserKind; 3] = [BrowserKind::Chromium, BrowserKind::Firefox, BrowserKind::Webkit];

    pub fn as_str(&self) -> &'static str {
        match self {
            BrowserKind::Chromium => "chromium",
            BrowserKind::Firefox => "firefox",
            BrowserKind::Webkit => "webkit",
        }
    }
}

impl Default for BrowserKind {
    fn default() -> Self {
        Self::Chromium
    }
}

impl std::fmt::Display for BrowserKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BrowserKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chromium" | "chrome" => Ok(BrowserKind::Chromium),
            "firefox" => Ok(BrowserKind::Firefox),
            "webkit" | "safari" => Ok(BrowserKind::Webkit),
            other => Err(Error::InvalidValue(format!("unknown browser: {}", other))),
        }
    }
}

// ============================================================================
// Actions
// ============================================================================

/// How a dialog raised by the page should be answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialogResponse {
    Accept,
    Dismiss,
}

/// A structured, executable interpretation of one test step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Action {
    Enter {
        target: String,
        value: String,
    },
    Click {
        target: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delay_seconds: Option<f64>,
    },
    Navigate {
        target: String,
    },
    Expect {
        assertion: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_seconds: Option<u64>,
    },
    Select {
        target: String,
        value: String,
    },
    SetChecked {
        target: String,
        checked: bool,
    },
    Hover {
        target: String,
    },
    Press {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    Upload {
        target: String,
        file_paths: Vec<String>,
    },
    Dialog {
        action: DialogResponse,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt_text: Option<String>,
    },
    WaitForRequest {
        url_pattern: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        method: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        trigger_click_target: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_seconds: Option<u64>,
    },
    Download {
        trigger_click_target: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_seconds: Option<u64>,
    },
}

impl Action {
    /// Wire name of the variant, identical to the serialized `type` tag
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Enter { .. } => "enter",
            Action::Click { .. } => "click",
            Action::Navigate { .. } => "navigate",
            Action::Expect { .. } => "expect",
            Action::Select { .. } => "select",
            Action::SetChecked { .. } => "setChecked",
            Action::Hover { .. } => "hover",
            Action::Press { .. } => "press",
            Action::Upload { .. } => "upload",
            Action::Dialog { .. } => "dialog",
            Action::WaitForRequest { .. } => "waitForRequest",
            Action::Download { .. } => "download",
        }
    }

    /// True when both actions are the same variant, regardless of field values
    pub fn same_shape(&self, other: &Action) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// The user-facing text that identifies what the action operates on
    pub fn target_text(&self) -> Option<&str> {
        match self {
            Action::Enter { target, .. }
            | Action::Click { target, .. }
            | Action::Navigate { target }
            | Action::Select { target, .. }
            | Action::SetChecked { target, .. }
            | Action::Hover { target }
            | Action::Upload { target, .. } => Some(target),
            Action::Expect { assertion, .. } => Some(assertion),
            Action::Press { target, key } => Some(target.as_deref().unwrap_or(key)),
            Action::Dialog { .. } => None,
            Action::WaitForRequest { url_pattern, .. } => Some(url_pattern),
            Action::Download { trigger_click_target, .. } => Some(trigger_click_target),
        }
    }
}

// ============================================================================
// Projects, test cases and steps
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub created_at: i64,
}

/// One authored step, ordered within its test case from 1
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    pub test_case_id: String,
    pub step_order: u32,
    pub raw_text: String,
    pub action: Action,
}

// ============================================================================
// Runs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Passed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Passed => "passed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "passed" => Ok(RunStatus::Passed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(Error::InvalidValue(format!("unknown run status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Passed,
    Failed,
    Cancelled,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Passed => "passed",
            StepStatus::Failed => "failed",
            StepStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepStatus::Pending)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "passed" => Ok(StepStatus::Passed),
            "failed" => Ok(StepStatus::Failed),
            "cancelled" => Ok(StepStatus::Cancelled),
            other => Err(Error::InvalidValue(format!("unknown step status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub test_case_id: String,
    pub browser: BrowserKind,
    pub status: RunStatus,
    pub started_at: i64,
    pub ended_at: Option<i64>,
}

/// Outcome of one step within one run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub id: String,
    pub run_id: String,
    pub step_id: String,
    /// Order of the referenced step, 0 when the step no longer exists
    pub step_order: u32,
    pub raw_text: String,
    pub status: StepStatus,
    pub error_text: Option<String>,
    pub screenshot_path: Option<String>,
    pub updated_at: i64,
}

/// Everything a run needs to know about the test case it executes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunContext {
    pub test_case_id: String,
    pub test_title: String,
    pub project_id: String,
    pub project_name: String,
    pub base_url: String,
}

/// Description of the run currently executing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveRunInfo {
    pub run_id: String,
    pub test_case_id: String,
    pub browser: BrowserKind,
    pub started_at: i64,
}

// ============================================================================
// Lifecycle events
// ============================================================================

/// A timestamped lifecycle event for one run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: RunEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum RunEventKind {
    RunStarted {
        test_case_id: String,
        browser: BrowserKind,
    },
    StepStarted {
        step_id: String,
        step_order: u32,
    },
    StepFinished {
        step_id: String,
        step_order: u32,
        step_status: StepStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_result: Option<StepResult>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    RunFinished {
        run_status: RunStatus,
        message: String,
    },
}

impl RunEvent {
    pub fn new(run_id: impl Into<String>, kind: RunEventKind) -> Self {
        Self {
            run_id: run_id.into(),
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn name(&self) -> &'static str {
        match self.kind {
            RunEventKind::RunStarted { .. } => "run-started",
            RunEventKind::StepStarted { .. } => "step-started",
            RunEventKind::StepFinished { .. } => "step-finished",
            RunEventKind::RunFinished { .. } => "run-finished",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, RunEventKind::RunFinished { .. })
    }
}

// ============================================================================
// Browser installation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallPhase {
    Starting,
    Downloading,
    Installing,
    Verifying,
    Completed,
    Failed,
}

impl std::fmt::Display for InstallPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstallPhase::Starting => "starting",
            InstallPhase::Downloading => "downloading",
            InstallPhase::Installing => "installing",
            InstallPhase::Verifying => "verifying",
            InstallPhase::Completed => "completed",
            InstallPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One progress report from a browser engine installation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallEvent {
    pub browser: BrowserKind,
    pub phase: InstallPhase,
    /// 0-100, absent when the phase carries no meaningful progress
    pub progress: Option<u8>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Installation state of one browser engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserInstallState {
    pub browser: BrowserKind,
    pub installed: bool,
    pub install_in_progress: bool,
    pub executable_path: Option<PathBuf>,
    pub last_error: Option<String>,
}

impl BrowserInstallState {
    pub fn new(browser: BrowserKind) -> Self {
        Self {
            browser,
            installed: false,
            install_in_progress: false,
            executable_path: None,
            last_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_wire_format() {
        let action = Action::Click {
            target: "Sign in".to_string(),
            delay_seconds: Some(1.0),
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "click");
        assert_eq!(json["target"], "Sign in");
        assert_eq!(json["delaySeconds"], 1.0);

        let parsed: Action = serde_json::from_str(
            r#"{"type":"waitForRequest","urlPattern":"**/api/login","method":"POST","status":200}"#,
        )
        .unwrap();
        assert_eq!(parsed.kind(), "waitForRequest");
        match parsed {
            Action::WaitForRequest { method, status, trigger_click_target, .. } => {
                assert_eq!(method.as_deref(), Some("POST"));
                assert_eq!(status, Some(200));
                assert!(trigger_click_target.is_none());
            }
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn test_same_shape_ignores_fields() {
        let a = Action::Navigate { target: "/a".into() };
        let b = Action::Navigate { target: "/b".into() };
        let c = Action::Hover { target: "/a".into() };
        assert!(a.same_shape(&b));
        assert!(!a.same_shape(&c));
    }

    #[test]
    fn test_event_serializes_kebab_type() {
        let event = RunEvent::new(
            "run-1",
            RunEventKind::StepStarted {
                step_id: "s1".into(),
                step_order: 1,
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "step-started");
        assert_eq!(json["runId"], "run-1");
        assert_eq!(json["stepOrder"], 1);
        assert_eq!(event.name(), "step-started");
    }

    #[test]
    fn test_browser_kind_parse() {
        assert_eq!("Firefox".parse::<BrowserKind>().unwrap(), BrowserKind::Firefox);
        assert!("lynx".parse::<BrowserKind>().is_err());
    }
}
