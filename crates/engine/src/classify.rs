//! Failure classification
//!
//! Reduces any step or setup failure to one user-facing message. Backend
//! errors are matched by the signatures Playwright puts in its messages.

use stepwise_common::BrowserKind;

use crate::driver::{DriverError, CLOSED_MESSAGE};
use crate::error::EngineError;

const ABORT_SIGNATURES: &[&str] = &[
    CLOSED_MESSAGE,
    "Browser has been closed",
    "Target closed",
    "browser has disconnected",
];

const MISSING_BROWSER_SIGNATURES: &[&str] = &[
    "Executable doesn't exist",
    "playwright install",
    "browserType.launch: Failed to launch",
];

const NAVIGATION_SIGNATURES: &[&str] = &[
    "net::ERR_",
    "NS_ERROR_",
    "ERR_NAME_NOT_RESOLVED",
    "ECONNREFUSED",
    "Navigation failed",
    "page.goto:",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Caused by our own teardown during cancellation
    Aborted,
    MissingBrowser,
    Ambiguous,
    TargetNotFound,
    Timeout,
    Navigation,
    Invalid,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn is_abort(&self) -> bool {
        self.kind == FailureKind::Aborted
    }
}

/// True when the error is a side effect of closing the browser on purpose
pub fn is_abort(err: &EngineError) -> bool {
    match err {
        EngineError::Driver(DriverError::Closed) | EngineError::Cancelled => true,
        other => contains_any(&other.to_string(), ABORT_SIGNATURES),
    }
}

/// Classify a failure. `target` is the text the failing action was aimed at.
pub fn classify_failure(err: &EngineError, target: Option<&str>, browser: BrowserKind) -> Failure {
    let raw = err.to_string();
    let detail = first_line(&raw);
    let subject = target.map(|t| format!(" \"{}\"", t)).unwrap_or_default();

    if is_abort(err) {
        return failure(FailureKind::Aborted, CLOSED_MESSAGE.to_string());
    }

    if matches!(err, EngineError::Install(_)) || contains_any(&raw, MISSING_BROWSER_SIGNATURES) {
        return failure(
            FailureKind::MissingBrowser,
            format!(
                "The {} browser engine is not installed. Install it with `stepwise browser install {}` and try again.",
                browser, browser
            ),
        );
    }

    if raw.contains("strict mode violation") {
        return failure(
            FailureKind::Ambiguous,
            format!(
                "More than one element matches{}. Narrow the step target text.",
                subject
            ),
        );
    }

    match err {
        EngineError::TargetNotFound { target, .. } => {
            return failure(
                FailureKind::TargetNotFound,
                format!(
                    "Could not find \"{}\" on the page. Check the step target text matches a label, button or visible text.",
                    target
                ),
            );
        }
        EngineError::Parse(_)
        | EngineError::InvalidStep { .. }
        | EngineError::InvalidUrl(_)
        | EngineError::InvalidPattern(_) => {
            return failure(FailureKind::Invalid, detail.to_string());
        }
        _ => {}
    }

    if contains_any(&raw, NAVIGATION_SIGNATURES) {
        return failure(
            FailureKind::Navigation,
            format!("Navigation failed: {}. Check the URL and network access.", trim_period(detail)),
        );
    }

    if raw.to_lowercase().contains("timeout") {
        return failure(
            FailureKind::Timeout,
            format!(
                "Timed out waiting for{}. Add an explicit `within Ns` to the step or raise the step timeout.",
                if subject.is_empty() { " the page" } else { subject.as_str() }
            ),
        );
    }

    failure(FailureKind::Other, detail.to_string())
}

fn failure(kind: FailureKind, message: String) -> Failure {
    Failure { kind, message }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

fn first_line(text: &str) -> &str {
    text.lines().map(str::trim).find(|line| !line.is_empty()).unwrap_or("")
}

fn trim_period(text: &str) -> &str {
    text.trim_end_matches('.')
}
