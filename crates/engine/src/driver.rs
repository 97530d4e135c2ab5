//! Browser automation seam
//!
//! The executor and orchestrator only talk to a browser through the
//! [`Browser`] and [`Page`] traits. The Playwright bridge is the production
//! implementation; tests script their own.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use stepwise_common::DialogResponse;
use thiserror::Error;

use crate::url_pattern::UrlPattern;

/// Message Playwright reports for calls made after teardown
pub const CLOSED_MESSAGE: &str = "Target page, context or browser has been closed";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("{}", CLOSED_MESSAGE)]
    Closed,

    #[error("{action}: Timeout {timeout_ms}ms exceeded.")]
    Timeout { action: String, timeout_ms: u64 },

    #[error("Failed to launch browser: {0}")]
    Launch(String),

    #[error("{0}")]
    Backend(String),
}

pub type DriverResult<T> = Result<T, DriverError>;

/// ARIA roles the executor looks elements up by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AriaRole {
    Textbox,
    Button,
    Link,
    Menuitem,
    Combobox,
    Listbox,
    Checkbox,
    Radio,
}

/// Declarative element lookup, evaluated by the driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "camelCase")]
pub enum Locator {
    Label { text: String },
    Role { role: AriaRole, name: String },
    Placeholder { text: String },
    /// Case-insensitive substring match on visible text
    Text { text: String },
    Css { selector: String },
}

impl Locator {
    pub fn label(text: impl Into<String>) -> Self {
        Locator::Label { text: text.into() }
    }

    pub fn role(role: AriaRole, name: impl Into<String>) -> Self {
        Locator::Role { role, name: name.into() }
    }

    pub fn placeholder(text: impl Into<String>) -> Self {
        Locator::Placeholder { text: text.into() }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Locator::Text { text: text.into() }
    }

    pub fn css(selector: impl Into<String>) -> Self {
        Locator::Css {
            selector: selector.into(),
        }
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Locator::Label { text } => write!(f, "label={:?}", text),
            Locator::Role { role, name } => write!(f, "role={:?}[name={:?}]", role, name),
            Locator::Placeholder { text } => write!(f, "placeholder={:?}", text),
            Locator::Text { text } => write!(f, "text={:?}", text),
            Locator::Css { selector } => write!(f, "css={}", selector),
        }
    }
}

/// An event the page should start listening for before it is triggered
#[derive(Debug, Clone)]
pub enum EventWait {
    Response {
        pattern: UrlPattern,
        method: Option<String>,
        status: Option<u16>,
    },
    Download {
        save_dir: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Response { url: String, status: u16 },
    Download { path: PathBuf },
}

/// Resolves once the armed event fires or its timeout elapses
pub type PendingEvent = BoxFuture<'static, DriverResult<EventOutcome>>;

#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
    /// Browser executable reported by the runtime probe
    pub executable_path: Option<PathBuf>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            headless: true,
            viewport_width: 1280,
            viewport_height: 720,
            executable_path: None,
        }
    }
}

/// A launched browser instance
#[async_trait]
pub trait Browser: Send + Sync {
    /// Open a page in a fresh, isolated context
    async fn new_page(&self) -> DriverResult<Arc<dyn Page>>;

    /// Tear everything down. Calls in flight on any page fail with
    /// [`DriverError::Closed`]. Safe to call more than once.
    async fn close(&self);
}

#[async_trait]
pub trait Page: Send + Sync {
    async fn goto(&self, url: &str, timeout_ms: u64) -> DriverResult<()>;

    async fn current_url(&self) -> DriverResult<String>;

    async fn fill(&self, locator: &Locator, value: &str, timeout_ms: u64) -> DriverResult<()>;

    async fn click(&self, locator: &Locator, timeout_ms: u64) -> DriverResult<()>;

    /// Type into whatever element currently has focus
    async fn type_text(&self, text: &str) -> DriverResult<()>;

    /// Press a key on an element, or on the page when no locator is given
    async fn press(&self, locator: Option<&Locator>, key: &str, timeout_ms: u64) -> DriverResult<()>;

    async fn wait_visible(&self, locator: &Locator, timeout_ms: u64) -> DriverResult<()>;

    async fn select_option(&self, locator: &Locator, value: &str, timeout_ms: u64) -> DriverResult<()>;

    async fn set_checked(&self, locator: &Locator, checked: bool, timeout_ms: u64) -> DriverResult<()>;

    async fn hover(&self, locator: &Locator, timeout_ms: u64) -> DriverResult<()>;

    async fn set_input_files(&self, locator: &Locator, files: &[PathBuf], timeout_ms: u64) -> DriverResult<()>;

    /// Answer the next dialog the page raises
    async fn arm_dialog(&self, response: DialogResponse, prompt_text: Option<&str>) -> DriverResult<()>;

    /// Start listening for an event. Listening begins before this returns,
    /// so the caller may trigger the event before awaiting the result.
    async fn arm_event(&self, wait: EventWait, timeout_ms: u64) -> DriverResult<PendingEvent>;

    /// PNG bytes of the current page
    async fn screenshot(&self, full_page: bool) -> DriverResult<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locator_wire_format() {
        let json = serde_json::to_value(Locator::role(AriaRole::Menuitem, "Settings")).unwrap();
        assert_eq!(json["by"], "role");
        assert_eq!(json["role"], "menuitem");
        assert_eq!(json["name"], "Settings");

        let json = serde_json::to_value(Locator::placeholder("Email")).unwrap();
        assert_eq!(json["by"], "placeholder");
        assert_eq!(json["text"], "Email");
    }

    #[test]
    fn test_closed_error_carries_abort_signature() {
        assert_eq!(DriverError::Closed.to_string(), CLOSED_MESSAGE);
        let timeout = DriverError::Timeout {
            action: "locator.click".into(),
            timeout_ms: 5000,
        };
        assert_eq!(timeout.to_string(), "locator.click: Timeout 5000ms exceeded.");
    }
}
