//! Action execution
//!
//! Each action becomes an ordered plan of [`Interaction`]s. The executor tries
//! them in order against the page and the first one that completes wins. Every
//! attempt gets a slice of whatever budget is left, so an early candidate that
//! hangs cannot starve the ones after it.

use std::path::PathBuf;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use stepwise_common::Action;
use tokio::time::Instant;
use tracing::{debug, info};
use url::Url;

use crate::driver::{AriaRole, DriverError, EventOutcome, EventWait, Locator, Page};
use crate::error::{EngineError, EngineResult};
use crate::url_pattern::UrlPattern;

/// Attempts never get less than this, unless less than this remains
const MIN_ATTEMPT_MS: u64 = 500;
const MAX_CLICK_DELAY_MS: f64 = 600_000.0;

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]+$").unwrap_or_else(|e| panic!("invalid identifier pattern: {e}"))
});

/// One way of carrying out an action against one candidate element
#[derive(Debug, Clone, PartialEq)]
pub enum Interaction {
    Fill { locator: Locator, value: String },
    ClickAndType { locator: Locator, value: String },
    Click(Locator),
    Select { locator: Locator, value: String },
    SetChecked { locator: Locator, checked: bool },
    Hover(Locator),
    Press { locator: Option<Locator>, key: String },
    Upload { locator: Locator, files: Vec<PathBuf> },
}

impl Interaction {
    async fn perform(&self, page: &dyn Page, timeout_ms: u64) -> Result<(), DriverError> {
        match self {
            Interaction::Fill { locator, value } => page.fill(locator, value, timeout_ms).await,
            Interaction::ClickAndType { locator, value } => {
                page.click(locator, timeout_ms).await?;
                page.type_text(value).await
            }
            Interaction::Click(locator) => page.click(locator, timeout_ms).await,
            Interaction::Select { locator, value } => page.select_option(locator, value, timeout_ms).await,
            Interaction::SetChecked { locator, checked } => page.set_checked(locator, *checked, timeout_ms).await,
            Interaction::Hover(locator) => page.hover(locator, timeout_ms).await,
            Interaction::Press { locator, key } => page.press(locator.as_ref(), key, timeout_ms).await,
            Interaction::Upload { locator, files } => page.set_input_files(locator, files, timeout_ms).await,
        }
    }
}

impl std::fmt::Display for Interaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Interaction::Fill { locator, .. } => write!(f, "fill {}", locator),
            Interaction::ClickAndType { locator, .. } => write!(f, "click+type {}", locator),
            Interaction::Click(locator) => write!(f, "click {}", locator),
            Interaction::Select { locator, .. } => write!(f, "select {}", locator),
            Interaction::SetChecked { locator, .. } => write!(f, "check {}", locator),
            Interaction::Hover(locator) => write!(f, "hover {}", locator),
            Interaction::Press { locator: Some(locator), key } => write!(f, "press {} on {}", key, locator),
            Interaction::Press { locator: None, key } => write!(f, "press {}", key),
            Interaction::Upload { locator, .. } => write!(f, "upload {}", locator),
        }
    }
}

// ============================================================================
// Fallback plans
// ============================================================================

/// Selectors implied by targets that look like a class, id or test id
pub fn structural_locators(target: &str) -> Vec<Locator> {
    let target = target.trim();
    if let Some(rest) = target.strip_prefix('.').or_else(|| target.strip_prefix('#')) {
        return if IDENTIFIER.is_match(rest) {
            vec![Locator::css(target)]
        } else {
            Vec::new()
        };
    }
    if !IDENTIFIER.is_match(target) {
        return Vec::new();
    }
    vec![
        Locator::css(format!("[data-testid=\"{}\"]", target)),
        Locator::css(format!("[data-test-id=\"{}\"]", target)),
        Locator::css(format!("[id=\"{}\"]", target)),
    ]
}

/// Candidates for anything the user would click on
pub fn clickable_locators(target: &str) -> Vec<Locator> {
    let mut locators = structural_locators(target);
    locators.extend(
        [AriaRole::Button, AriaRole::Link, AriaRole::Menuitem]
            .into_iter()
            .map(|role| Locator::role(role, target)),
    );
    locators.push(Locator::text(target));
    locators
}

/// Candidates for a form field
pub fn field_locators(target: &str) -> Vec<Locator> {
    vec![
        Locator::label(target),
        Locator::role(AriaRole::Textbox, target),
        Locator::placeholder(target),
    ]
}

/// The ordered interactions for actions that operate on one element.
/// Actions driven by navigation, waits or events have no plan.
pub fn plan(action: &Action) -> Vec<Interaction> {
    match action {
        Action::Enter { target, value } => {
            let mut plan: Vec<Interaction> = field_locators(target)
                .into_iter()
                .map(|locator| Interaction::Fill {
                    locator,
                    value: value.clone(),
                })
                .collect();
            plan.push(Interaction::ClickAndType {
                locator: Locator::text(target),
                value: value.clone(),
            });
            plan
        }
        Action::Click { target, .. } => clickable_locators(target).into_iter().map(Interaction::Click).collect(),
        Action::Select { target, value } => [
            Locator::label(target),
            Locator::role(AriaRole::Combobox, target),
            Locator::role(AriaRole::Listbox, target),
        ]
        .into_iter()
        .map(|locator| Interaction::Select {
            locator,
            value: value.clone(),
        })
        .collect(),
        Action::SetChecked { target, checked } => [
            Locator::label(target),
            Locator::role(AriaRole::Checkbox, target),
            Locator::role(AriaRole::Radio, target),
            Locator::text(target),
        ]
        .into_iter()
        .map(|locator| Interaction::SetChecked {
            locator,
            checked: *checked,
        })
        .collect(),
        Action::Hover { target } => clickable_locators(target).into_iter().map(Interaction::Hover).collect(),
        Action::Press { key, target: Some(target) } => {
            let mut locators = field_locators(target);
            locators.push(Locator::text(target));
            locators
                .into_iter()
                .map(|locator| Interaction::Press {
                    locator: Some(locator),
                    key: key.clone(),
                })
                .collect()
        }
        Action::Press { key, target: None } => vec![Interaction::Press {
            locator: None,
            key: key.clone(),
        }],
        Action::Upload { target, file_paths } => {
            let files: Vec<PathBuf> = file_paths.iter().map(PathBuf::from).collect();
            let mut locators = vec![Locator::label(target)];
            locators.extend(structural_locators(target));
            locators.push(Locator::css("input[type=\"file\"]"));
            locators
                .into_iter()
                .map(|locator| Interaction::Upload {
                    locator,
                    files: files.clone(),
                })
                .collect()
        }
        Action::Navigate { .. }
        | Action::Expect { .. }
        | Action::Dialog { .. }
        | Action::WaitForRequest { .. }
        | Action::Download { .. } => Vec::new(),
    }
}

/// Timeout for the next attempt given what is left of the budget
pub fn attempt_timeout(remaining_ms: u64) -> u64 {
    (remaining_ms / 3).max(remaining_ms.min(MIN_ATTEMPT_MS))
}

/// Work out where a navigate step should go.
///
/// Absolute http(s) URLs are used as given. Paths starting with `/` are
/// resolved against the project base URL. Anything else is relative to the
/// current page when that is an absolute http(s) URL, else to the base URL.
pub fn resolve_navigation_url(target: &str, base_url: &str, current_url: Option<&str>) -> EngineResult<String> {
    let target = target.trim();
    if let Ok(url) = Url::parse(target) {
        if matches!(url.scheme(), "http" | "https") {
            return Ok(target.to_string());
        }
    }

    let parse_base = || Url::parse(base_url).map_err(|e| EngineError::InvalidUrl(format!("{}: {}", base_url, e)));
    let base = if target.starts_with('/') {
        parse_base()?
    } else {
        match current_url.and_then(|u| Url::parse(u).ok()) {
            Some(current) if matches!(current.scheme(), "http" | "https") => current,
            _ => parse_base()?,
        }
    };

    base.join(target)
        .map(|url| url.to_string())
        .map_err(|e| EngineError::InvalidUrl(format!("{}: {}", target, e)))
}

fn seconds_to_ms(seconds: Option<u64>, fallback_ms: u64) -> u64 {
    seconds.map_or(fallback_ms, |s| s.saturating_mul(1000))
}

// ============================================================================
// Executor
// ============================================================================

/// Carries out actions against a live page
#[derive(Debug, Clone)]
pub struct ActionExecutor {
    downloads_dir: PathBuf,
}

impl ActionExecutor {
    pub fn new(downloads_dir: impl Into<PathBuf>) -> Self {
        Self {
            downloads_dir: downloads_dir.into(),
        }
    }

    /// Execute one action within `budget_ms`
    pub async fn execute(&self, page: &dyn Page, action: &Action, budget_ms: u64, base_url: &str) -> EngineResult<()> {
        match action {
            Action::Click { target, delay_seconds } => {
                if let Some(delay) = delay_seconds {
                    let delay_ms = (delay * 1000.0).clamp(0.0, MAX_CLICK_DELAY_MS) as u64;
                    debug!(delay_ms, "delaying click");
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                self.run_plan(page, &plan(action), target, budget_ms).await
            }
            Action::Enter { target, .. }
            | Action::Select { target, .. }
            | Action::SetChecked { target, .. }
            | Action::Hover { target }
            | Action::Upload { target, .. } => self.run_plan(page, &plan(action), target, budget_ms).await,
            Action::Press { key, target } => {
                let label = target.as_deref().unwrap_or(key);
                self.run_plan(page, &plan(action), label, budget_ms).await
            }
            Action::Navigate { target } => {
                let current = page.current_url().await.ok();
                let url = resolve_navigation_url(target, base_url, current.as_deref())?;
                info!(url = %url, "navigating");
                page.goto(&url, budget_ms).await?;
                Ok(())
            }
            Action::Expect {
                assertion,
                timeout_seconds,
            } => {
                let timeout_ms = seconds_to_ms(*timeout_seconds, budget_ms);
                page.wait_visible(&Locator::text(assertion), timeout_ms).await?;
                Ok(())
            }
            Action::Dialog { action, prompt_text } => {
                page.arm_dialog(*action, prompt_text.as_deref()).await?;
                Ok(())
            }
            Action::WaitForRequest {
                url_pattern,
                method,
                status,
                trigger_click_target,
                timeout_seconds,
            } => {
                let pattern = UrlPattern::new(url_pattern)
                    .map_err(|e| EngineError::InvalidPattern(format!("{}: {}", url_pattern, e)))?;
                let wait = EventWait::Response {
                    pattern,
                    method: method.clone(),
                    status: *status,
                };
                let timeout_ms = seconds_to_ms(*timeout_seconds, budget_ms);
                let pending = page.arm_event(wait, timeout_ms).await?;
                if let Some(trigger) = trigger_click_target {
                    self.click_trigger(page, trigger, budget_ms).await?;
                }
                if let EventOutcome::Response { url, status } = pending.await? {
                    info!(url = %url, status, "matched response");
                }
                Ok(())
            }
            Action::Download {
                trigger_click_target,
                timeout_seconds,
            } => {
                std::fs::create_dir_all(&self.downloads_dir)?;
                let wait = EventWait::Download {
                    save_dir: self.downloads_dir.clone(),
                };
                let timeout_ms = seconds_to_ms(*timeout_seconds, budget_ms);
                let pending = page.arm_event(wait, timeout_ms).await?;
                self.click_trigger(page, trigger_click_target, budget_ms).await?;
                if let EventOutcome::Download { path } = pending.await? {
                    info!(path = %path.display(), "download saved");
                }
                Ok(())
            }
        }
    }

    async fn click_trigger(&self, page: &dyn Page, target: &str, budget_ms: u64) -> EngineResult<()> {
        let plan: Vec<Interaction> = clickable_locators(target).into_iter().map(Interaction::Click).collect();
        self.run_plan(page, &plan, target, budget_ms).await
    }

    /// Try each interaction in turn until one succeeds.
    ///
    /// Teardown errors abort immediately. When every candidate fails, an
    /// ambiguity reported by any of them takes precedence over "not found".
    async fn run_plan(&self, page: &dyn Page, plan: &[Interaction], target: &str, budget_ms: u64) -> EngineResult<()> {
        let deadline = Instant::now() + Duration::from_millis(budget_ms);
        let mut last_error: Option<DriverError> = None;
        let mut ambiguous: Option<DriverError> = None;

        for interaction in plan {
            let remaining = deadline.saturating_duration_since(Instant::now()).as_millis() as u64;
            if remaining == 0 {
                break;
            }
            let timeout_ms = attempt_timeout(remaining);
            debug!(attempt = %interaction, timeout_ms, "trying");

            match interaction.perform(page, timeout_ms).await {
                Ok(()) => {
                    debug!(attempt = %interaction, "succeeded");
                    return Ok(());
                }
                Err(DriverError::Closed) => return Err(DriverError::Closed.into()),
                Err(e) => {
                    debug!(attempt = %interaction, error = %e, "failed");
                    if e.to_string().contains("strict mode violation") && ambiguous.is_none() {
                        ambiguous = Some(e.clone());
                    }
                    last_error = Some(e);
                }
            }
        }

        if let Some(e) = ambiguous {
            return Err(e.into());
        }
        Err(EngineError::TargetNotFound {
            target: target.to_string(),
            last_error: last_error.map(|e| e.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverResult, PendingEvent};
    use async_trait::async_trait;
    use futures::FutureExt;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use stepwise_common::DialogResponse;
    use test_case::test_case;

    #[test]
    fn test_enter_plan_order() {
        let action = Action::Enter {
            target: "Email".into(),
            value: "a@b.c".into(),
        };
        let plan = plan(&action);
        assert_eq!(
            plan,
            vec![
                Interaction::Fill {
                    locator: Locator::label("Email"),
                    value: "a@b.c".into()
                },
                Interaction::Fill {
                    locator: Locator::role(AriaRole::Textbox, "Email"),
                    value: "a@b.c".into()
                },
                Interaction::Fill {
                    locator: Locator::placeholder("Email"),
                    value: "a@b.c".into()
                },
                Interaction::ClickAndType {
                    locator: Locator::text("Email"),
                    value: "a@b.c".into()
                },
            ]
        );
    }

    #[test]
    fn test_click_plan_starts_with_structural_candidates() {
        let action = Action::Click {
            target: "submit-btn".into(),
            delay_seconds: None,
        };
        let plan = plan(&action);
        assert_eq!(plan.len(), 7);
        assert_eq!(plan[0], Interaction::Click(Locator::css("[data-testid=\"submit-btn\"]")));
        assert_eq!(plan[1], Interaction::Click(Locator::css("[data-test-id=\"submit-btn\"]")));
        assert_eq!(plan[2], Interaction::Click(Locator::css("[id=\"submit-btn\"]")));
        assert_eq!(plan[3], Interaction::Click(Locator::role(AriaRole::Button, "submit-btn")));
        assert_eq!(plan[6], Interaction::Click(Locator::text("submit-btn")));
    }

    #[test_case(".nav-toggle", vec![Locator::css(".nav-toggle")] ; "class selector")]
    #[test_case("#login", vec![Locator::css("#login")] ; "id selector")]
    #[test_case("Sign in", vec![] ; "phrase has no structural form")]
    #[test_case(".bad selector", vec![] ; "class with space")]
    fn test_structural_locators(target: &str, expected: Vec<Locator>) {
        assert_eq!(structural_locators(target), expected);
    }

    #[test]
    fn test_event_actions_have_no_plan() {
        let action = Action::Dialog {
            action: DialogResponse::Accept,
            prompt_text: None,
        };
        assert!(plan(&action).is_empty());
    }

    #[test_case(15_000, 5_000 ; "a third of a large budget")]
    #[test_case(900, 500 ; "floor applies")]
    #[test_case(200, 200 ; "floor limited by remaining")]
    fn test_attempt_timeout(remaining: u64, expected: u64) {
        assert_eq!(attempt_timeout(remaining), expected);
    }

    #[test_case("https://other.example.com/x", None, "https://other.example.com/x" ; "absolute url")]
    #[test_case("/buyer/login", Some("https://shop.example.com/deep/page"), "https://app.example.com/buyer/login" ; "root path uses base")]
    #[test_case("orders", Some("https://shop.example.com/account/"), "https://shop.example.com/account/orders" ; "relative uses current page")]
    #[test_case("orders", Some("about:blank"), "https://app.example.com/orders" ; "relative falls back to base")]
    fn test_resolve_navigation_url(target: &str, current: Option<&str>, expected: &str) {
        assert_eq!(
            resolve_navigation_url(target, "https://app.example.com/", current).unwrap(),
            expected
        );
    }

    #[test]
    fn test_resolve_navigation_rejects_bad_base() {
        let err = resolve_navigation_url("/x", "not a url", None).unwrap_err();
        assert!(matches!(err, EngineError::InvalidUrl(_)));
    }

    // ------------------------------------------------------------------------
    // Execution against a scripted page
    // ------------------------------------------------------------------------

    const BASE: &str = "https://shop.example.com";

    type Respond = Box<dyn Fn(&str, &Locator) -> DriverResult<()> + Send + Sync>;

    /// Page that logs every call and answers element lookups from a script
    struct ScriptedPage {
        calls: Arc<Mutex<Vec<String>>>,
        timeouts: Mutex<Vec<u64>>,
        respond: Respond,
        /// Failed attempts use up their whole timeout first
        stall: bool,
    }

    impl ScriptedPage {
        fn new(respond: impl Fn(&str, &Locator) -> DriverResult<()> + Send + Sync + 'static) -> Self {
            Self {
                calls: Arc::new(Mutex::new(Vec::new())),
                timeouts: Mutex::new(Vec::new()),
                respond: Box::new(respond),
                stall: false,
            }
        }

        fn stalling(mut self) -> Self {
            self.stall = true;
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn log(&self, call: String) {
            self.calls.lock().push(call);
        }

        async fn attempt(&self, op: &str, locator: &Locator, detail: &str, timeout_ms: u64) -> DriverResult<()> {
            if detail.is_empty() {
                self.log(format!("{} {}", op, locator));
            } else {
                self.log(format!("{} {} {}", op, locator, detail));
            }
            self.timeouts.lock().push(timeout_ms);
            let result = (self.respond)(op, locator);
            if result.is_err() && self.stall {
                tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            }
            result
        }
    }

    #[async_trait]
    impl Page for ScriptedPage {
        async fn goto(&self, url: &str, timeout_ms: u64) -> DriverResult<()> {
            self.log(format!("goto {} {}", url, timeout_ms));
            Ok(())
        }

        async fn current_url(&self) -> DriverResult<String> {
            Ok("about:blank".to_string())
        }

        async fn fill(&self, locator: &Locator, value: &str, timeout_ms: u64) -> DriverResult<()> {
            self.attempt("fill", locator, value, timeout_ms).await
        }

        async fn click(&self, locator: &Locator, timeout_ms: u64) -> DriverResult<()> {
            self.attempt("click", locator, "", timeout_ms).await
        }

        async fn type_text(&self, text: &str) -> DriverResult<()> {
            self.log(format!("type {}", text));
            Ok(())
        }

        async fn press(&self, locator: Option<&Locator>, key: &str, timeout_ms: u64) -> DriverResult<()> {
            match locator {
                Some(locator) => self.attempt("press", locator, key, timeout_ms).await,
                None => {
                    self.log(format!("press {}", key));
                    Ok(())
                }
            }
        }

        async fn wait_visible(&self, locator: &Locator, timeout_ms: u64) -> DriverResult<()> {
            self.attempt("wait", locator, &timeout_ms.to_string(), timeout_ms).await
        }

        async fn select_option(&self, locator: &Locator, value: &str, timeout_ms: u64) -> DriverResult<()> {
            self.attempt("select", locator, value, timeout_ms).await
        }

        async fn set_checked(&self, locator: &Locator, checked: bool, timeout_ms: u64) -> DriverResult<()> {
            self.attempt("check", locator, &checked.to_string(), timeout_ms).await
        }

        async fn hover(&self, locator: &Locator, timeout_ms: u64) -> DriverResult<()> {
            self.attempt("hover", locator, "", timeout_ms).await
        }

        async fn set_input_files(&self, locator: &Locator, files: &[PathBuf], timeout_ms: u64) -> DriverResult<()> {
            let files: Vec<String> = files.iter().map(|f| f.display().to_string()).collect();
            self.attempt("upload", locator, &files.join(","), timeout_ms).await
        }

        async fn arm_dialog(&self, response: DialogResponse, prompt_text: Option<&str>) -> DriverResult<()> {
            self.log(format!("dialog {:?} {:?}", response, prompt_text));
            Ok(())
        }

        async fn arm_event(&self, wait: EventWait, timeout_ms: u64) -> DriverResult<PendingEvent> {
            match wait {
                EventWait::Response { pattern, .. } => {
                    self.log(format!("arm response {} {}", pattern, timeout_ms));
                    // Fires only if something was clicked after arming
                    let calls = self.calls.clone();
                    Ok(async move {
                        let triggered = calls.lock().iter().any(|c| c.starts_with("click"));
                        if triggered {
                            Ok(EventOutcome::Response {
                                url: format!("{}/api/save", BASE),
                                status: 200,
                            })
                        } else {
                            Err(DriverError::Timeout {
                                action: "waitForResponse".to_string(),
                                timeout_ms,
                            })
                        }
                    }
                    .boxed())
                }
                EventWait::Download { save_dir } => {
                    self.log(format!("arm download {} {}", save_dir.display(), timeout_ms));
                    let path = save_dir.join("report.csv");
                    Ok(async move { Ok(EventOutcome::Download { path }) }.boxed())
                }
            }
        }

        async fn screenshot(&self, _full_page: bool) -> DriverResult<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    fn executor() -> ActionExecutor {
        ActionExecutor::new(std::env::temp_dir().join("stepwise-executor-tests"))
    }

    fn not_there(op: &str) -> DriverError {
        DriverError::Timeout {
            action: op.to_string(),
            timeout_ms: 0,
        }
    }

    fn sign_in() -> Action {
        Action::Click {
            target: "Sign in".into(),
            delay_seconds: None,
        }
    }

    #[tokio::test]
    async fn test_first_successful_candidate_wins() {
        let page = ScriptedPage::new(|op, locator| match locator {
            Locator::Role { role: AriaRole::Link, .. } => Ok(()),
            _ => Err(not_there(op)),
        });

        executor().execute(&page, &sign_in(), 15_000, BASE).await.unwrap();
        assert_eq!(
            page.calls(),
            vec![
                r#"click role=Button[name="Sign in"]"#.to_string(),
                r#"click role=Link[name="Sign in"]"#.to_string(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_attempt_gets_a_slice_of_what_is_left() {
        let enter = Action::Enter {
            target: "Email".into(),
            value: "a@b.c".into(),
        };

        for (budget, expected) in [(900, vec![500, 400]), (15_000, vec![5_000, 3_333, 2_222, 1_481])] {
            let page = ScriptedPage::new(|op, _| Err(not_there(op))).stalling();
            let started = Instant::now();

            let err = executor().execute(&page, &enter, budget, BASE).await.unwrap_err();
            assert_eq!(*page.timeouts.lock(), expected);
            assert!(started.elapsed() <= Duration::from_millis(budget));
            match err {
                EngineError::TargetNotFound { target, last_error } => {
                    assert_eq!(target, "Email");
                    assert!(last_error.is_some());
                }
                other => panic!("unexpected: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_closed_page_stops_the_plan() {
        let page = ScriptedPage::new(|_, _| Err(DriverError::Closed));
        let err = executor().execute(&page, &sign_in(), 15_000, BASE).await.unwrap_err();
        assert!(matches!(err, EngineError::Driver(DriverError::Closed)));
        assert_eq!(page.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_ambiguous_match_beats_not_found() {
        let page = ScriptedPage::new(|op, locator| match locator {
            Locator::Role { role: AriaRole::Button, .. } => Err(DriverError::Backend(
                "locator.click: Error: strict mode violation: getByRole('button') resolved to 2 elements".into(),
            )),
            _ => Err(not_there(op)),
        });

        let err = executor().execute(&page, &sign_in(), 15_000, BASE).await.unwrap_err();
        assert_eq!(page.calls().len(), 4);
        match err {
            EngineError::Driver(DriverError::Backend(message)) => assert!(message.contains("strict mode violation")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_not_found_reports_last_error() {
        let page = ScriptedPage::new(|op, locator| match locator {
            Locator::Text { .. } => Err(DriverError::Backend("element is not visible".into())),
            _ => Err(not_there(op)),
        });

        match executor().execute(&page, &sign_in(), 15_000, BASE).await.unwrap_err() {
            EngineError::TargetNotFound { target, last_error } => {
                assert_eq!(target, "Sign in");
                assert_eq!(last_error.as_deref(), Some("element is not visible"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_click_waits_for_its_delay() {
        let page = ScriptedPage::new(|_, _| Ok(()));
        let action = Action::Click {
            target: "Sign in".into(),
            delay_seconds: Some(1.5),
        };
        let started = Instant::now();
        executor().execute(&page, &action, 15_000, BASE).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(1_500));
    }

    #[tokio::test]
    async fn test_select_falls_back_to_combobox() {
        let page = ScriptedPage::new(|op, locator| match locator {
            Locator::Role { role: AriaRole::Combobox, .. } => Ok(()),
            _ => Err(not_there(op)),
        });
        let action = Action::Select {
            target: "Country".into(),
            value: "France".into(),
        };

        executor().execute(&page, &action, 15_000, BASE).await.unwrap();
        assert_eq!(
            page.calls(),
            vec![
                r#"select label="Country" France"#.to_string(),
                r#"select role=Combobox[name="Country"] France"#.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_set_checked_passes_state() {
        let page = ScriptedPage::new(|_, _| Ok(()));
        let action = Action::SetChecked {
            target: "Remember me".into(),
            checked: false,
        };

        executor().execute(&page, &action, 15_000, BASE).await.unwrap();
        assert_eq!(page.calls(), vec![r#"check label="Remember me" false"#.to_string()]);
    }

    #[tokio::test]
    async fn test_hover_uses_clickable_candidates() {
        let page = ScriptedPage::new(|op, locator| match locator {
            Locator::Text { .. } => Ok(()),
            _ => Err(not_there(op)),
        });
        let action = Action::Hover { target: "Account".into() };

        executor().execute(&page, &action, 15_000, BASE).await.unwrap();
        let calls = page.calls();
        // Structural candidates first, then roles, then text
        assert_eq!(calls.len(), 7);
        assert_eq!(calls[0], r#"hover css=[data-testid="Account"]"#);
        assert_eq!(calls[6], r#"hover text="Account""#);
    }

    #[tokio::test]
    async fn test_press_on_target_and_on_page() {
        let page = ScriptedPage::new(|op, locator| match locator {
            Locator::Role { role: AriaRole::Textbox, .. } => Ok(()),
            _ => Err(not_there(op)),
        });
        let on_field = Action::Press {
            key: "Enter".into(),
            target: Some("Search".into()),
        };
        let on_page = Action::Press {
            key: "Tab".into(),
            target: None,
        };

        executor().execute(&page, &on_field, 15_000, BASE).await.unwrap();
        executor().execute(&page, &on_page, 15_000, BASE).await.unwrap();
        assert_eq!(
            page.calls(),
            vec![
                r#"press label="Search" Enter"#.to_string(),
                r#"press role=Textbox[name="Search"] Enter"#.to_string(),
                "press Tab".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_upload_falls_back_to_any_file_input() {
        let page = ScriptedPage::new(|op, locator| match locator {
            Locator::Css { selector } if selector == "input[type=\"file\"]" => Ok(()),
            _ => Err(not_there(op)),
        });
        let action = Action::Upload {
            target: "Your resume".into(),
            file_paths: vec!["/tmp/cv.pdf".into(), "/tmp/letter.pdf".into()],
        };

        executor().execute(&page, &action, 15_000, BASE).await.unwrap();
        assert_eq!(
            page.calls(),
            vec![
                r#"upload label="Your resume" /tmp/cv.pdf,/tmp/letter.pdf"#.to_string(),
                r#"upload css=input[type="file"] /tmp/cv.pdf,/tmp/letter.pdf"#.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_dialog_is_armed_with_prompt_text() {
        let page = ScriptedPage::new(|_, _| Ok(()));
        let action = Action::Dialog {
            action: DialogResponse::Accept,
            prompt_text: Some("Bob".into()),
        };

        executor().execute(&page, &action, 15_000, BASE).await.unwrap();
        assert_eq!(page.calls(), vec![r#"dialog Accept Some("Bob")"#.to_string()]);
    }

    #[tokio::test]
    async fn test_response_wait_is_armed_before_trigger() {
        let page = ScriptedPage::new(|_, _| Ok(()));
        let action = Action::WaitForRequest {
            url_pattern: "**/api/save".into(),
            method: Some("POST".into()),
            status: Some(200),
            trigger_click_target: Some("Save".into()),
            timeout_seconds: Some(5),
        };

        executor().execute(&page, &action, 15_000, BASE).await.unwrap();
        assert_eq!(
            page.calls(),
            vec![
                "arm response **/api/save 5000".to_string(),
                r#"click css=[data-testid="Save"]"#.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_response_wait_without_trigger_times_out() {
        let page = ScriptedPage::new(|_, _| Ok(()));
        let action = Action::WaitForRequest {
            url_pattern: "/api/save".into(),
            method: None,
            status: None,
            trigger_click_target: None,
            timeout_seconds: None,
        };

        let err = executor().execute(&page, &action, 15_000, BASE).await.unwrap_err();
        assert!(matches!(err, EngineError::Driver(DriverError::Timeout { timeout_ms: 15_000, .. })));
        assert_eq!(page.calls(), vec!["arm response /api/save 15000".to_string()]);
    }

    #[tokio::test]
    async fn test_download_lands_in_downloads_dir() {
        let dir = tempfile::tempdir().unwrap();
        let downloads = dir.path().join("artifacts/downloads");
        let page = ScriptedPage::new(|op, locator| match locator {
            Locator::Role { role: AriaRole::Link, .. } => Ok(()),
            _ => Err(not_there(op)),
        });
        let action = Action::Download {
            trigger_click_target: "Export CSV".into(),
            timeout_seconds: Some(20),
        };

        ActionExecutor::new(downloads.clone())
            .execute(&page, &action, 15_000, BASE)
            .await
            .unwrap();
        assert!(downloads.is_dir());
        assert_eq!(
            page.calls(),
            vec![
                format!("arm download {} 20000", downloads.display()),
                r#"click role=Button[name="Export CSV"]"#.to_string(),
                r#"click role=Link[name="Export CSV"]"#.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_navigate_and_expect() {
        let page = ScriptedPage::new(|_, _| Ok(()));
        let go = Action::Navigate { target: "/login".into() };
        let expect = Action::Expect {
            assertion: "Welcome".into(),
            timeout_seconds: Some(3),
        };

        executor().execute(&page, &go, 15_000, BASE).await.unwrap();
        executor().execute(&page, &expect, 15_000, BASE).await.unwrap();
        assert_eq!(
            page.calls(),
            vec![
                format!("goto {}/login 15000", BASE),
                r#"wait text="Welcome" 3000"#.to_string(),
            ]
        );
    }
}
