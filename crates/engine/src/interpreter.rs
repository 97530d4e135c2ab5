//! Step DSL interpreter
//!
//! Turns one line of authored step text into an [`Action`]. Resolution is
//! two-tier: a strict, fixed-phrasing grammar is tried first and a keyword
//! heuristic handles everything else.
//!
//! ```text
//! Enter "<value>" in "<field>" field
//! Click "<text>" [button] [after <N> <unit>]
//! Go to <target> | Redirect to <target> [url]
//! Expect [within|in <N> <unit>] <assertion> [within <N> <unit>]
//! ```
//!
//! Parsing is pure: the same text always yields the same result. Execution
//! relies on that to re-derive stored actions from their source text.

use once_cell::sync::Lazy;
use regex::Regex;
use stepwise_common::Action;
use thiserror::Error;

/// Fixed message returned for text that matches no supported form
pub const UNSUPPORTED_STEP_MESSAGE: &str = "Unsupported step. Use one of: \
Enter \"<value>\" in \"<field>\" field; Click \"<text>\"; Go to <url>; Expect <text>.";

const MIN_TIMEOUT_SECONDS: f64 = 1.0;
const MAX_TIMEOUT_SECONDS: f64 = 600.0;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepParseError {
    #[error("Step cannot be empty.")]
    Empty,

    #[error("{}", UNSUPPORTED_STEP_MESSAGE)]
    Unsupported,
}

// Longer spellings first: the regex crate takes the leftmost alternative.
const UNIT: &str = r"(seconds|second|secs|sec|s|minutes|minute|mins|min|m)";
const AMOUNT: &str = r"(\d+(?:\.\d+)?)";

fn re(pattern: &str) -> Regex {
    // Patterns are compile-time constants covered by the tests below.
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid step pattern {pattern}: {e}"))
}

static STRICT_ENTER: Lazy<Regex> = Lazy::new(|| re(r#"(?i)^enter\s+"([^"]*)"\s+in\s+"([^"]+)"\s+field$"#));
static STRICT_CLICK: Lazy<Regex> = Lazy::new(|| {
    re(&format!(
        r#"(?i)^click\s+"([^"]+)"(?:\s+button)?(?:\s+after\s+{AMOUNT}\s*{UNIT})?$"#
    ))
});
static STRICT_GO_TO: Lazy<Regex> = Lazy::new(|| re(r"(?i)^go\s+to\s+(.+)$"));
static STRICT_REDIRECT: Lazy<Regex> = Lazy::new(|| re(r"(?i)^redirect\s+to\s+(.+?)(?:\s+\(?url\)?)?$"));
static STRICT_EXPECT: Lazy<Regex> = Lazy::new(|| re(r"(?i)^expect\s+(.+)$"));

static TIMEOUT_SUFFIX: Lazy<Regex> =
    Lazy::new(|| re(&format!(r"(?i)^(.*?)\s+within\s+{AMOUNT}\s*{UNIT}$")));
static TIMEOUT_PREFIX: Lazy<Regex> =
    Lazy::new(|| re(&format!(r"(?i)^(?:within|in)\s+{AMOUNT}\s*{UNIT}\s+(.+)$")));
static DELAY_PREFIX: Lazy<Regex> =
    Lazy::new(|| re(&format!(r"(?i)^after\s+{AMOUNT}\s*{UNIT}\b[\s,]*(.*)$")));
static DELAY_SUFFIX: Lazy<Regex> =
    Lazy::new(|| re(&format!(r"(?i)^(.*?)[\s,]+after\s+{AMOUNT}\s*{UNIT}$")));

static CLICK_VERB: Lazy<Regex> = Lazy::new(|| re(r"(?i)^(?:click|tap|press|select)\b\s*(.*)$"));
static ENTER_VERB: Lazy<Regex> = Lazy::new(|| re(r"(?i)^(?:enter|type|fill|input)\b\s*(.*)$"));
static NAVIGATE_VERB: Lazy<Regex> =
    Lazy::new(|| re(r"(?i)^(?:go\s+to|redirect\s+to|navigate\s+to|open|visit)\b\s*(.*)$"));
static EXPECT_VERB: Lazy<Regex> = Lazy::new(|| {
    re(r"(?i)^(?:i\s+)?(?:expect|assert|verify|should\s+see|should|sees|see)\b\s*(?:that\s+)?(.*)$")
});
static EXPECT_ANYWHERE: Lazy<Regex> = Lazy::new(|| re(r"(?i)\b(?:expect|assert|verify|should|sees|see)\b"));
static SEE_CLAUSE: Lazy<Regex> = Lazy::new(|| re(r"(?i)\b(?:should\s+)?sees?\b\s+(.+)$"));

static ENTER_INTO: Lazy<Regex> = Lazy::new(|| re(r"(?i)^(.+?)\s+(?:in|into)\s+(.+)$"));
static FIELD_SUFFIX: Lazy<Regex> = Lazy::new(|| re(r"(?i)\s+field$"));
static LEADING_ON: Lazy<Regex> = Lazy::new(|| re(r"(?i)^on\s+"));
static QUOTED: Lazy<Regex> = Lazy::new(|| re(r#""([^"]*)"|“([^”]*)”"#));
static BOX_HINT: Lazy<Regex> = Lazy::new(|| re(r"(?i)\s*\b(?:inside|in)\s+(?:a|an|the)\s+box\b"));
static LEADING_ARTICLE: Lazy<Regex> = Lazy::new(|| re(r"(?i)^(?:a|an|the)\s+"));

/// Parse raw step text into an action
pub fn parse(raw_text: &str) -> Result<Action, StepParseError> {
    let text = raw_text.trim();
    if text.is_empty() {
        return Err(StepParseError::Empty);
    }

    parse_strict(text)
        .or_else(|| parse_fallback(text))
        .ok_or(StepParseError::Unsupported)
}

/// Choose the action to execute for a stored step.
///
/// The source text is re-parsed and the fresh result wins whenever it has the
/// same shape as the stored action. The stored action is used only when the
/// re-parse yields a different variant or fails outright, which is how
/// structured actions that the grammar cannot express survive execution.
pub fn resolve_for_execution(raw_text: &str, stored: Option<&Action>) -> Result<Action, StepParseError> {
    match (parse(raw_text), stored) {
        (Ok(fresh), Some(stored)) if !fresh.same_shape(stored) => Ok(stored.clone()),
        (Ok(fresh), _) => Ok(fresh),
        (Err(_), Some(stored)) => Ok(stored.clone()),
        (Err(e), None) => Err(e),
    }
}

// ============================================================================
// Strict grammar
// ============================================================================

fn parse_strict(text: &str) -> Option<Action> {
    if let Some(caps) = STRICT_ENTER.captures(text) {
        let target = caps[2].trim();
        if !target.is_empty() {
            return Some(Action::Enter {
                target: target.to_string(),
                value: caps[1].to_string(),
            });
        }
    }

    if let Some(caps) = STRICT_CLICK.captures(text) {
        let target = caps[1].trim();
        if !target.is_empty() {
            let delay_seconds = match (caps.get(2), caps.get(3)) {
                (Some(amount), Some(unit)) => to_seconds(amount.as_str(), unit.as_str()),
                _ => None,
            };
            return Some(Action::Click {
                target: target.to_string(),
                delay_seconds,
            });
        }
    }

    if let Some(caps) = STRICT_GO_TO.captures(text).or_else(|| STRICT_REDIRECT.captures(text)) {
        let target = unquote(caps[1].trim());
        if !target.is_empty() {
            return Some(Action::Navigate {
                target: target.to_string(),
            });
        }
    }

    if let Some(caps) = STRICT_EXPECT.captures(text) {
        let (assertion, timeout_seconds) = split_timeout(caps[1].trim());
        let assertion = unquote(assertion);
        if !assertion.is_empty() {
            return Some(Action::Expect {
                assertion: assertion.to_string(),
                timeout_seconds,
            });
        }
    }

    None
}

// ============================================================================
// Heuristic fallback
// ============================================================================

fn parse_fallback(text: &str) -> Option<Action> {
    if let Some(caps) = CLICK_VERB.captures(text) {
        return fallback_click(caps[1].trim());
    }
    if let Some(caps) = ENTER_VERB.captures(text) {
        return fallback_enter(caps[1].trim());
    }
    if let Some(caps) = NAVIGATE_VERB.captures(text) {
        let target = unquote(caps[1].trim());
        return (!target.is_empty()).then(|| Action::Navigate {
            target: target.to_string(),
        });
    }
    if let Some(caps) = EXPECT_VERB.captures(text) {
        return fallback_expect(caps[1].trim());
    }
    if EXPECT_ANYWHERE.is_match(text) {
        let body = SEE_CLAUSE
            .captures(text)
            .and_then(|caps| caps.get(1))
            .map_or(text, |m| m.as_str());
        return fallback_expect(body.trim());
    }
    None
}

fn fallback_click(rest: &str) -> Option<Action> {
    let (rest, delay_seconds) = if let Some(caps) = DELAY_PREFIX.captures(rest) {
        let delay = to_seconds(&caps[1], &caps[2]);
        (caps.get(3).map_or("", |m| m.as_str()), delay)
    } else if let Some(caps) = DELAY_SUFFIX.captures(rest) {
        let delay = to_seconds(&caps[2], &caps[3]);
        (caps.get(1).map_or("", |m| m.as_str()), delay)
    } else {
        (rest, None)
    };

    let target = match quoted_parts(rest).into_iter().next() {
        Some(quoted) => quoted,
        None => unquote(LEADING_ON.replace(rest.trim(), "").trim()).to_string(),
    };
    let target = target.trim();
    if target.is_empty() {
        return None;
    }

    Some(Action::Click {
        target: target.to_string(),
        delay_seconds,
    })
}

fn fallback_enter(rest: &str) -> Option<Action> {
    let quoted = quoted_parts(rest);
    if quoted.len() >= 2 {
        let target = quoted[1].trim();
        if target.is_empty() {
            return None;
        }
        return Some(Action::Enter {
            target: target.to_string(),
            value: quoted[0].clone(),
        });
    }

    let caps = ENTER_INTO.captures(rest)?;
    let value = unquote(caps[1].trim());
    let target = FIELD_SUFFIX.replace(caps[2].trim(), "");
    let target = unquote(target.trim());
    if value.is_empty() || target.is_empty() {
        return None;
    }

    Some(Action::Enter {
        target: target.to_string(),
        value: value.to_string(),
    })
}

fn fallback_expect(body: &str) -> Option<Action> {
    let (assertion, timeout_seconds) = split_timeout(body);
    let assertion = normalize_assertion(assertion);
    if assertion.is_empty() {
        return None;
    }

    Some(Action::Expect {
        assertion,
        timeout_seconds,
    })
}

fn normalize_assertion(assertion: &str) -> String {
    let without_hint = BOX_HINT.replace_all(assertion, "");
    let unquoted = unquote(without_hint.trim());
    LEADING_ARTICLE.replace(unquoted, "").trim().to_string()
}

// ============================================================================
// Shared helpers
// ============================================================================

/// Split an optional `within N unit` suffix or `within|in N unit` prefix off
/// an assertion.
fn split_timeout(body: &str) -> (&str, Option<u64>) {
    if let Some(caps) = TIMEOUT_SUFFIX.captures(body) {
        let assertion = caps.get(1).map_or("", |m| m.as_str()).trim();
        return (assertion, to_timeout_seconds(&caps[2], &caps[3]));
    }
    if let Some(caps) = TIMEOUT_PREFIX.captures(body) {
        let assertion = caps.get(3).map_or("", |m| m.as_str()).trim();
        return (assertion, to_timeout_seconds(&caps[1], &caps[2]));
    }
    (body, None)
}

fn unit_multiplier(unit: &str) -> f64 {
    if unit.to_ascii_lowercase().starts_with('m') {
        60.0
    } else {
        1.0
    }
}

fn to_seconds(amount: &str, unit: &str) -> Option<f64> {
    let seconds = amount.parse::<f64>().ok()? * unit_multiplier(unit);
    (seconds.is_finite() && seconds >= 0.0).then_some(seconds)
}

/// Non-positive or non-finite timeouts mean "no timeout" rather than an error.
fn to_timeout_seconds(amount: &str, unit: &str) -> Option<u64> {
    let seconds = amount.parse::<f64>().ok()? * unit_multiplier(unit);
    if !seconds.is_finite() || seconds <= 0.0 {
        return None;
    }
    Some(seconds.round().clamp(MIN_TIMEOUT_SECONDS, MAX_TIMEOUT_SECONDS) as u64)
}

fn quoted_parts(text: &str) -> Vec<String> {
    QUOTED
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Strip one wrapping pair of straight or curly quotes
fn unquote(text: &str) -> &str {
    const PAIRS: [(char, char); 4] = [('"', '"'), ('\'', '\''), ('“', '”'), ('‘', '’')];
    for (open, close) in PAIRS {
        if let Some(inner) = text.strip_prefix(open).and_then(|t| t.strip_suffix(close)) {
            return inner.trim();
        }
    }
    text
}
