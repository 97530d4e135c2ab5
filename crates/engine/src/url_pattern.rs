//! URL glob patterns for network waits
//!
//! `*` matches any run of non-whitespace characters and `**` matches
//! anything. Patterns with a wildcard must match the whole URL; patterns
//! without one match anywhere in it. Matching ignores case.

use regex::Regex;

#[derive(Debug, Clone)]
pub struct UrlPattern {
    source: String,
    matcher: Matcher,
}

#[derive(Debug, Clone)]
enum Matcher {
    Contains(String),
    Glob(Regex),
}

impl UrlPattern {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let source = pattern.trim().to_string();
        let matcher = if source.contains('*') {
            Matcher::Glob(Regex::new(&format!("(?i)^{}$", glob_to_regex(&source)))?)
        } else {
            Matcher::Contains(source.to_lowercase())
        };
        Ok(Self { source, matcher })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, url: &str) -> bool {
        match &self.matcher {
            Matcher::Contains(needle) => url.to_lowercase().contains(needle.as_str()),
            Matcher::Glob(regex) => regex.is_match(url),
        }
    }
}

impl std::fmt::Display for UrlPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() * 2);
    let mut literal = String::new();
    let mut chars = glob.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '*' {
            literal.push(c);
            continue;
        }
        out.push_str(&regex::escape(&literal));
        literal.clear();
        if chars.peek() == Some(&'*') {
            while chars.peek() == Some(&'*') {
                chars.next();
            }
            out.push_str(".*");
        } else {
            out.push_str(r"[^\s]*");
        }
    }
    out.push_str(&regex::escape(&literal));
    out
}
