//! Missing environment variable inference from crash logs.
//!
//! Looks for the `<NAME> is: <empty>` probe lines that entrypoint scripts
//! print before bailing out with a missing-variable error, and fills in
//! defaults by name suffix. Names without a default rule are skipped, never
//! guessed.

use regex::Regex;
use std::collections::BTreeMap;

use super::{Detect, DetectorContext};
use crate::issue::{Issue, Reason};
use crate::plan::{Action, Plan, Step};

/// Log tokens that look like variable names but are log levels.
const NOISE_WORDS: &[&str] = &["ERROR", "WARNING", "INFO", "DEBUG"];

/// Default value for a reported-empty variable, by name suffix.
fn default_value(name: &str) -> Option<&'static str> {
    if name.ends_with("_HOST") {
        Some("localhost")
    } else if name.ends_with("_PASSWORD") {
        Some("password123")
    } else if name.ends_with("_PORT") {
        Some("3306")
    } else {
        None
    }
}

pub struct MissingEnv {
    probe: Regex,
    marker: Regex,
}

impl MissingEnv {
    pub fn new() -> Self {
        Self {
            // "MYSQL_HOST is: " with nothing after the colon.
            probe: Regex::new(r"^([A-Z][A-Z0-9_]*) is:\s*$").expect("probe pattern is valid"),
            marker: Regex::new(r"(?i)missing required environment")
                .expect("marker pattern is valid"),
        }
    }

    /// Variables reported empty, resolved to default values. Empty unless an
    /// explicit missing-variable marker is present in the logs.
    fn resolve(&self, logs: &[String]) -> BTreeMap<String, String> {
        if !logs.iter().any(|line| self.marker.is_match(line)) {
            return BTreeMap::new();
        }

        let mut resolved = BTreeMap::new();
        for line in logs {
            let Some(captures) = self.probe.captures(line.trim_end()) else {
                continue;
            };
            let name = &captures[1];
            if NOISE_WORDS.contains(&name) {
                continue;
            }
            match default_value(name) {
                Some(value) => {
                    resolved.insert(name.to_string(), value.to_string());
                }
                None => {
                    tracing::debug!(name, "no default rule for empty variable, skipping");
                }
            }
        }
        resolved
    }
}

impl Default for MissingEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl Detect for MissingEnv {
    fn name(&self) -> &'static str {
        "missing-env"
    }

    fn detect(&self, issue: &Issue, _ctx: &DetectorContext) -> Option<Plan> {
        if issue.reason != Reason::CrashLoopBackOff {
            return None;
        }
        let env = self.resolve(&issue.logs);
        if env.is_empty() {
            return None;
        }
        let names: Vec<&str> = env.keys().map(String::as_str).collect();
        let rationale = format!(
            "pod logs report missing environment variables: {}",
            names.join(", ")
        );
        Some(Plan::single(Step::for_issue(
            Action::UpdateEnv { env },
            issue,
            rationale,
        )))
    }
}
