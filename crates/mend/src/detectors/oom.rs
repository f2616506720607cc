//! Progressive memory escalation for OOM-killed workloads.
//!
//! The ladder is a fixed, I/O-free table so candidate selection is
//! exhaustively testable. History (limits already attempted for the
//! fingerprint) comes from the planner; a regressed "learned" limit resumes
//! the ladder above everything seen instead of repeating it.

use super::{Detect, DetectorContext};
use crate::issue::{Issue, Reason};
use crate::k8s::parse_mebibytes;
use crate::plan::{Action, Plan, Step};

/// Escalation ladder, ascending. The last rung is the ceiling.
pub const LADDER: &[&str] = &["128Mi", "256Mi", "512Mi", "1Gi"];

/// Next limit to try: the lowest rung strictly above the current limit and
/// every limit already attempted. `None` once the ceiling is exhausted.
pub fn next_candidate(current: Option<&str>, history: &[String]) -> Option<&'static str> {
    let floor = current
        .and_then(parse_mebibytes)
        .into_iter()
        .chain(history.iter().filter_map(|h| parse_mebibytes(h)))
        .max()
        .unwrap_or(0);
    LADDER
        .iter()
        .find(|rung| parse_mebibytes(rung).is_some_and(|mib| mib > floor))
        .copied()
}

pub struct OomEscalation;

impl Detect for OomEscalation {
    fn name(&self) -> &'static str {
        "oom-escalation"
    }

    fn detect(&self, issue: &Issue, ctx: &DetectorContext) -> Option<Plan> {
        if issue.reason != Reason::OomKilled {
            return None;
        }
        match next_candidate(issue.memory_limit.as_deref(), &ctx.attempted_limits) {
            Some(limit) => Some(Plan::single(Step::for_issue(
                Action::PatchMemoryLimit {
                    limit: limit.to_string(),
                },
                issue,
                format!(
                    "container OOM-killed at {}; escalating to {limit}",
                    issue.memory_limit.as_deref().unwrap_or("no limit")
                ),
            ))),
            None => Some(Plan::skip(
                issue,
                format!(
                    "memory ceiling {} exhausted; manual intervention required",
                    LADDER.last().unwrap_or(&"")
                ),
            )),
        }
    }
}
