//! Remediation plan types shared by the planner, executor, and pattern memory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::issue::Issue;

/// A remediation action together with its parameters.
///
/// The tagged representation round-trips through the memory file, so a
/// learned fix can be replayed exactly as it was recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    /// Merge environment variables into the workload's container spec.
    UpdateEnv { env: BTreeMap<String, String> },
    /// Set the container memory limit to an absolute value (`Mi`/`Gi`).
    PatchMemoryLimit { limit: String },
    /// Replace the container image reference.
    PatchImage { image: String },
    /// Delete the pod so the owning workload recreates it.
    RestartPod,
    /// No automated action; the issue needs manual attention.
    Skip,
}

impl Action {
    /// Whether applying this action changes cluster state.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Self::Skip)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpdateEnv { env } => {
                let keys: Vec<&str> = env.keys().map(String::as_str).collect();
                write!(f, "update_env({})", keys.join(", "))
            }
            Self::PatchMemoryLimit { limit } => write!(f, "patch_memory_limit({limit})"),
            Self::PatchImage { image } => write!(f, "patch_image({image})"),
            Self::RestartPod => write!(f, "restart_pod"),
            Self::Skip => write!(f, "skip"),
        }
    }
}

/// What a step operates on.
///
/// Workload mutations go through the owning workload so the orchestrator's
/// reconciliation recreates pods; only restarts target the pod itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum Target {
    Workload(String),
    Pod(String),
}

impl Target {
    pub fn name(&self) -> &str {
        match self {
            Self::Workload(name) | Self::Pod(name) => name,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Workload(name) => write!(f, "workload/{name}"),
            Self::Pod(name) => write!(f, "pod/{name}"),
        }
    }
}

/// One ordered step of a remediation plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub action: Action,
    pub target: Target,
    pub rationale: String,
}

impl Step {
    /// Build a step for an issue, deriving the target from the action:
    /// restarts address the pod, everything else the owning workload.
    pub fn for_issue(action: Action, issue: &Issue, rationale: impl Into<String>) -> Self {
        let target = match action {
            Action::RestartPod => Target::Pod(issue.identity.pod.clone()),
            _ => Target::Workload(issue.identity.workload.clone()),
        };
        Self {
            action,
            target,
            rationale: rationale.into(),
        }
    }
}

/// Ordered remediation steps proposed for one issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    pub fn single(step: Step) -> Self {
        Self { steps: vec![step] }
    }

    /// Terminal plan meaning "no automated action, manual attention required".
    pub fn skip(issue: &Issue, rationale: impl Into<String>) -> Self {
        Self::single(Step::for_issue(Action::Skip, issue, rationale))
    }

    pub fn is_skip_only(&self) -> bool {
        self.steps.iter().all(|s| !s.action.is_mutating())
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Outcome of one executed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step: Step,
    pub success: bool,
    pub detail: String,
    pub at: DateTime<Utc>,
}

/// Immutable record of one plan execution and its outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub id: Uuid,
    pub fingerprint: String,
    pub issue: Issue,
    pub plan: Plan,
    pub outcomes: Vec<StepOutcome>,
    pub at: DateTime<Utc>,
}

impl Attempt {
    pub fn new(issue: Issue, plan: Plan, outcomes: Vec<StepOutcome>) -> Self {
        Self {
            id: Uuid::new_v4(),
            fingerprint: issue.fingerprint(),
            issue,
            plan,
            outcomes,
            at: Utc::now(),
        }
    }

    /// An attempt counts as successful when every step ran and succeeded and
    /// at least one of them actually mutated the cluster. Skip-only plans are
    /// recorded but never produce learnable parameters.
    pub fn succeeded(&self) -> bool {
        self.outcomes.len() == self.plan.len()
            && !self.outcomes.is_empty()
            && self.outcomes.iter().all(|o| o.success)
            && self.outcomes.iter().any(|o| o.step.action.is_mutating())
    }

    /// The action worth remembering: the first mutating step of the plan.
    pub fn learned_action(&self) -> Option<&Action> {
        self.plan
            .steps
            .iter()
            .map(|s| &s.action)
            .find(|a| a.is_mutating())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::test_issue;
    use crate::issue::Reason;

    fn outcome(step: &Step, success: bool) -> StepOutcome {
        StepOutcome {
            step: step.clone(),
            success,
            detail: String::new(),
            at: Utc::now(),
        }
    }

    #[test]
    fn test_step_target_derivation() {
        let issue = test_issue(Reason::CrashLoopBackOff);
        let restart = Step::for_issue(Action::RestartPod, &issue, "bounce");
        assert_eq!(restart.target, Target::Pod(issue.identity.pod.clone()));

        let patch = Step::for_issue(
            Action::PatchImage {
                image: "nginx:latest".to_string(),
            },
            &issue,
            "fix image",
        );
        assert_eq!(
            patch.target,
            Target::Workload(issue.identity.workload.clone())
        );
    }

    #[test]
    fn test_skip_only_attempt_never_succeeds() {
        let issue = test_issue(Reason::ProbeFailure);
        let plan = Plan::skip(&issue, "manual intervention required");
        let outcomes = vec![outcome(&plan.steps[0], true)];
        let attempt = Attempt::new(issue, plan, outcomes);
        assert!(!attempt.succeeded());
        assert!(attempt.learned_action().is_none());
    }

    #[test]
    fn test_partial_execution_is_not_success() {
        let issue = test_issue(Reason::CrashLoopBackOff);
        let plan = Plan::new(vec![
            Step::for_issue(
                Action::UpdateEnv {
                    env: std::iter::once(("A".to_string(), "1".to_string())).collect(),
                },
                &issue,
                "env",
            ),
            Step::for_issue(Action::RestartPod, &issue, "bounce"),
        ]);
        let outcomes = vec![outcome(&plan.steps[0], true)];
        let attempt = Attempt::new(issue, plan, outcomes);
        assert!(!attempt.succeeded());
    }

    #[test]
    fn test_action_round_trips_through_json() {
        let action = Action::PatchMemoryLimit {
            limit: "512Mi".to_string(),
        };
        let json = serde_json::to_string(&action).unwrap();
        assert!(json.contains("patch_memory_limit"));
        let back: Action = serde_json::from_str(&json).unwrap();
        assert_eq!(back, action);
    }
}
