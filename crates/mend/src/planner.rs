//! Plan creation: memory first, detectors second, reasoning last.
//!
//! Memory-path and detector plans are always preferred over the reasoning
//! collaborator because they are deterministic, auditable, and free of
//! external latency and cost. The instant-fix path replays a remembered
//! action without consulting any detector.

use tracing::{debug, info, warn};

use crate::detectors::{DetectorContext, DetectorSet};
use crate::issue::{Issue, Reason};
use crate::k8s::parse_mebibytes;
use crate::memory::PatternStore;
use crate::plan::{Action, Plan, Step};
use crate::reasoning::ReasoningClient;

pub struct Planner {
    detectors: DetectorSet,
    reasoning: Option<ReasoningClient>,
}

impl Planner {
    pub fn new(reasoning: Option<ReasoningClient>) -> Self {
        Self {
            detectors: DetectorSet::new(),
            reasoning,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_detectors(detectors: DetectorSet) -> Self {
        Self {
            detectors,
            reasoning: None,
        }
    }

    /// Produce one plan for one issue. Never empty: issues nothing can act
    /// on get an explicit skip step.
    pub async fn create_plan(&self, issue: &Issue, memory: &PatternStore) -> Plan {
        let fingerprint = issue.fingerprint();

        if let Some(plan) = self.plan_from_memory(issue, memory, &fingerprint) {
            info!(%fingerprint, "applying remembered fix");
            return plan;
        }

        let ctx = DetectorContext {
            attempted_limits: memory.attempted_limits(&fingerprint),
        };
        if let Some(plan) = self.detectors.first_match(issue, &ctx) {
            return plan;
        }

        if let Some(reasoning) = &self.reasoning {
            debug!(%fingerprint, "no detector matched, consulting reasoning collaborator");
            match reasoning.propose(issue).await {
                Some(plan) => return plan,
                None => warn!(%fingerprint, "reasoning collaborator unavailable or unusable"),
            }
        }

        Plan::skip(issue, "manual intervention required")
    }

    /// Instant-fix path: replay the fingerprint's remembered action when it
    /// has succeeded before. The one exception is a regressed memory limit:
    /// a learned limit at or below the observed one is evidently no longer
    /// sufficient, so the ladder takes over again.
    fn plan_from_memory(
        &self,
        issue: &Issue,
        memory: &PatternStore,
        fingerprint: &str,
    ) -> Option<Plan> {
        let pattern = memory.lookup(fingerprint)?;
        if pattern.success_count == 0 {
            return None;
        }
        let action = pattern.successful_parameters.as_ref()?;

        if issue.reason == Reason::OomKilled {
            if let Action::PatchMemoryLimit { limit } = action {
                let learned = parse_mebibytes(limit);
                let current = issue.memory_limit.as_deref().and_then(parse_mebibytes);
                if let (Some(learned), Some(current)) = (learned, current) {
                    if learned <= current {
                        debug!(
                            %fingerprint,
                            learned = %limit,
                            "learned limit regressed, resuming escalation"
                        );
                        return None;
                    }
                }
            }
        }

        Some(Plan::single(Step::for_issue(
            action.clone(),
            issue,
            format!(
                "remembered fix for {fingerprint} ({} of {} attempts succeeded)",
                pattern.success_count, pattern.total_count
            ),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::Detect;
    use crate::issue::test_issue;
    use crate::plan::{Attempt, StepOutcome};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Detector wrapper that counts invocations.
    struct Counting<D> {
        inner: D,
        calls: Arc<AtomicUsize>,
    }

    impl<D: Detect> Detect for Counting<D> {
        fn name(&self) -> &'static str {
            self.inner.name()
        }

        fn detect(&self, issue: &Issue, ctx: &DetectorContext) -> Option<Plan> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.detect(issue, ctx)
        }
    }

    fn counting_planner() -> (Planner, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let detectors = DetectorSet::with_detectors(vec![
            Box::new(Counting {
                inner: crate::detectors::image_typo::ImageTypo,
                calls: Arc::clone(&calls),
            }),
            Box::new(Counting {
                inner: crate::detectors::missing_env::MissingEnv::new(),
                calls: Arc::clone(&calls),
            }),
            Box::new(Counting {
                inner: crate::detectors::oom::OomEscalation,
                calls: Arc::clone(&calls),
            }),
        ]);
        (Planner::with_detectors(detectors), calls)
    }

    fn empty_store(dir: &TempDir) -> PatternStore {
        PatternStore::load(dir.path().join("memory.json"))
    }

    fn successful_attempt(issue: &Issue, action: Action) -> Attempt {
        let plan = Plan::single(Step::for_issue(action, issue, "test"));
        let outcomes = vec![StepOutcome {
            step: plan.steps[0].clone(),
            success: true,
            detail: String::new(),
            at: Utc::now(),
        }];
        Attempt::new(issue.clone(), plan, outcomes)
    }

    fn failed_attempt(issue: &Issue, action: Action) -> Attempt {
        let plan = Plan::single(Step::for_issue(action, issue, "test"));
        let outcomes = vec![StepOutcome {
            step: plan.steps[0].clone(),
            success: false,
            detail: String::new(),
            at: Utc::now(),
        }];
        Attempt::new(issue.clone(), plan, outcomes)
    }

    #[tokio::test]
    async fn test_image_typo_plan_without_reasoning() {
        let dir = TempDir::new().unwrap();
        let store = empty_store(&dir);
        let planner = Planner::new(None);

        let mut issue = test_issue(Reason::ImagePullBackOff);
        issue.image = "nginx:latst".to_string();

        let plan = planner.create_plan(&issue, &store).await;
        assert_eq!(plan.len(), 1);
        assert_eq!(
            plan.steps[0].action,
            Action::PatchImage {
                image: "nginx:latest".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_detector_match_never_reaches_reasoning() {
        // The reasoning client points at a dead endpoint; a dictionary hit
        // must produce the fix without ever going near it.
        let dir = TempDir::new().unwrap();
        let store = empty_store(&dir);
        let planner = Planner::new(Some(crate::reasoning::ReasoningClient::for_tests(
            "http://127.0.0.1:1".to_string(),
        )));

        let mut issue = test_issue(Reason::ImagePullBackOff);
        issue.image = "nginx:latst".to_string();

        let plan = planner.create_plan(&issue, &store).await;
        assert_eq!(plan.len(), 1);
        assert_eq!(
            plan.steps[0].action,
            Action::PatchImage {
                image: "nginx:latest".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_memory_path_skips_detectors() {
        let dir = TempDir::new().unwrap();
        let mut store = empty_store(&dir);
        let (planner, calls) = counting_planner();

        let mut issue = test_issue(Reason::ImagePullBackOff);
        issue.image = "nginx:latst".to_string();
        store
            .record(&successful_attempt(
                &issue,
                Action::PatchImage {
                    image: "nginx:latest".to_string(),
                },
            ))
            .unwrap();

        let plan = planner.create_plan(&issue, &store).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            plan.steps[0].action,
            Action::PatchImage {
                image: "nginx:latest".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_failed_only_pattern_does_not_short_circuit() {
        let dir = TempDir::new().unwrap();
        let mut store = empty_store(&dir);
        let (planner, calls) = counting_planner();

        let mut issue = test_issue(Reason::ImagePullBackOff);
        issue.image = "nginx:latst".to_string();
        store
            .record(&failed_attempt(
                &issue,
                Action::PatchImage {
                    image: "nginx:latest".to_string(),
                },
            ))
            .unwrap();

        let plan = planner.create_plan(&issue, &store).await;
        assert!(calls.load(Ordering::SeqCst) > 0);
        assert!(!plan.is_skip_only());
    }

    #[tokio::test]
    async fn test_learned_oom_limit_jumps_the_ladder() {
        // Scenario: one pod worked its way to 512Mi; a fresh pod with the
        // same fingerprint at 128Mi goes straight to 512Mi.
        let dir = TempDir::new().unwrap();
        let mut store = empty_store(&dir);
        let planner = Planner::new(None);

        let issue = test_issue(Reason::OomKilled);
        store
            .record(&failed_attempt(
                &issue,
                Action::PatchMemoryLimit {
                    limit: "256Mi".to_string(),
                },
            ))
            .unwrap();
        store
            .record(&successful_attempt(
                &issue,
                Action::PatchMemoryLimit {
                    limit: "512Mi".to_string(),
                },
            ))
            .unwrap();

        let mut fresh = test_issue(Reason::OomKilled);
        fresh.identity.pod = "web-7b9f8c6d5-zzz99".to_string();
        fresh.memory_limit = Some("128Mi".to_string());

        let plan = planner.create_plan(&fresh, &store).await;
        assert_eq!(
            plan.steps[0].action,
            Action::PatchMemoryLimit {
                limit: "512Mi".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_regressed_limit_resumes_ladder_above_it() {
        // The learned 512Mi limit is now the observed limit and the pod
        // OOM-killed again: escalate to 1Gi instead of replaying 512Mi.
        let dir = TempDir::new().unwrap();
        let mut store = empty_store(&dir);
        let planner = Planner::new(None);

        let issue = test_issue(Reason::OomKilled);
        store
            .record(&successful_attempt(
                &issue,
                Action::PatchMemoryLimit {
                    limit: "512Mi".to_string(),
                },
            ))
            .unwrap();

        let mut regressed = test_issue(Reason::OomKilled);
        regressed.memory_limit = Some("512Mi".to_string());

        let plan = planner.create_plan(&regressed, &store).await;
        assert_eq!(
            plan.steps[0].action,
            Action::PatchMemoryLimit {
                limit: "1Gi".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_probe_failure_without_reasoning_degrades_to_skip() {
        let dir = TempDir::new().unwrap();
        let store = empty_store(&dir);
        let planner = Planner::new(None);

        let issue = test_issue(Reason::ProbeFailure);
        let plan = planner.create_plan(&issue, &store).await;
        assert!(plan.is_skip_only());
        assert_eq!(plan.len(), 1);
    }

    #[tokio::test]
    async fn test_unresolvable_image_pull_degrades_to_skip() {
        let dir = TempDir::new().unwrap();
        let store = empty_store(&dir);
        let planner = Planner::new(None);

        let mut issue = test_issue(Reason::ImagePullBackOff);
        issue.image = "registry.internal/app:v3".to_string();

        let plan = planner.create_plan(&issue, &store).await;
        assert!(plan.is_skip_only());
    }
}
