//! Plan execution against the cluster.
//!
//! Steps run strictly in order; the first failure aborts the rest of the
//! plan for this iteration, and the next iteration re-observes and re-plans
//! from current state. Every mutation is idempotent at the cluster level
//! (merge patches, keyed container lists), so repeating a partially applied
//! plan is safe.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use crate::issue::Issue;
use crate::k8s::{ClusterError, ClusterOps};
use crate::plan::{Action, Plan, Step, StepOutcome};

pub struct Executor {
    cluster: Arc<dyn ClusterOps>,
}

impl Executor {
    pub fn new(cluster: Arc<dyn ClusterOps>) -> Self {
        Self { cluster }
    }

    /// Apply a plan step by step, recording one timestamped outcome per
    /// executed step, success or failure.
    pub async fn execute(&self, issue: &Issue, plan: &Plan) -> Vec<StepOutcome> {
        let mut outcomes = Vec::with_capacity(plan.len());
        for (index, step) in plan.steps.iter().enumerate() {
            info!(
                step = index + 1,
                total = plan.len(),
                action = %step.action,
                target = %step.target,
                "executing step"
            );
            let (success, detail) = match self.apply(issue, step).await {
                Ok(detail) => (true, detail),
                Err(err) => {
                    warn!(
                        action = %step.action,
                        target = %step.target,
                        "step failed: {err}"
                    );
                    (false, err.to_string())
                }
            };
            outcomes.push(StepOutcome {
                step: step.clone(),
                success,
                detail,
                at: Utc::now(),
            });
            if !success {
                break;
            }
        }
        outcomes
    }

    async fn apply(&self, issue: &Issue, step: &Step) -> Result<String, ClusterError> {
        let target = step.target.name();
        match &step.action {
            Action::UpdateEnv { env } => {
                self.cluster
                    .patch_env(target, &issue.container, env)
                    .await?;
                Ok(format!(
                    "merged {} environment variable(s) into {target}",
                    env.len()
                ))
            }
            Action::PatchMemoryLimit { limit } => {
                self.cluster
                    .patch_memory_limit(target, &issue.container, limit)
                    .await?;
                Ok(format!("memory limit of {target} set to {limit}"))
            }
            Action::PatchImage { image } => {
                self.cluster
                    .patch_image(target, &issue.container, image)
                    .await?;
                Ok(format!("image of {target} set to {image}"))
            }
            Action::RestartPod => {
                self.cluster.delete_pod(target).await?;
                Ok(format!("pod {target} deleted for restart"))
            }
            Action::Skip => Ok("no automated action; flagged for manual attention".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::{test_issue, Reason};
    use crate::k8s::fake::FakeCluster;
    use std::collections::BTreeMap;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_executes_steps_in_order() {
        let cluster = Arc::new(FakeCluster::default());
        let executor = Executor::new(Arc::clone(&cluster) as Arc<dyn ClusterOps>);
        let issue = test_issue(Reason::CrashLoopBackOff);

        let plan = Plan::new(vec![
            Step::for_issue(
                Action::UpdateEnv {
                    env: env(&[("MYSQL_HOST", "localhost")]),
                },
                &issue,
                "env",
            ),
            Step::for_issue(Action::RestartPod, &issue, "bounce"),
        ]);

        let outcomes = executor.execute(&issue, &plan).await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.success));

        let state = cluster.state.lock().unwrap();
        assert_eq!(state.calls, vec!["update_env", "restart_pod"]);
        assert_eq!(state.deleted_pods, vec![issue.identity.pod.clone()]);
    }

    #[tokio::test]
    async fn test_failure_aborts_remaining_steps() {
        let cluster = Arc::new(FakeCluster::default());
        cluster.state.lock().unwrap().fail_on.push("update_env");
        let executor = Executor::new(Arc::clone(&cluster) as Arc<dyn ClusterOps>);
        let issue = test_issue(Reason::CrashLoopBackOff);

        let plan = Plan::new(vec![
            Step::for_issue(
                Action::UpdateEnv {
                    env: env(&[("MYSQL_HOST", "localhost")]),
                },
                &issue,
                "env",
            ),
            Step::for_issue(Action::RestartPod, &issue, "bounce"),
        ]);

        let outcomes = executor.execute(&issue, &plan).await;
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].success);
        assert!(cluster.state.lock().unwrap().deleted_pods.is_empty());
    }

    #[tokio::test]
    async fn test_reapplying_a_plan_is_idempotent() {
        let cluster = Arc::new(FakeCluster::default());
        let executor = Executor::new(Arc::clone(&cluster) as Arc<dyn ClusterOps>);
        let issue = test_issue(Reason::CrashLoopBackOff);

        let plan = Plan::single(Step::for_issue(
            Action::UpdateEnv {
                env: env(&[("MYSQL_HOST", "localhost")]),
            },
            &issue,
            "env",
        ));

        executor.execute(&issue, &plan).await;
        let first = cluster
            .state
            .lock()
            .unwrap()
            .workloads
            .get("web")
            .cloned()
            .unwrap();

        executor.execute(&issue, &plan).await;
        let second = cluster
            .state
            .lock()
            .unwrap()
            .workloads
            .get("web")
            .cloned()
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(second.env.len(), 1);
    }

    #[tokio::test]
    async fn test_skip_step_touches_nothing() {
        let cluster = Arc::new(FakeCluster::default());
        let executor = Executor::new(Arc::clone(&cluster) as Arc<dyn ClusterOps>);
        let issue = test_issue(Reason::ProbeFailure);

        let plan = Plan::skip(&issue, "manual intervention required");
        let outcomes = executor.execute(&issue, &plan).await;

        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].success);
        let state = cluster.state.lock().unwrap();
        assert!(state.calls.is_empty());
        assert!(state.workloads.is_empty());
    }

    #[tokio::test]
    async fn test_memory_patch_sets_request_too() {
        let cluster = Arc::new(FakeCluster::default());
        let executor = Executor::new(Arc::clone(&cluster) as Arc<dyn ClusterOps>);
        let issue = test_issue(Reason::OomKilled);

        let plan = Plan::single(Step::for_issue(
            Action::PatchMemoryLimit {
                limit: "512Mi".to_string(),
            },
            &issue,
            "escalate",
        ));
        executor.execute(&issue, &plan).await;

        let state = cluster.state.lock().unwrap();
        let workload = state.workloads.get("web").unwrap();
        assert_eq!(workload.memory_limit.as_deref(), Some("512Mi"));
        assert_eq!(workload.memory_request.as_deref(), Some("409Mi"));
    }
}
