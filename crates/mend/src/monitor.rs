//! The OBSERVE -> PLAN -> ACT -> LEARN control loop.
//!
//! One logical thread of control per monitored namespace: issues are
//! processed one at a time in pod-name order, and the between-iteration
//! sleep is cancellable so shutdown latency is bounded by a constant rather
//! than the full interval.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::executor::Executor;
use crate::issue::{Issue, Reason};
use crate::k8s::{ClusterOps, PodRecord};
use crate::memory::{MemoryStats, PatternStore};
use crate::plan::{Attempt, Plan};
use crate::planner::Planner;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub namespace: String,
    pub interval: Duration,
    /// When false, plans are computed and logged but never executed and
    /// never learned from.
    pub auto: bool,
    pub log_tail: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            interval: Duration::from_secs(30),
            auto: true,
            log_tail: 50,
        }
    }
}

/// Totals accumulated across iterations, reported at shutdown.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    pub iterations: u64,
    pub issues_seen: u64,
    pub attempts: u64,
    pub successes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopPhase {
    Observing,
    Planning,
    Acting,
    Learning,
    Sleeping,
    Stopped,
}

pub struct Monitor {
    config: MonitorConfig,
    cluster: Arc<dyn ClusterOps>,
    planner: Planner,
    executor: Executor,
    store: PatternStore,
    stats: SessionStats,
}

impl Monitor {
    pub fn new(
        config: MonitorConfig,
        cluster: Arc<dyn ClusterOps>,
        planner: Planner,
        store: PatternStore,
    ) -> Self {
        let executor = Executor::new(Arc::clone(&cluster));
        Self {
            config,
            cluster,
            planner,
            executor,
            store,
            stats: SessionStats::default(),
        }
    }

    /// Drive iterations until the shutdown token fires. The token also
    /// interrupts the sleep, not just the next iteration boundary.
    pub async fn run(mut self, shutdown: CancellationToken) -> (SessionStats, MemoryStats) {
        info!(
            namespace = %self.config.namespace,
            interval_secs = self.config.interval.as_secs(),
            auto = self.config.auto,
            "starting autonomous monitoring"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            self.set_phase(LoopPhase::Observing);
            self.stats.iterations += 1;
            info!(iteration = self.stats.iterations, "checking pod status");
            self.run_iteration().await;

            self.set_phase(LoopPhase::Sleeping);
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(self.config.interval) => {}
            }
        }

        self.set_phase(LoopPhase::Stopped);
        info!("monitoring stopped");
        (self.stats, self.store.statistics())
    }

    /// One full observe/plan/act/learn pass over the namespace.
    pub(crate) async fn run_iteration(&mut self) {
        let records = match self.cluster.list_unhealthy_pods().await {
            Ok(records) => records,
            Err(err) => {
                // Observation failures are never fatal to the loop.
                warn!("failed to list pods: {err}");
                return;
            }
        };

        if records.is_empty() {
            info!("no issues detected, all pods healthy");
            return;
        }

        info!(count = records.len(), "unhealthy pod(s) found");
        for record in records {
            self.handle_pod(&record).await;
        }
    }

    async fn handle_pod(&mut self, record: &PodRecord) {
        self.stats.issues_seen += 1;

        let mut issue = Issue::classify(record, &self.config.namespace);
        info!(
            pod = %issue.identity.pod,
            workload = %issue.identity.workload,
            phase = %issue.phase,
            reason = %issue.reason,
            "issue detected"
        );

        if issue.reason == Reason::Unknown {
            info!(pod = %issue.identity.pod, "unclassified issue, excluded from remediation");
            return;
        }

        if issue.reason.wants_logs() {
            match self
                .cluster
                .pod_logs(&issue.identity.pod, self.config.log_tail)
                .await
            {
                Ok(logs) => issue = issue.with_logs(logs),
                Err(err) => warn!(pod = %issue.identity.pod, "failed to fetch logs: {err}"),
            }
        }

        self.set_phase(LoopPhase::Planning);
        let plan = self.planner.create_plan(&issue, &self.store).await;
        log_plan(&plan);

        if !self.config.auto {
            info!("auto-remediation disabled, plan not executed");
            self.set_phase(LoopPhase::Observing);
            return;
        }

        self.set_phase(LoopPhase::Acting);
        let outcomes = self.executor.execute(&issue, &plan).await;

        self.set_phase(LoopPhase::Learning);
        let attempt = Attempt::new(issue, plan, outcomes);
        self.stats.attempts += 1;
        if attempt.succeeded() {
            self.stats.successes += 1;
        }
        if let Err(err) = self.store.record(&attempt) {
            warn!("failed to persist attempt: {err}");
        }
        self.set_phase(LoopPhase::Observing);
    }

    fn set_phase(&self, phase: LoopPhase) {
        debug!(?phase, "loop phase");
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &PatternStore {
        &self.store
    }

    #[cfg(test)]
    pub(crate) fn stats(&self) -> SessionStats {
        self.stats
    }
}

fn log_plan(plan: &Plan) {
    if plan.is_empty() {
        warn!("planner produced an empty plan");
        return;
    }
    info!(steps = plan.len(), "remediation plan");
    for (index, step) in plan.steps.iter().enumerate() {
        info!(
            step = index + 1,
            action = %step.action,
            target = %step.target,
            rationale = %step.rationale,
            "plan step"
        );
    }
}
