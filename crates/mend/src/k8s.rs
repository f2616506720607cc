//! Cluster accessor: all reads and mutations against the orchestration API.
//!
//! Raw pods are converted into simplified [`PodRecord`]s so classification
//! and tests never touch API types. Mutating calls fail with
//! [`ClusterError`] and are never retried here; retry policy belongs to the
//! caller, which re-observes on the next iteration.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::api::{DeleteParams, ListParams, LogParams, Patch, PatchParams};
use kube::{Api, Client};
use serde_json::json;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

/// Running pods whose last restart is older than this are treated as
/// recovered and left alone.
const RESTART_WINDOW_MINUTES: i64 = 10;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster API request failed: {0}")]
    Api(#[from] kube::Error),

    #[error("invalid memory quantity: {0}")]
    InvalidQuantity(String),
}

/// Simplified view of one pod, reduced to the fields remediation needs.
#[derive(Debug, Clone, Default)]
pub struct PodRecord {
    pub name: String,
    /// Owning workload, derived from the controller owner reference.
    pub workload: String,
    /// Name of the first container. Only container 0 is inspected or mutated.
    pub container: String,
    /// Raw API phase string (`Pending`, `Running`, ...).
    pub phase: String,
    pub waiting_reason: Option<String>,
    /// Termination reason from the current or last container state.
    pub terminated_reason: Option<String>,
    pub message: Option<String>,
    pub restart_count: i32,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub ready: bool,
    pub image: String,
    pub memory_limit: Option<String>,
    pub env_keys: Vec<String>,
}

impl PodRecord {
    /// Reduce an API pod to a record. Pods without a name are dropped by the
    /// caller; everything else defaults to empty.
    fn from_pod(pod: &Pod) -> Option<Self> {
        let name = pod.metadata.name.clone()?;
        let workload = workload_name(pod, &name);

        let mut record = Self {
            name,
            workload,
            ready: true,
            ..Self::default()
        };

        if let Some(status) = &pod.status {
            record.phase = status.phase.clone().unwrap_or_default();
            if let Some(cs) = status
                .container_statuses
                .as_ref()
                .and_then(|list| list.first())
            {
                record.restart_count = cs.restart_count;
                record.ready = cs.ready;

                if let Some(state) = &cs.state {
                    if let Some(waiting) = &state.waiting {
                        record.waiting_reason = waiting.reason.clone();
                        record.message = waiting.message.clone();
                    }
                    if let Some(terminated) = &state.terminated {
                        record.terminated_reason = terminated.reason.clone();
                        record.message = terminated
                            .reason
                            .clone()
                            .map(|r| format!("exit {}: {r}", terminated.exit_code));
                        record.last_finished_at = terminated.finished_at.clone().map(|t| t.0);
                    }
                }
                // A waiting container's previous termination carries the
                // OOM verdict for crash loops.
                if record.terminated_reason.is_none() {
                    if let Some(terminated) =
                        cs.last_state.as_ref().and_then(|s| s.terminated.as_ref())
                    {
                        record.terminated_reason = terminated.reason.clone();
                        record.last_finished_at = terminated.finished_at.clone().map(|t| t.0);
                    }
                }
            }
        }

        if let Some(container) = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.containers.first())
        {
            record.container = container.name.clone();
            record.image = container.image.clone().unwrap_or_default();
            record.memory_limit = container
                .resources
                .as_ref()
                .and_then(|r| r.limits.as_ref())
                .and_then(|limits| limits.get("memory"))
                .map(|q| q.0.clone());
            record.env_keys = container
                .env
                .as_ref()
                .map(|env| env.iter().map(|e| e.name.clone()).collect())
                .unwrap_or_default();
        }

        Some(record)
    }
}

/// Whether a pod record counts as unhealthy: any non-Running phase, a
/// container stuck waiting, or a Running pod restarted within the recent
/// window (covers probe-failure restarts that leave the phase untouched).
pub fn is_unhealthy(record: &PodRecord, now: DateTime<Utc>) -> bool {
    if record.phase != "Running" {
        return record.phase != "Succeeded";
    }
    if !record.ready && record.waiting_reason.is_some() {
        return true;
    }
    if record.restart_count > 0 {
        let window = Duration::minutes(RESTART_WINDOW_MINUTES);
        return match record.last_finished_at {
            Some(finished) => now.signed_duration_since(finished) <= window,
            None => true,
        };
    }
    false
}

/// Derive the owning workload name. ReplicaSet owners drop their
/// pod-template hash; anything else is taken as-is. Pods with no owner fall
/// back to stripping the two generated suffixes of the pod name.
fn workload_name(pod: &Pod, pod_name: &str) -> String {
    if let Some(owners) = &pod.metadata.owner_references {
        let owner = owners
            .iter()
            .find(|o| o.controller.unwrap_or(false))
            .or_else(|| owners.first());
        if let Some(owner) = owner {
            return match owner.kind.as_str() {
                "ReplicaSet" => strip_last_segment(&owner.name).to_string(),
                _ => owner.name.clone(),
            };
        }
    }
    strip_last_segment(strip_last_segment(pod_name)).to_string()
}

fn strip_last_segment(name: &str) -> &str {
    name.rsplit_once('-').map_or(name, |(head, _)| head)
}

/// Parse a memory quantity (`Ki`/`Mi`/`Gi`) into mebibytes.
pub fn parse_mebibytes(quantity: &str) -> Option<u64> {
    let idx = quantity.find(|c: char| !c.is_ascii_digit())?;
    let (value, unit) = quantity.split_at(idx);
    let value: u64 = value.parse().ok()?;
    match unit {
        "Ki" => Some(value / 1024),
        "Mi" => Some(value),
        "Gi" => Some(value * 1024),
        _ => None,
    }
}

/// Render mebibytes back into the smallest clean unit.
pub fn format_mebibytes(mib: u64) -> String {
    if mib >= 1024 && mib % 1024 == 0 {
        format!("{}Gi", mib / 1024)
    } else {
        format!("{mib}Mi")
    }
}

/// Memory request that accompanies a new limit: 80% of the limit.
pub fn memory_request_for_limit(limit: &str) -> Option<String> {
    parse_mebibytes(limit).map(|mib| format_mebibytes(mib * 4 / 5))
}

/// Read/mutate operations the remediation loop needs from the cluster.
///
/// The production implementation is [`ClusterClient`]; tests substitute an
/// in-memory fake.
#[async_trait]
pub trait ClusterOps: Send + Sync {
    async fn namespace_exists(&self) -> Result<bool, ClusterError>;

    async fn known_namespaces(&self) -> Result<Vec<String>, ClusterError>;

    /// Unhealthy pods in the monitored namespace, sorted by name for
    /// deterministic processing order.
    async fn list_unhealthy_pods(&self) -> Result<Vec<PodRecord>, ClusterError>;

    async fn pod_logs(&self, pod: &str, tail: u32) -> Result<Vec<String>, ClusterError>;

    /// Merge environment variables into the workload's container spec.
    async fn patch_env(
        &self,
        workload: &str,
        container: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<(), ClusterError>;

    /// Set the container memory limit; the request follows at 80%.
    async fn patch_memory_limit(
        &self,
        workload: &str,
        container: &str,
        limit: &str,
    ) -> Result<(), ClusterError>;

    async fn patch_image(
        &self,
        workload: &str,
        container: &str,
        image: &str,
    ) -> Result<(), ClusterError>;

    async fn delete_pod(&self, pod: &str) -> Result<(), ClusterError>;
}

/// Kubernetes-backed accessor for one namespace.
pub struct ClusterClient {
    pods: Api<Pod>,
    deployments: Api<Deployment>,
    namespaces: Api<Namespace>,
    namespace: String,
}

impl ClusterClient {
    /// Connect using the ambient kubeconfig / in-cluster environment.
    pub async fn new(namespace: &str) -> Result<Self, ClusterError> {
        let client = Client::try_default().await?;
        Ok(Self {
            pods: Api::namespaced(client.clone(), namespace),
            deployments: Api::namespaced(client.clone(), namespace),
            namespaces: Api::all(client),
            namespace: namespace.to_string(),
        })
    }

    /// Strategic merge patch against the workload's pod template. The
    /// container list merges by name, so repeated patches are no-ops rather
    /// than duplicates.
    async fn patch_template(
        &self,
        workload: &str,
        container_patch: serde_json::Value,
    ) -> Result<(), ClusterError> {
        let patch = json!({
            "spec": {
                "template": {
                    "spec": {
                        "containers": [container_patch]
                    }
                }
            }
        });
        debug!(workload, %patch, "patching workload template");
        self.deployments
            .patch(workload, &PatchParams::default(), &Patch::Strategic(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ClusterOps for ClusterClient {
    async fn namespace_exists(&self) -> Result<bool, ClusterError> {
        match self.namespaces.get(&self.namespace).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn known_namespaces(&self) -> Result<Vec<String>, ClusterError> {
        let list = self.namespaces.list(&ListParams::default()).await?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|ns| ns.metadata.name)
            .collect())
    }

    async fn list_unhealthy_pods(&self) -> Result<Vec<PodRecord>, ClusterError> {
        let pods = self.pods.list(&ListParams::default()).await?;
        let now = Utc::now();
        let mut records: Vec<PodRecord> = pods
            .items
            .iter()
            .filter_map(PodRecord::from_pod)
            .filter(|record| is_unhealthy(record, now))
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    async fn pod_logs(&self, pod: &str, tail: u32) -> Result<Vec<String>, ClusterError> {
        let params = LogParams {
            tail_lines: Some(i64::from(tail)),
            ..LogParams::default()
        };
        let text = self.pods.logs(pod, &params).await?;
        Ok(text.lines().map(str::to_string).collect())
    }

    async fn patch_env(
        &self,
        workload: &str,
        container: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<(), ClusterError> {
        let entries: Vec<serde_json::Value> = env
            .iter()
            .map(|(name, value)| json!({"name": name, "value": value}))
            .collect();
        self.patch_template(workload, json!({"name": container, "env": entries}))
            .await
    }

    async fn patch_memory_limit(
        &self,
        workload: &str,
        container: &str,
        limit: &str,
    ) -> Result<(), ClusterError> {
        let request = memory_request_for_limit(limit)
            .ok_or_else(|| ClusterError::InvalidQuantity(limit.to_string()))?;
        self.patch_template(
            workload,
            json!({
                "name": container,
                "resources": {
                    "limits": {"memory": limit},
                    "requests": {"memory": request}
                }
            }),
        )
        .await
    }

    async fn patch_image(
        &self,
        workload: &str,
        container: &str,
        image: &str,
    ) -> Result<(), ClusterError> {
        self.patch_template(workload, json!({"name": container, "image": image}))
            .await
    }

    async fn delete_pod(&self, pod: &str) -> Result<(), ClusterError> {
        self.pods.delete(pod, &DeleteParams::default()).await?;
        Ok(())
    }
}
