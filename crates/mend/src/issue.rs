//! Issue classification and fingerprinting.
//!
//! Converts raw pod records into normalized [`Issue`]s and derives the stable
//! fingerprint that joins live issues with learned remediation patterns.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::detectors::image_typo;
use crate::k8s::PodRecord;

/// Pod lifecycle phase as seen by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Pending,
    Waiting,
    Running,
    Terminated,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "Pending",
            Self::Waiting => "Waiting",
            Self::Running => "Running",
            Self::Terminated => "Terminated",
        };
        f.write_str(label)
    }
}

/// Normalized failure reason. `Unknown` issues are logged and excluded from
/// remediation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reason {
    CrashLoopBackOff,
    ImagePullBackOff,
    OomKilled,
    ProbeFailure,
    Unknown,
}

impl Reason {
    /// Only crash loops and OOM kills have log-consuming detectors.
    pub fn wants_logs(self) -> bool {
        matches!(self, Self::CrashLoopBackOff | Self::OomKilled)
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::CrashLoopBackOff => "CrashLoopBackOff",
            Self::ImagePullBackOff => "ImagePullBackOff",
            Self::OomKilled => "OOMKilled",
            Self::ProbeFailure => "ProbeFailure",
            Self::Unknown => "Unknown",
        };
        f.write_str(label)
    }
}

/// Identity of one unhealthy pod and the workload that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodIdentity {
    pub namespace: String,
    pub pod: String,
    pub workload: String,
}

/// One detected unhealthy workload instance.
///
/// Constructed fresh each iteration from live cluster state and never mutated
/// afterwards. Only the first container is inspected and mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub identity: PodIdentity,
    pub phase: Phase,
    pub reason: Reason,
    /// Name of the inspected container (the pod's first container).
    pub container: String,
    /// Raw status message from the container state, if any.
    pub message: String,
    /// Recent log lines, fetched only for log-consuming reasons.
    pub logs: Vec<String>,
    pub image: String,
    pub memory_limit: Option<String>,
    pub env_keys: Vec<String>,
}

impl Issue {
    /// Classify a raw pod record. Logs are attached separately once the
    /// reason is known to need them (see [`Reason::wants_logs`]).
    pub fn classify(record: &PodRecord, namespace: &str) -> Self {
        let (phase, reason) = infer(record);
        Self {
            identity: PodIdentity {
                namespace: namespace.to_string(),
                pod: record.name.clone(),
                workload: record.workload.clone(),
            },
            phase,
            reason,
            container: record.container.clone(),
            message: record.message.clone().unwrap_or_default(),
            logs: Vec::new(),
            image: record.image.clone(),
            memory_limit: record.memory_limit.clone(),
            env_keys: record.env_keys.clone(),
        }
    }

    pub fn with_logs(mut self, logs: Vec<String>) -> Self {
        self.logs = logs;
        self
    }

    /// Stable key identifying the recurring failure class.
    ///
    /// Two issues a human would call "the same recurring problem" must map to
    /// the same fingerprint; this is the sole join key into pattern memory.
    /// Keys include the detected signal (typo token, workload name) so
    /// unrelated workloads sharing a reason never share learned parameters.
    pub fn fingerprint(&self) -> String {
        match self.reason {
            Reason::ImagePullBackOff => match image_typo::find_typo_token(&self.image) {
                Some(token) => format!("image-pull/{token}"),
                None => format!("image-pull/{}", self.image),
            },
            Reason::OomKilled => format!("oom/{}", self.identity.workload),
            Reason::CrashLoopBackOff => format!("crash-loop/{}", self.identity.workload),
            Reason::ProbeFailure => format!("probe/{}", self.identity.workload),
            Reason::Unknown => format!("unknown/{}", self.identity.workload),
        }
    }
}

/// Reason inference, first match wins:
/// terminated-with-OOMKilled, image pull errors, crash/back-off waits,
/// running with recent restarts, then `Unknown`.
fn infer(record: &PodRecord) -> (Phase, Reason) {
    if record
        .terminated_reason
        .as_deref()
        .is_some_and(|r| r == "OOMKilled")
    {
        return (Phase::Terminated, Reason::OomKilled);
    }

    if let Some(waiting) = record.waiting_reason.as_deref() {
        if waiting.contains("ImagePull") || waiting.contains("ErrImage") {
            return (Phase::Waiting, Reason::ImagePullBackOff);
        }
        if waiting.contains("BackOff") || waiting.contains("Crash") {
            return (Phase::Waiting, Reason::CrashLoopBackOff);
        }
        return (Phase::Waiting, Reason::Unknown);
    }

    if record.terminated_reason.is_some() {
        return (Phase::Terminated, Reason::Unknown);
    }

    if record.phase == "Running" {
        if record.restart_count > 0 {
            return (Phase::Running, Reason::ProbeFailure);
        }
        return (Phase::Running, Reason::Unknown);
    }

    let phase = match record.phase.as_str() {
        "Failed" | "Succeeded" => Phase::Terminated,
        _ => Phase::Pending,
    };
    (phase, Reason::Unknown)
}

#[cfg(test)]
pub(crate) fn test_issue(reason: Reason) -> Issue {
    Issue {
        identity: PodIdentity {
            namespace: "demo".to_string(),
            pod: "web-7b9f8c6d5-abc12".to_string(),
            workload: "web".to_string(),
        },
        phase: match reason {
            Reason::OomKilled => Phase::Terminated,
            Reason::ProbeFailure => Phase::Running,
            _ => Phase::Waiting,
        },
        reason,
        container: "web".to_string(),
        message: String::new(),
        logs: Vec::new(),
        image: "nginx:latest".to_string(),
        memory_limit: Some("128Mi".to_string()),
        env_keys: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> PodRecord {
        PodRecord {
            name: "web-7b9f8c6d5-abc12".to_string(),
            workload: "web".to_string(),
            container: "web".to_string(),
            phase: "Running".to_string(),
            waiting_reason: None,
            terminated_reason: None,
            message: None,
            restart_count: 0,
            last_finished_at: None,
            ready: true,
            image: "nginx:latest".to_string(),
            memory_limit: None,
            env_keys: Vec::new(),
        }
    }

    #[test]
    fn test_oom_wins_over_waiting_reason() {
        // A crash-looping container that was last killed by the OOM killer
        // classifies as OOMKilled, not CrashLoopBackOff.
        let mut rec = record();
        rec.phase = "Running".to_string();
        rec.waiting_reason = Some("CrashLoopBackOff".to_string());
        rec.terminated_reason = Some("OOMKilled".to_string());
        rec.restart_count = 4;

        let issue = Issue::classify(&rec, "demo");
        assert_eq!(issue.reason, Reason::OomKilled);
        assert_eq!(issue.phase, Phase::Terminated);
    }

    #[test]
    fn test_image_pull_variants() {
        for waiting in ["ImagePullBackOff", "ErrImagePull"] {
            let mut rec = record();
            rec.phase = "Pending".to_string();
            rec.waiting_reason = Some(waiting.to_string());
            let issue = Issue::classify(&rec, "demo");
            assert_eq!(issue.reason, Reason::ImagePullBackOff, "{waiting}");
        }
    }

    #[test]
    fn test_crash_loop() {
        let mut rec = record();
        rec.waiting_reason = Some("CrashLoopBackOff".to_string());
        rec.terminated_reason = Some("Error".to_string());
        let issue = Issue::classify(&rec, "demo");
        assert_eq!(issue.reason, Reason::CrashLoopBackOff);
        assert_eq!(issue.phase, Phase::Waiting);
    }

    #[test]
    fn test_running_with_restarts_is_probe_failure() {
        let mut rec = record();
        rec.restart_count = 2;
        let issue = Issue::classify(&rec, "demo");
        assert_eq!(issue.reason, Reason::ProbeFailure);
        assert_eq!(issue.phase, Phase::Running);
    }

    #[test]
    fn test_unclassifiable_is_unknown() {
        let mut rec = record();
        rec.phase = "Pending".to_string();
        let issue = Issue::classify(&rec, "demo");
        assert_eq!(issue.reason, Reason::Unknown);
    }

    #[test]
    fn test_fingerprint_uses_typo_token() {
        let mut issue = test_issue(Reason::ImagePullBackOff);
        issue.image = "nginx:latst".to_string();
        assert_eq!(issue.fingerprint(), "image-pull/latst");
    }

    #[test]
    fn test_fingerprint_falls_back_to_image_ref() {
        let mut issue = test_issue(Reason::ImagePullBackOff);
        issue.image = "internal/does-not-exist:9.9".to_string();
        assert_eq!(issue.fingerprint(), "image-pull/internal/does-not-exist:9.9");
    }

    #[test]
    fn test_fingerprint_scopes_by_workload() {
        let issue = test_issue(Reason::OomKilled);
        assert_eq!(issue.fingerprint(), "oom/web");

        let crash = test_issue(Reason::CrashLoopBackOff);
        assert_eq!(crash.fingerprint(), "crash-loop/web");
    }

    #[test]
    fn test_only_oom_and_crash_want_logs() {
        assert!(Reason::OomKilled.wants_logs());
        assert!(Reason::CrashLoopBackOff.wants_logs());
        assert!(!Reason::ImagePullBackOff.wants_logs());
        assert!(!Reason::ProbeFailure.wants_logs());
    }
}
