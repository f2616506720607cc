//! Durable pattern memory.
//!
//! One JSON file holds an append-only attempt log plus a per-fingerprint
//! pattern table with the best known fix. The file is rewritten on every
//! recorded attempt, so a crash loses at most the in-flight one, and it
//! stays human-inspectable: deleting it externally forces a full relearn.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::plan::{Action, Attempt};

/// Aggregated learning for one fingerprint.
///
/// `successful_parameters` is overwritten only by a successful attempt and
/// never cleared on failure: learning is monotonic, a later unrelated
/// failure cannot erase a confirmed fix.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pattern {
    pub successful_parameters: Option<Action>,
    pub success_count: u32,
    pub total_count: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MemoryFile {
    attempts: Vec<Attempt>,
    patterns: HashMap<String, Pattern>,
}

/// Summary of what the store currently knows.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryStats {
    pub total_attempts: usize,
    pub successful_attempts: usize,
    pub patterns_learned: usize,
}

/// File-backed pattern store. Single writer by construction: the loop owns
/// it and hands out shared references only while planning.
pub struct PatternStore {
    path: PathBuf,
    data: MemoryFile,
}

impl PatternStore {
    /// Load the store from `path`. A missing file starts empty; a corrupt
    /// file is logged and also starts empty rather than aborting startup.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(data) => data,
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        "pattern memory is corrupt ({err}); starting with empty memory"
                    );
                    MemoryFile::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => MemoryFile::default(),
            Err(err) => {
                warn!(
                    path = %path.display(),
                    "could not read pattern memory ({err}); starting with empty memory"
                );
                MemoryFile::default()
            }
        };
        debug!(
            path = %path.display(),
            attempts = data.attempts.len(),
            patterns = data.patterns.len(),
            "pattern memory loaded"
        );
        Self { path, data }
    }

    pub fn lookup(&self, fingerprint: &str) -> Option<&Pattern> {
        self.data.patterns.get(fingerprint)
    }

    /// Record one completed attempt: append it to the log and fold it into
    /// the fingerprint's pattern as a single logical update, then persist.
    pub fn record(&mut self, attempt: &Attempt) -> Result<()> {
        let pattern = self
            .data
            .patterns
            .entry(attempt.fingerprint.clone())
            .or_default();
        pattern.total_count += 1;
        if attempt.succeeded() {
            pattern.success_count += 1;
            pattern.successful_parameters = attempt.learned_action().cloned();
            info!(
                fingerprint = %attempt.fingerprint,
                action = %attempt.learned_action().map(ToString::to_string).unwrap_or_default(),
                "learned successful remediation"
            );
        }
        self.data.attempts.push(attempt.clone());
        self.persist()
    }

    /// Clear all learned patterns and attempts (`--fresh`).
    pub fn reset(&mut self) -> Result<()> {
        self.data = MemoryFile::default();
        self.persist()
    }

    /// Memory limits proposed so far for a fingerprint, successful or not.
    /// Feeds the OOM ladder so escalation never repeats a rung.
    pub fn attempted_limits(&self, fingerprint: &str) -> Vec<String> {
        self.data
            .attempts
            .iter()
            .filter(|attempt| attempt.fingerprint == fingerprint)
            .flat_map(|attempt| &attempt.plan.steps)
            .filter_map(|step| match &step.action {
                Action::PatchMemoryLimit { limit } => Some(limit.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn statistics(&self) -> MemoryStats {
        MemoryStats {
            total_attempts: self.data.attempts.len(),
            successful_attempts: self
                .data
                .attempts
                .iter()
                .filter(|a| a.succeeded())
                .count(),
            patterns_learned: self
                .data
                .patterns
                .values()
                .filter(|p| p.success_count > 0)
                .count(),
        }
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create memory directory {}", parent.display())
                })?;
            }
        }
        let content = serde_json::to_string_pretty(&self.data)?;
        fs::write(&self.path, content)
            .with_context(|| format!("failed to write pattern memory {}", self.path.display()))
    }
}
