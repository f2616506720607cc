//! Rule-based remediation detectors.
//!
//! Each detector inspects an [`Issue`] (plus logs already attached to it)
//! and proposes a candidate [`Plan`] without any external reasoning. They
//! run in a fixed priority order and the first non-empty result wins:
//! image typo correction, missing environment variables, then OOM
//! escalation.

pub mod image_typo;
pub mod missing_env;
pub mod oom;

use crate::issue::Issue;
use crate::plan::Plan;

/// Context the planner supplies alongside an issue. Detectors themselves
/// stay stateless; anything history-shaped comes in through here.
#[derive(Debug, Clone, Default)]
pub struct DetectorContext {
    /// Memory limits already attempted for this issue's fingerprint.
    pub attempted_limits: Vec<String>,
}

/// Contract shared by every detector: propose a plan or stand aside.
pub trait Detect: Send + Sync {
    fn name(&self) -> &'static str;

    fn detect(&self, issue: &Issue, ctx: &DetectorContext) -> Option<Plan>;
}

/// All detectors in priority order.
pub struct DetectorSet {
    detectors: Vec<Box<dyn Detect>>,
}

impl DetectorSet {
    pub fn new() -> Self {
        Self {
            detectors: vec![
                Box::new(image_typo::ImageTypo),
                Box::new(missing_env::MissingEnv::new()),
                Box::new(oom::OomEscalation),
            ],
        }
    }

    #[cfg(test)]
    pub(crate) fn with_detectors(detectors: Vec<Box<dyn Detect>>) -> Self {
        Self { detectors }
    }

    /// Run detectors in order; the first proposal wins.
    pub fn first_match(&self, issue: &Issue, ctx: &DetectorContext) -> Option<Plan> {
        self.detectors.iter().find_map(|detector| {
            let plan = detector.detect(issue, ctx);
            if let Some(plan) = &plan {
                tracing::debug!(
                    detector = detector.name(),
                    steps = plan.len(),
                    "detector proposed a plan"
                );
            }
            plan
        })
    }
}

impl Default for DetectorSet {
    fn default() -> Self {
        Self::new()
    }
}
