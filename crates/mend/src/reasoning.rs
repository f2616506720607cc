//! External reasoning fallback for issues no rule-based detector covers.
//!
//! Wraps the Anthropic Messages API behind the same issue-to-plan shape as
//! the detectors, so the planner treats it as the lowest-priority detector.
//! Responses are untrusted: anything malformed, empty, or outside the fixed
//! action catalog degrades to "no proposal" and the planner falls back to a
//! skip step.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::issue::Issue;
use crate::plan::{Action, Plan, Step};

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const MODEL: &str = "claude-3-5-haiku-20241022";
const REQUEST_TIMEOUT_SECS: u64 = 30;
const MAX_TOKENS: u32 = 1024;

const SYSTEM_PROMPT: &str = "You are a Kubernetes SRE proposing remediation steps for an \
unhealthy pod. Respond with a JSON array of steps and nothing else. Each step is an object \
with an \"action\" field set to one of: update_env (with an \"env\" object of name/value \
pairs), patch_memory_limit (with \"limit\", e.g. \"512Mi\"), patch_image (with \"image\"), \
restart_pod. Include a short \"reasoning\" field per step. If no safe automated action \
exists, respond with the word CANNOT_DETERMINE.";

/// Request body for the messages endpoint.
#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    system: String,
    messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: String,
}

/// One proposed step as it arrives off the wire.
#[derive(Debug, Deserialize)]
struct RawStep {
    action: String,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    limit: Option<String>,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    reasoning: String,
}

/// Client for the reasoning collaborator. Unconfigured (no API key) means
/// every proposal is absent, which the planner degrades to a skip step.
pub struct ReasoningClient {
    client: Client,
    api_key: Option<String>,
    base_url: String,
}

impl ReasoningClient {
    pub fn from_env() -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
            api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            base_url: API_URL.to_string(),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(base_url: String) -> Self {
        Self {
            client: Client::new(),
            api_key: Some("test-key".to_string()),
            base_url,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    /// Ask the collaborator for a plan. Absent on any failure: unreachable
    /// service, API error, or an unusable response.
    pub async fn propose(&self, issue: &Issue) -> Option<Plan> {
        let Some(api_key) = self.api_key.as_ref() else {
            debug!("reasoning collaborator not configured (ANTHROPIC_API_KEY unset)");
            return None;
        };

        let request = MessagesRequest {
            model: MODEL.to_string(),
            max_tokens: MAX_TOKENS,
            system: SYSTEM_PROMPT.to_string(),
            messages: vec![Message {
                role: "user".to_string(),
                content: describe_issue(issue),
            }],
        };

        let response = match self
            .client
            .post(&self.base_url)
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!("reasoning request failed: {err}");
                return None;
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!("reasoning request rejected: {status} - {body}");
            return None;
        }

        let parsed: MessagesResponse = match response.json().await {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!("reasoning response unreadable: {err}");
                return None;
            }
        };

        let text: String = parsed
            .content
            .iter()
            .filter(|block| block.block_type == "text")
            .map(|block| block.text.as_str())
            .collect();

        plan_from_text(&text, issue)
    }
}

/// Issue snapshot sent to the collaborator: identity, state, and recent logs.
fn describe_issue(issue: &Issue) -> String {
    let snapshot = json!({
        "pod": issue.identity.pod,
        "namespace": issue.identity.namespace,
        "workload": issue.identity.workload,
        "phase": issue.phase.to_string(),
        "reason": issue.reason.to_string(),
        "message": issue.message,
        "image": issue.image,
        "memory_limit": issue.memory_limit,
        "env_keys": issue.env_keys,
    });
    format!(
        "Issue:\n{snapshot}\n\nRecent logs:\n{}",
        issue.logs.join("\n")
    )
}

/// Parse the collaborator's text into a plan. Markdown fences are stripped,
/// the JSON is validated step by step, and steps outside the action catalog
/// are dropped. `None` when nothing usable survives.
pub fn plan_from_text(text: &str, issue: &Issue) -> Option<Plan> {
    let text = text.trim();
    if text.is_empty() || text.contains("CANNOT_DETERMINE") {
        return None;
    }

    let json_text = strip_fences(text);
    let raw_steps: Vec<RawStep> = match serde_json::from_str(json_text) {
        Ok(steps) => steps,
        Err(err) => {
            warn!("reasoning plan is not valid JSON: {err}");
            return None;
        }
    };

    let steps: Vec<Step> = raw_steps.into_iter().filter_map(|raw| {
        let action = match raw.action.as_str() {
            "update_env" => {
                if raw.env.is_empty() {
                    return None;
                }
                Action::UpdateEnv { env: raw.env }
            }
            "patch_memory_limit" => Action::PatchMemoryLimit { limit: raw.limit? },
            "patch_image" => Action::PatchImage { image: raw.image? },
            "restart_pod" => Action::RestartPod,
            other => {
                warn!(action = other, "dropping reasoning step outside the action catalog");
                return None;
            }
        };
        let rationale = if raw.reasoning.is_empty() {
            "proposed by reasoning collaborator".to_string()
        } else {
            raw.reasoning
        };
        Some(Step::for_issue(action, issue, rationale))
    })
    .collect();

    if steps.is_empty() {
        None
    } else {
        Some(Plan::new(steps))
    }
}

/// Collaborators sometimes wrap JSON in markdown code fences.
fn strip_fences(text: &str) -> &str {
    let text = text.trim();
    text.strip_prefix("```json")
        .or_else(|| text.strip_prefix("```"))
        .and_then(|inner| inner.strip_suffix("```"))
        .map_or(text, str::trim)
}
