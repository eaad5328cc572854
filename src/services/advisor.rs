use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonschema::JSONSchema;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ScheduleError, ScheduleResult};
use crate::models::config::{AdvisorConfig, SchedulerConfig};
use crate::models::outcome::{AdvisorDecision, ConflictSummary};
use crate::models::plan::Slot;
use crate::services::busy::{is_slot_free, BusyInterval};
use crate::services::time_utils;

/// Structured context handed to the advisor when no automatic commit was
/// possible.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdvisorContext {
    pub capture_id: String,
    pub content: String,
    pub duration_minutes: i64,
    pub priority: f64,
    pub preferred: Slot,
    pub conflicts: Vec<ConflictSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<Slot>,
    pub timezone: String,
    /// Leading busy intervals around the preferred slot, for grounding.
    pub busy_summary: Vec<Slot>,
}

#[async_trait]
pub trait ConflictAdvisor: Send + Sync {
    async fn advise(&self, context: &AdvisorContext) -> ScheduleResult<AdvisorDecision>;
}

static RESPONSE_SCHEMA: Lazy<JSONSchema> = Lazy::new(|| {
    let schema = json!({
        "type": "object",
        "required": ["action", "message"],
        "properties": {
            "action": {"enum": ["suggest_slot", "ask_overlap", "defer"]},
            "message": {"type": "string", "minLength": 1},
            "slot": {
                "type": "object",
                "required": ["start", "end"],
                "properties": {
                    "start": {"type": "string"},
                    "end": {"type": "string"}
                }
            }
        }
    });
    JSONSchema::compile(&schema).expect("advisor response schema compiles")
});

/// HTTP advisor client. One POST per decision; the reply must satisfy the
/// response contract before it is trusted. Failures surface as upstream
/// errors and are suppressed by the orchestrator.
pub struct HttpConflictAdvisor {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpConflictAdvisor {
    pub fn try_new(config: &AdvisorConfig) -> ScheduleResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(config.timeout_secs))
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Some(StdDuration::from_secs(90)))
            .build()
            .map_err(|err| {
                ScheduleError::internal(format!("failed to build advisor HTTP client: {err}"))
            })?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl ConflictAdvisor for HttpConflictAdvisor {
    async fn advise(&self, context: &AdvisorContext) -> ScheduleResult<AdvisorDecision> {
        let correlation_id = Uuid::new_v4().to_string();
        debug!(
            target: "engine::advisor",
            correlation_id = %correlation_id,
            capture = %context.capture_id,
            conflicts = context.conflicts.len(),
            "invoking conflict advisor"
        );

        let mut request = self.client.post(&self.endpoint).json(context);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                ScheduleError::upstream(502, format!("advisor timeout ({correlation_id})"))
            } else {
                ScheduleError::upstream(
                    502,
                    format!("advisor request failed ({correlation_id}): {err}"),
                )
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ScheduleError::upstream(
                502,
                format!("advisor returned {status} ({correlation_id})"),
            ));
        }

        let body: JsonValue = response.json().await.map_err(|err| {
            ScheduleError::upstream(
                502,
                format!("advisor response was not JSON ({correlation_id}): {err}"),
            )
        })?;

        if let Err(violations) = RESPONSE_SCHEMA.validate(&body) {
            let reasons: Vec<String> = violations.map(|v| v.to_string()).collect();
            warn!(
                target: "engine::advisor",
                correlation_id = %correlation_id,
                reasons = ?reasons,
                "advisor response violates the output contract"
            );
            return Err(ScheduleError::upstream(
                502,
                format!("advisor response violates contract ({correlation_id})"),
            ));
        }

        let decision: AdvisorDecision = serde_json::from_value(body)?;
        debug!(
            target: "engine::advisor",
            correlation_id = %correlation_id,
            action = ?decision.action,
            "advisor decision received"
        );
        Ok(decision)
    }
}

/// Drop an advisor-proposed slot that the engine cannot honor: outside the
/// working window or colliding with known busy intervals. The message is
/// kept either way.
pub fn sanitize_advisor_slot(
    mut decision: AdvisorDecision,
    busy: &[BusyInterval],
    reference_now: DateTime<Utc>,
    offset_minutes: i32,
    config: &SchedulerConfig,
) -> AdvisorDecision {
    if let Some(slot) = decision.slot {
        let valid = slot.end > slot.start
            && slot.start >= reference_now
            && !time_utils::is_before_working_start(slot.start, offset_minutes, config)
            && !time_utils::is_after_working_end(slot.end, offset_minutes, config)
            && is_slot_free(slot.start, slot.end, busy);
        if !valid {
            warn!(
                target: "engine::advisor",
                start = %slot.start,
                end = %slot.end,
                "discarding unusable advisor slot"
            );
            decision.slot = None;
        }
    }
    decision
}
